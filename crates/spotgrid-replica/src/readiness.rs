//! Replica readiness: probe results, consecutive-success tracking and
//! the HTTP probe used in production.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use spotgrid_core::config::ReplicaConfig;
use spotgrid_state::ReplicaLink;

use crate::backend::ReplicaProbe;

/// Outcome of one probe against a standby.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// 2xx from the health path.
    Healthy,
    /// The standby answered, but not with 2xx.
    Unhealthy,
    /// No answer: refused, reset or timed out.
    Failed,
}

/// Longest wait between probes of a struggling standby.
const PROBE_BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Counts a standby's healthy streak and paces the next probe.
#[derive(Debug)]
pub struct ReadinessTracker {
    threshold: u32,
    streak: u32,
    misses: u32,
    interval: Duration,
    wait: Duration,
}

impl ReadinessTracker {
    pub fn new(config: &ReplicaConfig) -> Self {
        Self::with_threshold(config.healthy_threshold, config.probe_interval())
    }

    pub fn with_threshold(threshold: u32, interval: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            streak: 0,
            misses: 0,
            interval,
            wait: interval,
        }
    }

    /// Fold in one probe. Returns true once the streak reaches the threshold.
    pub fn record(&mut self, result: ProbeResult) -> bool {
        if result == ProbeResult::Healthy {
            self.streak += 1;
            self.misses = 0;
            self.wait = self.interval;
        } else {
            self.streak = 0;
            self.misses += 1;
            self.wait = self.wait.saturating_mul(2).min(PROBE_BACKOFF_CAP);
        }
        self.is_ready()
    }

    pub fn is_ready(&self) -> bool {
        self.streak >= self.threshold
    }

    /// Probes missed since the last healthy one.
    pub fn misses(&self) -> u32 {
        self.misses
    }

    pub fn next_interval(&self) -> Duration {
        self.wait
    }
}

/// GET `path` on `address` within `timeout`.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ProbeResult {
    match tokio::time::timeout(timeout, fetch_status(address, path)).await {
        Ok(Ok(status)) if status.is_success() => ProbeResult::Healthy,
        Ok(Ok(status)) => {
            debug!(%status, address, path, "replica answered non-2xx");
            ProbeResult::Unhealthy
        }
        Ok(Err(reason)) => {
            debug!(%reason, address, path, "replica probe failed");
            ProbeResult::Failed
        }
        Err(_) => {
            debug!(address, path, "replica probe timed out");
            ProbeResult::Failed
        }
    }
}

/// One GET over a fresh HTTP/1 connection; only the status is kept.
async fn fetch_status(address: &str, path: &str) -> Result<http::StatusCode, String> {
    let stream = tokio::net::TcpStream::connect(address)
        .await
        .map_err(|e| format!("connect: {e}"))?;
    let (mut sender, conn) =
        hyper::client::conn::http1::handshake(hyper_util::rt::TokioIo::new(stream))
            .await
            .map_err(|e| format!("handshake: {e}"))?;
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let request = http::Request::get(format!("http://{address}{path}"))
        .header(http::header::HOST, address)
        .header(http::header::USER_AGENT, "spotgrid-replica/0.1")
        .body(http_body_util::Empty::<bytes::Bytes>::new())
        .map_err(|e| format!("request: {e}"))?;

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| format!("send: {e}"))?;
    Ok(response.status())
}

/// Probes `link.endpoint` on the same path the primary is checked on.
#[derive(Debug, Clone)]
pub struct HttpReplicaProbe {
    path: String,
    timeout: Duration,
}

impl HttpReplicaProbe {
    pub fn new(config: &ReplicaConfig) -> Self {
        Self {
            path: config.health_path.clone(),
            timeout: config.probe_timeout(),
        }
    }
}

#[async_trait]
impl ReplicaProbe for HttpReplicaProbe {
    async fn probe(&self, link: &ReplicaLink) -> ProbeResult {
        match &link.endpoint {
            Some(address) => http_probe(address, &self.path, self.timeout).await,
            None => {
                debug!(link = %link.id, "replica has no endpoint yet");
                ProbeResult::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::get;

    use super::*;

    #[test]
    fn standby_needs_a_full_streak() {
        let mut tracker = ReadinessTracker::with_threshold(3, Duration::from_millis(100));
        assert!(!tracker.record(ProbeResult::Healthy));
        assert!(!tracker.record(ProbeResult::Healthy));
        assert!(!tracker.record(ProbeResult::Unhealthy));
        assert!(!tracker.record(ProbeResult::Healthy));
        assert!(!tracker.record(ProbeResult::Healthy));
        assert!(tracker.record(ProbeResult::Healthy));
    }

    #[test]
    fn zero_threshold_means_one_probe() {
        let mut tracker = ReadinessTracker::with_threshold(0, Duration::from_millis(100));
        assert!(!tracker.is_ready());
        assert!(tracker.record(ProbeResult::Healthy));
    }

    #[test]
    fn misses_stretch_the_wait() {
        let mut tracker = ReadinessTracker::with_threshold(1, Duration::from_millis(500));
        tracker.record(ProbeResult::Failed);
        tracker.record(ProbeResult::Unhealthy);
        assert_eq!(tracker.misses(), 2);
        assert_eq!(tracker.next_interval(), Duration::from_secs(2));

        tracker.record(ProbeResult::Healthy);
        assert_eq!(tracker.misses(), 0);
        assert_eq!(tracker.next_interval(), Duration::from_millis(500));

        for _ in 0..16 {
            tracker.record(ProbeResult::Failed);
        }
        assert_eq!(tracker.next_interval(), PROBE_BACKOFF_CAP);
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr.to_string()
    }

    #[tokio::test]
    async fn http_probe_reports_status() {
        let app = Router::new()
            .route("/healthz", get(|| async { "ok" }))
            .route("/sick", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }));
        let addr = serve(app).await;

        let timeout = Duration::from_secs(2);
        assert_eq!(http_probe(&addr, "/healthz", timeout).await, ProbeResult::Healthy);
        assert_eq!(http_probe(&addr, "/sick", timeout).await, ProbeResult::Unhealthy);
    }

    #[tokio::test]
    async fn http_probe_fails_on_closed_port() {
        let result = http_probe("127.0.0.1:1", "/healthz", Duration::from_secs(1)).await;
        assert_eq!(result, ProbeResult::Failed);
    }
}
