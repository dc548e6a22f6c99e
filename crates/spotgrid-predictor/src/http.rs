//! Remote predictor over HTTP.
//!
//! `POST {endpoint}` with the JSON [`Features`]; expects a JSON
//! [`PredictorScore`] back. The engine wraps every call in its own
//! timeout, so the client here only bounds connection setup.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{PredictorError, PredictorResult};
use crate::predictor::{Features, Predictor, PredictorScore};

pub struct HttpPredictor {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpPredictor {
    pub fn new(endpoint: &str) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .user_agent("spotgrid-engine/0.1")
            .build()
            .unwrap_or_default();
        Self {
            endpoint: endpoint.to_string(),
            client,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Predictor for HttpPredictor {
    async fn score(&self, features: &Features) -> PredictorResult<PredictorScore> {
        let response = self.client.post(&self.endpoint).json(features).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(PredictorError::Status(status.as_u16()));
        }

        let score: PredictorScore = response
            .json()
            .await
            .map_err(|e| PredictorError::InvalidResponse(e.to_string()))?;
        score.validate()?;

        debug!(
            instance = %features.instance_id,
            risk = score.risk_score,
            confidence = score.confidence,
            "predictor scored"
        );
        Ok(score)
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use axum::routing::post;
    use axum::{Json, Router};
    use axum::http::StatusCode;

    use spotgrid_core::{Lifecycle, PoolKey};

    use super::*;

    fn features(utilization: f64) -> Features {
        Features {
            instance_id: "i-1".to_string(),
            pool: PoolKey::new("us-east-1", "us-east-1a", "m5"),
            lifecycle: Lifecycle::Spot,
            utilization,
            current_price: 0.04,
            interruption_count: 2,
            pool_poisoned: false,
            notice_count: 0,
        }
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/score")
    }

    #[tokio::test]
    async fn scores_from_remote_service() {
        let app = Router::new().route(
            "/score",
            post(|Json(f): Json<Features>| async move {
                Json(PredictorScore {
                    risk_score: f.utilization,
                    price_trend: -0.02,
                    confidence: 0.95,
                    recommended_pool: Some(PoolKey::new("us-east-1", "us-east-1b", "m5")),
                })
            }),
        );
        let predictor = HttpPredictor::new(&serve(app).await);

        let score = predictor.score(&features(0.42)).await.unwrap();
        assert_eq!(score.risk_score, 0.42);
        assert_eq!(score.confidence, 0.95);
        assert_eq!(
            score.recommended_pool.unwrap().availability_zone,
            "us-east-1b"
        );
    }

    #[tokio::test]
    async fn non_success_status_is_error() {
        let app = Router::new().route(
            "/score",
            post(|| async { StatusCode::SERVICE_UNAVAILABLE }),
        );
        let predictor = HttpPredictor::new(&serve(app).await);
        let err = predictor.score(&features(0.1)).await.unwrap_err();
        assert!(matches!(err, PredictorError::Status(503)));
    }

    #[tokio::test]
    async fn out_of_range_score_rejected() {
        let app = Router::new().route(
            "/score",
            post(|| async {
                Json(serde_json::json!({
                    "risk_score": 3.0,
                    "price_trend": 0.0,
                    "confidence": 0.9
                }))
            }),
        );
        let predictor = HttpPredictor::new(&serve(app).await);
        let err = predictor.score(&features(0.1)).await.unwrap_err();
        assert!(matches!(err, PredictorError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_error() {
        let predictor = HttpPredictor::new("http://127.0.0.1:1/score");
        assert!(predictor.score(&features(0.1)).await.is_err());
    }
}
