//! Append-only interruption ledger.
//!
//! Events are never mutated or deleted. They feed the registry's
//! sliding window and are exported as JSON lines for model training.

use std::io::Write;
use std::time::Duration;

use tracing::debug;

use spotgrid_core::SharedClock;
use spotgrid_state::{PoolKey, RiskEvent, RiskEventType, StateError, StateResult, StateStore};

/// Ledger handle over the state store.
#[derive(Clone)]
pub struct EventLog {
    store: StateStore,
    clock: SharedClock,
    cooldown_secs: u64,
}

impl EventLog {
    pub fn new(store: StateStore, clock: SharedClock, cooldown: Duration) -> Self {
        Self {
            store,
            clock,
            cooldown_secs: cooldown.as_secs(),
        }
    }

    /// Window length in seconds.
    pub fn cooldown_secs(&self) -> u64 {
        self.cooldown_secs
    }

    fn event(
        &self,
        pool: &PoolKey,
        event_type: RiskEventType,
        tenant_id: &str,
        instance_id: Option<&str>,
        notice_id: Option<&str>,
        reported_at: u64,
    ) -> RiskEvent {
        RiskEvent {
            id: uuid::Uuid::new_v4().to_string(),
            pool: pool.clone(),
            event_type,
            tenant_id: tenant_id.to_string(),
            instance_id: instance_id.map(str::to_string),
            notice_id: notice_id.map(str::to_string),
            reported_at,
            expires_at: reported_at.saturating_add(self.cooldown_secs),
        }
    }

    /// Append an event reported at `reported_at`.
    pub fn append(
        &self,
        pool: &PoolKey,
        event_type: RiskEventType,
        tenant_id: &str,
        instance_id: Option<&str>,
        notice_id: Option<&str>,
        reported_at: u64,
    ) -> StateResult<RiskEvent> {
        let event = self.event(pool, event_type, tenant_id, instance_id, notice_id, reported_at);
        self.store.append_risk_event(&event)?;
        debug!(
            pool = %pool,
            event_type = %event_type,
            tenant = tenant_id,
            expires_at = event.expires_at,
            "risk event logged"
        );
        Ok(event)
    }

    /// Append the event for an instance's notice unless that notice was
    /// already logged. `None` means a repeat.
    pub fn append_notice(
        &self,
        pool: &PoolKey,
        event_type: RiskEventType,
        tenant_id: &str,
        instance_id: &str,
        notice_id: &str,
        reported_at: u64,
    ) -> StateResult<Option<RiskEvent>> {
        let event = self.event(
            pool,
            event_type,
            tenant_id,
            Some(instance_id),
            Some(notice_id),
            reported_at,
        );
        let appended = self
            .store
            .append_notice_event(instance_id, notice_id, &event)?
            .is_some();
        Ok(appended.then_some(event))
    }

    /// Every event ever logged for a pool, oldest first.
    pub fn for_pool(&self, pool: &PoolKey) -> StateResult<Vec<RiskEvent>> {
        self.store.list_risk_events_for_pool(pool)
    }

    /// Events for a pool that still count toward its window.
    pub fn active_for_pool(&self, pool: &PoolKey) -> StateResult<Vec<RiskEvent>> {
        let now = self.clock.now();
        Ok(self
            .for_pool(pool)?
            .into_iter()
            .filter(|e| e.is_active(now))
            .collect())
    }

    /// Events reported in `[from, to)`, optionally for one pool.
    pub fn range(&self, from: u64, to: u64, pool: Option<&PoolKey>) -> StateResult<Vec<RiskEvent>> {
        self.store.list_risk_events(from, to, pool)
    }

    /// Every event across all pools in report order.
    pub fn all(&self) -> StateResult<Vec<RiskEvent>> {
        self.store.list_risk_events(0, u64::MAX, None)
    }

    /// Write events reported in `[from, to)` as JSON lines. Returns the
    /// number of events written.
    pub fn export_jsonl<W: Write>(&self, from: u64, to: u64, mut out: W) -> StateResult<usize> {
        let events = self.range(from, to, None)?;
        for event in &events {
            serde_json::to_writer(&mut out, event)
                .map_err(|e| StateError::Serialize(e.to_string()))?;
            out.write_all(b"\n")?;
        }
        Ok(events.len())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use spotgrid_core::ManualClock;

    use super::*;

    const DAY: u64 = 86_400;

    fn setup() -> (EventLog, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = StateStore::open_in_memory().unwrap();
        let log = EventLog::new(store, clock.clone(), Duration::from_secs(15 * DAY));
        (log, clock)
    }

    fn pool() -> PoolKey {
        PoolKey::new("us-east-1", "us-east-1a", "m5")
    }

    #[test]
    fn append_sets_expiry_from_cooldown() {
        let (log, _) = setup();
        let event = log
            .append(&pool(), RiskEventType::TerminationNotice, "acme", Some("i-1"), None, 1_000)
            .unwrap();
        assert_eq!(event.expires_at, 1_000 + 15 * DAY);
        assert_eq!(log.for_pool(&pool()).unwrap(), vec![event]);
    }

    #[test]
    fn active_events_drop_out_after_expiry() {
        let (log, clock) = setup();
        log.append(&pool(), RiskEventType::RebalanceNotice, "acme", None, None, 1_000)
            .unwrap();
        assert_eq!(log.active_for_pool(&pool()).unwrap().len(), 1);

        clock.set(1_000 + 15 * DAY - 1);
        assert_eq!(log.active_for_pool(&pool()).unwrap().len(), 1);

        clock.set(1_000 + 15 * DAY);
        assert!(log.active_for_pool(&pool()).unwrap().is_empty());
        // Still retained.
        assert_eq!(log.for_pool(&pool()).unwrap().len(), 1);
    }

    #[test]
    fn export_writes_one_line_per_event() {
        let (log, _) = setup();
        for t in [100, 200, 300] {
            log.append(&pool(), RiskEventType::TerminationNotice, "acme", None, None, t)
                .unwrap();
        }

        let mut buf = Vec::new();
        let written = log.export_jsonl(150, 400, &mut buf).unwrap();
        assert_eq!(written, 2);

        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: RiskEvent = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.reported_at, 200);
    }
}
