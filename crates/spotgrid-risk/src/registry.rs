//! Cross-tenant risk registry keyed by pool.
//!
//! One in-memory slot per [`PoolKey`] holds the expiry deadlines of the
//! pool's logged events and its poison deadline. A slot is guarded by
//! its own mutex; the map only hands out the slot, so reports for
//! different pools proceed independently.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use spotgrid_core::SharedClock;
use spotgrid_core::config::RegistryConfig;
use spotgrid_state::{PoolKey, RiskEventType, RiskRegistryEntry, StateResult, StateStore};

use crate::event_log::EventLog;

/// Effect of a report on the pool's poison state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoisonTransition {
    /// No change to poisoning.
    Unchanged { count: u32 },
    /// The pool became poisoned.
    Poisoned { expires_at: u64, count: u32 },
    /// An already-poisoned pool had its deadline pushed out.
    Extended { expires_at: u64, count: u32 },
}

impl PoisonTransition {
    pub fn count(&self) -> u32 {
        match *self {
            PoisonTransition::Unchanged { count }
            | PoisonTransition::Poisoned { count, .. }
            | PoisonTransition::Extended { count, .. } => count,
        }
    }

    pub fn poisons(&self) -> bool {
        !matches!(self, PoisonTransition::Unchanged { .. })
    }
}

/// Read-time view of a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RiskView {
    pub pool: PoolKey,
    pub is_poisoned: bool,
    /// Set only while poisoned.
    pub expires_at: Option<u64>,
    /// Active events in the window.
    pub count: u32,
}

/// Outcome of a housekeeping sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub pools: usize,
    pub pruned_events: usize,
    pub poisoned: usize,
}

#[derive(Debug, Default)]
struct PoolState {
    /// `expires_at` of every event not yet pruned.
    expiries: Vec<u64>,
    poison_expires_at: Option<u64>,
}

impl PoolState {
    fn active_count(&self, now: u64) -> u32 {
        self.expiries.iter().filter(|&&t| now < t).count() as u32
    }

    fn poisoned_until(&self, now: u64) -> Option<u64> {
        self.poison_expires_at.filter(|&t| now < t)
    }

    /// Drop deadlines that have passed. Returns how many were removed.
    fn prune(&mut self, now: u64) -> usize {
        let before = self.expiries.len();
        self.expiries.retain(|&t| now < t);
        before - self.expiries.len()
    }

    fn view(&self, pool: &PoolKey, now: u64) -> RiskView {
        let expires_at = self.poisoned_until(now);
        RiskView {
            pool: pool.clone(),
            is_poisoned: expires_at.is_some(),
            expires_at,
            count: self.active_count(now),
        }
    }

    fn entry(&self, pool: &PoolKey, now: u64) -> RiskRegistryEntry {
        let view = self.view(pool, now);
        RiskRegistryEntry {
            pool: pool.clone(),
            interruption_count: view.count,
            is_poisoned: view.is_poisoned,
            poison_expires_at: view.expires_at,
            updated_at: now,
        }
    }
}

/// The shared registry. Clone the `Arc` to share it.
pub struct RiskRegistry {
    log: EventLog,
    store: StateStore,
    clock: SharedClock,
    threshold: u32,
    cooldown_secs: u64,
    pools: DashMap<PoolKey, Arc<Mutex<PoolState>>>,
}

impl RiskRegistry {
    pub fn new(store: StateStore, clock: SharedClock, config: &RegistryConfig) -> Self {
        let cooldown = config.cooldown();
        Self {
            log: EventLog::new(store.clone(), clock.clone(), cooldown),
            store,
            clock,
            threshold: config.poison_threshold.max(1),
            cooldown_secs: cooldown.as_secs(),
            pools: DashMap::new(),
        }
    }

    /// Build a registry and replay the event log into it.
    pub fn hydrated(store: StateStore, clock: SharedClock, config: &RegistryConfig) -> StateResult<Self> {
        let registry = Self::new(store, clock, config);
        registry.hydrate()?;
        Ok(registry)
    }

    /// The underlying event log.
    pub fn event_log(&self) -> &EventLog {
        &self.log
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    fn slot(&self, pool: &PoolKey) -> Arc<Mutex<PoolState>> {
        self.pools
            .entry(pool.clone())
            .or_insert_with(|| Arc::new(Mutex::new(PoolState::default())))
            .clone()
    }

    /// Log an interruption event and update the pool's state.
    pub fn report(
        &self,
        pool: &PoolKey,
        event_type: RiskEventType,
        tenant_id: &str,
        instance_id: Option<&str>,
        notice_id: Option<&str>,
    ) -> StateResult<PoisonTransition> {
        let slot = self.slot(pool);
        let mut state = slot.lock();
        let now = self.clock.now();

        let event = self
            .log
            .append(pool, event_type, tenant_id, instance_id, notice_id, now)?;
        Ok(self.count_event(&mut state, pool, event_type, tenant_id, event.expires_at, now))
    }

    /// Report an instance's notice once. Repeats of the same
    /// `(instance, notice)` return `None` and change nothing.
    pub fn report_notice(
        &self,
        pool: &PoolKey,
        event_type: RiskEventType,
        tenant_id: &str,
        instance_id: &str,
        notice_id: &str,
    ) -> StateResult<Option<PoisonTransition>> {
        let slot = self.slot(pool);
        let mut state = slot.lock();
        let now = self.clock.now();

        let Some(event) = self
            .log
            .append_notice(pool, event_type, tenant_id, instance_id, notice_id, now)?
        else {
            return Ok(None);
        };
        Ok(Some(self.count_event(
            &mut state,
            pool,
            event_type,
            tenant_id,
            event.expires_at,
            now,
        )))
    }

    /// Fold a logged event into the pool's window and poison state.
    fn count_event(
        &self,
        state: &mut PoolState,
        pool: &PoolKey,
        event_type: RiskEventType,
        tenant_id: &str,
        expires_at: u64,
        now: u64,
    ) -> PoisonTransition {
        state.expiries.push(expires_at);
        state.prune(now);

        let count = state.active_count(now);
        let was_poisoned = state.poisoned_until(now).is_some();

        let transition = if event_type.qualifies_for_poisoning() && count >= self.threshold {
            let expires_at = now.saturating_add(self.cooldown_secs);
            state.poison_expires_at = Some(expires_at);
            if was_poisoned {
                PoisonTransition::Extended { expires_at, count }
            } else {
                PoisonTransition::Poisoned { expires_at, count }
            }
        } else {
            PoisonTransition::Unchanged { count }
        };

        match transition {
            PoisonTransition::Poisoned { expires_at, .. } => {
                info!(pool = %pool, tenant = tenant_id, count, expires_at, "pool poisoned");
            }
            PoisonTransition::Extended { expires_at, .. } => {
                info!(pool = %pool, tenant = tenant_id, count, expires_at, "pool poison extended");
            }
            PoisonTransition::Unchanged { .. } => {
                debug!(pool = %pool, event_type = %event_type, count, "risk event counted");
            }
        }

        // The persisted entry is a dashboard cache; hydration rebuilds
        // it from the log, so a failed write is not fatal.
        if let Err(e) = self.store.put_pool_entry(&state.entry(pool, now)) {
            warn!(pool = %pool, error = %e, "failed to persist pool entry");
        }

        transition
    }

    /// Current state of a pool, with expiry applied at read time.
    pub fn query(&self, pool: &PoolKey) -> RiskView {
        let now = self.clock.now();
        let slot = self.pools.get(pool).map(|s| s.value().clone());
        match slot {
            Some(slot) => slot.lock().view(pool, now),
            None => RiskView {
                pool: pool.clone(),
                is_poisoned: false,
                expires_at: None,
                count: 0,
            },
        }
    }

    pub fn is_poisoned(&self, pool: &PoolKey) -> bool {
        self.query(pool).is_poisoned
    }

    /// Every known pool, sorted by key.
    pub fn snapshot(&self) -> Vec<RiskView> {
        let slots: Vec<(PoolKey, Arc<Mutex<PoolState>>)> = self
            .pools
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let now = self.clock.now();
        let mut views: Vec<RiskView> = slots
            .iter()
            .map(|(pool, slot)| slot.lock().view(pool, now))
            .collect();
        views.sort_by(|a, b| a.pool.cmp(&b.pool));
        views
    }

    /// Rebuild in-memory state by replaying the log in report order.
    /// Returns the number of pools seen.
    pub fn hydrate(&self) -> StateResult<usize> {
        let events = self.log.all()?;
        for event in &events {
            let slot = self.slot(&event.pool);
            let mut state = slot.lock();
            state.expiries.push(event.expires_at);
            let count = state.active_count(event.reported_at);
            if event.event_type.qualifies_for_poisoning() && count >= self.threshold {
                state.poison_expires_at =
                    Some(event.reported_at.saturating_add(self.cooldown_secs));
            }
        }

        let now = self.clock.now();
        for slot in self.pools.iter() {
            slot.value().lock().prune(now);
        }

        info!(events = events.len(), pools = self.pools.len(), "risk registry hydrated");
        Ok(self.pools.len())
    }

    /// Housekeeping: prune expired deadlines and refresh persisted
    /// entries. Query results do not depend on it.
    pub fn sweep(&self) -> StateResult<SweepReport> {
        let slots: Vec<(PoolKey, Arc<Mutex<PoolState>>)> = self
            .pools
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let now = self.clock.now();
        let mut report = SweepReport {
            pools: slots.len(),
            ..Default::default()
        };

        for (pool, slot) in slots {
            let mut state = slot.lock();
            report.pruned_events += state.prune(now);
            if state.poisoned_until(now).is_some() {
                report.poisoned += 1;
            }
            self.store.put_pool_entry(&state.entry(&pool, now))?;
        }

        debug!(
            pools = report.pools,
            pruned = report.pruned_events,
            poisoned = report.poisoned,
            "risk registry swept"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use spotgrid_core::ManualClock;

    use super::*;

    const DAY: u64 = 86_400;
    const T0: u64 = 1_700_000_000;

    fn setup(threshold: u32) -> (RiskRegistry, StateStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(T0));
        let store = StateStore::open_in_memory().unwrap();
        let config = RegistryConfig {
            poison_threshold: threshold,
            ..Default::default()
        };
        let registry = RiskRegistry::new(store.clone(), clock.clone(), &config);
        (registry, store, clock)
    }

    fn pool() -> PoolKey {
        PoolKey::new("us-east-1", "us-east-1a", "m5")
    }

    #[test]
    fn termination_notice_poisons_immediately() {
        let (registry, _, _) = setup(1);
        let t = registry
            .report(&pool(), RiskEventType::TerminationNotice, "tenant-a", Some("i-1"), None)
            .unwrap();
        assert_eq!(
            t,
            PoisonTransition::Poisoned {
                expires_at: T0 + 15 * DAY,
                count: 1
            }
        );

        let view = registry.query(&pool());
        assert!(view.is_poisoned);
        assert_eq!(view.expires_at, Some(T0 + 15 * DAY));
        assert_eq!(view.count, 1);
    }

    #[test]
    fn rebalance_notice_counts_without_poisoning() {
        let (registry, _, _) = setup(1);
        let t = registry
            .report(&pool(), RiskEventType::RebalanceNotice, "tenant-a", None, None)
            .unwrap();
        assert_eq!(t, PoisonTransition::Unchanged { count: 1 });
        let view = registry.query(&pool());
        assert!(!view.is_poisoned);
        assert_eq!(view.count, 1);
    }

    #[test]
    fn poisoning_is_cross_tenant() {
        let (registry, _, _) = setup(1);
        registry
            .report(&pool(), RiskEventType::TerminationNotice, "tenant-b", None, None)
            .unwrap();
        // Nothing about the query is tenant-scoped.
        assert!(registry.is_poisoned(&pool()));
    }

    #[test]
    fn poison_decays_lazily() {
        let (registry, _, clock) = setup(1);
        registry
            .report(&pool(), RiskEventType::TerminationNotice, "tenant-a", None, None)
            .unwrap();

        clock.set(T0 + 15 * DAY - 1);
        assert!(registry.is_poisoned(&pool()));

        clock.set(T0 + 15 * DAY + 1);
        let view = registry.query(&pool());
        assert!(!view.is_poisoned);
        assert_eq!(view.expires_at, None);
        assert_eq!(view.count, 0);
    }

    #[test]
    fn threshold_above_one_needs_window_count() {
        let (registry, _, clock) = setup(3);
        let first = registry
            .report(&pool(), RiskEventType::RebalanceNotice, "a", None, None)
            .unwrap();
        clock.advance(60);
        let second = registry
            .report(&pool(), RiskEventType::TerminationNotice, "b", None, None)
            .unwrap();
        assert!(!first.poisons());
        assert!(!second.poisons());
        assert!(!registry.is_poisoned(&pool()));

        clock.advance(60);
        let third = registry
            .report(&pool(), RiskEventType::TerminationNotice, "c", None, None)
            .unwrap();
        assert!(matches!(third, PoisonTransition::Poisoned { count: 3, .. }));
    }

    #[test]
    fn rebalance_at_threshold_does_not_poison() {
        let (registry, _, _) = setup(2);
        registry
            .report(&pool(), RiskEventType::TerminationNotice, "a", None, None)
            .unwrap();
        let t = registry
            .report(&pool(), RiskEventType::RebalanceNotice, "b", None, None)
            .unwrap();
        assert_eq!(t, PoisonTransition::Unchanged { count: 2 });
        assert!(!registry.is_poisoned(&pool()));
    }

    #[test]
    fn repoison_extends_deadline() {
        let (registry, _, clock) = setup(1);
        registry
            .report(&pool(), RiskEventType::TerminationNotice, "a", None, None)
            .unwrap();
        clock.advance(DAY);
        let t = registry
            .report(&pool(), RiskEventType::TerminationNotice, "b", None, None)
            .unwrap();
        assert_eq!(
            t,
            PoisonTransition::Extended {
                expires_at: T0 + DAY + 15 * DAY,
                count: 2
            }
        );
    }

    #[test]
    fn unknown_pool_is_clean() {
        let (registry, _, _) = setup(1);
        let view = registry.query(&PoolKey::new("ap-south-1", "ap-south-1a", "t3"));
        assert!(!view.is_poisoned);
        assert_eq!(view.count, 0);
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn pools_are_independent() {
        let (registry, _, _) = setup(1);
        let other = PoolKey::new("us-east-1", "us-east-1b", "m5");
        registry
            .report(&pool(), RiskEventType::TerminationNotice, "a", None, None)
            .unwrap();
        assert!(registry.is_poisoned(&pool()));
        assert!(!registry.is_poisoned(&other));
    }

    #[test]
    fn concurrent_reports_are_all_counted() {
        let (registry, store, _) = setup(100);
        let registry = Arc::new(registry);

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let registry = registry.clone();
                thread::spawn(move || {
                    registry
                        .report(&pool(), RiskEventType::RebalanceNotice, &format!("t-{i}"), None, None)
                        .unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(registry.query(&pool()).count, 16);
        assert_eq!(store.list_risk_events_for_pool(&pool()).unwrap().len(), 16);
        assert_eq!(
            store.get_pool_entry(&pool()).unwrap().unwrap().interruption_count,
            16
        );
    }

    #[test]
    fn hydrate_restores_poison_after_restart() {
        let (registry, store, clock) = setup(1);
        registry
            .report(&pool(), RiskEventType::TerminationNotice, "a", None, None)
            .unwrap();
        drop(registry);

        clock.advance(DAY);
        let config = RegistryConfig::default();
        let restored = RiskRegistry::hydrated(store, clock.clone(), &config).unwrap();
        let view = restored.query(&pool());
        assert!(view.is_poisoned);
        assert_eq!(view.expires_at, Some(T0 + 15 * DAY));
        assert_eq!(view.count, 1);
    }

    #[test]
    fn hydrate_skips_expired_poison() {
        let (registry, store, clock) = setup(1);
        registry
            .report(&pool(), RiskEventType::TerminationNotice, "a", None, None)
            .unwrap();

        clock.advance(20 * DAY);
        let restored = RiskRegistry::hydrated(store, clock, &RegistryConfig::default()).unwrap();
        assert!(!restored.is_poisoned(&pool()));
        assert_eq!(restored.snapshot().len(), 1);
    }

    #[test]
    fn sweep_refreshes_persisted_entries() {
        let (registry, store, clock) = setup(1);
        registry
            .report(&pool(), RiskEventType::TerminationNotice, "a", None, None)
            .unwrap();
        assert!(store.get_pool_entry(&pool()).unwrap().unwrap().is_poisoned);

        clock.advance(16 * DAY);
        let report = registry.sweep().unwrap();
        assert_eq!(report.pools, 1);
        assert_eq!(report.pruned_events, 1);
        assert_eq!(report.poisoned, 0);

        let entry = store.get_pool_entry(&pool()).unwrap().unwrap();
        assert!(!entry.is_poisoned);
        assert_eq!(entry.poison_expires_at, None);
        assert_eq!(entry.interruption_count, 0);
    }
}
