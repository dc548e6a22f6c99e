//! StateStore: redb-backed state persistence for SpotGrid.
//!
//! Provides typed operations over the risk ledger, pool entries,
//! decisions, approvals, replica links, downtime windows, instances and
//! action records. All values are JSON-serialized into redb's `&[u8]`
//! value columns. The store supports both on-disk and in-memory backends
//! (the latter for testing).
//!
//! Append-only records (risk events, decisions, actions) are inserted
//! under a per-table sequence drawn inside the same write transaction,
//! so two inserts in the same second still sort in insertion order.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.open_table(NOTICES).map_err(map_err!(Table))?;
        for def in [
            RISK_EVENTS,
            POOLS,
            DECISIONS,
            APPROVALS,
            REPLICAS,
            DOWNTIME,
            INSTANCES,
            ACTIONS,
        ] {
            txn.open_table(def).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn put_json<T: Serialize>(&self, def: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Insert only if the key is absent.
    fn insert_new_json<T: Serialize>(
        &self,
        def: JsonTable,
        key: &str,
        value: &T,
    ) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            let exists = table.get(key).map_err(map_err!(Read))?.is_some();
            if exists {
                return Err(StateError::Conflict(key.to_string()));
            }
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Insert under `{prefix}|{seq}` where `seq` is drawn from `counter`
    /// inside the same transaction. Returns the full key.
    fn insert_sequenced<T: Serialize>(
        &self,
        def: JsonTable,
        counter: &str,
        prefix: &str,
        value: &T,
    ) -> StateResult<String> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let key = insert_sequenced_in(&txn, def, counter, prefix, &bytes)?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(key)
    }

    fn get_json<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// All `(key, value)` pairs whose key starts with `prefix`, in key order.
    fn scan_prefix<T: DeserializeOwned>(
        &self,
        def: JsonTable,
        prefix: &str,
    ) -> StateResult<Vec<(String, T)>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let record: T =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push((key.value().to_string(), record));
            }
        }
        Ok(results)
    }

    fn scan_values<T: DeserializeOwned>(&self, def: JsonTable, prefix: &str) -> StateResult<Vec<T>> {
        Ok(self
            .scan_prefix(def, prefix)?
            .into_iter()
            .map(|(_, v)| v)
            .collect())
    }

    /// Atomic read-modify-write of a single record. Returns `None` if the
    /// key does not exist.
    fn update_json<T, R>(
        &self,
        def: JsonTable,
        key: &str,
        f: impl FnOnce(&mut T) -> R,
    ) -> StateResult<Option<R>>
    where
        T: Serialize + DeserializeOwned,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let result = {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            let current: Option<Vec<u8>> = table
                .get(key)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec());
            match current {
                Some(bytes) => {
                    let mut value: T =
                        serde_json::from_slice(&bytes).map_err(map_err!(Deserialize))?;
                    let out = f(&mut value);
                    let encoded = serde_json::to_vec(&value).map_err(map_err!(Serialize))?;
                    table
                        .insert(key, encoded.as_slice())
                        .map_err(map_err!(Write))?;
                    Some(out)
                }
                None => None,
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(result)
    }

    // ── Risk events ────────────────────────────────────────────────

    /// Append a risk event to the ledger. Returns its table key.
    pub fn append_risk_event(&self, event: &RiskEvent) -> StateResult<String> {
        let prefix = format!("{}|{:020}", event.pool.table_key(), event.reported_at);
        let key = self.insert_sequenced(RISK_EVENTS, "risk_events", &prefix, event)?;
        debug!(%key, event_type = %event.event_type, "risk event appended");
        Ok(key)
    }

    /// All events for a pool, oldest first.
    pub fn list_risk_events_for_pool(&self, pool: &PoolKey) -> StateResult<Vec<RiskEvent>> {
        let prefix = format!("{}|", pool.table_key());
        self.scan_values(RISK_EVENTS, &prefix)
    }

    /// Events reported in `[from, to)`, optionally restricted to one pool,
    /// ordered by report time.
    pub fn list_risk_events(
        &self,
        from: u64,
        to: u64,
        pool: Option<&PoolKey>,
    ) -> StateResult<Vec<RiskEvent>> {
        let prefix = pool
            .map(|p| format!("{}|", p.table_key()))
            .unwrap_or_default();
        let mut events: Vec<RiskEvent> = self
            .scan_values::<RiskEvent>(RISK_EVENTS, &prefix)?
            .into_iter()
            .filter(|e| e.reported_at >= from && e.reported_at < to)
            .collect();
        events.sort_by_key(|e| e.reported_at);
        Ok(events)
    }

    /// Append the event an instance's notice produced, once per
    /// `(instance, notice)`. The dedupe marker and the event commit in one
    /// transaction. Returns the event key, or `None` for a repeat.
    pub fn append_notice_event(
        &self,
        instance_id: &str,
        notice_id: &str,
        event: &RiskEvent,
    ) -> StateResult<Option<String>> {
        let marker = format!("{instance_id}|{notice_id}");
        let bytes = serde_json::to_vec(event).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let repeat = {
            let mut seen = txn.open_table(NOTICES).map_err(map_err!(Table))?;
            let repeat = seen.get(marker.as_str()).map_err(map_err!(Read))?.is_some();
            if !repeat {
                seen.insert(marker.as_str(), event.reported_at)
                    .map_err(map_err!(Write))?;
            }
            repeat
        };
        if repeat {
            txn.abort().map_err(map_err!(Transaction))?;
            return Ok(None);
        }
        let prefix = format!("{}|{:020}", event.pool.table_key(), event.reported_at);
        let key = insert_sequenced_in(&txn, RISK_EVENTS, "risk_events", &prefix, &bytes)?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, instance = instance_id, notice = notice_id, "notice event appended");
        Ok(Some(key))
    }

    /// Whether an instance's notice already produced an event.
    pub fn notice_reported(&self, instance_id: &str, notice_id: &str) -> StateResult<bool> {
        let marker = format!("{instance_id}|{notice_id}");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let seen = txn.open_table(NOTICES).map_err(map_err!(Table))?;
        Ok(seen.get(marker.as_str()).map_err(map_err!(Read))?.is_some())
    }

    // ── Pools ──────────────────────────────────────────────────────

    /// Insert or update a pool's registry entry.
    pub fn put_pool_entry(&self, entry: &RiskRegistryEntry) -> StateResult<()> {
        self.put_json(POOLS, &entry.table_key(), entry)
    }

    pub fn get_pool_entry(&self, pool: &PoolKey) -> StateResult<Option<RiskRegistryEntry>> {
        self.get_json(POOLS, &pool.table_key())
    }

    pub fn list_pool_entries(&self) -> StateResult<Vec<RiskRegistryEntry>> {
        self.scan_values(POOLS, "")
    }

    // ── Decisions ──────────────────────────────────────────────────

    /// Persist a decision. Decisions are never overwritten.
    pub fn put_decision(&self, decision: &Decision) -> StateResult<String> {
        let prefix = format!("{}|{:020}", decision.instance_id, decision.evaluated_at);
        let key = self.insert_sequenced(DECISIONS, "decisions", &prefix, decision)?;
        debug!(%key, decision = decision.decision_type.as_str(), "decision stored");
        Ok(key)
    }

    /// The most recent decision for an instance.
    pub fn latest_decision(&self, instance_id: &str) -> StateResult<Option<Decision>> {
        let prefix = format!("{instance_id}|");
        Ok(self.scan_values(DECISIONS, &prefix)?.pop())
    }

    /// One of an instance's decisions by id.
    pub fn find_decision(
        &self,
        instance_id: &str,
        decision_id: &str,
    ) -> StateResult<Option<Decision>> {
        let prefix = format!("{instance_id}|");
        Ok(self
            .scan_values::<Decision>(DECISIONS, &prefix)?
            .into_iter()
            .find(|d| d.id == decision_id))
    }

    /// Decisions for an instance, newest first.
    pub fn list_decisions(&self, instance_id: &str, limit: usize) -> StateResult<Vec<Decision>> {
        let prefix = format!("{instance_id}|");
        let mut decisions: Vec<Decision> = self.scan_values(DECISIONS, &prefix)?;
        decisions.reverse();
        decisions.truncate(limit);
        Ok(decisions)
    }

    // ── Approvals ──────────────────────────────────────────────────

    /// Insert a new approval request. Fails with `Conflict` on id reuse.
    pub fn insert_approval(&self, request: &ApprovalRequest) -> StateResult<()> {
        self.insert_new_json(APPROVALS, &request.id, request)
    }

    pub fn get_approval(&self, id: &str) -> StateResult<Option<ApprovalRequest>> {
        self.get_json(APPROVALS, id)
    }

    pub fn list_approvals(&self) -> StateResult<Vec<ApprovalRequest>> {
        let mut requests: Vec<ApprovalRequest> = self.scan_values(APPROVALS, "")?;
        requests.sort_by_key(|r| r.requested_at);
        Ok(requests)
    }

    /// Atomically update an approval request.
    pub fn update_approval<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut ApprovalRequest) -> R,
    ) -> StateResult<Option<R>> {
        self.update_json(APPROVALS, id, f)
    }

    // ── Replicas ───────────────────────────────────────────────────

    pub fn put_replica(&self, link: &ReplicaLink) -> StateResult<()> {
        self.put_json(REPLICAS, &link.table_key(), link)
    }

    /// All links whose primary is `primary_id`.
    pub fn list_replicas_for_primary(&self, primary_id: &str) -> StateResult<Vec<ReplicaLink>> {
        let prefix = format!("{primary_id}|");
        let mut links: Vec<ReplicaLink> = self.scan_values(REPLICAS, &prefix)?;
        links.sort_by_key(|l| l.created_at);
        Ok(links)
    }

    pub fn list_replicas(&self) -> StateResult<Vec<ReplicaLink>> {
        self.scan_values(REPLICAS, "")
    }

    /// Atomically rewrite every link of a primary. Links appended to the
    /// vector by `f` are inserted.
    pub fn update_replicas_for_primary<R>(
        &self,
        primary_id: &str,
        f: impl FnOnce(&mut Vec<ReplicaLink>) -> R,
    ) -> StateResult<R> {
        let prefix = format!("{primary_id}|");
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let result = {
            let mut table = txn.open_table(REPLICAS).map_err(map_err!(Table))?;
            let mut links = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                if key.value().starts_with(&prefix) {
                    let link: ReplicaLink =
                        serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                    links.push(link);
                }
            }
            links.sort_by_key(|l| l.created_at);

            let out = f(&mut links);

            for link in &links {
                if link.primary_instance_id != primary_id {
                    return Err(StateError::Write(format!(
                        "link {} does not belong to primary {primary_id}",
                        link.id
                    )));
                }
                let bytes = serde_json::to_vec(link).map_err(map_err!(Serialize))?;
                table
                    .insert(link.table_key().as_str(), bytes.as_slice())
                    .map_err(map_err!(Write))?;
            }
            out
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(result)
    }

    // ── Downtime ───────────────────────────────────────────────────

    pub fn put_downtime(&self, record: &DowntimeRecord) -> StateResult<()> {
        self.put_json(DOWNTIME, &record.table_key(), record)
    }

    /// Downtime windows starting in `[from, to)`, optionally by cause.
    pub fn list_downtime(
        &self,
        from: u64,
        to: u64,
        cause: Option<DowntimeCause>,
    ) -> StateResult<Vec<DowntimeRecord>> {
        Ok(self
            .scan_values::<DowntimeRecord>(DOWNTIME, "")?
            .into_iter()
            .filter(|r| r.window_start >= from && r.window_start < to)
            .filter(|r| cause.is_none_or(|c| r.cause == c))
            .collect())
    }

    pub fn list_open_downtime(&self) -> StateResult<Vec<DowntimeRecord>> {
        Ok(self
            .scan_values::<DowntimeRecord>(DOWNTIME, "")?
            .into_iter()
            .filter(DowntimeRecord::is_open)
            .collect())
    }

    /// Close every open window for an instance at `at`. Returns the
    /// records that were closed.
    pub fn close_open_downtime(&self, instance_id: &str, at: u64) -> StateResult<Vec<DowntimeRecord>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut closed = Vec::new();
        {
            let mut table = txn.open_table(DOWNTIME).map_err(map_err!(Table))?;
            let mut open = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                let record: DowntimeRecord =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if record.instance_id == instance_id && record.is_open() {
                    open.push((key.value().to_string(), record));
                }
            }
            for (key, mut record) in open {
                record.close(at);
                let bytes = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
                table
                    .insert(key.as_str(), bytes.as_slice())
                    .map_err(map_err!(Write))?;
                closed.push(record);
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(closed)
    }

    // ── Instances ──────────────────────────────────────────────────

    pub fn put_instance(&self, record: &InstanceRecord) -> StateResult<()> {
        self.put_json(INSTANCES, &record.instance_id, record)
    }

    pub fn get_instance(&self, instance_id: &str) -> StateResult<Option<InstanceRecord>> {
        self.get_json(INSTANCES, instance_id)
    }

    pub fn list_instances(&self) -> StateResult<Vec<InstanceRecord>> {
        self.scan_values(INSTANCES, "")
    }

    pub fn update_instance<R>(
        &self,
        instance_id: &str,
        f: impl FnOnce(&mut InstanceRecord) -> R,
    ) -> StateResult<Option<R>> {
        self.update_json(INSTANCES, instance_id, f)
    }

    // ── Actions ────────────────────────────────────────────────────

    /// Persist a new action record. Returns its key for later updates.
    pub fn put_action(&self, record: &ActionRecord) -> StateResult<String> {
        let prefix = format!("{}|{:020}", record.instance_id, record.created_at);
        self.insert_sequenced(ACTIONS, "actions", &prefix, record)
    }

    pub fn update_action<R>(
        &self,
        key: &str,
        f: impl FnOnce(&mut ActionRecord) -> R,
    ) -> StateResult<Option<R>> {
        self.update_json(ACTIONS, key, f)
    }

    /// Action records for an instance, oldest first.
    pub fn list_actions_for_instance(&self, instance_id: &str) -> StateResult<Vec<ActionRecord>> {
        let prefix = format!("{instance_id}|");
        self.scan_values(ACTIONS, &prefix)
    }

    pub fn list_actions(&self) -> StateResult<Vec<ActionRecord>> {
        self.scan_values(ACTIONS, "")
    }
}

/// Draw the next `counter` value and insert `bytes` under
/// `{prefix}|{seq}` inside `txn`.
fn insert_sequenced_in(
    txn: &WriteTransaction,
    def: JsonTable,
    counter: &str,
    prefix: &str,
    bytes: &[u8],
) -> StateResult<String> {
    let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
    let seq = meta
        .get(counter)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value())
        .unwrap_or(0)
        + 1;
    meta.insert(counter, seq).map_err(map_err!(Write))?;

    let key = format!("{prefix}|{seq:020}");
    let mut table = txn.open_table(def).map_err(map_err!(Table))?;
    table.insert(key.as_str(), bytes).map_err(map_err!(Write))?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> PoolKey {
        PoolKey::new("us-east-1", "us-east-1a", "m5")
    }

    fn test_event(pool: &PoolKey, reported_at: u64, event_type: RiskEventType) -> RiskEvent {
        RiskEvent {
            id: format!("evt-{reported_at}"),
            pool: pool.clone(),
            event_type,
            tenant_id: "acme".to_string(),
            instance_id: Some("i-1".to_string()),
            notice_id: None,
            reported_at,
            expires_at: reported_at + 15 * 86_400,
        }
    }

    fn test_decision(instance_id: &str, evaluated_at: u64, decision_type: DecisionType) -> Decision {
        Decision {
            id: format!("dec-{evaluated_at}"),
            instance_id: instance_id.to_string(),
            decision_type,
            risk_score: 0.1,
            confidence: 0.9,
            features_snapshot: FeatureSnapshot {
                pool: pool(),
                lifecycle: Lifecycle::Spot,
                utilization: 0.5,
                current_price: 0.03,
                pool_poisoned: false,
                poison_expires_at: None,
                interruption_count: 0,
                notice_count: 0,
                predictor: None,
            },
            reason: "test".to_string(),
            target_pool: None,
            evaluated_at,
        }
    }

    fn test_approval(id: &str, requested_at: u64) -> ApprovalRequest {
        ApprovalRequest {
            id: id.to_string(),
            action_type: ApprovalActionType::SwitchInstance,
            risk_level: RiskLevel::High,
            instance_id: Some("i-1".to_string()),
            decision_id: None,
            payload: serde_json::json!({"to": "on_demand"}),
            status: ApprovalStatus::Pending,
            requested_at,
            expires_at: requested_at + 3600,
            resolved_at: None,
            resolved_by: None,
            note: None,
            dispatched_at: None,
            action_key: None,
        }
    }

    fn test_link(primary: &str, id: &str, created_at: u64, state: SyncState) -> ReplicaLink {
        ReplicaLink {
            id: id.to_string(),
            primary_instance_id: primary.to_string(),
            replica_instance_id: format!("{primary}-replica-{id}"),
            pool: pool(),
            lifecycle: Lifecycle::OnDemand,
            sync_state: state,
            endpoint: None,
            created_at,
            updated_at: created_at,
        }
    }

    // ── Risk events ────────────────────────────────────────────────

    #[test]
    fn risk_events_append_and_list_by_pool() {
        let store = StateStore::open_in_memory().unwrap();
        let other = PoolKey::new("eu-west-1", "eu-west-1b", "c6g");

        store
            .append_risk_event(&test_event(&pool(), 100, RiskEventType::RebalanceNotice))
            .unwrap();
        store
            .append_risk_event(&test_event(&pool(), 200, RiskEventType::TerminationNotice))
            .unwrap();
        store
            .append_risk_event(&test_event(&other, 150, RiskEventType::TerminationNotice))
            .unwrap();

        let events = store.list_risk_events_for_pool(&pool()).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].reported_at, 100);
        assert_eq!(events[1].reported_at, 200);
    }

    #[test]
    fn same_second_events_are_both_kept() {
        let store = StateStore::open_in_memory().unwrap();
        let a = store
            .append_risk_event(&test_event(&pool(), 100, RiskEventType::RebalanceNotice))
            .unwrap();
        let b = store
            .append_risk_event(&test_event(&pool(), 100, RiskEventType::RebalanceNotice))
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(store.list_risk_events_for_pool(&pool()).unwrap().len(), 2);
    }

    #[test]
    fn risk_events_by_time_range_and_pool() {
        let store = StateStore::open_in_memory().unwrap();
        let other = PoolKey::new("eu-west-1", "eu-west-1b", "c6g");
        for (p, t) in [(&pool(), 100), (&other, 150), (&pool(), 300)] {
            store
                .append_risk_event(&test_event(p, t, RiskEventType::TerminationNotice))
                .unwrap();
        }

        let all = store.list_risk_events(0, u64::MAX, None).unwrap();
        assert_eq!(
            all.iter().map(|e| e.reported_at).collect::<Vec<_>>(),
            vec![100, 150, 300]
        );

        let window = store.list_risk_events(100, 300, None).unwrap();
        assert_eq!(window.len(), 2);

        let only_other = store.list_risk_events(0, u64::MAX, Some(&other)).unwrap();
        assert_eq!(only_other.len(), 1);
        assert_eq!(only_other[0].pool, other);
    }

    #[test]
    fn notice_event_appended_once_per_instance() {
        let store = StateStore::open_in_memory().unwrap();
        let event = test_event(&pool(), 100, RiskEventType::TerminationNotice);
        assert!(!store.notice_reported("i-1", "n-1").unwrap());

        assert!(store.append_notice_event("i-1", "n-1", &event).unwrap().is_some());
        assert!(store.notice_reported("i-1", "n-1").unwrap());
        assert!(store.append_notice_event("i-1", "n-1", &event).unwrap().is_none());
        assert!(store.append_notice_event("i-2", "n-1", &event).unwrap().is_some());

        assert_eq!(store.list_risk_events_for_pool(&pool()).unwrap().len(), 2);
    }

    #[test]
    fn repeated_notice_leaves_sequence_untouched() {
        let store = StateStore::open_in_memory().unwrap();
        let event = test_event(&pool(), 100, RiskEventType::RebalanceNotice);
        let first = store.append_notice_event("i-1", "n-1", &event).unwrap().unwrap();
        store.append_notice_event("i-1", "n-1", &event).unwrap();
        let next = store.append_risk_event(&event).unwrap();
        assert!(first.ends_with(&format!("{:020}", 1)));
        assert!(next.ends_with(&format!("{:020}", 2)));
    }

    // ── Pools ──────────────────────────────────────────────────────

    #[test]
    fn pool_entry_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let entry = RiskRegistryEntry {
            pool: pool(),
            interruption_count: 2,
            is_poisoned: true,
            poison_expires_at: Some(5000),
            updated_at: 100,
        };
        store.put_pool_entry(&entry).unwrap();
        assert_eq!(store.get_pool_entry(&pool()).unwrap(), Some(entry));
        assert_eq!(store.list_pool_entries().unwrap().len(), 1);
    }

    // ── Decisions ──────────────────────────────────────────────────

    #[test]
    fn latest_decision_is_newest() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_decision(&test_decision("i-1", 100, DecisionType::StaySpot))
            .unwrap();
        store
            .put_decision(&test_decision("i-1", 200, DecisionType::SwitchToOndemand))
            .unwrap();
        store
            .put_decision(&test_decision("i-10", 300, DecisionType::StaySpot))
            .unwrap();

        let latest = store.latest_decision("i-1").unwrap().unwrap();
        assert_eq!(latest.evaluated_at, 200);
        assert_eq!(latest.decision_type, DecisionType::SwitchToOndemand);

        let history = store.list_decisions("i-1", 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].evaluated_at, 200);

        assert!(store.latest_decision("i-2").unwrap().is_none());

        let older = store.find_decision("i-1", "dec-100").unwrap().unwrap();
        assert_eq!(older.decision_type, DecisionType::StaySpot);
        assert!(store.find_decision("i-10", "dec-100").unwrap().is_none());
    }

    #[test]
    fn same_second_decisions_keep_insertion_order() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_decision(&test_decision("i-1", 100, DecisionType::StaySpot))
            .unwrap();
        store
            .put_decision(&test_decision("i-1", 100, DecisionType::SwitchToOndemand))
            .unwrap();
        let latest = store.latest_decision("i-1").unwrap().unwrap();
        assert_eq!(latest.decision_type, DecisionType::SwitchToOndemand);
    }

    // ── Approvals ──────────────────────────────────────────────────

    #[test]
    fn approval_insert_is_unique() {
        let store = StateStore::open_in_memory().unwrap();
        store.insert_approval(&test_approval("a-1", 100)).unwrap();
        let err = store.insert_approval(&test_approval("a-1", 100)).unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn approval_update_is_applied() {
        let store = StateStore::open_in_memory().unwrap();
        store.insert_approval(&test_approval("a-1", 100)).unwrap();

        let prev = store
            .update_approval("a-1", |r| {
                let prev = r.status;
                r.status = ApprovalStatus::Approved;
                prev
            })
            .unwrap();
        assert_eq!(prev, Some(ApprovalStatus::Pending));
        assert_eq!(
            store.get_approval("a-1").unwrap().unwrap().status,
            ApprovalStatus::Approved
        );

        assert!(store.update_approval("missing", |_| ()).unwrap().is_none());
    }

    #[test]
    fn concurrent_updates_are_serialized() {
        let store = StateStore::open_in_memory().unwrap();
        store.insert_approval(&test_approval("a-1", 100)).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store
                        .update_approval("a-1", |r| {
                            if r.status == ApprovalStatus::Pending {
                                r.status = ApprovalStatus::Approved;
                                r.resolved_by = Some(format!("op-{i}"));
                                true
                            } else {
                                false
                            }
                        })
                        .unwrap()
                        .unwrap()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    // ── Replicas ───────────────────────────────────────────────────

    #[test]
    fn replicas_listed_per_primary() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_replica(&test_link("i-1", "l-1", 10, SyncState::Ready))
            .unwrap();
        store
            .put_replica(&test_link("i-1", "l-2", 20, SyncState::Retired))
            .unwrap();
        store
            .put_replica(&test_link("i-2", "l-3", 30, SyncState::Syncing))
            .unwrap();

        assert_eq!(store.list_replicas_for_primary("i-1").unwrap().len(), 2);
        assert_eq!(store.list_replicas_for_primary("i-2").unwrap().len(), 1);
        assert_eq!(store.list_replicas().unwrap().len(), 3);
    }

    #[test]
    fn update_replicas_inserts_and_rewrites() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_replica(&test_link("i-1", "l-1", 10, SyncState::Ready))
            .unwrap();

        store
            .update_replicas_for_primary("i-1", |links| {
                links[0].sync_state = SyncState::Retired;
                links.push(test_link("i-1", "l-2", 20, SyncState::Provisioning));
            })
            .unwrap();

        let links = store.list_replicas_for_primary("i-1").unwrap();
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].sync_state, SyncState::Retired);
        assert_eq!(links[1].sync_state, SyncState::Provisioning);
    }

    // ── Downtime ───────────────────────────────────────────────────

    #[test]
    fn downtime_filtered_by_range_and_cause() {
        let store = StateStore::open_in_memory().unwrap();
        for (id, start, cause) in [
            ("d-1", 100, DowntimeCause::OptimizerFailure),
            ("d-2", 200, DowntimeCause::WorkerCrash),
            ("d-3", 300, DowntimeCause::OptimizerFailure),
        ] {
            store
                .put_downtime(&DowntimeRecord {
                    id: id.to_string(),
                    instance_id: "i-1".to_string(),
                    cause,
                    duration_seconds: 5,
                    window_start: start,
                    window_end: Some(start + 5),
                    detail: None,
                })
                .unwrap();
        }

        assert_eq!(store.list_downtime(0, u64::MAX, None).unwrap().len(), 3);
        assert_eq!(
            store
                .list_downtime(0, u64::MAX, Some(DowntimeCause::OptimizerFailure))
                .unwrap()
                .len(),
            2
        );
        assert_eq!(store.list_downtime(150, 300, None).unwrap().len(), 1);
    }

    #[test]
    fn open_downtime_closed_per_instance() {
        let store = StateStore::open_in_memory().unwrap();
        for (id, instance) in [("d-1", "i-1"), ("d-2", "i-2")] {
            store
                .put_downtime(&DowntimeRecord {
                    id: id.to_string(),
                    instance_id: instance.to_string(),
                    cause: DowntimeCause::WorkerCrash,
                    duration_seconds: 0,
                    window_start: 100,
                    window_end: None,
                    detail: None,
                })
                .unwrap();
        }

        let closed = store.close_open_downtime("i-1", 160).unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].duration_seconds, 60);
        assert_eq!(closed[0].window_end, Some(160));

        let open = store.list_open_downtime().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].instance_id, "i-2");
    }

    // ── Instances & actions ────────────────────────────────────────

    #[test]
    fn instance_update_in_place() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_instance(&InstanceRecord {
                instance_id: "i-1".to_string(),
                tenant_id: "acme".to_string(),
                pool: pool(),
                lifecycle: Lifecycle::Spot,
                last_safe_lifecycle: Lifecycle::Spot,
                protected: false,
                retired: false,
                updated_at: 1,
            })
            .unwrap();

        store
            .update_instance("i-1", |r| r.lifecycle = Lifecycle::OnDemand)
            .unwrap();
        let rec = store.get_instance("i-1").unwrap().unwrap();
        assert_eq!(rec.lifecycle, Lifecycle::OnDemand);
        assert_eq!(rec.last_safe_lifecycle, Lifecycle::Spot);
    }

    #[test]
    fn action_put_and_update() {
        let store = StateStore::open_in_memory().unwrap();
        let key = store
            .put_action(&ActionRecord {
                id: "act-1".to_string(),
                instance_id: "i-1".to_string(),
                decision_id: Some("dec-1".to_string()),
                approval_id: None,
                action: "switch_to_ondemand".to_string(),
                status: ActionStatus::InFlight,
                attempts: 0,
                detail: None,
                created_at: 10,
                updated_at: 10,
            })
            .unwrap();

        store
            .update_action(&key, |a| {
                a.status = ActionStatus::Succeeded;
                a.attempts = 1;
            })
            .unwrap();

        let actions = store.list_actions_for_instance("i-1").unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].status, ActionStatus::Succeeded);
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store
                .append_risk_event(&test_event(&pool(), 100, RiskEventType::TerminationNotice))
                .unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        let events = store.list_risk_events_for_pool(&pool()).unwrap();
        assert_eq!(events.len(), 1);
        // Sequence continues after reopen.
        store
            .append_risk_event(&test_event(&pool(), 100, RiskEventType::TerminationNotice))
            .unwrap();
        assert_eq!(store.list_risk_events_for_pool(&pool()).unwrap().len(), 2);
    }

    // ── Edge cases ─────────────────────────────────────────────────

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.list_pool_entries().unwrap().is_empty());
        assert!(store.list_approvals().unwrap().is_empty());
        assert!(store.list_replicas_for_primary("any").unwrap().is_empty());
        assert!(store.list_downtime(0, u64::MAX, None).unwrap().is_empty());
        assert!(store.list_instances().unwrap().is_empty());
        assert!(store.get_approval("nope").unwrap().is_none());
        assert!(store.close_open_downtime("nope", 1).unwrap().is_empty());
    }
}
