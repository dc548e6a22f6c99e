//! redb table definitions for the SpotGrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).
//! Timestamps inside keys are zero-padded to 20 digits so lexical order is
//! chronological order.

use redb::TableDefinition;

/// Monotonic counters keyed by name.
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Risk events keyed by `{pool}|{reported_at}|{seq}`. Append-only.
pub const RISK_EVENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("risk_events");

/// Notices already reported, keyed by `{instance_id}|{notice_id}`.
pub const NOTICES: TableDefinition<&str, u64> = TableDefinition::new("notices");

/// Registry entries keyed by `{region}/{zone}/{family}`.
pub const POOLS: TableDefinition<&str, &[u8]> = TableDefinition::new("pools");

/// Decisions keyed by `{instance_id}|{evaluated_at}|{seq}`. Insert-only.
pub const DECISIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("decisions");

/// Approval requests keyed by request id.
pub const APPROVALS: TableDefinition<&str, &[u8]> = TableDefinition::new("approvals");

/// Replica links keyed by `{primary_instance_id}|{link_id}`.
pub const REPLICAS: TableDefinition<&str, &[u8]> = TableDefinition::new("replicas");

/// Downtime windows keyed by `{window_start}|{id}`.
pub const DOWNTIME: TableDefinition<&str, &[u8]> = TableDefinition::new("downtime");

/// Instance records keyed by instance id.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Action records keyed by `{instance_id}|{created_at}|{seq}`.
pub const ACTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("actions");
