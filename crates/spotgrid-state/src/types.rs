//! Domain types for the SpotGrid state store.
//!
//! These types are the persisted records of the control loop: the
//! interruption ledger, per-pool registry entries, decisions, approval
//! requests, replica links, downtime windows, instance lifecycle and
//! the action audit trail. All types are serializable to/from JSON for
//! storage in redb tables.

use serde::{Deserialize, Serialize};

pub use spotgrid_core::{InstanceId, Lifecycle, PoolKey, RiskEventType, TenantId};

// ── Risk ──────────────────────────────────────────────────────────

/// Append-only interruption fact. Never mutated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskEvent {
    pub id: String,
    pub pool: PoolKey,
    pub event_type: RiskEventType,
    pub tenant_id: TenantId,
    pub instance_id: Option<InstanceId>,
    /// Provider notice id, when the event came from a telemetry notice.
    pub notice_id: Option<String>,
    /// Unix timestamp (seconds) the event was reported.
    pub reported_at: u64,
    /// `reported_at` plus the cooldown window.
    pub expires_at: u64,
}

impl RiskEvent {
    /// An event counts toward its pool's window while `now < expires_at`.
    pub fn is_active(&self, now: u64) -> bool {
        now < self.expires_at
    }
}

/// Persisted view of one pool's registry state.
///
/// `is_poisoned` reflects the state when the entry was last written;
/// readers must re-derive it from `poison_expires_at`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskRegistryEntry {
    pub pool: PoolKey,
    pub interruption_count: u32,
    pub is_poisoned: bool,
    pub poison_expires_at: Option<u64>,
    pub updated_at: u64,
}

// ── Decisions ─────────────────────────────────────────────────────

/// Lifecycle decision produced by one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionType {
    StaySpot,
    SwitchToSpot,
    SwitchToOndemand,
    StayOndemand,
}

impl DecisionType {
    pub fn as_str(self) -> &'static str {
        match self {
            DecisionType::StaySpot => "stay_spot",
            DecisionType::SwitchToSpot => "switch_to_spot",
            DecisionType::SwitchToOndemand => "switch_to_ondemand",
            DecisionType::StayOndemand => "stay_ondemand",
        }
    }

    /// Lifecycle the instance should end up on.
    pub fn target_lifecycle(self) -> Lifecycle {
        match self {
            DecisionType::StaySpot | DecisionType::SwitchToSpot => Lifecycle::Spot,
            DecisionType::SwitchToOndemand | DecisionType::StayOndemand => Lifecycle::OnDemand,
        }
    }

    pub fn is_switch(self) -> bool {
        matches!(
            self,
            DecisionType::SwitchToSpot | DecisionType::SwitchToOndemand
        )
    }

    /// The decision that keeps an instance where it is.
    pub fn hold(lifecycle: Lifecycle) -> Self {
        match lifecycle {
            Lifecycle::Spot => DecisionType::StaySpot,
            Lifecycle::OnDemand => DecisionType::StayOndemand,
        }
    }
}

/// Predictor output captured at decision time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PredictorSnapshot {
    pub risk_score: f64,
    pub price_trend: f64,
    pub confidence: f64,
    pub recommended_pool: Option<PoolKey>,
}

/// Inputs the engine saw when it decided.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeatureSnapshot {
    pub pool: PoolKey,
    pub lifecycle: Lifecycle,
    pub utilization: f64,
    pub current_price: f64,
    pub pool_poisoned: bool,
    pub poison_expires_at: Option<u64>,
    pub interruption_count: u32,
    pub notice_count: u32,
    pub predictor: Option<PredictorSnapshot>,
}

/// Immutable result of one evaluation cycle for one instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub id: String,
    pub instance_id: InstanceId,
    pub decision_type: DecisionType,
    /// 0.0–1.0
    pub risk_score: f64,
    /// 0.0–1.0
    pub confidence: f64,
    pub features_snapshot: FeatureSnapshot,
    pub reason: String,
    /// Pool to move to for `switch_to_spot`.
    pub target_pool: Option<PoolKey>,
    pub evaluated_at: u64,
}

// ── Approvals ─────────────────────────────────────────────────────

/// Kind of action held behind an approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalActionType {
    SwitchInstance,
    TerminateRogue,
    DeleteWaste,
}

/// Coarse severity that decides whether an action needs approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn requires_approval(self) -> bool {
        matches!(self, RiskLevel::High | RiskLevel::Critical)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl ApprovalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(self) -> bool {
        self != ApprovalStatus::Pending
    }
}

/// A high-impact action waiting for a human.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovalRequest {
    pub id: String,
    pub action_type: ApprovalActionType,
    pub risk_level: RiskLevel,
    pub instance_id: Option<InstanceId>,
    pub decision_id: Option<String>,
    /// Opaque action parameters, replayed on approval.
    pub payload: serde_json::Value,
    pub status: ApprovalStatus,
    pub requested_at: u64,
    pub expires_at: u64,
    pub resolved_at: Option<u64>,
    pub resolved_by: Option<String>,
    pub note: Option<String>,
    /// Set once when the approved action is claimed for execution.
    pub dispatched_at: Option<u64>,
    /// Key of the action record waiting on this request.
    #[serde(default)]
    pub action_key: Option<String>,
}

// ── Replicas ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Provisioning,
    Syncing,
    Ready,
    Promoted,
    Retired,
}

impl SyncState {
    /// States that count as the primary's standby.
    pub fn is_standby(self) -> bool {
        matches!(
            self,
            SyncState::Provisioning | SyncState::Syncing | SyncState::Ready
        )
    }

    /// Forward-only transitions; anything can be retired before promotion.
    pub fn can_transition_to(self, next: SyncState) -> bool {
        use SyncState::*;
        matches!(
            (self, next),
            (Provisioning, Syncing)
                | (Syncing, Ready)
                | (Ready, Promoted)
                | (Provisioning, Retired)
                | (Syncing, Retired)
                | (Ready, Retired)
        )
    }
}

/// Standby relation between a primary and its replica. Neither side
/// owns the other; lookups go through the coordinator's index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplicaLink {
    pub id: String,
    pub primary_instance_id: InstanceId,
    pub replica_instance_id: InstanceId,
    pub pool: PoolKey,
    pub lifecycle: Lifecycle,
    pub sync_state: SyncState,
    /// `host:port` the replica answers health checks on.
    #[serde(default)]
    pub endpoint: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

// ── Downtime ──────────────────────────────────────────────────────

/// Self-caused outage causes. Provider outages are never recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DowntimeCause {
    EmergencySwitch,
    NoReplica,
    OptimizerFailure,
    WorkerCrash,
}

impl DowntimeCause {
    pub fn as_str(self) -> &'static str {
        match self {
            DowntimeCause::EmergencySwitch => "emergency_switch",
            DowntimeCause::NoReplica => "no_replica",
            DowntimeCause::OptimizerFailure => "optimizer_failure",
            DowntimeCause::WorkerCrash => "worker_crash",
        }
    }
}

/// SLA downtime window. Open while `window_end` is `None`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DowntimeRecord {
    pub id: String,
    pub instance_id: InstanceId,
    pub cause: DowntimeCause,
    pub duration_seconds: u64,
    pub window_start: u64,
    pub window_end: Option<u64>,
    pub detail: Option<String>,
}

impl DowntimeRecord {
    pub fn is_open(&self) -> bool {
        self.window_end.is_none()
    }

    /// Close the window at `at` and fix its duration.
    pub fn close(&mut self, at: u64) {
        let end = at.max(self.window_start);
        self.window_end = Some(end);
        self.duration_seconds = end - self.window_start;
    }
}

// ── Instances ─────────────────────────────────────────────────────

/// Lifecycle bookkeeping for a managed instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceRecord {
    pub instance_id: InstanceId,
    pub tenant_id: TenantId,
    pub pool: PoolKey,
    pub lifecycle: Lifecycle,
    /// Lifecycle the instance last ran on after a successful actuation.
    pub last_safe_lifecycle: Lifecycle,
    pub protected: bool,
    /// Set when the instance was replaced by a promoted replica.
    pub retired: bool,
    pub updated_at: u64,
}

// ── Actions ───────────────────────────────────────────────────────

/// Terminal (or in-flight) status of an actionable decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    InFlight,
    Succeeded,
    Failed,
    Held,
    AwaitingApproval,
    Discarded,
    Superseded,
}

impl ActionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionStatus::InFlight => "in_flight",
            ActionStatus::Succeeded => "succeeded",
            ActionStatus::Failed => "failed",
            ActionStatus::Held => "held",
            ActionStatus::AwaitingApproval => "awaiting_approval",
            ActionStatus::Discarded => "discarded",
            ActionStatus::Superseded => "superseded",
        }
    }
}

/// Audit record for one action derived from a decision or approval.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionRecord {
    pub id: String,
    pub instance_id: InstanceId,
    pub decision_id: Option<String>,
    pub approval_id: Option<String>,
    /// Short action label, e.g. "switch_to_ondemand".
    pub action: String,
    pub status: ActionStatus,
    pub attempts: u32,
    pub detail: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

// ── Keys ──────────────────────────────────────────────────────────

impl RiskRegistryEntry {
    /// Build the key for the pools table.
    pub fn table_key(&self) -> String {
        self.pool.table_key()
    }
}

impl ReplicaLink {
    /// Build the composite key for the replicas table.
    pub fn table_key(&self) -> String {
        format!("{}|{}", self.primary_instance_id, self.id)
    }
}

impl DowntimeRecord {
    /// Build the composite key for the downtime table.
    pub fn table_key(&self) -> String {
        format!("{:020}|{}", self.window_start, self.id)
    }
}
