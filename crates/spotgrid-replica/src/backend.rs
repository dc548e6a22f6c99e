//! Seams to the machinery that actually runs replicas.

use async_trait::async_trait;

use spotgrid_state::{InstanceId, InstanceRecord, Lifecycle, PoolKey, ReplicaLink};

use crate::error::ReplicaResult;
use crate::readiness::ProbeResult;

/// A standby the backend launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedReplica {
    pub instance_id: InstanceId,
    pub pool: PoolKey,
    pub lifecycle: Lifecycle,
    /// `host:port` for health checks, when known at launch.
    pub endpoint: Option<String>,
}

/// Launches replicas and moves traffic between instances.
#[async_trait]
pub trait ReplicaBackend: Send + Sync {
    /// Launch a standby for `primary`.
    async fn provision(&self, primary: &InstanceRecord) -> ReplicaResult<ProvisionedReplica>;

    /// Begin copying the primary's state to the replica.
    async fn start_sync(&self, link: &ReplicaLink) -> ReplicaResult<()>;

    /// Point traffic and registration at the replica.
    async fn redirect_traffic(&self, link: &ReplicaLink) -> ReplicaResult<()>;
}

/// Health check run against a replica before it may become ready.
#[async_trait]
pub trait ReplicaProbe: Send + Sync {
    async fn probe(&self, link: &ReplicaLink) -> ProbeResult;
}
