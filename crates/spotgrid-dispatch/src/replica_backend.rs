//! Replica backend that drives provisioning and cutover through the agent.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use spotgrid_core::SharedClock;
use spotgrid_replica::{ProvisionedReplica, ReplicaBackend, ReplicaError, ReplicaResult};
use spotgrid_state::{InstanceRecord, Lifecycle, ReplicaLink};

use crate::command::{ActionKind, AgentCommand, CommandSigner, ResultingState};
use crate::transport::AgentTransport;

pub struct AgentReplicaBackend {
    transport: Arc<dyn AgentTransport>,
    signer: Arc<CommandSigner>,
    clock: SharedClock,
    timeout: Duration,
}

impl AgentReplicaBackend {
    pub fn new(
        transport: Arc<dyn AgentTransport>,
        signer: Arc<CommandSigner>,
        clock: SharedClock,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            signer,
            clock,
            timeout,
        }
    }

    async fn run(&self, instance_id: &str, action: ActionKind) -> ReplicaResult<ResultingState> {
        let label = action.label();
        let command = AgentCommand::new(instance_id, action, self.clock.now());
        let signed = self
            .signer
            .sign(command)
            .map_err(|e| ReplicaError::Backend(e.to_string()))?;

        let ack = tokio::time::timeout(self.timeout, self.transport.send(&signed))
            .await
            .map_err(|_| ReplicaError::Backend(format!("{label} timed out")))?
            .map_err(|e| ReplicaError::Backend(format!("{label}: {e}")))?;

        if !ack.is_success() {
            return Err(ReplicaError::Backend(format!(
                "{label}: {}",
                ack.detail.unwrap_or_else(|| format!("{:?}", ack.status))
            )));
        }
        debug!(instance = instance_id, action = label, "replica step acknowledged");
        Ok(ack.state.unwrap_or_default())
    }
}

#[async_trait]
impl ReplicaBackend for AgentReplicaBackend {
    async fn provision(&self, primary: &InstanceRecord) -> ReplicaResult<ProvisionedReplica> {
        // Standbys run on on-demand capacity.
        let state = self
            .run(
                &primary.instance_id,
                ActionKind::ProvisionReplica {
                    pool: primary.pool.clone(),
                    lifecycle: Lifecycle::OnDemand,
                },
            )
            .await?;
        if state.instance_id.is_empty() || state.instance_id == primary.instance_id {
            return Err(ReplicaError::Backend(
                "agent did not report a replica instance".to_string(),
            ));
        }
        Ok(ProvisionedReplica {
            instance_id: state.instance_id,
            pool: state.pool.unwrap_or_else(|| primary.pool.clone()),
            lifecycle: state.lifecycle.unwrap_or(Lifecycle::OnDemand),
            endpoint: state.endpoint,
        })
    }

    async fn start_sync(&self, link: &ReplicaLink) -> ReplicaResult<()> {
        self.run(
            &link.primary_instance_id,
            ActionKind::StartSync {
                replica_instance_id: link.replica_instance_id.clone(),
            },
        )
        .await
        .map(|_| ())
    }

    async fn redirect_traffic(&self, link: &ReplicaLink) -> ReplicaResult<()> {
        self.run(
            &link.primary_instance_id,
            ActionKind::RedirectTraffic {
                replica_instance_id: link.replica_instance_id.clone(),
            },
        )
        .await
        .map(|_| ())
    }
}
