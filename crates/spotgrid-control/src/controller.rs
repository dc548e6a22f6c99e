//! ControlLoop: telemetry in; decisions, approvals and actions out.
//!
//! One cycle per telemetry sample:
//!
//! ```text
//! validate → upsert instance → ingest notices
//!   → (protected + fresh termination notice) emergency cutover
//!   → evaluate → action?
//!        ├── protected, no ready standby → hold (stay_ondemand)
//!        ├── high/critical               → approval request
//!        ├── protected                   → promote standby
//!        └── otherwise                   → dispatch to agent
//! ```

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use tokio::sync::{Notify, Semaphore, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use spotgrid_approval::{ActionProposal, ApprovalGate};
use spotgrid_core::{InstanceId, SharedClock, SpotgridConfig, Telemetry};
use spotgrid_dispatch::{
    ActionRequest, ActuationDispatcher, ActuationResult, AgentTransport, CommandSigner,
};
use spotgrid_engine::DecisionEngine;
use spotgrid_metrics::ControlMetrics;
use spotgrid_predictor::SharedPredictor;
use spotgrid_replica::{
    CutoverOutcome, CutoverTrigger, ReplicaBackend, ReplicaCoordinator, ReplicaProbe,
};
use spotgrid_risk::{NoticeIngestor, RiskRegistry};
use spotgrid_state::{
    ActionRecord, ActionStatus, ApprovalStatus, Decision, DecisionType, InstanceRecord,
    RiskEventType, StateStore,
};

use crate::payload::ActionPayload;

/// External capabilities the loop is wired to.
pub struct Collaborators {
    pub predictor: SharedPredictor,
    pub transport: Arc<dyn AgentTransport>,
    pub signer: Arc<CommandSigner>,
    pub replica_backend: Arc<dyn ReplicaBackend>,
    pub replica_probe: Arc<dyn ReplicaProbe>,
}

/// What happened to a decision's action.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    /// The decision keeps the instance where it is.
    None,
    /// The instance is already on the decided lifecycle and pool.
    AlreadyThere,
    AwaitingApproval { approval_id: String },
    Dispatched(ActuationResult),
    CutOver { replica: InstanceId },
    /// Cutover needed but no standby was ready; nothing moved.
    Held { downgraded: Decision },
    /// The instance was retired before the action could run.
    Discarded,
}

/// Result of one telemetry cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Malformed sample; nothing was read or written.
    Rejected { reason: String },
    /// The instance was replaced by its replica.
    Retired,
    /// A termination notice cut the instance over to its standby.
    EmergencyCutover { replica: InstanceId },
    Decided {
        decision: Decision,
        action: ActionOutcome,
    },
}

pub struct ControlLoop {
    store: StateStore,
    clock: SharedClock,
    registry: Arc<RiskRegistry>,
    ingestor: NoticeIngestor,
    engine: DecisionEngine,
    gate: ApprovalGate,
    replicas: Arc<ReplicaCoordinator>,
    dispatcher: Arc<ActuationDispatcher>,
    metrics: Arc<ControlMetrics>,
    /// Primaries with a standby preparation in progress.
    preparing: Arc<DashSet<InstanceId>>,
    /// Wakes the run loop to dispatch freshly approved requests.
    approved: Arc<Notify>,
    config: SpotgridConfig,
}

impl ControlLoop {
    /// Build every subsystem from config. The registry is hydrated from
    /// the event log so poisoning survives restarts.
    pub fn assemble(
        config: &SpotgridConfig,
        store: StateStore,
        clock: SharedClock,
        collaborators: Collaborators,
    ) -> anyhow::Result<Self> {
        let registry = Arc::new(RiskRegistry::hydrated(
            store.clone(),
            clock.clone(),
            &config.registry,
        )?);
        let ingestor = NoticeIngestor::new(registry.clone());
        let engine = DecisionEngine::new(
            store.clone(),
            registry.clone(),
            collaborators.predictor,
            clock.clone(),
            config.engine.clone(),
        );
        let gate = ApprovalGate::new(store.clone(), clock.clone(), config.approval.clone());
        let replicas = Arc::new(ReplicaCoordinator::new(
            store.clone(),
            clock.clone(),
            collaborators.replica_backend,
            collaborators.replica_probe,
            config.replica.clone(),
        ));
        let dispatcher = Arc::new(ActuationDispatcher::new(
            store.clone(),
            clock.clone(),
            collaborators.transport,
            collaborators.signer,
            config.dispatch.clone(),
        ));

        Ok(Self {
            store,
            clock,
            registry,
            ingestor,
            engine,
            gate,
            replicas,
            dispatcher,
            metrics: Arc::new(ControlMetrics::new()),
            preparing: Arc::new(DashSet::new()),
            approved: Arc::new(Notify::new()),
            config: config.clone(),
        })
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn registry(&self) -> &Arc<RiskRegistry> {
        &self.registry
    }

    pub fn gate(&self) -> &ApprovalGate {
        &self.gate
    }

    pub fn replicas(&self) -> &Arc<ReplicaCoordinator> {
        &self.replicas
    }

    pub fn dispatcher(&self) -> &Arc<ActuationDispatcher> {
        &self.dispatcher
    }

    pub fn metrics(&self) -> &Arc<ControlMetrics> {
        &self.metrics
    }

    /// Notify this after approving a request to dispatch it without
    /// waiting for the next approval sweep.
    pub fn approval_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.approved)
    }

    // ── Cycle ─────────────────────────────────────────────────────

    /// Run one full cycle for a telemetry sample.
    pub async fn handle_telemetry(&self, telemetry: Telemetry) -> anyhow::Result<CycleOutcome> {
        if let Err(e) = telemetry.validate() {
            self.metrics.record_telemetry(false);
            warn!(instance = %telemetry.instance_id, error = %e, "telemetry rejected");
            return Ok(CycleOutcome::Rejected {
                reason: e.to_string(),
            });
        }
        self.metrics.record_telemetry(true);

        let Some(instance) = self.upsert_instance(&telemetry)? else {
            debug!(instance = %telemetry.instance_id, "telemetry for retired instance ignored");
            return Ok(CycleOutcome::Retired);
        };

        let ingested = self.ingestor.ingest(&telemetry)?;
        self.metrics.record_notices(ingested.len() as u64);

        let fresh_termination = ingested
            .iter()
            .any(|n| n.kind == RiskEventType::TerminationNotice);
        if instance.protected && fresh_termination {
            // The provider is reclaiming the instance: no time to ask.
            let _slot = self.dispatcher.claim_instance(&instance.instance_id).await;
            let outcome = self
                .replicas
                .promote(&instance.instance_id, CutoverTrigger::InterruptionNotice)
                .await?;
            if let CutoverOutcome::Promoted {
                link,
                downtime_seconds,
                ..
            } = outcome
            {
                self.metrics.record_cutover(true);
                self.upsert_action(
                    None,
                    &instance.instance_id,
                    None,
                    None,
                    "emergency_cutover",
                    ActionStatus::Succeeded,
                    Some(format!(
                        "promoted {} after {downtime_seconds}s",
                        link.replica_instance_id
                    )),
                )?;
                return Ok(CycleOutcome::EmergencyCutover {
                    replica: link.replica_instance_id,
                });
            }
        }

        self.maintain_standby(&instance)?;

        let decision = self.engine.evaluate(&telemetry).await?;
        self.metrics.record_decision(decision.decision_type);

        let action = self.act(&instance, &decision).await?;
        Ok(CycleOutcome::Decided { decision, action })
    }

    /// Record what telemetry says about the instance. Returns `None` for
    /// retired instances.
    fn upsert_instance(&self, telemetry: &Telemetry) -> anyhow::Result<Option<InstanceRecord>> {
        let now = self.clock.now();
        let updated = self
            .store
            .update_instance(&telemetry.instance_id, |r| {
                if r.retired {
                    return None;
                }
                if !telemetry.tenant_id.is_empty() {
                    r.tenant_id = telemetry.tenant_id.clone();
                }
                r.pool = telemetry.current_pool.clone();
                r.lifecycle = telemetry.lifecycle;
                r.protected = telemetry.protected;
                r.updated_at = now;
                Some(r.clone())
            })?;

        match updated {
            Some(record) => Ok(record),
            None => {
                let record = InstanceRecord {
                    instance_id: telemetry.instance_id.clone(),
                    tenant_id: telemetry.tenant_id.clone(),
                    pool: telemetry.current_pool.clone(),
                    lifecycle: telemetry.lifecycle,
                    last_safe_lifecycle: telemetry.lifecycle,
                    protected: telemetry.protected,
                    retired: false,
                    updated_at: now,
                };
                self.store.put_instance(&record)?;
                info!(
                    instance = %record.instance_id,
                    pool = %record.pool,
                    protected = record.protected,
                    "instance registered"
                );
                Ok(Some(record))
            }
        }
    }

    /// Keep a standby warming for protected instances and drop it for
    /// the rest. Preparation runs in the background.
    fn maintain_standby(&self, instance: &InstanceRecord) -> anyhow::Result<()> {
        let id = &instance.instance_id;
        if instance.protected {
            if self.preparing.contains(id) || self.replicas.has_ready_replica(id)? {
                return Ok(());
            }
            self.preparing.insert(id.clone());
            let replicas = Arc::clone(&self.replicas);
            let preparing = Arc::clone(&self.preparing);
            let record = instance.clone();
            tokio::spawn(async move {
                if let Err(e) = replicas.prepare(&record).await {
                    warn!(instance = %record.instance_id, error = %e, "standby preparation failed");
                }
                preparing.remove(&record.instance_id);
            });
        } else if self.replicas.standby(id)?.is_some() {
            let replicas = Arc::clone(&self.replicas);
            let id = id.clone();
            tokio::spawn(async move {
                if let Err(e) = replicas.retire_standby(&id).await {
                    warn!(instance = %id, error = %e, "standby retirement failed");
                }
            });
        }
        Ok(())
    }

    async fn act(
        &self,
        instance: &InstanceRecord,
        decision: &Decision,
    ) -> anyhow::Result<ActionOutcome> {
        let Some(payload) = ActionPayload::for_decision(decision, instance) else {
            return Ok(if decision.decision_type.is_switch() {
                debug!(
                    instance = %instance.instance_id,
                    decision = decision.decision_type.as_str(),
                    "already on target, nothing to do"
                );
                ActionOutcome::AlreadyThere
            } else {
                ActionOutcome::None
            });
        };

        if payload.needs_cutover(instance)
            && !self.replicas.has_ready_replica(&instance.instance_id)?
        {
            return self.hold(&instance.instance_id, Some(decision.clone()), None, None);
        }

        if self.gate.classify(payload.impact).requires_approval() {
            return self.park(instance, decision, &payload);
        }

        self.execute(
            &instance.instance_id,
            payload,
            Some(decision.id.clone()),
            None,
            None,
        )
        .await
    }

    /// Submit an approval request, unless one for the same action is
    /// already pending.
    fn park(
        &self,
        instance: &InstanceRecord,
        decision: &Decision,
        payload: &ActionPayload,
    ) -> anyhow::Result<ActionOutcome> {
        let value = serde_json::to_value(payload)?;
        let pending = self.gate.list(Some(ApprovalStatus::Pending))?;
        if let Some(existing) = pending.into_iter().find(|r| {
            r.instance_id.as_deref() == Some(instance.instance_id.as_str()) && r.payload == value
        }) {
            debug!(
                instance = %instance.instance_id,
                approval = %existing.id,
                "action already awaiting approval"
            );
            return Ok(ActionOutcome::AwaitingApproval {
                approval_id: existing.id,
            });
        }

        let key = self.upsert_action(
            None,
            &instance.instance_id,
            Some(decision.id.clone()),
            None,
            payload.action.label(),
            ActionStatus::AwaitingApproval,
            None,
        )?;
        let request = self.gate.submit(ActionProposal {
            impact: payload.impact,
            instance_id: Some(instance.instance_id.clone()),
            decision_id: Some(decision.id.clone()),
            payload: value,
            action_key: Some(key.clone()),
        })?;
        let approval_id = request.id.clone();
        self.store
            .update_action(&key, |a| a.approval_id = Some(approval_id))?;
        self.metrics.record_approval_submitted();

        Ok(ActionOutcome::AwaitingApproval {
            approval_id: request.id,
        })
    }

    /// Carry out an action that needs no (further) approval.
    async fn execute(
        &self,
        instance_id: &str,
        payload: ActionPayload,
        decision_id: Option<String>,
        approval_id: Option<String>,
        action_key: Option<String>,
    ) -> anyhow::Result<ActionOutcome> {
        let Some(instance) = self.store.get_instance(instance_id)? else {
            anyhow::bail!("unknown instance {instance_id}");
        };
        if instance.retired {
            self.upsert_action(
                action_key,
                instance_id,
                decision_id,
                approval_id,
                payload.action.label(),
                ActionStatus::Discarded,
                Some("instance retired".to_string()),
            )?;
            return Ok(ActionOutcome::Discarded);
        }

        if payload.needs_cutover(&instance) {
            return self
                .cutover(instance_id, payload.action.label(), decision_id, approval_id, action_key)
                .await;
        }

        let result = self
            .dispatcher
            .dispatch(ActionRequest {
                instance_id: instance_id.to_string(),
                action: payload.action,
                decision_id,
                approval_id,
                action_key,
                preventive: payload.preventive,
            })
            .await?;
        self.metrics.record_actuation(result.label());
        Ok(ActionOutcome::Dispatched(result))
    }

    async fn cutover(
        &self,
        instance_id: &str,
        label: &str,
        decision_id: Option<String>,
        approval_id: Option<String>,
        action_key: Option<String>,
    ) -> anyhow::Result<ActionOutcome> {
        let _slot = self.dispatcher.claim_instance(instance_id).await;
        match self
            .replicas
            .promote(instance_id, CutoverTrigger::Decision)
            .await?
        {
            CutoverOutcome::Promoted { link, .. } => {
                self.metrics.record_cutover(true);
                self.upsert_action(
                    action_key,
                    instance_id,
                    decision_id,
                    approval_id,
                    label,
                    ActionStatus::Succeeded,
                    Some(format!("cut over to {}", link.replica_instance_id)),
                )?;
                Ok(ActionOutcome::CutOver {
                    replica: link.replica_instance_id,
                })
            }
            CutoverOutcome::NoReadyReplica { .. } => {
                let basis = match decision_id.as_deref() {
                    Some(id) => self.store.find_decision(instance_id, id)?,
                    None => self.store.latest_decision(instance_id)?,
                };
                self.hold(instance_id, basis, action_key, approval_id)
            }
        }
    }

    /// Downgrade an unsafe cutover: persist a `stay_ondemand` decision
    /// and mark the action held. No downtime is recorded.
    fn hold(
        &self,
        instance_id: &str,
        basis: Option<Decision>,
        action_key: Option<String>,
        approval_id: Option<String>,
    ) -> anyhow::Result<ActionOutcome> {
        let now = self.clock.now();
        let Some(basis) = basis else {
            anyhow::bail!("no decision to downgrade for {instance_id}");
        };
        let downgraded = Decision {
            id: uuid::Uuid::new_v4().to_string(),
            decision_type: DecisionType::StayOndemand,
            reason: format!("cutover held, no ready replica ({})", basis.reason),
            evaluated_at: now,
            target_pool: None,
            ..basis.clone()
        };
        self.store.put_decision(&downgraded)?;
        self.metrics.record_decision(DecisionType::StayOndemand);
        self.metrics.record_cutover(false);

        self.upsert_action(
            action_key,
            instance_id,
            Some(basis.id.clone()),
            approval_id,
            DecisionType::SwitchToOndemand.as_str(),
            ActionStatus::Held,
            Some("no ready replica".to_string()),
        )?;

        error!(
            instance = instance_id,
            decision = %basis.id,
            "cutover required but no ready replica; holding"
        );
        Ok(ActionOutcome::Held { downgraded })
    }

    #[allow(clippy::too_many_arguments)]
    fn upsert_action(
        &self,
        key: Option<String>,
        instance_id: &str,
        decision_id: Option<String>,
        approval_id: Option<String>,
        label: &str,
        status: ActionStatus,
        detail: Option<String>,
    ) -> anyhow::Result<String> {
        let now = self.clock.now();
        if let Some(key) = key {
            let found = self.store.update_action(&key, |a| {
                a.status = status;
                a.detail = detail.clone();
                if a.approval_id.is_none() {
                    a.approval_id = approval_id.clone();
                }
                a.updated_at = now;
            })?;
            if found.is_some() {
                return Ok(key);
            }
        }
        Ok(self.store.put_action(&ActionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            instance_id: instance_id.to_string(),
            decision_id,
            approval_id,
            action: label.to_string(),
            status,
            attempts: 0,
            detail,
            created_at: now,
            updated_at: now,
        })?)
    }

    // ── Approvals ─────────────────────────────────────────────────

    /// Execute every approved request not yet dispatched. Each request
    /// is claimed exactly once, so overlapping pumps are harmless.
    pub async fn pump_approved(&self) -> anyhow::Result<Vec<(String, ActionOutcome)>> {
        let mut executed = Vec::new();
        for request in self.gate.claim_approved()? {
            let Some(instance_id) = request.instance_id.clone() else {
                warn!(approval = %request.id, "approved request without an instance");
                continue;
            };
            let payload: ActionPayload = match serde_json::from_value(request.payload.clone()) {
                Ok(payload) => payload,
                Err(e) => {
                    error!(approval = %request.id, error = %e, "approved payload unreadable");
                    if let Some(key) = &request.action_key {
                        self.store.update_action(key, |a| {
                            a.status = ActionStatus::Failed;
                            a.detail = Some(format!("unreadable payload: {e}"));
                        })?;
                    }
                    continue;
                }
            };

            info!(approval = %request.id, instance = %instance_id, "executing approved action");
            match self
                .execute(
                    &instance_id,
                    payload,
                    request.decision_id.clone(),
                    Some(request.id.clone()),
                    request.action_key.clone(),
                )
                .await
            {
                Ok(outcome) => executed.push((request.id, outcome)),
                Err(e) => {
                    error!(approval = %request.id, error = %e, "approved action failed");
                    if let Some(key) = &request.action_key {
                        let now = self.clock.now();
                        self.store.update_action(key, |a| {
                            a.status = ActionStatus::Failed;
                            a.detail = Some(e.to_string());
                            a.updated_at = now;
                        })?;
                    }
                }
            }
        }
        Ok(executed)
    }

    /// Registry and approval housekeeping. Correctness never depends on it.
    pub fn housekeeping(&self) {
        match self.registry.sweep() {
            Ok(report) => debug!(
                pools = report.pools,
                pruned = report.pruned_events,
                poisoned = report.poisoned,
                "registry sweep"
            ),
            Err(e) => error!(error = %e, "registry sweep failed"),
        }
        if let Err(e) = self.gate.sweep() {
            error!(error = %e, "approval sweep failed");
        }
    }

    // ── Run loop ──────────────────────────────────────────────────

    /// Consume telemetry until the channel closes or `shutdown` flips.
    ///
    /// Cycles run concurrently, at most `engine.workers` at a time; a
    /// full pool applies backpressure to the telemetry channel. Cycles and
    /// pumps already started are awaited before returning.
    pub async fn run(
        self: Arc<Self>,
        mut telemetry: mpsc::Receiver<Telemetry>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let permits = Arc::new(Semaphore::new(self.config.engine.workers.max(1)));
        let floor = Duration::from_secs(1);
        let mut registry_tick =
            tokio::time::interval(self.config.registry.sweep_interval().max(floor));
        let mut approval_tick =
            tokio::time::interval(self.config.approval.sweep_interval().max(floor));

        let approved = Arc::clone(&self.approved);
        let mut tasks = JoinSet::new();

        info!(workers = self.config.engine.workers, "control loop started");

        loop {
            tokio::select! {
                sample = telemetry.recv() => {
                    let Some(sample) = sample else {
                        info!("telemetry channel closed");
                        break;
                    };
                    let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                        break;
                    };
                    let this = Arc::clone(&self);
                    tasks.spawn(async move {
                        let _permit = permit;
                        let instance = sample.instance_id.clone();
                        if let Err(e) = this.handle_telemetry(sample).await {
                            error!(%instance, error = %e, "control cycle failed");
                        }
                    });
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "control task panicked");
                    }
                }
                _ = registry_tick.tick() => {
                    self.housekeeping();
                }
                _ = approval_tick.tick() => {
                    tasks.spawn(Arc::clone(&self).pump());
                }
                _ = approved.notified() => {
                    tasks.spawn(Arc::clone(&self).pump());
                }
                _ = shutdown.changed() => {
                    info!("control loop shutting down");
                    break;
                }
            }
        }

        if !tasks.is_empty() {
            info!(pending = tasks.len(), "waiting for in-flight cycles");
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "control task panicked");
            }
        }
        info!("control loop stopped");
    }

    async fn pump(self: Arc<Self>) {
        if let Err(e) = self.pump_approved().await {
            error!(error = %e, "approval pump failed");
        }
    }
}
