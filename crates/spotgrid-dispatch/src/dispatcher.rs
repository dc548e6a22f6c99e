//! ActuationDispatcher: deliver actions to the agent and reconcile.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::OwnedMutexGuard;
use tracing::{error, info, warn};

use spotgrid_core::SharedClock;
use spotgrid_core::config::DispatchConfig;
use spotgrid_state::{
    ActionRecord, ActionStatus, DowntimeCause, DowntimeRecord, InstanceId, StateStore,
};

use crate::command::{ActionKind, AgentCommand, CommandSigner, ResultingState};
use crate::error::DispatchResult;
use crate::transport::AgentTransport;

/// One action to carry out for an instance.
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub instance_id: InstanceId,
    pub action: ActionKind,
    pub decision_id: Option<String>,
    pub approval_id: Option<String>,
    /// Existing action record to update instead of creating a new one.
    pub action_key: Option<String>,
    /// The action keeps the instance ahead of an interruption.
    pub preventive: bool,
}

impl ActionRequest {
    pub fn new(instance_id: &str, action: ActionKind) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            action,
            decision_id: None,
            approval_id: None,
            action_key: None,
            preventive: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActuationResult {
    Succeeded { state: Option<ResultingState> },
    Failed { reason: String },
    TimedOut,
    /// A newer action for the instance arrived while this one waited.
    Superseded,
}

impl ActuationResult {
    pub fn label(&self) -> &'static str {
        match self {
            ActuationResult::Succeeded { .. } => "succeeded",
            ActuationResult::Failed { .. } => "failed",
            ActuationResult::TimedOut => "timed_out",
            ActuationResult::Superseded => "superseded",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ActuationResult::Succeeded { .. })
    }
}

/// Per-instance serialization point.
#[derive(Debug, Default)]
struct InstanceSlot {
    lock: Arc<tokio::sync::Mutex<()>>,
    /// Bumped by every submission; a waiter that sees a newer value has
    /// been superseded.
    generation: AtomicU64,
}

/// Holds an instance's actuation slot until dropped.
#[must_use = "the slot is released when the guard drops"]
pub struct InstanceGuard {
    _held: OwnedMutexGuard<()>,
}

pub struct ActuationDispatcher {
    store: StateStore,
    clock: SharedClock,
    transport: Arc<dyn AgentTransport>,
    signer: Arc<CommandSigner>,
    config: DispatchConfig,
    slots: DashMap<InstanceId, Arc<InstanceSlot>>,
}

impl ActuationDispatcher {
    pub fn new(
        store: StateStore,
        clock: SharedClock,
        transport: Arc<dyn AgentTransport>,
        signer: Arc<CommandSigner>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            clock,
            transport,
            signer,
            config,
            slots: DashMap::new(),
        }
    }

    /// Whether an action for `instance_id` is running right now.
    pub fn in_flight(&self, instance_id: &str) -> bool {
        self.slots
            .get(instance_id)
            .is_some_and(|slot| slot.lock.try_lock().is_err())
    }

    fn slot(&self, instance_id: &str) -> Arc<InstanceSlot> {
        self.slots
            .entry(instance_id.to_string())
            .or_default()
            .clone()
    }

    /// Take the instance's slot for work that changes the instance outside
    /// `dispatch`, such as promoting its standby. Waits for the action in
    /// flight; actions still queued behind it are superseded.
    pub async fn claim_instance(&self, instance_id: &str) -> InstanceGuard {
        let slot = self.slot(instance_id);
        slot.generation.fetch_add(1, Ordering::SeqCst);
        InstanceGuard {
            _held: Arc::clone(&slot.lock).lock_owned().await,
        }
    }

    /// Deliver `request` and record its outcome.
    ///
    /// Actions for the same instance run one at a time. The returned
    /// result is final: retries have already been spent.
    pub async fn dispatch(&self, request: ActionRequest) -> DispatchResult<ActuationResult> {
        let key = self.open_record(&request)?;

        let slot = self.slot(&request.instance_id);
        let generation = slot.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = slot.lock.lock().await;

        if slot.generation.load(Ordering::SeqCst) != generation {
            self.close_record(&key, ActionStatus::Superseded, Some("newer action submitted"))?;
            warn!(
                instance = %request.instance_id,
                action = request.action.label(),
                "action superseded before dispatch"
            );
            return Ok(ActuationResult::Superseded);
        }

        let result = self.deliver(&request, &key).await?;
        match &result {
            ActuationResult::Succeeded { state } => {
                self.on_success(&request, &key, state.as_ref())?
            }
            _ => self.on_fatal(&request, &key, &result)?,
        }
        Ok(result)
    }

    fn open_record(&self, request: &ActionRequest) -> DispatchResult<String> {
        let now = self.clock.now();
        if let Some(key) = &request.action_key {
            let approval_id = request.approval_id.clone();
            let found = self.store.update_action(key, |r| {
                r.status = ActionStatus::InFlight;
                r.approval_id = r.approval_id.take().or(approval_id);
                r.updated_at = now;
            })?;
            if found.is_some() {
                return Ok(key.clone());
            }
            warn!(key = %key, "action record missing; starting a new one");
        }

        let record = ActionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            instance_id: request.instance_id.clone(),
            decision_id: request.decision_id.clone(),
            approval_id: request.approval_id.clone(),
            action: request.action.label().to_string(),
            status: ActionStatus::InFlight,
            attempts: 0,
            detail: None,
            created_at: now,
            updated_at: now,
        };
        Ok(self.store.put_action(&record)?)
    }

    fn close_record(
        &self,
        key: &str,
        status: ActionStatus,
        detail: Option<&str>,
    ) -> DispatchResult<()> {
        let now = self.clock.now();
        self.store.update_action(key, |r| {
            r.status = status;
            r.detail = detail.map(str::to_string);
            r.updated_at = now;
        })?;
        Ok(())
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.config
            .base_backoff()
            .saturating_mul(factor)
            .min(self.config.max_backoff())
    }

    async fn deliver(&self, request: &ActionRequest, key: &str) -> DispatchResult<ActuationResult> {
        let attempts = self.config.max_retries + 1;
        let timeout = self.config.command_timeout();
        // Retries reuse the command id so the agent can recognise repeats.
        let command_id = uuid::Uuid::new_v4().to_string();
        let mut result = ActuationResult::TimedOut;

        for attempt in 1..=attempts {
            let command = AgentCommand {
                id: command_id.clone(),
                instance_id: request.instance_id.clone(),
                action: request.action.clone(),
                issued_at: self.clock.now(),
            };
            let signed = self.signer.sign(command)?;

            result = match tokio::time::timeout(timeout, self.transport.send(&signed)).await {
                Ok(Ok(ack)) if ack.is_success() => ActuationResult::Succeeded { state: ack.state },
                Ok(Ok(ack)) => ActuationResult::Failed {
                    reason: ack
                        .detail
                        .unwrap_or_else(|| format!("agent answered {:?}", ack.status)),
                },
                Ok(Err(e)) => ActuationResult::Failed {
                    reason: e.to_string(),
                },
                Err(_) => ActuationResult::TimedOut,
            };

            let now = self.clock.now();
            self.store.update_action(key, |r| {
                r.attempts = attempt;
                r.updated_at = now;
            })?;

            if result.is_success() {
                break;
            }
            warn!(
                instance = %request.instance_id,
                action = request.action.label(),
                attempt,
                result = result.label(),
                "actuation attempt failed"
            );
            if attempt < attempts {
                tokio::time::sleep(self.backoff(attempt)).await;
            }
        }
        Ok(result)
    }

    fn on_success(
        &self,
        request: &ActionRequest,
        key: &str,
        state: Option<&ResultingState>,
    ) -> DispatchResult<()> {
        let now = self.clock.now();
        self.close_record(key, ActionStatus::Succeeded, None)?;

        let lifecycle = state
            .and_then(|s| s.lifecycle)
            .or(request.action.target_lifecycle());
        let pool = state.and_then(|s| s.pool.clone()).or(match &request.action {
            ActionKind::SwitchLifecycle { pool, .. } => pool.clone(),
            _ => None,
        });
        if let Some(lifecycle) = lifecycle {
            self.store.update_instance(&request.instance_id, |r| {
                r.lifecycle = lifecycle;
                r.last_safe_lifecycle = lifecycle;
                if let Some(pool) = pool {
                    r.pool = pool;
                }
                r.updated_at = now;
            })?;
        }

        for record in self.store.close_open_downtime(&request.instance_id, now)? {
            info!(
                instance = %record.instance_id,
                cause = record.cause.as_str(),
                duration_seconds = record.duration_seconds,
                "downtime window closed"
            );
        }

        info!(
            instance = %request.instance_id,
            action = request.action.label(),
            "actuation succeeded"
        );
        Ok(())
    }

    fn on_fatal(
        &self,
        request: &ActionRequest,
        key: &str,
        result: &ActuationResult,
    ) -> DispatchResult<()> {
        let now = self.clock.now();
        let reason = match result {
            ActuationResult::Failed { reason } => reason.clone(),
            other => other.label().to_string(),
        };
        let attempts = self.config.max_retries + 1;
        self.close_record(
            key,
            ActionStatus::Failed,
            Some(&format!("{reason} after {attempts} attempts")),
        )?;

        let cause = if request.preventive {
            DowntimeCause::OptimizerFailure
        } else {
            DowntimeCause::WorkerCrash
        };
        let already_open = self
            .store
            .list_open_downtime()?
            .iter()
            .any(|d| d.instance_id == request.instance_id);
        if !already_open {
            self.store.put_downtime(&DowntimeRecord {
                id: uuid::Uuid::new_v4().to_string(),
                instance_id: request.instance_id.clone(),
                cause,
                duration_seconds: 0,
                window_start: now,
                window_end: None,
                detail: Some(format!("{}: {reason}", request.action.label())),
            })?;
        }

        let reverted = self.store.update_instance(&request.instance_id, |r| {
            r.lifecycle = r.last_safe_lifecycle;
            r.updated_at = now;
            r.lifecycle
        })?;

        error!(
            instance = %request.instance_id,
            action = request.action.label(),
            %reason,
            cause = cause.as_str(),
            reverted_to = ?reverted,
            "actuation failed; instance reverted to last safe lifecycle"
        );
        Ok(())
    }
}
