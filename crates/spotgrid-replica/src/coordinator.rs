//! ReplicaCoordinator: prepare and promote standbys per primary.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use spotgrid_core::SharedClock;
use spotgrid_core::config::ReplicaConfig;
use spotgrid_state::{
    DowntimeCause, DowntimeRecord, InstanceId, InstanceRecord, ReplicaLink, StateStore, SyncState,
};

use crate::backend::{ReplicaBackend, ReplicaProbe};
use crate::error::{ReplicaError, ReplicaResult};
use crate::readiness::ReadinessTracker;

/// Why a cutover was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CutoverTrigger {
    /// A switch decision for the primary.
    Decision,
    /// An interruption notice arrived for the primary.
    InterruptionNotice,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CutoverOutcome {
    /// The replica is serving.
    Promoted {
        link: ReplicaLink,
        /// Trigger to serving, in seconds.
        downtime_seconds: u64,
        /// Written for emergency cutovers.
        downtime: Option<DowntimeRecord>,
    },
    /// Nothing was promoted; `standby` is the state of the standby, if any.
    NoReadyReplica { standby: Option<SyncState> },
}

pub struct ReplicaCoordinator {
    store: StateStore,
    clock: SharedClock,
    backend: Arc<dyn ReplicaBackend>,
    probe: Arc<dyn ReplicaProbe>,
    config: ReplicaConfig,
    locks: DashMap<InstanceId, Arc<Mutex<()>>>,
}

impl ReplicaCoordinator {
    pub fn new(
        store: StateStore,
        clock: SharedClock,
        backend: Arc<dyn ReplicaBackend>,
        probe: Arc<dyn ReplicaProbe>,
        config: ReplicaConfig,
    ) -> Self {
        Self {
            store,
            clock,
            backend,
            probe,
            config,
            locks: DashMap::new(),
        }
    }

    async fn lock(&self, primary_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(primary_id.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    /// Every link recorded for a primary, oldest first.
    pub fn links(&self, primary_id: &str) -> ReplicaResult<Vec<ReplicaLink>> {
        Ok(self.store.list_replicas_for_primary(primary_id)?)
    }

    /// The primary's standby (provisioning, syncing or ready), if any.
    pub fn standby(&self, primary_id: &str) -> ReplicaResult<Option<ReplicaLink>> {
        Ok(self
            .links(primary_id)?
            .into_iter()
            .find(|l| l.sync_state.is_standby()))
    }

    pub fn has_ready_replica(&self, primary_id: &str) -> ReplicaResult<bool> {
        Ok(self
            .standby(primary_id)?
            .is_some_and(|l| l.sync_state == SyncState::Ready))
    }

    /// Bring the primary's standby to `ready`, provisioning one if needed.
    pub async fn prepare(&self, primary: &InstanceRecord) -> ReplicaResult<ReplicaLink> {
        let _guard = self.lock(&primary.instance_id).await;

        let link = match self.standby(&primary.instance_id)? {
            Some(link) if link.sync_state == SyncState::Ready => return Ok(link),
            Some(link) => link,
            None => self.provision(primary).await?,
        };

        let link = if link.sync_state == SyncState::Provisioning {
            self.backend.start_sync(&link).await?;
            self.transition(&link, SyncState::Syncing)?
        } else {
            link
        };

        self.await_ready(link).await
    }

    async fn provision(&self, primary: &InstanceRecord) -> ReplicaResult<ReplicaLink> {
        let replica = self.backend.provision(primary).await?;
        let now = self.clock.now();
        let link = ReplicaLink {
            id: uuid::Uuid::new_v4().to_string(),
            primary_instance_id: primary.instance_id.clone(),
            replica_instance_id: replica.instance_id,
            pool: replica.pool,
            lifecycle: replica.lifecycle,
            sync_state: SyncState::Provisioning,
            endpoint: replica.endpoint,
            created_at: now,
            updated_at: now,
        };

        let inserted = self
            .store
            .update_replicas_for_primary(&primary.instance_id, |links| {
                if links.iter().any(|l| l.sync_state.is_standby()) {
                    false
                } else {
                    links.push(link.clone());
                    true
                }
            })?;
        if !inserted {
            return Err(ReplicaError::StandbyExists(primary.instance_id.clone()));
        }

        info!(
            primary = %link.primary_instance_id,
            replica = %link.replica_instance_id,
            pool = %link.pool,
            "replica provisioning"
        );
        Ok(link)
    }

    async fn await_ready(&self, link: ReplicaLink) -> ReplicaResult<ReplicaLink> {
        let mut tracker = ReadinessTracker::new(&self.config);
        let attempts = self.config.max_probe_attempts.max(1);

        for attempt in 1..=attempts {
            let result = self.probe.probe(&link).await;
            if tracker.record(result) {
                let ready = self.transition(&link, SyncState::Ready)?;
                info!(
                    primary = %ready.primary_instance_id,
                    replica = %ready.replica_instance_id,
                    attempt,
                    "replica ready"
                );
                return Ok(ready);
            }
            debug!(replica = %link.replica_instance_id, attempt, ?result, "replica not ready");
            if attempt < attempts {
                tokio::time::sleep(tracker.next_interval()).await;
            }
        }

        warn!(
            primary = %link.primary_instance_id,
            replica = %link.replica_instance_id,
            attempts,
            "replica did not become ready"
        );
        Err(ReplicaError::ProbeExhausted {
            link: link.id,
            attempts,
        })
    }

    /// Move one link forward. Refuses transitions the state machine forbids.
    fn transition(&self, link: &ReplicaLink, next: SyncState) -> ReplicaResult<ReplicaLink> {
        let now = self.clock.now();
        let step = |links: &mut Vec<ReplicaLink>| -> ReplicaResult<ReplicaLink> {
            let current = links
                .iter_mut()
                .find(|l| l.id == link.id)
                .ok_or_else(|| ReplicaError::NotFound(link.id.clone()))?;
            if !current.sync_state.can_transition_to(next) {
                return Err(ReplicaError::InvalidTransition {
                    from: current.sync_state,
                    to: next,
                });
            }
            current.sync_state = next;
            current.updated_at = now;
            Ok(current.clone())
        };
        self.store
            .update_replicas_for_primary(&link.primary_instance_id, step)?
    }

    /// Cut over to the primary's ready standby, if it has one.
    pub async fn promote(
        &self,
        primary_id: &str,
        trigger: CutoverTrigger,
    ) -> ReplicaResult<CutoverOutcome> {
        let triggered_at = self.clock.now();
        let _guard = self.lock(primary_id).await;

        match self.standby(primary_id)? {
            Some(link) if link.sync_state == SyncState::Ready => {
                self.promote_ready(link, trigger, triggered_at).await
            }
            other => {
                let standby = other.map(|l| l.sync_state);
                error!(
                    primary = primary_id,
                    ?standby,
                    ?trigger,
                    "cutover requested without a ready replica"
                );
                Ok(CutoverOutcome::NoReadyReplica { standby })
            }
        }
    }

    /// Promote a specific link. Fails without touching state unless the
    /// link is `ready`.
    pub async fn promote_link(
        &self,
        primary_id: &str,
        link_id: &str,
        trigger: CutoverTrigger,
    ) -> ReplicaResult<CutoverOutcome> {
        let triggered_at = self.clock.now();
        let _guard = self.lock(primary_id).await;

        let link = self
            .links(primary_id)?
            .into_iter()
            .find(|l| l.id == link_id)
            .ok_or_else(|| ReplicaError::NotFound(link_id.to_string()))?;
        if link.sync_state != SyncState::Ready {
            return Err(ReplicaError::NotReady {
                link: link.id,
                state: link.sync_state,
            });
        }
        self.promote_ready(link, trigger, triggered_at).await
    }

    async fn promote_ready(
        &self,
        link: ReplicaLink,
        trigger: CutoverTrigger,
        triggered_at: u64,
    ) -> ReplicaResult<CutoverOutcome> {
        // Nothing is recorded until traffic has moved.
        self.backend.redirect_traffic(&link).await?;
        let served_at = self.clock.now();

        // Promote and retire any other standby in one transaction.
        let cutover = |links: &mut Vec<ReplicaLink>| -> ReplicaResult<ReplicaLink> {
            let mut promoted = None;
            for l in links.iter_mut() {
                if l.id == link.id {
                    if !l.sync_state.can_transition_to(SyncState::Promoted) {
                        return Err(ReplicaError::InvalidTransition {
                            from: l.sync_state,
                            to: SyncState::Promoted,
                        });
                    }
                    l.sync_state = SyncState::Promoted;
                    l.updated_at = served_at;
                    promoted = Some(l.clone());
                } else if l.sync_state.is_standby() {
                    l.sync_state = SyncState::Retired;
                    l.updated_at = served_at;
                }
            }
            promoted.ok_or_else(|| ReplicaError::NotFound(link.id.clone()))
        };
        let promoted = self
            .store
            .update_replicas_for_primary(&link.primary_instance_id, cutover)??;

        // The old primary is retired; the replica takes over its role.
        let old = self.store.get_instance(&promoted.primary_instance_id)?;
        self.store
            .update_instance(&promoted.primary_instance_id, |r| {
                r.retired = true;
                r.updated_at = served_at;
            })?;
        if let Some(old) = old {
            self.store.put_instance(&InstanceRecord {
                instance_id: promoted.replica_instance_id.clone(),
                tenant_id: old.tenant_id,
                pool: promoted.pool.clone(),
                lifecycle: promoted.lifecycle,
                last_safe_lifecycle: promoted.lifecycle,
                protected: old.protected,
                retired: false,
                updated_at: served_at,
            })?;
        }

        let downtime_seconds = served_at.saturating_sub(triggered_at);
        let downtime = match trigger {
            CutoverTrigger::InterruptionNotice => {
                let record = DowntimeRecord {
                    id: uuid::Uuid::new_v4().to_string(),
                    instance_id: promoted.primary_instance_id.clone(),
                    cause: DowntimeCause::EmergencySwitch,
                    duration_seconds: downtime_seconds,
                    window_start: triggered_at,
                    window_end: Some(served_at),
                    detail: Some(format!(
                        "cutover to {} after interruption notice",
                        promoted.replica_instance_id
                    )),
                };
                self.store.put_downtime(&record)?;
                Some(record)
            }
            CutoverTrigger::Decision => None,
        };

        info!(
            primary = %promoted.primary_instance_id,
            replica = %promoted.replica_instance_id,
            ?trigger,
            downtime_seconds,
            "replica promoted"
        );
        Ok(CutoverOutcome::Promoted {
            link: promoted,
            downtime_seconds,
            downtime,
        })
    }

    /// Retire the primary's standby, e.g. when it stops being protected.
    pub async fn retire_standby(&self, primary_id: &str) -> ReplicaResult<usize> {
        let _guard = self.lock(primary_id).await;
        let now = self.clock.now();
        let retired = self.store.update_replicas_for_primary(primary_id, |links| {
            let mut retired = 0;
            for l in links.iter_mut().filter(|l| l.sync_state.is_standby()) {
                l.sync_state = SyncState::Retired;
                l.updated_at = now;
                retired += 1;
            }
            retired
        })?;
        if retired > 0 {
            info!(primary = primary_id, retired, "standby retired");
        }
        Ok(retired)
    }
}
