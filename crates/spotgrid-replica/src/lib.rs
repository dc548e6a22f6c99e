//! spotgrid-replica: warm standbys and cutover.
//!
//! Protected primaries keep one standby replica. Cutover is two-phase:
//!
//! ```text
//! prepare:  provision ──▶ provisioning ──start_sync──▶ syncing
//!                         ──N consecutive healthy probes──▶ ready
//!
//! promote:  trigger ──▶ redirect traffic ──▶ link: promoted
//!                                           old primary: retired
//!                                           replica: new primary
//! ```
//!
//! Promotion only starts from `ready`. A cutover request with no ready
//! standby returns [`CutoverOutcome::NoReadyReplica`] and leaves every
//! link untouched. Emergency cutovers record the trigger→serving
//! interval as an `emergency_switch` downtime window.
//!
//! Links are standalone records keyed `{primary}|{link}`; the
//! coordinator is the only index between a primary and its replicas.
//! Operations on one primary are serialized by a per-primary lock.

pub mod backend;
pub mod coordinator;
pub mod error;
pub mod readiness;

pub use backend::{ProvisionedReplica, ReplicaBackend, ReplicaProbe};
pub use coordinator::{CutoverOutcome, CutoverTrigger, ReplicaCoordinator};
pub use error::{ReplicaError, ReplicaResult};
pub use readiness::{HttpReplicaProbe, ProbeResult, ReadinessTracker, http_probe};
