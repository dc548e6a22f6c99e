//! spotgrid-approval: the approval gate.
//!
//! Actions classified `high` or `critical` are parked as an
//! [`ApprovalRequest`] instead of executing. A request resolves exactly
//! once:
//!
//! ```text
//! pending ──approve──▶ approved ──claim──▶ dispatched (once)
//!    │
//!    ├──reject───────▶ rejected
//!    └──now ≥ expires_at──▶ expired
//! ```
//!
//! Expiry is applied whenever a request is read or resolved, so a
//! request past its deadline can never be approved or dispatched even
//! if the housekeeping sweep has not run. Every resolution is a single
//! store transaction; concurrent approve/reject calls are serialized
//! and only the first records a terminal status.
//!
//! When a request ends in `rejected` or `expired`, the action record it
//! was holding is marked `discarded` in the same step.
//!
//! [`ApprovalRequest`]: spotgrid_state::ApprovalRequest

pub mod classify;
pub mod error;
pub mod gate;

pub use classify::{ActionImpact, classify};
pub use error::{ApprovalError, ApprovalResult};
pub use gate::{ActionProposal, ApprovalGate, Resolution};
