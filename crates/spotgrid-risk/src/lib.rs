//! spotgrid-risk: the interruption ledger and the shared risk registry.
//!
//! The [`EventLog`] is the append-only record of every interruption
//! signal any tenant reported. The [`RiskRegistry`] derives per-pool
//! state from it: how many events are active in the cooldown window and
//! whether the pool is poisoned.
//!
//! # Poisoning
//!
//! ```text
//! report(pool, event):
//!     append RiskEvent { reported_at: now, expires_at: now + cooldown }
//!     count = |{ e in pool : now < e.expires_at }|
//!     if event is termination_notice and count >= threshold:
//!         poison_expires_at = now + cooldown
//!
//! query(pool):
//!     is_poisoned = now < poison_expires_at
//! ```
//!
//! Expiry is evaluated at read time from stored deadlines. Nothing has
//! to tick for a pool to un-poison; the periodic sweep only refreshes
//! the persisted entries that dashboards read.
//!
//! Each pool has its own lock, so reports for unrelated pools never
//! contend and reports for the same pool are linearized.

pub mod event_log;
pub mod ingest;
pub mod registry;

pub use event_log::EventLog;
pub use ingest::{IngestedNotice, NoticeIngestor};
pub use registry::{PoisonTransition, RiskRegistry, RiskView, SweepReport};
