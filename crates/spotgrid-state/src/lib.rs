//! spotgrid-state: embedded state store for SpotGrid.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state for the risk ledger, pool registry entries, decisions, approval
//! requests, replica links, downtime windows, instances and actions.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{instance}|{ts}|{seq}`, `{primary}|{link}`) enable
//! prefix scans for related records; zero-padded timestamps keep each
//! prefix in chronological order.
//!
//! redb admits one write transaction at a time, so every `update_*`
//! method is a linearizable read-modify-write: concurrent callers are
//! serialized and each observes the previous caller's result.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
