//! spotgrid-core: shared vocabulary for the SpotGrid control loop.
//!
//! Holds the value types every subsystem agrees on (pool identity,
//! lifecycle, telemetry and its validation), the `spotgrid.toml`
//! configuration model, duration parsing, and the [`Clock`] seam used
//! for every "now" read in the loop.

pub mod clock;
pub mod config;
pub mod duration;
pub mod types;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock, epoch_secs};
pub use config::{ConfigError, SpotgridConfig};
pub use duration::parse_duration;
pub use types::*;
