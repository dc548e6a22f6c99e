//! spotgrid-engine: per-instance lifecycle decisions.
//!
//! Each evaluation reads the instance's telemetry, the registry view of
//! its pool and (when available) a predictor score, applies the policy
//! below and writes exactly one immutable [`Decision`] record.
//!
//! # Policy
//!
//! ```text
//! 1. pool poisoned                         → switch_to_ondemand (risk 1.0)
//! 2. no predictor, or confidence < floor   → switch_to_ondemand if a notice
//!                                            was observed, else hold
//! 3. risk = min(1, score + weight * count)
//!    risk >= high                          → switch_to_ondemand
//!    risk <  low and a healthy pool exists → switch_to_spot
//!    otherwise                             → hold (stay_spot / stay_ondemand)
//! ```
//!
//! The engine never writes to the registry. Notices reach it only
//! through the ingestion path in `spotgrid-risk`.
//!
//! [`Decision`]: spotgrid_state::Decision

pub mod engine;
pub mod error;
pub mod policy;

pub use engine::DecisionEngine;
pub use error::{EngineError, EngineResult};
pub use policy::{PolicyInput, Verdict, decide};
