//! spotgrid-metrics: observability for the SpotGrid control loop.
//!
//! Counts what the loop does (telemetry accepted, decisions by type,
//! actuation results, cutovers) and renders them, together with gauges
//! read from the state store, in the Prometheus text format.
//!
//! # Architecture
//!
//! ```text
//! ControlMetrics
//!   ├── record_*() ← called by the control loop
//!   └── snapshot() → MetricsSnapshot
//!
//! Prometheus exposition
//!   └── render_prometheus(snapshot, gauges) → text/plain for /metrics
//! ```

pub mod collector;
pub mod prometheus;

pub use collector::{ControlMetrics, MetricsSnapshot};
pub use prometheus::{StateGauges, render_prometheus};
