//! spotgrid-control: the loop that ties the subsystems together.
//!
//! [`ControlLoop`] owns one instance of every subsystem (risk registry,
//! decision engine, approval gate, replica coordinator, actuation
//! dispatcher) and drives telemetry through them. Everything that touches
//! the outside world arrives through [`Collaborators`], so tests wire in
//! fakes and the daemon wires in the agent channel and HTTP probes.

pub mod controller;
pub mod payload;

pub use controller::{ActionOutcome, Collaborators, ControlLoop, CycleOutcome};
pub use payload::ActionPayload;
