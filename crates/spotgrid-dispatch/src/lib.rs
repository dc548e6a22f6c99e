//! spotgrid-dispatch: the actuation dispatcher and its agent channel.
//!
//! Actions leave the control loop as [`AgentCommand`]s signed with the
//! loop's Ed25519 key and travel over a persistent TCP channel as
//! newline-delimited JSON. The remote [`AgentServer`] verifies each
//! signature before executing and answers with an [`AgentAck`] carrying
//! success or failure plus the resulting instance state.
//!
//! [`ActuationDispatcher`] runs actions one at a time per instance,
//! applies a timeout to every attempt, retries with capped exponential
//! backoff, and reconciles the outcome:
//!
//! - success advances the instance's last safe lifecycle and closes any
//!   open downtime window;
//! - exhausted retries mark the action failed, open a downtime window
//!   (`optimizer_failure` for preventive actions, `worker_crash`
//!   otherwise) and revert the instance to its last safe lifecycle.

pub mod agent;
pub mod command;
pub mod dispatcher;
pub mod error;
pub mod replica_backend;
pub mod transport;

pub use agent::{AgentServer, CommandExecutor};
pub use command::{
    AckStatus, ActionKind, AgentAck, AgentCommand, CommandSigner, CommandVerifier, ResultingState,
    SignedCommand, key_id,
};
pub use dispatcher::{ActionRequest, ActuationDispatcher, ActuationResult, InstanceGuard};
pub use error::{DispatchError, DispatchResult, SignatureError, TransportError};
pub use replica_backend::AgentReplicaBackend;
pub use transport::{AgentTransport, TcpAgentTransport};
