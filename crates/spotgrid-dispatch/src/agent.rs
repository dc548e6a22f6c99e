//! Remote execution agent: server side of the command channel.
//!
//! The agent runs next to the managed instances. Every incoming frame
//! is verified with a [`CommandVerifier`] before anything executes;
//! unsigned, tampered, unknown-key and stale commands are answered with
//! a `rejected` ack and never reach the [`CommandExecutor`].
//!
//! Command ids that executed successfully are remembered for the
//! verifier's `max_age`. A repeat of such an id (a retry after a lost ack,
//! or a replayed frame) gets the original ack back without executing again.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OnceCell, watch};
use tracing::{debug, info, warn};

use crate::command::{AckStatus, AgentAck, AgentCommand, CommandVerifier, ResultingState, SignedCommand};

/// Carries out verified commands on the host.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, command: &AgentCommand) -> Result<ResultingState, String>;
}

/// A command id the agent has started executing.
struct Executed {
    first_seen: u64,
    ack: Arc<OnceCell<AgentAck>>,
}

pub struct AgentServer {
    verifier: Arc<CommandVerifier>,
    executor: Arc<dyn CommandExecutor>,
    executed: DashMap<String, Executed>,
}

impl AgentServer {
    pub fn new(verifier: CommandVerifier, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            verifier: Arc::new(verifier),
            executor,
            executed: DashMap::new(),
        }
    }

    /// Command ids currently remembered.
    pub fn remembered(&self) -> usize {
        self.executed.len()
    }

    /// The ack slot for `id`, created on first sight. Expired ids are
    /// dropped on the way.
    fn ack_slot(&self, id: &str) -> Arc<OnceCell<AgentAck>> {
        let now = self.verifier.now();
        let horizon = self.verifier.max_age_secs();
        self.executed
            .retain(|_, e| now.saturating_sub(e.first_seen) <= horizon);
        self.executed
            .entry(id.to_string())
            .or_insert_with(|| Executed {
                first_seen: now,
                ack: Arc::new(OnceCell::new()),
            })
            .ack
            .clone()
    }

    /// Accept connections until `shutdown` flips.
    pub async fn serve(
        self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> std::io::Result<()> {
        let server = Arc::new(self);
        info!(addr = ?listener.local_addr()?, "agent listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    debug!(%peer, "agent connection accepted");
                    let server = Arc::clone(&server);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream).await {
                            debug!(%peer, error = %e, "agent connection closed");
                        }
                    });
                }
                _ = shutdown.changed() => {
                    info!("agent shutting down");
                    return Ok(());
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> std::io::Result<()> {
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let ack = self.handle_frame(&line).await;
            let mut frame = serde_json::to_vec(&ack)?;
            frame.push(b'\n');
            write.write_all(&frame).await?;
        }
        Ok(())
    }

    /// Verify and execute one frame.
    pub async fn handle_frame(&self, frame: &str) -> AgentAck {
        let signed: SignedCommand = match serde_json::from_str(frame) {
            Ok(signed) => signed,
            Err(e) => {
                warn!(error = %e, "undecodable command frame");
                return AgentAck::failed("", AckStatus::Rejected, format!("malformed frame: {e}"));
            }
        };
        let command = &signed.command;

        if let Err(e) = self.verifier.verify(&signed) {
            warn!(
                command = %command.id,
                instance = %command.instance_id,
                error = %e,
                "command rejected"
            );
            return AgentAck::failed(&command.id, AckStatus::Rejected, e.to_string());
        }

        let slot = self.ack_slot(&command.id);
        if let Some(ack) = slot.get() {
            info!(
                command = %command.id,
                instance = %command.instance_id,
                "repeated command, replaying ack"
            );
            return ack.clone();
        }

        // Concurrent repeats wait on the same cell; only success is kept,
        // so a failed command can be retried under its id.
        let outcome = slot
            .get_or_try_init(|| async {
                match self.executor.execute(command).await {
                    Ok(state) => {
                        info!(
                            command = %command.id,
                            instance = %command.instance_id,
                            action = command.action.label(),
                            "command executed"
                        );
                        Ok(AgentAck::succeeded(&command.id, state))
                    }
                    Err(reason) => Err(reason),
                }
            })
            .await;

        match outcome {
            Ok(ack) => ack.clone(),
            Err(reason) => {
                warn!(
                    command = %command.id,
                    instance = %command.instance_id,
                    %reason,
                    "command failed"
                );
                AgentAck::failed(&command.id, AckStatus::Failed, reason)
            }
        }
    }
}
