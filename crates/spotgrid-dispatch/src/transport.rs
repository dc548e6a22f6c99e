//! Persistent command channel to the remote agent.
//!
//! Frames are newline-delimited JSON: one [`SignedCommand`] out, one
//! [`AgentAck`] back. The connection is opened lazily, reused for every
//! command, and dropped on any I/O error so the next send reconnects.
//! An exchange that was cancelled midway (e.g. by a caller's timeout)
//! leaves the stream mid-frame, so that connection is discarded too.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::command::{AgentAck, SignedCommand};
use crate::error::TransportError;

/// Delivers one signed command and waits for its acknowledgement.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn send(&self, command: &SignedCommand) -> Result<AgentAck, TransportError>;
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    /// False while an exchange is in progress.
    idle: bool,
}

impl Connection {
    async fn open(addr: &str) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| TransportError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read),
            writer: write,
            idle: true,
        })
    }

    async fn exchange(&mut self, command: &SignedCommand) -> Result<AgentAck, TransportError> {
        let mut frame = serde_json::to_vec(command)?;
        frame.push(b'\n');
        self.idle = false;
        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;

        // Skip any ack not addressed to this command.
        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line).await? == 0 {
                return Err(TransportError::Closed);
            }
            let ack: AgentAck = serde_json::from_str(line.trim_end())?;
            if ack.command_id == command.command.id {
                self.idle = true;
                return Ok(ack);
            }
            debug!(stale = %ack.command_id, "discarding ack for an earlier command");
        }
    }
}

/// TCP client side of the agent channel.
pub struct TcpAgentTransport {
    addr: String,
    conn: Mutex<Option<Connection>>,
}

impl TcpAgentTransport {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            conn: Mutex::new(None),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl AgentTransport for TcpAgentTransport {
    async fn send(&self, command: &SignedCommand) -> Result<AgentAck, TransportError> {
        let mut slot = self.conn.lock().await;
        if slot.as_ref().is_some_and(|c| !c.idle) {
            debug!(addr = %self.addr, "previous exchange was cancelled; reconnecting");
            *slot = None;
        }
        if slot.is_none() {
            *slot = Some(Connection::open(&self.addr).await?);
            info!(addr = %self.addr, "agent channel connected");
        }
        let Some(conn) = slot.as_mut() else {
            return Err(TransportError::Closed);
        };

        match conn.exchange(command).await {
            Ok(ack) => Ok(ack),
            Err(e) => {
                *slot = None;
                debug!(addr = %self.addr, error = %e, "agent channel dropped");
                Err(e)
            }
        }
    }
}
