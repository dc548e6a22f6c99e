//! Agent mode: a dry-run execution agent.
//!
//! Accepts the control loop's signed commands, verifies them against the
//! trusted keys, logs what would be done and acknowledges with the state
//! the command asked for. Useful for staging and for checking that a
//! control loop's key is trusted before pointing it at a real agent.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use ed25519_dalek::VerifyingKey;
use tokio::sync::watch;
use tracing::{error, info};

use spotgrid_core::SystemClock;
use spotgrid_dispatch::{
    ActionKind, AgentCommand, AgentServer, CommandExecutor, CommandVerifier, ResultingState, key_id,
};

/// Logs commands and reports their requested outcome.
#[derive(Debug, Default)]
struct DryRunExecutor;

#[async_trait]
impl CommandExecutor for DryRunExecutor {
    async fn execute(&self, command: &AgentCommand) -> Result<ResultingState, String> {
        info!(
            command = %command.id,
            instance = %command.instance_id,
            action = command.action.label(),
            "dry run: command verified"
        );
        let state = match &command.action {
            ActionKind::ProvisionReplica { pool, lifecycle } => ResultingState {
                instance_id: format!("{}-standby", command.instance_id),
                lifecycle: Some(*lifecycle),
                pool: Some(pool.clone()),
                endpoint: None,
            },
            ActionKind::SwitchLifecycle { target, pool } => ResultingState {
                instance_id: command.instance_id.clone(),
                lifecycle: Some(*target),
                pool: pool.clone(),
                endpoint: None,
            },
            _ => ResultingState {
                instance_id: command.instance_id.clone(),
                ..Default::default()
            },
        };
        Ok(state)
    }
}

fn parse_verifying_key(hex_key: &str) -> anyhow::Result<VerifyingKey> {
    let bytes = hex::decode(hex_key.trim())?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("verifying key must be 32 bytes"))?;
    Ok(VerifyingKey::from_bytes(&bytes)?)
}

/// Run the agent until Ctrl-C.
pub async fn run_agent(listen: SocketAddr, trusted: Vec<String>, max_age: u64) -> anyhow::Result<()> {
    info!("SpotGrid agent starting in dry-run mode");

    let mut verifier = CommandVerifier::new(Arc::new(SystemClock), max_age);
    for hex_key in &trusted {
        let key = parse_verifying_key(hex_key)?;
        info!(key_id = %key_id(&key), "trusting signing key");
        verifier = verifier.trust(key);
    }

    let listener = tokio::net::TcpListener::bind(listen).await?;
    let server = AgentServer::new(verifier, Arc::new(DryRunExecutor));

    // ── Shutdown signal ──────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server_handle = tokio::spawn(server.serve(listener, shutdown_rx));

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for Ctrl-C");
    }
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    server_handle.await??;

    info!("agent stopped");
    Ok(())
}
