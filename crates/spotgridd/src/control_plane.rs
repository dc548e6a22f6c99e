//! Control plane mode: the control loop plus the REST API.
//!
//! In this mode, the daemon:
//! 1. Loads spotgrid.toml (or defaults) and opens the state store
//! 2. Loads the command-signing key, generating one on first start
//! 3. Assembles the control loop, hydrating the risk registry
//! 4. Serves the REST API, feeding telemetry into the loop
//! 5. On Ctrl-C, stops accepting requests and drains the loop

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use spotgrid_api::{ApiState, build_router};
use spotgrid_control::{Collaborators, ControlLoop};
use spotgrid_core::config::DispatchConfig;
use spotgrid_core::{SharedClock, SpotgridConfig, SystemClock};
use spotgrid_dispatch::{AgentReplicaBackend, AgentTransport, CommandSigner, TcpAgentTransport};
use spotgrid_predictor::build_predictor;
use spotgrid_replica::HttpReplicaProbe;
use spotgrid_state::StateStore;

/// Samples buffered per engine worker before the API answers 503.
const TELEMETRY_BACKLOG_PER_WORKER: usize = 64;

pub async fn run(config_path: Option<PathBuf>, port: u16, data_dir: PathBuf) -> anyhow::Result<()> {
    info!("SpotGrid daemon starting");

    let config = match &config_path {
        Some(path) => {
            let config = SpotgridConfig::from_file(path)?;
            info!(path = ?path, "config loaded");
            config
        }
        None => {
            info!("no config file given, using defaults");
            SpotgridConfig::default()
        }
    };
    config.validate()?;

    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("spotgrid.redb");

    // ── Initialize subsystems ──────────────────────────────────

    // State store.
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let clock: SharedClock = Arc::new(SystemClock);

    // Command signing.
    let signer = Arc::new(load_signer(&config.dispatch, &data_dir)?);
    info!(key_id = signer.key_id(), "command signing key loaded");

    // Agent channel, shared by actuation and replica management.
    let transport: Arc<dyn AgentTransport> =
        Arc::new(TcpAgentTransport::new(config.dispatch.agent_addr.clone()));
    info!(agent = %config.dispatch.agent_addr, "agent channel configured");

    let predictor = build_predictor(&config.predictor);
    info!(predictor = predictor.name(), "predictor selected");

    let collaborators = Collaborators {
        predictor,
        transport: Arc::clone(&transport),
        signer: Arc::clone(&signer),
        replica_backend: Arc::new(AgentReplicaBackend::new(
            transport,
            signer,
            clock.clone(),
            config.dispatch.command_timeout(),
        )),
        replica_probe: Arc::new(HttpReplicaProbe::new(&config.replica)),
    };

    let control = Arc::new(ControlLoop::assemble(&config, store, clock, collaborators)?);
    info!(
        pools = control.registry().snapshot().len(),
        "control loop assembled"
    );

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start control loop ─────────────────────────────────────

    let backlog = config.engine.workers.max(1) * TELEMETRY_BACKLOG_PER_WORKER;
    let (telemetry_tx, telemetry_rx) = mpsc::channel(backlog);
    let loop_handle = tokio::spawn(Arc::clone(&control).run(telemetry_rx, shutdown_rx));

    // ── Start API server ───────────────────────────────────────

    let router = build_router(ApiState::for_loop(&control, telemetry_tx));
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl-C");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    // Wait for the loop to stop taking telemetry.
    let _ = loop_handle.await;

    info!("SpotGrid daemon stopped");
    Ok(())
}

/// Load the configured signing key. Without one, reuse or create
/// `agent.key` in the data directory.
fn load_signer(config: &DispatchConfig, data_dir: &Path) -> anyhow::Result<CommandSigner> {
    if let Some(path) = &config.signing_key_file {
        return Ok(CommandSigner::load(Path::new(path))?);
    }

    let path = data_dir.join("agent.key");
    if path.exists() {
        return Ok(CommandSigner::load(&path)?);
    }

    let signer = CommandSigner::generate();
    signer.write_seed(&path)?;
    warn!(
        path = ?path,
        verifying_key = %hex::encode(signer.verifying_key().to_bytes()),
        "generated a new signing key; agents must trust it"
    );
    Ok(signer)
}
