//! spotgridd: the SpotGrid daemon.
//!
//! Single binary that assembles every SpotGrid subsystem:
//! - State store (redb)
//! - Risk registry + event log
//! - Decision engine + predictor
//! - Approval gate
//! - Replica coordinator
//! - Actuation dispatcher (signed agent channel)
//! - REST API + Prometheus metrics
//!
//! # Usage
//!
//! ```text
//! spotgridd keygen --out /var/lib/spotgrid/agent.key
//! spotgridd run --config /etc/spotgrid/spotgrid.toml --port 8080 --data-dir /var/lib/spotgrid
//! spotgridd agent --listen 0.0.0.0:7400 --trust <verifying key hex>
//! ```

mod agent_mode;
mod control_plane;

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use spotgrid_dispatch::CommandSigner;

const DEFAULT_FILTER: &str = "info,spotgridd=debug,spotgrid=debug";

#[derive(Parser)]
#[command(name = "spotgridd", about = "SpotGrid daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control loop and the REST API.
    Run {
        /// Path to spotgrid.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// API port to listen on.
        #[arg(long, default_value = "8080")]
        port: u16,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/spotgrid")]
        data_dir: PathBuf,
    },

    /// Run a dry-run execution agent that logs verified commands.
    Agent {
        /// Address to accept the control loop's connections on.
        #[arg(long, default_value = "0.0.0.0:7400")]
        listen: SocketAddr,

        /// Hex-encoded verifying key to accept commands from. Repeatable.
        #[arg(long = "trust", required = true)]
        trusted: Vec<String>,

        /// Oldest command age accepted, in seconds.
        #[arg(long, default_value = "300")]
        max_age: u64,
    },

    /// Write a fresh command-signing key.
    Keygen {
        /// Output file for the hex-encoded seed.
        #[arg(long)]
        out: PathBuf,

        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run {
            config,
            port,
            data_dir,
        } => control_plane::run(config, port, data_dir).await,
        Command::Agent {
            listen,
            trusted,
            max_age,
        } => agent_mode::run_agent(listen, trusted, max_age).await,
        Command::Keygen { out, force } => keygen(out, force),
    }
}

fn keygen(out: PathBuf, force: bool) -> anyhow::Result<()> {
    if out.exists() && !force {
        anyhow::bail!("{} already exists (pass --force to overwrite)", out.display());
    }
    let signer = CommandSigner::generate();
    signer.write_seed(&out)?;
    println!("wrote signing key to {}", out.display());
    println!("key id:        {}", signer.key_id());
    println!(
        "verifying key: {}",
        hex::encode(signer.verifying_key().to_bytes())
    );
    Ok(())
}
