//! armadad — the Armada manager daemon.
//!
//! Single binary that assembles the manager:
//! - State store (redb)
//! - Placement scheduler
//! - Watchdog + engine membership
//! - Leader/replica coordinator
//! - Region controller (scheduler and executor loops)
//! - Discovery watch
//!
//! # Usage
//!
//! ```text
//! armadad manage --config /etc/armada/armada.toml --discovery nodes://10.0.0.[1:4]:2375
//! armadad config --strategy binpack
//! ```

mod manage;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::manage::ManageArgs;

/// Blocking-thread ceiling for per-engine fan-out bursts.
const MAX_BLOCKING_THREADS: usize = 50_000;

const DEFAULT_LOG_FILTER: &str = "info,armadad=debug,armada=debug";

#[derive(Parser)]
#[command(name = "armadad", about = "Armada multi-datacenter container manager")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the manager.
    Manage(ManageArgs),
    /// Print the effective configuration as TOML and exit.
    Config(ManageArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Config(args) => {
            let config = args.effective_config()?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
        Command::Manage(args) => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .max_blocking_threads(MAX_BLOCKING_THREADS)
                .thread_name("armada-worker")
                .build()?;
            runtime.block_on(manage::run(args))
        }
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
