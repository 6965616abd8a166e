//! ciaod — operator tool for the ciao controller datastore.
//!
//! # Usage
//!
//! ```text
//! ciaod --config /etc/ciao/controller.toml init
//! ciaod seed-workloads workloads.json
//! ciaod set-quotas tenant-a instance=10 mem_mb=8192 vcpus=unlimited
//! ciaod check
//! ```

mod commands;

use std::path::PathBuf;

use ciao_controller::ControllerConfig;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ciaod", about = "Ciao controller operator tool")]
struct Cli {
    /// Controller configuration file (TOML). Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the datastore path from the configuration.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the datastore tables and the network concentrator workload.
    Init,

    /// Add workloads from a JSON file holding an array of workload records.
    SeedWorkloads {
        file: PathBuf,
    },

    /// Set per-tenant limits, e.g. `mem_mb=4096` or `vcpus=unlimited`.
    SetQuotas {
        tenant: String,
        #[arg(required = true)]
        limits: Vec<String>,
    },

    /// Rebuild quota usage and compare the cached and durable tiers.
    Check,

    /// Print the effective configuration.
    ShowConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ControllerConfig::from_file(path)?,
        None => ControllerConfig::default(),
    };
    if let Some(db) = cli.db {
        config.datastore.path = db;
    }

    init_tracing(&config)?;

    match cli.command {
        Command::Init => commands::init(&config).await,
        Command::SeedWorkloads { file } => commands::seed_workloads(&config, &file).await,
        Command::SetQuotas { tenant, limits } => {
            let limits = commands::parse_limits(&limits)?;
            commands::set_quotas(&config, &tenant, limits).await
        }
        Command::Check => commands::check(&config).await,
        Command::ShowConfig => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }?;

    info!("done");
    Ok(())
}

fn init_tracing(config: &ControllerConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.logging.filter)?,
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}
