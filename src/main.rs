//! CLI entry point for the beamline process.
//!
//! # Usage
//!
//! ```bash
//! beamline_daq --config config/beamline.toml
//! beamline_daq --simulate --log-level debug --log-format compact
//! ```
//!
//! Runs until SIGINT (Ctrl-C) or SIGTERM, then stops every background thread
//! cooperatively.

use anyhow::Result;
use beamline_daq::tracing_init::{self, OutputFormat};
use beamline_daq::{AppConfig, BeamlineApp};
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "beamline_daq")]
#[command(about = "Beamline property runtime, IOCs and detector coordinator", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = beamline_daq::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the configured log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Override the configured log format
    #[arg(long, value_enum)]
    log_format: Option<OutputFormat>,

    /// Run the simulated temperature controller and chiller
    #[arg(long)]
    simulate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load_from(&cli.config)?;
    if let Some(level) = cli.log_level {
        config.application.log_level = level;
    }
    if let Some(format) = cli.log_format {
        config.application.log_format = format;
    }
    if cli.simulate {
        config.simulator.enabled = true;
    }
    config.validate()?;
    tracing_init::init_from_config(&config).map_err(anyhow::Error::msg)?;

    tracing::info!(
        name = %config.application.name,
        config = %cli.config.display(),
        "starting"
    );
    let app = BeamlineApp::build(&config)?;
    if let Err(e) = app.start() {
        tracing::error!(error = ?e, "startup failed");
        app.shutdown();
        return Err(e);
    }
    tracing::info!(objects = ?app.object_names(), "running; press Ctrl-C to stop");

    shutdown_signal().await;
    // Thread joins block; keep them off the runtime's worker threads
    tokio::task::spawn_blocking(move || app.shutdown()).await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT, shutting down"),
        () = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
