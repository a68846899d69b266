//! Command-line interface

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::info;

use crate::config::{render_config, Config};
use crate::health::HealthMonitor;
use crate::metrics::MetricsManager;
use crate::pipeline::coordinator::PipelineCoordinator;
use crate::pipeline::{asr, llm, CancelToken};
use crate::server::{self, ServerContext};

#[derive(Parser)]
#[command(name = "voice-agent", version, about = "Real-time conversational voice-agent server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server: pipeline coordinator, health monitor, and
    /// observability endpoints
    Serve {
        #[arg(long, default_value = "0.0.0.0", env = "VOICE_AGENT_HOST")]
        host: String,
        #[arg(long, default_value_t = 8080, env = "VOICE_AGENT_PORT")]
        port: u16,
    },
    /// Print the resolved configuration
    Config,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { host, port } => serve(&host, port).await,
        Commands::Config => {
            let config = Config::load()?;
            print!("{}", render_config(&config));
            Ok(())
        }
    }
}

async fn serve(host: &str, port: u16) -> Result<()> {
    let config = Config::load()?;
    asr::validate_settings(&config.asr)?;
    llm::validate_settings(&config.llm)?;

    let metrics = Arc::new(MetricsManager::new(
        config.metrics.save_path.clone(),
        config.metrics.enabled,
    ));
    let health = Arc::new(HealthMonitor::new(&config));
    let coordinator = Arc::new(PipelineCoordinator::new(config, metrics.clone()));

    let shutdown = CancelToken::new();
    tokio::spawn(health.clone().run(shutdown.clone()));
    tokio::spawn(coordinator.clone().run_expiry_sweeper(shutdown.clone()));

    // Prime the health surface so /health is meaningful immediately.
    health.probe_all().await;

    let context = ServerContext {
        coordinator: coordinator.clone(),
        health,
        metrics,
    };

    tokio::select! {
        result = server::start(host, port, context) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            shutdown.cancel();
            coordinator.shutdown().await;
            Ok(())
        }
    }
}
