//! Voice Agent - real-time conversational voice-agent server

use voice_agent::cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // INFO level by default; override with RUST_LOG.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    cli::run().await
}
