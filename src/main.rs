use anyhow::Context;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use updown_settlement::{bootstrap, config::Config};

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,updown_settlement=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration (.env first so RUST_LOG can live there too)
    let config = Config::from_env().context("invalid configuration")?;

    init_tracing();

    info!("🚀 Starting up/down settlement engine");

    let state = bootstrap::initialize_app_state(&config)
        .await
        .context("failed to initialize engine")?;

    let scheduler = state.start_scheduler();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    scheduler.stop().await;

    info!("👋 Engine stopped");
    Ok(())
}
