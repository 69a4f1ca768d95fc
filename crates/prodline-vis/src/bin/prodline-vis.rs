//! Prodline visualization server binary.

use prodline_vis::{VisConfig, VisServer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "prodline=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = VisConfig::from_env()?;
    tracing::info!(
        tick_ms = config.sync.tick_interval.as_millis() as u64,
        seed = ?config.sync.seed,
        "starting prodline vis server"
    );

    let server = VisServer::new(&config)?;
    server.serve(config.bind_addr).await?;

    Ok(())
}
