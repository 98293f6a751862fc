//! # Switchboard Server
//!
//! Realtime room messaging server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! switchboard
//!
//! # Run with custom config
//! switchboard /path/to/switchboard.toml
//!
//! # Run with environment variables
//! SWITCHBOARD_PORT=8080 SWITCHBOARD_HOST=0.0.0.0 switchboard
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "switchboard=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match std::env::args().nth(1) {
        Some(path) => config::Config::load_from(path)?,
        None => config::Config::load()?,
    };

    tracing::info!("Starting Switchboard server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
