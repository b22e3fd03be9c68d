//! # MQTTBuzz
//!
//! Desktop notifications for messages from multiple MQTT brokers.
//!
//! ## Usage
//!
//! ```bash
//! # Run with config.json or mqttbuzz.toml from the working directory
//! mqttbuzz
//!
//! # Run with an explicit config file
//! MQTTBUZZ_CONFIG=/path/to/mqttbuzz.toml mqttbuzz
//!
//! # Emit notifications as JSON lines
//! MQTTBUZZ_SINK=json mqttbuzz
//! ```
//!
//! While running, type `toggle`, `reload`, `sound`, `status` or `quit`.

mod app;
mod config;
mod metrics;
mod notify;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "mqttbuzz=info,mqttbuzz_core=info,mqttbuzz_transport=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Load configuration
    let config_path = config::Config::locate();
    let config = config::Config::load(config_path.as_deref())?;

    match &config_path {
        Some(path) => tracing::info!("Loaded configuration from {}", path.display()),
        None => tracing::info!("No configuration file found, using defaults"),
    }

    // Initialize metrics
    metrics::init_metrics();

    app::run(config, config_path).await?;

    Ok(())
}
