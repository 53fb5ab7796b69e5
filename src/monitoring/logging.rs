use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use crate::config::LoggingConfig;

/// Initialize the global subscriber; RUST_LOG takes precedence over the configured level
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let (json, pretty) = if config.json {
        (Some(fmt::layer().json().with_current_span(false)), None)
    } else {
        (None, Some(fmt::layer().with_target(false)))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(pretty)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to init logging: {}", e))?;

    Ok(())
}
