//! kanade-bot entry point.

use anyhow::Result;
use kanade_common::config::{config_path, BotConfig};
use kanade_common::logging::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    // Logging settings live in the config, so load first and report after.
    let mut config = BotConfig::load()?;
    let ignored = config.apply_env_overrides();

    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    );

    tracing::info!("Kanade Bot v{}", env!("CARGO_PKG_VERSION"));

    let path = config_path();
    if !path.exists() {
        tracing::info!(path = %path.display(), "Config file not found, using defaults");
    }
    for variable in ignored {
        tracing::warn!(variable, "Ignoring invalid environment override");
    }

    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "Invalid configuration");
        return Err(e.into());
    }

    kanade_bot::run(config).await
}
