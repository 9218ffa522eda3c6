pub mod types;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use std::path::Path;
pub use types::*;

/// Prefix for environment overrides, e.g. `CHATTT__BRIDGE__COMMAND`.
const ENV_PREFIX: &str = "CHATTT";

/// Load configuration from a TOML file, layered with environment overrides
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<AppConfig> {
    let path = path.as_ref();

    let config = Config::builder()
        .add_source(File::from(path))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("Failed to load config from: {}", path.display()))?;

    let app_config: AppConfig = config
        .try_deserialize()
        .context("Failed to deserialize configuration")?;

    validate_config(&app_config)?;

    Ok(app_config)
}

/// Validate the loaded configuration
pub(crate) fn validate_config(config: &AppConfig) -> Result<()> {
    let bridge = &config.bridge;

    if bridge.command.trim().is_empty() {
        anyhow::bail!("bridge.command must not be empty");
    }

    let timeouts = [
        ("handshake_timeout_ms", bridge.handshake_timeout_ms),
        ("request_timeout_ms", bridge.request_timeout_ms),
    ];
    for (name, value) in timeouts {
        if value == 0 {
            anyhow::bail!("bridge.{} must be greater than zero", name);
        }
    }

    if bridge.max_message_bytes == 0 {
        anyhow::bail!("bridge.max_message_bytes must be greater than zero");
    }

    let prefix = &config.http.route_prefix;
    if !prefix.is_empty() && (!prefix.starts_with('/') || prefix.ends_with('/')) {
        anyhow::bail!(
            "http.route_prefix '{}' must start with '/' and not end with '/'",
            prefix
        );
    }

    // Validate log level
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&config.logging.level.as_str()) {
        anyhow::bail!(
            "Invalid log level '{}'. Valid levels: {}",
            config.logging.level,
            valid_levels.join(", ")
        );
    }

    // Validate log format
    let valid_formats = ["pretty", "json"];
    if !valid_formats.contains(&config.logging.format.as_str()) {
        anyhow::bail!(
            "Invalid log format '{}'. Valid formats: {}",
            config.logging.format,
            valid_formats.join(", ")
        );
    }

    Ok(())
}
