//! Configuration loading and management
//!
//! This module handles loading configuration from files and environment variables.

use std::path::Path;

use tracing::{debug, info};

use super::types::Config;
use crate::error::ConfigError;

/// Load configuration from a JSON file
///
/// # Arguments
///
/// * `path` - Path to the configuration file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read or parsed.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let config: Config = serde_json::from_str(&contents).map_err(|e| {
        ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}"))
    })?;

    config.validate()?;

    info!(
        "Configuration loaded: mark_incoming_packets={}, unreachable_fallback={}",
        config.policy.mark_incoming_packets, config.policy.unreachable_fallback
    );

    Ok(config)
}

/// Load configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

/// Load configuration with environment variable overrides
///
/// A missing file is not an error here: the defaults are used instead, so the
/// binary runs without any configuration on a standard host.
///
/// Environment variables:
/// - `POLICY_ROUTER_LOG_LEVEL`: Override log level
/// - `POLICY_ROUTER_IP_PATH`: Override `ip` binary path
/// - `POLICY_ROUTER_IPTABLES_PATH`: Override `iptables` binary path
/// - `POLICY_ROUTER_IP6TABLES_PATH`: Override `ip6tables` binary path
///
/// # Errors
///
/// Returns `ConfigError` if loading, parsing, or validation fails.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    load_config_with_vars(path, |name| std::env::var(name).ok())
}

fn load_config_with_vars(
    path: impl AsRef<Path>,
    var: impl Fn(&str) -> Option<String>,
) -> Result<Config, ConfigError> {
    let mut config = match load_config(path) {
        Ok(config) => config,
        Err(ConfigError::FileNotFound { path }) => {
            debug!("No configuration at {path}, using defaults");
            Config::default()
        }
        Err(e) => return Err(e),
    };

    apply_env_overrides(&mut config, var);

    // Re-validate after overrides
    config.validate()?;

    Ok(config)
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(level) = var("POLICY_ROUTER_LOG_LEVEL") {
        config.log.level = level;
        debug!("Log level overridden to {}", config.log.level);
    }

    if let Some(ip) = var("POLICY_ROUTER_IP_PATH") {
        config.commands.ip_path = ip.into();
        debug!("ip path overridden to {:?}", config.commands.ip_path);
    }

    if let Some(iptables) = var("POLICY_ROUTER_IPTABLES_PATH") {
        config.commands.iptables_path = iptables.into();
        debug!(
            "iptables path overridden to {:?}",
            config.commands.iptables_path
        );
    }

    if let Some(ip6tables) = var("POLICY_ROUTER_IP6TABLES_PATH") {
        config.commands.ip6tables_path = ip6tables.into();
        debug!(
            "ip6tables path overridden to {:?}",
            config.commands.ip6tables_path
        );
    }
}

/// Create a default configuration file at the given path
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be written.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let config = Config::default();
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| ConfigError::ParseError(format!("Failed to serialize config: {e}")))?;

    std::fs::write(path, json)?;
    Ok(())
}
