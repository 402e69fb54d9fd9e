//! Configuration types for policy-router
//!
//! Configuration is loaded from a JSON file and validated at startup. Every section
//! has defaults, so an empty object (`{}`) is a valid configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Paths of the external tools used for packet marking and route flushing
    #[serde(default)]
    pub commands: CommandConfig,

    /// Optional routing policy behaviour
    #[serde(default)]
    pub policy: PolicyConfig,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.log.validate()?;
        self.commands.validate()?;
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include target (module path)
    #[serde(default = "default_true")]
    pub target: bool,
}

impl LogConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(
            self.level.to_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(ConfigError::ValidationError(format!(
                "Unknown log level: {}",
                self.level
            )));
        }
        if !matches!(self.format.as_str(), "json" | "text") {
            return Err(ConfigError::ValidationError(format!(
                "Unknown log format: {} (expected json or text)",
                self.format
            )));
        }
        Ok(())
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            target: true,
        }
    }
}

/// External tool paths
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommandConfig {
    /// `ip(8)`, used for bulk route flushes
    #[serde(default = "default_ip_path")]
    pub ip_path: PathBuf,

    /// `iptables(8)`, used to mark inbound IPv4 packets
    #[serde(default = "default_iptables_path")]
    pub iptables_path: PathBuf,

    /// `ip6tables(8)`, used to mark inbound IPv6 packets
    #[serde(default = "default_ip6tables_path")]
    pub ip6tables_path: PathBuf,
}

impl CommandConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        for (name, path) in [
            ("ip_path", &self.ip_path),
            ("iptables_path", &self.iptables_path),
            ("ip6tables_path", &self.ip6tables_path),
        ] {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "commands.{name} cannot be empty"
                )));
            }
            if !path.is_absolute() {
                return Err(ConfigError::ValidationError(format!(
                    "commands.{name} must be an absolute path: {}",
                    path.display()
                )));
            }
        }
        Ok(())
    }
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            ip_path: default_ip_path(),
            iptables_path: default_iptables_path(),
            ip6tables_path: default_ip6tables_path(),
        }
    }
}

/// Optional routing policy behaviour
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PolicyConfig {
    /// Mark inbound packets with the network id when an interface joins a network,
    /// so replies and accepted sockets stay on that network
    #[serde(default = "default_true")]
    pub mark_incoming_packets: bool,

    /// Install a lowest-priority "unreachable" rule at startup so marked traffic
    /// never falls through to the kernel's catch-all main rule
    #[serde(default)]
    pub unreachable_fallback: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            mark_incoming_packets: true,
            unreachable_fallback: false,
        }
    }
}

// Default value functions

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}

fn default_ip_path() -> PathBuf {
    PathBuf::from("/sbin/ip")
}

fn default_iptables_path() -> PathBuf {
    PathBuf::from("/sbin/iptables")
}

fn default_ip6tables_path() -> PathBuf {
    PathBuf::from("/sbin/ip6tables")
}
