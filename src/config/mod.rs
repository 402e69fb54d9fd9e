//! Configuration module for policy-router
//!
//! This module provides configuration types and loading utilities.
//!
//! # Example
//!
//! ```no_run
//! use policy_router::config::load_config;
//!
//! let config = load_config("/etc/policy-router/config.json").unwrap();
//! println!("ip binary: {}", config.commands.ip_path.display());
//! ```

mod loader;
mod types;

pub use loader::{create_default_config, load_config, load_config_str, load_config_with_env};
pub use types::{CommandConfig, Config, LogConfig, PolicyConfig};
