//! policy-router: policy-routing control plane for multi-network Linux hosts
//!
//! This crate programs the kernel's FIB rules and routing tables so that packets
//! are routed by the logical network they belong to, the permission that network
//! requires, and whether a VPN must take precedence. A network manager decides
//! *when* interfaces join networks; this crate turns those decisions into ordered
//! rtnetlink requests.
//!
//! # Architecture
//!
//! ```text
//! RouteController → PolicyOrchestrator → { FibRule, RouteRequest, InterfaceTableRegistry }
//!                                                  ↓
//!                                          NetlinkTransport → kernel
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use policy_router::config::load_config_with_env;
//! use policy_router::controller::RouteController;
//! use policy_router::policy::{Permission, TableType};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config_with_env("/etc/policy-router/config.json")?;
//! let controller = RouteController::from_config(&config);
//!
//! controller.initialize()?;
//! controller.attach_interface_to_network(100, "wlan0", Permission::None)?;
//! controller.add_route("wlan0", "0.0.0.0/0", Some("192.168.1.1"), TableType::Interface, 0)?;
//! controller.attach_to_default_network("wlan0", Permission::None)?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration types and loading
//! - [`controller`]: Thread-safe control surface
//! - [`error`]: Error types and errno mapping
//! - [`external`]: Interface lookup, packet marking, and route flushing
//! - [`netlink`]: rtnetlink rule/route encoding and transport
//! - [`policy`]: Priority scheme, fwmark layout, and composite operations

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod controller;
pub mod error;
pub mod external;
pub mod netlink;
pub mod policy;

// Re-export commonly used types at the crate root
pub use config::{Config, PolicyConfig};
pub use controller::{RouteController, RouteControllerBuilder};
pub use error::{ConfigError, PolicyRouterError, RouteError};
pub use netlink::{FibRule, KernelTransport, NetlinkTransport, RouteRequest};
pub use policy::{Fwmark, Permission, PolicyOrchestrator, TableType};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Check if running as root (effective UID = 0).
#[must_use]
pub fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}
