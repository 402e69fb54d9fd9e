//! Routing policy
//!
//! This module turns network-manager decisions ("wlan0 joins network 5", "tun0 is a
//! VPN for network 100") into ordered FIB rules and routes.
//!
//! # Rule priorities
//!
//! Rules are evaluated in ascending priority. The bands are fixed:
//!
//! | Priority | Band | Matches |
//! |----------|------|---------|
//! | 11000 | privileged legacy | not explicitly selected, privileged |
//! | 12000 | secure VPN | everything not protected from VPN |
//! | 13000 | per-network explicit | net id + explicitly selected |
//! | 14000 | per-network interface | outgoing interface |
//! | 16000 | legacy | not explicitly selected |
//! | 17000 | per-network normal | net id |
//! | 19000 | default network | no net id |
//! | 20000 | main | no net id (nexthop validation only) |
//! | 21000 | unreachable | everything (optional) |
//!
//! Within one priority the kernel evaluates rules in insertion order.
//!
//! # Partial failure
//!
//! Composite operations issue several independent kernel requests and stop at the
//! first failure without undoing earlier steps. Every step can be retried on its own.

pub mod fwmark;
pub mod orchestrator;
pub mod tables;

pub use fwmark::{Fwmark, Permission, NET_ID_MASK};
pub use orchestrator::PolicyOrchestrator;
pub use tables::{
    InterfaceTableRegistry, TableType, ROUTE_TABLE_LEGACY, ROUTE_TABLE_OFFSET_FROM_INDEX,
    ROUTE_TABLE_PRIVILEGED_LEGACY,
};

/// Rule priority bands.
pub mod priority {
    pub const PRIVILEGED_LEGACY: u32 = 11000;
    pub const SECURE_VPN: u32 = 12000;
    pub const PER_NETWORK_EXPLICIT: u32 = 13000;
    pub const PER_NETWORK_INTERFACE: u32 = 14000;
    pub const LEGACY: u32 = 16000;
    pub const PER_NETWORK_NORMAL: u32 = 17000;
    pub const DEFAULT_NETWORK: u32 = 19000;
    pub const MAIN: u32 = 20000;
    pub const UNREACHABLE: u32 = 21000;
}
