//! Route controller
//!
//! The control surface used by the network manager. Each operation logs the request
//! and forwards it to the [`PolicyOrchestrator`] under a lock, so one controller can
//! be shared between threads.
//!
//! # Example
//!
//! ```no_run
//! use policy_router::config::Config;
//! use policy_router::controller::RouteController;
//! use policy_router::policy::Permission;
//!
//! let controller = RouteController::from_config(&Config::default());
//! controller.initialize().unwrap();
//! controller
//!     .attach_interface_to_network(100, "wlan0", Permission::None)
//!     .unwrap();
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, info};

use crate::config::{Config, PolicyConfig};
use crate::error::RouteError;
use crate::external::{
    InterfaceResolver, IpRouteFlusher, IptablesMarker, PacketMarker, RouteFlusher, SystemResolver,
};
use crate::netlink::{KernelTransport, NetlinkTransport};
use crate::policy::{Permission, PolicyOrchestrator, TableType};

/// Thread-safe entry point for all routing policy changes.
pub struct RouteController {
    orchestrator: Mutex<PolicyOrchestrator>,
}

impl RouteController {
    /// Controller wired to the kernel and the system tools named in `config`.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        RouteControllerBuilder::new()
            .marker(Arc::new(IptablesMarker::new(
                &config.commands.iptables_path,
                &config.commands.ip6tables_path,
            )))
            .flusher(Arc::new(IpRouteFlusher::new(&config.commands.ip_path)))
            .options(config.policy.clone())
            .build()
    }

    /// Start building a controller with custom collaborators.
    #[must_use]
    pub fn builder() -> RouteControllerBuilder {
        RouteControllerBuilder::new()
    }

    /// Install the baseline rules. Call once at startup.
    ///
    /// # Errors
    ///
    /// Returns the first rule that failed to install.
    pub fn initialize(&self) -> Result<(), RouteError> {
        info!("Installing baseline routing rules");
        log_failure("initialize", self.orchestrator.lock().initialize())
    }

    /// # Errors
    ///
    /// See [`PolicyOrchestrator::attach_interface_to_network`].
    pub fn attach_interface_to_network(
        &self,
        net_id: u16,
        interface: &str,
        permission: Permission,
    ) -> Result<(), RouteError> {
        info!("Adding {interface} to network {net_id} (permission: {permission})");
        log_failure(
            "attach_interface_to_network",
            self.orchestrator
                .lock()
                .attach_interface_to_network(net_id, interface, permission),
        )
    }

    /// # Errors
    ///
    /// See [`PolicyOrchestrator::detach_interface_from_network`].
    pub fn detach_interface_from_network(
        &self,
        net_id: u16,
        interface: &str,
        permission: Permission,
    ) -> Result<(), RouteError> {
        info!("Removing {interface} from network {net_id} (permission: {permission})");
        log_failure(
            "detach_interface_from_network",
            self.orchestrator
                .lock()
                .detach_interface_from_network(net_id, interface, permission),
        )
    }

    /// # Errors
    ///
    /// See [`PolicyOrchestrator::attach_interface_to_vpn`].
    pub fn attach_interface_to_vpn(&self, net_id: u16, interface: &str) -> Result<(), RouteError> {
        info!("Adding {interface} to VPN {net_id}");
        log_failure(
            "attach_interface_to_vpn",
            self.orchestrator
                .lock()
                .attach_interface_to_vpn(net_id, interface),
        )
    }

    /// # Errors
    ///
    /// See [`PolicyOrchestrator::detach_interface_from_vpn`].
    pub fn detach_interface_from_vpn(
        &self,
        net_id: u16,
        interface: &str,
    ) -> Result<(), RouteError> {
        info!("Removing {interface} from VPN {net_id}");
        log_failure(
            "detach_interface_from_vpn",
            self.orchestrator
                .lock()
                .detach_interface_from_vpn(net_id, interface),
        )
    }

    /// # Errors
    ///
    /// See [`PolicyOrchestrator::change_network_permission`].
    pub fn change_network_permission(
        &self,
        net_id: u16,
        interface: &str,
        old: Permission,
        new: Permission,
    ) -> Result<(), RouteError> {
        info!("Changing permission of network {net_id} on {interface}: {old} -> {new}");
        log_failure(
            "change_network_permission",
            self.orchestrator
                .lock()
                .change_network_permission(net_id, interface, old, new),
        )
    }

    /// # Errors
    ///
    /// See [`PolicyOrchestrator::attach_to_default_network`].
    pub fn attach_to_default_network(
        &self,
        interface: &str,
        permission: Permission,
    ) -> Result<(), RouteError> {
        info!("Setting default network to {interface} (permission: {permission})");
        log_failure(
            "attach_to_default_network",
            self.orchestrator
                .lock()
                .attach_to_default_network(interface, permission),
        )
    }

    /// # Errors
    ///
    /// See [`PolicyOrchestrator::detach_from_default_network`].
    pub fn detach_from_default_network(
        &self,
        interface: &str,
        permission: Permission,
    ) -> Result<(), RouteError> {
        info!("Clearing default network {interface} (permission: {permission})");
        log_failure(
            "detach_from_default_network",
            self.orchestrator
                .lock()
                .detach_from_default_network(interface, permission),
        )
    }

    /// # Errors
    ///
    /// See [`PolicyOrchestrator::add_route`].
    pub fn add_route(
        &self,
        interface: &str,
        destination: &str,
        nexthop: Option<&str>,
        table_type: TableType,
        uid: u32,
    ) -> Result<(), RouteError> {
        info!("Adding route {destination} via {nexthop:?} dev {interface} ({table_type:?})");
        log_failure(
            "add_route",
            self.orchestrator
                .lock()
                .add_route(interface, destination, nexthop, table_type, uid),
        )
    }

    /// # Errors
    ///
    /// See [`PolicyOrchestrator::remove_route`].
    pub fn remove_route(
        &self,
        interface: &str,
        destination: &str,
        nexthop: Option<&str>,
        table_type: TableType,
        uid: u32,
    ) -> Result<(), RouteError> {
        info!("Removing route {destination} via {nexthop:?} dev {interface} ({table_type:?})");
        log_failure(
            "remove_route",
            self.orchestrator
                .lock()
                .remove_route(interface, destination, nexthop, table_type, uid),
        )
    }

    /// # Errors
    ///
    /// See [`PolicyOrchestrator::flush_routes`].
    pub fn flush_routes(&self, interface: &str) -> Result<(), RouteError> {
        info!("Flushing routes for {interface}");
        log_failure("flush_routes", self.orchestrator.lock().flush_routes(interface))
    }

    /// Routing table currently derived for `interface`, refreshing the index cache.
    #[must_use]
    pub fn table_for_interface(&self, interface: &str) -> Option<u32> {
        self.orchestrator
            .lock()
            .tables_mut()
            .table_for_interface(interface)
    }
}

impl std::fmt::Debug for RouteController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteController")
            .field("orchestrator", &*self.orchestrator.lock())
            .finish()
    }
}

fn log_failure(op: &str, result: Result<(), RouteError>) -> Result<(), RouteError> {
    if let Err(e) = &result {
        error!("{op} failed: {e} (errno {})", e.errno());
    }
    result
}

/// Builder for [`RouteController`]
///
/// Every collaborator defaults to its system implementation.
pub struct RouteControllerBuilder {
    transport: Option<Arc<dyn NetlinkTransport>>,
    resolver: Option<Arc<dyn InterfaceResolver>>,
    marker: Option<Arc<dyn PacketMarker>>,
    flusher: Option<Arc<dyn RouteFlusher>>,
    options: PolicyConfig,
}

impl RouteControllerBuilder {
    /// Create a new builder
    #[must_use]
    pub fn new() -> Self {
        Self {
            transport: None,
            resolver: None,
            marker: None,
            flusher: None,
            options: PolicyConfig::default(),
        }
    }

    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn NetlinkTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    #[must_use]
    pub fn resolver(mut self, resolver: Arc<dyn InterfaceResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    #[must_use]
    pub fn marker(mut self, marker: Arc<dyn PacketMarker>) -> Self {
        self.marker = Some(marker);
        self
    }

    #[must_use]
    pub fn flusher(mut self, flusher: Arc<dyn RouteFlusher>) -> Self {
        self.flusher = Some(flusher);
        self
    }

    #[must_use]
    pub fn options(mut self, options: PolicyConfig) -> Self {
        self.options = options;
        self
    }

    /// Build the controller
    #[must_use]
    pub fn build(self) -> RouteController {
        let defaults = crate::config::CommandConfig::default();
        let orchestrator = PolicyOrchestrator::new(
            self.transport
                .unwrap_or_else(|| Arc::new(KernelTransport::new())),
            self.resolver.unwrap_or_else(|| Arc::new(SystemResolver)),
            self.marker.unwrap_or_else(|| {
                Arc::new(IptablesMarker::new(
                    defaults.iptables_path.clone(),
                    defaults.ip6tables_path.clone(),
                ))
            }),
            self.flusher
                .unwrap_or_else(|| Arc::new(IpRouteFlusher::new(defaults.ip_path.clone()))),
            self.options,
        );
        RouteController {
            orchestrator: Mutex::new(orchestrator),
        }
    }
}

impl Default for RouteControllerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
