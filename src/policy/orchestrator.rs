//! Policy orchestrator
//!
//! Composes rule and route requests into the per-network, VPN, default-network,
//! and legacy policies. The only state held here is the interface index cache in
//! [`InterfaceTableRegistry`]; everything else lives in the kernel.
//!
//! Each composite operation stops at the first failing step and leaves the earlier
//! steps applied.

use std::sync::Arc;

use tracing::{debug, error, warn};

use super::fwmark::{Fwmark, Permission, NET_ID_MASK};
use super::priority;
use super::tables::{
    InterfaceTableRegistry, TableType, ROUTE_TABLE_LEGACY, ROUTE_TABLE_PRIVILEGED_LEGACY,
};
use crate::config::PolicyConfig;
use crate::error::RouteError;
use crate::external::{InterfaceResolver, PacketMarker, RouteFlusher};
use crate::netlink::{
    modify_route, modify_rule, Action, AddressFamily, FibRule, NetlinkTransport, RouteRequest,
    RT_TABLE_MAIN,
};

/// Whether a per-network rule change also updates the inbound packet mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marking {
    Update,
    Skip,
}

// =============================================================================
// Rule sets
// =============================================================================

/// Baseline rules installed once at startup, in installation order.
#[must_use]
pub fn baseline_rules(unreachable_fallback: bool) -> Vec<FibRule> {
    let mut fwmark = Fwmark::default();
    let mut mask = Fwmark::default();

    // Same selector as the default network rule, but below it: only reached when the
    // kernel validates a nexthop against directly-connected routes.
    mask.net_id = NET_ID_MASK;
    let mut rules = vec![FibRule::new(priority::MAIN, RT_TABLE_MAIN)
        .with_fwmark(fwmark.to_u32(), mask.to_u32())];

    mask.net_id = 0;
    mask.explicitly_selected = true;
    rules.push(
        FibRule::new(priority::LEGACY, ROUTE_TABLE_LEGACY)
            .with_fwmark(fwmark.to_u32(), mask.to_u32()),
    );

    fwmark.set_permission(Permission::ConnectivityInternal);
    mask.set_permission(Permission::ConnectivityInternal);
    rules.push(
        FibRule::new(priority::PRIVILEGED_LEGACY, ROUTE_TABLE_PRIVILEGED_LEGACY)
            .with_fwmark(fwmark.to_u32(), mask.to_u32()),
    );

    if unreachable_fallback {
        rules.push(FibRule::new(priority::UNREACHABLE, 0));
    }
    rules
}

/// The three rules that route a network's traffic to `table`, in installation order:
/// outgoing interface, implicit network id, explicit network id.
///
/// Every rule requires `permission`; a network's permission can change after its
/// sockets were marked, so it is checked here as well.
#[must_use]
pub fn per_network_rules(
    net_id: u16,
    interface: &str,
    table: u32,
    permission: Permission,
) -> [FibRule; 3] {
    let mut fwmark = Fwmark::default();
    let mut mask = Fwmark::default();

    fwmark.set_permission(permission);
    mask.set_permission(permission);
    let by_interface = FibRule::new(priority::PER_NETWORK_INTERFACE, table)
        .with_fwmark(fwmark.to_u32(), mask.to_u32())
        .with_interface(interface);

    fwmark.net_id = net_id;
    mask.net_id = NET_ID_MASK;
    let implicit = FibRule::new(priority::PER_NETWORK_NORMAL, table)
        .with_fwmark(fwmark.to_u32(), mask.to_u32());

    fwmark.explicitly_selected = true;
    mask.explicitly_selected = true;
    let explicit = FibRule::new(priority::PER_NETWORK_EXPLICIT, table)
        .with_fwmark(fwmark.to_u32(), mask.to_u32());

    [by_interface, implicit, explicit]
}

/// The two secure-VPN rules for `table`: a catch-all for traffic not protected from
/// the VPN, then an exemption for privileged traffic already bound to `net_id`.
#[must_use]
pub fn vpn_rules(net_id: u16, table: u32) -> [FibRule; 2] {
    let fwmark = Fwmark::default();
    let mut mask = Fwmark::default();
    mask.protected_from_vpn = true;
    let catch_all =
        FibRule::new(priority::SECURE_VPN, table).with_fwmark(fwmark.to_u32(), mask.to_u32());

    let mut fwmark = Fwmark {
        net_id,
        ..Fwmark::default()
    };
    let mut mask = Fwmark {
        net_id: NET_ID_MASK,
        ..Fwmark::default()
    };
    fwmark.set_permission(Permission::ConnectivityInternal);
    mask.set_permission(Permission::ConnectivityInternal);
    let privileged =
        FibRule::new(priority::SECURE_VPN, table).with_fwmark(fwmark.to_u32(), mask.to_u32());

    [catch_all, privileged]
}

/// Fallback rule for traffic with no network selected.
#[must_use]
pub fn default_network_rule(table: u32, permission: Permission) -> FibRule {
    let mut fwmark = Fwmark::default();
    let mut mask = Fwmark {
        net_id: NET_ID_MASK,
        ..Fwmark::default()
    };
    fwmark.set_permission(permission);
    mask.set_permission(permission);
    FibRule::new(priority::DEFAULT_NETWORK, table).with_fwmark(fwmark.to_u32(), mask.to_u32())
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Programs the routing policy through a [`NetlinkTransport`].
///
/// Methods take `&mut self` because the interface index cache is updated on
/// lookups; callers sharing an orchestrator across threads must serialise access.
pub struct PolicyOrchestrator {
    transport: Arc<dyn NetlinkTransport>,
    marker: Arc<dyn PacketMarker>,
    flusher: Arc<dyn RouteFlusher>,
    tables: InterfaceTableRegistry,
    options: PolicyConfig,
}

impl PolicyOrchestrator {
    pub fn new(
        transport: Arc<dyn NetlinkTransport>,
        resolver: Arc<dyn InterfaceResolver>,
        marker: Arc<dyn PacketMarker>,
        flusher: Arc<dyn RouteFlusher>,
        options: PolicyConfig,
    ) -> Self {
        Self {
            transport,
            marker,
            flusher,
            tables: InterfaceTableRegistry::new(resolver),
            options,
        }
    }

    /// Interface index cache.
    #[must_use]
    pub const fn tables(&self) -> &InterfaceTableRegistry {
        &self.tables
    }

    pub fn tables_mut(&mut self) -> &mut InterfaceTableRegistry {
        &mut self.tables
    }

    /// Install the baseline rules: main (20000), legacy (16000), privileged
    /// legacy (11000), and the unreachable fallback (21000) if enabled.
    ///
    /// # Errors
    ///
    /// Returns the first failing rule's error. Rules installed before it stay.
    pub fn initialize(&mut self) -> Result<(), RouteError> {
        for rule in baseline_rules(self.options.unreachable_fallback) {
            self.rule(Action::Add, &rule)?;
        }
        Ok(())
    }

    /// Route `net_id`'s traffic through `interface`.
    ///
    /// # Errors
    ///
    /// `RouteError::TableNotFound` if the interface was never resolvable, otherwise
    /// the first failing step.
    pub fn attach_interface_to_network(
        &mut self,
        net_id: u16,
        interface: &str,
        permission: Permission,
    ) -> Result<(), RouteError> {
        self.modify_per_network_rules(Action::Add, net_id, interface, permission, Marking::Update)
    }

    /// Undo [`attach_interface_to_network`](Self::attach_interface_to_network) and flush
    /// the interface's table.
    ///
    /// # Errors
    ///
    /// Returns the first failing step. Routes are only flushed if every rule was removed.
    pub fn detach_interface_from_network(
        &mut self,
        net_id: u16,
        interface: &str,
        permission: Permission,
    ) -> Result<(), RouteError> {
        self.modify_per_network_rules(
            Action::Delete,
            net_id,
            interface,
            permission,
            Marking::Update,
        )?;
        self.flush_routes(interface)
    }

    /// Make `interface` the VPN for network `net_id`.
    ///
    /// # Errors
    ///
    /// Returns the first failing step.
    pub fn attach_interface_to_vpn(
        &mut self,
        net_id: u16,
        interface: &str,
    ) -> Result<(), RouteError> {
        self.modify_per_network_rules(
            Action::Add,
            net_id,
            interface,
            Permission::None,
            Marking::Update,
        )?;
        self.modify_vpn_rules(Action::Add, net_id, interface)
    }

    /// Remove the VPN rules and per-network rules for `interface`, then flush its table.
    ///
    /// # Errors
    ///
    /// Returns the first failing step.
    pub fn detach_interface_from_vpn(
        &mut self,
        net_id: u16,
        interface: &str,
    ) -> Result<(), RouteError> {
        self.modify_per_network_rules(
            Action::Delete,
            net_id,
            interface,
            Permission::None,
            Marking::Update,
        )?;
        self.modify_vpn_rules(Action::Delete, net_id, interface)?;
        self.flush_routes(interface)
    }

    /// Replace the per-network rules gated by `old` with rules gated by `new`.
    ///
    /// The new rules are installed before the old ones are removed. If the removal
    /// fails, both sets stay installed.
    ///
    /// # Errors
    ///
    /// Returns the first failing step.
    pub fn change_network_permission(
        &mut self,
        net_id: u16,
        interface: &str,
        old: Permission,
        new: Permission,
    ) -> Result<(), RouteError> {
        self.modify_per_network_rules(Action::Add, net_id, interface, new, Marking::Skip)?;
        self.modify_per_network_rules(Action::Delete, net_id, interface, old, Marking::Skip)
    }

    /// Use `interface` for traffic that selected no network.
    ///
    /// # Errors
    ///
    /// `RouteError::TableNotFound` or the rule's error.
    pub fn attach_to_default_network(
        &mut self,
        interface: &str,
        permission: Permission,
    ) -> Result<(), RouteError> {
        self.modify_default_network_rule(Action::Add, interface, permission)
    }

    /// # Errors
    ///
    /// `RouteError::TableNotFound` or the rule's error.
    pub fn detach_from_default_network(
        &mut self,
        interface: &str,
        permission: Permission,
    ) -> Result<(), RouteError> {
        self.modify_default_network_rule(Action::Delete, interface, permission)
    }

    /// Add a route to the table selected by `table_type`.
    ///
    /// Adding a route that already exists succeeds for the legacy tables. A route
    /// without a nexthop is also added to the main table, where an existing copy is
    /// not an error either.
    ///
    /// `uid` is accepted for the future per-UID legacy tables and currently unused.
    ///
    /// # Errors
    ///
    /// `RouteError::TableNotFound`, validation errors, or the kernel's reply.
    pub fn add_route(
        &mut self,
        interface: &str,
        destination: &str,
        nexthop: Option<&str>,
        table_type: TableType,
        uid: u32,
    ) -> Result<(), RouteError> {
        self.modify_route(Action::Add, interface, destination, nexthop, table_type, uid)
    }

    /// Remove a route added by [`add_route`](Self::add_route).
    ///
    /// # Errors
    ///
    /// `RouteError::TableNotFound`, validation errors, or the kernel's reply.
    pub fn remove_route(
        &mut self,
        interface: &str,
        destination: &str,
        nexthop: Option<&str>,
        table_type: TableType,
        uid: u32,
    ) -> Result<(), RouteError> {
        self.modify_route(Action::Delete, interface, destination, nexthop, table_type, uid)
    }

    /// Flush every route in the interface's table for both families, then forget its
    /// cached index.
    ///
    /// # Errors
    ///
    /// `RouteError::TableNotFound`, or `RouteError::External` if a flush failed (the
    /// cached index is kept in that case).
    pub fn flush_routes(&mut self, interface: &str) -> Result<(), RouteError> {
        let table = self.table_for(interface)?;
        for family in AddressFamily::ALL {
            self.flusher.flush_table(family, table)?;
        }
        self.tables.forget(interface);
        debug!("flushed table {table} for {interface}");
        Ok(())
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn table_for(&mut self, interface: &str) -> Result<u32, RouteError> {
        self.tables.table_for_interface(interface).ok_or_else(|| {
            error!("cannot find interface {interface}");
            RouteError::TableNotFound {
                interface: interface.to_string(),
            }
        })
    }

    fn rule(&self, action: Action, rule: &FibRule) -> Result<(), RouteError> {
        debug!("{action} rule {rule}");
        modify_rule(self.transport.as_ref(), action, rule)
    }

    fn modify_per_network_rules(
        &mut self,
        action: Action,
        net_id: u16,
        interface: &str,
        permission: Permission,
        marking: Marking,
    ) -> Result<(), RouteError> {
        let table = self.table_for(interface)?;
        for rule in per_network_rules(net_id, interface, table, permission) {
            self.rule(action, &rule)?;
        }

        // Inbound packets get the network's mark so replies and accepted sockets
        // stay on this network.
        if marking == Marking::Update && self.options.mark_incoming_packets {
            self.marker
                .modify_input_mark(action, interface, u32::from(net_id))?;
        }
        Ok(())
    }

    fn modify_vpn_rules(
        &mut self,
        action: Action,
        net_id: u16,
        interface: &str,
    ) -> Result<(), RouteError> {
        let table = self.table_for(interface)?;
        for rule in vpn_rules(net_id, table) {
            self.rule(action, &rule)?;
        }
        Ok(())
    }

    fn modify_default_network_rule(
        &mut self,
        action: Action,
        interface: &str,
        permission: Permission,
    ) -> Result<(), RouteError> {
        let table = self.table_for(interface)?;
        self.rule(action, &default_network_rule(table, permission))
    }

    fn modify_route(
        &mut self,
        action: Action,
        interface: &str,
        destination: &str,
        nexthop: Option<&str>,
        table_type: TableType,
        _uid: u32,
    ) -> Result<(), RouteError> {
        let table = match table_type {
            TableType::Interface => self.tables.table_for_interface(interface),
            TableType::Legacy => Some(ROUTE_TABLE_LEGACY),
            TableType::PrivilegedLegacy => Some(ROUTE_TABLE_PRIVILEGED_LEGACY),
        }
        .ok_or_else(|| {
            error!("cannot find table for interface {interface} and table type {table_type:?}");
            RouteError::TableNotFound {
                interface: interface.to_string(),
            }
        })?;

        let request = RouteRequest::new(table, destination)
            .with_interface(Some(interface))
            .with_nexthop(nexthop);
        debug!("{action} route {destination} via {nexthop:?} dev {interface} table {table}");

        match self.route(action, &request) {
            // Repeated host-route requests for the legacy tables are expected.
            Err(e) if action.is_add() && table_type.is_legacy() && e.is_already_exists() => {
                debug!("route {destination} already in table {table}");
            }
            other => other?,
        }

        // Directly-connected routes also go in the main table so the kernel can
        // validate nexthops of routes added later.
        if nexthop.is_none() {
            let main =
                RouteRequest::new(RT_TABLE_MAIN, destination).with_interface(Some(interface));
            match self.route(action, &main) {
                // The kernel adds this route itself when the address is configured.
                Err(e) if action.is_add() && e.is_already_exists() => {
                    debug!("route {destination} already in main table");
                }
                Err(e) => {
                    warn!("failed to {action} route {destination} in main table: {e}");
                    return Err(e);
                }
                Ok(()) => {}
            }
        }
        Ok(())
    }

    fn route(&self, action: Action, request: &RouteRequest<'_>) -> Result<(), RouteError> {
        modify_route(
            self.transport.as_ref(),
            self.tables.resolver(),
            action,
            request,
        )
    }
}

impl std::fmt::Debug for PolicyOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyOrchestrator")
            .field("tables", &self.tables)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
