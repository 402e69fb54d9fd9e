//! End-to-end routing policy tests
//!
//! Each test drives a `RouteController` against `FakeKernel` and checks the rule and
//! route sets the kernel ends up with.
//!
//! # Test Categories
//!
//! 1. **Encoder validation**: rejected requests never reach the kernel
//! 2. **Table registry**: table ids survive interface removal
//! 3. **Network lifecycle**: attach/detach, VPNs, default network, permissions
//! 4. **Routes**: legacy tolerance, main-table mirroring, flushing

use std::sync::Arc;

use policy_router::error::RouteError;
use policy_router::netlink::{modify_rule, Action, FibRule, RTM_DELRULE, RTM_NEWRULE};
use policy_router::policy::{priority, Permission, TableType};
use policy_router::{KernelTransport, PolicyConfig};

use super::fake_kernel::{FakeKernel, KernelRoute};

const WLAN0_TABLE: u32 = 1003;
const MAIN_TABLE: u32 = 254;

// ============================================================================
// Test Helpers
// ============================================================================

fn kernel() -> Arc<FakeKernel> {
    FakeKernel::with_interfaces(&[("wlan0", 3), ("rmnet0", 5), ("tun0", 9)])
}

/// Distinct priorities of the installed rules, in installation order.
fn priorities(kernel: &FakeKernel) -> Vec<u32> {
    let mut out: Vec<u32> = Vec::new();
    for rule in kernel.rules() {
        if !out.contains(&rule.priority) {
            out.push(rule.priority);
        }
    }
    out
}

// ============================================================================
// Encoder Validation Tests
// ============================================================================

#[test]
fn test_mark_outside_mask_never_sent() {
    let kernel = kernel();
    let pairs = [
        (0x1, 0x0),
        (0x3, 0x1),
        (0x1_0005, 0xffff),
        (0xc_0000, 0x4_0000),
        (u32::MAX, 0xffff_fffe),
    ];
    for (mark, mask) in pairs {
        let rule = FibRule::new(priority::PER_NETWORK_NORMAL, WLAN0_TABLE).with_fwmark(mark, mask);
        let err = modify_rule(kernel.as_ref(), Action::Add, &rule).unwrap_err();
        assert!(
            matches!(err, RouteError::InvalidMark { .. }),
            "{mark:#x}/{mask:#x}"
        );
    }
    assert!(kernel.request_log().is_empty());
}

#[test]
fn test_long_interface_names_rejected() {
    let kernel = kernel();
    for len in 16..40 {
        let rule = FibRule::new(priority::PER_NETWORK_INTERFACE, WLAN0_TABLE)
            .with_interface("x".repeat(len));
        let err = modify_rule(kernel.as_ref(), Action::Add, &rule).unwrap_err();
        assert!(matches!(err, RouteError::NameTooLong { .. }), "len {len}");
        assert_eq!(err.errno(), -libc::ENAMETOOLONG);
    }
    assert!(kernel.request_log().is_empty());
}

#[test]
fn test_rule_installed_for_both_families() {
    let kernel = kernel();
    let rule = FibRule::new(priority::PER_NETWORK_INTERFACE, WLAN0_TABLE).with_interface("wlan0");
    modify_rule(kernel.as_ref(), Action::Add, &rule).unwrap();

    let rules = kernel.rules();
    assert_eq!(rules.len(), 2);
    assert_eq!(rules[0].family, libc::AF_INET as u8);
    assert_eq!(rules[1].family, libc::AF_INET6 as u8);
    assert_eq!(rules[0].oif.as_deref(), Some("wlan0"));

    // Same rule again is rejected by the kernel on the first family
    let err = modify_rule(kernel.as_ref(), Action::Add, &rule).unwrap_err();
    assert!(err.is_already_exists());
}

// ============================================================================
// Table Registry Tests
// ============================================================================

#[test]
fn test_table_survives_interface_removal() {
    let kernel = kernel();
    let controller = kernel.controller(PolicyConfig::default());

    let before = controller.table_for_interface("wlan0");
    assert_eq!(before, Some(WLAN0_TABLE));

    kernel.remove_interface("wlan0");
    assert_eq!(controller.table_for_interface("wlan0"), before);

    // Never resolved
    assert_eq!(controller.table_for_interface("eth9"), None);
}

// ============================================================================
// Network Lifecycle Tests
// ============================================================================

#[test]
fn test_initialize_installs_three_rules() {
    let kernel = kernel();
    let controller = kernel.controller(PolicyConfig::default());
    controller.initialize().unwrap();

    assert_eq!(priorities(&kernel), vec![20000, 16000, 11000]);
    // One rule per family for each
    assert_eq!(kernel.rules().len(), 6);
    assert!(kernel.routes().is_empty());
}

#[test]
fn test_initialize_with_unreachable_fallback() {
    let kernel = kernel();
    let controller = kernel.controller(PolicyConfig {
        unreachable_fallback: true,
        ..PolicyConfig::default()
    });
    controller.initialize().unwrap();
    assert_eq!(priorities(&kernel), vec![20000, 16000, 11000, 21000]);
    let unreachable: Vec<_> = kernel
        .rules()
        .into_iter()
        .filter(|r| r.priority == priority::UNREACHABLE)
        .collect();
    assert!(unreachable.iter().all(|r| r.table == 0 && r.mask == 0));
}

#[test]
fn test_initialize_twice_fails() {
    let kernel = kernel();
    let controller = kernel.controller(PolicyConfig::default());
    controller.initialize().unwrap();
    let err = controller.initialize().unwrap_err();
    assert_eq!(err.errno(), -libc::EEXIST);
    assert_eq!(kernel.rules().len(), 6);
}

#[test]
fn test_attach_detach_round_trip() {
    let kernel = kernel();
    let controller = kernel.controller(PolicyConfig::default());
    controller.initialize().unwrap();
    let baseline = kernel.rules();

    controller
        .attach_interface_to_network(5, "wlan0", Permission::None)
        .unwrap();
    assert_eq!(kernel.rules().len(), baseline.len() + 6);
    assert!(kernel.marks().contains(&("wlan0".to_string(), 5)));

    controller
        .detach_interface_from_network(5, "wlan0", Permission::None)
        .unwrap();

    let rules = kernel.rules();
    assert_eq!(rules, baseline);
    assert!(!rules.iter().any(|r| r.table == WLAN0_TABLE));
    assert!(!rules.iter().any(|r| r.oif.as_deref() == Some("wlan0")));
    assert!(!rules.iter().any(|r| r.mask & 0xffff == 0xffff && r.fwmark & 0xffff == 5));
    assert!(kernel.marks().is_empty());
}

#[test]
fn test_detach_after_interface_disappears() {
    let kernel = kernel();
    let controller = kernel.controller(PolicyConfig::default());
    controller
        .attach_interface_to_network(7, "rmnet0", Permission::ChangeNetworkState)
        .unwrap();
    controller
        .add_route("rmnet0", "0.0.0.0/0", Some("10.1.1.1"), TableType::Interface, 0)
        .unwrap();

    kernel.remove_interface("rmnet0");

    // Rules carry the name, not the index, so they can still be removed. The table
    // id comes from the cached index.
    controller
        .detach_interface_from_network(7, "rmnet0", Permission::ChangeNetworkState)
        .unwrap();
    assert!(kernel.rules().is_empty());
    assert!(kernel.routes_in(1005).is_empty());

    // The cache was dropped by the flush
    assert_eq!(controller.table_for_interface("rmnet0"), None);
}

#[test]
fn test_detach_unknown_interface() {
    let kernel = kernel();
    let controller = kernel.controller(PolicyConfig::default());
    let err = controller
        .detach_interface_from_network(5, "eth9", Permission::None)
        .unwrap_err();
    assert_eq!(err.errno(), -libc::ESRCH);
    assert!(kernel.request_log().is_empty());
}

#[test]
fn test_attach_without_packet_marking() {
    let kernel = kernel();
    let controller = kernel.controller(PolicyConfig {
        mark_incoming_packets: false,
        ..PolicyConfig::default()
    });
    controller
        .attach_interface_to_network(5, "wlan0", Permission::None)
        .unwrap();
    assert!(kernel.marks().is_empty());
    assert_eq!(kernel.rules().len(), 6);
}

#[test]
fn test_change_permission_adds_before_removing() {
    let kernel = kernel();
    let controller = kernel.controller(PolicyConfig::default());
    controller
        .attach_interface_to_network(5, "wlan0", Permission::None)
        .unwrap();
    let old_rules = kernel.rules();
    let log_start = kernel.request_log().len();

    controller
        .change_network_permission(5, "wlan0", Permission::None, Permission::ConnectivityInternal)
        .unwrap();

    let log = &kernel.request_log()[log_start..];
    let first_delete = log.iter().position(|k| *k == RTM_DELRULE).unwrap();
    assert!(log[..first_delete].iter().all(|k| *k == RTM_NEWRULE));
    assert!(log[first_delete..].iter().all(|k| *k == RTM_DELRULE));

    let rules = kernel.rules();
    assert_eq!(rules.len(), 6);
    assert!(rules.iter().all(|r| !old_rules.contains(r)));
    assert!(rules.iter().all(|r| r.fwmark & 0xc_0000 == 0xc_0000));

    // The packet mark is unchanged
    assert!(kernel.marks().contains(&("wlan0".to_string(), 5)));
}

#[test]
fn test_change_permission_removal_failure_keeps_new_rules() {
    let kernel = kernel();
    let controller = kernel.controller(PolicyConfig::default());
    controller
        .attach_interface_to_network(5, "wlan0", Permission::None)
        .unwrap();

    kernel.fail_next(RTM_DELRULE, -libc::EBUSY);
    let err = controller
        .change_network_permission(5, "wlan0", Permission::None, Permission::ChangeNetworkState)
        .unwrap_err();
    assert_eq!(err.errno(), -libc::EBUSY);
    assert!(err.is_recoverable());

    // Old and new rule sets are both installed
    let rules = kernel.rules();
    assert_eq!(rules.len(), 12);
    let new_rules: Vec<_> = rules
        .iter()
        .filter(|r| r.fwmark & 0x4_0000 != 0)
        .collect();
    assert_eq!(new_rules.len(), 6);

    // Re-running the whole change stops at the add step, which already happened
    let err = controller
        .change_network_permission(5, "wlan0", Permission::None, Permission::ChangeNetworkState)
        .unwrap_err();
    assert!(err.is_already_exists());
}

#[test]
fn test_vpn_round_trip() {
    let kernel = kernel();
    let controller = kernel.controller(PolicyConfig::default());
    controller.attach_interface_to_vpn(100, "tun0").unwrap();

    let rules = kernel.rules();
    let vpn: Vec<_> = rules
        .iter()
        .filter(|r| r.priority == priority::SECURE_VPN)
        .collect();
    assert_eq!(vpn.len(), 4);
    assert!(vpn.iter().all(|r| r.table == 1009));
    // Catch-all: not protected from VPN
    assert!(vpn.iter().any(|r| r.fwmark == 0 && r.mask == 0x2_0000));
    // Privileged exemption for network 100
    assert!(vpn.iter().any(|r| r.fwmark == 0xc_0064 && r.mask == 0xc_ffff));

    controller
        .add_route("tun0", "0.0.0.0/0", None, TableType::Interface, 0)
        .unwrap();
    controller.detach_interface_from_vpn(100, "tun0").unwrap();

    assert!(kernel.rules().is_empty());
    assert!(kernel.routes_in(1009).is_empty());
    assert!(kernel.marks().is_empty());
}

#[test]
fn test_default_network() {
    let kernel = kernel();
    let controller = kernel.controller(PolicyConfig::default());
    controller
        .attach_to_default_network("wlan0", Permission::ChangeNetworkState)
        .unwrap();

    let rules = kernel.rules();
    assert_eq!(rules.len(), 2);
    assert!(rules.iter().all(|r| r.priority == priority::DEFAULT_NETWORK
        && r.table == WLAN0_TABLE
        && r.fwmark == 0x4_0000
        && r.mask == 0x4_ffff));

    // Must be removed with the permission it was added with
    let err = controller
        .detach_from_default_network("wlan0", Permission::None)
        .unwrap_err();
    assert_eq!(err.errno(), -libc::ENOENT);

    controller
        .detach_from_default_network("wlan0", Permission::ChangeNetworkState)
        .unwrap();
    assert!(kernel.rules().is_empty());
}

// ============================================================================
// Route Tests
// ============================================================================

#[test]
fn test_legacy_route_added_twice() {
    let kernel = kernel();
    let controller = kernel.controller(PolicyConfig::default());
    for _ in 0..2 {
        controller
            .add_route("wlan0", "192.0.2.0/24", None, TableType::Legacy, 10_123)
            .unwrap();
    }
    assert_eq!(kernel.routes_in(98).len(), 1);
    assert_eq!(kernel.routes_in(MAIN_TABLE).len(), 1);
}

#[test]
fn test_privileged_legacy_route_added_twice() {
    let kernel = kernel();
    let controller = kernel.controller(PolicyConfig::default());
    for _ in 0..2 {
        controller
            .add_route(
                "wlan0",
                "198.51.100.7/32",
                Some("192.168.1.1"),
                TableType::PrivilegedLegacy,
                0,
            )
            .unwrap();
    }
    assert_eq!(kernel.routes_in(99).len(), 1);
}

#[test]
fn test_interface_route_added_twice_fails() {
    let kernel = kernel();
    let controller = kernel.controller(PolicyConfig::default());
    controller
        .add_route("wlan0", "10.0.0.0/24", None, TableType::Interface, 0)
        .unwrap();
    let err = controller
        .add_route("wlan0", "10.0.0.0/24", None, TableType::Interface, 0)
        .unwrap_err();
    assert!(err.is_already_exists());
}

#[test]
fn test_connected_route_mirrored_to_main() {
    let kernel = kernel();
    let controller = kernel.controller(PolicyConfig::default());
    controller
        .add_route("wlan0", "10.0.0.0/24", None, TableType::Interface, 0)
        .unwrap();

    let interface = kernel.routes_in(WLAN0_TABLE);
    let main = kernel.routes_in(MAIN_TABLE);
    assert_eq!(interface.len(), 1);
    assert_eq!(main.len(), 1);
    for route in [&interface[0], &main[0]] {
        assert_eq!(route.destination, vec![10, 0, 0, 0]);
        assert_eq!(route.prefix_len, 24);
        assert_eq!(route.oif, Some(3));
        assert_eq!(route.gateway, None);
    }
}

#[test]
fn test_connected_route_already_in_main() {
    let kernel = kernel();
    kernel.insert_route(KernelRoute {
        family: libc::AF_INET as u8,
        table: MAIN_TABLE,
        destination: vec![10, 0, 0, 0],
        prefix_len: 24,
        oif: Some(3),
        gateway: None,
    });
    let controller = kernel.controller(PolicyConfig::default());
    controller
        .add_route("wlan0", "10.0.0.0/24", None, TableType::Interface, 0)
        .unwrap();
    assert_eq!(kernel.routes_in(WLAN0_TABLE).len(), 1);
    assert_eq!(kernel.routes_in(MAIN_TABLE).len(), 1);
}

#[test]
fn test_gateway_route_ipv6() {
    let kernel = kernel();
    let controller = kernel.controller(PolicyConfig::default());
    controller
        .add_route("wlan0", "::/0", Some("fe80::1"), TableType::Interface, 0)
        .unwrap();

    let routes = kernel.routes();
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].family, libc::AF_INET6 as u8);
    assert_eq!(routes[0].gateway.as_ref().map(Vec::len), Some(16));

    controller
        .remove_route("wlan0", "::/0", Some("fe80::1"), TableType::Interface, 0)
        .unwrap();
    assert!(kernel.routes().is_empty());
}

#[test]
fn test_route_validation() {
    let kernel = kernel();
    let controller = kernel.controller(PolicyConfig::default());

    let err = controller
        .add_route("wlan0", "10.0.0.0/33", None, TableType::Interface, 0)
        .unwrap_err();
    assert!(matches!(err, RouteError::Parse { .. }));

    let err = controller
        .add_route("wlan0", "10.0.0.0/8", Some("fe80::1"), TableType::Interface, 0)
        .unwrap_err();
    assert!(matches!(err, RouteError::InvalidNexthop { .. }));

    let err = controller
        .add_route("eth9", "10.0.0.0/8", None, TableType::Legacy, 0)
        .unwrap_err();
    assert_eq!(err.errno(), -libc::ENODEV);

    assert!(kernel.request_log().is_empty());
}

#[test]
fn test_remove_connected_route() {
    let kernel = kernel();
    let controller = kernel.controller(PolicyConfig::default());
    controller
        .add_route("wlan0", "10.0.0.0/24", None, TableType::Interface, 0)
        .unwrap();
    controller
        .remove_route("wlan0", "10.0.0.0/24", None, TableType::Interface, 0)
        .unwrap();
    assert!(kernel.routes().is_empty());

    let err = controller
        .remove_route("wlan0", "10.0.0.0/24", None, TableType::Interface, 0)
        .unwrap_err();
    assert_eq!(err.errno(), -libc::ESRCH);
}

#[test]
fn test_flush_routes() {
    let kernel = kernel();
    let controller = kernel.controller(PolicyConfig::default());
    controller
        .add_route("wlan0", "10.0.0.0/24", None, TableType::Interface, 0)
        .unwrap();
    controller
        .add_route("wlan0", "2001:db8::/64", None, TableType::Interface, 0)
        .unwrap();
    controller
        .add_route("rmnet0", "10.9.0.0/16", None, TableType::Interface, 0)
        .unwrap();

    controller.flush_routes("wlan0").unwrap();
    assert!(kernel.routes_in(WLAN0_TABLE).is_empty());
    assert_eq!(kernel.routes_in(1005).len(), 1);
    // Main table copies are left alone
    assert_eq!(kernel.routes_in(MAIN_TABLE).len(), 3);
}

// ============================================================================
// Kernel Tests (require CAP_NET_ADMIN)
// ============================================================================

#[test]
#[ignore = "requires CAP_NET_ADMIN"]
fn test_kernel_rejects_missing_rule_delete() {
    let transport = KernelTransport::new();
    let rule = FibRule::new(29_999, 29_999).with_fwmark(0x1234, 0xffff);
    let err = modify_rule(&transport, Action::Delete, &rule).unwrap_err();
    assert_eq!(err.errno(), -libc::ENOENT);
}
