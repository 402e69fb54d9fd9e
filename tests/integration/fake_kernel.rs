//! In-memory kernel for integration tests
//!
//! `FakeKernel` decodes every rtnetlink request the crate sends and applies it to
//! its own rule and route sets, answering the way the kernel does: `EEXIST` for
//! exclusive creates of existing state, `ENOENT`/`ESRCH` for deletes of missing
//! state. It also stands in for the interface resolver, packet marker, and route
//! flusher, so a whole `RouteController` can run against it.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;

use policy_router::controller::RouteController;
use policy_router::error::RouteError;
use policy_router::external::{InterfaceResolver, PacketMarker, RouteFlusher};
use policy_router::netlink::{
    fra, rta, Action, AddressFamily, NetlinkTransport, CREATE_REQUEST_FLAGS, REQUEST_FLAGS,
    RTM_DELROUTE, RTM_DELRULE, RTM_NEWROUTE, RTM_NEWRULE,
};
use policy_router::PolicyConfig;

/// A FIB rule as the kernel stores it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct KernelRule {
    pub family: u8,
    pub priority: u32,
    pub table: u32,
    pub action: u8,
    pub fwmark: u32,
    pub mask: u32,
    pub oif: Option<String>,
    pub uid_range: Option<(u32, u32)>,
}

/// A route as the kernel stores it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct KernelRoute {
    pub family: u8,
    pub table: u32,
    pub destination: Vec<u8>,
    pub prefix_len: u8,
    pub oif: Option<u32>,
    pub gateway: Option<Vec<u8>>,
}

impl KernelRoute {
    fn same_prefix(&self, other: &Self) -> bool {
        self.family == other.family
            && self.table == other.table
            && self.destination == other.destination
            && self.prefix_len == other.prefix_len
    }
}

#[derive(Debug, Default)]
struct State {
    interfaces: HashMap<String, u32>,
    rules: Vec<KernelRule>,
    routes: Vec<KernelRoute>,
    marks: BTreeSet<(String, u32)>,
    /// Every request kind, in arrival order.
    log: Vec<u16>,
    /// Kind → errno to return for the next request of that kind.
    failures: HashMap<u16, i32>,
}

#[derive(Debug, Default)]
pub struct FakeKernel {
    state: Mutex<State>,
}

impl FakeKernel {
    pub fn with_interfaces(interfaces: &[(&str, u32)]) -> Arc<Self> {
        let kernel = Arc::new(Self::default());
        for (name, index) in interfaces {
            kernel.add_interface(name, *index);
        }
        kernel
    }

    /// Controller whose every collaborator is this kernel.
    pub fn controller(self: &Arc<Self>, options: PolicyConfig) -> RouteController {
        RouteController::builder()
            .transport(self.clone())
            .resolver(self.clone())
            .marker(self.clone())
            .flusher(self.clone())
            .options(options)
            .build()
    }

    pub fn add_interface(&self, name: &str, index: u32) {
        self.state.lock().interfaces.insert(name.to_string(), index);
    }

    pub fn remove_interface(&self, name: &str) {
        self.state.lock().interfaces.remove(name);
    }

    /// Fail the next request of `kind` with `errno` without applying it.
    pub fn fail_next(&self, kind: u16, errno: i32) {
        self.state.lock().failures.insert(kind, errno);
    }

    pub fn rules(&self) -> Vec<KernelRule> {
        self.state.lock().rules.clone()
    }

    pub fn routes(&self) -> Vec<KernelRoute> {
        self.state.lock().routes.clone()
    }

    pub fn marks(&self) -> BTreeSet<(String, u32)> {
        self.state.lock().marks.clone()
    }

    pub fn request_log(&self) -> Vec<u16> {
        self.state.lock().log.clone()
    }

    pub fn routes_in(&self, table: u32) -> Vec<KernelRoute> {
        self.routes().into_iter().filter(|r| r.table == table).collect()
    }

    /// Install a route directly, as the kernel does when an address is configured.
    pub fn insert_route(&self, route: KernelRoute) {
        self.state.lock().routes.push(route);
    }
}

// =============================================================================
// Decoding
// =============================================================================

fn attributes(mut buf: &[u8]) -> Vec<(u16, &[u8])> {
    let mut out = Vec::new();
    while buf.len() >= 4 {
        let len = u16::from_ne_bytes([buf[0], buf[1]]) as usize;
        let kind = u16::from_ne_bytes([buf[2], buf[3]]);
        assert!(len >= 4 && len <= buf.len(), "malformed attribute");
        out.push((kind, &buf[4..len]));
        let aligned = (len + 3) & !3;
        buf = &buf[aligned.min(buf.len())..];
    }
    assert!(buf.is_empty(), "trailing bytes after attributes");
    out
}

fn as_u32(payload: &[u8]) -> u32 {
    u32::from_ne_bytes(payload.try_into().expect("u32 attribute"))
}

fn decode_rule(body: &[u8]) -> KernelRule {
    let mut rule = KernelRule {
        family: body[0],
        priority: 0,
        table: 0,
        action: body[7],
        fwmark: 0,
        mask: 0,
        oif: None,
        uid_range: None,
    };
    let mut uid_start = None;
    let mut uid_end = None;
    for (kind, payload) in attributes(&body[12..]) {
        match kind {
            fra::PRIORITY => rule.priority = as_u32(payload),
            fra::TABLE => rule.table = as_u32(payload),
            fra::FWMARK => rule.fwmark = as_u32(payload),
            fra::FWMASK => rule.mask = as_u32(payload),
            fra::OIFNAME => {
                let name = payload.strip_suffix(b"\0").expect("NUL-terminated name");
                rule.oif = Some(String::from_utf8(name.to_vec()).expect("utf-8 name"));
            }
            fra::UID_START => uid_start = Some(as_u32(payload)),
            fra::UID_END => uid_end = Some(as_u32(payload)),
            other => panic!("unexpected rule attribute {other}"),
        }
    }
    rule.uid_range = uid_start.zip(uid_end);
    rule
}

fn decode_route(body: &[u8]) -> KernelRoute {
    let mut route = KernelRoute {
        family: body[0],
        table: 0,
        destination: Vec::new(),
        prefix_len: body[1],
        oif: None,
        gateway: None,
    };
    for (kind, payload) in attributes(&body[12..]) {
        match kind {
            rta::TABLE => route.table = as_u32(payload),
            rta::DST => route.destination = payload.to_vec(),
            rta::OIF => route.oif = Some(as_u32(payload)),
            rta::GATEWAY => route.gateway = Some(payload.to_vec()),
            other => panic!("unexpected route attribute {other}"),
        }
    }
    route
}

// =============================================================================
// Collaborator implementations
// =============================================================================

impl NetlinkTransport for FakeKernel {
    fn send(&self, kind: u16, flags: u16, segments: &[&[u8]]) -> Result<(), RouteError> {
        let body = segments.concat();
        let mut state = self.state.lock();
        state.log.push(kind);

        let expected_flags = match kind {
            RTM_NEWRULE | RTM_NEWROUTE => CREATE_REQUEST_FLAGS,
            _ => REQUEST_FLAGS,
        };
        assert_eq!(flags, expected_flags, "wrong flags for request {kind}");

        if let Some(errno) = state.failures.remove(&kind) {
            return Err(RouteError::Kernel { errno });
        }

        let errno = match kind {
            RTM_NEWRULE => {
                let rule = decode_rule(&body);
                if state.rules.contains(&rule) {
                    -libc::EEXIST
                } else {
                    state.rules.push(rule);
                    0
                }
            }
            RTM_DELRULE => {
                let rule = decode_rule(&body);
                match state.rules.iter().position(|r| *r == rule) {
                    Some(i) => {
                        state.rules.remove(i);
                        0
                    }
                    None => -libc::ENOENT,
                }
            }
            RTM_NEWROUTE => {
                let route = decode_route(&body);
                if state.routes.iter().any(|r| r.same_prefix(&route)) {
                    -libc::EEXIST
                } else {
                    state.routes.push(route);
                    0
                }
            }
            RTM_DELROUTE => {
                let route = decode_route(&body);
                match state.routes.iter().position(|r| r.same_prefix(&route)) {
                    Some(i) => {
                        state.routes.remove(i);
                        0
                    }
                    None => -libc::ESRCH,
                }
            }
            other => panic!("unexpected request kind {other}"),
        };

        if errno == 0 {
            Ok(())
        } else {
            Err(RouteError::Kernel { errno })
        }
    }
}

impl InterfaceResolver for FakeKernel {
    fn index_of(&self, name: &str) -> Option<u32> {
        self.state.lock().interfaces.get(name).copied()
    }
}

impl PacketMarker for FakeKernel {
    fn modify_input_mark(
        &self,
        action: Action,
        interface: &str,
        net_id: u32,
    ) -> Result<(), RouteError> {
        let mut state = self.state.lock();
        let entry = (interface.to_string(), net_id);
        let changed = match action {
            Action::Add => state.marks.insert(entry),
            Action::Delete => state.marks.remove(&entry),
        };
        if changed {
            Ok(())
        } else {
            Err(RouteError::external("iptables", "exit status: 1"))
        }
    }
}

impl RouteFlusher for FakeKernel {
    fn flush_table(&self, family: AddressFamily, table: u32) -> Result<(), RouteError> {
        self.state
            .lock()
            .routes
            .retain(|r| !(r.table == table && r.family == family.as_u8()));
        Ok(())
    }
}
