//! rtnetlink request encoding and transport
//!
//! Requests are hand-packed: a fixed header followed by tag-length-value attributes,
//! each attribute padded to a 4-byte boundary. This module holds the kernel ABI
//! constants and the small encoding helpers shared by the rule and route encoders.
//!
//! # Message layout
//!
//! ```text
//! +-----------+----------------------+--------+---------+--------+---------+
//! | nlmsghdr  | fib_rule_hdr / rtmsg | rtattr | payload | rtattr | payload | ...
//! | 16 bytes  | 12 bytes             | 4      | N (+pad)| 4      | N (+pad)|
//! +-----------+----------------------+--------+---------+--------+---------+
//! ```
//!
//! The `nlmsghdr` is generated by [`transport`]; encoders only produce the segments
//! that follow it.

pub mod route;
pub mod rule;
pub mod transport;

pub use route::{modify_route, RouteRequest};
pub use rule::{modify_rule, FibRule};
pub use transport::{KernelTransport, NetlinkTransport};

// =============================================================================
// Kernel ABI constants
// =============================================================================

/// Maximum interface name length including the terminating NUL (`IFNAMSIZ`).
pub const IFNAMSIZ: usize = 16;

/// Capacity of a raw address buffer (`sizeof(struct in6_addr)`).
pub const MAX_ADDR_LEN: usize = 16;

/// Attribute alignment (`RTA_ALIGNTO`).
pub const RTA_ALIGNTO: usize = 4;

/// Size of `struct nlmsghdr`.
pub const NLMSG_HDRLEN: usize = 16;

/// Size of `struct nlmsgerr`: a signed errno followed by the offending header.
pub const NLMSGERR_LEN: usize = 4 + NLMSG_HDRLEN;

/// Size of an acknowledgment: `nlmsghdr` followed by `nlmsgerr`.
pub const ACK_LEN: usize = NLMSG_HDRLEN + NLMSGERR_LEN;

/// Kernel main routing table.
pub const RT_TABLE_MAIN: u32 = 254;

pub const RTM_NEWROUTE: u16 = 24;
pub const RTM_DELROUTE: u16 = 25;
pub const RTM_NEWRULE: u16 = 32;
pub const RTM_DELRULE: u16 = 33;

/// Every request asks for an acknowledgment.
pub const REQUEST_FLAGS: u16 = (libc::NLM_F_REQUEST | libc::NLM_F_ACK) as u16;

/// Add requests fail with `EEXIST` instead of replacing existing state.
pub const CREATE_REQUEST_FLAGS: u16 =
    REQUEST_FLAGS | (libc::NLM_F_CREATE | libc::NLM_F_EXCL) as u16;

/// FIB rule attribute types (`linux/fib_rules.h`).
pub mod fra {
    pub const PRIORITY: u16 = 6;
    pub const FWMARK: u16 = 10;
    pub const TABLE: u16 = 15;
    pub const FWMASK: u16 = 16;
    pub const OIFNAME: u16 = 17;
    /// UID range attributes. Not upstream; numbered after the vendor kernel patches
    /// that introduced them.
    pub const UID_START: u16 = 18;
    pub const UID_END: u16 = 19;
}

/// FIB rule actions.
pub mod fr_act {
    pub const TO_TBL: u8 = 1;
    pub const UNREACHABLE: u8 = 7;
}

/// Route attribute types (`linux/rtnetlink.h`).
pub mod rta {
    pub const DST: u16 = 1;
    pub const OIF: u16 = 4;
    pub const GATEWAY: u16 = 5;
    pub const TABLE: u16 = 15;
}

pub const RTPROT_STATIC: u8 = 4;
pub const RTN_UNICAST: u8 = 1;
pub const RT_SCOPE_UNIVERSE: u8 = 0;

// =============================================================================
// Request kinds and address families
// =============================================================================

/// Whether a request installs or removes kernel state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Add,
    Delete,
}

impl Action {
    /// Message type for a rule request.
    #[must_use]
    pub const fn rule_message(self) -> u16 {
        match self {
            Self::Add => RTM_NEWRULE,
            Self::Delete => RTM_DELRULE,
        }
    }

    /// Message type for a route request.
    #[must_use]
    pub const fn route_message(self) -> u16 {
        match self {
            Self::Add => RTM_NEWROUTE,
            Self::Delete => RTM_DELROUTE,
        }
    }

    /// Header flags for this action.
    #[must_use]
    pub const fn flags(self) -> u16 {
        match self {
            Self::Add => CREATE_REQUEST_FLAGS,
            Self::Delete => REQUEST_FLAGS,
        }
    }

    #[must_use]
    pub const fn is_add(self) -> bool {
        matches!(self, Self::Add)
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Add => f.write_str("add"),
            Self::Delete => f.write_str("delete"),
        }
    }
}

/// Address family of a rule chain or route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    Inet,
    Inet6,
}

impl AddressFamily {
    /// Families with independent kernel rule chains, in update order.
    pub const ALL: [Self; 2] = [Self::Inet, Self::Inet6];

    /// `AF_INET` / `AF_INET6`.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Inet => libc::AF_INET as u8,
            Self::Inet6 => libc::AF_INET6 as u8,
        }
    }

    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value as libc::c_int {
            libc::AF_INET => Some(Self::Inet),
            libc::AF_INET6 => Some(Self::Inet6),
            _ => None,
        }
    }

    /// Raw address length for this family.
    #[must_use]
    pub const fn address_len(self) -> usize {
        match self {
            Self::Inet => 4,
            Self::Inet6 => 16,
        }
    }

    /// Family selector understood by `ip(8)`.
    #[must_use]
    pub const fn ip_flag(self) -> &'static str {
        match self {
            Self::Inet => "-4",
            Self::Inet6 => "-6",
        }
    }
}

// =============================================================================
// Attribute helpers
// =============================================================================

/// Round `len` up to the attribute alignment (`RTA_ALIGN`).
#[must_use]
pub const fn rta_align(len: usize) -> usize {
    (len + RTA_ALIGNTO - 1) & !(RTA_ALIGNTO - 1)
}

/// Attribute length for a payload of `len` bytes, without trailing padding (`RTA_LENGTH`).
#[must_use]
pub const fn rta_length(len: usize) -> usize {
    rta_align(4) + len
}

/// Attribute length including trailing padding (`RTA_SPACE`).
#[must_use]
pub const fn rta_space(len: usize) -> usize {
    rta_align(rta_length(len))
}

/// Append one attribute: `rtattr` header, payload, and alignment padding.
pub(crate) fn put_attr(buf: &mut Vec<u8>, kind: u16, payload: &[u8]) {
    let len = u16::try_from(rta_length(payload.len())).unwrap_or(u16::MAX);
    buf.extend_from_slice(&len.to_ne_bytes());
    buf.extend_from_slice(&kind.to_ne_bytes());
    buf.extend_from_slice(payload);
    let padding = rta_space(payload.len()) - rta_length(payload.len());
    buf.resize(buf.len() + padding, 0);
}

pub(crate) fn put_attr_u32(buf: &mut Vec<u8>, kind: u16, value: u32) {
    put_attr(buf, kind, &value.to_ne_bytes());
}

/// Encode the `nlmsghdr` that precedes a request whose segments total `payload_len`.
#[must_use]
pub fn encode_header(kind: u16, flags: u16, payload_len: usize) -> [u8; NLMSG_HDRLEN] {
    let total = u32::try_from(NLMSG_HDRLEN + payload_len).unwrap_or(u32::MAX);
    let mut header = [0u8; NLMSG_HDRLEN];
    header[0..4].copy_from_slice(&total.to_ne_bytes());
    header[4..6].copy_from_slice(&kind.to_ne_bytes());
    header[6..8].copy_from_slice(&flags.to_ne_bytes());
    // seq and pid stay zero; every request uses its own socket.
    header
}
