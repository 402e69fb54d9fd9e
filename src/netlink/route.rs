//! Route requests
//!
//! Unlike rules, a route belongs to exactly one address family, inferred from its
//! destination prefix, so [`modify_route`] sends a single request.

use std::net::IpAddr;

use ipnet::IpNet;
use tracing::error;

use super::transport::NetlinkTransport;
use super::{
    put_attr, put_attr_u32, rta, Action, AddressFamily, MAX_ADDR_LEN, RTN_UNICAST, RTPROT_STATIC,
    RT_SCOPE_UNIVERSE,
};
use crate::error::RouteError;
use crate::external::InterfaceResolver;

/// Size of `struct rtmsg`.
pub const RTMSG_LEN: usize = 12;

/// Raw address bytes in a buffer sized for the largest supported family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressBuf {
    bytes: [u8; MAX_ADDR_LEN],
    len: usize,
}

impl AddressBuf {
    /// Copy `raw` into a bounded buffer.
    ///
    /// # Errors
    ///
    /// Returns `RouteError::AddressTooLong` if `raw` exceeds `MAX_ADDR_LEN`.
    pub fn from_slice(raw: &[u8]) -> Result<Self, RouteError> {
        if raw.len() > MAX_ADDR_LEN {
            error!("address too long ({} > {MAX_ADDR_LEN})", raw.len());
            return Err(RouteError::AddressTooLong { len: raw.len() });
        }
        let mut bytes = [0u8; MAX_ADDR_LEN];
        bytes[..raw.len()].copy_from_slice(raw);
        Ok(Self {
            bytes,
            len: raw.len(),
        })
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

fn raw_address(addr: IpAddr) -> Result<AddressBuf, RouteError> {
    match addr {
        IpAddr::V4(v4) => AddressBuf::from_slice(&v4.octets()),
        IpAddr::V6(v6) => AddressBuf::from_slice(&v6.octets()),
    }
}

const fn family_of(addr: IpAddr) -> AddressFamily {
    match addr {
        IpAddr::V4(_) => AddressFamily::Inet,
        IpAddr::V6(_) => AddressFamily::Inet6,
    }
}

/// A parsed destination prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prefix {
    pub family: AddressFamily,
    pub address: AddressBuf,
    pub prefix_len: u8,
}

/// Parse a CIDR literal such as `192.0.2.0/24` or `2001:db8::/32`.
///
/// # Errors
///
/// Returns `RouteError::Parse` for malformed input.
pub fn parse_prefix(input: &str) -> Result<Prefix, RouteError> {
    let net: IpNet = input.parse().map_err(|e: ipnet::AddrParseError| {
        error!("failed to parse destination {input} ({e})");
        RouteError::Parse {
            input: input.to_string(),
            reason: e.to_string(),
        }
    })?;
    Ok(Prefix {
        family: family_of(net.addr()),
        address: raw_address(net.addr())?,
        prefix_len: net.prefix_len(),
    })
}

/// One route add/delete request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteRequest<'a> {
    /// Target routing table.
    pub table: u32,
    /// Outgoing interface, resolved to an index before sending.
    pub interface: Option<&'a str>,
    /// Destination prefix in CIDR form. Required.
    pub destination: Option<&'a str>,
    /// Gateway address of the same family as the destination.
    pub nexthop: Option<&'a str>,
}

impl<'a> RouteRequest<'a> {
    #[must_use]
    pub const fn new(table: u32, destination: &'a str) -> Self {
        Self {
            table,
            interface: None,
            destination: Some(destination),
            nexthop: None,
        }
    }

    #[must_use]
    pub const fn with_interface(mut self, interface: Option<&'a str>) -> Self {
        self.interface = interface;
        self
    }

    #[must_use]
    pub const fn with_nexthop(mut self, nexthop: Option<&'a str>) -> Self {
        self.nexthop = nexthop;
        self
    }

    /// Validate the request and encode `rtmsg` plus attributes.
    ///
    /// # Errors
    ///
    /// - `RouteError::MissingDestination` if no destination was given
    /// - `RouteError::Parse` if the destination is not a valid prefix
    /// - `RouteError::NoSuchDevice` if the interface cannot be resolved
    /// - `RouteError::InvalidNexthop` if the nexthop is malformed or of another family
    pub fn encode(&self, resolver: &dyn InterfaceResolver) -> Result<Vec<u8>, RouteError> {
        let Some(destination) = self.destination else {
            error!("null destination");
            return Err(RouteError::MissingDestination);
        };
        let prefix = parse_prefix(destination)?;

        let ifindex = match self.interface {
            Some(interface) => Some(resolver.index_of(interface).ok_or_else(|| {
                error!("cannot find interface {interface}");
                RouteError::NoSuchDevice {
                    interface: interface.to_string(),
                }
            })?),
            None => None,
        };

        let gateway = match self.nexthop {
            Some(nexthop) => Some(parse_nexthop(nexthop, prefix.family)?),
            None => None,
        };

        let mut msg = Vec::with_capacity(RTMSG_LEN + 48);
        msg.extend_from_slice(&[
            prefix.family.as_u8(),
            prefix.prefix_len,
            0, // src_len
            0, // tos
            0, // table: carried in RTA_TABLE
            RTPROT_STATIC,
            RT_SCOPE_UNIVERSE,
            RTN_UNICAST,
        ]);
        msg.extend_from_slice(&0u32.to_ne_bytes());

        put_attr_u32(&mut msg, rta::TABLE, self.table);
        put_attr(&mut msg, rta::DST, prefix.address.as_bytes());
        if let Some(ifindex) = ifindex {
            put_attr_u32(&mut msg, rta::OIF, ifindex);
        }
        if let Some(gateway) = gateway {
            put_attr(&mut msg, rta::GATEWAY, gateway.as_bytes());
        }
        Ok(msg)
    }
}

fn parse_nexthop(nexthop: &str, family: AddressFamily) -> Result<AddressBuf, RouteError> {
    match nexthop.parse::<IpAddr>() {
        Ok(addr) if family_of(addr) == family => raw_address(addr),
        _ => {
            error!("failed to parse nexthop {nexthop}");
            Err(RouteError::InvalidNexthop {
                nexthop: nexthop.to_string(),
            })
        }
    }
}

/// Add or delete one route.
///
/// # Errors
///
/// Validation errors from [`RouteRequest::encode`] (nothing is sent), or the
/// transport/kernel error for the request.
pub fn modify_route(
    transport: &dyn NetlinkTransport,
    resolver: &dyn InterfaceResolver,
    action: Action,
    request: &RouteRequest<'_>,
) -> Result<(), RouteError> {
    let msg = request.encode(resolver)?;
    transport.send(action.route_message(), action.flags(), &[&msg])
}
