//! FIB rule requests
//!
//! A [`FibRule`] describes one logical policy-routing rule. The kernel keeps separate
//! rule chains per address family, so [`modify_rule`] materialises it twice: once for
//! IPv4, then once for IPv6. A failure on IPv4 stops before IPv6 is attempted; a
//! failure on IPv6 leaves the IPv4 change in place.
//!
//! # Example
//!
//! ```
//! use policy_router::netlink::FibRule;
//!
//! let rule = FibRule::new(17000, 1003).with_fwmark(0x5, 0xffff);
//! let attrs = rule.encode_attributes().unwrap();
//! // priority, table, fwmark and fwmask: four 8-byte attributes
//! assert_eq!(attrs.len(), 32);
//!
//! // Set mark bits must be covered by the mask
//! assert!(FibRule::new(17000, 1003).with_fwmark(0x5, 0x1).encode_attributes().is_err());
//! ```

use tracing::error;

use super::transport::NetlinkTransport;
use super::{fr_act, fra, put_attr, put_attr_u32, Action, AddressFamily, IFNAMSIZ};
use crate::error::RouteError;

/// Size of `struct fib_rule_hdr`.
pub const FIB_RULE_HDR_LEN: usize = 12;

/// One policy-routing rule, independent of address family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FibRule {
    /// Lower values are evaluated first.
    pub priority: u32,
    /// Table to look up; zero makes the rule return "unreachable".
    pub table: u32,
    pub fwmark: u32,
    /// Mark bits that must match. Zero means the rule ignores the mark.
    pub mask: u32,
    /// Outgoing interface selector.
    pub interface: Option<String>,
    pub uid_start: Option<u32>,
    pub uid_end: Option<u32>,
}

impl FibRule {
    /// Rule at `priority` pointing at `table`, matching everything.
    #[must_use]
    pub const fn new(priority: u32, table: u32) -> Self {
        Self {
            priority,
            table,
            fwmark: 0,
            mask: 0,
            interface: None,
            uid_start: None,
            uid_end: None,
        }
    }

    #[must_use]
    pub const fn with_fwmark(mut self, fwmark: u32, mask: u32) -> Self {
        self.fwmark = fwmark;
        self.mask = mask;
        self
    }

    #[must_use]
    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    /// Restrict the rule to a UID range. Both ends must be given, or neither.
    #[must_use]
    pub const fn with_uid_range(mut self, start: Option<u32>, end: Option<u32>) -> Self {
        self.uid_start = start;
        self.uid_end = end;
        self
    }

    /// Kernel action byte for this rule.
    #[must_use]
    pub const fn action(&self) -> u8 {
        if self.table != 0 {
            fr_act::TO_TBL
        } else {
            fr_act::UNREACHABLE
        }
    }

    /// Encode the `fib_rule_hdr` for `family`.
    #[must_use]
    pub fn encode_header(&self, family: AddressFamily) -> [u8; FIB_RULE_HDR_LEN] {
        let mut header = [0u8; FIB_RULE_HDR_LEN];
        header[0] = family.as_u8();
        // dst_len, src_len, tos, table, res1, res2 stay zero
        header[7] = self.action();
        header
    }

    /// Validate the rule and encode its attributes.
    ///
    /// Attributes are appended only when meaningful: priority always, table when
    /// nonzero, fwmark and mask when the mask is nonzero, the UID pair when a range
    /// is set, and the outgoing interface name (NUL-terminated and padded) when set.
    ///
    /// # Errors
    ///
    /// Checked in this order:
    /// - `RouteError::InvalidMark` if `fwmark` has bits outside `mask`
    /// - `RouteError::NameTooLong` / `RouteError::InvalidName` for a bad interface name
    /// - `RouteError::InvalidUidRange` if only one end of the UID range is set
    pub fn encode_attributes(&self) -> Result<Vec<u8>, RouteError> {
        if self.fwmark & !self.mask != 0 {
            error!(
                "mask 0x{:x} does not select all the bits set in fwmark 0x{:x}",
                self.mask, self.fwmark
            );
            return Err(RouteError::InvalidMark {
                mark: self.fwmark,
                mask: self.mask,
            });
        }

        let oifname = self.interface.as_deref().map(encode_ifname).transpose()?;

        let uid_range = match (self.uid_start, self.uid_end) {
            (Some(start), Some(end)) => Some((start, end)),
            (None, None) => None,
            (start, end) => {
                error!("incompatible start and end UIDs ({start:?} vs {end:?})");
                return Err(RouteError::InvalidUidRange { start, end });
            }
        };

        let mut attrs = Vec::with_capacity(64);
        put_attr_u32(&mut attrs, fra::PRIORITY, self.priority);
        if self.table != 0 {
            put_attr_u32(&mut attrs, fra::TABLE, self.table);
        }
        if self.mask != 0 {
            put_attr_u32(&mut attrs, fra::FWMARK, self.fwmark);
            put_attr_u32(&mut attrs, fra::FWMASK, self.mask);
        }
        if let Some((start, end)) = uid_range {
            put_attr_u32(&mut attrs, fra::UID_START, start);
            put_attr_u32(&mut attrs, fra::UID_END, end);
        }
        if let Some(name) = &oifname {
            // Exactly one terminating NUL plus padding, or older kernels refuse deletes.
            put_attr(&mut attrs, fra::OIFNAME, name);
        }
        Ok(attrs)
    }
}

impl std::fmt::Display for FibRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: ", self.priority)?;
        if self.mask != 0 {
            write!(f, "fwmark 0x{:x}/0x{:x} ", self.fwmark, self.mask)?;
        }
        if let (Some(start), Some(end)) = (self.uid_start, self.uid_end) {
            write!(f, "uidrange {start}-{end} ")?;
        }
        if let Some(interface) = &self.interface {
            write!(f, "oif {interface} ")?;
        }
        if self.table != 0 {
            write!(f, "lookup {}", self.table)
        } else {
            f.write_str("unreachable")
        }
    }
}

/// NUL-terminated interface name, bounded by `IFNAMSIZ`.
fn encode_ifname(name: &str) -> Result<Vec<u8>, RouteError> {
    if name.as_bytes().contains(&0) {
        error!("interface name contains a NUL byte ({name:?})");
        return Err(RouteError::InvalidName { name: name.into() });
    }
    let len = name.len() + 1;
    if len > IFNAMSIZ {
        error!("interface name too long ({len} > {IFNAMSIZ})");
        return Err(RouteError::NameTooLong {
            name: name.into(),
            len,
        });
    }
    let mut encoded = Vec::with_capacity(len);
    encoded.extend_from_slice(name.as_bytes());
    encoded.push(0);
    Ok(encoded)
}

/// Add or delete `rule` for IPv4 and then IPv6.
///
/// The attributes are encoded once; only the family byte of the header changes
/// between the two requests. Nothing is sent if validation fails.
///
/// # Errors
///
/// Validation errors from [`FibRule::encode_attributes`], or the first transport
/// error. An IPv6 failure leaves the IPv4 rule applied.
pub fn modify_rule(
    transport: &dyn NetlinkTransport,
    action: Action,
    rule: &FibRule,
) -> Result<(), RouteError> {
    let attrs = rule.encode_attributes()?;
    for family in AddressFamily::ALL {
        let header = rule.encode_header(family);
        transport.send(action.rule_message(), action.flags(), &[&header, &attrs])?;
    }
    Ok(())
}
