//! Firewall mark (fwmark) layout
//!
//! Sockets carry a 32-bit mark that the policy rules match on. The mark is packed
//! from four fields; a rule pairs a mark with a mask of the same layout, where a set
//! bit means "this bit must match".
//!
//! ```text
//!  31        20 19  18 17  16 15                    0
//! +------------+------+---+---+-----------------------+
//! |   unused   | perm |pvn|exp|        net id         |
//! +------------+------+---+---+-----------------------+
//! ```
//!
//! - `net id`: network the socket is bound to (0 = none selected)
//! - `exp`: the network was explicitly selected by the application
//! - `pvn`: protected from VPN (traffic may bypass VPN rules)
//! - `perm`: permission level of the originating application
//!
//! # Example
//!
//! ```
//! use policy_router::policy::fwmark::{Fwmark, Permission, NET_ID_MASK};
//!
//! let mut mark = Fwmark::default();
//! let mut mask = Fwmark::default();
//! mark.net_id = 5;
//! mask.net_id = NET_ID_MASK;
//! mark.explicitly_selected = true;
//! mask.explicitly_selected = true;
//!
//! assert_eq!(mark.to_u32(), 0x1_0005);
//! assert_eq!(mask.to_u32(), 0x1_ffff);
//! assert_eq!(Fwmark::from_u32(0x1_0005), mark);
//! ```

/// Mask value selecting every network id bit.
pub const NET_ID_MASK: u16 = 0xffff;

const EXPLICITLY_SELECTED_BIT: u32 = 1 << 16;
const PROTECTED_FROM_VPN_BIT: u32 = 1 << 17;
const PERMISSION_SHIFT: u32 = 18;
const PERMISSION_BITS: u32 = 0b11;

/// Permission level a network requires of the traffic routed over it.
///
/// Levels are cumulative: `ConnectivityInternal` includes every bit of
/// `ChangeNetworkState`, so a mask built from a permission matches any mark whose
/// permission is at least that level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Permission {
    /// No permission required.
    #[default]
    None,
    /// Applications allowed to change network state.
    ChangeNetworkState,
    /// Privileged system components.
    ConnectivityInternal,
}

impl Permission {
    /// Two-bit encoding stored in the mark.
    #[must_use]
    pub const fn bits(self) -> u8 {
        match self {
            Self::None => 0x0,
            Self::ChangeNetworkState => 0x1,
            Self::ConnectivityInternal => 0x3,
        }
    }

    #[must_use]
    pub const fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0x0 => Some(Self::None),
            0x1 => Some(Self::ChangeNetworkState),
            0x3 => Some(Self::ConnectivityInternal),
            _ => None,
        }
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::ChangeNetworkState => "network",
            Self::ConnectivityInternal => "system",
        })
    }
}

impl std::str::FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "network" | "change_network_state" => Ok(Self::ChangeNetworkState),
            "system" | "connectivity_internal" => Ok(Self::ConnectivityInternal),
            other => Err(format!("unknown permission: {other}")),
        }
    }
}

/// Unpacked mark (or mask) value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Fwmark {
    pub net_id: u16,
    pub explicitly_selected: bool,
    pub protected_from_vpn: bool,
    /// Raw two-bit permission field. For masks, the bits that must match.
    pub permission: u8,
}

impl Fwmark {
    /// Set the permission field from a [`Permission`] level.
    pub fn set_permission(&mut self, permission: Permission) {
        self.permission = permission.bits();
    }

    /// Packed 32-bit representation.
    #[must_use]
    pub const fn to_u32(self) -> u32 {
        let mut value = self.net_id as u32;
        if self.explicitly_selected {
            value |= EXPLICITLY_SELECTED_BIT;
        }
        if self.protected_from_vpn {
            value |= PROTECTED_FROM_VPN_BIT;
        }
        value | (((self.permission as u32) & PERMISSION_BITS) << PERMISSION_SHIFT)
    }

    #[must_use]
    pub const fn from_u32(value: u32) -> Self {
        Self {
            net_id: (value & NET_ID_MASK as u32) as u16,
            explicitly_selected: value & EXPLICITLY_SELECTED_BIT != 0,
            protected_from_vpn: value & PROTECTED_FROM_VPN_BIT != 0,
            permission: ((value >> PERMISSION_SHIFT) & PERMISSION_BITS) as u8,
        }
    }
}

impl From<Fwmark> for u32 {
    fn from(mark: Fwmark) -> Self {
        mark.to_u32()
    }
}

impl std::fmt::Display for Fwmark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:x}", self.to_u32())
    }
}
