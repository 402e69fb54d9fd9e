//! Routing table identifiers
//!
//! Each interface gets its own routing table, numbered `ifindex + ROUTE_TABLE_OFFSET_FROM_INDEX`.
//! There is no allocator: the id is a pure function of the kernel interface index.
//! Because the index disappears with the interface, the registry remembers the last
//! index it saw for each name so rules and routes can still be removed afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::external::InterfaceResolver;

/// Offset added to an interface index to form its routing table id.
pub const ROUTE_TABLE_OFFSET_FROM_INDEX: u32 = 1000;

/// Shared table for legacy routes (placeholder for per-UID tables).
pub const ROUTE_TABLE_LEGACY: u32 = ROUTE_TABLE_OFFSET_FROM_INDEX - 902;

/// Shared table for privileged legacy routes (placeholder for per-UID tables).
pub const ROUTE_TABLE_PRIVILEGED_LEGACY: u32 = ROUTE_TABLE_OFFSET_FROM_INDEX - 901;

/// Which table a route operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableType {
    /// The interface's own table.
    Interface,
    /// The shared legacy table.
    Legacy,
    /// The shared privileged-legacy table.
    PrivilegedLegacy,
}

impl TableType {
    /// Whether repeated adds of the same route are expected for this table.
    #[must_use]
    pub const fn is_legacy(self) -> bool {
        matches!(self, Self::Legacy | Self::PrivilegedLegacy)
    }
}

impl std::str::FromStr for TableType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "interface" => Ok(Self::Interface),
            "legacy" => Ok(Self::Legacy),
            "privileged_legacy" | "privileged-legacy" => Ok(Self::PrivilegedLegacy),
            other => Err(format!("unknown table type: {other}")),
        }
    }
}

/// Name → last-known interface index cache.
///
/// Not synchronised: the owner serialises access.
pub struct InterfaceTableRegistry {
    resolver: Arc<dyn InterfaceResolver>,
    indices: HashMap<String, u32>,
}

impl InterfaceTableRegistry {
    pub fn new(resolver: Arc<dyn InterfaceResolver>) -> Self {
        Self {
            resolver,
            indices: HashMap::new(),
        }
    }

    /// Routing table for `interface`.
    ///
    /// A successful resolution refreshes the cache. If the interface no longer
    /// exists, the cached index is used. Returns `None` if the interface has never
    /// been resolved.
    pub fn table_for_interface(&mut self, interface: &str) -> Option<u32> {
        let index = match self.resolver.index_of(interface) {
            Some(index) => {
                self.indices.insert(interface.to_string(), index);
                index
            }
            None => {
                let cached = self.indices.get(interface).copied()?;
                debug!("{interface} is gone, using cached index {cached}");
                cached
            }
        };
        Some(index + ROUTE_TABLE_OFFSET_FROM_INDEX)
    }

    /// Drop the cached index for `interface`.
    pub fn forget(&mut self, interface: &str) {
        self.indices.remove(interface);
    }

    /// Last index seen for `interface`, if any.
    #[must_use]
    pub fn cached_index(&self, interface: &str) -> Option<u32> {
        self.indices.get(interface).copied()
    }

    /// Resolver used for interface lookups.
    #[must_use]
    pub fn resolver(&self) -> &dyn InterfaceResolver {
        self.resolver.as_ref()
    }
}

impl std::fmt::Debug for InterfaceTableRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterfaceTableRegistry")
            .field("indices", &self.indices)
            .finish_non_exhaustive()
    }
}
