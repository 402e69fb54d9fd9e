//! External collaborators
//!
//! The routing core does not look up interfaces, mark packets, or bulk-flush tables
//! itself. It reaches those through the narrow traits below, with system-backed
//! implementations for production:
//!
//! | Trait | Production implementation |
//! |-------|---------------------------|
//! | [`InterfaceResolver`] | [`SystemResolver`] (`if_nametoindex(3)`) |
//! | [`PacketMarker`] | [`IptablesMarker`] (`iptables`/`ip6tables` mangle INPUT rule) |
//! | [`RouteFlusher`] | [`IpRouteFlusher`] (`ip route flush table`) |
//!
//! Tests substitute in-memory implementations so the policy layer can run without
//! `CAP_NET_ADMIN`.

use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::{debug, error};

use crate::error::RouteError;
use crate::netlink::{Action, AddressFamily};

/// Maps interface names to kernel interface indices.
pub trait InterfaceResolver: Send + Sync {
    /// Kernel index of `name`, or `None` if no such interface exists.
    fn index_of(&self, name: &str) -> Option<u32>;
}

/// Marks inbound packets on an interface with a network id.
pub trait PacketMarker: Send + Sync {
    /// Install or remove the marking rule for `interface`.
    ///
    /// # Errors
    ///
    /// Returns `RouteError::External` if the packet filter could not be updated.
    fn modify_input_mark(
        &self,
        action: Action,
        interface: &str,
        net_id: u32,
    ) -> Result<(), RouteError>;
}

/// Removes every route from a routing table.
pub trait RouteFlusher: Send + Sync {
    /// Flush `table` for `family`.
    ///
    /// # Errors
    ///
    /// Returns `RouteError::External` if the flush failed.
    fn flush_table(&self, family: AddressFamily, table: u32) -> Result<(), RouteError>;
}

// =============================================================================
// System implementations
// =============================================================================

/// Resolver backed by `if_nametoindex(3)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl InterfaceResolver for SystemResolver {
    fn index_of(&self, name: &str) -> Option<u32> {
        let name = CString::new(name).ok()?;
        // SAFETY: `name` is a valid NUL-terminated string for the duration of the call.
        let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
        (index != 0).then_some(index)
    }
}

/// Packet marker that appends or deletes a `mangle INPUT` MARK rule for both
/// IPv4 and IPv6.
#[derive(Debug, Clone)]
pub struct IptablesMarker {
    iptables: PathBuf,
    ip6tables: PathBuf,
}

impl IptablesMarker {
    pub fn new(iptables: impl Into<PathBuf>, ip6tables: impl Into<PathBuf>) -> Self {
        Self {
            iptables: iptables.into(),
            ip6tables: ip6tables.into(),
        }
    }

    /// Arguments for one `iptables` invocation.
    #[must_use]
    pub fn arguments(action: Action, interface: &str, net_id: u32) -> Vec<String> {
        let op = match action {
            Action::Add => "-A",
            Action::Delete => "-D",
        };
        [
            "-w", "-t", "mangle", op, "INPUT", "-i", interface, "-j", "MARK", "--set-mark",
        ]
        .iter()
        .map(|s| (*s).to_string())
        .chain(std::iter::once(format!("0x{net_id:x}")))
        .collect()
    }
}

impl PacketMarker for IptablesMarker {
    fn modify_input_mark(
        &self,
        action: Action,
        interface: &str,
        net_id: u32,
    ) -> Result<(), RouteError> {
        let args = Self::arguments(action, interface, net_id);
        for binary in [&self.iptables, &self.ip6tables] {
            run(binary, &args).map_err(|e| {
                error!("failed to change iptables rule that sets incoming packet mark");
                e
            })?;
        }
        Ok(())
    }
}

/// Route flusher that runs `ip -4|-6 route flush table <id>`.
#[derive(Debug, Clone)]
pub struct IpRouteFlusher {
    ip: PathBuf,
}

impl IpRouteFlusher {
    pub fn new(ip: impl Into<PathBuf>) -> Self {
        Self { ip: ip.into() }
    }

    #[must_use]
    pub fn arguments(family: AddressFamily, table: u32) -> Vec<String> {
        vec![
            family.ip_flag().to_string(),
            "route".to_string(),
            "flush".to_string(),
            "table".to_string(),
            table.to_string(),
        ]
    }
}

impl RouteFlusher for IpRouteFlusher {
    fn flush_table(&self, family: AddressFamily, table: u32) -> Result<(), RouteError> {
        run(&self.ip, &Self::arguments(family, table)).map_err(|e| {
            error!("failed to flush routes");
            e
        })
    }
}

fn run(binary: &Path, args: &[String]) -> Result<(), RouteError> {
    let command = format!("{} {}", binary.display(), args.join(" "));
    debug!("exec {command}");

    let output = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| RouteError::external(&command, e.to_string()))?;

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(RouteError::external(
            command,
            format!("{}: {}", output.status, stderr.trim()),
        ))
    }
}

// =============================================================================
// In-memory implementations (for testing)
// =============================================================================
