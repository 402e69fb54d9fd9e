//! Error types for policy-router
//!
//! Every routing failure carries the signed errno the kernel-facing layer would have
//! returned (zero is success, negative values are platform errno codes). The codes are
//! passed upward unchanged so the network manager sees exactly what the kernel said.

use std::io;

use thiserror::Error;

/// Top-level error type for policy-router
#[derive(Debug, Error)]
pub enum PolicyRouterError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Routing rule and route programming errors
    #[error("Routing error: {0}")]
    Route(#[from] RouteError),
}

impl PolicyRouterError {
    /// Check if this error is recoverable (can retry operation)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(e) => e.is_recoverable(),
            Self::Route(e) => e.is_recoverable(),
        }
    }

    /// Process exit status: the positive errno for routing failures, 1 otherwise.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 1,
            Self::Route(e) => -e.errno(),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are generally not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Errors raised while encoding, sending, or composing routing requests.
#[derive(Debug, Error)]
pub enum RouteError {
    /// A mark bit is set that the mask does not select
    #[error("mask 0x{mask:x} does not select all the bits set in fwmark 0x{mark:x}")]
    InvalidMark { mark: u32, mask: u32 },

    /// Interface name (plus terminator) does not fit `IFNAMSIZ`
    #[error("interface name too long: {name} ({len} > {max})", max = crate::netlink::IFNAMSIZ)]
    NameTooLong { name: String, len: usize },

    /// Interface name contains a NUL byte
    #[error("interface name contains a NUL byte: {name:?}")]
    InvalidName { name: String },

    /// Only one end of a UID range was supplied
    #[error("incompatible start and end UIDs ({start:?} vs {end:?})")]
    InvalidUidRange { start: Option<u32>, end: Option<u32> },

    /// Route request without a destination
    #[error("route request has no destination")]
    MissingDestination,

    /// Destination prefix could not be parsed
    #[error("failed to parse prefix {input}: {reason}")]
    Parse { input: String, reason: String },

    /// Raw address does not fit the address buffer
    #[error("address too long ({len} > {max} bytes)", max = crate::netlink::MAX_ADDR_LEN)]
    AddressTooLong { len: usize },

    /// Nexthop malformed or of a different family than the destination
    #[error("invalid nexthop {nexthop}")]
    InvalidNexthop { nexthop: String },

    /// Interface could not be resolved to a kernel index
    #[error("cannot find interface {interface}")]
    NoSuchDevice { interface: String },

    /// No routing table could be derived for the interface
    #[error("cannot find routing table for interface {interface}")]
    TableNotFound { interface: String },

    /// Socket, connect, write, or read failure on the netlink socket
    #[error("netlink {op} failed: {source}")]
    Transport {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// Acknowledgment had an unexpected size
    #[error("bad netlink response message size ({received} != {expected})")]
    Protocol { received: usize, expected: usize },

    /// Kernel acknowledged with a nonzero embedded errno
    #[error("netlink response contains error ({})", strerror(.errno))]
    Kernel { errno: i32 },

    /// External tool (packet filter, route flush) failed
    #[error("external command {command} failed: {reason}")]
    External { command: String, reason: String },
}

impl RouteError {
    /// Negative errno equivalent of this error.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::InvalidMark { .. } => -libc::ERANGE,
            Self::NameTooLong { .. } => -libc::ENAMETOOLONG,
            Self::InvalidName { .. } | Self::Parse { .. } | Self::InvalidNexthop { .. } => {
                -libc::EINVAL
            }
            Self::InvalidUidRange { .. } => -libc::EUSERS,
            Self::MissingDestination => -libc::EFAULT,
            Self::AddressTooLong { .. } => -libc::ENOBUFS,
            Self::NoSuchDevice { .. } => -libc::ENODEV,
            Self::TableNotFound { .. } => -libc::ESRCH,
            Self::Transport { source, .. } => -source.raw_os_error().unwrap_or(libc::EIO),
            Self::Protocol { .. } => -libc::EBADMSG,
            Self::Kernel { errno } => *errno,
            Self::External { .. } => -libc::EREMOTEIO,
        }
    }

    /// Whether the kernel rejected the request because it already exists.
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::Kernel { errno } if *errno == -libc::EEXIST)
    }

    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Transport { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            Self::Kernel { errno } => {
                matches!(-*errno, libc::EBUSY | libc::EAGAIN | libc::EINTR)
            }
            Self::External { .. } | Self::Protocol { .. } => true,
            _ => false,
        }
    }

    /// Create a transport error
    pub fn transport(op: &'static str, source: io::Error) -> Self {
        Self::Transport { op, source }
    }

    /// Create an external command error
    pub fn external(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::External {
            command: command.into(),
            reason: reason.into(),
        }
    }
}

fn strerror(errno: &i32) -> io::Error {
    io::Error::from_raw_os_error(-*errno)
}
