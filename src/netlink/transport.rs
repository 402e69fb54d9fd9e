//! Netlink request transport
//!
//! Each request is self-contained: open a `NETLINK_ROUTE` datagram socket, connect
//! it to the kernel, write the header and segments in one scatter-write, then block
//! on a single acknowledgment read. No sequence numbers, no retries, no session.
//! The socket is closed when it drops, on every exit path.
//!
//! # Transport Trait
//!
//! Callers depend on [`NetlinkTransport`] rather than the socket directly, so the
//! policy layer can be exercised against a recording transport in tests.

use std::io::{self, IoSlice, Read};
use std::mem;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, error};

use super::{encode_header, ACK_LEN, NLMSG_HDRLEN};
use crate::error::RouteError;

/// Sends one netlink request and waits for its acknowledgment.
pub trait NetlinkTransport: Send + Sync {
    /// Send a request of message type `kind` with header `flags`.
    ///
    /// The transport prepends an `nlmsghdr` whose length covers the header plus all
    /// `segments`, which are written unmodified.
    ///
    /// # Errors
    ///
    /// - `RouteError::Transport` if the socket cannot be opened, connected, written, or read
    /// - `RouteError::Protocol` if the acknowledgment has an unexpected size
    /// - `RouteError::Kernel` if the acknowledgment carries a nonzero errno
    fn send(&self, kind: u16, flags: u16, segments: &[&[u8]]) -> Result<(), RouteError>;
}

/// Transport backed by a real `NETLINK_ROUTE` socket.
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelTransport;

impl KernelTransport {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl NetlinkTransport for KernelTransport {
    fn send(&self, kind: u16, flags: u16, segments: &[&[u8]]) -> Result<(), RouteError> {
        let payload_len: usize = segments.iter().map(|s| s.len()).sum();
        let header = encode_header(kind, flags, payload_len);

        let mut iov = Vec::with_capacity(segments.len() + 1);
        iov.push(IoSlice::new(&header));
        iov.extend(segments.iter().map(|s| IoSlice::new(s)));

        debug!(
            kind,
            flags = format_args!("0x{flags:x}"),
            len = NLMSG_HDRLEN + payload_len,
            "sending netlink request"
        );

        let result = exchange(&iov);
        if let Err(e) = &result {
            match e {
                RouteError::Kernel { .. } | RouteError::Protocol { .. } => error!("{e}"),
                _ => error!("netlink socket/connect/writev/recv failed: {e}"),
            }
        }
        result
    }
}

fn exchange(iov: &[IoSlice<'_>]) -> Result<(), RouteError> {
    let socket = Socket::new(
        Domain::from(libc::AF_NETLINK),
        Type::DGRAM,
        Some(Protocol::from(libc::NETLINK_ROUTE)),
    )
    .map_err(|e| RouteError::transport("socket", e))?;

    let kernel = kernel_address().map_err(|e| RouteError::transport("connect", e))?;
    socket
        .connect(&kernel)
        .map_err(|e| RouteError::transport("connect", e))?;

    socket
        .send_vectored(iov)
        .map_err(|e| RouteError::transport("writev", e))?;

    let mut response = [0u8; ACK_LEN];
    let received = (&socket)
        .read(&mut response)
        .map_err(|e| RouteError::transport("recv", e))?;

    parse_ack(&response[..received.min(ACK_LEN)], received)
}

/// Address of the kernel endpoint: `sockaddr_nl` with pid 0 and no groups.
fn kernel_address() -> io::Result<SockAddr> {
    // SAFETY: `try_init` hands us zeroed storage large enough for any socket
    // address; we only write a `sockaddr_nl`, which fits, and report its size.
    let ((), addr) = unsafe {
        SockAddr::try_init(|storage, len| {
            let nl = storage.cast::<libc::sockaddr_nl>();
            (*nl).nl_family = libc::AF_NETLINK as libc::sa_family_t;
            (*nl).nl_pid = 0;
            (*nl).nl_groups = 0;
            *len = mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t;
            Ok(())
        })
    }?;
    Ok(addr)
}

/// Decode an acknowledgment read of `received` bytes.
///
/// Only a read of exactly `nlmsghdr` + `nlmsgerr` is well formed. The embedded
/// errno is zero on success and a negative errno on failure.
///
/// # Errors
///
/// `RouteError::Protocol` for any other size, `RouteError::Kernel` for a nonzero errno.
pub fn parse_ack(response: &[u8], received: usize) -> Result<(), RouteError> {
    if received != ACK_LEN || response.len() < ACK_LEN {
        return Err(RouteError::Protocol {
            received,
            expected: ACK_LEN,
        });
    }
    let mut errno = [0u8; 4];
    errno.copy_from_slice(&response[NLMSG_HDRLEN..NLMSG_HDRLEN + 4]);
    match i32::from_ne_bytes(errno) {
        0 => Ok(()),
        errno => Err(RouteError::Kernel { errno }),
    }
}

// =============================================================================
// Recording Transport (for testing)
// =============================================================================

/// One request captured by [`RecordingTransport`].
#[cfg(test)]
#[derive(Debug, Clone)]
pub struct SentRequest {
    pub kind: u16,
    pub flags: u16,
    /// Concatenated segments (everything after the `nlmsghdr`).
    pub body: Vec<u8>,
}

/// Transport that records requests and answers with scripted errnos.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: parking_lot::Mutex<Vec<SentRequest>>,
    /// Errno to return for the request at a given zero-based position.
    failures: parking_lot::Mutex<std::collections::HashMap<usize, i32>>,
}

#[cfg(test)]
impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the `index`-th request (counting from zero) fail with `errno`.
    pub fn fail_at(&self, index: usize, errno: i32) {
        self.failures.lock().insert(index, errno);
    }

    pub fn sent(&self) -> Vec<SentRequest> {
        self.sent.lock().clone()
    }
}

#[cfg(test)]
impl NetlinkTransport for RecordingTransport {
    fn send(&self, kind: u16, flags: u16, segments: &[&[u8]]) -> Result<(), RouteError> {
        let mut sent = self.sent.lock();
        let index = sent.len();
        sent.push(SentRequest {
            kind,
            flags,
            body: segments.concat(),
        });
        match self.failures.lock().get(&index) {
            Some(&errno) => Err(RouteError::Kernel { errno }),
            None => Ok(()),
        }
    }
}
