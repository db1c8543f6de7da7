//! Descriptor and address access for listening sockets.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

/// A listening socket that can be handed to a child process.
///
/// Exposes the OS descriptor number and local address the handoff triple is
/// built from. Implementations must never close or reconfigure the socket.
pub trait HandoffListener {
    /// The socket's descriptor number in this process.
    fn raw_descriptor(&self) -> RawFd;

    /// The address the socket is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Human-readable label, `tcp:<local-address>->`.
    ///
    /// The remote side is empty because this is a listener, not a connection.
    fn label(&self) -> io::Result<String> {
        Ok(format!("tcp:{}->", self.local_addr()?))
    }
}

impl HandoffListener for std::net::TcpListener {
    fn raw_descriptor(&self) -> RawFd {
        self.as_raw_fd()
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        std::net::TcpListener::local_addr(self)
    }
}

impl HandoffListener for tokio::net::TcpListener {
    fn raw_descriptor(&self) -> RawFd {
        self.as_raw_fd()
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        tokio::net::TcpListener::local_addr(self)
    }
}

impl<T: HandoffListener + ?Sized> HandoffListener for &T {
    fn raw_descriptor(&self) -> RawFd {
        (**self).raw_descriptor()
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        (**self).local_addr()
    }
}

impl<T: HandoffListener + ?Sized> HandoffListener for Arc<T> {
    fn raw_descriptor(&self) -> RawFd {
        (**self).raw_descriptor()
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        (**self).local_addr()
    }
}

/// Parse a `tcp:<addr>->` label back into its address.
///
/// Returns `None` when the label names another protocol or has a remote side.
pub(crate) fn parse_label(label: &str) -> Option<Result<SocketAddr, String>> {
    let rest = label.strip_prefix("tcp:")?;
    let addr = rest.strip_suffix("->")?;
    Some(addr.parse().map_err(|_| addr.to_string()))
}
