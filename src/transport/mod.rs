//! Transport capability contract.
//!
//! The engine never touches sockets directly; it consumes transports through
//! these traits so that stream sockets, datagram sockets, and short-range
//! radio links all feed the same connection state machine. An in-tree TCP
//! binding lives in [`tcp`]; other transports implement the same traits out
//! of tree.

pub mod tcp;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{SetupError, TransportError};

pub use tcp::TcpTransport;

/// Which family of link a connection runs over. Part of the registry key:
/// the same address pair over two different transports is two connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    Stream,
    Datagram,
    Radio,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Stream => f.write_str("stream"),
            TransportKind::Datagram => f.write_str("datagram"),
            TransportKind::Radio => f.write_str("radio"),
        }
    }
}

/// A transport-opaque address. Socket transports use `host:port`; radio
/// transports use whatever names their channels.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint(String);

impl Endpoint {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wildcard endpoint used as the local half of a dialed connection's
    /// registry key, where the OS picks an ephemeral port per dial.
    pub fn any() -> Endpoint {
        Endpoint("*".into())
    }

    /// The endpoint with its trailing port incremented, if it has one.
    /// Drives listener port failover.
    pub fn next_port(&self) -> Option<Endpoint> {
        let (host, port) = self.0.rsplit_once(':')?;
        let port: u16 = port.parse().ok()?;
        let next = port.checked_add(1)?;
        Some(Endpoint(format!("{host}:{next}")))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Endpoint {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for Endpoint {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Read half of a raw session.
#[async_trait]
pub trait SessionReader: Send {
    /// Wait for the next chunk of bytes. `None` means graceful remote close.
    /// Chunk boundaries carry no meaning; the reassembler restores frames.
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError>;
}

/// Write half of a raw session.
#[async_trait]
pub trait SessionWriter: Send {
    async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Flush and close the write side. Idempotent.
    async fn shutdown(&mut self) -> Result<(), TransportError>;
}

/// One accepted or dialed transport-level session, before the engine wraps
/// it in a [`crate::connection::Connection`].
pub trait RawSession: Send {
    fn local_endpoint(&self) -> Endpoint;
    fn remote_endpoint(&self) -> Endpoint;
    fn into_split(self: Box<Self>) -> (Box<dyn SessionReader>, Box<dyn SessionWriter>);
}

impl std::fmt::Debug for dyn RawSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawSession")
            .field("local", &self.local_endpoint())
            .field("remote", &self.remote_endpoint())
            .finish()
    }
}

/// A bound, accepting transport resource.
#[async_trait]
pub trait Acceptor: Send {
    async fn accept(&mut self) -> Result<Box<dyn RawSession>, TransportError>;

    /// The endpoint actually bound, which may differ from the one requested
    /// (port 0, port failover).
    fn local_endpoint(&self) -> Endpoint;
}

/// Factory for sessions over one transport family.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Whether sessions on this transport carry the framing protocol.
    /// Links that move raw unframed bytes return false; they skip the
    /// handshake and deliver chunks under the reserved `@raw` tag.
    fn framed(&self) -> bool {
        true
    }

    async fn bind(&self, endpoint: &Endpoint) -> Result<Box<dyn Acceptor>, SetupError>;

    async fn connect(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> Result<Box<dyn RawSession>, SetupError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_port_increments() {
        let ep = Endpoint::new("127.0.0.1:9000");
        assert_eq!(ep.next_port().unwrap().as_str(), "127.0.0.1:9001");
    }

    #[test]
    fn next_port_handles_ipv6_brackets() {
        let ep = Endpoint::new("[::1]:9000");
        assert_eq!(ep.next_port().unwrap().as_str(), "[::1]:9001");
    }

    #[test]
    fn next_port_without_port_is_none() {
        assert!(Endpoint::new("radio-channel-4").next_port().is_none());
        assert!(Endpoint::new("host:notaport").next_port().is_none());
        assert!(Endpoint::new("host:65535").next_port().is_none());
    }
}
