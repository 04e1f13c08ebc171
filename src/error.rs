//! Error taxonomy.
//!
//! Errors are split along their propagation boundaries: anything local to a
//! single packet ([`TransformError`]) is recovered by dropping that packet,
//! while anything that breaks the framing or handshake contract tears the
//! connection down. [`PeerlinkError`] is the umbrella type returned by the
//! public API.

use std::io;

use crate::transport::Endpoint;

/// Failure to set up a listener or dial a remote endpoint.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },
    /// Port failover exhausted the configured range without a successful bind.
    #[error("no port available in failover range starting at {endpoint}")]
    NoPortAvailable { endpoint: Endpoint },
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },
    #[error("connect to {endpoint} timed out")]
    ConnectTimeout { endpoint: Endpoint },
    /// The endpoint string cannot be used as the operation requires, e.g.
    /// a port-failover bind on an endpoint that carries no port to walk.
    #[error("invalid endpoint {0}")]
    InvalidEndpoint(Endpoint),
}

/// Failure during the one-time identity exchange. Stored on the connection
/// when the handshake fails so that [`crate::connection::Connection::wait_established`]
/// can report what went wrong instead of a bare closed error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandshakeError {
    #[error("handshake timed out")]
    Timeout,
    /// An application frame arrived before the peer's hello.
    #[error("application frame received before handshake completion")]
    Violation,
    #[error("malformed hello payload: {0}")]
    BadHello(String),
}

/// Malformed header or length field. Fatal to the connection: once the
/// byte-stream alignment is in doubt nothing after it can be trusted.
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("header truncated: declared {declared} bytes, {available} available")]
    HeaderTruncated { declared: usize, available: usize },
    #[error("declared payload length {declared} exceeds maximum {max}")]
    PayloadTooLarge { declared: usize, max: usize },
    #[error("header length {declared} exceeds maximum {max}")]
    HeaderTooLarge { declared: usize, max: usize },
    /// Unknown fixed-width option kind; its size cannot be known, so the
    /// decoder cannot realign past it.
    #[error("unknown fixed-width option kind 0x{0:02x}")]
    UnknownOption(u8),
    #[error("packet tag is not valid UTF-8")]
    BadTag,
    #[error("option value is not valid UTF-8")]
    BadOptionValue,
    #[error("header option section ends mid-option")]
    OptionTruncated,
}

/// Payload-level corruption or an unresolvable pipeline. Recovered at the
/// packet level: the packet is dropped and reported, the connection survives.
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("no pipeline registered for id {0}")]
    UnknownPipeline(u8),
    #[error("transform {id} rejected input: {reason}")]
    Corrupt { id: u8, reason: String },
    #[error("checksum mismatch: header says {expected:#010x}, computed {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
    #[error("i/o during streaming transform: {0}")]
    Io(#[from] io::Error),
}

/// Underlying read/write failure. Treated as remote close.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("session already closed")]
    Closed,
}

/// Umbrella error for the public API.
#[derive(Debug, thiserror::Error)]
pub enum PeerlinkError {
    #[error(transparent)]
    Setup(#[from] SetupError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// Send attempted on a connection that has already shut down.
    #[error("connection is closed")]
    ConnectionClosed,
    /// Send attempted before the handshake completed.
    #[error("connection not yet established")]
    NotEstablished,
    /// Application tags starting with `@` are reserved for control frames.
    #[error("tag {0:?} is reserved")]
    ReservedTag(String),
}

/// Reason code carried by the exactly-once connection-closed notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Explicit local close or node shutdown.
    LocalClose,
    /// Zero-byte read or transport-level disconnect.
    RemoteClose,
    HandshakeTimeout,
    HandshakeViolation,
    /// Malformed frame; byte-stream alignment lost.
    Framing,
    /// No inbound traffic within the keepalive timeout.
    KeepaliveTimeout,
    /// Consecutive per-packet transform failures crossed the threshold.
    TransformThreshold,
    Transport,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DisconnectReason::LocalClose => "local close",
            DisconnectReason::RemoteClose => "remote close",
            DisconnectReason::HandshakeTimeout => "handshake timeout",
            DisconnectReason::HandshakeViolation => "handshake violation",
            DisconnectReason::Framing => "framing error",
            DisconnectReason::KeepaliveTimeout => "keepalive timeout",
            DisconnectReason::TransformThreshold => "transform failure threshold",
            DisconnectReason::Transport => "transport error",
        };
        f.write_str(s)
    }
}
