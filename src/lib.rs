//! # peerlink
//!
//! A transport-agnostic peer-to-peer communication engine:
//!
//! * **One state machine** for every link kind (stream sockets, datagram
//!   sockets, short-range radio), behind a transport capability trait
//! * **Self-describing binary frames** with typed, optional header fields
//! * **Reversible transform pipelines** (serialize/compress/encrypt live
//!   behind one seam) applied on send and unwound on receive
//! * **At-most-one connection per endpoint triple**, enforced by a single
//!   registry
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use peerlink::{Config, Node, PeerIdentity, TcpTransport};
//!
//! # async fn demo() -> Result<(), peerlink::PeerlinkError> {
//! let (node, mut events) = Node::new(PeerIdentity::new("server-1"), Config::default());
//!
//! node.handlers().register("Ping", |packet| async move {
//!     if let Some(conn) = packet.connection() {
//!         let _ = conn.send("Pong", packet.payload).await;
//!     }
//! })?;
//!
//! let listener = node
//!     .listen(Arc::new(TcpTransport), "127.0.0.1:7400", true)
//!     .await?;
//! println!("listening on {}", listener.local_endpoint());
//!
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Wire format
//!
//! One revision, fixed field order, big-endian multi-byte integers:
//!
//! ```text
//! [hdr_len (2B BE)] [header] [payload]
//!
//! header = tag_len (1B) | tag | payload_len (4B BE)
//!        | pipeline_id (1B) | option_count (1B) | options
//! ```
//!
//! Options are typed key/value pairs from a closed vocabulary; values wider
//! than a machine word carry their own u16 length prefix so unknown ones
//! can be skipped. An absent option means "not set", never "default".
//!
//! | kind | name            | value        |
//! |------|-----------------|--------------|
//! | 0x01 | sequence number | u64 BE       |
//! | 0x02 | total bytes     | u64 BE       |
//! | 0x03 | checksum        | u32 BE CRC32 |
//! | 0x81 | text            | u16-prefixed |
//!
//! ## Control frames
//!
//! Tags starting with `@` are reserved for the engine:
//!
//! | tag      | meaning                                     |
//! |----------|---------------------------------------------|
//! | `@hello` | handshake identity exchange, sent first     |
//! | `@ping`  | keepalive probe after inbound silence       |
//! | `@pong`  | keepalive response                          |
//! | `@bye`   | graceful close                              |
//! | `@raw`   | synthetic tag for chunks on unframed links  |
//!
//! A connection that receives anything but `@hello` before the handshake
//! completes is torn down with a handshake-violation reason.

pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod handler;
pub mod header;
pub mod listener;
pub mod node;
pub mod pipeline;
pub mod registry;
pub mod transport;

pub use codec::{FrameCodec, PacketBuilder};
pub use config::Config;
pub use connection::{
    Connection, ConnectionEvent, ConnectionInfo, ConnectionKey, LinkState, Packet, PeerIdentity,
};
pub use error::{
    DisconnectReason, FramingError, HandshakeError, PeerlinkError, SetupError, TransformError,
    TransportError,
};
pub use frame::{encode_frame, try_decode_frame, Frame, FrameLimits};
pub use header::{OptionKind, OptionValue, PacketHeader, PIPELINE_IDENTITY};
pub use listener::Listener;
pub use node::Node;
pub use pipeline::{OptionsBag, Pipeline, PipelineRegistry, Transform, TransformId};
pub use transport::{
    Acceptor, Endpoint, RawSession, SessionReader, SessionWriter, TcpTransport, Transport,
    TransportKind,
};
