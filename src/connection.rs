//! The per-link state machine: handshake, established duplex exchange,
//! keepalive, and idempotent teardown.
//!
//! A [`Connection`] owns one raw transport session, split into a cancellable
//! reader task feeding the [`crate::codec::PacketBuilder`] and a writer task
//! draining an outbound queue. All frames reassembled on one connection are
//! dispatched to handlers in arrival order; nothing orders frames across
//! connections.
//!
//! Lifecycle: `Establishing -> Established -> Shutdown`, with the short
//! circuit `Establishing -> Shutdown` on handshake failure or timeout.
//! Teardown runs exactly once no matter how many triggers fire; every
//! teardown emits one [`ConnectionEvent::Closed`] with its reason.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Instant;

use bytes::Bytes;
use crc_any::CRCu32;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::PacketBuilder;
use crate::error::{DisconnectReason, HandshakeError, PeerlinkError, TransformError};
use crate::frame::{encode_frame, Frame, FrameLimits};
use crate::header::{PacketHeader, PIPELINE_IDENTITY};
use crate::node::NodeShared;
use crate::transport::{Endpoint, RawSession, SessionReader, SessionWriter, TransportKind};

/// Control frame tags; the `@` prefix is reserved, applications cannot
/// register handlers for it.
const TAG_HELLO: &str = "@hello";
const TAG_PING: &str = "@ping";
const TAG_PONG: &str = "@pong";
const TAG_BYE: &str = "@bye";
/// Synthetic tag for chunks arriving on links with framing disabled; such
/// packets reach the fallback handler only.
pub const TAG_RAW: &str = "@raw";

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Establishing,
    Established,
    Shutdown,
}

/// What a node says about itself during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub id: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl PeerIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            metadata: HashMap::new(),
        }
    }
}

/// Canonical record of who a connection joins. Endpoints and transport kind
/// are fixed at creation; the peer id fills in when the handshake completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub local: Endpoint,
    pub remote: Endpoint,
    pub kind: TransportKind,
    /// Negotiated peer identifier; `None` until the peer's hello arrives.
    pub peer_id: Option<String>,
    /// Whether the framing protocol runs on this link. Raw links carry
    /// unframed bytes and skip the handshake.
    pub framed: bool,
}

/// Registry uniqueness key: at most one live connection per triple. Dialed
/// connections use [`Endpoint::any`] as the local half, since the OS picks
/// a fresh ephemeral port for every dial.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub local: Endpoint,
    pub remote: Endpoint,
    pub kind: TransportKind,
}

/// Notifications surfaced on the node's event channel.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// Handshake completed; application traffic may flow.
    Established { info: ConnectionInfo },
    /// Fired exactly once per connection.
    Closed {
        info: ConnectionInfo,
        reason: DisconnectReason,
    },
    /// A single packet was dropped; the connection survives.
    PacketError {
        info: ConnectionInfo,
        error: TransformError,
    },
}

/// One delivered application packet.
pub struct Packet {
    pub header: PacketHeader,
    pub peer: ConnectionInfo,
    /// Payload after the pipeline was unwound.
    pub payload: Bytes,
    connection: Weak<Connection>,
}

impl Packet {
    pub(crate) fn new(
        header: PacketHeader,
        peer: ConnectionInfo,
        payload: Bytes,
        connection: Weak<Connection>,
    ) -> Self {
        Self {
            header,
            peer,
            payload,
            connection,
        }
    }

    /// The connection the packet arrived on, for replies. `None` once the
    /// connection has been torn down.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.upgrade()
    }
}

pub struct Connection {
    info: Mutex<ConnectionInfo>,
    key: ConnectionKey,
    state_tx: watch::Sender<LinkState>,
    state_rx: watch::Receiver<LinkState>,
    outbound: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    closed: AtomicBool,
    seq: AtomicU64,
    /// Pipeline id stamped on outbound application frames.
    send_pipeline: AtomicU8,
    transform_failures: AtomicU32,
    /// Why the handshake failed, when it did; read by `wait_established`.
    handshake_failure: OnceLock<HandshakeError>,
    last_inbound: Mutex<Instant>,
    shared: Arc<NodeShared>,
}

/// The split session halves of a prepared connection, held back until the
/// caller decides the connection may run.
pub(crate) struct SessionHalves {
    reader: Box<dyn SessionReader>,
    writer: Box<dyn SessionWriter>,
    outbound_rx: mpsc::Receiver<Bytes>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Wrap a raw session without starting any tasks. Not one byte is read
    /// or written until [`Connection::start`] consumes the returned halves,
    /// so the caller can settle registry admission first and a refused
    /// connection never processes a frame.
    pub(crate) fn prepare(
        session: Box<dyn RawSession>,
        kind: TransportKind,
        framed: bool,
        key: ConnectionKey,
        shared: Arc<NodeShared>,
    ) -> (Arc<Connection>, SessionHalves) {
        let info = ConnectionInfo {
            local: session.local_endpoint(),
            remote: session.remote_endpoint(),
            kind,
            peer_id: None,
            framed,
        };
        let (reader, writer) = session.into_split();
        let (outbound_tx, outbound_rx) = mpsc::channel(shared.config.send_queue_depth);
        let initial = if framed {
            LinkState::Establishing
        } else {
            // Nothing to negotiate on a raw link.
            LinkState::Established
        };
        let (state_tx, state_rx) = watch::channel(initial);

        let conn = Arc::new(Connection {
            info: Mutex::new(info),
            key,
            state_tx,
            state_rx,
            outbound: outbound_tx,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            seq: AtomicU64::new(0),
            send_pipeline: AtomicU8::new(PIPELINE_IDENTITY),
            transform_failures: AtomicU32::new(0),
            handshake_failure: OnceLock::new(),
            last_inbound: Mutex::new(Instant::now()),
            shared,
        });
        let halves = SessionHalves {
            reader,
            writer,
            outbound_rx,
        };
        (conn, halves)
    }

    /// Start the reader and writer tasks, and on framed links the hello
    /// send, handshake watchdog, and keepalive timer.
    pub(crate) fn start(self: &Arc<Self>, halves: SessionHalves) {
        tokio::spawn(writer_task(
            self.clone(),
            halves.writer,
            ReceiverStream::new(halves.outbound_rx),
        ));
        tokio::spawn(reader_task(self.clone(), halves.reader));

        if self.info().framed {
            let conn = self.clone();
            tokio::spawn(async move {
                if let Err(e) = conn.send_hello().await {
                    warn!(remote = %conn.key.remote, "failed to queue hello: {e}");
                    conn.begin_close(DisconnectReason::Transport);
                }
            });
            tokio::spawn(handshake_watchdog(self.clone()));
            tokio::spawn(keepalive_task(self.clone()));
        }
    }

    /// Prepare and start in one step, for the dial path where the caller
    /// already holds the registry lock and no admission race exists.
    pub(crate) fn spawn(
        session: Box<dyn RawSession>,
        kind: TransportKind,
        framed: bool,
        key: ConnectionKey,
        shared: Arc<NodeShared>,
    ) -> Arc<Connection> {
        let (conn, halves) = Connection::prepare(session, kind, framed, key, shared);
        conn.start(halves);
        conn
    }

    pub fn info(&self) -> ConnectionInfo {
        self.info.lock().expect("connection info poisoned").clone()
    }

    pub(crate) fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn state(&self) -> LinkState {
        *self.state_rx.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Choose the pipeline stamped on outbound application frames. The id
    /// must be registered on this node; the peer must be able to resolve it.
    pub fn set_send_pipeline(&self, id: u8) -> Result<(), PeerlinkError> {
        self.shared.pipelines.resolve(id)?;
        self.send_pipeline.store(id, Ordering::SeqCst);
        Ok(())
    }

    /// Block until the handshake completes. Fails once the connection has
    /// shut down instead, reporting the handshake failure (timeout,
    /// violation, malformed hello) when that is what killed it.
    pub async fn wait_established(&self) -> Result<(), PeerlinkError> {
        let mut rx = self.state_rx.clone();
        loop {
            match *rx.borrow_and_update() {
                LinkState::Established => return Ok(()),
                LinkState::Shutdown => return Err(self.establish_error()),
                LinkState::Establishing => {}
            }
            if rx.changed().await.is_err() {
                return Err(self.establish_error());
            }
        }
    }

    fn establish_error(&self) -> PeerlinkError {
        match self.handshake_failure.get() {
            Some(err) => PeerlinkError::Handshake(err.clone()),
            None => PeerlinkError::ConnectionClosed,
        }
    }

    /// Send an application packet. Runs the connection's send pipeline over
    /// `payload`, stamps a sequence number (and checksum when configured),
    /// and queues the frame. Fails fast on a closed or still-establishing
    /// connection; suspends while the outbound queue is full, so a stalled
    /// peer exerts backpressure instead of growing memory.
    pub async fn send(
        &self,
        tag: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Result<(), PeerlinkError> {
        let tag = tag.into();
        if tag.starts_with('@') {
            return Err(PeerlinkError::ReservedTag(tag));
        }
        match self.state() {
            LinkState::Established => {}
            LinkState::Establishing => return Err(PeerlinkError::NotEstablished),
            LinkState::Shutdown => return Err(PeerlinkError::ConnectionClosed),
        }
        let payload = payload.into();
        if !self.info().framed {
            return self.queue(payload).await;
        }
        let pipeline_id = self.send_pipeline.load(Ordering::SeqCst);
        let pipeline = self.shared.pipelines.resolve(pipeline_id)?;
        let wire_payload = if pipeline.is_identity() {
            payload
        } else {
            Bytes::from(pipeline.apply(&payload)?)
        };
        let mut header = PacketHeader::new(tag).with_pipeline(pipeline_id);
        header.set_sequence(self.seq.fetch_add(1, Ordering::SeqCst));
        if self.shared.config.use_checksum {
            header.set_checksum(crc32(&wire_payload));
        }
        let frame = Frame::from_parts(header, wire_payload);
        self.queue(encode_frame(&frame)?).await
    }

    /// Graceful local close: queue a bye so the peer learns, then tear down.
    /// The bye is best-effort; a full queue must not delay teardown.
    pub fn close(self: &Arc<Self>) {
        if self.info().framed && !self.is_closed() {
            if let Ok(wire) = self.encode_control(TAG_BYE, Bytes::new()) {
                let _ = self.outbound.try_send(wire);
            }
        }
        self.begin_close(DisconnectReason::LocalClose);
    }

    async fn send_hello(&self) -> Result<(), PeerlinkError> {
        let hello = serde_json::to_vec(&self.shared.identity)
            .map_err(|e| PeerlinkError::Io(std::io::Error::other(e)))?;
        self.send_control(TAG_HELLO, Bytes::from(hello)).await
    }

    /// Control frames bypass the pipeline and the establishment gate.
    async fn send_control(&self, tag: &str, payload: Bytes) -> Result<(), PeerlinkError> {
        let wire = self.encode_control(tag, payload)?;
        self.queue(wire).await
    }

    fn encode_control(&self, tag: &str, payload: Bytes) -> Result<Bytes, PeerlinkError> {
        let mut header = PacketHeader::new(tag);
        header.set_sequence(self.seq.fetch_add(1, Ordering::SeqCst));
        let frame = Frame::from_parts(header, payload);
        Ok(encode_frame(&frame)?)
    }

    async fn queue(&self, wire: Bytes) -> Result<(), PeerlinkError> {
        if self.is_closed() {
            return Err(PeerlinkError::ConnectionClosed);
        }
        self.outbound
            .send(wire)
            .await
            .map_err(|_| PeerlinkError::ConnectionClosed)
    }

    /// Idempotent teardown. The first caller wins: state goes to Shutdown,
    /// tasks are cancelled, the closed event fires, and the registry entry
    /// is removed. Later callers are no-ops.
    pub(crate) fn begin_close(self: &Arc<Self>, reason: DisconnectReason) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state_tx.send_replace(LinkState::Shutdown);
        self.cancel.cancel();
        let info = self.info();
        info!(remote = %info.remote, %reason, "connection closed");
        let _ = self
            .shared
            .events
            .send(ConnectionEvent::Closed { info, reason });
        let shared = self.shared.clone();
        let key = self.key.clone();
        tokio::spawn(async move {
            shared.registry.remove(&key).await;
        });
    }

    fn touch_inbound(&self) {
        *self.last_inbound.lock().expect("instant lock poisoned") = Instant::now();
    }

    fn inbound_idle(&self) -> std::time::Duration {
        self.last_inbound
            .lock()
            .expect("instant lock poisoned")
            .elapsed()
    }
}

fn crc32(bytes: &[u8]) -> u32 {
    let mut crc = CRCu32::crc32();
    crc.digest(bytes);
    crc.get_crc()
}

async fn writer_task(
    conn: Arc<Connection>,
    mut writer: Box<dyn SessionWriter>,
    mut outbound: ReceiverStream<Bytes>,
) {
    let cancel = conn.cancel.clone();
    loop {
        tokio::select! {
            maybe = outbound.next() => match maybe {
                Some(wire) => {
                    if let Err(e) = writer.send(&wire).await {
                        debug!(remote = %conn.key().remote, "write failed: {e}");
                        conn.begin_close(DisconnectReason::Transport);
                        break;
                    }
                }
                None => break,
            },
            _ = cancel.cancelled() => {
                // Flush whatever was queued before the close won the race.
                let mut rx = outbound.into_inner();
                while let Ok(wire) = rx.try_recv() {
                    if writer.send(&wire).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
}

async fn reader_task(conn: Arc<Connection>, mut reader: Box<dyn SessionReader>) {
    let cancel = conn.cancel.clone();
    let framed = conn.info().framed;
    let limits = FrameLimits {
        max_header_size: conn.shared.config.max_header_size,
        max_frame_size: conn.shared.config.max_frame_size,
    };
    let mut builder = PacketBuilder::new(limits);

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => break,
            res = reader.recv() => match res {
                Ok(Some(chunk)) => chunk,
                Ok(None) => {
                    conn.begin_close(DisconnectReason::RemoteClose);
                    break;
                }
                Err(e) => {
                    debug!(remote = %conn.key().remote, "read failed: {e}");
                    conn.begin_close(DisconnectReason::Transport);
                    break;
                }
            },
        };

        conn.touch_inbound();

        if !framed {
            let mut header = PacketHeader::new(TAG_RAW);
            header.payload_len = chunk.len() as u32;
            let packet = Packet::new(header, conn.info(), chunk, Arc::downgrade(&conn));
            conn.shared.handlers.dispatch(packet).await;
            continue;
        }

        builder.extend(&chunk);
        loop {
            match builder.next_frame() {
                Ok(Some(frame)) => {
                    if !handle_frame(&conn, frame).await {
                        builder.clear();
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(remote = %conn.key().remote, "framing error: {e}");
                    conn.begin_close(DisconnectReason::Framing);
                    builder.clear();
                    return;
                }
            }
        }
    }
    builder.clear();
}

/// Process one reassembled frame. Returns false once the connection is done.
async fn handle_frame(conn: &Arc<Connection>, frame: Frame) -> bool {
    if conn.state() == LinkState::Establishing {
        if frame.tag() != TAG_HELLO {
            warn!(
                remote = %conn.key().remote,
                tag = frame.tag(),
                "frame before handshake completion"
            );
            let _ = conn.handshake_failure.set(HandshakeError::Violation);
            conn.begin_close(DisconnectReason::HandshakeViolation);
            return false;
        }
        return complete_handshake(conn, &frame);
    }

    match frame.tag() {
        TAG_HELLO => {
            // Duplicate hello after establishment; harmless.
            debug!(remote = %conn.key().remote, "ignoring duplicate hello");
        }
        TAG_PING => {
            if conn.send_control(TAG_PONG, Bytes::new()).await.is_err() {
                return false;
            }
        }
        TAG_PONG => {}
        TAG_BYE => {
            conn.begin_close(DisconnectReason::RemoteClose);
            return false;
        }
        _ => return deliver_application_frame(conn, frame).await,
    }
    true
}

fn complete_handshake(conn: &Arc<Connection>, frame: &Frame) -> bool {
    let identity: PeerIdentity = match serde_json::from_slice(&frame.payload) {
        Ok(identity) => identity,
        Err(e) => {
            warn!(remote = %conn.key().remote, "malformed hello: {e}");
            let _ = conn
                .handshake_failure
                .set(HandshakeError::BadHello(e.to_string()));
            conn.begin_close(DisconnectReason::HandshakeViolation);
            return false;
        }
    };
    {
        let mut info = conn.info.lock().expect("connection info poisoned");
        info.peer_id = Some(identity.id.clone());
    }
    conn.state_tx.send_replace(LinkState::Established);
    info!(remote = %conn.key().remote, peer = %identity.id, "connection established");
    let _ = conn.shared.events.send(ConnectionEvent::Established { info: conn.info() });
    true
}

async fn deliver_application_frame(conn: &Arc<Connection>, frame: Frame) -> bool {
    match unwind_payload(conn, &frame) {
        Ok(payload) => {
            conn.transform_failures.store(0, Ordering::SeqCst);
            let packet = Packet::new(frame.header, conn.info(), payload, Arc::downgrade(conn));
            conn.shared.handlers.dispatch(packet).await;
            true
        }
        Err(error) => {
            warn!(remote = %conn.key().remote, tag = frame.tag(), "packet dropped: {error}");
            let _ = conn.shared.events.send(ConnectionEvent::PacketError {
                info: conn.info(),
                error,
            });
            let failures = conn.transform_failures.fetch_add(1, Ordering::SeqCst) + 1;
            if failures >= conn.shared.config.transform_failure_threshold {
                error!(
                    remote = %conn.key().remote,
                    failures, "consecutive packet failures crossed threshold"
                );
                conn.begin_close(DisconnectReason::TransformThreshold);
                return false;
            }
            true
        }
    }
}

/// Verify the checksum option and unwind the producing pipeline.
fn unwind_payload(conn: &Arc<Connection>, frame: &Frame) -> Result<Bytes, TransformError> {
    if let Some(expected) = frame.header.checksum() {
        let actual = crc32(&frame.payload);
        if actual != expected {
            return Err(TransformError::ChecksumMismatch { expected, actual });
        }
    }
    let pipeline = conn.shared.pipelines.resolve(frame.header.pipeline_id)?;
    if pipeline.is_identity() {
        Ok(frame.payload.clone())
    } else {
        Ok(Bytes::from(pipeline.unapply(&frame.payload)?))
    }
}

async fn handshake_watchdog(conn: Arc<Connection>) {
    let timeout = conn.shared.config.handshake_timeout;
    tokio::select! {
        _ = conn.cancel.cancelled() => {}
        _ = tokio::time::sleep(timeout) => {
            if conn.state() == LinkState::Establishing {
                warn!(remote = %conn.key().remote, "handshake timed out");
                let _ = conn.handshake_failure.set(HandshakeError::Timeout);
                conn.begin_close(DisconnectReason::HandshakeTimeout);
            }
        }
    }
}

async fn keepalive_task(conn: Arc<Connection>) {
    let interval = conn.shared.config.keepalive_interval;
    let timeout = conn.shared.config.keepalive_timeout;
    loop {
        tokio::select! {
            _ = conn.cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        if conn.state() != LinkState::Established {
            continue;
        }
        let idle = conn.inbound_idle();
        if idle >= timeout {
            warn!(remote = %conn.key().remote, "keepalive timeout after {idle:?}");
            conn.begin_close(DisconnectReason::KeepaliveTimeout);
            return;
        }
        if idle >= interval {
            // Best-effort probe; a full queue means the link is busy anyway.
            match conn.encode_control(TAG_PING, Bytes::new()) {
                Ok(wire) => {
                    if let Err(TrySendError::Closed(_)) = conn.outbound.try_send(wire) {
                        return;
                    }
                }
                Err(_) => return,
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A packet with no live connection behind it, for handler-table tests.
    pub(crate) fn local_packet(tag: &str, payload: &[u8]) -> Packet {
        let info = ConnectionInfo {
            local: Endpoint::new("127.0.0.1:1"),
            remote: Endpoint::new("127.0.0.1:2"),
            kind: TransportKind::Stream,
            peer_id: Some("test-peer".into()),
            framed: true,
        };
        Packet::new(
            PacketHeader::new(tag),
            info,
            Bytes::copy_from_slice(payload),
            Weak::new(),
        )
    }

    #[test]
    fn crc32_is_stable() {
        // CRC-32/ISO-HDLC of "123456789".
        assert_eq!(super::crc32(b"123456789"), 0xcbf4_3926);
    }
}
