//! Transport-agnostic accept loop.
//!
//! A [`Listener`] owns one bound acceptor. Each accepted session is wrapped
//! as a connection in `Establishing` state and registered; per-connection
//! handshake work happens on its own tasks so the accept loop never blocks
//! on one peer. Accept errors are logged and the loop keeps going until
//! [`Listener::stop`].

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::connection::{Connection, ConnectionKey};
use crate::error::SetupError;
use crate::node::NodeShared;
use crate::transport::{Acceptor, Endpoint, Transport, TransportKind};

#[derive(Debug)]
pub struct Listener {
    local: Endpoint,
    kind: TransportKind,
    cancel: CancellationToken,
}

impl Listener {
    /// Bind `transport` at `endpoint` and start accepting. With
    /// `port_failover` the desired port being taken is not fatal: successive
    /// ports are tried across the configured range before giving up.
    pub(crate) async fn start(
        transport: Arc<dyn Transport>,
        endpoint: Endpoint,
        port_failover: bool,
        shared: Arc<NodeShared>,
    ) -> Result<Listener, SetupError> {
        let acceptor = bind_with_failover(transport.as_ref(), &endpoint, port_failover, &shared).await?;
        let local = acceptor.local_endpoint();
        let kind = transport.kind();
        info!(%local, %kind, "listening");

        let cancel = CancellationToken::new();
        tokio::spawn(accept_loop(
            acceptor,
            transport,
            shared,
            cancel.clone(),
        ));

        Ok(Listener {
            local,
            kind,
            cancel,
        })
    }

    /// The endpoint actually bound; differs from the requested one after
    /// port failover or a port-zero bind.
    pub fn local_endpoint(&self) -> &Endpoint {
        &self.local
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Stop accepting and release the transport resource. Idempotent; never
    /// fails, even when already stopped.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn bind_with_failover(
    transport: &dyn Transport,
    endpoint: &Endpoint,
    port_failover: bool,
    shared: &Arc<NodeShared>,
) -> Result<Box<dyn Acceptor>, SetupError> {
    let mut candidate = endpoint.clone();
    let mut remaining = if port_failover {
        shared.config.port_failover_range
    } else {
        0
    };
    loop {
        match transport.bind(&candidate).await {
            Ok(acceptor) => return Ok(acceptor),
            // Without failover the first bind error is the answer.
            Err(e) if !port_failover => return Err(e),
            Err(_) if remaining == 0 => {
                return Err(SetupError::NoPortAvailable {
                    endpoint: endpoint.clone(),
                })
            }
            Err(e) => {
                warn!(%candidate, "bind failed ({e}), trying next port");
                candidate = match candidate.next_port() {
                    Some(next) => next,
                    // No port to increment; the range cannot be walked.
                    None => return Err(SetupError::InvalidEndpoint(candidate)),
                };
                remaining -= 1;
            }
        }
    }
}

async fn accept_loop(
    mut acceptor: Box<dyn Acceptor>,
    transport: Arc<dyn Transport>,
    shared: Arc<NodeShared>,
    cancel: CancellationToken,
) {
    loop {
        let session = tokio::select! {
            _ = cancel.cancelled() => break,
            res = acceptor.accept() => match res {
                Ok(session) => session,
                Err(e) => {
                    // One bad accept must not stop the listener.
                    error!("accept failed: {e}");
                    continue;
                }
            },
        };

        let key = ConnectionKey {
            local: session.local_endpoint(),
            remote: session.remote_endpoint(),
            kind: transport.kind(),
        };
        let (conn, halves) = Connection::prepare(
            session,
            transport.kind(),
            transport.framed(),
            key,
            shared.clone(),
        );
        let shared = shared.clone();
        // Admission decides before the connection touches a byte: a refused
        // duplicate never starts its tasks, so none of its frames can reach
        // handlers. Dropping the unstarted halves releases the session.
        tokio::spawn(async move {
            if shared.registry.insert_accepted(&conn).await {
                conn.start(halves);
            } else {
                conn.begin_close(crate::error::DisconnectReason::LocalClose);
            }
        });
    }
}
