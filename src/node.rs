//! The networking subsystem root.
//!
//! A [`Node`] is the explicitly constructed owner of everything shared:
//! configuration, the connection registry, the pipeline and handler tables,
//! and the event channel. There is no ambient global state; listeners and
//! connections all hold a reference back to their node's shared core, and
//! the whole subsystem winds down through [`Node::shutdown`].

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use crate::config::Config;
use crate::connection::{Connection, ConnectionEvent, PeerIdentity};
use crate::error::PeerlinkError;
use crate::handler::HandlerMap;
use crate::listener::Listener;
use crate::pipeline::PipelineRegistry;
use crate::registry::Registry;
use crate::transport::{Endpoint, Transport};

pub(crate) struct NodeShared {
    pub(crate) identity: PeerIdentity,
    pub(crate) config: Config,
    pub(crate) registry: Registry,
    pub(crate) pipelines: PipelineRegistry,
    pub(crate) handlers: HandlerMap,
    pub(crate) events: mpsc::UnboundedSender<ConnectionEvent>,
}

pub struct Node {
    shared: Arc<NodeShared>,
}

impl Node {
    /// Build a node. The returned receiver carries every connection
    /// lifecycle event: established, closed (exactly once per connection),
    /// and per-packet errors.
    pub fn new(
        identity: PeerIdentity,
        config: Config,
    ) -> (Node, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(NodeShared {
            identity,
            config,
            registry: Registry::new(),
            pipelines: PipelineRegistry::new(),
            handlers: HandlerMap::new(),
            events,
        });
        (Node { shared }, events_rx)
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.shared.identity
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn handlers(&self) -> &HandlerMap {
        &self.shared.handlers
    }

    pub fn pipelines(&self) -> &PipelineRegistry {
        &self.shared.pipelines
    }

    pub fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    /// Connection to `remote` over `transport`: the existing one if live,
    /// otherwise a fresh dial. Waits for the handshake, so the returned
    /// connection is ready for application traffic.
    pub async fn connect(
        &self,
        transport: &dyn Transport,
        remote: impl Into<Endpoint>,
    ) -> Result<Arc<Connection>, PeerlinkError> {
        let conn = self
            .shared
            .registry
            .get_or_connect(transport, remote.into(), &self.shared)
            .await?;
        conn.wait_established().await?;
        Ok(conn)
    }

    /// Start listening at `endpoint`. With `port_failover`, a taken port is
    /// retried across the configured range.
    pub async fn listen(
        &self,
        transport: Arc<dyn Transport>,
        endpoint: impl Into<Endpoint>,
        port_failover: bool,
    ) -> Result<Listener, PeerlinkError> {
        Ok(Listener::start(transport, endpoint.into(), port_failover, self.shared.clone()).await?)
    }

    /// Tear down every live connection. Listeners stop via their own
    /// [`Listener::stop`] (or drop).
    pub async fn shutdown(&self) {
        let connections = self.shared.registry.drain().await;
        info!(count = connections.len(), "node shutting down");
        for conn in connections {
            conn.close();
        }
    }
}
