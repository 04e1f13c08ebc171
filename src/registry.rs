//! Process-wide connection table.
//!
//! One map, one lock, keyed by the endpoint triple. Holding the lock across
//! the dial in [`Registry::get_or_connect`] is what makes the central
//! invariant hold: at most one live connection per (local, remote, transport
//! kind), no matter how many callers race.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionKey};
use crate::error::PeerlinkError;
use crate::node::NodeShared;
use crate::transport::{Endpoint, Transport};

pub struct Registry {
    inner: Mutex<HashMap<ConnectionKey, Arc<Connection>>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Return the live connection for `remote` over `transport`, dialing a
    /// new one only if none exists. Concurrent callers for the same triple
    /// serialize on the table lock and all receive the same connection.
    pub(crate) async fn get_or_connect(
        &self,
        transport: &dyn Transport,
        remote: Endpoint,
        shared: &Arc<NodeShared>,
    ) -> Result<Arc<Connection>, PeerlinkError> {
        let key = ConnectionKey {
            local: Endpoint::any(),
            remote: remote.clone(),
            kind: transport.kind(),
        };
        let mut map = self.inner.lock().await;
        if let Some(existing) = map.get(&key) {
            if !existing.is_closed() {
                debug!(%remote, "reusing live connection");
                return Ok(existing.clone());
            }
        }
        let session = transport
            .connect(&remote, shared.config.connect_timeout)
            .await?;
        let conn = Connection::spawn(
            session,
            transport.kind(),
            transport.framed(),
            key.clone(),
            shared.clone(),
        );
        map.insert(key, conn.clone());
        Ok(conn)
    }

    /// Register an accepted connection. A live entry under the same triple
    /// wins: the newcomer is refused and torn down by the caller.
    pub(crate) async fn insert_accepted(&self, conn: &Arc<Connection>) -> bool {
        let mut map = self.inner.lock().await;
        match map.entry(conn.key().clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_closed() {
                    entry.insert(conn.clone());
                    true
                } else {
                    warn!(key = ?conn.key(), "duplicate inbound connection refused");
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(conn.clone());
                true
            }
        }
    }

    /// Drop the entry for `key` if it is still present. Called from
    /// teardown; losing the race to a replacement entry is fine as long as
    /// a live connection is never evicted by a dead one's cleanup.
    pub(crate) async fn remove(&self, key: &ConnectionKey) {
        let mut map = self.inner.lock().await;
        if let Some(existing) = map.get(key) {
            if existing.is_closed() {
                map.remove(key);
            }
        }
    }

    pub async fn get(&self, key: &ConnectionKey) -> Option<Arc<Connection>> {
        self.inner.lock().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Empty the table, handing every connection back for teardown.
    pub(crate) async fn drain(&self) -> Vec<Arc<Connection>> {
        let mut map = self.inner.lock().await;
        map.drain().map(|(_, conn)| conn).collect()
    }
}
