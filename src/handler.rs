//! Per-tag application packet handlers.
//!
//! Callers register one async handler per packet tag, plus an optional
//! fallback for tags nothing claimed. Handlers run inline on the owning
//! connection's read loop, which is what preserves per-connection delivery
//! order.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use tracing::debug;

use crate::connection::Packet;
use crate::error::PeerlinkError;

type Handler = Arc<dyn Fn(Packet) -> BoxFuture<'static, ()> + Send + Sync>;

fn boxed<F, Fut>(handler: F) -> Handler
where
    F: Fn(Packet) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |packet| {
        let fut: BoxFuture<'static, ()> = Box::pin(handler(packet));
        fut
    })
}

/// Registration table shared by every connection of a node.
pub struct HandlerMap {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    by_tag: HashMap<String, Handler>,
    fallback: Option<Handler>,
}

impl HandlerMap {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Register `handler` for `tag`, replacing any previous registration.
    /// Tags starting with `@` belong to the engine's control frames.
    pub fn register<F, Fut>(&self, tag: impl Into<String>, handler: F) -> Result<(), PeerlinkError>
    where
        F: Fn(Packet) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let tag = tag.into();
        if tag.starts_with('@') {
            return Err(PeerlinkError::ReservedTag(tag));
        }
        self.inner
            .write()
            .expect("handler map poisoned")
            .by_tag
            .insert(tag, boxed(handler));
        Ok(())
    }

    /// Remove the handler for `tag`. Returns whether one was registered.
    pub fn unregister(&self, tag: &str) -> bool {
        self.inner
            .write()
            .expect("handler map poisoned")
            .by_tag
            .remove(tag)
            .is_some()
    }

    /// Handler invoked for tags with no dedicated registration.
    pub fn set_fallback<F, Fut>(&self, handler: F)
    where
        F: Fn(Packet) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.write().expect("handler map poisoned").fallback = Some(boxed(handler));
    }

    /// Look up the handler for `packet` and run it. Packets no handler
    /// claims are dropped with a debug log, not an error.
    pub(crate) async fn dispatch(&self, packet: Packet) {
        let handler = {
            let inner = self.inner.read().expect("handler map poisoned");
            inner
                .by_tag
                .get(packet.header.tag.as_str())
                .or(inner.fallback.as_ref())
                .cloned()
        };
        match handler {
            Some(handler) => handler(packet).await,
            None => debug!(tag = %packet.header.tag, "no handler registered, dropping packet"),
        }
    }
}

impl Default for HandlerMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::connection::test_support::local_packet;

    #[test]
    fn reserved_tags_are_refused() {
        let map = HandlerMap::new();
        let err = map.register("@hello", |_| async {}).unwrap_err();
        assert!(matches!(err, PeerlinkError::ReservedTag(_)));
    }

    #[test]
    fn dispatch_prefers_exact_tag_over_fallback() {
        let map = HandlerMap::new();
        let exact = Arc::new(AtomicUsize::new(0));
        let fallen = Arc::new(AtomicUsize::new(0));

        let e = exact.clone();
        map.register("Ping", move |_| {
            let e = e.clone();
            async move {
                e.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();
        let f = fallen.clone();
        map.set_fallback(move |_| {
            let f = f.clone();
            async move {
                f.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio_test::block_on(async {
            map.dispatch(local_packet("Ping", b"")).await;
            map.dispatch(local_packet("Unknown", b"")).await;
        });
        assert_eq!(exact.load(Ordering::SeqCst), 1);
        assert_eq!(fallen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unregister_reroutes_to_fallback() {
        let map = HandlerMap::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        map.register("Data", move |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

        assert!(map.unregister("Data"));
        assert!(!map.unregister("Data"));

        tokio_test::block_on(map.dispatch(local_packet("Data", b"x")));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
