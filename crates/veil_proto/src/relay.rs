//! The relay transport contract, consumed (not defined) by the core.
//!
//! `subscribe` registers an async sink for events matching a filter and
//! returns an RAII handle; dropping the handle unsubscribes. `publish`
//! submits a signed event for fan-out.
//!
//! The core MUST NOT assume at-most-once or in-order delivery from a
//! relay; the `MemoryRelay` here delivers synchronously and in order,
//! which is the easy case — all dedup above this layer is by event id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::{error::ProtoError, event::Event, filter::Filter};

/// Async event consumer attached to a subscription.
pub type EventSink = Arc<dyn Fn(Event) -> BoxFuture<'static, ()> + Send + Sync>;

/// RAII subscription handle. Dropping it (or calling [`unsubscribe`])
/// detaches the sink from the relay.
///
/// [`unsubscribe`]: Subscription::unsubscribe
pub struct Subscription {
    id: String,
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(id: impl Into<String>, cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id: id.into(),
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Abstract relay: pub/sub over signed events.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Register `sink` for events matching `filter`.
    fn subscribe(&self, filter: Filter, sink: EventSink) -> Subscription;

    /// Submit an event for delivery. Fire-and-forget from the caller's
    /// perspective: an `Ok` means the relay accepted it, not that any
    /// subscriber saw it.
    async fn publish(&self, event: Event) -> Result<(), ProtoError>;
}

// ── In-memory relay ──────────────────────────────────────────────────────────

struct MemoryRelayInner {
    subscriptions: HashMap<String, (Filter, EventSink)>,
    published: Vec<Event>,
}

/// In-process relay used by tests and local wiring. `publish` awaits
/// every matching sink before returning, so test flows are deterministic.
/// Keeps a log of everything published for inspection.
#[derive(Clone)]
pub struct MemoryRelay {
    inner: Arc<Mutex<MemoryRelayInner>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryRelayInner {
                subscriptions: HashMap::new(),
                published: Vec::new(),
            })),
        }
    }

    /// Everything published so far, in publish order.
    pub fn published(&self) -> Vec<Event> {
        self.inner.lock().unwrap().published.clone()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.lock().unwrap().subscriptions.len()
    }
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelayTransport for MemoryRelay {
    fn subscribe(&self, filter: Filter, sink: EventSink) -> Subscription {
        let id = uuid::Uuid::new_v4().to_string();
        self.inner
            .lock()
            .unwrap()
            .subscriptions
            .insert(id.clone(), (filter, sink));

        let inner = Arc::clone(&self.inner);
        let sub_id = id.clone();
        Subscription::new(id, move || {
            inner.lock().unwrap().subscriptions.remove(&sub_id);
        })
    }

    async fn publish(&self, event: Event) -> Result<(), ProtoError> {
        let sinks: Vec<EventSink> = {
            let mut inner = self.inner.lock().unwrap();
            inner.published.push(event.clone());
            inner
                .subscriptions
                .values()
                .filter(|(filter, _)| filter.matches(&event))
                .map(|(_, sink)| Arc::clone(sink))
                .collect()
        };
        for sink in sinks {
            sink(event.clone()).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, MESSAGE_KIND};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use veil_crypto::Keypair;

    fn counting_sink(counter: Arc<AtomicUsize>) -> EventSink {
        Arc::new(move |_event| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[tokio::test]
    async fn delivers_to_matching_sinks_only() {
        let relay = MemoryRelay::new();
        let keys = Keypair::generate();
        let other = Keypair::generate();

        let hits = Arc::new(AtomicUsize::new(0));
        let misses = Arc::new(AtomicUsize::new(0));
        let _sub_hit = relay.subscribe(
            Filter::new().author(keys.public()),
            counting_sink(Arc::clone(&hits)),
        );
        let _sub_miss = relay.subscribe(
            Filter::new().author(other.public()),
            counting_sink(Arc::clone(&misses)),
        );

        let event = Event::finalize(&keys, MESSAGE_KIND, "x", vec![], 1).unwrap();
        relay.publish(event).await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(misses.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dropping_handle_unsubscribes() {
        let relay = MemoryRelay::new();
        let keys = Keypair::generate();
        let hits = Arc::new(AtomicUsize::new(0));

        let sub = relay.subscribe(Filter::new(), counting_sink(Arc::clone(&hits)));
        assert_eq!(relay.subscription_count(), 1);
        drop(sub);
        assert_eq!(relay.subscription_count(), 0);

        let event = Event::finalize(&keys, MESSAGE_KIND, "x", vec![], 1).unwrap();
        relay.publish(event).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
