//! The message bus seam.
//!
//! Skills never talk to a transport directly: they go through the
//! [`MessageBus`] trait, which offers exactly three operations (emit,
//! subscribe, unsubscribe). Network transports live outside this
//! workspace; [`LocalBus`] is the in-process implementation used when the
//! skill host and the intent service share a process, and in tests.
//!
//! # Delivery
//!
//! `LocalBus::emit` delivers to the subscribers of a message name
//! sequentially, in subscription order, and resolves once every subscriber
//! future has completed. The subscriber list is snapshotted before delivery,
//! so handlers may freely subscribe, unsubscribe or emit re-entrantly.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::error::{BusError, BusResult};
use crate::message::Message;

/// A type-erased bus subscriber.
pub type BusHandler = Arc<dyn Fn(Message) -> BoxFuture<'static, ()> + Send + Sync>;

/// Shared handle to a bus implementation.
pub type BoxedBus = Arc<dyn MessageBus>;

/// Converts an async closure into a [`BusHandler`].
pub fn bus_handler<F, Fut>(f: F) -> BusHandler
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |msg| f(msg).boxed())
}

/// Identifies one subscription so it can be removed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Creates an id from a raw value. Transports allocate these.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

/// The publish/subscribe transport a skill dispatches through.
#[async_trait]
pub trait MessageBus: Send + Sync + 'static {
    /// Publishes a message to every subscriber of `message.msg_type`.
    async fn emit(&self, message: Message) -> BusResult<()>;

    /// Subscribes `handler` to messages named `event`.
    fn on(&self, event: &str, handler: BusHandler) -> SubscriptionId;

    /// Removes a subscription.
    ///
    /// Returns `false` when the subscription is unknown (already removed or
    /// never created). Removing twice is not an error.
    fn remove(&self, event: &str, id: SubscriptionId) -> bool;
}

type SubscriberMap = HashMap<String, Vec<(SubscriptionId, BusHandler)>>;

/// In-process [`MessageBus`] implementation.
///
/// Optionally records every emitted message, which is how tests and
/// diagnostics observe outbound traffic.
#[derive(Default)]
pub struct LocalBus {
    subscribers: RwLock<SubscriberMap>,
    next_id: AtomicU64,
    closed: AtomicBool,
    history: Option<Mutex<Vec<Message>>>,
}

impl LocalBus {
    /// Creates a bus that does not record traffic.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a bus that records every emitted message.
    pub fn with_history() -> Self {
        Self {
            history: Some(Mutex::new(Vec::new())),
            ..Self::default()
        }
    }

    /// Returns the number of live subscriptions for `event`.
    pub fn subscriber_count(&self, event: &str) -> usize {
        self.subscribers.read().get(event).map_or(0, Vec::len)
    }

    /// Returns a copy of all recorded messages, oldest first.
    pub fn history(&self) -> Vec<Message> {
        self.history
            .as_ref()
            .map(|h| h.lock().clone())
            .unwrap_or_default()
    }

    /// Returns the recorded messages named `msg_type`.
    pub fn emitted(&self, msg_type: &str) -> Vec<Message> {
        self.history()
            .into_iter()
            .filter(|m| m.msg_type == msg_type)
            .collect()
    }

    /// Forgets all recorded messages.
    pub fn clear_history(&self) {
        if let Some(h) = &self.history {
            h.lock().clear();
        }
    }

    /// Closes the bus. Further emits fail with [`BusError::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.subscribers.write().clear();
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn emit(&self, message: Message) -> BusResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }

        if let Some(h) = &self.history {
            h.lock().push(message.clone());
        }

        let handlers: Vec<BusHandler> = {
            let subs = self.subscribers.read();
            subs.get(&message.msg_type)
                .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default()
        };

        trace!(
            msg_type = %message.msg_type,
            subscribers = handlers.len(),
            "Delivering message"
        );

        for handler in handlers {
            handler(message.clone()).await;
        }
        Ok(())
    }

    fn on(&self, event: &str, handler: BusHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .entry(event.to_string())
            .or_default()
            .push((id, handler));
        trace!(event, subscription = %id, "Subscribed");
        id
    }

    fn remove(&self, event: &str, id: SubscriptionId) -> bool {
        let mut subs = self.subscribers.write();
        let Some(list) = subs.get_mut(event) else {
            return false;
        };
        let before = list.len();
        list.retain(|(sid, _)| *sid != id);
        let removed = list.len() != before;
        if list.is_empty() {
            subs.remove(event);
        }
        removed
    }
}

impl std::fmt::Debug for LocalBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBus")
            .field("events", &self.subscribers.read().len())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn counter_handler(counter: Arc<AtomicUsize>, amount: usize) -> BusHandler {
        bus_handler(move |_msg| {
            let c = Arc::clone(&counter);
            async move {
                c.fetch_add(amount, Ordering::SeqCst);
            }
        })
    }

    #[tokio::test]
    async fn test_emit_reaches_only_matching_subscribers() {
        let bus = LocalBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        bus.on("a", counter_handler(Arc::clone(&counter), 1));
        bus.on("b", counter_handler(Arc::clone(&counter), 10));

        bus.emit(Message::empty("a")).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let bus = LocalBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let id = bus.on("a", counter_handler(Arc::clone(&counter), 1));

        assert!(bus.remove("a", id));
        assert!(!bus.remove("a", id));
        assert!(!bus.remove("never", id));

        bus.emit(Message::empty("a")).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(bus.subscriber_count("a"), 0);
    }

    #[tokio::test]
    async fn test_reentrant_emit_is_delivered_in_order() {
        let bus = Arc::new(LocalBus::with_history());
        let inner = Arc::clone(&bus);
        bus.on(
            "outer",
            bus_handler(move |_msg| {
                let bus = Arc::clone(&inner);
                async move {
                    bus.emit(Message::new("inner", json!({"n": 1}))).await.unwrap();
                }
            }),
        );

        bus.emit(Message::empty("outer")).await.unwrap();
        let names: Vec<_> = bus.history().into_iter().map(|m| m.msg_type).collect();
        assert_eq!(names, vec!["outer", "inner"]);
        assert_eq!(bus.emitted("inner")[0].get("n"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_closed_bus_rejects_emit() {
        let bus = LocalBus::new();
        bus.close();
        assert!(matches!(
            bus.emit(Message::empty("a")).await,
            Err(BusError::Closed)
        ));
    }
}
