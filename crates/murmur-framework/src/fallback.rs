//! The fallback chain.
//!
//! When no intent matches an utterance the intent service publishes
//! `intent_failure`. The dispatcher built by
//! [`FallbackRegistry::build_dispatcher`] then offers the message to every
//! registered fallback handler in ascending priority order until one of them
//! reports success.
//!
//! There is one registry per process. It is created once and injected into
//! every skill that registers fallbacks.
//!
//! ```rust,ignore
//! let registry = Arc::new(FallbackRegistry::new());
//! let unknown = FallbackHandler::named("unknown", |msg: Message| async move {
//!     msg.get_str("utterance").is_some()
//! });
//! let assigned = registry.register(unknown, 100);
//! bus.on(topic::INTENT_FAILURE, registry.build_dispatcher(&bus));
//! ```

use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::{Value, json};
use tower::BoxError;
use tracing::{debug, info, trace, warn};

use crate::error::InvocationError;
use crate::handler::short_type_name;
use crate::telemetry::{emit_logged, start_message};
use murmur_core::{BoxedBus, BusHandler, Message, MessageBus, bus_handler, topic};

/// Exception text published when every fallback declined.
pub const NO_FALLBACK: &str = "No fallback could handle intent.";

const FALLBACK_HANDLER_NAME: &str = "fallback";

/// Future returned by a fallback handler.
pub type FallbackFuture = BoxFuture<'static, Result<bool, BoxError>>;

type FallbackFn = Arc<dyn Fn(Message) -> FallbackFuture + Send + Sync>;

/// Types a fallback handler may return. `true` means handled.
pub trait FallbackOutput: Send + 'static {
    fn into_outcome(self) -> Result<bool, BoxError>;
}

impl FallbackOutput for bool {
    fn into_outcome(self) -> Result<bool, BoxError> {
        Ok(self)
    }
}

impl<E> FallbackOutput for Result<bool, E>
where
    E: Into<BoxError> + Send + 'static,
{
    fn into_outcome(self) -> Result<bool, BoxError> {
        self.map_err(Into::into)
    }
}

/// A fallback handler.
///
/// Clones share identity: two handles are the same handler if and only if
/// they were cloned from one another.
#[derive(Clone)]
pub struct FallbackHandler {
    name: Arc<str>,
    call: FallbackFn,
}

impl FallbackHandler {
    /// Wraps `f`, naming it after its type path.
    pub fn new<F, Fut, R>(f: F) -> Self
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: FallbackOutput,
    {
        let name = short_type_name::<F>();
        Self::named(name, f)
    }

    /// Wraps `f` under an explicit name.
    pub fn named<F, Fut, R>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: FallbackOutput,
    {
        Self {
            name: Arc::from(name.into()),
            call: Arc::new(move |msg| f(msg).map(FallbackOutput::into_outcome).boxed()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `true` if both handles refer to the same handler.
    pub fn same_as(&self, other: &FallbackHandler) -> bool {
        Arc::ptr_eq(&self.call, &other.call)
    }
}

impl PartialEq for FallbackHandler {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

impl std::fmt::Debug for FallbackHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackHandler")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Result of one pass through the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackOutcome {
    /// A handler accepted the utterance.
    Handled { priority: i32, handler: String },
    /// Every handler declined, failed or timed out.
    Exhausted,
}

/// Priority-ordered registry of fallback handlers.
///
/// Lower priorities run first. Priorities are unique: a request for a taken
/// slot is moved to the next free integer above it.
pub struct FallbackRegistry {
    entries: RwLock<BTreeMap<i32, FallbackHandler>>,
    timeout: Duration,
}

impl Default for FallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FallbackRegistry {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    /// Creates a registry whose candidates may run for at most `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            timeout,
        }
    }

    /// Registers `handler` and returns the priority it was assigned.
    pub fn register(&self, handler: FallbackHandler, priority: i32) -> i32 {
        let mut entries = self.entries.write();
        let assigned = (priority..=i32::MAX)
            .chain((i32::MIN..priority).rev())
            .find(|p| !entries.contains_key(p))
            .unwrap_or(priority);
        if assigned != priority {
            debug!(
                fallback = %handler.name(),
                requested = priority,
                assigned,
                "Fallback priority taken, moved"
            );
        }
        entries.insert(assigned, handler);
        assigned
    }

    /// Removes `handler`. Returns `false`, with a warning, if it was not
    /// registered.
    pub fn remove(&self, handler: &FallbackHandler) -> bool {
        let mut entries = self.entries.write();
        let key = entries
            .iter()
            .find(|(_, h)| h.same_as(handler))
            .map(|(p, _)| *p);
        match key {
            Some(priority) => {
                entries.remove(&priority);
                debug!(fallback = %handler.name(), priority, "Removed fallback");
                true
            }
            None => {
                warn!(fallback = %handler.name(), "Could not remove fallback, not registered");
                false
            }
        }
    }

    pub fn contains(&self, handler: &FallbackHandler) -> bool {
        self.entries.read().values().any(|h| h.same_as(handler))
    }

    /// Registered priorities, ascending.
    pub fn priorities(&self) -> Vec<i32> {
        self.entries.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn snapshot(&self) -> Vec<(i32, FallbackHandler)> {
        self.entries
            .read()
            .iter()
            .map(|(p, h)| (*p, h.clone()))
            .collect()
    }

    async fn attempt(&self, handler: &FallbackHandler, message: Message) -> Result<bool, InvocationError> {
        let call = Arc::clone(&handler.call);
        let fut = match std::panic::catch_unwind(AssertUnwindSafe(move || call(message))) {
            Ok(fut) => fut,
            Err(payload) => return Err(InvocationError::from_panic(payload)),
        };
        match tokio::time::timeout(self.timeout, AssertUnwindSafe(fut).catch_unwind()).await {
            Err(_) => Err(InvocationError::TimedOut(self.timeout)),
            Ok(Err(payload)) => Err(InvocationError::from_panic(payload)),
            Ok(Ok(Err(e))) => Err(InvocationError::Failed(e)),
            Ok(Ok(Ok(handled))) => Ok(handled),
        }
    }

    /// Runs one pass through the chain for `message`.
    pub async fn dispatch(&self, bus: &dyn MessageBus, message: Message) -> FallbackOutcome {
        emit_logged(bus, start_message(FALLBACK_HANDLER_NAME)).await;

        for (priority, handler) in self.snapshot() {
            match self.attempt(&handler, message.clone()).await {
                Ok(true) => {
                    let complete = Message::new(
                        topic::HANDLER_COMPLETE,
                        json!({
                            "handler": FALLBACK_HANDLER_NAME,
                            "fallback_handler": handler.name(),
                        }),
                    );
                    emit_logged(bus, complete).await;
                    debug!(priority, fallback = %handler.name(), "Fallback handled utterance");
                    return FallbackOutcome::Handled {
                        priority,
                        handler: handler.name().to_string(),
                    };
                }
                Ok(false) => trace!(priority, fallback = %handler.name(), "Fallback declined"),
                Err(e) => info!(
                    priority,
                    fallback = %handler.name(),
                    error = %e,
                    "Exception in fallback"
                ),
            }
        }

        emit_logged(bus, message.forward(topic::COMPLETE_INTENT_FAILURE, Value::Null)).await;
        warn!("{NO_FALLBACK}");
        let complete = Message::new(
            topic::HANDLER_COMPLETE,
            json!({ "handler": FALLBACK_HANDLER_NAME, "exception": NO_FALLBACK }),
        );
        emit_logged(bus, complete).await;
        FallbackOutcome::Exhausted
    }

    /// Builds the bus subscriber that drives the chain.
    ///
    /// The subscriber only holds a weak reference to the bus; it becomes a
    /// no-op once the bus is dropped.
    pub fn build_dispatcher(self: &Arc<Self>, bus: &BoxedBus) -> BusHandler {
        let registry = Arc::clone(self);
        let bus = Arc::downgrade(bus);
        bus_handler(move |msg| {
            let registry = Arc::clone(&registry);
            let bus = bus.clone();
            async move {
                if let Some(bus) = bus.upgrade() {
                    registry.dispatch(bus.as_ref(), msg).await;
                }
            }
        })
    }
}

impl std::fmt::Debug for FallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackRegistry")
            .field("priorities", &self.priorities())
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;
    use murmur_core::LocalBus;

    fn recording(name: &str, log: &Arc<Mutex<Vec<String>>>, result: bool) -> FallbackHandler {
        let log = Arc::clone(log);
        let label = name.to_string();
        FallbackHandler::named(name, move |_m: Message| {
            let log = Arc::clone(&log);
            let label = label.clone();
            async move {
                log.lock().push(label);
                result
            }
        })
    }

    #[test]
    fn test_priority_collision_moves_up() {
        let registry = FallbackRegistry::new();
        let a = FallbackHandler::named("a", |_m: Message| async { false });
        let b = FallbackHandler::named("b", |_m: Message| async { false });
        assert_eq!(registry.register(a, 10), 10);
        assert_eq!(registry.register(b, 10), 11);
        assert_eq!(registry.priorities(), vec![10, 11]);
    }

    #[test]
    fn test_remove_by_identity() {
        let registry = FallbackRegistry::new();
        let a = FallbackHandler::named("same", |_m: Message| async { false });
        let b = FallbackHandler::named("same", |_m: Message| async { false });
        registry.register(a.clone(), 1);

        assert!(!registry.remove(&b));
        assert!(registry.remove(&a));
        assert!(!registry.remove(&a));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_chain_runs_in_priority_order_and_stops() {
        let bus = LocalBus::with_history();
        let registry = FallbackRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.register(recording("p90", &log, true), 90);
        registry.register(recording("p10", &log, false), 10);
        registry.register(recording("p50", &log, true), 50);

        let outcome = registry.dispatch(&bus, Message::empty(topic::INTENT_FAILURE)).await;
        assert_eq!(
            outcome,
            FallbackOutcome::Handled {
                priority: 50,
                handler: "p50".to_string()
            }
        );
        assert_eq!(*log.lock(), vec!["p10", "p50"]);

        let complete = bus.emitted(topic::HANDLER_COMPLETE);
        assert_eq!(complete.len(), 1);
        assert_eq!(complete[0].get_str("handler"), Some("fallback"));
        assert_eq!(complete[0].get_str("fallback_handler"), Some("p50"));
        assert!(bus.emitted(topic::COMPLETE_INTENT_FAILURE).is_empty());
    }

    #[tokio::test]
    async fn test_exhaustion_is_reported_once() {
        let bus = LocalBus::with_history();
        let registry = FallbackRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.register(recording("a", &log, false), 1);
        registry.register(
            FallbackHandler::named("broken", |_m: Message| async { Err::<bool, _>("db down") }),
            2,
        );
        registry.register(
            FallbackHandler::named("panics", |_m: Message| async {
                if true {
                    panic!("bad fallback");
                }
                false
            }),
            3,
        );

        let outcome = registry.dispatch(&bus, Message::empty(topic::INTENT_FAILURE)).await;
        assert_eq!(outcome, FallbackOutcome::Exhausted);
        assert_eq!(bus.emitted(topic::COMPLETE_INTENT_FAILURE).len(), 1);

        let start = bus.emitted(topic::HANDLER_START);
        assert_eq!(start.len(), 1);
        assert_eq!(start[0].get_str("handler"), Some("fallback"));
        let complete = bus.emitted(topic::HANDLER_COMPLETE);
        assert_eq!(complete.len(), 1);
        assert_eq!(complete[0].get_str("exception"), Some(NO_FALLBACK));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_candidate_is_skipped() {
        let bus = LocalBus::with_history();
        let registry = FallbackRegistry::with_timeout(Duration::from_millis(20));
        registry.register(
            FallbackHandler::named("slow", |_m: Message| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                true
            }),
            1,
        );
        registry.register(FallbackHandler::named("fast", |_m: Message| async { true }), 2);

        let outcome = registry.dispatch(&bus, Message::empty(topic::INTENT_FAILURE)).await;
        assert_eq!(
            outcome,
            FallbackOutcome::Handled {
                priority: 2,
                handler: "fast".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_dispatcher_subscribed_to_intent_failure() {
        let bus: BoxedBus = Arc::new(LocalBus::new());
        let registry = Arc::new(FallbackRegistry::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        registry.register(
            FallbackHandler::named("count", move |_m: Message| {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    true
                }
            }),
            0,
        );
        bus.on(topic::INTENT_FAILURE, registry.build_dispatcher(&bus));

        bus.emit(Message::new(topic::INTENT_FAILURE, json!({"utterance": "blorp"})))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_default_name_comes_from_type() {
        let handler = FallbackHandler::new(|_m: Message| async { false });
        assert_eq!(handler.name(), "test_default_name_comes_from_type");
    }

    #[tokio::test]
    async fn test_changes_during_pass_wait_for_next_pass() {
        let bus = LocalBus::with_history();
        let registry = Arc::new(FallbackRegistry::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let p30 = recording("p30", &log, false);
        let late = recording("late", &log, false);

        let weak = Arc::downgrade(&registry);
        let (removed, added, l) = (p30.clone(), late.clone(), Arc::clone(&log));
        let mutating = FallbackHandler::named("p10", move |_m: Message| {
            let registry = weak.upgrade();
            let (removed, added, l) = (removed.clone(), added.clone(), Arc::clone(&l));
            async move {
                l.lock().push("p10".to_string());
                if let Some(registry) = registry {
                    registry.remove(&removed);
                    registry.register(added, 15);
                }
                false
            }
        });
        registry.register(mutating, 10);
        registry.register(recording("p20", &log, false), 20);
        registry.register(p30, 30);

        let outcome = registry.dispatch(&bus, Message::empty(topic::INTENT_FAILURE)).await;
        assert_eq!(outcome, FallbackOutcome::Exhausted);
        assert_eq!(*log.lock(), vec!["p10", "p20", "p30"]);
        assert_eq!(registry.priorities(), vec![10, 15, 20]);
        assert!(registry.contains(&late));
        assert_eq!(bus.emitted(topic::COMPLETE_INTENT_FAILURE).len(), 1);
    }
}
