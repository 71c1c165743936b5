//! Event binding.
//!
//! [`EventBinder`] turns adapted handlers into bus subscriptions and keeps
//! the per-skill list of live [`EventBinding`]s so they can be torn down at
//! shutdown. Each subscription drives a tower stack built from
//! [`HandlerService`], a `tower::timeout` layer and the
//! [`TelemetryLayer`](crate::telemetry::TelemetryLayer).

use std::panic::AssertUnwindSafe;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{self, BoxFuture};
use parking_lot::Mutex;
use tower::timeout::TimeoutLayer;
use tower::{BoxError, Service, ServiceBuilder, ServiceExt};
use tracing::{debug, trace};

use crate::error::InvocationError;
use crate::handler::{AdaptedHandler, EventHandler, HandlerShape};
use crate::skill::WeakSkill;
use crate::telemetry::TelemetryLayer;
use murmur_core::{BusHandler, Message, MessageBus, SubscriptionId, bus_handler};

// ============================================================================
// HandlerService
// ============================================================================

/// Innermost service of a bound handler: performs the adapted call.
///
/// Panics raised while building or polling the handler future are caught and
/// reported as [`InvocationError::Panicked`].
#[derive(Clone)]
pub struct HandlerService {
    handler: EventHandler,
    owner: WeakSkill,
    requires_owner: bool,
}

impl HandlerService {
    pub(crate) fn new(handler: EventHandler, owner: WeakSkill, requires_owner: bool) -> Self {
        Self {
            handler,
            owner,
            requires_owner,
        }
    }
}

impl Service<Message> for HandlerService {
    type Response = ();
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<(), BoxError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, message: Message) -> Self::Future {
        let Some(owner) = self.owner.upgrade() else {
            let err: BoxError = "owning skill was dropped".into();
            return future::ready(Err(err)).boxed();
        };
        let requires_owner = self.requires_owner;
        let handler = &self.handler;
        let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| {
            handler.invoke(&owner, message, requires_owner)
        })) {
            Ok(fut) => fut,
            Err(payload) => {
                let err: BoxError = Box::new(InvocationError::from_panic(payload));
                return future::ready(Err(err)).boxed();
            }
        };
        AssertUnwindSafe(fut)
            .catch_unwind()
            .map(|res| match res {
                Ok(out) => out,
                Err(payload) => Err(Box::new(InvocationError::from_panic(payload)) as BoxError),
            })
            .boxed()
    }
}

// ============================================================================
// EventBinding
// ============================================================================

/// A live association between a bus event and an adapted handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBinding {
    event_name: String,
    handler_name: String,
    owner: String,
    needs_owner: bool,
    shape: HandlerShape,
    subscription: SubscriptionId,
}

impl EventBinding {
    /// The subscribed event name.
    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    /// The owner-qualified handler name used in telemetry.
    pub fn handler_name(&self) -> &str {
        &self.handler_name
    }

    /// Name of the owning skill.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Whether the handler was bound with owner injection.
    pub fn needs_owner(&self) -> bool {
        self.needs_owner
    }

    /// The call shape resolved at bind time.
    pub fn shape(&self) -> HandlerShape {
        self.shape
    }

    /// The bus subscription backing this binding.
    pub fn subscription(&self) -> SubscriptionId {
        self.subscription
    }
}

// ============================================================================
// EventBinder
// ============================================================================

/// The per-skill list of event bindings.
#[derive(Debug, Default)]
pub struct EventBinder {
    bindings: Mutex<Vec<EventBinding>>,
}

impl EventBinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `handler` to `event_name` on `bus`.
    ///
    /// `owner_name` qualifies the telemetry name as `"{owner}.{handler}"`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn bind(
        &self,
        bus: &dyn MessageBus,
        owner: WeakSkill,
        owner_name: &str,
        event_name: &str,
        handler: AdaptedHandler,
        requires_owner: bool,
        timeout: Duration,
    ) -> EventBinding {
        let shape = handler.shape();
        let (bare, handler) = handler.into_parts();
        let handler_name = if owner_name.is_empty() {
            bare
        } else {
            format!("{owner_name}.{bare}")
        };

        let svc = ServiceBuilder::new()
            .layer(TelemetryLayer::new(handler_name.as_str(), owner.clone(), timeout))
            .layer(TimeoutLayer::new(timeout))
            .service(HandlerService::new(handler, owner, requires_owner));

        let subscriber: BusHandler = bus_handler(move |msg| {
            let svc = svc.clone();
            async move {
                // The telemetry service is infallible.
                let _ = svc.oneshot(msg).await;
            }
        });
        let subscription = bus.on(event_name, subscriber);

        let binding = EventBinding {
            event_name: event_name.to_string(),
            handler_name,
            owner: owner_name.to_string(),
            needs_owner: requires_owner,
            shape,
            subscription,
        };
        debug!(
            event = %binding.event_name,
            handler = %binding.handler_name,
            shape = ?shape,
            "Bound event handler"
        );
        self.bindings.lock().push(binding.clone());
        binding
    }

    /// Removes every binding for `event_name`. Returns `true` if any existed.
    pub(crate) fn remove(&self, bus: &dyn MessageBus, event_name: &str) -> bool {
        let removed: Vec<EventBinding> = {
            let mut bindings = self.bindings.lock();
            let (gone, kept) = bindings
                .drain(..)
                .partition(|b: &EventBinding| b.event_name == event_name);
            *bindings = kept;
            gone
        };
        for binding in &removed {
            if !bus.remove(&binding.event_name, binding.subscription) {
                trace!(event = %binding.event_name, "Subscription already gone");
            }
        }
        !removed.is_empty()
    }

    /// Removes every binding. Returns how many were removed.
    pub(crate) fn remove_all(&self, bus: &dyn MessageBus) -> usize {
        let removed = std::mem::take(&mut *self.bindings.lock());
        for binding in &removed {
            if !bus.remove(&binding.event_name, binding.subscription) {
                trace!(event = %binding.event_name, "Subscription already gone");
            }
        }
        removed.len()
    }

    /// Snapshot of the live bindings, in bind order.
    pub fn bindings(&self) -> Vec<EventBinding> {
        self.bindings.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.bindings.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use crate::error::ArgumentMismatch;
    use crate::handler::{HandlerArg, named, variadic};
    use crate::settings::{JsonSettings, SettingsStore};
    use crate::skill::{Skill, SkillBehavior, SkillOptions};
    use murmur_core::{LocalBus, topic};

    use super::*;

    struct Quiet;

    #[async_trait::async_trait]
    impl SkillBehavior for Quiet {}

    fn bound_skill(timeout: Duration) -> (Arc<LocalBus>, Skill) {
        let bus = Arc::new(LocalBus::with_history());
        let options = SkillOptions {
            handler_timeout: timeout,
            ..SkillOptions::default()
        };
        let skill = Skill::builder("weather", Quiet).options(options).build();
        skill.bind(bus.clone()).unwrap();
        bus.clear_history();
        (bus, skill)
    }

    fn telemetry(bus: &LocalBus) -> Vec<(String, Option<String>)> {
        bus.history()
            .into_iter()
            .filter(|m| m.msg_type == topic::HANDLER_START || m.msg_type == topic::HANDLER_COMPLETE)
            .map(|m| (m.msg_type.clone(), m.get_str("exception").map(str::to_string)))
            .collect()
    }

    #[tokio::test]
    async fn test_zero_arg_handler_ignores_payload() {
        let (bus, skill) = bound_skill(Duration::from_secs(5));
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        skill
            .bind_event(
                "ping",
                move || {
                    let c = Arc::clone(&c);
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                    }
                },
                false,
            )
            .unwrap();

        bus.emit(Message::new("ping", json!({"anything": [1, 2, 3]})))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_owner_and_payload_handler_receives_both() {
        let (bus, skill) = bound_skill(Duration::from_secs(5));
        let seen = Arc::new(Mutex::new(None));
        let s = Arc::clone(&seen);
        skill
            .bind_event(
                "greet",
                move |owner: Skill, msg: Message| {
                    let s = Arc::clone(&s);
                    async move {
                        *s.lock() = Some((owner.name().to_string(), msg.get_str("who").map(str::to_string)));
                    }
                },
                true,
            )
            .unwrap();

        bus.emit(Message::new("greet", json!({"who": "ada"}))).await.unwrap();
        assert_eq!(
            seen.lock().clone(),
            Some(("weather".to_string(), Some("ada".to_string())))
        );
    }

    #[tokio::test]
    async fn test_exactly_one_start_and_complete_on_success() {
        let (bus, skill) = bound_skill(Duration::from_secs(5));
        let binding = skill
            .bind_event("tick", named("on_tick", |_m: Message| async {}), false)
            .unwrap();
        assert_eq!(binding.handler_name(), "weather.on_tick");

        bus.emit(Message::empty("tick")).await.unwrap();
        assert_eq!(
            telemetry(&bus),
            vec![
                (topic::HANDLER_START.to_string(), None),
                (topic::HANDLER_COMPLETE.to_string(), None),
            ]
        );
        assert_eq!(
            bus.emitted(topic::HANDLER_START)[0].get_str("handler"),
            Some("weather.on_tick")
        );
    }

    #[tokio::test]
    async fn test_failing_handler_is_contained() {
        let (bus, skill) = bound_skill(Duration::from_secs(5));
        skill
            .bind_event("fail", || async { Err::<(), _>("sensor offline") }, false)
            .unwrap();

        bus.emit(Message::empty("fail")).await.unwrap();

        let events = telemetry(&bus);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], (topic::HANDLER_START.to_string(), None));
        assert_eq!(
            events[1],
            (topic::HANDLER_COMPLETE.to_string(), Some("sensor offline".to_string()))
        );
        let spoken = bus.emitted(topic::SPEAK);
        assert_eq!(
            spoken[0].get_str("utterance"),
            Some("An error occurred while processing a request in weather")
        );
    }

    #[tokio::test]
    async fn test_panicking_handler_is_contained() {
        let (bus, skill) = bound_skill(Duration::from_secs(5));
        skill
            .bind_event(
                "explode",
                |_m: Message| async {
                    if true {
                        panic!("kaboom");
                    }
                },
                false,
            )
            .unwrap();

        bus.emit(Message::empty("explode")).await.unwrap();

        let events = telemetry(&bus);
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1].1.as_deref(),
            Some("handler panicked: kaboom")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_handler_completes_with_exception() {
        let (bus, skill) = bound_skill(Duration::from_millis(50));
        skill
            .bind_event(
                "slow",
                || async { tokio::time::sleep(Duration::from_secs(10)).await },
                false,
            )
            .unwrap();

        bus.emit(Message::empty("slow")).await.unwrap();

        let events = telemetry(&bus);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].1.as_deref(), Some("handler timed out after 50ms"));
    }

    #[tokio::test]
    async fn test_variadic_owner_handler_falls_back_to_owner_only() {
        let (bus, skill) = bound_skill(Duration::from_secs(5));
        let lengths = Arc::new(Mutex::new(Vec::new()));
        let l = Arc::clone(&lengths);
        skill
            .bind_event(
                "legacy",
                variadic(move |args: Vec<HandlerArg>| {
                    let l = Arc::clone(&l);
                    async move {
                        l.lock().push(args.len());
                        if args.len() == 1 {
                            Ok(())
                        } else {
                            Err(ArgumentMismatch { expected: 1, got: args.len() })
                        }
                    }
                }),
                true,
            )
            .unwrap();

        bus.emit(Message::empty("legacy")).await.unwrap();
        assert_eq!(*lengths.lock(), vec![2, 1]);
        assert_eq!(telemetry(&bus)[1].1, None);
    }

    #[tokio::test]
    async fn test_variadic_without_owner_gets_payload_first() {
        let (bus, skill) = bound_skill(Duration::from_secs(5));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        skill
            .bind_event(
                "legacy",
                variadic(move |args: Vec<HandlerArg>| {
                    let s = Arc::clone(&s);
                    async move {
                        let payload = args.first().and_then(HandlerArg::as_payload).cloned();
                        s.lock().push(payload.map(|m| m.msg_type));
                    }
                }),
                false,
            )
            .unwrap();

        bus.emit(Message::empty("legacy")).await.unwrap();
        assert_eq!(*seen.lock(), vec![Some("legacy".to_string())]);
    }

    #[tokio::test]
    async fn test_settings_persist_only_after_success() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let settings = Arc::new(JsonSettings::new(&path));
        let bus = Arc::new(LocalBus::with_history());
        let skill = Skill::builder("weather", Quiet)
            .settings(settings.clone())
            .build();
        skill.bind(bus.clone()).unwrap();

        let s = settings.clone();
        skill
            .bind_event(
                "fail",
                move || {
                    let s = s.clone();
                    async move {
                        s.set("units", "metric").unwrap();
                        Err::<(), _>("broke after mutating")
                    }
                },
                false,
            )
            .unwrap();
        skill.bind_event("ok", || async {}, false).unwrap();

        bus.emit(Message::empty("fail")).await.unwrap();
        assert!(settings.is_dirty());
        assert!(!path.exists());

        bus.emit(Message::empty("ok")).await.unwrap();
        assert!(!settings.is_dirty());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_remove_event_unsubscribes() {
        let (bus, skill) = bound_skill(Duration::from_secs(5));
        skill.bind_event("tick", || async {}, false).unwrap();
        skill.bind_event("tick", |_m: Message| async {}, false).unwrap();
        assert_eq!(bus.subscriber_count("tick"), 2);

        assert!(skill.remove_event("tick"));
        assert!(!skill.remove_event("tick"));
        assert_eq!(bus.subscriber_count("tick"), 0);

        bus.clear_history();
        bus.emit(Message::empty("tick")).await.unwrap();
        assert!(telemetry(&bus).is_empty());
    }

    #[tokio::test]
    async fn test_dropped_skill_makes_wrapper_inert() {
        let (bus, skill) = bound_skill(Duration::from_secs(5));
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        skill
            .bind_event(
                "tick",
                move || {
                    let c = Arc::clone(&c);
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                    }
                },
                false,
            )
            .unwrap();
        drop(skill);

        bus.emit(Message::empty("tick")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(telemetry(&bus).is_empty());
    }
}
