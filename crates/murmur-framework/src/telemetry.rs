//! Handler start/complete telemetry and failure containment.
//!
//! [`TelemetryLayer`] is the outermost layer of every bound handler stack:
//!
//! ```text
//! TelemetryService ─▶ Timeout ─▶ HandlerService ─▶ user handler
//! ```
//!
//! It emits exactly one `handler.start` and exactly one `handler.complete`
//! per delivery, turns every failure coming out of the inner stack into a
//! spoken apology and a logged error, and asks the owning skill to persist
//! its settings after a successful run.

use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::{Value, json};
use tower::{BoxError, Layer, Service, ServiceExt};
use tracing::{debug, error, warn};

use crate::error::InvocationError;
use crate::skill::WeakSkill;
use murmur_core::{Message, MessageBus, topic};

/// Builds a `handler.start` message.
pub(crate) fn start_message(handler: &str) -> Message {
    Message::new(topic::HANDLER_START, json!({ "handler": handler }))
}

/// Builds a `handler.complete` message, with an `exception` field if given.
pub(crate) fn complete_message(handler: &str, exception: Option<&str>) -> Message {
    let mut data = json!({ "handler": handler });
    if let (Some(exc), Value::Object(map)) = (exception, &mut data) {
        map.insert("exception".to_string(), Value::String(exc.to_string()));
    }
    Message::new(topic::HANDLER_COMPLETE, data)
}

/// Emits a message and logs instead of failing.
pub(crate) async fn emit_logged(bus: &dyn MessageBus, message: Message) {
    let msg_type = message.msg_type.clone();
    if let Err(e) = bus.emit(message).await {
        warn!(msg_type = %msg_type, error = %e, "Failed to emit message");
    }
}

// ============================================================================
// TelemetryLayer
// ============================================================================

/// Wraps a handler stack with telemetry and failure containment.
#[derive(Clone)]
pub struct TelemetryLayer {
    handler_name: Arc<str>,
    owner: WeakSkill,
    timeout: Duration,
}

impl TelemetryLayer {
    pub(crate) fn new(handler_name: impl Into<Arc<str>>, owner: WeakSkill, timeout: Duration) -> Self {
        Self {
            handler_name: handler_name.into(),
            owner,
            timeout,
        }
    }
}

impl<S> Layer<S> for TelemetryLayer {
    type Service = TelemetryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TelemetryService {
            inner,
            layer: self.clone(),
        }
    }
}

/// Service produced by [`TelemetryLayer`]. Never fails.
#[derive(Clone)]
pub struct TelemetryService<S> {
    inner: S,
    layer: TelemetryLayer,
}

impl<S> Service<Message> for TelemetryService<S>
where
    S: Service<Message, Response = (), Error = BoxError> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = ();
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, message: Message) -> Self::Future {
        let inner = self.inner.clone();
        let layer = self.layer.clone();
        async move {
            let Some(owner) = layer.owner.upgrade() else {
                return Ok(());
            };
            if !owner.is_dispatchable() {
                debug!(handler = %layer.handler_name, "Skill shut down, ignoring delivery");
                return Ok(());
            }
            let Some(bus) = owner.bus() else {
                return Ok(());
            };
            let name = layer.handler_name.as_ref();

            emit_logged(bus.as_ref(), start_message(name)).await;
            match inner.oneshot(message).await {
                Ok(()) => {
                    owner.persist_settings().await;
                    emit_logged(bus.as_ref(), complete_message(name, None)).await;
                }
                Err(e) => {
                    let err = InvocationError::classify(e, layer.timeout);
                    error!(
                        skill = %owner.name(),
                        handler = %name,
                        error = %err,
                        "An error occurred while processing a request"
                    );
                    let apology = format!(
                        "An error occurred while processing a request in {}",
                        owner.name()
                    );
                    if let Err(e) = owner.speak(apology, false).await {
                        warn!(skill = %owner.name(), error = %e, "Failed to speak error");
                    }
                    let exception = err.to_string();
                    emit_logged(bus.as_ref(), complete_message(name, Some(&exception))).await;
                }
            }
            Ok(())
        }
        .boxed()
    }
}
