//! Handler adaptation.
//!
//! Skills bind plain async closures and functions to bus events. Each
//! callable is converted **once**, when it is bound, into an
//! [`EventHandler`]: a tagged variant that records which call shape the
//! callable expects. Delivery then matches on the tag; there is no per-call
//! inspection of the callable.
//!
//! | Callable | Shape |
//! |---|---|
//! | `async fn()` | [`HandlerShape::NoArgs`] |
//! | `async fn(Message)` | [`HandlerShape::PayloadOnly`] |
//! | `async fn(Skill)` | [`HandlerShape::OwnerOnly`] |
//! | `async fn(Skill, Message)` | [`HandlerShape::OwnerAndPayload`] |
//! | [`variadic`]`(f)` | [`HandlerShape::Variadic`] |
//!
//! Handlers may return `()` or `Result<(), E>` for any `E` convertible into
//! a boxed error.
//!
//! # Variadic handlers
//!
//! A variadic handler receives an argument list whose length is not known
//! statically. It is kept for compatibility with handlers that were written
//! against a dynamic calling convention and should not be used for new code.
//! With owner injection the binder first offers `[owner, payload]` and, if
//! the handler rejects the list with [`ArgumentMismatch`], retries with
//! `[owner]`. Without owner injection the lists are `[payload]` and `[]`.
//!
//! ```rust,ignore
//! skill.bind_event("greet", |msg: Message| async move {
//!     info!(name = ?msg.get_str("name"), "hello");
//! }, false)?;
//!
//! skill.bind_event("stats", |skill: Skill, _msg: Message| async move {
//!     skill.speak("All systems nominal", false).await
//! }, true)?;
//! ```

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use tower::BoxError;
use tracing::debug;

use crate::error::ArgumentMismatch;
use crate::skill::Skill;
use murmur_core::Message;

/// Future returned by an adapted handler.
pub type HandlerFuture = BoxFuture<'static, Result<(), BoxError>>;

// ============================================================================
// HandlerOutput
// ============================================================================

/// Types a bound handler may return.
pub trait HandlerOutput: Send + 'static {
    /// Converts the return value into the binder's success/failure signal.
    fn into_result(self) -> Result<(), BoxError>;
}

impl HandlerOutput for () {
    fn into_result(self) -> Result<(), BoxError> {
        Ok(())
    }
}

impl<E> HandlerOutput for Result<(), E>
where
    E: Into<BoxError> + Send + 'static,
{
    fn into_result(self) -> Result<(), BoxError> {
        self.map_err(Into::into)
    }
}

// ============================================================================
// Shapes
// ============================================================================

/// The call shape of an adapted handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerShape {
    /// Called with no arguments.
    NoArgs,
    /// Called with the message.
    PayloadOnly,
    /// Called with the owning skill.
    OwnerOnly,
    /// Called with the owning skill and the message.
    OwnerAndPayload,
    /// Called with an argument list; see the module docs.
    Variadic,
}

impl HandlerShape {
    /// Returns `true` if this shape receives the owning skill.
    pub fn takes_owner(self) -> bool {
        matches!(self, Self::OwnerOnly | Self::OwnerAndPayload)
    }
}

/// One entry of a variadic argument list.
#[derive(Debug, Clone)]
pub enum HandlerArg {
    /// The owning skill.
    Owner(Skill),
    /// The delivered message.
    Payload(Message),
}

impl HandlerArg {
    /// Returns the owner if this argument is one.
    pub fn as_owner(&self) -> Option<&Skill> {
        match self {
            Self::Owner(s) => Some(s),
            Self::Payload(_) => None,
        }
    }

    /// Returns the message if this argument is one.
    pub fn as_payload(&self) -> Option<&Message> {
        match self {
            Self::Payload(m) => Some(m),
            Self::Owner(_) => None,
        }
    }
}

type NoArgsFn = Arc<dyn Fn() -> HandlerFuture + Send + Sync>;
type PayloadFn = Arc<dyn Fn(Message) -> HandlerFuture + Send + Sync>;
type OwnerFn = Arc<dyn Fn(Skill) -> HandlerFuture + Send + Sync>;
type OwnerPayloadFn = Arc<dyn Fn(Skill, Message) -> HandlerFuture + Send + Sync>;
type VariadicFn = Arc<dyn Fn(Vec<HandlerArg>) -> HandlerFuture + Send + Sync>;

/// A handler whose call shape has been resolved.
#[derive(Clone)]
pub enum EventHandler {
    NoArgs(NoArgsFn),
    PayloadOnly(PayloadFn),
    OwnerOnly(OwnerFn),
    OwnerAndPayload(OwnerPayloadFn),
    Variadic(VariadicFn),
}

impl EventHandler {
    /// Returns the resolved call shape.
    pub fn shape(&self) -> HandlerShape {
        match self {
            Self::NoArgs(_) => HandlerShape::NoArgs,
            Self::PayloadOnly(_) => HandlerShape::PayloadOnly,
            Self::OwnerOnly(_) => HandlerShape::OwnerOnly,
            Self::OwnerAndPayload(_) => HandlerShape::OwnerAndPayload,
            Self::Variadic(_) => HandlerShape::Variadic,
        }
    }

    /// Calls the handler with the shape recorded at bind time.
    ///
    /// `requires_owner` only matters for variadic handlers, where it selects
    /// the argument lists offered.
    pub fn invoke(&self, owner: &Skill, message: Message, requires_owner: bool) -> HandlerFuture {
        match self {
            Self::NoArgs(f) => f(),
            Self::PayloadOnly(f) => f(message),
            Self::OwnerOnly(f) => f(owner.clone()),
            Self::OwnerAndPayload(f) => f(owner.clone(), message),
            Self::Variadic(f) => {
                let f = Arc::clone(f);
                let owner = owner.clone();
                async move {
                    let (full, reduced) = if requires_owner {
                        (
                            vec![HandlerArg::Owner(owner.clone()), HandlerArg::Payload(message)],
                            vec![HandlerArg::Owner(owner)],
                        )
                    } else {
                        (vec![HandlerArg::Payload(message)], Vec::new())
                    };
                    match f(full).await {
                        Err(e) if e.is::<ArgumentMismatch>() => {
                            debug!(error = %e, "Retrying variadic handler with reduced arguments");
                            f(reduced).await
                        }
                        other => other,
                    }
                }
                .boxed()
            }
        }
    }
}

impl std::fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("EventHandler").field(&self.shape()).finish()
    }
}

// ============================================================================
// IntoEventHandler
// ============================================================================

/// Conversion from a callable into an [`EventHandler`].
///
/// Implemented for async closures and functions of every supported shape,
/// for [`Variadic`] and for [`Named`]. The `M` parameter is a marker that
/// keeps the shape impls apart; callers never name it.
pub trait IntoEventHandler<M>: Send + Sync + 'static {
    /// Resolves the call shape.
    fn into_event_handler(self) -> EventHandler;

    /// Bare display name used in telemetry.
    fn handler_name(&self) -> String {
        short_type_name::<Self>()
    }
}

#[doc(hidden)]
pub struct NoArgsMarker;
#[doc(hidden)]
pub struct PayloadMarker;
#[doc(hidden)]
pub struct OwnerMarker;
#[doc(hidden)]
pub struct OwnerPayloadMarker;
#[doc(hidden)]
pub struct VariadicMarker;
#[doc(hidden)]
pub struct NamedMarker<M>(PhantomData<M>);

impl<F, Fut, R> IntoEventHandler<NoArgsMarker> for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: HandlerOutput,
{
    fn into_event_handler(self) -> EventHandler {
        EventHandler::NoArgs(Arc::new(move || self().map(HandlerOutput::into_result).boxed()))
    }
}

impl<F, Fut, R> IntoEventHandler<PayloadMarker> for F
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: HandlerOutput,
{
    fn into_event_handler(self) -> EventHandler {
        EventHandler::PayloadOnly(Arc::new(move |msg| {
            self(msg).map(HandlerOutput::into_result).boxed()
        }))
    }
}

impl<F, Fut, R> IntoEventHandler<OwnerMarker> for F
where
    F: Fn(Skill) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: HandlerOutput,
{
    fn into_event_handler(self) -> EventHandler {
        EventHandler::OwnerOnly(Arc::new(move |skill| {
            self(skill).map(HandlerOutput::into_result).boxed()
        }))
    }
}

impl<F, Fut, R> IntoEventHandler<OwnerPayloadMarker> for F
where
    F: Fn(Skill, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: HandlerOutput,
{
    fn into_event_handler(self) -> EventHandler {
        EventHandler::OwnerAndPayload(Arc::new(move |skill, msg| {
            self(skill, msg).map(HandlerOutput::into_result).boxed()
        }))
    }
}

/// A handler taking a dynamic argument list. Build with [`variadic`].
pub struct Variadic<F>(F);

/// Wraps an argument-list callable as a variadic handler.
pub fn variadic<F, Fut, R>(f: F) -> Variadic<F>
where
    F: Fn(Vec<HandlerArg>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: HandlerOutput,
{
    Variadic(f)
}

impl<F, Fut, R> IntoEventHandler<VariadicMarker> for Variadic<F>
where
    F: Fn(Vec<HandlerArg>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: HandlerOutput,
{
    fn into_event_handler(self) -> EventHandler {
        let f = self.0;
        EventHandler::Variadic(Arc::new(move |args| {
            f(args).map(HandlerOutput::into_result).boxed()
        }))
    }

    fn handler_name(&self) -> String {
        short_type_name::<F>()
    }
}

/// A handler with an explicit telemetry name. Build with [`named`].
pub struct Named<H> {
    name: String,
    inner: H,
}

/// Gives a handler an explicit name instead of the one derived from its type.
pub fn named<H>(name: impl Into<String>, handler: H) -> Named<H> {
    Named {
        name: name.into(),
        inner: handler,
    }
}

impl<H, M> IntoEventHandler<NamedMarker<M>> for Named<H>
where
    H: IntoEventHandler<M>,
    M: 'static,
{
    fn into_event_handler(self) -> EventHandler {
        self.inner.into_event_handler()
    }

    fn handler_name(&self) -> String {
        self.name.clone()
    }
}

// ============================================================================
// AdaptedHandler
// ============================================================================

/// A handler resolved at bind time, together with its display name.
#[derive(Debug, Clone)]
pub struct AdaptedHandler {
    name: String,
    handler: EventHandler,
}

impl AdaptedHandler {
    /// Resolves `handler` into its shape and name.
    pub fn new<H, M>(handler: H) -> Self
    where
        H: IntoEventHandler<M>,
    {
        let name = handler.handler_name();
        Self {
            name,
            handler: handler.into_event_handler(),
        }
    }

    /// The bare display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The resolved call shape.
    pub fn shape(&self) -> HandlerShape {
        self.handler.shape()
    }

    pub(crate) fn into_parts(self) -> (String, EventHandler) {
        (self.name, self.handler)
    }
}

/// Derives a short display name from a type path.
///
/// `my_skill::handlers::on_weather` becomes `on_weather`; closures take the
/// name of the enclosing function.
pub(crate) fn short_type_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::")
        .find(|seg| !seg.is_empty() && !seg.starts_with('{'))
        .unwrap_or(base)
        .to_string()
}
