//! Error types for the Murmur framework.
//!
//! Only [`RegistrationError`] (and the [`LifecycleError`] it may wrap) ever
//! reaches a caller. [`InvocationError`] describes failures that happen at
//! dispatch time; it is produced, logged and turned into telemetry at the
//! binder and fallback boundaries, and never propagated further.

use std::any::Any;
use std::time::Duration;

use thiserror::Error;
use tower::BoxError;

use crate::skill::SkillState;
use murmur_core::BusError;

/// Errors raised synchronously by registration calls.
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// The intent description has an unrecognized shape.
    #[error("invalid intent descriptor: {0}")]
    InvalidDescriptor(String),

    /// Entity files must carry the `.entity` marker.
    #[error("invalid entity filename: {0}")]
    InvalidEntityFile(String),

    /// The regex does not compile.
    #[error("invalid regex '{pattern}': {reason}")]
    InvalidRegex {
        /// The offending pattern.
        pattern: String,
        /// Compiler message.
        reason: String,
    },

    /// Context keywords must be non-empty.
    #[error("invalid context keyword: {0:?}")]
    InvalidContext(String),

    /// Registration attempted before the skill id was assigned.
    #[error("skill '{0}' has no skill id yet")]
    MissingSkillId(String),

    /// Fallback registration needs a shared registry and none was injected.
    #[error("skill '{0}' has no fallback registry")]
    NoFallbackRegistry(String),

    /// The skill is in a state that does not accept registrations.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// The registration message could not be published.
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Errors raised by lifecycle transitions.
#[derive(Debug, Clone, Error)]
pub enum LifecycleError {
    /// The requested transition is not valid from the current state.
    #[error("skill '{skill}' cannot {action} while {state}")]
    InvalidTransition {
        /// Skill name.
        skill: String,
        /// The attempted action.
        action: &'static str,
        /// The state the skill was in.
        state: SkillState,
    },

    /// The skill id is immutable once assigned.
    #[error("skill '{skill}' already has id '{id}'")]
    IdAlreadyAssigned {
        /// Skill name.
        skill: String,
        /// The id already in place.
        id: String,
    },

    /// The operation needs a bus and none is bound.
    #[error("skill '{0}' is not bound to a message bus")]
    NotBound(String),

    /// The user setup routine failed.
    #[error("setup of skill '{skill}' failed: {reason}")]
    SetupFailed {
        /// Skill name.
        skill: String,
        /// The setup error rendered as text.
        reason: String,
    },
}

/// A contained dispatch-time failure.
#[derive(Debug, Error)]
pub enum InvocationError {
    /// The handler returned an error.
    #[error("{0}")]
    Failed(BoxError),

    /// The handler panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),

    /// The handler did not finish within the execution timeout.
    #[error("handler timed out after {0:?}")]
    TimedOut(Duration),
}

impl InvocationError {
    /// Classifies an error coming out of a handler service stack.
    ///
    /// `timeout` is the limit the stack was running under; it is only used
    /// for the message of [`InvocationError::TimedOut`].
    pub fn classify(err: BoxError, timeout: Duration) -> Self {
        if err.is::<tower::timeout::error::Elapsed>() {
            return Self::TimedOut(timeout);
        }
        match err.downcast::<InvocationError>() {
            Ok(inner) => *inner,
            Err(other) => Self::Failed(other),
        }
    }

    /// Builds an [`InvocationError::Panicked`] from a caught panic payload.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        Self::Panicked(panic_message(payload.as_ref()))
    }
}

/// Returned by variadic handlers that cannot accept the offered argument list.
///
/// The binder reacts to it by retrying with the shorter argument list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("handler takes {expected} argument(s), {got} given")]
pub struct ArgumentMismatch {
    /// Number of arguments the handler accepts.
    pub expected: usize,
    /// Number of arguments offered.
    pub got: usize,
}

/// Errors from a settings store.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// Reading or writing the backing file failed.
    #[error("settings I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The settings could not be (de)serialized.
    #[error("settings serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for registration calls.
pub type RegistrationResult<T> = Result<T, RegistrationError>;

/// Result type for lifecycle transitions.
pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Result type for settings operations.
pub type SettingsResult<T> = Result<T, SettingsError>;

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
