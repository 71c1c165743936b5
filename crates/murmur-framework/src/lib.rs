//! # Murmur Framework
//!
//! Skill-side dispatch for a voice assistant.
//!
//! This layer provides:
//! - [`Skill`] handles with an explicit lifecycle (bind, initialize, activate, shutdown)
//! - Event binding with call-shape adaptation, timeouts and failure containment
//! - Namespaced intent, entity, vocabulary and context registration
//! - The process-wide, priority-ordered [`FallbackRegistry`]
//! - A scheduler client for deferred and repeating events
//!
//! Transports are not part of this crate; everything goes through
//! [`murmur_core::MessageBus`].

pub mod binder;
pub mod error;
pub mod fallback;
pub mod filesystem;
pub mod handler;
pub mod intent;
pub mod presentation;
pub mod scheduler;
pub mod settings;
pub mod skill;
pub mod telemetry;

pub use binder::{EventBinder, EventBinding, HandlerService};
pub use error::{
    ArgumentMismatch, InvocationError, LifecycleError, LifecycleResult, RegistrationError,
    RegistrationResult, SettingsError, SettingsResult,
};
pub use fallback::{FallbackHandler, FallbackOutcome, FallbackOutput, FallbackRegistry, NO_FALLBACK};
pub use filesystem::FileSystemAccess;
pub use handler::{
    AdaptedHandler, EventHandler, HandlerArg, HandlerOutput, HandlerShape, IntoEventHandler,
    Named, Variadic, named, variadic,
};
pub use intent::{Intent, IntentBuilder, IntentSource};
pub use presentation::{DialogRenderer, Enclosure, Presentation};
pub use settings::{JsonSettings, SettingsStore};
pub use skill::{
    Declarations, Skill, SkillBehavior, SkillBuilder, SkillOptions, SkillState, WeakSkill,
};
pub use telemetry::{TelemetryLayer, TelemetryService};
pub use tower::BoxError;
