//! Skills and their lifecycle.
//!
//! A [`Skill`] is a cheap, cloneable handle to one loaded skill instance. The
//! user-facing logic lives behind [`SkillBehavior`]; the handle owns the
//! plumbing (bus binding, event bindings, intents, fallbacks, settings).
//!
//! ```text
//! Unbound ──bind──▶ Bound ──initialize──▶ Initialized ──activate──▶ Active
//!                     │                        │                      │
//!                     └────────────────────────┴───────shutdown───────┴──▶ ShutDown
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! struct Weather;
//!
//! #[async_trait]
//! impl SkillBehavior for Weather {
//!     fn declare(&self, decl: &mut Declarations) {
//!         decl.intent(
//!             IntentBuilder::new("forecast").require("ForecastKeyword"),
//!             |skill: Skill, msg: Message| async move { skill.speak("Sunny", false).await },
//!         );
//!     }
//! }
//!
//! let skill = Skill::builder("weather", Weather).build();
//! skill.bind(bus)?;
//! skill.assign_id("3")?;
//! skill.initialize().await?;
//! skill.activate()?;
//! ```

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use tower::BoxError;
use tracing::{debug, error, info, warn};

use crate::binder::{EventBinder, EventBinding};
use crate::error::{
    LifecycleError, LifecycleResult, RegistrationError, RegistrationResult, panic_message,
};
use crate::fallback::{FallbackHandler, FallbackRegistry};
use crate::filesystem::FileSystemAccess;
use crate::handler::{AdaptedHandler, IntoEventHandler, named};
use crate::intent::{Intent, IntentSource};
use crate::presentation::{DialogRenderer, Enclosure, Presentation};
use crate::settings::{JsonSettings, SettingsStore};
use crate::telemetry::emit_logged;
use murmur_core::{BoxedBus, BusResult, Message, topic};

// ─── SkillState ──────────────────────────────────────────────────────────────

/// Lifecycle state of a skill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkillState {
    /// Constructed, no bus attached.
    Unbound,
    /// Attached to a bus; the stop handler is registered.
    Bound,
    /// The setup routine ran and declared handlers are bound.
    Initialized,
    /// Live.
    Active,
    /// Torn down. Terminal.
    ShutDown,
}

impl fmt::Display for SkillState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unbound => "unbound",
            Self::Bound => "bound",
            Self::Initialized => "initialized",
            Self::Active => "active",
            Self::ShutDown => "shut down",
        };
        f.write_str(s)
    }
}

// ─── SkillOptions ────────────────────────────────────────────────────────────

/// Per-skill settings derived from the host configuration.
#[derive(Debug, Clone)]
pub struct SkillOptions {
    /// Language code, e.g. `en-us`.
    pub lang: String,
    /// Skill root; holds `vocab/`, `dialog/` and `settings.json`.
    pub base_dir: PathBuf,
    /// Root for per-skill scoped storage.
    pub data_dir: PathBuf,
    /// How long after a stop request [`Skill::is_stop`] stays true.
    pub stop_threshold: Duration,
    /// Execution limit for each bound handler and fallback candidate.
    pub handler_timeout: Duration,
}

impl Default for SkillOptions {
    fn default() -> Self {
        Self {
            lang: "en-us".to_string(),
            base_dir: PathBuf::from("."),
            data_dir: PathBuf::from("data"),
            stop_threshold: Duration::from_secs(2),
            handler_timeout: Duration::from_secs(30),
        }
    }
}

// ─── SkillBehavior ───────────────────────────────────────────────────────────

/// User-supplied skill logic.
///
/// Every method has a default, so a skill only implements what it needs.
#[async_trait]
pub trait SkillBehavior: Send + Sync + 'static {
    /// Declares handlers that are bound, with owner injection, right after
    /// [`initialize`](Self::initialize) succeeds.
    fn declare(&self, _declarations: &mut Declarations) {}

    /// Setup routine. Usually registers intents and events. An error aborts
    /// the load.
    async fn initialize(&self, _skill: &Skill) -> Result<(), BoxError> {
        debug!("No initialize function implemented");
        Ok(())
    }

    /// Called on `mycroft.stop` and at shutdown. Errors are logged.
    async fn stop(&self, _skill: &Skill) -> Result<(), BoxError> {
        Ok(())
    }

    /// Gives an active skill the first look at an utterance. Return `true`
    /// if it was handled.
    async fn converse(&self, _skill: &Skill, _utterances: &[String], _lang: &str) -> bool {
        false
    }
}

// ─── Declarations ────────────────────────────────────────────────────────────

pub(crate) enum Declared {
    Intent {
        source: IntentSource,
        handler: AdaptedHandler,
    },
    IntentFile {
        file: String,
        handler: AdaptedHandler,
    },
}

/// Handlers a skill declares up front instead of registering in `initialize`.
#[derive(Default)]
pub struct Declarations {
    entries: Vec<Declared>,
}

impl Declarations {
    /// Declares a structured intent.
    pub fn intent<H, M>(&mut self, intent: impl Into<IntentSource>, handler: H) -> &mut Self
    where
        H: IntoEventHandler<M>,
    {
        self.entries.push(Declared::Intent {
            source: intent.into(),
            handler: AdaptedHandler::new(handler),
        });
        self
    }

    /// Declares an example-file intent.
    pub fn intent_file<H, M>(&mut self, file: impl Into<String>, handler: H) -> &mut Self
    where
        H: IntoEventHandler<M>,
    {
        self.entries.push(Declared::IntentFile {
            file: file.into(),
            handler: AdaptedHandler::new(handler),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ─── Skill ───────────────────────────────────────────────────────────────────

pub(crate) struct SkillInner {
    pub(crate) name: String,
    pub(crate) skill_id: OnceLock<String>,
    pub(crate) options: SkillOptions,
    pub(crate) state: Mutex<SkillState>,
    pub(crate) bus: RwLock<Option<BoxedBus>>,
    pub(crate) presentation: RwLock<Option<Arc<dyn Presentation>>>,
    pub(crate) dialog: Option<Arc<dyn DialogRenderer>>,
    pub(crate) settings: Arc<dyn SettingsStore>,
    pub(crate) settings_lock: tokio::sync::Mutex<()>,
    pub(crate) file_system: FileSystemAccess,
    pub(crate) binder: EventBinder,
    pub(crate) intents: Mutex<Vec<(String, Intent)>>,
    pub(crate) fallbacks: Option<Arc<FallbackRegistry>>,
    pub(crate) instance_fallbacks: Mutex<Vec<FallbackHandler>>,
    pub(crate) stop_time: Mutex<Option<Instant>>,
    pub(crate) behavior: Arc<dyn SkillBehavior>,
    behavior_any: Arc<dyn Any + Send + Sync>,
}

/// Handle to a loaded skill.
#[derive(Clone)]
pub struct Skill {
    pub(crate) inner: Arc<SkillInner>,
}

/// Non-owning handle held by bound handlers.
#[derive(Clone, Debug)]
pub struct WeakSkill(Weak<SkillInner>);

impl WeakSkill {
    /// Returns the skill if it is still alive.
    pub fn upgrade(&self) -> Option<Skill> {
        self.0.upgrade().map(|inner| Skill { inner })
    }
}

/// Builder for [`Skill`].
pub struct SkillBuilder {
    name: String,
    behavior: Arc<dyn SkillBehavior>,
    behavior_any: Arc<dyn Any + Send + Sync>,
    options: SkillOptions,
    settings: Option<Arc<dyn SettingsStore>>,
    dialog: Option<Arc<dyn DialogRenderer>>,
    presentation: Option<Arc<dyn Presentation>>,
    fallbacks: Option<Arc<FallbackRegistry>>,
}

impl SkillBuilder {
    pub fn options(mut self, options: SkillOptions) -> Self {
        self.options = options;
        self
    }

    /// Overrides the settings store. Defaults to `{base_dir}/settings.json`.
    pub fn settings(mut self, settings: Arc<dyn SettingsStore>) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn dialog(mut self, renderer: Arc<dyn DialogRenderer>) -> Self {
        self.dialog = Some(renderer);
        self
    }

    /// Overrides the presentation handle. Defaults to a bus-backed
    /// [`Enclosure`] created at bind time.
    pub fn presentation(mut self, presentation: Arc<dyn Presentation>) -> Self {
        self.presentation = Some(presentation);
        self
    }

    /// Injects the shared fallback registry.
    pub fn fallback_registry(mut self, registry: Arc<FallbackRegistry>) -> Self {
        self.fallbacks = Some(registry);
        self
    }

    pub fn build(self) -> Skill {
        let settings = self.settings.unwrap_or_else(|| {
            Arc::new(JsonSettings::new(self.options.base_dir.join("settings.json")))
        });
        let file_system = FileSystemAccess::new(&self.options.data_dir, &self.name);
        Skill {
            inner: Arc::new(SkillInner {
                name: self.name,
                skill_id: OnceLock::new(),
                options: self.options,
                state: Mutex::new(SkillState::Unbound),
                bus: RwLock::new(None),
                presentation: RwLock::new(self.presentation),
                dialog: self.dialog,
                settings,
                settings_lock: tokio::sync::Mutex::new(()),
                file_system,
                binder: EventBinder::new(),
                intents: Mutex::new(Vec::new()),
                fallbacks: self.fallbacks,
                instance_fallbacks: Mutex::new(Vec::new()),
                stop_time: Mutex::new(None),
                behavior: self.behavior,
                behavior_any: self.behavior_any,
            }),
        }
    }
}

impl Skill {
    /// Starts building a skill around `behavior`.
    pub fn builder<B: SkillBehavior>(name: impl Into<String>, behavior: B) -> SkillBuilder {
        let behavior = Arc::new(behavior);
        SkillBuilder {
            name: name.into(),
            behavior: behavior.clone(),
            behavior_any: behavior,
            options: SkillOptions::default(),
            settings: None,
            dialog: None,
            presentation: None,
            fallbacks: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The id assigned at load time, if any.
    pub fn skill_id(&self) -> Option<&str> {
        self.inner.skill_id.get().map(String::as_str)
    }

    pub fn state(&self) -> SkillState {
        *self.inner.state.lock()
    }

    pub fn options(&self) -> &SkillOptions {
        &self.inner.options
    }

    pub fn lang(&self) -> &str {
        &self.inner.options.lang
    }

    /// Directory example and entity files are resolved against.
    pub fn vocab_dir(&self) -> PathBuf {
        self.inner.options.base_dir.join("vocab").join(&self.inner.options.lang)
    }

    pub fn settings(&self) -> &Arc<dyn SettingsStore> {
        &self.inner.settings
    }

    pub fn file_system(&self) -> &FileSystemAccess {
        &self.inner.file_system
    }

    /// The bound bus, if any.
    pub fn bus(&self) -> Option<BoxedBus> {
        self.inner.bus.read().clone()
    }

    /// The shared fallback registry, if one was injected.
    pub fn fallback_registry(&self) -> Option<&Arc<FallbackRegistry>> {
        self.inner.fallbacks.as_ref()
    }

    /// Returns the concrete behavior if it is a `B`.
    pub fn behavior<B: SkillBehavior>(&self) -> Option<Arc<B>> {
        Arc::clone(&self.inner.behavior_any).downcast::<B>().ok()
    }

    pub fn downgrade(&self) -> WeakSkill {
        WeakSkill(Arc::downgrade(&self.inner))
    }

    /// Snapshot of the live event bindings.
    pub fn bindings(&self) -> Vec<EventBinding> {
        self.inner.binder.bindings()
    }

    /// Number of fallback handlers this instance registered.
    pub fn fallback_count(&self) -> usize {
        self.inner.instance_fallbacks.lock().len()
    }

    pub(crate) fn is_dispatchable(&self) -> bool {
        matches!(
            self.state(),
            SkillState::Bound | SkillState::Initialized | SkillState::Active
        )
    }

    pub(crate) fn require_bus(&self) -> LifecycleResult<BoxedBus> {
        self.bus()
            .ok_or_else(|| LifecycleError::NotBound(self.inner.name.clone()))
    }

    /// Like [`require_bus`](Self::require_bus), but refuses a shut-down skill.
    pub(crate) fn require_live_bus(&self, action: &'static str) -> LifecycleResult<BoxedBus> {
        let state = self.state();
        if state == SkillState::ShutDown {
            return Err(self.invalid(action, state));
        }
        self.require_bus()
    }

    /// Prefixes `local` with the skill id: `"{skill_id}:{local}"`.
    pub fn namespaced(&self, local: &str) -> RegistrationResult<String> {
        let id = self
            .skill_id()
            .ok_or_else(|| RegistrationError::MissingSkillId(self.inner.name.clone()))?;
        Ok(format!("{id}:{local}"))
    }

    fn invalid(&self, action: &'static str, state: SkillState) -> LifecycleError {
        LifecycleError::InvalidTransition {
            skill: self.inner.name.clone(),
            action,
            state,
        }
    }

    fn transition(
        &self,
        action: &'static str,
        from: &[SkillState],
        to: SkillState,
    ) -> LifecycleResult<()> {
        let mut state = self.inner.state.lock();
        if !from.contains(&*state) {
            return Err(self.invalid(action, *state));
        }
        *state = to;
        Ok(())
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────────

    /// Attaches the skill to a bus and registers the stop handler.
    pub fn bind(&self, bus: BoxedBus) -> LifecycleResult<()> {
        {
            let mut state = self.inner.state.lock();
            if *state != SkillState::Unbound {
                return Err(self.invalid("bind", *state));
            }
            *self.inner.bus.write() = Some(Arc::clone(&bus));
            self.inner
                .presentation
                .write()
                .get_or_insert_with(|| Arc::new(Enclosure::new(Arc::clone(&bus))));
            *self.inner.stop_time.lock() = Some(Instant::now());
            *state = SkillState::Bound;
        }

        self.bind_event(
            topic::STOP,
            named("handle_stop", |skill: Skill| async move {
                skill.handle_stop().await;
            }),
            false,
        )
        .map_err(|e| LifecycleError::SetupFailed {
            skill: self.inner.name.clone(),
            reason: e.to_string(),
        })?;
        debug!(skill = %self.inner.name, "Skill bound to bus");
        Ok(())
    }

    /// Assigns the skill id. Ids are immutable once set.
    pub fn assign_id(&self, id: impl Into<String>) -> LifecycleResult<()> {
        self.inner.skill_id.set(id.into()).map_err(|_| {
            LifecycleError::IdAlreadyAssigned {
                skill: self.inner.name.clone(),
                id: self.skill_id().unwrap_or_default().to_string(),
            }
        })
    }

    /// Runs the setup routine, then binds every declared handler.
    pub async fn initialize(&self) -> RegistrationResult<()> {
        let state = self.state();
        if state != SkillState::Bound {
            return Err(self.invalid("initialize", state).into());
        }
        if self.skill_id().is_none() {
            return Err(RegistrationError::MissingSkillId(self.inner.name.clone()));
        }

        let behavior = Arc::clone(&self.inner.behavior);
        let setup = AssertUnwindSafe(behavior.initialize(self)).catch_unwind().await;
        let failure = match setup {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(payload) => Some(format!("panicked: {}", panic_message(payload.as_ref()))),
        };
        if let Some(reason) = failure {
            return Err(LifecycleError::SetupFailed {
                skill: self.inner.name.clone(),
                reason,
            }
            .into());
        }

        let mut declarations = Declarations::default();
        behavior.declare(&mut declarations);
        let declared = declarations.len();
        for entry in declarations.entries {
            match entry {
                Declared::Intent { source, handler } => {
                    self.register_intent_with(source.resolve()?, Some(handler), true)
                        .await?;
                }
                Declared::IntentFile { file, handler } => {
                    self.register_intent_file_with(&file, handler, true).await?;
                }
            }
        }

        self.transition("initialize", &[SkillState::Bound], SkillState::Initialized)?;
        info!(
            skill = %self.inner.name,
            id = self.skill_id().unwrap_or_default(),
            declared,
            "Skill initialized"
        );
        Ok(())
    }

    /// Marks an initialized skill live.
    pub fn activate(&self) -> LifecycleResult<()> {
        self.transition("activate", &[SkillState::Initialized], SkillState::Active)
    }

    /// Tears the skill down.
    ///
    /// Persists settings, removes every event binding and fallback handler
    /// owned by this instance, publishes `detach_skill` and runs the stop
    /// routine. Calling it again is a logged no-op.
    pub async fn shutdown(&self) -> LifecycleResult<()> {
        let previous = {
            let mut state = self.inner.state.lock();
            let previous = *state;
            match previous {
                SkillState::Unbound => return Err(self.invalid("shut down", previous)),
                SkillState::ShutDown => {}
                _ => *state = SkillState::ShutDown,
            }
            previous
        };
        if previous == SkillState::ShutDown {
            warn!(skill = %self.inner.name, "Skill already shut down");
            return Ok(());
        }

        self.persist_settings().await;

        let bus = self.bus();
        if let Some(bus) = &bus {
            let removed = self.inner.binder.remove_all(bus.as_ref());
            debug!(skill = %self.inner.name, removed, "Removed event bindings");
        }
        self.remove_instance_fallbacks();

        if let (Some(bus), Some(id)) = (&bus, self.skill_id()) {
            let detach = Message::new(topic::DETACH_SKILL, json!({ "skill_id": format!("{id}:") }));
            emit_logged(bus.as_ref(), detach).await;
        }

        self.run_stop_routine().await;
        info!(skill = %self.inner.name, "Skill shut down");
        Ok(())
    }

    async fn handle_stop(&self) {
        *self.inner.stop_time.lock() = Some(Instant::now());
        self.run_stop_routine().await;
    }

    async fn run_stop_routine(&self) {
        let behavior = Arc::clone(&self.inner.behavior);
        match AssertUnwindSafe(behavior.stop(self)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(skill = %self.inner.name, error = %e, "Failed to stop skill"),
            Err(payload) => error!(
                skill = %self.inner.name,
                error = %panic_message(payload.as_ref()),
                "Stop routine panicked"
            ),
        }
    }

    /// Returns `true` if a stop was requested less than `stop_threshold` ago.
    pub fn is_stop(&self) -> bool {
        self.inner
            .stop_time
            .lock()
            .is_some_and(|t| t.elapsed() < self.inner.options.stop_threshold)
    }

    // ─── Events ──────────────────────────────────────────────────────────────

    /// Binds `handler` to `event_name`.
    ///
    /// `requires_owner` selects the argument lists offered to variadic
    /// handlers; the other shapes are resolved from the handler's type.
    pub fn bind_event<H, M>(
        &self,
        event_name: &str,
        handler: H,
        requires_owner: bool,
    ) -> RegistrationResult<EventBinding>
    where
        H: IntoEventHandler<M>,
    {
        self.bind_adapted(event_name, AdaptedHandler::new(handler), requires_owner)
    }

    pub(crate) fn bind_adapted(
        &self,
        event_name: &str,
        handler: AdaptedHandler,
        requires_owner: bool,
    ) -> RegistrationResult<EventBinding> {
        let bus = self.require_live_bus("bind events")?;
        Ok(self.inner.binder.bind(
            bus.as_ref(),
            self.downgrade(),
            &self.inner.name,
            event_name,
            handler,
            requires_owner,
            self.inner.options.handler_timeout,
        ))
    }

    /// Removes every binding for `event_name`. Returns `true` if any existed.
    pub fn remove_event(&self, event_name: &str) -> bool {
        match self.bus() {
            Some(bus) => self.inner.binder.remove(bus.as_ref(), event_name),
            None => false,
        }
    }

    pub(crate) async fn persist_settings(&self) {
        let _guard = self.inner.settings_lock.lock().await;
        match self.inner.settings.store().await {
            Ok(true) => debug!(skill = %self.inner.name, "Settings persisted"),
            Ok(false) => {}
            Err(e) => error!(skill = %self.inner.name, error = %e, "Failed to persist settings"),
        }
    }

    // ─── Fallbacks ───────────────────────────────────────────────────────────

    /// Registers a fallback handler in the shared registry.
    ///
    /// Returns the assigned priority, which may be higher than `priority`
    /// if that slot was taken.
    pub fn register_fallback(
        &self,
        handler: FallbackHandler,
        priority: i32,
    ) -> RegistrationResult<i32> {
        let registry = self
            .inner
            .fallbacks
            .as_ref()
            .ok_or_else(|| RegistrationError::NoFallbackRegistry(self.inner.name.clone()))?;
        // Held across the state check; shutdown sets the state before draining.
        let mut instance = self.inner.instance_fallbacks.lock();
        let state = self.state();
        if state == SkillState::ShutDown {
            return Err(self.invalid("register fallbacks", state).into());
        }
        let assigned = registry.register(handler.clone(), priority);
        instance.push(handler);
        Ok(assigned)
    }

    /// Removes one registration of a fallback handler this skill registered.
    pub fn remove_fallback(&self, handler: &FallbackHandler) -> bool {
        let mut instance = self.inner.instance_fallbacks.lock();
        if let Some(idx) = instance.iter().position(|h| h.same_as(handler)) {
            instance.remove(idx);
        }
        self.inner
            .fallbacks
            .as_ref()
            .is_some_and(|registry| registry.remove(handler))
    }

    fn remove_instance_fallbacks(&self) {
        let handlers = std::mem::take(&mut *self.inner.instance_fallbacks.lock());
        if let Some(registry) = &self.inner.fallbacks {
            for handler in &handlers {
                registry.remove(handler);
            }
        }
    }

    // ─── Output ──────────────────────────────────────────────────────────────

    /// Speaks `utterance`.
    pub async fn speak(&self, utterance: impl Into<String>, expect_response: bool) -> BusResult<()> {
        let Some(bus) = self.bus() else {
            warn!(skill = %self.inner.name, "Cannot speak, skill is not bound");
            return Ok(());
        };
        let presentation = self.inner.presentation.read().clone();
        if let Some(presentation) = presentation {
            presentation.register(&self.inner.name).await;
        }
        let data = json!({
            "utterance": utterance.into(),
            "expect_response": expect_response,
        });
        bus.emit(Message::new(topic::SPEAK, data)).await
    }

    /// Renders a dialog through the dialog renderer and speaks it.
    pub async fn speak_dialog(
        &self,
        key: &str,
        data: &Value,
        expect_response: bool,
    ) -> BusResult<()> {
        let Some(renderer) = &self.inner.dialog else {
            warn!(skill = %self.inner.name, key, "No dialog renderer, cannot speak dialog");
            return Ok(());
        };
        let text = renderer.render(key, data);
        self.speak(text, expect_response).await
    }

    /// Moves this skill to the front of the active-skill list.
    pub async fn make_active(&self) -> RegistrationResult<()> {
        let bus = self.require_bus()?;
        let id = self
            .skill_id()
            .ok_or_else(|| RegistrationError::MissingSkillId(self.inner.name.clone()))?;
        bus.emit(Message::new(
            topic::ACTIVE_SKILL_REQUEST,
            json!({ "skill_id": id }),
        ))
        .await?;
        Ok(())
    }

    /// Offers utterances to the skill's converse routine.
    pub async fn converse(&self, utterances: &[String], lang: &str) -> bool {
        let behavior = Arc::clone(&self.inner.behavior);
        behavior.converse(self, utterances, lang).await
    }
}

impl fmt::Debug for Skill {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Skill")
            .field("name", &self.inner.name)
            .field("skill_id", &self.skill_id())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
