//! Intent registration.
//!
//! Everything a skill registers with the intent service is namespaced with
//! the skill id (`"{skill_id}:{name}"`), so skills sharing one bus never
//! collide. The registry records structured intents by their local name so
//! they can be re-enabled later.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, error};

use crate::error::{RegistrationError, RegistrationResult};
use crate::handler::{AdaptedHandler, IntoEventHandler};
use crate::skill::Skill;
use murmur_core::{Message, topic};

/// A structured intent: keyword sets an external matcher routes on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    pub name: String,
    /// `(entity, attribute)` pairs that must all be present.
    #[serde(default)]
    pub requires: Vec<(String, String)>,
    /// Groups of entities of which at least one must be present.
    #[serde(default)]
    pub at_least_one: Vec<Vec<String>>,
    /// `(entity, attribute)` pairs that may be present.
    #[serde(default)]
    pub optional: Vec<(String, String)>,
}

impl Intent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            requires: Vec::new(),
            at_least_one: Vec::new(),
            optional: Vec::new(),
        }
    }
}

/// Fluent builder for [`Intent`].
///
/// ```rust,ignore
/// let intent = IntentBuilder::new("weather")
///     .require("WeatherKeyword")
///     .optionally("Location")
///     .one_of(["Today", "Tomorrow"])
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct IntentBuilder {
    intent: Intent,
}

impl IntentBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            intent: Intent::new(name),
        }
    }

    /// Requires `entity`, reported under its own name.
    pub fn require(self, entity: impl Into<String>) -> Self {
        let entity = entity.into();
        self.require_as(entity.clone(), entity)
    }

    /// Requires `entity`, reported under `attribute`.
    pub fn require_as(mut self, entity: impl Into<String>, attribute: impl Into<String>) -> Self {
        self.intent.requires.push((entity.into(), attribute.into()));
        self
    }

    pub fn optionally(self, entity: impl Into<String>) -> Self {
        let entity = entity.into();
        self.optionally_as(entity.clone(), entity)
    }

    pub fn optionally_as(mut self, entity: impl Into<String>, attribute: impl Into<String>) -> Self {
        self.intent.optional.push((entity.into(), attribute.into()));
        self
    }

    /// Requires at least one of `entities`.
    pub fn one_of<I, S>(mut self, entities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.intent
            .at_least_one
            .push(entities.into_iter().map(Into::into).collect());
        self
    }

    pub fn build(self) -> Intent {
        self.intent
    }
}

/// Any accepted form of intent description.
#[derive(Debug, Clone)]
pub enum IntentSource {
    Built(Intent),
    Builder(IntentBuilder),
    /// Raw `{"name", "requires", "optional", "at_least_one"}` envelope.
    Envelope(Value),
}

impl IntentSource {
    /// Resolves the description into an [`Intent`].
    pub fn resolve(self) -> RegistrationResult<Intent> {
        let intent = match self {
            Self::Built(intent) => intent,
            Self::Builder(builder) => builder.build(),
            Self::Envelope(value) => {
                if !value.is_object() {
                    return Err(RegistrationError::InvalidDescriptor(format!(
                        "expected an object, got {value}"
                    )));
                }
                serde_json::from_value(value)
                    .map_err(|e| RegistrationError::InvalidDescriptor(e.to_string()))?
            }
        };
        if intent.name.is_empty() {
            return Err(RegistrationError::InvalidDescriptor(
                "intent name is empty".to_string(),
            ));
        }
        Ok(intent)
    }
}

impl From<Intent> for IntentSource {
    fn from(intent: Intent) -> Self {
        Self::Built(intent)
    }
}

impl From<IntentBuilder> for IntentSource {
    fn from(builder: IntentBuilder) -> Self {
        Self::Builder(builder)
    }
}

impl From<Value> for IntentSource {
    fn from(value: Value) -> Self {
        Self::Envelope(value)
    }
}

// ============================================================================
// Skill registration API
// ============================================================================

impl Skill {
    /// Registers a structured intent and binds `handler` to it.
    pub async fn register_intent<H, M>(
        &self,
        intent: impl Into<IntentSource>,
        handler: H,
    ) -> RegistrationResult<String>
    where
        H: IntoEventHandler<M>,
    {
        let intent = intent.into().resolve()?;
        self.register_intent_with(intent, Some(AdaptedHandler::new(handler)), false)
            .await
    }

    /// Publishes the intent, records it and binds the handler if one is given.
    /// Returns the namespaced name.
    pub(crate) async fn register_intent_with(
        &self,
        intent: Intent,
        handler: Option<AdaptedHandler>,
        requires_owner: bool,
    ) -> RegistrationResult<String> {
        let bus = self.require_live_bus("register intents")?;
        let namespaced = self.namespaced(&intent.name)?;

        let mut wire = intent.clone();
        wire.name = namespaced.clone();
        let payload = serde_json::to_value(&wire)
            .map_err(|e| RegistrationError::InvalidDescriptor(e.to_string()))?;
        bus.emit(Message::new(topic::REGISTER_INTENT, payload)).await?;

        self.inner
            .intents
            .lock()
            .push((intent.name.clone(), intent));
        if let Some(handler) = handler {
            self.bind_adapted(&namespaced, handler, requires_owner)?;
        }
        Ok(namespaced)
    }

    /// Registers an example-file intent and binds `handler` to it.
    pub async fn register_intent_file<H, M>(
        &self,
        intent_file: &str,
        handler: H,
    ) -> RegistrationResult<String>
    where
        H: IntoEventHandler<M>,
    {
        self.register_intent_file_with(intent_file, AdaptedHandler::new(handler), false)
            .await
    }

    pub(crate) async fn register_intent_file_with(
        &self,
        intent_file: &str,
        handler: AdaptedHandler,
        requires_owner: bool,
    ) -> RegistrationResult<String> {
        let bus = self.require_live_bus("register intents")?;
        let name = self.namespaced(intent_file)?;
        let file_name = self.vocab_dir().join(intent_file);
        bus.emit(Message::new(
            topic::PADATIOUS_REGISTER_INTENT,
            json!({ "file_name": file_name.display().to_string(), "name": name }),
        ))
        .await?;
        self.bind_adapted(&name, handler, requires_owner)?;
        Ok(name)
    }

    /// Registers an entity file. The filename must contain `.entity`.
    pub async fn register_entity_file(&self, entity_file: &str) -> RegistrationResult<String> {
        if !entity_file.contains(".entity") {
            return Err(RegistrationError::InvalidEntityFile(entity_file.to_string()));
        }
        let bus = self.require_live_bus("register entities")?;
        let name = self.namespaced(&entity_file.replace(".entity", ""))?;
        let file_name = self.vocab_dir().join(entity_file);
        bus.emit(Message::new(
            topic::PADATIOUS_REGISTER_ENTITY,
            json!({ "file_name": file_name.display().to_string(), "name": name }),
        ))
        .await?;
        Ok(name)
    }

    /// Detaches an intent from the intent service.
    ///
    /// The intent stays recorded, so [`enable_intent`](Self::enable_intent)
    /// can bring it back.
    pub async fn disable_intent(&self, intent_name: &str) -> RegistrationResult<()> {
        debug!(skill = %self.name(), intent = intent_name, "Disabling intent");
        let bus = self.require_bus()?;
        let name = self.namespaced(intent_name)?;
        bus.emit(Message::new(
            topic::DETACH_INTENT,
            json!({ "intent_name": name }),
        ))
        .await?;
        Ok(())
    }

    /// Re-registers a recorded intent. Returns `false` if `intent_name` was
    /// never registered.
    ///
    /// The existing binding keeps serving the intent; no second handler is
    /// bound.
    pub async fn enable_intent(&self, intent_name: &str) -> RegistrationResult<bool> {
        self.require_live_bus("enable intents")?;
        let recorded = {
            let mut intents = self.inner.intents.lock();
            intents
                .iter()
                .position(|(name, _)| name == intent_name)
                .map(|idx| intents.remove(idx))
        };
        match recorded {
            Some((_, intent)) => {
                self.register_intent_with(intent, None, false).await?;
                debug!(skill = %self.name(), intent = intent_name, "Enabling intent");
                Ok(true)
            }
            None => {
                error!(
                    skill = %self.name(),
                    intent = intent_name,
                    "Could not enable intent, it hasn't been registered"
                );
                Ok(false)
            }
        }
    }

    /// Detaches every recorded intent.
    pub async fn detach_intents(&self) -> RegistrationResult<()> {
        let bus = self.require_bus()?;
        let names: Vec<String> = self
            .inner
            .intents
            .lock()
            .iter()
            .map(|(name, _)| name.clone())
            .collect();
        for name in names {
            let namespaced = self.namespaced(&name)?;
            bus.emit(Message::new(
                topic::DETACH_INTENT,
                json!({ "intent_name": namespaced }),
            ))
            .await?;
        }
        Ok(())
    }

    /// Local names and descriptors of every recorded intent.
    pub fn registered_intents(&self) -> Vec<(String, Intent)> {
        self.inner.intents.lock().clone()
    }

    /// Ties a word to an entity type.
    pub async fn register_vocabulary(&self, entity: &str, entity_type: &str) -> RegistrationResult<()> {
        let bus = self.require_live_bus("register vocabulary")?;
        bus.emit(Message::new(
            topic::REGISTER_VOCAB,
            json!({ "start": entity, "end": entity_type }),
        ))
        .await?;
        Ok(())
    }

    /// Ties `alias` to an entity type as a synonym of `entity`.
    pub async fn register_vocabulary_alias(
        &self,
        alias: &str,
        entity: &str,
        entity_type: &str,
    ) -> RegistrationResult<()> {
        let bus = self.require_live_bus("register vocabulary")?;
        bus.emit(Message::new(
            topic::REGISTER_VOCAB,
            json!({ "start": alias, "end": entity_type, "alias_of": entity }),
        ))
        .await?;
        Ok(())
    }

    /// Registers a regex entity extractor. The pattern must compile.
    pub async fn register_regex(&self, pattern: &str) -> RegistrationResult<()> {
        regex::Regex::new(pattern).map_err(|e| RegistrationError::InvalidRegex {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        let bus = self.require_live_bus("register vocabulary")?;
        bus.emit(Message::new(topic::REGISTER_VOCAB, json!({ "regex": pattern })))
            .await?;
        Ok(())
    }

    /// Adds a keyword to the conversational context.
    pub async fn set_context(&self, context: &str, word: &str) -> RegistrationResult<()> {
        if context.is_empty() {
            return Err(RegistrationError::InvalidContext(context.to_string()));
        }
        let bus = self.require_live_bus("set context")?;
        bus.emit(Message::new(
            topic::ADD_CONTEXT,
            json!({ "context": context, "word": word }),
        ))
        .await?;
        Ok(())
    }

    /// Removes a keyword from the conversational context.
    pub async fn remove_context(&self, context: &str) -> RegistrationResult<()> {
        if context.is_empty() {
            return Err(RegistrationError::InvalidContext(context.to_string()));
        }
        let bus = self.require_bus()?;
        bus.emit(Message::new(
            topic::REMOVE_CONTEXT,
            json!({ "context": context }),
        ))
        .await?;
        Ok(())
    }
}
