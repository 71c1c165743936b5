//! Skill loading and teardown.
//!
//! [`SkillManager`] owns everything skills share on one host: the bus
//! handle, the process-wide [`FallbackRegistry`] and the list of loaded
//! skills. It drives each skill through bind, id assignment, initialize and
//! activate, and tears them down in reverse load order.
//!
//! ```text
//! load_skill() ──► bind ──► assign_id ──► initialize ──► activate ──► loaded
//!                                  │ error
//!                                  └──► shutdown (partial) ──► RuntimeError::Load
//! start()         ──► intent_failure ─► fallback dispatcher
//! shutdown_all()  ──► shutdown skills, newest first
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex as AsyncMutex, RwLock as AsyncRwLock};
use tracing::{debug, error, info, warn};

use crate::config::MurmurConfig;
use crate::error::{RuntimeError, RuntimeResult};
use murmur_core::{BoxedBus, SubscriptionId, topic};
use murmur_framework::{FallbackRegistry, JsonSettings, Skill, SkillBehavior, SkillBuilder};

/// Loads skills onto one bus and owns their shared state.
pub struct SkillManager {
    bus: BoxedBus,
    config: MurmurConfig,
    fallbacks: Arc<FallbackRegistry>,
    skills: AsyncRwLock<Vec<Skill>>,
    next_id: AtomicU64,
    dispatcher: AsyncMutex<Option<SubscriptionId>>,
}

impl SkillManager {
    pub fn new(bus: BoxedBus, config: MurmurConfig) -> Self {
        let fallbacks = Arc::new(FallbackRegistry::with_timeout(
            config.skills.handler_timeout(),
        ));
        Self {
            bus,
            config,
            fallbacks,
            skills: AsyncRwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            dispatcher: AsyncMutex::new(None),
        }
    }

    pub fn bus(&self) -> &BoxedBus {
        &self.bus
    }

    pub fn config(&self) -> &MurmurConfig {
        &self.config
    }

    /// The registry shared by every skill this manager loads.
    pub fn fallbacks(&self) -> &Arc<FallbackRegistry> {
        &self.fallbacks
    }

    /// Loads `behavior` as the skill `name`.
    pub async fn load_skill<B: SkillBehavior>(&self, name: &str, behavior: B) -> RuntimeResult<Skill> {
        self.load_skill_with(name, behavior, |builder| builder).await
    }

    /// Loads `behavior` as the skill `name`, letting `configure` adjust the
    /// builder (dialog renderer, presentation, settings) before it is built.
    ///
    /// Options, the settings store and the fallback registry are preset from
    /// the host configuration.
    pub async fn load_skill_with<B, F>(
        &self,
        name: &str,
        behavior: B,
        configure: F,
    ) -> RuntimeResult<Skill>
    where
        B: SkillBehavior,
        F: FnOnce(SkillBuilder) -> SkillBuilder,
    {
        if self.config.skills.is_blacklisted(name) {
            warn!(skill = name, "Skill is blacklisted, not loading");
            return Err(RuntimeError::Blacklisted(name.to_string()));
        }
        if self.skill(name).await.is_some() {
            return Err(RuntimeError::AlreadyLoaded(name.to_string()));
        }

        let options = self.config.skill_options(name);
        let settings_path = options.base_dir.join("settings.json");
        let settings = match JsonSettings::load(&settings_path).await {
            Ok(settings) => settings,
            Err(e) => {
                warn!(
                    skill = name,
                    path = %settings_path.display(),
                    error = %e,
                    "Failed to load settings, starting empty"
                );
                JsonSettings::new(&settings_path)
            }
        };

        let builder = Skill::builder(name, behavior)
            .options(options)
            .settings(Arc::new(settings))
            .fallback_registry(Arc::clone(&self.fallbacks));
        let skill = configure(builder).build();

        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        if let Err(e) = self.bring_up(&skill, &id).await {
            error!(skill = name, skill_id = %id, error = %e, "Failed to load skill");
            if skill.bus().is_some()
                && let Err(e) = skill.shutdown().await
            {
                debug!(skill = name, error = %e, "Cleanup after failed load");
            }
            return Err(e);
        }

        let mut skills = self.skills.write().await;
        if skills.iter().any(|s| s.name() == name) {
            drop(skills);
            // Lost a race with a concurrent load of the same name.
            if let Err(e) = skill.shutdown().await {
                warn!(skill = name, skill_id = %id, error = %e, "Cleanup after duplicate load");
            }
            return Err(RuntimeError::AlreadyLoaded(name.to_string()));
        }
        skills.push(skill.clone());
        info!(skill = name, skill_id = %id, "Skill loaded");
        Ok(skill)
    }

    async fn bring_up(&self, skill: &Skill, id: &str) -> RuntimeResult<()> {
        let name = skill.name();
        skill
            .bind(Arc::clone(&self.bus))
            .map_err(|e| RuntimeError::load(name, e))?;
        skill
            .assign_id(id)
            .map_err(|e| RuntimeError::load(name, e))?;
        skill
            .initialize()
            .await
            .map_err(|e| RuntimeError::load(name, e))?;
        skill.activate().map_err(|e| RuntimeError::load(name, e))?;
        Ok(())
    }

    /// Shuts down and forgets the skill `name`.
    pub async fn unload_skill(&self, name: &str) -> RuntimeResult<()> {
        let skill = {
            let mut skills = self.skills.write().await;
            let pos = skills
                .iter()
                .position(|s| s.name() == name)
                .ok_or_else(|| RuntimeError::SkillNotFound(name.to_string()))?;
            skills.remove(pos)
        };
        skill.shutdown().await?;
        info!(skill = name, "Skill unloaded");
        Ok(())
    }

    pub async fn skill(&self, name: &str) -> Option<Skill> {
        self.skills
            .read()
            .await
            .iter()
            .find(|s| s.name() == name)
            .cloned()
    }

    /// Names of loaded skills, in load order.
    pub async fn skill_names(&self) -> Vec<String> {
        self.skills
            .read()
            .await
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    pub async fn skill_count(&self) -> usize {
        self.skills.read().await.len()
    }

    /// Subscribes the fallback dispatcher to `intent_failure`.
    pub async fn start(&self) {
        let mut dispatcher = self.dispatcher.lock().await;
        if dispatcher.is_some() {
            warn!("Fallback dispatcher already subscribed");
            return;
        }
        let handler = self.fallbacks.build_dispatcher(&self.bus);
        *dispatcher = Some(self.bus.on(topic::INTENT_FAILURE, handler));
        debug!("Fallback dispatcher subscribed");
    }

    /// Shuts every skill down, newest first, and unsubscribes the dispatcher.
    ///
    /// Individual shutdown failures are logged; the remaining skills are
    /// still shut down.
    pub async fn shutdown_all(&self) {
        if let Some(id) = self.dispatcher.lock().await.take() {
            self.bus.remove(topic::INTENT_FAILURE, id);
        }

        let skills = std::mem::take(&mut *self.skills.write().await);
        for skill in skills.into_iter().rev() {
            if let Err(e) = skill.shutdown().await {
                error!(skill = %skill.name(), error = %e, "Error during skill shutdown");
            }
        }

        if !self.fallbacks.is_empty() {
            warn!(
                remaining = self.fallbacks.len(),
                "Fallback handlers left after shutdown"
            );
        }
    }
}

impl std::fmt::Debug for SkillManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkillManager")
            .field("fallbacks", &self.fallbacks)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use murmur_core::{LocalBus, Message, MessageBus};
    use murmur_framework::{BoxError, FallbackHandler, SkillState};
    use serde_json::json;

    use super::*;

    struct Quiet;

    #[async_trait]
    impl SkillBehavior for Quiet {}

    struct Broken;

    #[async_trait]
    impl SkillBehavior for Broken {
        async fn initialize(&self, _skill: &Skill) -> Result<(), BoxError> {
            Err("no network".into())
        }
    }

    struct Catcher {
        hits: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SkillBehavior for Catcher {
        async fn initialize(&self, skill: &Skill) -> Result<(), BoxError> {
            let hits = Arc::clone(&self.hits);
            let handler = FallbackHandler::named("catch_all", move |_msg: Message| {
                let hits = Arc::clone(&hits);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    true
                }
            });
            skill.register_fallback(handler, 50)?;
            Ok(())
        }
    }

    struct Recorder {
        log: Arc<std::sync::Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl SkillBehavior for Recorder {
        async fn stop(&self, skill: &Skill) -> Result<(), BoxError> {
            self.log.lock().unwrap().push(skill.name().to_string());
            Ok(())
        }
    }

    fn manager(dir: &tempfile::TempDir) -> (Arc<LocalBus>, SkillManager) {
        let bus = Arc::new(LocalBus::with_history());
        let mut config = MurmurConfig::default();
        config.skills.skills_dir = dir.path().join("skills");
        config.skills.data_dir = dir.path().join("data");
        config.skills.blacklist = vec!["jokes".to_string()];
        (bus.clone(), SkillManager::new(bus, config))
    }

    #[tokio::test]
    async fn test_load_assigns_sequential_ids() {
        let dir = tempfile::tempdir().unwrap();
        let (_bus, manager) = manager(&dir);

        let weather = manager.load_skill("weather", Quiet).await.unwrap();
        let timer = manager.load_skill("timer", Quiet).await.unwrap();

        assert_eq!(weather.skill_id(), Some("1"));
        assert_eq!(timer.skill_id(), Some("2"));
        assert_eq!(weather.state(), SkillState::Active);
        assert_eq!(manager.skill_names().await, vec!["weather", "timer"]);
    }

    #[tokio::test]
    async fn test_blacklisted_skill_is_not_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let (bus, manager) = manager(&dir);

        let result = manager.load_skill("jokes", Quiet).await;
        assert!(matches!(result, Err(RuntimeError::Blacklisted(name)) if name == "jokes"));
        assert_eq!(manager.skill_count().await, 0);
        assert_eq!(bus.subscriber_count(topic::STOP), 0);
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (_bus, manager) = manager(&dir);

        manager.load_skill("weather", Quiet).await.unwrap();
        let result = manager.load_skill("weather", Quiet).await;
        assert!(matches!(result, Err(RuntimeError::AlreadyLoaded(_))));
        assert_eq!(manager.skill_count().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_duplicate_load_leaves_one_skill() {
        let dir = tempfile::tempdir().unwrap();
        let (bus, manager) = manager(&dir);

        let (a, b) = tokio::join!(
            manager.load_skill("weather", Quiet),
            manager.load_skill("weather", Quiet),
        );
        let results = [a, b];
        let loaded = results.iter().filter(|r| r.is_ok()).count();
        let rejected = results
            .iter()
            .filter(|r| matches!(r, Err(RuntimeError::AlreadyLoaded(_))))
            .count();
        assert_eq!((loaded, rejected), (1, 1));
        assert_eq!(manager.skill_count().await, 1);
        assert_eq!(bus.subscriber_count(topic::STOP), 1);
    }

    #[tokio::test]
    async fn test_failed_initialize_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let (bus, manager) = manager(&dir);

        let result = manager.load_skill("broken", Broken).await;
        assert!(matches!(result, Err(RuntimeError::Load { ref skill, .. }) if skill == "broken"));
        assert_eq!(manager.skill_count().await, 0);
        assert_eq!(bus.subscriber_count(topic::STOP), 0);
    }

    #[tokio::test]
    async fn test_intent_failure_reaches_fallbacks_until_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let (bus, manager) = manager(&dir);
        let hits = Arc::new(AtomicUsize::new(0));

        manager
            .load_skill("catcher", Catcher { hits: Arc::clone(&hits) })
            .await
            .unwrap();
        manager.start().await;
        manager.start().await;
        assert_eq!(bus.subscriber_count(topic::INTENT_FAILURE), 1);

        bus.emit(Message::new(topic::INTENT_FAILURE, json!({"utterance": "hm"})))
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let complete = bus.emitted(topic::HANDLER_COMPLETE);
        assert_eq!(complete[0].get_str("fallback_handler"), Some("catch_all"));

        manager.shutdown_all().await;
        assert!(manager.fallbacks().is_empty());
        assert_eq!(bus.subscriber_count(topic::INTENT_FAILURE), 0);
        assert_eq!(manager.skill_count().await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_runs_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let (bus, manager) = manager(&dir);
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));

        for name in ["first", "second", "third"] {
            manager
                .load_skill(name, Recorder { log: Arc::clone(&log) })
                .await
                .unwrap();
        }
        manager.shutdown_all().await;

        assert_eq!(*log.lock().unwrap(), vec!["third", "second", "first"]);
        let detached: Vec<_> = bus
            .emitted(topic::DETACH_SKILL)
            .iter()
            .filter_map(|m| m.get_str("skill_id").map(str::to_string))
            .collect();
        assert_eq!(detached, vec!["3:", "2:", "1:"]);
    }

    #[tokio::test]
    async fn test_unload_skill() {
        let dir = tempfile::tempdir().unwrap();
        let (_bus, manager) = manager(&dir);

        let skill = manager.load_skill("weather", Quiet).await.unwrap();
        manager.unload_skill("weather").await.unwrap();
        assert_eq!(skill.state(), SkillState::ShutDown);
        assert!(matches!(
            manager.unload_skill("weather").await,
            Err(RuntimeError::SkillNotFound(_))
        ));
    }
}
