//! Top-level host: configuration, logging and the skill manager.

use std::future::Future;
use std::sync::Arc;

use tokio::signal;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::{ConfigLoader, MurmurConfig};
use crate::error::{RuntimeError, RuntimeResult};
use crate::logging;
use crate::manager::SkillManager;
use murmur_core::BoxedBus;
use murmur_framework::{Skill, SkillBehavior};

/// The Murmur skill host.
///
/// # Example
///
/// ```rust,ignore
/// let bus: BoxedBus = Arc::new(LocalBus::new());
/// let runtime = MurmurRuntime::new(bus);
/// runtime.load_skill("weather", Weather).await?;
/// runtime.run().await?;
/// ```
pub struct MurmurRuntime {
    manager: Arc<SkillManager>,
    running: RwLock<bool>,
}

impl MurmurRuntime {
    /// Loads configuration from the default locations and initializes
    /// logging. Falls back to defaults if configuration cannot be loaded.
    pub fn new(bus: BoxedBus) -> Self {
        let config = match ConfigLoader::new().load() {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Failed to load configuration, using defaults: {e}");
                MurmurConfig::default()
            }
        };
        Self::from_config(bus, config)
    }

    /// Creates a runtime from `config` and initializes logging from it.
    pub fn from_config(bus: BoxedBus, config: MurmurConfig) -> Self {
        logging::init_from_config(&config.logging);
        Self {
            manager: Arc::new(SkillManager::new(bus, config)),
            running: RwLock::new(false),
        }
    }

    pub fn config(&self) -> &MurmurConfig {
        self.manager.config()
    }

    pub fn manager(&self) -> &Arc<SkillManager> {
        &self.manager
    }

    /// Loads a skill. See [`SkillManager::load_skill`].
    pub async fn load_skill<B: SkillBehavior>(&self, name: &str, behavior: B) -> RuntimeResult<Skill> {
        self.manager.load_skill(name, behavior).await
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Starts fallback dispatch.
    pub async fn start(&self) -> RuntimeResult<()> {
        {
            let mut running = self.running.write().await;
            if *running {
                warn!("Runtime is already running");
                return Ok(());
            }
            *running = true;
        }

        self.manager.start().await;
        info!(
            skills = self.manager.skill_count().await,
            "Murmur runtime started"
        );
        Ok(())
    }

    /// Shuts every skill down.
    pub async fn stop(&self) -> RuntimeResult<()> {
        {
            let mut running = self.running.write().await;
            if !*running {
                warn!("Runtime is not running");
                return Ok(());
            }
            *running = false;
        }

        info!("Stopping Murmur runtime");
        self.manager.shutdown_all().await;
        info!("Runtime stopped");
        Ok(())
    }

    /// Runs until Ctrl+C or SIGTERM.
    pub async fn run(&self) -> RuntimeResult<()> {
        self.start().await?;
        info!("Murmur runtime is now running. Press Ctrl+C to stop.");

        let signalled = wait_for_shutdown().await;
        self.stop().await?;
        signalled
    }

    /// Runs until `shutdown` completes.
    pub async fn run_until<F>(&self, shutdown: F) -> RuntimeResult<()>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        shutdown.await;
        self.stop().await
    }
}

async fn wait_for_shutdown() -> RuntimeResult<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .map_err(RuntimeError::Signal)?;

        tokio::select! {
            result = signal::ctrl_c() => {
                result.map_err(RuntimeError::Signal)?;
                info!("Received Ctrl+C, shutting down");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.map_err(RuntimeError::Signal)?;
        info!("Received Ctrl+C, shutting down");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use murmur_core::{LocalBus, topic};
    use murmur_framework::SkillState;

    use super::*;

    struct Quiet;

    #[async_trait]
    impl SkillBehavior for Quiet {}

    fn runtime(dir: &tempfile::TempDir, bus: &Arc<LocalBus>) -> MurmurRuntime {
        let mut config = MurmurConfig::default();
        config.skills.skills_dir = dir.path().join("skills");
        config.skills.data_dir = dir.path().join("data");
        MurmurRuntime::from_config(bus.clone(), config)
    }

    #[tokio::test]
    async fn test_run_until_shuts_skills_down() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(LocalBus::with_history());
        let runtime = runtime(&dir, &bus);

        let skill = runtime.load_skill("weather", Quiet).await.unwrap();
        runtime.run_until(async {}).await.unwrap();

        assert!(!runtime.is_running().await);
        assert_eq!(skill.state(), SkillState::ShutDown);
        assert_eq!(bus.subscriber_count(topic::INTENT_FAILURE), 0);
        assert_eq!(bus.emitted(topic::DETACH_SKILL).len(), 1);
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(LocalBus::new());
        let runtime = runtime(&dir, &bus);

        runtime.start().await.unwrap();
        runtime.start().await.unwrap();
        assert!(runtime.is_running().await);
        assert_eq!(bus.subscriber_count(topic::INTENT_FAILURE), 1);

        runtime.stop().await.unwrap();
        runtime.stop().await.unwrap();
        assert!(!runtime.is_running().await);
    }
}
