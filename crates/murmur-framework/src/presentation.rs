//! Presentation and dialog collaborators.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::warn;

use murmur_core::{BoxedBus, Message, topic};

/// Renders dialog templates into text.
pub trait DialogRenderer: Send + Sync + 'static {
    /// Renders the template named `key` with `data`.
    fn render(&self, key: &str, data: &Value) -> String;
}

/// The display/LED layer of the device.
#[async_trait]
pub trait Presentation: Send + Sync + 'static {
    /// Marks `skill_name` as the active skill.
    async fn register(&self, skill_name: &str);
}

/// Bus-backed [`Presentation`]; publishes `enclosure.active_skill`.
#[derive(Clone)]
pub struct Enclosure {
    bus: BoxedBus,
}

impl Enclosure {
    pub fn new(bus: BoxedBus) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl Presentation for Enclosure {
    async fn register(&self, skill_name: &str) {
        let msg = Message::new(
            topic::ENCLOSURE_ACTIVE_SKILL,
            json!({ "skill_id": skill_name }),
        );
        if let Err(e) = self.bus.emit(msg).await {
            warn!(skill = skill_name, error = %e, "Failed to register active skill");
        }
    }
}

impl std::fmt::Debug for Enclosure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Enclosure").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use murmur_core::LocalBus;

    #[tokio::test]
    async fn test_enclosure_publishes_active_skill() {
        let bus = Arc::new(LocalBus::with_history());
        let enclosure = Enclosure::new(bus.clone());
        enclosure.register("weather").await;

        let msgs = bus.emitted(topic::ENCLOSURE_ACTIVE_SKILL);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].get_str("skill_id"), Some("weather"));
    }
}
