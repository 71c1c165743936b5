//! Scheduler client.
//!
//! Skills do not keep timers. They bind a handler under a namespaced event
//! name and ask the external scheduler service to publish that event later.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use crate::error::RegistrationResult;
use crate::handler::{AdaptedHandler, IntoEventHandler};
use crate::skill::Skill;
use murmur_core::{Message, topic};

impl Skill {
    /// Schedules a one-shot event at `when`.
    ///
    /// Without `name` the event is named `"{skill_name}{handler_name}"`.
    /// Returns the namespaced event name.
    pub async fn schedule_event<H, M>(
        &self,
        handler: H,
        when: DateTime<Utc>,
        data: Option<Value>,
        name: Option<&str>,
    ) -> RegistrationResult<String>
    where
        H: IntoEventHandler<M>,
    {
        self.schedule(AdaptedHandler::new(handler), when, None, data, name)
            .await
    }

    /// Schedules an event at `when` that repeats every `interval`.
    pub async fn schedule_repeating_event<H, M>(
        &self,
        handler: H,
        when: DateTime<Utc>,
        interval: Duration,
        data: Option<Value>,
        name: Option<&str>,
    ) -> RegistrationResult<String>
    where
        H: IntoEventHandler<M>,
    {
        self.schedule(AdaptedHandler::new(handler), when, Some(interval), data, name)
            .await
    }

    async fn schedule(
        &self,
        handler: AdaptedHandler,
        when: DateTime<Utc>,
        repeat: Option<Duration>,
        data: Option<Value>,
        name: Option<&str>,
    ) -> RegistrationResult<String> {
        let local = match name {
            Some(name) => name.to_string(),
            None => format!("{}{}", self.name(), handler.name()),
        };
        let event = self.namespaced(&local)?;
        let bus = self.require_bus()?;
        self.bind_adapted(&event, handler, false)?;

        let time = when.timestamp_millis() as f64 / 1000.0;
        bus.emit(Message::new(
            topic::SCHEDULE_EVENT,
            json!({
                "time": time,
                "event": event,
                "repeat": repeat.map(|d| d.as_secs_f64()),
                "data": data.unwrap_or_else(|| json!({})),
            }),
        ))
        .await?;
        Ok(event)
    }

    /// Replaces the payload of a scheduled event.
    pub async fn update_event(&self, name: &str, data: Option<Value>) -> RegistrationResult<()> {
        let bus = self.require_bus()?;
        let event = self.namespaced(name)?;
        bus.emit(Message::new(
            topic::UPDATE_EVENT,
            json!({ "event": event, "data": data.unwrap_or_else(|| json!({})) }),
        ))
        .await?;
        Ok(())
    }

    /// Cancels a scheduled event.
    pub async fn cancel_event(&self, name: &str) -> RegistrationResult<()> {
        let bus = self.require_bus()?;
        let event = self.namespaced(name)?;
        bus.emit(Message::new(topic::REMOVE_EVENT, json!({ "event": event })))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;
    use murmur_core::LocalBus;

    use super::*;
    use crate::handler::named;
    use crate::skill::SkillBehavior;

    struct Reminder;

    #[async_trait::async_trait]
    impl SkillBehavior for Reminder {}

    fn skill(bus: &Arc<LocalBus>) -> Skill {
        let skill = Skill::builder("reminder", Reminder).build();
        skill.bind(bus.clone()).unwrap();
        skill.assign_id("9").unwrap();
        skill
    }

    #[tokio::test]
    async fn test_schedule_event_binds_then_emits() {
        let bus = Arc::new(LocalBus::with_history());
        let skill = skill(&bus);
        let when = Utc.with_ymd_and_hms(2030, 1, 2, 3, 4, 5).unwrap();

        let event = skill
            .schedule_event(
                named("remind", |_m: Message| async {}),
                when,
                Some(json!({"text": "water plants"})),
                None,
            )
            .await
            .unwrap();
        assert_eq!(event, "9:reminderremind");
        assert_eq!(bus.subscriber_count("9:reminderremind"), 1);

        let msg = &bus.emitted(topic::SCHEDULE_EVENT)[0];
        assert_eq!(msg.get_str("event"), Some("9:reminderremind"));
        assert_eq!(msg.get("time"), Some(&json!(when.timestamp() as f64)));
        assert_eq!(msg.get("repeat"), Some(&Value::Null));
        assert_eq!(msg.get("data"), Some(&json!({"text": "water plants"})));
    }

    #[tokio::test]
    async fn test_repeating_event_carries_interval() {
        let bus = Arc::new(LocalBus::with_history());
        let skill = skill(&bus);
        let when = Utc.with_ymd_and_hms(2030, 1, 2, 3, 4, 5).unwrap();

        skill
            .schedule_repeating_event(|| async {}, when, Duration::from_secs(90), None, Some("tick"))
            .await
            .unwrap();
        let msg = &bus.emitted(topic::SCHEDULE_EVENT)[0];
        assert_eq!(msg.get_str("event"), Some("9:tick"));
        assert_eq!(msg.get("repeat"), Some(&json!(90.0)));
        assert_eq!(msg.get("data"), Some(&json!({})));
    }

    #[tokio::test]
    async fn test_update_and_cancel() {
        let bus = Arc::new(LocalBus::with_history());
        let skill = skill(&bus);

        skill.update_event("tick", Some(json!({"n": 2}))).await.unwrap();
        skill.cancel_event("tick").await.unwrap();

        let update = &bus.emitted(topic::UPDATE_EVENT)[0];
        assert_eq!(update.get_str("event"), Some("9:tick"));
        assert_eq!(update.get("data"), Some(&json!({"n": 2})));
        assert_eq!(bus.emitted(topic::REMOVE_EVENT)[0].get_str("event"), Some("9:tick"));
    }
}
