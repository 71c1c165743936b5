//! Message names exchanged with the rest of the assistant.
//!
//! These strings are the wire contract with the intent service, the
//! scheduler service and the audio/presentation layers.

/// Vocabulary entry or regex registration.
pub const REGISTER_VOCAB: &str = "register_vocab";
/// Structured intent registration.
pub const REGISTER_INTENT: &str = "register_intent";
/// Example-file intent registration.
pub const PADATIOUS_REGISTER_INTENT: &str = "padatious:register_intent";
/// Entity-file registration.
pub const PADATIOUS_REGISTER_ENTITY: &str = "padatious:register_entity";
/// Removes an intent from the intent service.
pub const DETACH_INTENT: &str = "detach_intent";
/// Removes every intent owned by a skill.
pub const DETACH_SKILL: &str = "detach_skill";
/// Adds a keyword to the conversational context.
pub const ADD_CONTEXT: &str = "add_context";
/// Removes a keyword from the conversational context.
pub const REMOVE_CONTEXT: &str = "remove_context";
/// Moves a skill to the front of the active-skill list.
pub const ACTIVE_SKILL_REQUEST: &str = "active_skill_request";
/// Spoken output.
pub const SPEAK: &str = "speak";
/// Presentation layer notification that a skill is active.
pub const ENCLOSURE_ACTIVE_SKILL: &str = "enclosure.active_skill";

/// Emitted before a bound handler runs.
pub const HANDLER_START: &str = "mycroft.skill.handler.start";
/// Emitted after a bound handler finished, successfully or not.
pub const HANDLER_COMPLETE: &str = "mycroft.skill.handler.complete";

/// Asks the scheduler service to fire an event later.
pub const SCHEDULE_EVENT: &str = "mycroft.scheduler.schedule_event";
/// Replaces the payload of a scheduled event.
pub const UPDATE_EVENT: &str = "mycroft.schedule.update_event";
/// Cancels a scheduled event.
pub const REMOVE_EVENT: &str = "mycroft.scheduler.remove_event";

/// No intent matched the utterance (inbound, drives the fallback chain).
pub const INTENT_FAILURE: &str = "intent_failure";
/// Every fallback declined the utterance.
pub const COMPLETE_INTENT_FAILURE: &str = "complete_intent_failure";
/// Global stop request.
pub const STOP: &str = "mycroft.stop";
