//! Bus message model.
//!
//! A [`Message`] is a named envelope with a JSON payload. Every interaction
//! between a skill and the rest of the assistant travels as one of these,
//! whether it is an intent registration, a telemetry event or an utterance
//! that no intent matched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A named message travelling over the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// The message name subscribers are keyed on.
    #[serde(rename = "type")]
    pub msg_type: String,

    /// The message payload. Always a JSON object.
    #[serde(default = "empty_object")]
    pub data: Value,

    /// Routing context attached by the transport.
    #[serde(default)]
    pub context: Map<String, Value>,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl Message {
    /// Creates a message with the given payload.
    ///
    /// Non-object payloads are wrapped as `{"value": ...}` so that `data`
    /// stays keyed.
    pub fn new(msg_type: impl Into<String>, data: Value) -> Self {
        let data = match data {
            Value::Object(_) => data,
            Value::Null => empty_object(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                Value::Object(map)
            }
        };
        Self {
            msg_type: msg_type.into(),
            data,
            context: Map::new(),
        }
    }

    /// Creates a message with an empty payload.
    pub fn empty(msg_type: impl Into<String>) -> Self {
        Self::new(msg_type, Value::Null)
    }

    /// Attaches a context entry (builder style).
    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Returns a payload field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Returns a payload field as a string slice.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    /// Returns `true` if the payload carries `key`.
    pub fn has(&self, key: &str) -> bool {
        self.data.get(key).is_some()
    }

    /// Builds a new message of another type that keeps this message's context.
    pub fn forward(&self, msg_type: impl Into<String>, data: Value) -> Self {
        let mut msg = Self::new(msg_type, data);
        msg.context = self.context.clone();
        msg
    }
}
