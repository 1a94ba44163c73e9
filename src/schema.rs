//! Shapes of the JSON the server streams.
//!
//! The first text message on a connection is a snapshot object carrying a
//! `blocks` array; every later one is an array of allocation events.

use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Fields every event must carry.
pub const REQUIRED_EVENT_FIELDS: [&str; 6] =
    ["type", "offset", "size", "tag", "event_id", "total_allocated"];

/// A decoded text message.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Snapshot(Map<String, Value>),
    EventBatch(Vec<Value>),
    /// Any other JSON value, e.g. an object without `blocks`.
    Other(Value),
}

impl Payload {
    pub fn parse(text: &str) -> Result<Self> { Ok(Self::classify(serde_json::from_str(text)?)) }

    #[must_use]
    pub fn classify(value: Value) -> Self {
        match value {
            Value::Object(map) if map.contains_key("blocks") => Self::Snapshot(map),
            Value::Array(events) => Self::EventBatch(events),
            other => Self::Other(other),
        }
    }
}

/// Returns the first required field `event` lacks. Values that are not
/// objects lack all of them.
#[must_use]
pub fn missing_field(event: &Value) -> Option<&'static str> {
    let Some(obj) = event.as_object() else {
        return Some(REQUIRED_EVENT_FIELDS[0]);
    };
    REQUIRED_EVENT_FIELDS
        .into_iter()
        .find(|field| !obj.contains_key(*field))
}

/// Checks every event in a batch, failing on the first missing field.
pub fn validate_batch(events: &[Value]) -> Result<()> {
    for event in events {
        if let Some(field) = missing_field(event) {
            return Err(Error::Schema {
                field,
                event: event.to_string(),
            });
        }
    }
    Ok(())
}

/// Producer-side emission time of an event in microseconds, if present.
#[must_use]
pub fn timestamp_us(event: &Value) -> Option<f64> { event.get("timestamp_us")?.as_f64() }
