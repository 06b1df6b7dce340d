//! Line codec for the worker protocol.
//!
//! Wire format: one compact JSON object per `\n`-terminated line, in both
//! directions. Only the envelope is interpreted here: the correlation id and
//! the partial/final marker. Everything else is passed through untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::defaults;
use crate::error::{Error, Result};

/// Envelope field names used by the worker protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireProtocol {
    /// Correlation id, assigned by us and echoed by the worker
    #[serde(default = "defaults::id_field")]
    pub id_field: String,
    /// Boolean-like marker set while a response is still in progress
    #[serde(default = "defaults::partial_field")]
    pub partial_field: String,
    /// Field carrying a worker-side failure for the request
    #[serde(default = "defaults::error_field")]
    pub error_field: String,
    /// Field carrying a non-fatal warning for the request
    #[serde(default = "defaults::warning_field")]
    pub warning_field: String,
    /// Log every dropped non-protocol line at debug level
    #[serde(default)]
    pub log_malformed: bool,
}

impl Default for WireProtocol {
    fn default() -> Self {
        Self {
            id_field: defaults::id_field(),
            partial_field: defaults::partial_field(),
            error_field: defaults::error_field(),
            warning_field: defaults::warning_field(),
            log_malformed: false,
        }
    }
}

/// What a decoded message means for the request it names.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageKind {
    /// Terminating answer
    Final,
    /// Progress update sharing the request's id
    Partial,
    /// Worker rejected the request
    Failed(String),
    /// Informational message about the request, not an answer
    Notice(String),
}

/// Envelope view of a decoded message.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub id: Option<String>,
    pub kind: MessageKind,
}

impl WireProtocol {
    /// Classify a decoded message.
    ///
    /// A message without the partial marker counts as final, since the marker
    /// is optional in the protocol.
    pub fn envelope(&self, message: &Map<String, Value>) -> Envelope {
        let id = message.get(&self.id_field).and_then(id_string);

        let partial = message.get(&self.partial_field).and_then(boolish);
        if partial == Some(true) {
            return Envelope {
                id,
                kind: MessageKind::Partial,
            };
        }

        if let Some(error) = message.get(&self.error_field) {
            return Envelope {
                id,
                kind: MessageKind::Failed(text_of(error)),
            };
        }

        if partial.is_none() {
            if let Some(warning) = message.get(&self.warning_field) {
                return Envelope {
                    id,
                    kind: MessageKind::Notice(text_of(warning)),
                };
            }
        }

        Envelope {
            id,
            kind: MessageKind::Final,
        }
    }

    /// Merge a correlation id into a request payload, replacing any existing one.
    pub fn with_id(&self, payload: Value, id: &str) -> Result<Value> {
        match payload {
            Value::Object(mut map) => {
                map.insert(self.id_field.clone(), Value::String(id.to_string()));
                Ok(Value::Object(map))
            }
            Value::Null => {
                let mut map = Map::new();
                map.insert(self.id_field.clone(), Value::String(id.to_string()));
                Ok(Value::Object(map))
            }
            other => Err(Error::InvalidPayload(format!(
                "expected a JSON object, got {}",
                kind_name(&other)
            ))),
        }
    }
}

/// Serialize a message as one protocol line, newline included.
pub fn encode_line(message: &Value) -> Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Decode one protocol line into a JSON object.
///
/// Blank lines, non-JSON text and JSON that is not an object are rejected
/// with `MalformedResponse`; callers treat those as out-of-band noise.
pub fn decode_line(line: &str) -> Result<Map<String, Value>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(Error::MalformedResponse("empty line".into()));
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(Error::MalformedResponse(format!(
            "expected a JSON object, got {}",
            kind_name(&other)
        ))),
        Err(e) => Err(Error::MalformedResponse(e.to_string())),
    }
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn boolish(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
