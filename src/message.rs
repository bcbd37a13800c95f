//! Message codec: typed records to and from JSON wire text.
//!
//! Inbound text decodes to a [`Command`]; outbound [`Response`] and
//! [`Event`] records encode to JSON. Message flow:
//!
//! ```text
//! Host → Backend:  Command  {"cmd", "id", "params"}
//! Backend → Host:  Response {"id", "status", "result"|"error", "traceback"?}
//! Backend → Host:  Event    {"cmd", "status": "event", "result"}
//! ```
//!
//! Decoding is permissive about missing fields - an absent `cmd` becomes the
//! empty string, an absent `id` becomes 0, an absent `params` an empty map -
//! so a sloppy host still gets a correlated error Response instead of a
//! decode failure. Encoding is total for well-formed records and never
//! produces a raw NUL byte (JSON escapes control characters), which is what
//! makes the sentinel framing in [`crate::frame`] sound.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::BackendError;

/// Inbound text that is not a valid JSON object.
#[derive(Debug, thiserror::Error)]
#[error("Invalid JSON: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

/// One host request: a named operation, a correlation id, and named
/// parameters. The host is responsible for id uniqueness; the runtime
/// echoes whatever arrives.
#[derive(Debug, Clone, Deserialize)]
pub struct Command {
    #[serde(rename = "cmd", default)]
    pub name: String,

    #[serde(default)]
    pub id: i64,

    #[serde(default)]
    pub params: Params,
}

impl Command {
    /// Decode one wire message.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        Ok(serde_json::from_str(text)?)
    }

    /// A command the runtime synthesizes for itself (id 0, no parameters).
    /// Used for the readiness handshake.
    pub fn internal(name: &str) -> Self {
        Self {
            name: name.to_string(),
            id: 0,
            params: Params::default(),
        }
    }
}

/// Outcome tag carried on every Response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

/// One reply, correlated to its Command by `id`. Created once per Command,
/// emitted at most once, then discarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: i64,

    pub status: Status,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl Response {
    pub fn success(id: i64, result: Value) -> Self {
        Self {
            id,
            status: Status::Success,
            result: Some(result),
            error: None,
            traceback: None,
        }
    }

    pub fn failure(id: i64, error: impl Into<String>) -> Self {
        Self {
            id,
            status: Status::Error,
            result: None,
            error: Some(error.into()),
            traceback: None,
        }
    }

    /// Attach a diagnostic trace to an error Response.
    pub fn with_traceback(mut self, trace: impl Into<String>) -> Self {
        self.traceback = Some(trace.into());
        self
    }

    /// Encode to wire text. Total for well-formed records.
    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("BUG: response serialization cannot fail")
    }
}

/// An unsolicited outbound message. Not correlated to any Command; may be
/// emitted any number of times once the bridge is running.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub name: String,
    pub payload: Value,
}

impl Event {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }

    /// Encode to wire text. Total for well-formed records.
    pub fn encode(&self) -> String {
        let value = json!({
            "cmd": self.name,
            "status": "event",
            "result": self.payload,
        });
        serde_json::to_string(&value).expect("BUG: event serialization cannot fail")
    }
}

/// Named parameters for one invocation.
///
/// A thin wrapper over a JSON object that matches values against handler
/// parameters by name. Handlers pull individual values with [`Params::get`]
/// / [`Params::require`], or deserialize the whole map into a parameter
/// struct with [`Params::parse`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Params(Map<String, Value>);

impl Params {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Typed lookup by name; `None` when absent or JSON null.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, BackendError> {
        match self.0.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| BackendError::new(format!("Invalid parameter '{name}': {e}"))),
        }
    }

    /// Typed lookup by name; an error naming the parameter when absent.
    pub fn require<T: DeserializeOwned>(&self, name: &str) -> Result<T, BackendError> {
        self.get(name)?
            .ok_or_else(|| BackendError::new(format!("Missing required parameter: {name}")))
    }

    /// Deserialize the whole map into a typed parameter struct.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, BackendError> {
        serde_json::from_value(Value::Object(self.0.clone()))
            .map_err(|e| BackendError::new(format!("Invalid parameters: {e}")))
    }

    pub fn raw(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl From<Map<String, Value>> for Params {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}
