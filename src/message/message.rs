use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Header keys stamped onto a message at publish time.
pub mod headers {
    pub const NAME: &str = "msg-name";
    pub const TYPE: &str = "msg-type";
    pub const SENT_TIME: &str = "msg-sent-time";
    pub const ID: &str = "msg-id";
}

/// A message supplied by the caller.
///
/// The id is expected to be globally unique and roughly time-ordered (a
/// snowflake-style id). It becomes the primary key of the persisted envelope
/// and the broker message-id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub value: serde_json::Value,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    /// Short type name of the payload this message was encoded from.
    #[serde(skip)]
    pub type_name: Option<String>,
}

impl Message {
    /// Create a message from an already-built JSON value.
    pub fn new(id: i64, value: serde_json::Value) -> Self {
        Self {
            id,
            value,
            headers: HashMap::new(),
            type_name: None,
        }
    }

    /// Create a message by serializing `payload` to JSON.
    ///
    /// The payload's type name is captured so it can be stamped as a header.
    pub fn encode<T: Serialize>(id: i64, payload: &T) -> Result<Self, serde_json::Error> {
        let value = serde_json::to_value(payload)?;
        let mut message = Self::new(id, value);
        message.type_name = Some(short_type_name::<T>().to_string());
        Ok(message)
    }

    /// Decode the payload into a concrete type.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.value.clone())
    }

    /// Add a header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(|s| s.as_str())
    }

    /// Type tag used for the `msg-type` header.
    pub fn type_tag(&self) -> &str {
        match &self.type_name {
            Some(name) => name,
            None => json_kind(&self.value),
        }
    }
}

fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
