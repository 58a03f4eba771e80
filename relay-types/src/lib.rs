//! Wire types for tag-addressed process messaging
//!
//! These types are shared by:
//! - the request/response client (encode, submit, reconcile)
//! - substrate implementations (HTTP gateway, in-memory test doubles)
//!
//! The wire format is stringly typed by necessity; `TagMap` is the narrow,
//! typed boundary everything else talks to.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

// ============================================================================
// Protocol Constants
// ============================================================================

/// Tag every outgoing message carries to name the requested operation.
pub const ACTION_TAG: &str = "Action";
/// Tag every well-formed result carries.
pub const STATUS_TAG: &str = "Status";
/// `Status` value signalling success.
pub const STATUS_OK: &str = "200";
/// Suffix marking the reply among several result messages.
pub const RESPONSE_SUFFIX: &str = "Response";
/// Reserved `TagMap` key for the raw payload. `@` is never valid in a tag name.
pub const PAYLOAD_KEY: &str = "@payload";

/// Tag names are ASCII identifiers: letters, digits, `-` and `_`.
pub fn is_valid_tag_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

// ============================================================================
// Tags
// ============================================================================

/// A single name/value pair as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub value: String,
}

impl Tag {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Name-unique tag mapping that remembers insertion order.
///
/// Re-inserting an existing name replaces the value in place, so the
/// position of a name is the position of its first insertion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagMap {
    entries: Vec<(String, String)>,
}

impl TagMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite. Returns the previous value when overwriting.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some((_, existing)) => Some(std::mem::replace(existing, value)),
            None => {
                self.entries.push((name, value));
                None
            }
        }
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let index = self.entries.iter().position(|(n, _)| n == name)?;
        Some(self.entries.remove(index).1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn action(&self) -> Option<&str> {
        self.get(ACTION_TAG)
    }

    pub fn status(&self) -> Option<&str> {
        self.get(STATUS_TAG)
    }

    /// Raw payload promoted into the map by the decoder, if any.
    pub fn payload(&self) -> Option<&str> {
        self.get(PAYLOAD_KEY)
    }
}

impl<K, V> FromIterator<(K, V)> for TagMap
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (name, value) in iter {
            map.insert(name, value);
        }
        map
    }
}

impl Serialize for TagMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, value) in &self.entries {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

// ============================================================================
// Payloads
// ============================================================================

/// Outgoing message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestData {
    Text(String),
    Binary(Bytes),
}

impl RequestData {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

impl From<String> for RequestData {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for RequestData {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<Vec<u8>> for RequestData {
    fn from(value: Vec<u8>) -> Self {
        Self::Binary(Bytes::from(value))
    }
}

impl From<Bytes> for RequestData {
    fn from(value: Bytes) -> Self {
        Self::Binary(value)
    }
}

/// Decoded result body: JSON when it parses, the raw text otherwise.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Structured(serde_json::Value),
    Text(String),
}

impl Payload {
    /// Never fails; unparsable input is kept verbatim.
    pub fn decode(raw: &str) -> Self {
        match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(value) => Self::Structured(value),
            Err(_) => Self::Text(raw.to_string()),
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Structured(value) => Some(value),
            Self::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Structured(serde_json::Value::String(text)) => Some(text),
            Self::Structured(_) => None,
        }
    }
}

// ============================================================================
// Results
// ============================================================================

/// One output message produced by a process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResultMessage {
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub anchor: Option<String>,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl ResultMessage {
    pub fn with_tags(tags: Vec<Tag>) -> Self {
        Self {
            tags,
            ..Self::default()
        }
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(serde_json::Value::String(data.into()));
        self
    }

    /// Payload as the substrate sent it. Non-string JSON is re-serialized.
    pub fn raw_data(&self) -> Option<String> {
        match self.data.as_ref()? {
            serde_json::Value::Null => None,
            serde_json::Value::String(text) => Some(text.clone()),
            other => Some(other.to_string()),
        }
    }
}

/// Everything the substrate reports for one evaluated message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProcessResult {
    #[serde(default)]
    pub messages: Vec<ResultMessage>,
    #[serde(default)]
    pub spawns: Vec<serde_json::Value>,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
    #[serde(default)]
    pub gas_used: Option<u64>,
}

impl ProcessResult {
    pub fn from_messages(messages: Vec<ResultMessage>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    /// Top-level execution error, ignoring `null` and empty strings.
    pub fn error_text(&self) -> Option<String> {
        match self.error.as_ref()? {
            serde_json::Value::Null => None,
            serde_json::Value::String(text) if text.trim().is_empty() => None,
            serde_json::Value::String(text) => Some(text.clone()),
            other => Some(other.to_string()),
        }
    }
}

/// Correlation record for a submitted write whose result was not observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingWrite {
    pub message_id: String,
    pub process_id: String,
    pub submitted_at: DateTime<Utc>,
}

// ============================================================================
// Tests
// ============================================================================
