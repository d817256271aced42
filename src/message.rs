//! Inbound inputs and outbound envelopes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

pub const TEXT_PLAIN: &str = "text/plain";

fn default_media_type() -> String {
    TEXT_PLAIN.to_string()
}

/// The input that triggered a processing pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInput {
    #[serde(default = "default_media_type")]
    pub media_type: String,
    #[serde(default)]
    pub content: Value,
}

impl UserInput {
    pub fn new(media_type: impl Into<String>, content: Value) -> Self {
        Self {
            media_type: media_type.into(),
            content,
        }
    }

    /// A plain text input
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(TEXT_PLAIN, Value::String(text.into()))
    }

    /// A plain text input without content
    pub fn empty() -> Self {
        Self::new(TEXT_PLAIN, Value::Null)
    }

    /// Textual value used by conditions and variable binding
    ///
    /// Strings are returned as-is, other documents as compact JSON.
    pub fn value(&self) -> Option<String> {
        match &self.content {
            Value::Null => None,
            Value::String(text) => Some(text.clone()),
            other => Some(other.to_string()),
        }
    }
}

/// A message addressed to a user, handed to the [`crate::runtime::Sender`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub id: String,
    pub to: String,
    #[serde(rename = "type")]
    pub media_type: String,
    pub content: Value,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl Envelope {
    pub fn new(to: impl Into<String>, media_type: impl Into<String>, content: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            to: to.into(),
            media_type: media_type.into(),
            content,
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Content rendered as text, for logs and plain-text transports
    pub fn content_text(&self) -> String {
        match &self.content {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        }
    }
}
