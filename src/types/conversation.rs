use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Metadata key holding an explicit item id.
pub const ID_METADATA_KEY: &str = "id";

/// Items that expose a stable, deterministic identifier.
pub trait Identifiable {
    /// Identifier used for checkpoint membership and deduplication.
    fn item_id(&self) -> String;
}

/// A single turn of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Role of the sender (e.g., "system", "user", "assistant").
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            metadata: Map::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

/// A conversation record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Conversation {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            metadata: Map::new(),
        }
    }

    /// Adds a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Sets an explicit id, which takes precedence over the content hash.
    pub fn with_id(self, id: impl Into<String>) -> Self {
        self.with_metadata(ID_METADATA_KEY, id.into())
    }

    /// The most recent message sent by the user, if any.
    pub fn last_user_message(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == "user")
    }

    /// Hex-encoded SHA-256 over the ordered `(role, content)` pairs.
    ///
    /// Each string is length-prefixed so that different splits of the same
    /// bytes never collide. Metadata is not part of the hash.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for message in &self.messages {
            for part in [&message.role, &message.content] {
                hasher.update((part.len() as u64).to_le_bytes());
                hasher.update(part.as_bytes());
            }
        }
        hex::encode(hasher.finalize())
    }
}

impl Identifiable for Conversation {
    fn item_id(&self) -> String {
        match self.metadata.get(ID_METADATA_KEY) {
            Some(Value::String(id)) if is_line_safe(id.trim()) => id.trim().to_string(),
            Some(Value::Number(id)) => id.to_string(),
            _ => self.content_hash(),
        }
    }
}

/// Whether `id` survives a round trip through a line-oriented log unchanged.
///
/// Ids are stored one per line with surrounding whitespace trimmed on load,
/// so a usable id is non-empty, already trimmed, and has no line breaks.
pub fn is_line_safe(id: &str) -> bool {
    !id.is_empty() && id.trim() == id && !id.contains(['\n', '\r'])
}
