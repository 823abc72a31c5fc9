//! ============================================================================
//! Database Types - Serializable records for redb storage
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{ContentPart, MemoryId, Role};

/// Conversation header. Messages live in their own table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub created_at: i64,
    pub last_active_at: i64,
    pub message_count: u64,
    /// Position handed to the next appended message
    pub next_position: u64,
    /// Database-wide activity clock value of the last write to this conversation.
    /// Orders conversations by recency without relying on wall-clock resolution.
    pub activity: u64,
}

impl Conversation {
    pub(crate) fn new(id: String, title: Option<String>, now: i64, activity: u64) -> Self {
        Self {
            id,
            title: title.unwrap_or_else(|| default_title(now)),
            created_at: now,
            last_active_at: now,
            message_count: 0,
            next_position: 1,
            activity,
        }
    }
}

/// Title given to conversations the user has not named, e.g. "Chat 2026-10-19 14:03"
pub fn default_title(timestamp: i64) -> String {
    chrono::DateTime::from_timestamp(timestamp, 0)
        .map(|dt| format!("Chat {}", dt.format("%Y-%m-%d %H:%M")))
        .unwrap_or_else(|| "Chat".to_string())
}

/// A stored message. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub conversation_id: String,
    /// Strictly increasing within the conversation, starting at 1
    pub position: u64,
    pub role: Role,
    pub parts: Vec<ContentPart>,
    pub created_at: i64,
}

impl Message {
    /// Text parts joined with blank lines
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(ContentPart::as_text)
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// A message about to be appended; the store assigns position and timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub role: Role,
    pub parts: Vec<ContentPart>,
}

impl NewMessage {
    pub fn new(role: Role, parts: Vec<ContentPart>) -> Self {
        Self { role, parts }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![ContentPart::text(text)])
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![ContentPart::text(text)])
    }
}

/// A long-term memory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    pub id: MemoryId,
    pub content: String,
    pub created_at: i64,
}

/// Vector for one memory, tagged with the model that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEmbedding {
    pub memory_id: MemoryId,
    pub model: String,
    pub vector: Vec<f32>,
    pub updated_at: i64,
}

impl MemoryEmbedding {
    pub fn dimensions(&self) -> usize {
        self.vector.len()
    }
}

/// Database statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DbStats {
    pub conversations: usize,
    pub messages: usize,
    pub memories: usize,
    pub embeddings: usize,
    /// Embedding count per model identifier
    pub embedding_models: BTreeMap<String, usize>,
}
