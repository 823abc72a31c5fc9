// ============================================================================
// Conversation Operations
// ============================================================================
// Append-only message log per conversation. Messages are keyed by
// (conversation_id, position) so a conversation's transcript is one ordered
// range scan and the recent window is the tail of that range.
// ============================================================================

use redb::ReadableTable;
use tracing::{debug, info};
use uuid::Uuid;

use super::types::{Conversation, Message, NewMessage};
use super::{
    decode, encode, next_counter, now, storage, ChatDb, ACTIVITY_CLOCK, CONVERSATIONS, MESSAGES,
    META,
};
use crate::types::{CoreError, CoreResult};

impl ChatDb {
    /// Create an empty conversation with a fresh id
    pub fn create_conversation(&self, title: Option<&str>) -> CoreResult<Conversation> {
        let title = title.map(str::trim).filter(|t| !t.is_empty()).map(String::from);
        let id = Uuid::new_v4().to_string();

        let write_txn = self.db.begin_write().map_err(storage("Failed to begin write"))?;
        let conversation;
        {
            let mut meta = write_txn.open_table(META).map_err(storage("Failed to open meta table"))?;
            let activity = next_counter(&mut meta, ACTIVITY_CLOCK)?;
            conversation = Conversation::new(id, title, now(), activity);

            let value = encode("conversation", &conversation)?;
            let mut table = write_txn
                .open_table(CONVERSATIONS)
                .map_err(storage("Failed to open conversations table"))?;
            table
                .insert(conversation.id.as_str(), value.as_slice())
                .map_err(storage("Failed to insert conversation"))?;
        }
        write_txn.commit().map_err(storage("Failed to commit"))?;

        info!("Created conversation {}", conversation.id);
        Ok(conversation)
    }

    /// Append a message, assigning the next position.
    ///
    /// This is an upsert on the conversation: appending to an id that does
    /// not exist yet creates the conversation (default title) in the same
    /// transaction as the message.
    pub fn append(&self, conversation_id: &str, message: NewMessage) -> CoreResult<Message> {
        if conversation_id.trim().is_empty() {
            return Err(CoreError::InvalidInput("Conversation id cannot be empty".into()));
        }

        let timestamp = now();
        let write_txn = self.db.begin_write().map_err(storage("Failed to begin write"))?;
        let stored;
        {
            let mut meta = write_txn.open_table(META).map_err(storage("Failed to open meta table"))?;
            let activity = next_counter(&mut meta, ACTIVITY_CLOCK)?;

            let mut conversations = write_txn
                .open_table(CONVERSATIONS)
                .map_err(storage("Failed to open conversations table"))?;
            let existing: Option<Conversation> = match conversations
                .get(conversation_id)
                .map_err(storage("Failed to get conversation"))?
            {
                Some(value) => Some(decode("conversation", value.value())?),
                None => None,
            };
            let mut conversation = match existing {
                Some(conversation) => conversation,
                None => {
                    info!("Creating conversation {} on first message", conversation_id);
                    Conversation::new(conversation_id.to_string(), None, timestamp, activity)
                }
            };

            stored = Message {
                conversation_id: conversation_id.to_string(),
                position: conversation.next_position,
                role: message.role,
                parts: message.parts,
                created_at: timestamp,
            };

            conversation.next_position += 1;
            conversation.message_count += 1;
            conversation.last_active_at = timestamp;
            conversation.activity = activity;

            let value = encode("conversation", &conversation)?;
            conversations
                .insert(conversation_id, value.as_slice())
                .map_err(storage("Failed to update conversation"))?;

            let value = encode("message", &stored)?;
            let mut messages = write_txn
                .open_table(MESSAGES)
                .map_err(storage("Failed to open messages table"))?;
            messages
                .insert((conversation_id, stored.position), value.as_slice())
                .map_err(storage("Failed to insert message"))?;
        }
        write_txn.commit().map_err(storage("Failed to commit"))?;

        debug!(
            "Appended {} message at position {} to {}",
            stored.role, stored.position, conversation_id
        );
        Ok(stored)
    }

    /// The last `limit` messages of a conversation, oldest of the window first.
    /// Unknown conversations yield an empty window.
    pub fn recent(&self, conversation_id: &str, limit: usize) -> CoreResult<Vec<Message>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let read_txn = self.db.begin_read().map_err(storage("Failed to begin read"))?;
        let table = read_txn
            .open_table(MESSAGES)
            .map_err(storage("Failed to open messages table"))?;

        let mut window = Vec::with_capacity(limit);
        let iter = table
            .range((conversation_id, 0u64)..=(conversation_id, u64::MAX))
            .map_err(storage("Failed to iterate messages"))?;
        for entry in iter.rev().take(limit) {
            let (_key, value) = entry.map_err(storage("Failed to read entry"))?;
            window.push(decode::<Message>("message", value.value())?);
        }
        window.reverse();
        Ok(window)
    }

    /// Full transcript of a conversation in position order
    pub fn messages(&self, conversation_id: &str) -> CoreResult<Vec<Message>> {
        let read_txn = self.db.begin_read().map_err(storage("Failed to begin read"))?;
        let table = read_txn
            .open_table(MESSAGES)
            .map_err(storage("Failed to open messages table"))?;

        let mut results = Vec::new();
        let iter = table
            .range((conversation_id, 0u64)..=(conversation_id, u64::MAX))
            .map_err(storage("Failed to iterate messages"))?;
        for entry in iter {
            let (_key, value) = entry.map_err(storage("Failed to read entry"))?;
            results.push(decode("message", value.value())?);
        }
        Ok(results)
    }

    pub fn conversation(&self, conversation_id: &str) -> CoreResult<Conversation> {
        let read_txn = self.db.begin_read().map_err(storage("Failed to begin read"))?;
        let table = read_txn
            .open_table(CONVERSATIONS)
            .map_err(storage("Failed to open conversations table"))?;

        match table
            .get(conversation_id)
            .map_err(storage("Failed to get conversation"))?
        {
            Some(value) => decode("conversation", value.value()),
            None => Err(CoreError::not_found("Conversation", conversation_id)),
        }
    }

    /// All conversations, most recently active first
    pub fn list_conversations(&self) -> CoreResult<Vec<Conversation>> {
        let read_txn = self.db.begin_read().map_err(storage("Failed to begin read"))?;
        let table = read_txn
            .open_table(CONVERSATIONS)
            .map_err(storage("Failed to open conversations table"))?;

        let mut results: Vec<Conversation> = Vec::new();
        let iter = table
            .range::<&str>(..)
            .map_err(storage("Failed to iterate conversations"))?;
        for entry in iter {
            let (_key, value) = entry.map_err(storage("Failed to read entry"))?;
            results.push(decode("conversation", value.value())?);
        }

        results.sort_by(|a, b| b.activity.cmp(&a.activity));
        Ok(results)
    }

    /// Rename a conversation. Renaming does not count as activity.
    pub fn rename_conversation(&self, conversation_id: &str, title: &str) -> CoreResult<Conversation> {
        let title = title.trim();
        if title.is_empty() {
            return Err(CoreError::InvalidInput("Title cannot be empty".into()));
        }

        let write_txn = self.db.begin_write().map_err(storage("Failed to begin write"))?;
        let updated;
        {
            let mut table = write_txn
                .open_table(CONVERSATIONS)
                .map_err(storage("Failed to open conversations table"))?;
            let existing: Option<Conversation> = match table
                .get(conversation_id)
                .map_err(storage("Failed to get conversation"))?
            {
                Some(value) => Some(decode("conversation", value.value())?),
                None => None,
            };

            updated = match existing {
                Some(mut conversation) => {
                    conversation.title = title.to_string();
                    let value = encode("conversation", &conversation)?;
                    table
                        .insert(conversation_id, value.as_slice())
                        .map_err(storage("Failed to update conversation"))?;
                    Some(conversation)
                }
                None => None,
            };
        }

        match updated {
            Some(conversation) => {
                write_txn.commit().map_err(storage("Failed to commit"))?;
                debug!("Renamed conversation {} to {:?}", conversation_id, conversation.title);
                Ok(conversation)
            }
            None => {
                write_txn.abort().map_err(storage("Failed to abort"))?;
                Err(CoreError::not_found("Conversation", conversation_id))
            }
        }
    }
}
