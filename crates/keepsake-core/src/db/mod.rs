// ============================================================================
// ChatDb - Embedded Database (redb)
// ============================================================================
// Persistent local storage for conversations, messages, memories and memory
// embeddings. Every write runs in one short redb write transaction; redb
// admits a single writer at a time, so appends and memory mutations are
// atomic and serialized. Reads use MVCC read transactions and never block
// on a writer.
// ============================================================================

mod conversations;
mod memories;
pub mod types;

pub use types::{
    default_title, Conversation, DbStats, Memory, MemoryEmbedding, Message, NewMessage,
};

use redb::{Database, ReadableTable, Table, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::types::{CoreError, CoreResult};

// Table definitions
const CONVERSATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("conversations");
const MESSAGES: TableDefinition<(&str, u64), &[u8]> = TableDefinition::new("messages");
const MEMORIES: TableDefinition<u64, &[u8]> = TableDefinition::new("memories");
const MEMORY_EMBEDDINGS: TableDefinition<u64, &[u8]> = TableDefinition::new("memory_embeddings");
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

// Counters kept in META
const NEXT_MEMORY_ID: &str = "next_memory_id";
const ACTIVITY_CLOCK: &str = "activity_clock";

/// Embedded database for the chat assistant
pub struct ChatDb {
    db: Database,
    path: PathBuf,
}

impl ChatDb {
    /// Open (or create) the database at the given path
    pub fn open(path: impl AsRef<Path>) -> CoreResult<Self> {
        let db_path = path.as_ref().to_path_buf();
        info!("Opening database at: {}", db_path.display());

        let db = Database::create(&db_path).map_err(storage("Failed to open database"))?;

        // Ensure tables exist by doing a write transaction
        let write_txn = db.begin_write().map_err(storage("Failed to begin write"))?;
        {
            write_txn
                .open_table(CONVERSATIONS)
                .map_err(storage("Failed to create conversations table"))?;
            write_txn
                .open_table(MESSAGES)
                .map_err(storage("Failed to create messages table"))?;
            write_txn
                .open_table(MEMORIES)
                .map_err(storage("Failed to create memories table"))?;
            write_txn
                .open_table(MEMORY_EMBEDDINGS)
                .map_err(storage("Failed to create memory_embeddings table"))?;
            write_txn
                .open_table(META)
                .map_err(storage("Failed to create meta table"))?;
        }
        write_txn.commit().map_err(storage("Failed to commit init"))?;

        info!("Database ready");
        Ok(Self { db, path: db_path })
    }

    /// Get the database file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub fn stats(&self) -> CoreResult<DbStats> {
        let read_txn = self.db.begin_read().map_err(storage("Failed to begin read"))?;

        let conversations = read_txn
            .open_table(CONVERSATIONS)
            .map_err(storage("Failed to open conversations table"))?
            .range::<&str>(..)
            .map_err(storage("Failed to iterate conversations"))?
            .count();

        let messages = read_txn
            .open_table(MESSAGES)
            .map_err(storage("Failed to open messages table"))?
            .iter()
            .map_err(storage("Failed to iterate messages"))?
            .count();

        let memories = read_txn
            .open_table(MEMORIES)
            .map_err(storage("Failed to open memories table"))?
            .range::<u64>(..)
            .map_err(storage("Failed to iterate memories"))?
            .count();

        let embeddings = self.list_embeddings()?;
        let mut embedding_models = std::collections::BTreeMap::new();
        for embedding in &embeddings {
            *embedding_models.entry(embedding.model.clone()).or_insert(0usize) += 1;
        }

        Ok(DbStats {
            conversations,
            messages,
            memories,
            embeddings: embeddings.len(),
            embedding_models,
        })
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Map a redb/bincode error into a storage error with context
pub(crate) fn storage<E: std::fmt::Display>(context: &'static str) -> impl FnOnce(E) -> CoreError {
    move |e| CoreError::Storage(format!("{}: {}", context, e))
}

pub(crate) fn encode<T: Serialize>(what: &str, value: &T) -> CoreResult<Vec<u8>> {
    bincode::serialize(value)
        .map_err(|e| CoreError::Storage(format!("Failed to serialize {}: {}", what, e)))
}

pub(crate) fn decode<T: DeserializeOwned>(what: &str, bytes: &[u8]) -> CoreResult<T> {
    bincode::deserialize(bytes)
        .map_err(|e| CoreError::Storage(format!("Failed to deserialize {}: {}", what, e)))
}

/// Return the counter's current value (starting at 1) and advance it
pub(crate) fn next_counter(meta: &mut Table<'_, &'static str, u64>, key: &str) -> CoreResult<u64> {
    let current = meta
        .get(key)
        .map_err(storage("Failed to read counter"))?
        .map(|v| v.value())
        .unwrap_or(1);
    meta.insert(key, current + 1)
        .map_err(storage("Failed to advance counter"))?;
    debug!("Counter {} -> {}", key, current + 1);
    Ok(current)
}

pub(crate) fn now() -> i64 {
    chrono::Utc::now().timestamp()
}
