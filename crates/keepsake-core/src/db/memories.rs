// ============================================================================
// Memory Operations
// ============================================================================
// Memories and their embeddings. An embedding row is keyed by its memory id
// and always written or removed in the same transaction as the memory check,
// so no embedding outlives its memory.
// ============================================================================

use redb::ReadableTable;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use super::types::{Memory, MemoryEmbedding};
use super::{
    decode, encode, next_counter, now, storage, ChatDb, MEMORIES, MEMORY_EMBEDDINGS, META,
    NEXT_MEMORY_ID,
};
use crate::types::{CoreError, CoreResult, MemoryId};

impl ChatDb {
    /// Store a new memory. Text is trimmed; blank text is rejected.
    pub fn add_memory(&self, text: &str) -> CoreResult<Memory> {
        let content = text.trim();
        if content.is_empty() {
            return Err(CoreError::InvalidInput("Memory text cannot be empty".into()));
        }

        let write_txn = self.db.begin_write().map_err(storage("Failed to begin write"))?;
        let memory;
        {
            let mut meta = write_txn.open_table(META).map_err(storage("Failed to open meta table"))?;
            let id = next_counter(&mut meta, NEXT_MEMORY_ID)?;
            memory = Memory {
                id,
                content: content.to_string(),
                created_at: now(),
            };

            let value = encode("memory", &memory)?;
            let mut table = write_txn
                .open_table(MEMORIES)
                .map_err(storage("Failed to open memories table"))?;
            table
                .insert(id, value.as_slice())
                .map_err(storage("Failed to insert memory"))?;
        }
        write_txn.commit().map_err(storage("Failed to commit"))?;

        info!("Stored memory {}", memory.id);
        Ok(memory)
    }

    pub fn get_memory(&self, id: MemoryId) -> CoreResult<Memory> {
        let read_txn = self.db.begin_read().map_err(storage("Failed to begin read"))?;
        let table = read_txn
            .open_table(MEMORIES)
            .map_err(storage("Failed to open memories table"))?;

        match table.get(id).map_err(storage("Failed to get memory"))? {
            Some(value) => decode("memory", value.value()),
            None => Err(CoreError::not_found("Memory", id)),
        }
    }

    /// All memories, newest first
    pub fn list_memories(&self) -> CoreResult<Vec<Memory>> {
        let mut memories = self.memories_oldest_first()?;
        memories.reverse();
        Ok(memories)
    }

    pub(crate) fn memories_oldest_first(&self) -> CoreResult<Vec<Memory>> {
        let read_txn = self.db.begin_read().map_err(storage("Failed to begin read"))?;
        let table = read_txn
            .open_table(MEMORIES)
            .map_err(storage("Failed to open memories table"))?;

        let mut results = Vec::new();
        let iter = table
            .range::<u64>(..)
            .map_err(storage("Failed to iterate memories"))?;
        for entry in iter {
            let (_key, value) = entry.map_err(storage("Failed to read entry"))?;
            results.push(decode("memory", value.value())?);
        }
        Ok(results)
    }

    /// Delete a memory and its embedding
    pub fn delete_memory(&self, id: MemoryId) -> CoreResult<()> {
        let write_txn = self.db.begin_write().map_err(storage("Failed to begin write"))?;
        let removed;
        {
            let mut table = write_txn
                .open_table(MEMORIES)
                .map_err(storage("Failed to open memories table"))?;
            removed = table
                .remove(id)
                .map_err(storage("Failed to remove memory"))?
                .is_some();

            let mut embeddings = write_txn
                .open_table(MEMORY_EMBEDDINGS)
                .map_err(storage("Failed to open memory_embeddings table"))?;
            embeddings
                .remove(id)
                .map_err(storage("Failed to remove memory embedding"))?;
        }

        if !removed {
            write_txn.abort().map_err(storage("Failed to abort delete"))?;
            return Err(CoreError::not_found("Memory", id));
        }
        write_txn.commit().map_err(storage("Failed to commit delete"))?;

        debug!("Deleted memory {}", id);
        Ok(())
    }

    /// Delete every memory and embedding. Returns the number of memories removed.
    pub fn clear_memories(&self) -> CoreResult<usize> {
        let write_txn = self.db.begin_write().map_err(storage("Failed to begin write"))?;
        let removed;
        {
            let mut table = write_txn
                .open_table(MEMORIES)
                .map_err(storage("Failed to open memories table"))?;
            let ids = collect_ids(&table)?;
            for id in &ids {
                table.remove(*id).map_err(storage("Failed to remove memory"))?;
            }
            removed = ids.len();

            let mut embeddings = write_txn
                .open_table(MEMORY_EMBEDDINGS)
                .map_err(storage("Failed to open memory_embeddings table"))?;
            for id in collect_ids(&embeddings)? {
                embeddings
                    .remove(id)
                    .map_err(storage("Failed to remove memory embedding"))?;
            }
        }
        write_txn.commit().map_err(storage("Failed to commit clear"))?;

        info!("Cleared {} memories", removed);
        Ok(removed)
    }

    // ========================================================================
    // Embedding Operations
    // ========================================================================

    /// Attach (or replace) the embedding of an existing memory
    pub fn set_embedding(&self, memory_id: MemoryId, model: &str, vector: Vec<f32>) -> CoreResult<MemoryEmbedding> {
        if vector.is_empty() {
            return Err(CoreError::InvalidInput("Embedding vector cannot be empty".into()));
        }

        let record = MemoryEmbedding {
            memory_id,
            model: model.to_string(),
            vector,
            updated_at: now(),
        };
        let value = encode("memory embedding", &record)?;

        let write_txn = self.db.begin_write().map_err(storage("Failed to begin write"))?;
        let exists;
        {
            let memories = write_txn
                .open_table(MEMORIES)
                .map_err(storage("Failed to open memories table"))?;
            exists = memories
                .get(memory_id)
                .map_err(storage("Failed to get memory"))?
                .is_some();

            if exists {
                let mut table = write_txn
                    .open_table(MEMORY_EMBEDDINGS)
                    .map_err(storage("Failed to open memory_embeddings table"))?;
                table
                    .insert(memory_id, value.as_slice())
                    .map_err(storage("Failed to insert memory embedding"))?;
            }
        }

        if !exists {
            write_txn.abort().map_err(storage("Failed to abort"))?;
            return Err(CoreError::not_found("Memory", memory_id));
        }
        write_txn.commit().map_err(storage("Failed to commit"))?;

        debug!(
            "Stored {}-dim embedding for memory {} ({})",
            record.dimensions(),
            memory_id,
            record.model
        );
        Ok(record)
    }

    pub fn embedding(&self, memory_id: MemoryId) -> CoreResult<Option<MemoryEmbedding>> {
        let read_txn = self.db.begin_read().map_err(storage("Failed to begin read"))?;
        let table = read_txn
            .open_table(MEMORY_EMBEDDINGS)
            .map_err(storage("Failed to open memory_embeddings table"))?;

        match table.get(memory_id).map_err(storage("Failed to get memory embedding"))? {
            Some(value) => Ok(Some(decode("memory embedding", value.value())?)),
            None => Ok(None),
        }
    }

    /// Every stored embedding regardless of model, ordered by memory id
    pub fn list_embeddings(&self) -> CoreResult<Vec<MemoryEmbedding>> {
        let read_txn = self.db.begin_read().map_err(storage("Failed to begin read"))?;
        let table = read_txn
            .open_table(MEMORY_EMBEDDINGS)
            .map_err(storage("Failed to open memory_embeddings table"))?;

        let mut results = Vec::new();
        let iter = table
            .range::<u64>(..)
            .map_err(storage("Failed to iterate memory embeddings"))?;
        for entry in iter {
            let (_key, value) = entry.map_err(storage("Failed to read entry"))?;
            results.push(decode("memory embedding", value.value())?);
        }
        Ok(results)
    }

    /// Memories with no embedding from `model`, oldest first
    pub fn memories_missing_embedding(&self, model: &str) -> CoreResult<Vec<Memory>> {
        let current: HashSet<MemoryId> = self
            .list_embeddings()?
            .into_iter()
            .filter(|e| e.model == model)
            .map(|e| e.memory_id)
            .collect();

        Ok(self
            .memories_oldest_first()?
            .into_iter()
            .filter(|m| !current.contains(&m.id))
            .collect())
    }

    /// Memories paired with their `model` embedding, oldest first.
    /// Memories without one, or with another model's vector, are left out.
    pub fn embedding_candidates(&self, model: &str) -> CoreResult<Vec<(Memory, MemoryEmbedding)>> {
        let mut current: HashMap<MemoryId, MemoryEmbedding> = self
            .list_embeddings()?
            .into_iter()
            .filter(|e| e.model == model)
            .map(|e| (e.memory_id, e))
            .collect();

        Ok(self
            .memories_oldest_first()?
            .into_iter()
            .filter_map(|m| current.remove(&m.id).map(|e| (m, e)))
            .collect())
    }
}

fn collect_ids<T: ReadableTable<u64, &'static [u8]>>(table: &T) -> CoreResult<Vec<u64>> {
    let mut ids = Vec::new();
    let iter = table
        .range::<u64>(..)
        .map_err(storage("Failed to iterate table"))?;
    for entry in iter {
        let (key, _value) = entry.map_err(storage("Failed to read entry"))?;
        ids.push(key.value());
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db() -> (tempfile::TempDir, ChatDb) {
        let dir = tempfile::tempdir().unwrap();
        let db = ChatDb::open(dir.path().join("chat.redb")).unwrap();
        (dir, db)
    }

    #[test]
    fn test_add_rejects_blank_text() {
        let (_dir, db) = temp_db();
        assert!(matches!(db.add_memory("   \n\t"), Err(CoreError::InvalidInput(_))));
        assert!(db.list_memories().unwrap().is_empty());
    }

    #[test]
    fn test_list_is_newest_first() {
        let (_dir, db) = temp_db();
        db.add_memory("first").unwrap();
        db.add_memory("  second  ").unwrap();
        db.add_memory("third").unwrap();

        let contents: Vec<_> = db
            .list_memories()
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["third", "second", "first"]);
    }

    #[test]
    fn test_ids_are_never_reused() {
        let (_dir, db) = temp_db();
        let a = db.add_memory("a").unwrap();
        let b = db.add_memory("b").unwrap();
        db.delete_memory(b.id).unwrap();
        let c = db.add_memory("c").unwrap();
        assert!(c.id > b.id && b.id > a.id);
    }

    #[test]
    fn test_delete_unknown_is_not_found() {
        let (_dir, db) = temp_db();
        let err = db.delete_memory(99).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_delete_cascades_to_embedding() {
        let (_dir, db) = temp_db();
        let memory = db.add_memory("User's dog is named Rex").unwrap();
        db.set_embedding(memory.id, "m", vec![0.1, 0.2]).unwrap();
        assert!(db.embedding(memory.id).unwrap().is_some());

        db.delete_memory(memory.id).unwrap();
        assert!(db.embedding(memory.id).unwrap().is_none());
        assert!(db.list_embeddings().unwrap().is_empty());
        assert!(db.get_memory(memory.id).unwrap_err().is_not_found());
    }

    #[test]
    fn test_clear_returns_count_and_drops_embeddings() {
        let (_dir, db) = temp_db();
        for text in ["a", "b", "c"] {
            let m = db.add_memory(text).unwrap();
            db.set_embedding(m.id, "m", vec![1.0]).unwrap();
        }
        assert_eq!(db.clear_memories().unwrap(), 3);
        assert!(db.list_memories().unwrap().is_empty());
        assert!(db.list_embeddings().unwrap().is_empty());
        assert_eq!(db.clear_memories().unwrap(), 0);
    }

    #[test]
    fn test_set_embedding_requires_memory() {
        let (_dir, db) = temp_db();
        assert!(db.set_embedding(7, "m", vec![1.0]).unwrap_err().is_not_found());
        assert!(db.list_embeddings().unwrap().is_empty());
    }

    #[test]
    fn test_missing_embedding_is_model_versioned() {
        let (_dir, db) = temp_db();
        let a = db.add_memory("a").unwrap();
        let b = db.add_memory("b").unwrap();
        db.set_embedding(a.id, "old-model", vec![1.0]).unwrap();
        db.set_embedding(b.id, "new-model", vec![1.0]).unwrap();

        let missing: Vec<_> = db
            .memories_missing_embedding("new-model")
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(missing, vec![a.id]);
    }

    #[test]
    fn test_embedding_candidates_pair_current_model_only() {
        let (_dir, db) = temp_db();
        let a = db.add_memory("a").unwrap();
        let b = db.add_memory("b").unwrap();
        let c = db.add_memory("c").unwrap();
        db.set_embedding(c.id, "m", vec![0.0, 1.0]).unwrap();
        db.set_embedding(a.id, "m", vec![1.0, 0.0]).unwrap();
        db.set_embedding(b.id, "other", vec![1.0]).unwrap();

        let candidates = db.embedding_candidates("m").unwrap();
        let ids: Vec<_> = candidates.iter().map(|(m, e)| (m.id, e.memory_id)).collect();
        assert_eq!(ids, vec![(a.id, a.id), (c.id, c.id)]);
        assert!(db.embedding_candidates("missing").unwrap().is_empty());
    }
}
