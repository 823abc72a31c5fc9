//! ============================================================================
//! Memory Manager - Memory CRUD plus embedding upkeep
//! ============================================================================
//! High-level API for adding, listing and deleting memories while keeping
//! their embeddings current for the configured model.
//! ============================================================================

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::embeddings::EmbeddingProvider;
use crate::config::ChatConfig;
use crate::db::{ChatDb, Memory};
use crate::types::{CoreError, CoreResult, MemoryId};

/// Memories sent to the provider per backfill request
pub const BACKFILL_BATCH: usize = 64;

/// Why an embedding call produced no vectors
enum EmbedFailure {
    /// Per-call timeout or the pass deadline expired
    TimedOut(CoreError),
    Failed(CoreError),
}

impl EmbedFailure {
    fn into_error(self) -> CoreError {
        match self {
            EmbedFailure::TimedOut(e) | EmbedFailure::Failed(e) => e,
        }
    }
}

/// Memory manager combining the store and an optional embedding provider
pub struct MemoryManager {
    db: Arc<ChatDb>,
    /// `None` when embeddings are disabled or no provider is configured
    embeddings: Option<Arc<dyn EmbeddingProvider>>,
    timeout: Duration,
    batch_size: usize,
}

impl MemoryManager {
    pub fn new(
        db: Arc<ChatDb>,
        embeddings: Option<Arc<dyn EmbeddingProvider>>,
        config: &ChatConfig,
    ) -> Self {
        let embeddings = if config.embeddings_enabled {
            embeddings
        } else {
            None
        };

        Self {
            db,
            embeddings,
            timeout: config.embedding_timeout,
            batch_size: BACKFILL_BATCH,
        }
    }

    /// Override how many memories go into one backfill request
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Whether vectors are produced for memories
    pub fn embeddings_active(&self) -> bool {
        self.embeddings.is_some()
    }

    /// Model identifier embeddings are versioned by, when active
    pub fn embedding_model(&self) -> Option<&str> {
        self.embeddings.as_deref().map(|p| p.model())
    }

    /// Store a memory and embed it right away when embeddings are active.
    /// An embedding failure keeps the memory; the next reconcile picks it up.
    pub async fn add_memory(&self, text: &str) -> CoreResult<Memory> {
        let memory = self.db.add_memory(text)?;

        if let Some(provider) = &self.embeddings {
            match self
                .embed_texts(provider.as_ref(), &[memory.content.clone()], None)
                .await
            {
                Ok(mut vectors) => {
                    if let Some(vector) = vectors.pop() {
                        self.db.set_embedding(memory.id, provider.model(), vector)?;
                    }
                }
                Err(e) => warn!(
                    "Could not embed memory {} now, it will be backfilled: {}",
                    memory.id,
                    e.into_error()
                ),
            }
        }

        Ok(memory)
    }

    pub fn get_memory(&self, id: MemoryId) -> CoreResult<Memory> {
        self.db.get_memory(id)
    }

    /// All memories, newest first
    pub fn list_memories(&self) -> CoreResult<Vec<Memory>> {
        self.db.list_memories()
    }

    pub fn delete_memory(&self, id: MemoryId) -> CoreResult<()> {
        self.db.delete_memory(id)
    }

    /// Remove every memory; returns how many were removed
    pub fn clear_memories(&self) -> CoreResult<usize> {
        self.db.clear_memories()
    }

    /// Embed every memory that lacks a vector from the current model.
    ///
    /// Idempotent: memories that already carry a current-model embedding are
    /// skipped, so a second call with nothing new returns 0. Returns the
    /// number of memories embedded by this call.
    pub async fn reconcile_embeddings(&self) -> CoreResult<usize> {
        self.backfill(None).await
    }

    /// Like `reconcile_embeddings`, but stops at `deadline`. Chunks stored
    /// before the deadline are kept; the rest waits for the next pass.
    pub async fn reconcile_embeddings_before(&self, deadline: Instant) -> CoreResult<usize> {
        self.backfill(Some(deadline)).await
    }

    /// Chunked backfill. A failed chunk is retried one memory at a time so a
    /// single rejected input only holds back itself. A timeout ends the pass.
    /// Errors only when something was missing and nothing could be embedded.
    async fn backfill(&self, deadline: Option<Instant>) -> CoreResult<usize> {
        let provider = match &self.embeddings {
            Some(provider) => provider.as_ref(),
            None => return Ok(0),
        };

        let missing = self.db.memories_missing_embedding(provider.model())?;
        if missing.is_empty() {
            debug!("All memories embedded with {}", provider.model());
            return Ok(0);
        }

        info!(
            "Backfilling embeddings for {} memories ({})",
            missing.len(),
            provider.model()
        );

        let mut embedded = 0;
        let mut skipped = 0;
        let mut first_error = None;

        'chunks: for chunk in missing.chunks(self.batch_size) {
            let texts: Vec<String> = chunk.iter().map(|m| m.content.clone()).collect();
            match self.embed_texts(provider, &texts, deadline).await {
                Ok(vectors) => {
                    for (memory, vector) in chunk.iter().zip(vectors) {
                        embedded += self.store_vector(provider, memory, vector)?;
                    }
                }
                Err(EmbedFailure::TimedOut(e)) => {
                    warn!("Backfill stopped: {}", e);
                    first_error.get_or_insert(e);
                    break 'chunks;
                }
                Err(EmbedFailure::Failed(e)) if chunk.len() == 1 => {
                    warn!("Skipping memory {}: {}", chunk[0].id, e);
                    skipped += 1;
                    first_error.get_or_insert(e);
                }
                Err(EmbedFailure::Failed(e)) => {
                    warn!(
                        "Batch of {} failed ({}), retrying one at a time",
                        chunk.len(),
                        e
                    );
                    for memory in chunk {
                        match self
                            .embed_texts(provider, &[memory.content.clone()], deadline)
                            .await
                        {
                            Ok(mut vectors) => {
                                if let Some(vector) = vectors.pop() {
                                    embedded += self.store_vector(provider, memory, vector)?;
                                }
                            }
                            Err(EmbedFailure::TimedOut(e)) => {
                                warn!("Backfill stopped: {}", e);
                                first_error.get_or_insert(e);
                                break 'chunks;
                            }
                            Err(EmbedFailure::Failed(e)) => {
                                warn!("Skipping memory {}: {}", memory.id, e);
                                skipped += 1;
                                first_error.get_or_insert(e);
                            }
                        }
                    }
                }
            }
        }

        info!("Backfilled {} embeddings, skipped {}", embedded, skipped);
        match first_error {
            Some(e) if embedded == 0 => Err(e),
            _ => Ok(embedded),
        }
    }

    /// Store one backfilled vector; 1 if stored, 0 if the memory vanished
    fn store_vector(
        &self,
        provider: &dyn EmbeddingProvider,
        memory: &Memory,
        vector: Vec<f32>,
    ) -> CoreResult<usize> {
        match self.db.set_embedding(memory.id, provider.model(), vector) {
            Ok(_) => Ok(1),
            // Deleted while we were embedding
            Err(e) if e.is_not_found() => {
                debug!("Memory {} vanished during backfill", memory.id);
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    async fn embed_texts(
        &self,
        provider: &dyn EmbeddingProvider,
        texts: &[String],
        deadline: Option<Instant>,
    ) -> Result<Vec<Vec<f32>>, EmbedFailure> {
        let per_call = Instant::now() + self.timeout;
        let deadline = deadline.map_or(per_call, |d| d.min(per_call));

        let vectors = tokio::time::timeout_at(deadline, provider.embed_batch(texts))
            .await
            .map_err(|_| {
                EmbedFailure::TimedOut(CoreError::Provider(format!(
                    "Embedding request timed out after {:?}",
                    self.timeout
                )))
            })?
            .map_err(EmbedFailure::Failed)?;

        if vectors.len() != texts.len() {
            return Err(EmbedFailure::Failed(CoreError::Provider(format!(
                "Embedding provider returned {} vectors for {} inputs",
                vectors.len(),
                texts.len()
            ))));
        }
        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Embeds text as [length, vowel count]; counts inputs it has seen
    struct CountingProvider {
        inputs: AtomicUsize,
        fail: bool,
    }

    impl CountingProvider {
        fn new(fail: bool) -> Self {
            Self {
                inputs: AtomicUsize::new(0),
                fail,
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for CountingProvider {
        fn model(&self) -> &str {
            "counting-v1"
        }

        async fn embed_batch(&self, texts: &[String]) -> CoreResult<Vec<Vec<f32>>> {
            if self.fail {
                return Err(CoreError::Provider("offline".into()));
            }
            self.inputs.fetch_add(texts.len(), Ordering::SeqCst);
            Ok(texts
                .iter()
                .map(|t| {
                    let vowels = t.chars().filter(|c| "aeiou".contains(*c)).count();
                    vec![t.len() as f32, vowels as f32 + 1.0]
                })
                .collect())
        }
    }

    fn setup(provider: Arc<dyn EmbeddingProvider>, enabled: bool) -> (tempfile::TempDir, Arc<ChatDb>, MemoryManager) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(ChatDb::open(dir.path().join("chat.redb")).unwrap());
        let config = ChatConfig {
            embeddings_enabled: enabled,
            ..ChatConfig::default()
        };
        let manager = MemoryManager::new(db.clone(), Some(provider), &config);
        (dir, db, manager)
    }

    #[tokio::test]
    async fn test_add_embeds_eagerly() {
        let provider = Arc::new(CountingProvider::new(false));
        let (_dir, db, manager) = setup(provider.clone(), true);

        let memory = manager.add_memory("User lives in Lisbon").await.unwrap();
        let embedding = db.embedding(memory.id).unwrap().unwrap();
        assert_eq!(embedding.model, "counting-v1");
        assert_eq!(provider.inputs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_add_survives_provider_failure() {
        let provider = Arc::new(CountingProvider::new(true));
        let (_dir, db, manager) = setup(provider, true);

        let memory = manager.add_memory("User is vegetarian").await.unwrap();
        assert!(db.embedding(memory.id).unwrap().is_none());
        assert!(manager.reconcile_embeddings().await.is_err());
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let provider = Arc::new(CountingProvider::new(false));
        let (_dir, db, manager) = setup(provider.clone(), true);

        // Written straight to the store, so nothing is embedded yet
        db.add_memory("one").unwrap();
        db.add_memory("two").unwrap();

        assert_eq!(manager.reconcile_embeddings().await.unwrap(), 2);
        assert_eq!(manager.reconcile_embeddings().await.unwrap(), 0);
        assert_eq!(provider.inputs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_reconcile_replaces_other_model_vectors() {
        let provider = Arc::new(CountingProvider::new(false));
        let (_dir, db, manager) = setup(provider, true);

        let memory = db.add_memory("stale").unwrap();
        db.set_embedding(memory.id, "retired-model", vec![0.0; 8]).unwrap();

        assert_eq!(manager.reconcile_embeddings().await.unwrap(), 1);
        let embedding = db.embedding(memory.id).unwrap().unwrap();
        assert_eq!(embedding.model, "counting-v1");
        assert_eq!(embedding.dimensions(), 2);
    }

    #[tokio::test]
    async fn test_disabled_never_calls_provider() {
        let provider = Arc::new(CountingProvider::new(false));
        let (_dir, db, manager) = setup(provider.clone(), false);

        let memory = manager.add_memory("note").await.unwrap();
        assert!(!manager.embeddings_active());
        assert_eq!(manager.reconcile_embeddings().await.unwrap(), 0);
        assert!(db.embedding(memory.id).unwrap().is_none());
        assert_eq!(provider.inputs.load(Ordering::SeqCst), 0);
    }

    /// Rejects requests over `max_inputs` and any text containing "poison"
    struct PickyProvider {
        max_inputs: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for PickyProvider {
        fn model(&self) -> &str {
            "picky-v1"
        }

        async fn embed_batch(&self, texts: &[String]) -> CoreResult<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if texts.len() > self.max_inputs {
                return Err(CoreError::Provider(format!("too many inputs: {}", texts.len())));
            }
            if texts.iter().any(|t| t.contains("poison")) {
                return Err(CoreError::Provider("input rejected".into()));
            }
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    fn picky(max_inputs: usize) -> Arc<PickyProvider> {
        Arc::new(PickyProvider {
            max_inputs,
            calls: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_reconcile_recovers_from_batch_limit() {
        let provider = picky(3);
        let (_dir, db, manager) = setup(provider.clone(), true);

        for i in 0..5 {
            let memory = db.add_memory(&format!("fact {}", i)).unwrap();
            db.set_embedding(memory.id, "retired-model", vec![0.0; 4]).unwrap();
        }

        assert_eq!(manager.reconcile_embeddings().await.unwrap(), 5);
        assert!(db.memories_missing_embedding("picky-v1").unwrap().is_empty());
        assert_eq!(db.embedding_candidates("picky-v1").unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_rejected_input_only_holds_back_itself() {
        let provider = picky(100);
        let (_dir, db, manager) = setup(provider.clone(), true);

        db.add_memory("likes tea").unwrap();
        let bad = db.add_memory("poison pill").unwrap();
        db.add_memory("lives by the sea").unwrap();

        assert_eq!(manager.reconcile_embeddings().await.unwrap(), 2);
        let missing: Vec<_> = db
            .memories_missing_embedding("picky-v1")
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(missing, vec![bad.id]);

        // Only the rejected memory is retried, and with nothing embedded the pass errors
        assert!(manager.reconcile_embeddings().await.is_err());
    }

    #[tokio::test]
    async fn test_backfill_is_chunked() {
        let provider = picky(2);
        let (_dir, db, manager) = setup(provider.clone(), true);
        let manager = manager.with_batch_size(2);

        for i in 0..5 {
            db.add_memory(&format!("fact {}", i)).unwrap();
        }

        assert_eq!(manager.reconcile_embeddings().await.unwrap(), 5);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    /// Never answers within any reasonable deadline
    struct StalledProvider;

    #[async_trait]
    impl EmbeddingProvider for StalledProvider {
        fn model(&self) -> &str {
            "stalled-v1"
        }

        async fn embed_batch(&self, _texts: &[String]) -> CoreResult<Vec<Vec<f32>>> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn test_backfill_respects_deadline() {
        let (_dir, db, manager) = setup(Arc::new(StalledProvider), true);
        let manager = manager.with_batch_size(1);
        for i in 0..3 {
            db.add_memory(&format!("fact {}", i)).unwrap();
        }

        let started = Instant::now();
        let deadline = started + Duration::from_millis(100);
        assert!(manager.reconcile_embeddings_before(deadline).await.is_err());
        // One timeout ends the pass instead of waiting per chunk
        assert!(started.elapsed() < Duration::from_millis(250));
    }
}
