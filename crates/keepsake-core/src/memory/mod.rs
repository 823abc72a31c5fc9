//! ============================================================================
//! Memory Module - Long-term memories and their embeddings
//! ============================================================================
//! Memories are short facts the user wants carried into every conversation.
//! Each one may carry a vector from the configured embedding model, which the
//! ranker scores against the query at turn time.
//!
//! ## Architecture
//! ```text
//! add_memory → store → embed (eager, best effort)
//!                          ↓
//! turn start → reconcile_embeddings (backfill missing / other-model vectors)
//!                          ↓
//! query → embed → rank (cosine, top-k) → memory blocks
//! ```
//!
//! ## Usage
//! ```rust,ignore
//! use keepsake_core::memory::{MemoryManager, OpenAiEmbeddings};
//!
//! let embeddings = OpenAiEmbeddings::new(api_key, url, model, timeout)?;
//! let manager = MemoryManager::new(db, Some(Arc::new(embeddings)), &config);
//!
//! manager.add_memory("User is vegetarian").await?;
//! manager.reconcile_embeddings().await?;
//! ```
//! ============================================================================

mod embeddings;
mod manager;
pub mod ranker;

// Re-export public types
pub use embeddings::{EmbeddingProvider, OpenAiEmbeddings};
pub use manager::MemoryManager;
pub use ranker::{cosine_similarity, rank, Ranking, ScoredMemory};
