//! ============================================================================
//! KEEPSAKE-CORE: Memory-aware chat assistant
//! ============================================================================
//! This crate handles all backend logic for the keepsake assistant:
//! - Conversation and message storage in an embedded redb database
//! - Long-term memories with per-model embeddings
//! - Cosine ranking of memories against the user's turn
//! - Context assembly (system, memories, history, user turn)
//! - Responses API client for the assistant reply
//! ============================================================================

pub mod chat;
pub mod config;
pub mod context;
pub mod db;
pub mod engine;
pub mod memory;
pub mod types;

// Re-export main types for convenience
pub use types::*;
pub use chat::{ChatClient, ChatModel};
pub use config::ChatConfig;
pub use context::{
    BlockKind, ContentBlock, ContextAssembler, FallbackReason, Retrieval, TurnContext,
    ATTACHMENT_QUERY,
};
pub use db::{ChatDb, Conversation, DbStats, Memory, MemoryEmbedding, Message, NewMessage};
pub use engine::{ChatEngine, TurnReply};
pub use memory::{EmbeddingProvider, MemoryManager, OpenAiEmbeddings};
