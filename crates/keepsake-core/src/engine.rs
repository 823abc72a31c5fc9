//! ============================================================================
//! Chat Engine - One object wiring storage, memories, context and the model
//! ============================================================================
//! A turn runs as:
//! ```text
//! validate → reconcile embeddings → load memories + candidates + history → assemble
//!          → model call → persist user + assistant messages
//! ```
//! Nothing is written for a turn until the model has answered, so a failed
//! call leaves the conversation exactly as it was.
//! ============================================================================

use std::sync::Arc;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::chat::ChatModel;
use crate::config::ChatConfig;
use crate::context::{ContextAssembler, TurnContext};
use crate::db::{ChatDb, Conversation, DbStats, Message, NewMessage};
use crate::memory::{EmbeddingProvider, MemoryManager};
use crate::types::{Attachment, ContentPart, CoreError, CoreResult, Role};

/// Result of a completed turn
#[derive(Debug, Clone)]
pub struct TurnReply {
    pub context: TurnContext,
    pub user_message: Message,
    pub assistant_message: Message,
}

impl TurnReply {
    pub fn text(&self) -> String {
        self.assistant_message.text()
    }
}

pub struct ChatEngine {
    config: Arc<ChatConfig>,
    db: Arc<ChatDb>,
    memory: MemoryManager,
    assembler: ContextAssembler,
    model: Option<Arc<dyn ChatModel>>,
}

impl ChatEngine {
    pub fn new(
        config: ChatConfig,
        db: ChatDb,
        embeddings: Option<Arc<dyn EmbeddingProvider>>,
    ) -> Self {
        let config = Arc::new(config);
        let db = Arc::new(db);
        let memory = MemoryManager::new(db.clone(), embeddings.clone(), &config);
        let assembler = ContextAssembler::new(config.clone(), embeddings);

        Self {
            config,
            db,
            memory,
            assembler,
            model: None,
        }
    }

    /// Attach the model used by `send`
    pub fn with_model(mut self, model: Arc<dyn ChatModel>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    pub fn db(&self) -> &ChatDb {
        &self.db
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    // ========================================================================
    // Turns
    // ========================================================================

    /// Build the context for a user turn without calling the model or
    /// writing anything except backfilled embeddings.
    pub async fn handle_turn(
        &self,
        conversation_id: &str,
        user_text: &str,
        attachments: Vec<Attachment>,
    ) -> CoreResult<TurnContext> {
        if conversation_id.trim().is_empty() {
            return Err(CoreError::InvalidInput("Conversation id is empty".into()));
        }

        // Backfill and the query embedding share one budget
        let deadline = Instant::now() + self.config.embedding_timeout;
        if let Err(e) = self.memory.reconcile_embeddings_before(deadline).await {
            warn!("Embedding backfill failed, continuing with stored vectors: {}", e);
        }

        let memories = self.db.list_memories()?;
        let candidates = match self.memory.embedding_model() {
            Some(model) => self.db.embedding_candidates(model)?,
            None => Vec::new(),
        };
        let history = self.db.recent(conversation_id, self.config.max_history)?;

        self.assembler
            .assemble_before(deadline, &memories, &candidates, history, user_text, attachments)
            .await
    }

    /// Run a full turn: assemble, ask the model, then persist both messages
    pub async fn send(
        &self,
        conversation_id: &str,
        user_text: &str,
        attachments: Vec<Attachment>,
    ) -> CoreResult<TurnReply> {
        let model = self.model.as_ref().ok_or_else(|| {
            CoreError::InvalidInput("No chat model configured (set OPENAI_API_KEY)".into())
        })?;

        let context = self.handle_turn(conversation_id, user_text, attachments).await?;
        let reply = match model.complete(&context.blocks).await {
            Ok(reply) => reply,
            Err(e) => {
                error!("Chat completion failed, turn not recorded: {}", e);
                return Err(e);
            }
        };

        let (user_message, assistant_message) =
            self.record_exchange(conversation_id, context.user_parts().to_vec(), &reply)?;

        Ok(TurnReply {
            context,
            user_message,
            assistant_message,
        })
    }

    /// Append a user message and the assistant's reply
    pub fn record_exchange(
        &self,
        conversation_id: &str,
        user_parts: Vec<ContentPart>,
        reply: &str,
    ) -> CoreResult<(Message, Message)> {
        let user = self
            .db
            .append(conversation_id, NewMessage::new(Role::User, user_parts))?;
        let assistant = self
            .db
            .append(conversation_id, NewMessage::assistant(reply))?;
        Ok((user, assistant))
    }

    // ========================================================================
    // Conversations
    // ========================================================================

    pub fn create_conversation(&self, title: Option<&str>) -> CoreResult<Conversation> {
        let conversation = self.db.create_conversation(title)?;
        info!("Started conversation {}", conversation.id);
        Ok(conversation)
    }

    /// Conversations, most recently active first
    pub fn list_conversations(&self) -> CoreResult<Vec<Conversation>> {
        self.db.list_conversations()
    }

    /// Header plus the full transcript in position order
    pub fn open_conversation(&self, conversation_id: &str) -> CoreResult<(Conversation, Vec<Message>)> {
        let conversation = self.db.conversation(conversation_id)?;
        let messages = self.db.messages(conversation_id)?;
        Ok((conversation, messages))
    }

    pub fn rename_conversation(&self, conversation_id: &str, title: &str) -> CoreResult<Conversation> {
        self.db.rename_conversation(conversation_id, title)
    }

    pub fn stats(&self) -> CoreResult<DbStats> {
        self.db.stats()
    }
}
