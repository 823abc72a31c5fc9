//! ============================================================================
//! Context Assembler - Builds the content blocks sent to the model
//! ============================================================================
//! ```text
//! [System instructions]
//!   + [Memories]   top-k by cosine similarity, or all memories (newest first,
//!                  capped) when ranking is unavailable
//!   + [History]    last N messages of the conversation, oldest first
//!   + [User turn]  text plus attachment parts
//! ```
//! The assembler reads no global state and touches no storage: given the same
//! memories, embeddings, history and configuration it produces the same
//! blocks. The only live dependency is the embedding call for the query,
//! whose failure selects the fallback path instead of failing the turn.
//! ============================================================================

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ChatConfig;
use crate::db::{Memory, MemoryEmbedding, Message};
use crate::memory::{rank, EmbeddingProvider};
use crate::types::{Attachment, ContentPart, CoreError, CoreResult, MemoryId, Role};

/// Text embedded for the query when a turn carries only attachments
pub const ATTACHMENT_QUERY: &str = "Attachment upload";

/// What a block holds
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum BlockKind {
    System,
    Memory { id: MemoryId },
    History { position: u64 },
    UserMessage,
}

/// One labelled unit of the model request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContentBlock {
    #[serde(flatten)]
    pub kind: BlockKind,
    pub role: Role,
    pub parts: Vec<ContentPart>,
}

impl ContentBlock {
    /// Text parts joined with blank lines
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(ContentPart::as_text)
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Why the ranked path was not used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    /// Embeddings switched off or no provider configured
    Disabled,
    /// No memory has an embedding from the current model yet
    NoEmbeddings,
    /// The query embedding failed or timed out
    ProviderFailed,
    /// Every candidate was excluded (dimension mismatch)
    NoUsableCandidates,
}

impl std::fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            FallbackReason::Disabled => "embeddings disabled",
            FallbackReason::NoEmbeddings => "no memory embeddings yet",
            FallbackReason::ProviderFailed => "embedding provider failed",
            FallbackReason::NoUsableCandidates => "no usable memory embeddings",
        };
        f.write_str(text)
    }
}

/// Which memory selection path produced the context
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "path")]
pub enum Retrieval {
    Ranked {
        candidates: usize,
        excluded: usize,
    },
    Fallback {
        reason: FallbackReason,
        /// Oldest memories left out by the size cap
        dropped: usize,
    },
}

/// Assembled request context for one turn
#[derive(Debug, Clone, Serialize)]
pub struct TurnContext {
    pub blocks: Vec<ContentBlock>,
    /// Memory ids injected, in block order
    pub included_memory_ids: Vec<MemoryId>,
    pub retrieval: Retrieval,
}

impl TurnContext {
    /// Parts of the final user block, for persisting the user message
    pub fn user_parts(&self) -> &[ContentPart] {
        self.blocks
            .last()
            .map(|block| block.parts.as_slice())
            .unwrap_or(&[])
    }
}

/// Validate a user turn and turn it into content parts
pub fn user_parts(text: &str, attachments: Vec<Attachment>) -> CoreResult<Vec<ContentPart>> {
    let mut parts = Vec::with_capacity(attachments.len() + 1);
    let text = text.trim();
    if !text.is_empty() {
        parts.push(ContentPart::text(text));
    }
    for attachment in attachments {
        parts.push(attachment.into_part()?);
    }
    if parts.is_empty() {
        return Err(CoreError::InvalidInput(
            "A turn needs message text or at least one attachment".into(),
        ));
    }
    Ok(parts)
}

/// Builds per-turn context from memories, embeddings and history
pub struct ContextAssembler {
    config: Arc<ChatConfig>,
    embeddings: Option<Arc<dyn EmbeddingProvider>>,
}

impl ContextAssembler {
    pub fn new(config: Arc<ChatConfig>, embeddings: Option<Arc<dyn EmbeddingProvider>>) -> Self {
        let embeddings = if config.embeddings_enabled {
            embeddings
        } else {
            None
        };
        Self { config, embeddings }
    }

    /// Assemble the blocks for one turn.
    ///
    /// `memories` is the full memory set (any order). `candidates` pairs each
    /// memory with its current-model embedding, oldest first, as returned by
    /// `ChatDb::embedding_candidates`. `history` is the recent window of the
    /// active conversation in position order.
    pub async fn assemble(
        &self,
        memories: &[Memory],
        candidates: &[(Memory, MemoryEmbedding)],
        history: Vec<Message>,
        user_text: &str,
        attachments: Vec<Attachment>,
    ) -> CoreResult<TurnContext> {
        let deadline = Instant::now() + self.config.embedding_timeout;
        self.assemble_before(deadline, memories, candidates, history, user_text, attachments)
            .await
    }

    /// `assemble` with the query embedding bounded by `deadline` instead of
    /// a fresh embedding timeout
    pub async fn assemble_before(
        &self,
        deadline: Instant,
        memories: &[Memory],
        candidates: &[(Memory, MemoryEmbedding)],
        history: Vec<Message>,
        user_text: &str,
        attachments: Vec<Attachment>,
    ) -> CoreResult<TurnContext> {
        let user = user_parts(user_text, attachments)?;

        let mut blocks = vec![ContentBlock {
            kind: BlockKind::System,
            role: Role::System,
            parts: vec![ContentPart::text(self.config.system_prompt.clone())],
        }];

        let query = match user_text.trim() {
            "" => ATTACHMENT_QUERY,
            text => text,
        };
        let (selected, retrieval) = self
            .select_memories(memories, candidates, query, deadline)
            .await;

        let included_memory_ids: Vec<MemoryId> = selected.iter().map(|m| m.id).collect();
        blocks.extend(selected.into_iter().map(memory_block));

        let skip = history.len().saturating_sub(self.config.max_history);
        blocks.extend(history.into_iter().skip(skip).map(|message| ContentBlock {
            kind: BlockKind::History {
                position: message.position,
            },
            role: message.role,
            parts: message.parts,
        }));

        blocks.push(ContentBlock {
            kind: BlockKind::UserMessage,
            role: Role::User,
            parts: user,
        });

        debug!(
            "Assembled {} blocks with {} memories ({:?})",
            blocks.len(),
            included_memory_ids.len(),
            retrieval
        );

        Ok(TurnContext {
            blocks,
            included_memory_ids,
            retrieval,
        })
    }

    async fn select_memories<'m>(
        &self,
        memories: &'m [Memory],
        candidates: &'m [(Memory, MemoryEmbedding)],
        query: &str,
        deadline: Instant,
    ) -> (Vec<&'m Memory>, Retrieval) {
        let provider = match &self.embeddings {
            Some(provider) => provider,
            None => return self.fallback(memories, FallbackReason::Disabled),
        };

        if candidates.is_empty() {
            return self.fallback(memories, FallbackReason::NoEmbeddings);
        }

        let query_vector = match tokio::time::timeout_at(deadline, provider.embed(query)).await {
            Ok(Ok(vector)) => vector,
            Ok(Err(e)) => {
                warn!("Query embedding failed, including all memories: {}", e);
                return self.fallback(memories, FallbackReason::ProviderFailed);
            }
            Err(_) => {
                warn!("Query embedding ran past its deadline, including all memories");
                return self.fallback(memories, FallbackReason::ProviderFailed);
            }
        };

        let ranking = rank(
            &query_vector,
            candidates
                .iter()
                .map(|(memory, embedding)| (memory.id, embedding.vector.as_slice())),
            self.config.top_k.max(1),
        );

        if ranking.hits.is_empty() && !ranking.excluded.is_empty() {
            warn!(
                "All {} memory embeddings were excluded, including all memories",
                ranking.excluded.len()
            );
            return self.fallback(memories, FallbackReason::NoUsableCandidates);
        }

        info!(
            "Selected {} of {} memories by similarity",
            ranking.hits.len(),
            candidates.len()
        );

        let by_id: HashMap<MemoryId, &Memory> =
            candidates.iter().map(|(memory, _)| (memory.id, memory)).collect();
        let selected = ranking
            .hits
            .iter()
            .filter_map(|hit| by_id.get(&hit.id).copied())
            .collect();
        let retrieval = Retrieval::Ranked {
            candidates: candidates.len(),
            excluded: ranking.excluded.len(),
        };
        (selected, retrieval)
    }

    /// All memories newest first, cut from the oldest end at the size cap
    fn fallback<'m>(&self, memories: &'m [Memory], reason: FallbackReason) -> (Vec<&'m Memory>, Retrieval) {
        let mut newest_first: Vec<&Memory> = memories.iter().collect();
        newest_first.sort_by(|a, b| b.id.cmp(&a.id));

        let (kept, dropped) = within_cap(newest_first, self.config.fallback_memory_chars);
        if dropped > 0 {
            info!(
                "Memory cap of {} chars dropped {} oldest memories",
                self.config.fallback_memory_chars, dropped
            );
        }
        debug!("Fallback memory selection: {}", reason);

        (kept, Retrieval::Fallback { reason, dropped })
    }
}

/// Keep whole memories, in order, until the next one would exceed `cap` chars
fn within_cap(memories: Vec<&Memory>, cap: usize) -> (Vec<&Memory>, usize) {
    let total = memories.len();
    let mut used = 0;
    let mut kept = Vec::new();
    for memory in memories {
        let size = memory.content.chars().count();
        if used + size > cap {
            break;
        }
        used += size;
        kept.push(memory);
    }
    let dropped = total - kept.len();
    (kept, dropped)
}

fn memory_block(memory: &Memory) -> ContentBlock {
    ContentBlock {
        kind: BlockKind::Memory { id: memory.id },
        role: Role::System,
        parts: vec![ContentPart::text(format!(
            "Long-term memory #{}: {}",
            memory.id, memory.content
        ))],
    }
}
