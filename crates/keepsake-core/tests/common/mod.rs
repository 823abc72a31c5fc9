//! Shared test utilities for keepsake-core integration tests.
//!
//! Provides deterministic embedding providers and a scripted chat model so
//! the pipeline can be exercised without network access.

#![allow(dead_code)]

use async_trait::async_trait;
use keepsake_core::{
    ChatConfig, ChatDb, ChatEngine, ChatModel, ContentBlock, CoreError, CoreResult,
    EmbeddingProvider,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

const FOOD: &[&str] = &["cook", "dinner", "vegetarian", "eat", "food", "meal"];
const PETS: &[&str] = &["dog", "rex", "cat", "pet"];
const PLACES: &[&str] = &["lisbon", "lives", "live", "city"];

/// Keyword embedder with three topic axes (food, pets, places).
/// Every axis starts at 1.0 and each keyword adds 1.0, so vectors are
/// small integers, scores are exact and equal scores really tie.
pub struct TopicEmbedder {
    seen: Mutex<Vec<String>>,
}

impl TopicEmbedder {
    pub fn new() -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Every text this embedder was asked to embed, in call order
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }

    pub fn vector(text: &str) -> Vec<f32> {
        let mut vector = vec![1.0f32; 3];
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            for (axis, words) in [FOOD, PETS, PLACES].iter().enumerate() {
                if words.contains(&token) {
                    vector[axis] += 1.0;
                }
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for TopicEmbedder {
    fn model(&self) -> &str {
        "topic-v1"
    }

    async fn embed_batch(&self, texts: &[String]) -> CoreResult<Vec<Vec<f32>>> {
        self.seen.lock().unwrap().extend(texts.iter().cloned());
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }
}

/// Always errors, as if the service were unreachable
pub struct FailingEmbedder {
    pub model: &'static str,
}

#[async_trait]
impl EmbeddingProvider for FailingEmbedder {
    fn model(&self) -> &str {
        self.model
    }

    async fn embed_batch(&self, _texts: &[String]) -> CoreResult<Vec<Vec<f32>>> {
        Err(CoreError::Provider("connection refused".into()))
    }
}

/// Same vectors and model as `TopicEmbedder`, but rejects any request
/// carrying more than `max_inputs` texts
pub struct LimitedEmbedder {
    pub max_inputs: usize,
    pub calls: AtomicUsize,
}

impl LimitedEmbedder {
    pub fn new(max_inputs: usize) -> Self {
        Self {
            max_inputs,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for LimitedEmbedder {
    fn model(&self) -> &str {
        "topic-v1"
    }

    async fn embed_batch(&self, texts: &[String]) -> CoreResult<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if texts.len() > self.max_inputs {
            return Err(CoreError::Provider(format!(
                "Embeddings API error (400): at most {} inputs per request",
                self.max_inputs
            )));
        }
        Ok(texts.iter().map(|t| TopicEmbedder::vector(t)).collect())
    }
}

/// Answers correctly but only after `delay`
pub struct SlowEmbedder {
    pub delay: Duration,
}

#[async_trait]
impl EmbeddingProvider for SlowEmbedder {
    fn model(&self) -> &str {
        "slow-v1"
    }

    async fn embed_batch(&self, texts: &[String]) -> CoreResult<Vec<Vec<f32>>> {
        tokio::time::sleep(self.delay).await;
        Ok(texts.iter().map(|t| TopicEmbedder::vector(t)).collect())
    }
}

/// Chat model returning a fixed reply (or error) and counting calls
pub struct ScriptedModel {
    reply: Option<String>,
    pub calls: AtomicUsize,
    pub last_block_count: AtomicUsize,
}

impl ScriptedModel {
    pub fn replying(reply: &str) -> Self {
        Self {
            reply: Some(reply.to_string()),
            calls: AtomicUsize::new(0),
            last_block_count: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            reply: None,
            calls: AtomicUsize::new(0),
            last_block_count: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn complete(&self, blocks: &[ContentBlock]) -> CoreResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.last_block_count.store(blocks.len(), Ordering::SeqCst);
        self.reply
            .clone()
            .ok_or_else(|| CoreError::Provider("Chat API error (500): upstream".into()))
    }
}

/// Engine over a fresh database in `dir`
pub fn engine(
    dir: &TempDir,
    embeddings: Option<Arc<dyn EmbeddingProvider>>,
    configure: impl FnOnce(&mut ChatConfig),
) -> ChatEngine {
    let mut config = ChatConfig::default();
    configure(&mut config);
    let db = ChatDb::open(dir.path().join("keepsake.redb")).unwrap();
    ChatEngine::new(config, db, embeddings)
}
