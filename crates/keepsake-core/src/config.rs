//! ============================================================================
//! Chat Configuration - Immutable settings read once at startup
//! ============================================================================
//! Values come from `CHATBOT_*` / `OPENAI_*` environment variables. The
//! resulting `ChatConfig` is handed to each component at construction and
//! never re-read afterwards.
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::types::{CoreError, CoreResult};

pub const DEFAULT_CHAT_MODEL: &str = "gpt-4o";
pub const DEFAULT_CHAT_API_URL: &str = "https://api.openai.com/v1/responses";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
pub const DEFAULT_EMBEDDINGS_API_URL: &str = "https://api.openai.com/v1/embeddings";
pub const DEFAULT_MAX_HISTORY: usize = 50;
pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 800;
pub const DEFAULT_TOP_K: usize = 6;
pub const DEFAULT_FALLBACK_MEMORY_CHARS: usize = 8000;
pub const DEFAULT_EMBEDDING_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_CHAT_TIMEOUT_SECS: u64 = 90;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful personal assistant.\n\n\
The blocks labelled as long-term memories are facts the user asked you to remember. \
Use them to personalize responses. If they are irrelevant, ignore them.";

/// Process-wide chat settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    pub chat_model: String,
    pub chat_api_url: String,
    pub embedding_model: String,
    pub embeddings_api_url: String,
    pub embeddings_enabled: bool,
    /// Memories injected when ranking succeeds, at least 1
    pub top_k: usize,
    /// Recent messages replayed from the conversation
    pub max_history: usize,
    pub max_output_tokens: u32,
    /// Character budget for memory bodies on the fallback path
    pub fallback_memory_chars: usize,
    pub embedding_timeout: Duration,
    pub chat_timeout: Duration,
    /// Database file; `None` means `~/.keepsake/keepsake.redb`
    pub db_path: Option<PathBuf>,
    pub system_prompt: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            chat_model: DEFAULT_CHAT_MODEL.to_string(),
            chat_api_url: DEFAULT_CHAT_API_URL.to_string(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            embeddings_api_url: DEFAULT_EMBEDDINGS_API_URL.to_string(),
            embeddings_enabled: true,
            top_k: DEFAULT_TOP_K,
            max_history: DEFAULT_MAX_HISTORY,
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
            fallback_memory_chars: DEFAULT_FALLBACK_MEMORY_CHARS,
            embedding_timeout: Duration::from_secs(DEFAULT_EMBEDDING_TIMEOUT_SECS),
            chat_timeout: Duration::from_secs(DEFAULT_CHAT_TIMEOUT_SECS),
            db_path: None,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

impl ChatConfig {
    /// Build the configuration from the process environment
    pub fn from_env() -> CoreResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    /// Unset or blank keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> CoreResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut config = Self::default();

        if let Some(v) = get("OPENAI_MODEL") {
            config.chat_model = v;
        }
        if let Some(v) = get("OPENAI_API_URL") {
            config.chat_api_url = v;
        }
        if let Some(v) = get("CHATBOT_EMBEDDING_MODEL") {
            config.embedding_model = v;
        }
        if let Some(v) = get("OPENAI_EMBEDDINGS_URL") {
            config.embeddings_api_url = v;
        }
        if let Some(v) = get("CHATBOT_USE_EMBEDDINGS") {
            config.embeddings_enabled = parse_flag(&v);
        }
        if let Some(v) = get("CHATBOT_EMBEDDINGS_TOP_K") {
            config.top_k = parse_number::<usize>("CHATBOT_EMBEDDINGS_TOP_K", &v)?.max(1);
        }
        if let Some(v) = get("CHATBOT_MAX_HISTORY") {
            config.max_history = parse_number("CHATBOT_MAX_HISTORY", &v)?;
        }
        if let Some(v) = get("CHATBOT_MAX_OUTPUT_TOKENS") {
            config.max_output_tokens = parse_number("CHATBOT_MAX_OUTPUT_TOKENS", &v)?;
        }
        if let Some(v) = get("CHATBOT_MEMORY_CHAR_CAP") {
            config.fallback_memory_chars = parse_number("CHATBOT_MEMORY_CHAR_CAP", &v)?;
        }
        if let Some(v) = get("CHATBOT_EMBEDDING_TIMEOUT_SECS") {
            let secs: u64 = parse_number("CHATBOT_EMBEDDING_TIMEOUT_SECS", &v)?;
            config.embedding_timeout = Duration::from_secs(secs);
        }
        if let Some(v) = get("CHATBOT_DB") {
            config.db_path = Some(PathBuf::from(v));
        }

        Ok(config)
    }

    /// Database path, falling back to ~/.keepsake/keepsake.redb
    pub fn resolve_db_path(&self) -> CoreResult<PathBuf> {
        if let Some(path) = &self.db_path {
            return Ok(path.clone());
        }

        let home = dirs::home_dir()
            .ok_or_else(|| CoreError::Storage("Cannot determine home directory".into()))?;
        let dir = home.join(".keepsake");
        std::fs::create_dir_all(&dir).map_err(|e| {
            CoreError::Storage(format!("Failed to create {}: {}", dir.display(), e))
        })?;
        Ok(dir.join("keepsake.redb"))
    }
}

/// Anything other than 0/false/no (any case) counts as enabled
fn parse_flag(value: &str) -> bool {
    !matches!(value.to_lowercase().as_str(), "0" | "false" | "no")
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> CoreResult<T> {
    value
        .parse()
        .map_err(|_| CoreError::InvalidInput(format!("{} must be a non-negative integer, got '{}'", key, value)))
}
