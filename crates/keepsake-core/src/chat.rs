//! ============================================================================
//! Chat Client - Responses API calls for assembled turns
//! ============================================================================
//! Maps `ContentBlock`s onto the Responses API `input` array and pulls the
//! first output text back out. The engine talks to it through `ChatModel`
//! so tests can substitute a scripted model.
//! ============================================================================

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::config::ChatConfig;
use crate::context::ContentBlock;
use crate::types::{ContentPart, CoreError, CoreResult, Role};

/// Produces the assistant reply for a fully assembled turn
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, blocks: &[ContentBlock]) -> CoreResult<String>;
}

/// Client for OpenAI-compatible Responses APIs
pub struct ChatClient {
    client: Client,
    api_key: String,
    url: String,
    model: String,
    max_output_tokens: u32,
}

impl ChatClient {
    pub fn new(api_key: String, config: &ChatConfig) -> CoreResult<Self> {
        if api_key.trim().is_empty() {
            return Err(CoreError::InvalidInput("Chat API key is empty".into()));
        }

        let client = Client::builder()
            .timeout(config.chat_timeout)
            .build()
            .map_err(|e| CoreError::Provider(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key,
            url: config.chat_api_url.clone(),
            model: config.chat_model.clone(),
            max_output_tokens: config.max_output_tokens,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Request body for the given blocks
    pub fn build_request(&self, blocks: &[ContentBlock]) -> Value {
        json!({
            "model": self.model,
            "input": blocks.iter().map(input_item).collect::<Vec<_>>(),
            "max_output_tokens": self.max_output_tokens,
        })
    }
}

#[async_trait]
impl ChatModel for ChatClient {
    async fn complete(&self, blocks: &[ContentBlock]) -> CoreResult<String> {
        let request = self.build_request(blocks);
        debug!("Calling {} with {} input items", self.model, blocks.len());

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| CoreError::Provider(format!("Failed to call chat API: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| CoreError::Provider(format!("Failed to read chat response: {}", e)))?;

        if !status.is_success() {
            return Err(CoreError::Provider(format!("Chat API error ({}): {}", status, body)));
        }

        let value: Value = serde_json::from_str(&body)
            .map_err(|e| CoreError::Provider(format!("Chat API returned invalid JSON: {}", e)))?;

        let text = extract_output_text(&value).ok_or_else(|| {
            CoreError::Provider(format!("Unexpected chat response format: {}", body))
        })?;

        info!("Received {} chars from {}", text.len(), self.model);
        Ok(text)
    }
}

fn input_item(block: &ContentBlock) -> Value {
    let content: Vec<Value> = block
        .parts
        .iter()
        .map(|part| match part {
            ContentPart::Text(text) => text_entry(block.role, text),
            ContentPart::FileText { name, text } => {
                text_entry(block.role, &format!("[File: {}]\n{}", name, text))
            }
            ContentPart::Image { url } => json!({ "type": "input_image", "image_url": url }),
        })
        .collect();

    json!({ "role": block.role.as_str(), "content": content })
}

fn text_entry(role: Role, text: &str) -> Value {
    let kind = match role {
        Role::Assistant => "output_text",
        Role::User | Role::System => "input_text",
    };
    json!({ "type": kind, "text": text })
}

/// First text found in the response's `output` messages
pub fn extract_output_text(response: &Value) -> Option<String> {
    response
        .get("output")?
        .as_array()?
        .iter()
        .filter_map(|item| item.get("content")?.as_array())
        .flatten()
        .find_map(|entry| {
            let kind = entry.get("type").and_then(Value::as_str);
            match kind {
                None | Some("output_text") => entry.get("text")?.as_str().map(str::to_string),
                Some(_) => None,
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::BlockKind;

    fn client() -> ChatClient {
        ChatClient::new("sk-test".into(), &ChatConfig::default()).unwrap()
    }

    #[test]
    fn test_request_shape() {
        let blocks = vec![
            ContentBlock {
                kind: BlockKind::System,
                role: Role::System,
                parts: vec![ContentPart::text("be brief")],
            },
            ContentBlock {
                kind: BlockKind::History { position: 2 },
                role: Role::Assistant,
                parts: vec![ContentPart::text("earlier reply")],
            },
            ContentBlock {
                kind: BlockKind::UserMessage,
                role: Role::User,
                parts: vec![
                    ContentPart::text("what is this?"),
                    ContentPart::Image {
                        url: "data:image/png;base64,AAAA".into(),
                    },
                    ContentPart::FileText {
                        name: "notes.txt".into(),
                        text: "hello".into(),
                    },
                ],
            },
        ];

        let request = client().build_request(&blocks);
        assert_eq!(request["model"], "gpt-4o");
        assert_eq!(request["max_output_tokens"], 800);

        let input = request["input"].as_array().unwrap();
        assert_eq!(input.len(), 3);
        assert_eq!(input[0]["role"], "system");
        assert_eq!(input[1]["content"][0]["type"], "output_text");

        let user = &input[2]["content"];
        assert_eq!(user[0]["type"], "input_text");
        assert_eq!(user[1]["image_url"], "data:image/png;base64,AAAA");
        assert_eq!(user[2]["text"], "[File: notes.txt]\nhello");
    }

    #[test]
    fn test_extract_output_text() {
        let response = json!({
            "output": [
                {"type": "reasoning", "summary": []},
                {"type": "message", "content": [{"type": "output_text", "text": "Try a lentil curry."}]}
            ]
        });
        assert_eq!(extract_output_text(&response).as_deref(), Some("Try a lentil curry."));

        assert!(extract_output_text(&json!({"output": []})).is_none());
        assert!(extract_output_text(&json!({"error": "nope"})).is_none());
    }

    #[test]
    fn test_empty_key_rejected() {
        assert!(ChatClient::new("".into(), &ChatConfig::default()).is_err());
    }
}
