//! ============================================================================
//! Core Types - Roles, content parts, attachments and errors
//! ============================================================================

use serde::{Deserialize, Serialize};

/// Identifier of a stored memory. Assigned monotonically, never reused.
pub type MemoryId = u64;

/// Result alias used across the core
pub type CoreResult<T> = std::result::Result<T, CoreError>;

/// Who authored a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One part of a message body.
///
/// Images and file text are opaque payloads: the core only positions and
/// forwards them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentPart {
    Text(String),
    Image { url: String },
    FileText { name: String, text: String },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text(text.into())
    }

    /// Text carried by this part, if any
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentPart::Text(text) => Some(text),
            ContentPart::FileText { text, .. } => Some(text),
            ContentPart::Image { .. } => None,
        }
    }
}

/// Non-text content attached to a user turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Attachment {
    /// Image reference: a `data:image/...` URL or an http(s) URL
    Image { url: String },
    /// Text already extracted from an uploaded file
    File { name: String, text: String },
}

impl Attachment {
    /// Validate the attachment and turn it into a content part
    pub fn into_part(self) -> CoreResult<ContentPart> {
        match self {
            Attachment::Image { url } => {
                let url = url.trim();
                let recognised = url.starts_with("data:image/")
                    || url.starts_with("https://")
                    || url.starts_with("http://");
                if !recognised {
                    return Err(CoreError::InvalidInput(
                        "Image attachment must be a data:image URL or an http(s) URL".into(),
                    ));
                }
                Ok(ContentPart::Image {
                    url: url.to_string(),
                })
            }
            Attachment::File { name, text } => {
                let name = name.trim();
                let name = if name.is_empty() { "file" } else { name };
                Ok(ContentPart::FileText {
                    name: name.to_string(),
                    text,
                })
            }
        }
    }
}

/// Error types for the chat core
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoreError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Embedding for memory {memory_id} has {actual} dimensions, query has {expected}")]
    DimensionMismatch {
        memory_id: MemoryId,
        expected: usize,
        actual: usize,
    },

    #[error("Storage error: {0}")]
    Storage(String),
}

impl CoreError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        CoreError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CoreError::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_attachment_validation() {
        let ok = Attachment::Image {
            url: "data:image/png;base64,AAAA".into(),
        };
        assert!(matches!(ok.into_part(), Ok(ContentPart::Image { .. })));

        let bad = Attachment::Image { url: "   ".into() };
        assert!(matches!(bad.into_part(), Err(CoreError::InvalidInput(_))));

        let bad_scheme = Attachment::Image {
            url: "file:///etc/passwd".into(),
        };
        assert!(bad_scheme.into_part().is_err());
    }

    #[test]
    fn test_file_attachment_defaults_name() {
        let part = Attachment::File {
            name: "".into(),
            text: "notes".into(),
        }
        .into_part()
        .unwrap();
        assert_eq!(
            part,
            ContentPart::FileText {
                name: "file".into(),
                text: "notes".into()
            }
        );
    }

    #[test]
    fn test_not_found_display() {
        let err = CoreError::not_found("Memory", 42);
        assert_eq!(err.to_string(), "Memory not found: 42");
        assert!(err.is_not_found());
    }
}
