use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::storage::StoredFile;

/// Companion text sent with images shown to an agent's user
pub const DISPLAY_MESSAGE: &str = "ComfyUI displayed an image. All generated images are already plainly visible, so don't repeat the descriptions in detail. Do not list download links as they are available in the UI already. The user may download the images by clicking on them, but do not mention anything about downloading to the user.";

/// The only error text a caller ever sees
pub const ERROR_MESSAGE: &str = "Error making API request.";

/// One block of a multi-part agent message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image_url(url: impl Into<String>) -> Self {
        Self::ImageUrl {
            image_url: ImageUrl { url: url.into() },
        }
    }
}

/// Metadata attached to a persisted generation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileMetadata {
    pub negative_prompt: String,
    pub seed: u64,
    pub info: Option<String>,
}

/// Storage record plus the prompt that produced it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileRecord {
    #[serde(flatten)]
    pub file: StoredFile,
    pub prompt: String,
    pub metadata: FileMetadata,
}

/// Result of one invocation, before it is shaped for the caller
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    PlainMarkdown(String),
    AgentContentBlocks { text: Vec<ContentBlock>, image: ContentBlock },
    FileRecord(Box<FileRecord>),
    ErrorText(String),
}

impl ResponsePayload {
    pub fn error() -> Self {
        Self::ErrorText(ERROR_MESSAGE.to_owned())
    }

    pub fn markdown_image(public_url: &str) -> Self {
        Self::PlainMarkdown(format!("![generated image]({public_url})"))
    }
}

/// What the tool hands back to its caller
///
/// Agents get a `(text, artifact)` pair, direct calls the bare value.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    Direct(Value),
    Agent(Value, Value),
}

impl ToolOutput {
    /// Shape a payload for the caller; `None` is a generation whose result
    /// could not be persisted
    pub fn from_payload(payload: Option<ResponsePayload>, is_agent: bool) -> Self {
        let Some(payload) = payload else {
            return if is_agent {
                Self::Agent(Value::Null, json!({}))
            } else {
                Self::Direct(Value::Null)
            };
        };

        match payload {
            ResponsePayload::AgentContentBlocks { text, image } => {
                Self::Agent(to_json(&text), json!({ "content": [to_json(&image)] }))
            }
            ResponsePayload::FileRecord(record) => Self::Direct(to_json(&record)),
            ResponsePayload::PlainMarkdown(text) | ResponsePayload::ErrorText(text) if is_agent => {
                Self::Agent(Value::String(text), json!({}))
            }
            ResponsePayload::PlainMarkdown(text) | ResponsePayload::ErrorText(text) => Self::Direct(Value::String(text)),
        }
    }

    /// Flatten into one JSON value; agent pairs become two-element arrays
    pub fn into_value(self) -> Value {
        match self {
            Self::Direct(value) => value,
            Self::Agent(text, artifact) => Value::Array(vec![text, artifact]),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Direct(value) => value.as_str(),
            Self::Agent(..) => None,
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|e| {
        tracing::error!(error = %e, "failed to serialize tool output");
        Value::Null
    })
}
