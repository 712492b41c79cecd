use serde::{ Deserialize, Serialize };

use super::chat::{ ChatMessage, Role };

pub const DEFAULT_INSTRUCTIONS: &str =
    "You are a helpful assistant. Answer the user's questions. Shortly.";

/// One history entry as sent upstream: just role and content.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl From<&ChatMessage> for ChatTurn {
    fn from(msg: &ChatMessage) -> Self {
        Self {
            role: msg.role,
            content: msg.content.clone(),
        }
    }
}

/// Body of `POST /chat/stream` and `POST /chat`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default = "default_instructions")]
    pub instructions: String,
    pub input: Vec<ChatTurn>,
}

fn default_instructions() -> String {
    DEFAULT_INSTRUCTIONS.to_string()
}

/// One newline-delimited record of a streamed reply. Fields other than
/// `delta` are ignored.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StreamRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<String>,
}

/// Non-streaming reply of `POST /chat`.
#[derive(Debug, Serialize, Deserialize)]
pub struct CompletionMessage {
    pub role: Role,
    pub content: String,
}
