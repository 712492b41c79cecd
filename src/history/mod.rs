mod file;
mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;

use log::{ error, info };
use std::sync::Arc;
use thiserror::Error;

use crate::models::chat::ChatMessage;
use crate::models::wire::DEFAULT_INSTRUCTIONS;

pub const MESSAGES_KEY: &str = "chatMessages";
pub const INSTRUCTIONS_KEY: &str = "chatInstructions";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("storage lock poisoned")]
    Poisoned,
}

/// Durable client-side key-value storage.
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// Typed access to the conversation and instructions keys.
#[derive(Clone)]
pub struct ConversationStore {
    storage: Arc<dyn Storage>,
}

impl ConversationStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Unreadable saved conversations load as empty rather than failing start-up.
    pub fn load_messages(&self) -> Result<Vec<ChatMessage>, StorageError> {
        let raw = match self.storage.get(MESSAGES_KEY)? {
            Some(raw) => raw,
            None => return Ok(Vec::new()),
        };
        match serde_json::from_str::<Vec<ChatMessage>>(&raw) {
            Ok(messages) => {
                info!("Loaded {} saved messages", messages.len());
                Ok(messages)
            }
            Err(e) => {
                error!("Failed to parse saved messages: {}", e);
                Ok(Vec::new())
            }
        }
    }

    pub fn save_messages(&self, messages: &[ChatMessage]) -> Result<(), StorageError> {
        let json = serde_json::to_string(messages)?;
        self.storage.set(MESSAGES_KEY, &json)
    }

    pub fn load_instructions(&self) -> Result<String, StorageError> {
        Ok(
            self.storage
                .get(INSTRUCTIONS_KEY)?
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_INSTRUCTIONS.to_string())
        )
    }

    pub fn save_instructions(&self, instructions: &str) -> Result<(), StorageError> {
        self.storage.set(INSTRUCTIONS_KEY, instructions)
    }
}

pub fn create_storage(data_dir: &str) -> Result<Arc<dyn Storage>, StorageError> {
    info!("Chat state will be stored in: {}", data_dir);
    Ok(Arc::new(FileStorage::new(data_dir)?))
}
