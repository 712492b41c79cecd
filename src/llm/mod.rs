pub mod openai;

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use thiserror::Error;

use crate::models::wire::ChatRequest;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("upstream transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("upstream responded with status {status}: {body}")]
    Status {
        status: u16,
        body: String,
    },
    #[error("upstream reply contained no output text")]
    MissingOutput,
    #[error("invalid upstream API key: {0}")]
    InvalidKey(String),
}

pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String, BackendError>> + Send>>;

/// A completion provider the service forwards conversations to.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Whole reply text in one piece.
    async fn complete(&self, request: &ChatRequest) -> Result<String, BackendError>;

    /// Reply text deltas in generation order. Errors before the first delta
    /// are returned directly so the caller can still choose a status code.
    async fn stream(&self, request: &ChatRequest) -> Result<DeltaStream, BackendError>;
}
