pub mod ndjson;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{ Stream, StreamExt };
use log::{ debug, info };
use reqwest::{ Client as HttpClient, StatusCode, header::{ HeaderMap, HeaderValue, CONTENT_TYPE } };
use std::pin::Pin;
use thiserror::Error;

use crate::models::wire::ChatRequest;

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("API responded with status: {0}")]
    Status(u16),
    #[error("no response stream available")]
    MissingStream,
    #[error("a request is already in flight")]
    Busy,
    #[error("invalid API secret: {0}")]
    InvalidSecret(String),
}

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ChatError>> + Send>>;

/// Opens a streamed reply for a request. Status and body checks happen
/// here, before any chunk is read.
#[async_trait]
pub trait StreamSource: Send + Sync {
    async fn open(&self, request: &ChatRequest) -> Result<ByteStream, ChatError>;
}

/// Talks to the completion service's `/chat/stream` route.
pub struct HttpStreamSource {
    http: HttpClient,
    url: String,
}

impl HttpStreamSource {
    pub fn new(api_base: &str, api_secret: &str) -> Result<Self, ChatError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            API_KEY_HEADER,
            HeaderValue::from_str(api_secret).map_err(|e| ChatError::InvalidSecret(e.to_string()))?
        );

        let http = HttpClient::builder().default_headers(headers).build()?;
        let url = format!("{}/chat/stream", api_base.trim_end_matches('/'));
        info!("Completion stream endpoint: {}", url);

        Ok(Self { http, url })
    }
}

#[async_trait]
impl StreamSource for HttpStreamSource {
    async fn open(&self, request: &ChatRequest) -> Result<ByteStream, ChatError> {
        debug!("POST {} with {} history entries", self.url, request.input.len());
        let resp = self.http.post(&self.url).json(request).send().await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ChatError::Status(status.as_u16()));
        }
        if status == StatusCode::NO_CONTENT {
            return Err(ChatError::MissingStream);
        }

        Ok(Box::pin(resp.bytes_stream().map(|chunk| chunk.map_err(ChatError::from))))
    }
}
