pub mod api;

use log::info;
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::cli::ServeArgs;
use crate::llm::openai::OpenAIResponsesClient;
use crate::llm::CompletionBackend;
use api::AppState;

const LIMITER_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

pub struct Server {
    addr: String,
    state: AppState,
}

impl Server {
    pub fn new(addr: String, backend: Arc<dyn CompletionBackend>, api_secret: &str, requests_per_minute: u32) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let state = AppState::new(backend, api_secret, requests_per_minute)?;
        Ok(Self { addr, state })
    }

    pub fn from_args(args: &ServeArgs) -> Result<Self, Box<dyn Error + Send + Sync>> {
        if args.openai_api_key.is_empty() {
            return Err("OPENAI_API_KEY must be set to serve completions".into());
        }
        let backend = OpenAIResponsesClient::new(
            &args.openai_api_key,
            &args.openai_base_url,
            &args.model,
            args.max_output_tokens
        )?;
        Self::new(args.server_addr.clone(), Arc::new(backend), &args.api_secret, args.requests_per_minute)
    }

    pub async fn run(self) -> Result<(), Box<dyn Error + Send + Sync>> {
        let addr = self.addr.parse::<SocketAddr>()?;
        let limits = self.state.clone();
        let app = api::router(self.state);

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(LIMITER_PRUNE_INTERVAL);
            loop {
                tick.tick().await;
                limits.prune_limiter();
            }
        });

        let listener = tokio::net::TcpListener::bind(addr).await
            .map_err(|e| format!("Failed to bind HTTP server to {}: {}. Try a different port.", addr, e))?;
        info!("HTTP server listening on: http://{}", addr);

        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
        Ok(())
    }
}
