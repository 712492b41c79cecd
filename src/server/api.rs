use axum::{
    body::Body,
    extract::{ ConnectInfo, MatchedPath, Request, State },
    http::{ header, HeaderMap, StatusCode },
    middleware::{ self, Next },
    response::{ IntoResponse, Response },
    routing::post,
    Json,
    Router,
};
use futures::StreamExt;
use governor::{ clock::Clock, middleware::RateLimitingMiddleware, state::keyed::DashMapStateStore, DefaultKeyedRateLimiter, Quota, RateLimiter };
use log::{ debug, error, info, warn };
use serde_json::json;
use std::net::{ IpAddr, Ipv4Addr, SocketAddr };
use std::num::NonZeroU32;
use std::sync::Arc;
use tower_http::cors::{ Any, CorsLayer };

use crate::client::API_KEY_HEADER;
use crate::llm::CompletionBackend;
use crate::models::chat::Role;
use crate::models::wire::{ ChatRequest, CompletionMessage, StreamRecord };

/// Each route gets its own per-client budget.
type RouteKey = (String, IpAddr);

/// Drops entries whose budget has fully replenished and returns how many remain.
fn prune_idle<C: Clock, MW: RateLimitingMiddleware<C::Instant>>(
    limiter: &RateLimiter<RouteKey, DashMapStateStore<RouteKey>, C, MW>
) -> usize {
    limiter.retain_recent();
    limiter.shrink_to_fit();
    limiter.len()
}

#[derive(Clone)]
pub struct AppState {
    backend: Arc<dyn CompletionBackend>,
    api_secret: Arc<str>,
    limiter: Arc<DefaultKeyedRateLimiter<RouteKey>>,
    requests_per_minute: u32,
}

impl AppState {
    pub fn new(backend: Arc<dyn CompletionBackend>, api_secret: &str, requests_per_minute: u32) -> Result<Self, String> {
        let per_minute = NonZeroU32::new(requests_per_minute)
            .ok_or_else(|| "requests per minute must be greater than zero".to_string())?;
        Ok(Self {
            backend,
            api_secret: Arc::from(api_secret),
            limiter: Arc::new(RateLimiter::keyed(Quota::per_minute(per_minute))),
            requests_per_minute,
        })
    }

    /// Forgets clients that have been quiet long enough to be back at a full budget.
    pub fn prune_limiter(&self) -> usize {
        let remaining = prune_idle(&*self.limiter);
        debug!("Rate limiter tracking {} route/client pairs", remaining);
        remaining
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|key| key == &*self.api_secret)
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/chat", post(chat_handler))
        .route("/chat/stream", post(chat_stream_handler))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .layer(cors)
        .with_state(state)
}

fn detail(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "detail": message.into() }))).into_response()
}

async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

    let route = match request.extensions().get::<MatchedPath>() {
        Some(matched) => matched.as_str().to_string(),
        None => request.uri().path().to_string(),
    };

    if state.limiter.check_key(&(route.clone(), ip)).is_err() {
        warn!("Rate limit exceeded for {} on {}", ip, route);
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "error": format!("Rate limit exceeded: {} per 1 minute", state.requests_per_minute) })),
        ).into_response();
    }
    next.run(request).await
}

async fn chat_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ChatRequest>
) -> Response {
    if !state.authorized(&headers) {
        return detail(StatusCode::FORBIDDEN, "Forbidden");
    }

    match state.backend.complete(&req).await {
        Ok(content) => Json(CompletionMessage { role: Role::Assistant, content }).into_response(),
        Err(e) => {
            error!("Completion failed: {}", e);
            detail(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn chat_stream_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ChatRequest>
) -> Response {
    if !state.authorized(&headers) {
        return detail(StatusCode::FORBIDDEN, "Forbidden");
    }

    let deltas = match state.backend.stream(&req).await {
        Ok(deltas) => deltas,
        Err(e) => {
            error!("Streaming completion failed: {}", e);
            return detail(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
    };
    info!("Streaming reply for {} turns", req.input.len());

    // An upstream error mid-reply aborts the body; the client sees a broken transfer.
    let lines = deltas.map(|item| {
        item
            .map(|delta| {
                let record = StreamRecord { delta: Some(delta) };
                format!("{}\n", json!(record))
            })
            .inspect_err(|e| error!("Upstream stream error: {}", e))
    });

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(lines),
    ).into_response()
}
