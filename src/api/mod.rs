//! HTTP/WS surface: router assembly plus shared application state.

pub mod rest;
pub mod ws;

use crate::book_registry::BookRegistry;
use crate::config::Config;
use crate::depth_cache::DepthCache;
use crate::middleware::request_logging_simple;
use crate::rate_limiter::RateLimitTracker;
use crate::registry::ClientRegistry;
use crate::snapshot_fetcher::SnapshotFetcher;
use crate::upstream::UpstreamManager;
use axum::http::HeaderValue;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub cache: Arc<DepthCache>,
    pub limiter: Arc<RateLimitTracker>,
    pub fetcher: Arc<SnapshotFetcher>,
    pub clients: Arc<ClientRegistry>,
    pub books: Arc<BookRegistry>,
    pub upstream: Arc<UpstreamManager>,
    pub started_at: Instant,
}

pub fn router(state: AppState) -> Router {
    let cors = if state.config.allowed_origins.is_empty() {
        CorsLayer::permissive()
    } else {
        let origins: Vec<HeaderValue> = state
            .config
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any)
    };

    Router::new()
        .route("/health", get(rest::health))
        .route("/api/depth/:symbol", get(rest::get_depth))
        .route("/ws", get(ws::ws_handler))
        .layer(axum::middleware::from_fn(request_logging_simple))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
