//! REST endpoint layer (C7): `/api/depth/:symbol` and `/health`.

use super::AppState;
use crate::depth_cache::CacheLookup;
use crate::models::{CachedDepth, DepthSource, HealthResponse};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct DepthQuery {
    limit: Option<u32>,
}

fn truncate(mut depth: CachedDepth, limit: usize) -> CachedDepth {
    depth.bids.truncate(limit);
    depth.asks.truncate(limit);
    depth
}

pub async fn get_depth(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
    Query(query): Query<DepthQuery>,
) -> impl IntoResponse {
    let symbol = symbol.to_uppercase();
    let limit = query.limit.unwrap_or(100).min(1000) as usize;

    if state.limiter.should_throttle(&symbol) {
        match state.cache.get(&symbol) {
            CacheLookup::Fresh(d) | CacheLookup::Serveable(d) => {
                return Json(truncate(d, limit)).into_response();
            }
            _ => {}
        }
    }

    if let Some(snapshot) = state
        .fetcher
        .fetch(&symbol, limit as u32, &state.cache, &state.limiter)
        .await
    {
        let depth = CachedDepth {
            last_update_id: snapshot.last_update_id,
            bids: snapshot.bids,
            asks: snapshot.asks,
            cached_at: chrono::Utc::now().timestamp_millis(),
            source: DepthSource::Binance,
        };
        return Json(truncate(depth, limit)).into_response();
    }

    match state.cache.get(&symbol) {
        CacheLookup::Fresh(d) | CacheLookup::Serveable(d) => Json(truncate(d, limit)).into_response(),
        _ => {
            let body = serde_json::json!({
                "error": "upstream_unavailable",
                "symbol": symbol,
                "retryAfter": state.limiter.backoff_ms(&symbol),
            });
            (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
        }
    }
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        uptime_secs: state.started_at.elapsed().as_secs(),
        ws_clients: state.clients.client_count(),
        binance_ws_state: state.upstream.state_str(),
        cache_size: state.cache.len(),
        active_symbols: state.books.symbols(),
    })
}
