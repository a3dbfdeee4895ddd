//! Wire and domain types shared across the gateway.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single price level as carried over the wire: price kept as the original
/// decimal string (map identity), quantity as a string we parse on demand.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceLevel(pub String, pub String);

impl PriceLevel {
    pub fn price(&self) -> &str {
        &self.0
    }

    pub fn qty_f64(&self) -> f64 {
        self.1.parse().unwrap_or(0.0)
    }

    pub fn price_f64(&self) -> f64 {
        self.0.parse().unwrap_or(0.0)
    }
}

/// REST depth snapshot as returned by the upstream exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthSnapshot {
    #[serde(rename = "lastUpdateId")]
    pub last_update_id: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

/// A fused snapshot as served to downstream REST callers, carrying cache
/// provenance.
#[derive(Debug, Clone, Serialize)]
pub struct CachedDepth {
    #[serde(rename = "lastUpdateId")]
    pub last_update_id: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    #[serde(rename = "cachedAt")]
    pub cached_at: i64,
    pub source: DepthSource,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DepthSource {
    Binance,
    Cache,
}

/// Incremental depth-diff event (`depthUpdate`) from the combined stream.
#[derive(Debug, Clone, Deserialize)]
pub struct DepthUpdate {
    #[serde(rename = "e")]
    pub event_type: String,
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "U")]
    pub first_update_id: u64,
    #[serde(rename = "u")]
    pub final_update_id: u64,
    #[serde(rename = "b")]
    pub bids: Vec<PriceLevel>,
    #[serde(rename = "a")]
    pub asks: Vec<PriceLevel>,
}

/// A book side keyed by the original decimal-string price. Deliberately a
/// hash map, not a sorted map: price *strings* don't sort numerically
/// ("10.0" < "9.5" lexically), so ordering is always derived by parsing to
/// `f64` at read time instead of relying on map iteration order.
pub type LevelMap = HashMap<String, f64>;

/// A leveled view of the book returned by [`crate::depth_engine::BookEngine::get_book`].
#[derive(Debug, Clone, Serialize)]
pub struct BookLevel {
    pub price: String,
    pub size: f64,
    #[serde(rename = "cumulativeSize")]
    pub cumulative_size: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BookView {
    pub symbol: String,
    #[serde(rename = "lastUpdateId")]
    pub last_update_id: u64,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub valid: bool,
}

/// The outer envelope every upstream combined-stream frame arrives in.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamFrame {
    pub stream: String,
    pub data: serde_json::Value,
}

/// Inbound control messages clients may send over `/ws`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientControl {
    Subscribe { symbols: Vec<String> },
    Unsubscribe { symbols: Vec<String> },
}

/// The one-shot greeting sent to a client right after it connects.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectedFrame {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub symbols: Vec<String>,
    pub timestamp: i64,
}

impl ConnectedFrame {
    pub fn new(symbols: Vec<String>) -> Self {
        Self {
            kind: "connected",
            symbols,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// `/health` response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    #[serde(rename = "uptimeSecs")]
    pub uptime_secs: u64,
    #[serde(rename = "wsClients")]
    pub ws_clients: usize,
    #[serde(rename = "binanceWsState")]
    pub binance_ws_state: &'static str,
    #[serde(rename = "cacheSize")]
    pub cache_size: usize,
    #[serde(rename = "activeSymbols")]
    pub active_symbols: Vec<String>,
}
