//! Lazily-created per-symbol [`BookEngine`] instances, library-style so a
//! downstream consumer process can depend on `depth_engine`/`book_registry`
//! directly instead of re-deriving the book from raw frames.

use crate::config::Config;
use crate::depth_engine::BookEngine;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

pub struct BookRegistry {
    engines: RwLock<HashMap<String, Arc<BookEngine>>>,
    last_seen_ms: RwLock<HashMap<String, i64>>,
    max_buffer: usize,
    min_backoff_ms: u64,
    max_backoff_ms: u64,
    grace_ms: i64,
}

impl BookRegistry {
    pub fn new(config: &Config) -> Self {
        Self {
            engines: RwLock::new(HashMap::new()),
            last_seen_ms: RwLock::new(HashMap::new()),
            max_buffer: config.max_buffer,
            min_backoff_ms: config.min_backoff_ms,
            max_backoff_ms: config.max_backoff_ms,
            grace_ms: config.book_grace_ms,
        }
    }

    /// Creates the engine on first reference to `symbol`. The upstream
    /// manager only ever feeds diffs for symbols currently in the client
    /// subscription union, so a call here doubles as "a client cares about
    /// this symbol right now" — touch the liveness clock on every call.
    pub fn get_or_create(&self, symbol: &str) -> Arc<BookEngine> {
        self.last_seen_ms.write().insert(symbol.to_string(), now_ms());
        if let Some(engine) = self.engines.read().get(symbol) {
            return engine.clone();
        }
        let mut engines = self.engines.write();
        engines
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(BookEngine::new(symbol, self.max_buffer, self.min_backoff_ms, self.max_backoff_ms)))
            .clone()
    }

    pub fn get(&self, symbol: &str) -> Option<Arc<BookEngine>> {
        self.engines.read().get(symbol).cloned()
    }

    pub fn symbols(&self) -> Vec<String> {
        self.engines.read().keys().cloned().collect()
    }

    /// Drops engines for symbols untouched for longer than the configured
    /// grace period — i.e. no client has subscribed to them in that window.
    pub fn sweep(&self) {
        let cutoff = now_ms() - self.grace_ms;
        let mut last_seen = self.last_seen_ms.write();
        let expired: Vec<String> = last_seen
            .iter()
            .filter(|&(_, &seen)| seen < cutoff)
            .map(|(symbol, _)| symbol.clone())
            .collect();
        if expired.is_empty() {
            return;
        }
        let mut engines = self.engines.write();
        for symbol in &expired {
            engines.remove(symbol);
            last_seen.remove(symbol);
        }
        drop(engines);
        drop(last_seen);
        debug!(count = expired.len(), "evicted book engines past grace period");
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(grace_ms: i64) -> Config {
        Config {
            port: 0,
            allowed_origins: vec![],
            upstream_rest_base: String::new(),
            upstream_ws_base: String::new(),
            min_backoff_ms: 2000,
            max_backoff_ms: 30_000,
            rate_limit_interval_ms: 500,
            cache_ttl_ms: 5000,
            max_buffer: 2000,
            max_reconnect_delay_ms: 30_000,
            book_grace_ms: grace_ms,
        }
    }

    #[test]
    fn sweep_leaves_recently_touched_engines() {
        let registry = BookRegistry::new(&test_config(60_000));
        registry.get_or_create("BTCUSDT");
        registry.sweep();
        assert_eq!(registry.symbols(), vec!["BTCUSDT".to_string()]);
    }

    #[test]
    fn sweep_evicts_past_grace_period() {
        let registry = BookRegistry::new(&test_config(-1));
        registry.get_or_create("BTCUSDT");
        registry.sweep();
        assert!(registry.symbols().is_empty());
        assert!(registry.get("BTCUSDT").is_none());
    }
}
