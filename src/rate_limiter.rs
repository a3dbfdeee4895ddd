//! Per-symbol upstream rate-limit tracker (C2).
//!
//! Same `Arc<Mutex<HashMap<K, Entry>>>` shape as the teacher's IP-keyed HTTP
//! rate limiter, keyed by symbol instead of address and exposing the
//! success/failure feedback API the snapshot fetcher needs.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

struct SymbolState {
    last_request_ms: i64,
    backoff_ms: u64,
}

pub struct RateLimitTracker {
    state: Mutex<HashMap<String, SymbolState>>,
    min_backoff_ms: u64,
    max_backoff_ms: u64,
    interval_ms: u64,
}

impl RateLimitTracker {
    pub fn new(min_backoff_ms: u64, max_backoff_ms: u64, interval_ms: u64) -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
            min_backoff_ms,
            max_backoff_ms,
            interval_ms,
        }
    }

    pub fn should_throttle(&self, symbol: &str) -> bool {
        let state = self.state.lock();
        let Some(entry) = state.get(symbol) else {
            return false;
        };
        let gap = self.interval_ms.max(entry.backoff_ms);
        now_ms() - entry.last_request_ms < gap as i64
    }

    pub fn on_success(&self, symbol: &str) {
        let mut state = self.state.lock();
        let entry = state.entry(symbol.to_string()).or_insert(SymbolState {
            last_request_ms: 0,
            backoff_ms: self.min_backoff_ms,
        });
        entry.backoff_ms = self.min_backoff_ms;
        entry.last_request_ms = now_ms();
    }

    pub fn on_rate_limited(&self, symbol: &str) {
        self.back_off(symbol);
    }

    pub fn on_error(&self, symbol: &str) {
        self.back_off(symbol);
    }

    fn back_off(&self, symbol: &str) {
        let mut state = self.state.lock();
        let entry = state.entry(symbol.to_string()).or_insert(SymbolState {
            last_request_ms: 0,
            backoff_ms: self.min_backoff_ms,
        });
        entry.backoff_ms = (entry.backoff_ms * 2).min(self.max_backoff_ms);
        entry.last_request_ms = now_ms();
    }

    /// Current backoff for a symbol, `min_backoff_ms` if never recorded.
    pub fn backoff_ms(&self, symbol: &str) -> u64 {
        self.state
            .lock()
            .get(symbol)
            .map(|e| e.backoff_ms)
            .unwrap_or(self.min_backoff_ms)
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
