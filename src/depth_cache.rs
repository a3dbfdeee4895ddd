//! Per-symbol depth snapshot cache (C1).
//!
//! One [`ArcSwap`] per symbol gives lock-free reads with the same idiom the
//! teacher uses for its book store: writers publish a fresh `Arc` wholesale,
//! readers never block a writer and never observe a half-written snapshot.

use crate::models::{CachedDepth, DepthSnapshot, DepthSource};
use arc_swap::ArcSwap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

struct Entry {
    snapshot: ArcSwap<DepthSnapshot>,
    cached_at_ms: ArcSwap<i64>,
}

/// The outcome of a [`DepthCache::get`] call.
pub enum CacheLookup {
    Fresh(CachedDepth),
    Serveable(CachedDepth),
    Stale,
    Miss,
}

pub struct DepthCache {
    entries: RwLock<HashMap<String, Arc<Entry>>>,
    ttl_ms: i64,
}

impl DepthCache {
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl_ms: ttl_ms as i64,
        }
    }

    pub fn put(&self, symbol: &str, snapshot: DepthSnapshot) {
        let now = now_ms();
        let entry = Arc::new(Entry {
            snapshot: ArcSwap::from_pointee(snapshot),
            cached_at_ms: ArcSwap::from_pointee(now),
        });
        self.entries.write().insert(symbol.to_string(), entry);
    }

    /// Reads never mutate: a cache miss/stale result does not evict anything.
    pub fn get(&self, symbol: &str) -> CacheLookup {
        let entry = match self.entries.read().get(symbol).cloned() {
            Some(e) => e,
            None => return CacheLookup::Miss,
        };
        let cached_at = **entry.cached_at_ms.load();
        let age = now_ms() - cached_at;
        let snapshot = entry.snapshot.load();

        let depth = CachedDepth {
            last_update_id: snapshot.last_update_id,
            bids: snapshot.bids.clone(),
            asks: snapshot.asks.clone(),
            cached_at,
            source: DepthSource::Cache,
        };

        if age <= self.ttl_ms {
            CacheLookup::Fresh(depth)
        } else if age <= self.ttl_ms * 2 {
            CacheLookup::Serveable(depth)
        } else {
            CacheLookup::Stale
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn symbols(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
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
    use crate::models::PriceLevel;

    fn snap(id: u64) -> DepthSnapshot {
        DepthSnapshot {
            last_update_id: id,
            bids: vec![PriceLevel("100.0".into(), "1.0".into())],
            asks: vec![PriceLevel("101.0".into(), "1.0".into())],
        }
    }

    #[test]
    fn miss_before_any_write() {
        let cache = DepthCache::new(5000);
        assert!(matches!(cache.get("BTCUSDT"), CacheLookup::Miss));
    }

    #[test]
    fn fresh_right_after_write() {
        let cache = DepthCache::new(5000);
        cache.put("BTCUSDT", snap(42));
        match cache.get("BTCUSDT") {
            CacheLookup::Fresh(d) => assert_eq!(d.last_update_id, 42),
            _ => panic!("expected fresh"),
        }
    }

    #[test]
    fn overwrite_replaces_unconditionally() {
        let cache = DepthCache::new(5000);
        cache.put("BTCUSDT", snap(1));
        cache.put("BTCUSDT", snap(2));
        match cache.get("BTCUSDT") {
            CacheLookup::Fresh(d) => assert_eq!(d.last_update_id, 2),
            _ => panic!("expected fresh"),
        }
    }
}
