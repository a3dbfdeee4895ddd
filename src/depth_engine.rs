//! Per-symbol order-book synchronization engine (C4).
//!
//! Fuses a one-shot REST snapshot with a live stream of incremental diffs
//! into a gap-free local book. Mutation is single-writer (all of it happens
//! under one [`parking_lot::Mutex`]); reads take the same lock for the
//! duration of a cheap in-memory copy, so a reader never observes a
//! partially-applied diff — the same lock-consistency the teacher's book
//! store gets from `ArcSwap`, achieved here with a short critical section
//! instead since mutation here is itself cheap and single-writer.

use crate::models::{BookLevel, BookView, DepthSnapshot, DepthUpdate, LevelMap, PriceLevel};
use parking_lot::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Init,
    Buffering,
    Degraded,
    Synced,
    Gapped,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Init => "init",
            EngineState::Buffering => "buffering",
            EngineState::Degraded => "degraded",
            EngineState::Synced => "synced",
            EngineState::Gapped => "gapped",
        }
    }
}

struct Inner {
    state: EngineState,
    bids: LevelMap,
    asks: LevelMap,
    last_update_id: u64,
    buffer: Vec<DepthUpdate>,
    resync_in_flight: bool,
    needs_resync: bool,
    last_resync_at_ms: i64,
    backoff_ms: u64,
    last_gap_log_ms: i64,
    seeded: bool,
}

pub struct BookEngine {
    symbol: String,
    inner: Mutex<Inner>,
    max_buffer: usize,
    min_backoff_ms: u64,
    max_backoff_ms: u64,
}

const GAP_LOG_THROTTLE_MS: i64 = 2000;

impl BookEngine {
    pub fn new(symbol: impl Into<String>, max_buffer: usize, min_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            symbol: symbol.into(),
            inner: Mutex::new(Inner {
                state: EngineState::Init,
                bids: LevelMap::new(),
                asks: LevelMap::new(),
                last_update_id: 0,
                buffer: Vec::new(),
                resync_in_flight: false,
                needs_resync: true,
                last_resync_at_ms: 0,
                backoff_ms: min_backoff_ms,
                last_gap_log_ms: 0,
                seeded: false,
            }),
            max_buffer,
            min_backoff_ms,
            max_backoff_ms,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn state(&self) -> EngineState {
        self.inner.lock().state
    }

    pub fn needs_resync(&self) -> bool {
        self.inner.lock().needs_resync
    }

    pub fn resync_in_flight(&self) -> bool {
        self.inner.lock().resync_in_flight
    }

    pub fn backoff_ms(&self) -> u64 {
        self.inner.lock().backoff_ms
    }

    pub fn last_resync_at_ms(&self) -> i64 {
        self.inner.lock().last_resync_at_ms
    }

    /// Called by the scheduler right before issuing a snapshot fetch.
    /// Returns `false` if a resync is already in flight (caller should skip).
    pub fn begin_resync(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.resync_in_flight {
            return false;
        }
        inner.resync_in_flight = true;
        inner.last_resync_at_ms = now_ms();
        if matches!(inner.state, EngineState::Init | EngineState::Degraded) {
            inner.state = EngineState::Buffering;
        }
        true
    }

    /// Called by the scheduler when the snapshot fetch itself failed
    /// (network/parse/rate-limit) — replay was never attempted.
    pub fn resync_failed(&self) {
        let mut inner = self.inner.lock();
        inner.resync_in_flight = false;
        inner.backoff_ms = (inner.backoff_ms * 2).min(self.max_backoff_ms);
        warn!(symbol = %self.symbol, backoff_ms = inner.backoff_ms, "snapshot fetch failed, retry scheduled");
    }

    /// Ingests one incremental diff event. Single-writer: callers must
    /// serialize calls per symbol (the upstream stream manager already
    /// drains frames for one symbol in arrival order).
    pub fn on_diff(&self, update: DepthUpdate) {
        let mut inner = self.inner.lock();
        match inner.state {
            EngineState::Init => {
                if !inner.seeded {
                    seed(&mut inner, &update);
                    inner.seeded = true;
                    inner.state = EngineState::Degraded;
                }
                push_buffered(&mut inner, update, self.max_buffer, &self.symbol);
            }
            EngineState::Buffering | EngineState::Gapped => {
                push_buffered(&mut inner, update, self.max_buffer, &self.symbol);
            }
            EngineState::Degraded => {
                if update.final_update_id > inner.last_update_id {
                    apply_update(&mut inner, &update);
                    inner.last_update_id = update.final_update_id;
                }
                push_buffered(&mut inner, update, self.max_buffer, &self.symbol);
            }
            EngineState::Synced => {
                if update.final_update_id <= inner.last_update_id {
                    // already applied, drop silently (idempotent re-delivery)
                } else if update.first_update_id <= inner.last_update_id + 1 {
                    apply_update(&mut inner, &update);
                    inner.last_update_id = update.final_update_id;
                } else {
                    inner.needs_resync = true;
                    inner.state = EngineState::Gapped;
                    let now = now_ms();
                    if now - inner.last_gap_log_ms >= GAP_LOG_THROTTLE_MS {
                        warn!(
                            symbol = %self.symbol,
                            expected = inner.last_update_id + 1,
                            got = update.first_update_id,
                            "gap detected in depth stream"
                        );
                        inner.last_gap_log_ms = now;
                    }
                    push_buffered(&mut inner, update, self.max_buffer, &self.symbol);
                }
            }
        }
    }

    /// Applies a freshly-fetched snapshot per the replay algorithm. Returns
    /// `true` on success (state becomes `Synced`), `false` if replay failed
    /// (state becomes `Gapped`, buffer cleared, another resync is needed).
    pub fn apply_snapshot(&self, snapshot: &DepthSnapshot) -> bool {
        let mut inner = self.inner.lock();

        inner.buffer.sort_by_key(|e| e.final_update_id);
        let had_buffered_events = !inner.buffer.is_empty();
        inner.buffer.retain(|e| e.final_update_id > snapshot.last_update_id);

        let replay_start = inner
            .buffer
            .iter()
            .position(|e| e.first_update_id <= snapshot.last_update_id + 1 && snapshot.last_update_id < e.final_update_id);

        let Some(start_idx) = replay_start else {
            if had_buffered_events {
                // The buffer had events before staleness filtering but none
                // straddles the snapshot boundary — the snapshot is either
                // too far ahead or too far behind the buffered window, and
                // replay cannot be trusted to be gap-free.
                fail_replay(&mut inner, &self.symbol, self.max_backoff_ms, "no buffered event straddles snapshot boundary");
                return false;
            }
            // No buffered events at all (symbol was quiet) — the snapshot
            // alone is authoritative.
            commit_snapshot(&mut inner, snapshot);
            return true;
        };

        // Load the snapshot as the base book, then replay from start_idx on.
        inner.bids = LevelMap::new();
        inner.asks = LevelMap::new();
        for level in &snapshot.bids {
            apply_level(&mut inner.bids, level);
        }
        for level in &snapshot.asks {
            apply_level(&mut inner.asks, level);
        }
        inner.last_update_id = snapshot.last_update_id;

        let pending: Vec<DepthUpdate> = inner.buffer.split_off(start_idx);
        for event in &pending {
            if event.first_update_id > inner.last_update_id + 1 || event.final_update_id <= inner.last_update_id {
                fail_replay(&mut inner, &self.symbol, self.max_backoff_ms, "gap within buffered replay window");
                return false;
            }
            apply_update(&mut inner, event);
            inner.last_update_id = event.final_update_id;
        }

        inner.buffer.clear();
        inner.state = EngineState::Synced;
        inner.needs_resync = false;
        inner.resync_in_flight = false;
        inner.backoff_ms = self.min_backoff_ms;
        info!(symbol = %self.symbol, last_update_id = inner.last_update_id, "synced");
        true
    }

    /// The book-validity gate: whether this book is safe to hand to a
    /// downstream consumer right now.
    pub fn is_valid(&self) -> bool {
        let inner = self.inner.lock();
        inner.state == EngineState::Synced
            && !inner.resync_in_flight
            && best_price(&inner.bids, true)
                .zip(best_price(&inner.asks, false))
                .map(|(bid, ask)| bid > 0.0 && ask > 0.0 && bid < ask)
                .unwrap_or(false)
    }

    pub fn get_book(&self, depth: usize) -> BookView {
        let inner = self.inner.lock();
        let bids = top_levels(&inner.bids, depth, true);
        let asks = top_levels(&inner.asks, depth, false);
        let valid = inner.state == EngineState::Synced
            && !inner.resync_in_flight
            && bids.first().zip(asks.first()).map(|(b, a)| b.price_f64() < a.price_f64()).unwrap_or(false);

        BookView {
            symbol: self.symbol.clone(),
            last_update_id: inner.last_update_id,
            bids: levels_with_cumulative(bids),
            asks: levels_with_cumulative(asks),
            valid,
        }
    }
}

fn seed(inner: &mut Inner, update: &DepthUpdate) {
    for level in &update.bids {
        apply_level(&mut inner.bids, level);
    }
    for level in &update.asks {
        apply_level(&mut inner.asks, level);
    }
    inner.last_update_id = update.final_update_id;
}

fn apply_update(inner: &mut Inner, update: &DepthUpdate) {
    for level in &update.bids {
        apply_level(&mut inner.bids, level);
    }
    for level in &update.asks {
        apply_level(&mut inner.asks, level);
    }
}

fn apply_level(map: &mut LevelMap, level: &PriceLevel) {
    let qty = level.qty_f64();
    if qty <= 0.0 {
        map.remove(level.price());
    } else {
        map.insert(level.price().to_string(), qty);
    }
}

fn push_buffered(inner: &mut Inner, update: DepthUpdate, max_buffer: usize, symbol: &str) {
    inner.buffer.push(update);
    if inner.buffer.len() >= max_buffer {
        let drop_n = (max_buffer / 10).max(1);
        inner.buffer.drain(0..drop_n);
        warn!(symbol, dropped = drop_n, "diff buffer overflow, dropped oldest entries");
    }
}

fn fail_replay(inner: &mut Inner, symbol: &str, max_backoff_ms: u64, reason: &str) {
    inner.buffer.clear();
    inner.state = EngineState::Gapped;
    inner.needs_resync = true;
    inner.resync_in_flight = false;
    inner.backoff_ms = (inner.backoff_ms * 2).min(max_backoff_ms);
    warn!(symbol, reason, "snapshot replay failed");
}

fn commit_snapshot(inner: &mut Inner, snapshot: &DepthSnapshot) {
    inner.bids = LevelMap::new();
    inner.asks = LevelMap::new();
    for level in &snapshot.bids {
        apply_level(&mut inner.bids, level);
    }
    for level in &snapshot.asks {
        apply_level(&mut inner.asks, level);
    }
    inner.last_update_id = snapshot.last_update_id;
    inner.state = EngineState::Synced;
    inner.needs_resync = false;
    inner.resync_in_flight = false;
}

fn best_price(map: &LevelMap, want_max: bool) -> Option<f64> {
    map.keys()
        .filter_map(|p| p.parse::<f64>().ok())
        .reduce(|a, b| if want_max == (b > a) { b } else { a })
}

fn top_levels(map: &LevelMap, depth: usize, descending: bool) -> Vec<PriceLevel> {
    let mut levels: Vec<(f64, String, f64)> = map
        .iter()
        .map(|(p, q)| (p.parse().unwrap_or(0.0), p.clone(), *q))
        .collect();
    if descending {
        levels.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap());
    } else {
        levels.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
    }
    levels
        .into_iter()
        .take(depth)
        .map(|(_, price, qty)| PriceLevel(price, qty.to_string()))
        .collect()
}

fn levels_with_cumulative(levels: Vec<PriceLevel>) -> Vec<BookLevel> {
    let mut cumulative = 0.0;
    levels
        .into_iter()
        .map(|l| {
            cumulative += l.qty_f64();
            BookLevel {
                price: l.price().to_string(),
                size: l.qty_f64(),
                cumulative_size: cumulative,
            }
        })
        .collect()
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

    fn lvl(p: &str, q: &str) -> PriceLevel {
        PriceLevel(p.to_string(), q.to_string())
    }

    fn diff(u_first: u64, u_final: u64, bids: Vec<PriceLevel>, asks: Vec<PriceLevel>) -> DepthUpdate {
        DepthUpdate {
            event_type: "depthUpdate".into(),
            event_time: 0,
            symbol: "BTCUSDT".into(),
            first_update_id: u_first,
            final_update_id: u_final,
            bids,
            asks,
        }
    }

    fn snap(id: u64) -> DepthSnapshot {
        DepthSnapshot {
            last_update_id: id,
            bids: vec![lvl("100.0", "1.0")],
            asks: vec![lvl("101.0", "1.0")],
        }
    }

    #[test]
    fn clean_sync_with_empty_buffer() {
        let engine = BookEngine::new("BTCUSDT", 2000, 2000, 30_000);
        assert!(engine.begin_resync());
        assert!(engine.apply_snapshot(&snap(100)));
        assert_eq!(engine.state(), EngineState::Synced);
        assert!(engine.is_valid());
    }

    #[test]
    fn buffered_diffs_replay_in_order() {
        let engine = BookEngine::new("BTCUSDT", 2000, 2000, 30_000);
        engine.on_diff(diff(90, 99, vec![], vec![])); // fully stale, discarded
        engine.on_diff(diff(99, 101, vec![lvl("100.0", "2.0")], vec![]));
        engine.on_diff(diff(102, 103, vec![lvl("100.0", "3.0")], vec![]));
        assert!(engine.begin_resync());
        assert!(engine.apply_snapshot(&snap(100)));
        assert_eq!(engine.state(), EngineState::Synced);
        let book = engine.get_book(10);
        assert_eq!(book.last_update_id, 103);
        assert_eq!(book.bids[0].size, 3.0);
    }

    #[test]
    fn replay_fails_when_buffer_too_new() {
        let engine = BookEngine::new("BTCUSDT", 2000, 2000, 30_000);
        engine.on_diff(diff(150, 160, vec![], vec![]));
        assert!(engine.begin_resync());
        assert!(!engine.apply_snapshot(&snap(100)));
        assert_eq!(engine.state(), EngineState::Gapped);
        assert!(engine.needs_resync());
    }

    #[test]
    fn replay_fails_when_buffer_too_old() {
        // Every buffered event is fully stale relative to the snapshot: none
        // of them can straddle lastUpdateId+1, so replay must fail rather
        // than silently treat the buffer as if it had been empty all along.
        let engine = BookEngine::new("BTCUSDT", 2000, 2000, 30_000);
        engine.on_diff(diff(94, 95, vec![], vec![]));
        engine.on_diff(diff(95, 96, vec![], vec![]));
        engine.on_diff(diff(96, 97, vec![], vec![]));
        assert!(engine.begin_resync());
        assert!(!engine.apply_snapshot(&snap(200)));
        assert_eq!(engine.state(), EngineState::Gapped);
        assert!(engine.needs_resync());
    }

    #[test]
    fn gap_after_sync_transitions_to_gapped() {
        let engine = BookEngine::new("BTCUSDT", 2000, 2000, 30_000);
        assert!(engine.begin_resync());
        assert!(engine.apply_snapshot(&snap(100)));
        engine.on_diff(diff(105, 110, vec![], vec![])); // U > lastUpdateId+1
        assert_eq!(engine.state(), EngineState::Gapped);
        assert!(engine.needs_resync());
        assert!(!engine.is_valid());
    }

    #[test]
    fn duplicate_diff_is_idempotent() {
        let engine = BookEngine::new("BTCUSDT", 2000, 2000, 30_000);
        assert!(engine.begin_resync());
        assert!(engine.apply_snapshot(&snap(100)));
        let book_before = engine.get_book(10);
        engine.on_diff(diff(90, 100, vec![lvl("999.0", "9.0")], vec![]));
        let book_after = engine.get_book(10);
        assert_eq!(book_before.last_update_id, book_after.last_update_id);
        assert_eq!(book_before.bids.len(), book_after.bids.len());
    }

    #[test]
    fn zero_qty_removes_level() {
        let engine = BookEngine::new("BTCUSDT", 2000, 2000, 30_000);
        assert!(engine.begin_resync());
        assert!(engine.apply_snapshot(&snap(100)));
        engine.on_diff(diff(101, 102, vec![lvl("100.0", "0")], vec![]));
        let book = engine.get_book(10);
        assert!(book.bids.is_empty());
    }

    #[test]
    fn buffer_overflow_drops_oldest_tenth() {
        let engine = BookEngine::new("BTCUSDT", 100, 2000, 30_000);
        for i in 0..105u64 {
            engine.on_diff(diff(i, i + 1, vec![], vec![]));
        }
        // engine never exceeds max_buffer by more than one push past the trigger
        let inner_len = engine.inner.lock().buffer.len();
        assert!(inner_len < 100);
    }

    #[test]
    fn init_diff_seeds_degraded_mode() {
        let engine = BookEngine::new("BTCUSDT", 2000, 2000, 30_000);
        engine.on_diff(diff(1, 5, vec![lvl("50.0", "1.0")], vec![lvl("51.0", "1.0")]));
        assert_eq!(engine.state(), EngineState::Degraded);
        assert!(!engine.is_valid()); // degraded books never pass the validity gate
    }
}
