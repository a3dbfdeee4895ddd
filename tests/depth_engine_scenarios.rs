//! End-to-end depth-engine scenarios spanning the full
//! buffer/snapshot/gap/recovery lifecycle, as opposed to the single-state
//! transitions already covered by the inline unit tests.

use depth_gateway::depth_engine::{BookEngine, EngineState};
use depth_gateway::models::{DepthSnapshot, DepthUpdate, PriceLevel};

fn lvl(p: &str, q: &str) -> PriceLevel {
    PriceLevel(p.to_string(), q.to_string())
}

fn diff(first: u64, last: u64, bids: Vec<PriceLevel>, asks: Vec<PriceLevel>) -> DepthUpdate {
    DepthUpdate {
        event_type: "depthUpdate".into(),
        event_time: 0,
        symbol: "BTCUSDT".into(),
        first_update_id: first,
        final_update_id: last,
        bids,
        asks,
    }
}

fn snap(id: u64, bid: &str, ask: &str) -> DepthSnapshot {
    DepthSnapshot {
        last_update_id: id,
        bids: vec![lvl(bid, "1.0")],
        asks: vec![lvl(ask, "1.0")],
    }
}

/// A gap after initial sync recovers cleanly once a fresh snapshot lands.
#[test]
fn gap_then_recovery_restores_a_valid_book() {
    let engine = BookEngine::new("BTCUSDT", 2000, 2000, 30_000);

    assert!(engine.begin_resync());
    assert!(engine.apply_snapshot(&snap(100, "100.0", "101.0")));
    assert!(engine.is_valid());

    // A diff that skips ahead opens a gap.
    engine.on_diff(diff(110, 120, vec![lvl("100.0", "5.0")], vec![]));
    assert_eq!(engine.state(), EngineState::Gapped);
    assert!(!engine.is_valid());

    // More diffs accumulate in the buffer while gapped.
    engine.on_diff(diff(121, 125, vec![lvl("100.0", "6.0")], vec![]));

    // Scheduler retries: new snapshot covers the gap, buffered events replay.
    assert!(engine.begin_resync());
    assert!(engine.apply_snapshot(&snap(120, "100.0", "101.0")));
    assert_eq!(engine.state(), EngineState::Synced);
    assert!(engine.is_valid());

    let book = engine.get_book(5);
    assert_eq!(book.last_update_id, 125);
    assert_eq!(book.bids[0].size, 6.0);
}

/// Degraded mode serves an approximate book before any snapshot succeeds,
/// then is fully superseded once the first snapshot commits.
#[test]
fn degraded_mode_is_superseded_by_first_snapshot() {
    let engine = BookEngine::new("BTCUSDT", 2000, 2000, 30_000);

    engine.on_diff(diff(1, 10, vec![lvl("90.0", "1.0")], vec![lvl("92.0", "1.0")]));
    assert_eq!(engine.state(), EngineState::Degraded);
    assert!(!engine.is_valid(), "degraded books never pass the validity gate");

    engine.on_diff(diff(11, 15, vec![lvl("90.0", "2.0")], vec![]));

    assert!(engine.begin_resync());
    assert_eq!(engine.state(), EngineState::Buffering);
    // lastUpdateId=10 leaves the (11,15) event straddling the boundary, so
    // replay has continuity proof; a snapshot at 15 would discard every
    // buffered event as fully stale and correctly fail replay instead.
    assert!(engine.apply_snapshot(&snap(10, "95.0", "96.0")));

    assert_eq!(engine.state(), EngineState::Synced);
    assert!(engine.is_valid());
    let book = engine.get_book(5);
    // The snapshot's own levels win; the degraded-mode price (90.0) is gone.
    assert_eq!(book.bids[0].price, "95.0");
}

/// Every buffered event is older than the snapshot itself (snapshot jumped
/// past what we'd buffered so far) — replay must fail rather than treat the
/// now-empty-after-discard buffer as if nothing had ever been buffered.
#[test]
fn replay_fails_when_snapshot_is_newer_than_the_entire_buffer() {
    let engine = BookEngine::new("BTCUSDT", 2000, 2000, 30_000);

    engine.on_diff(diff(95, 95, vec![], vec![]));
    engine.on_diff(diff(96, 96, vec![], vec![]));
    engine.on_diff(diff(97, 97, vec![], vec![]));

    assert!(engine.begin_resync());
    assert!(!engine.apply_snapshot(&snap(200, "100.0", "101.0")));
    assert_eq!(engine.state(), EngineState::Gapped);
    assert!(engine.needs_resync());
}

/// A crossed or empty book never reports valid, even while nominally synced.
#[test]
fn crossed_book_fails_the_validity_gate() {
    let engine = BookEngine::new("BTCUSDT", 2000, 2000, 30_000);
    assert!(engine.begin_resync());
    // ask below bid: a malformed/crossed snapshot.
    assert!(engine.apply_snapshot(&snap(1, "101.0", "100.0")));
    assert!(!engine.is_valid());
}

/// Repeated failed snapshot fetches (no replay attempted) back the engine
/// off without ever flipping it out of gapped/needs-resync.
#[test]
fn repeated_fetch_failures_keep_backing_off() {
    let engine = BookEngine::new("BTCUSDT", 2000, 2000, 8_000);
    assert!(engine.begin_resync());
    engine.resync_failed();
    assert_eq!(engine.backoff_ms(), 4_000);
    assert!(engine.needs_resync());
    assert!(!engine.resync_in_flight());

    assert!(engine.begin_resync());
    engine.resync_failed();
    assert_eq!(engine.backoff_ms(), 8_000); // capped
}
