//! Upstream stream manager (C5): owns the single shared exchange
//! WebSocket connection, diffs the desired subscription set against what's
//! currently open, and reconnects with backoff+jitter on loss.
//!
//! Structurally this is the teacher's `binance_hardened_ingest::run_connection`
//! skeleton (connect-with-timeout, split, select-loop over read/heartbeat)
//! generalized from a fixed `@bookTicker` symbol list to a dynamic combined
//! stream built from the client registry's subscription union, and with the
//! backoff formula replaced by this crate's own `min(1000*2^n,max)+jitter`.

use crate::book_registry::BookRegistry;
use crate::models::{DepthUpdate, StreamFrame};
use crate::registry::ClientRegistry;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const MAX_MISSED_PONGS: u32 = 2;

pub const STATE_DISCONNECTED: u8 = 0;
pub const STATE_CONNECTING: u8 = 1;
pub const STATE_CONNECTED: u8 = 2;

pub struct UpstreamManager {
    ws_base: String,
    books: Arc<BookRegistry>,
    clients: Arc<ClientRegistry>,
    state: AtomicU8,
    reconnect_attempt: AtomicU32,
    min_backoff_ms: u64,
    max_reconnect_delay_ms: u64,
}

impl UpstreamManager {
    pub fn new(
        ws_base: String,
        books: Arc<BookRegistry>,
        clients: Arc<ClientRegistry>,
        min_backoff_ms: u64,
        max_reconnect_delay_ms: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            ws_base,
            books,
            clients,
            state: AtomicU8::new(STATE_DISCONNECTED),
            reconnect_attempt: AtomicU32::new(0),
            min_backoff_ms,
            max_reconnect_delay_ms,
        })
    }

    pub fn state_str(&self) -> &'static str {
        match self.state.load(Ordering::Relaxed) {
            STATE_CONNECTING => "connecting",
            STATE_CONNECTED => "connected",
            _ => "disconnected",
        }
    }

    fn set_state(&self, s: u8) {
        self.state.store(s, Ordering::Relaxed);
    }

    /// Runs forever; spawn as its own task. `symbols_rx` carries the
    /// client-registry's subscription union.
    pub async fn run(self: Arc<Self>, mut symbols_rx: watch::Receiver<HashSet<String>>) {
        loop {
            let symbols = symbols_rx.borrow().clone();
            if symbols.is_empty() {
                self.set_state(STATE_DISCONNECTED);
                if symbols_rx.changed().await.is_err() {
                    return;
                }
                continue;
            }

            self.set_state(STATE_CONNECTING);
            let url = build_combined_stream_url(&self.ws_base, &symbols);

            match timeout(CONNECT_TIMEOUT, connect_async(&url)).await {
                Ok(Ok((ws_stream, _))) => {
                    self.reconnect_attempt.store(0, Ordering::Relaxed);
                    self.set_state(STATE_CONNECTED);
                    info!(stream_count = symbols.len(), "upstream connected");
                    self.run_connection(ws_stream, &mut symbols_rx).await;
                    info!("upstream connection ended");
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "upstream connect failed");
                }
                Err(_) => {
                    warn!("upstream connect timed out");
                }
            }

            self.set_state(STATE_DISCONNECTED);
            let attempt = self.reconnect_attempt.fetch_add(1, Ordering::Relaxed);
            let delay = reconnect_delay(attempt, self.min_backoff_ms, self.max_reconnect_delay_ms);
            tokio::time::sleep(delay).await;
        }
    }

    async fn run_connection<S>(&self, ws_stream: S, symbols_rx: &mut watch::Receiver<HashSet<String>>)
    where
        S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
            + futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
            + Unpin,
    {
        let (mut write, mut read) = ws_stream.split();
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await; // first tick fires immediately; consume it
        let mut missed_pongs: u32 = 0;

        loop {
            tokio::select! {
                changed = symbols_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    return; // subscription set moved; caller reconnects with new streams
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(WsMessage::Text(text))) => {
                            missed_pongs = 0;
                            self.handle_frame(&text);
                        }
                        Some(Ok(WsMessage::Ping(payload))) => {
                            let _ = write.send(WsMessage::Pong(payload)).await;
                        }
                        Some(Ok(WsMessage::Pong(_))) => {
                            missed_pongs = 0;
                        }
                        Some(Ok(WsMessage::Close(_))) => {
                            return;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "upstream read error");
                            return;
                        }
                        None => return,
                    }
                }
                _ = heartbeat.tick() => {
                    if missed_pongs >= MAX_MISSED_PONGS {
                        warn!("upstream heartbeat missed, reconnecting");
                        return;
                    }
                    missed_pongs += 1;
                    let _ = write.send(WsMessage::Ping(Vec::new())).await;
                }
            }
        }
    }

    fn handle_frame(&self, raw: &str) {
        let frame: StreamFrame = match serde_json::from_str(raw) {
            Ok(f) => f,
            Err(_) => {
                // malformed envelope: forward blind rather than drop a client's data
                self.clients.broadcast(None, raw.to_string());
                return;
            }
        };

        let symbol = frame.data.get("s").and_then(|v| v.as_str()).map(str::to_string);
        self.clients.broadcast(symbol.as_deref(), raw.to_string());

        if frame.data.get("e").and_then(|v| v.as_str()) == Some("depthUpdate") {
            if let Ok(update) = serde_json::from_value::<DepthUpdate>(frame.data) {
                let engine = self.books.get_or_create(&update.symbol);
                engine.on_diff(update);
            }
        }
    }
}

fn build_combined_stream_url(ws_base: &str, symbols: &HashSet<String>) -> String {
    let mut streams: Vec<String> = symbols
        .iter()
        .flat_map(|s| {
            let lower = s.to_lowercase();
            vec![
                format!("{lower}@depth@100ms"),
                format!("{lower}@aggTrade"),
                format!("{lower}@miniTicker"),
            ]
        })
        .collect();
    streams.sort();
    format!("{ws_base}/stream?streams={}", streams.join("/"))
}

/// `min(1000*2^n, max) + jitter[0,1000)`, jitter drawn from a cheap xorshift
/// PRNG seeded off the clock, the same technique the teacher's
/// `BackoffCalculator` uses to avoid pulling in a full `rand` dependency for
/// one jitter draw on the reconnect path.
fn reconnect_delay(attempt: u32, _min_backoff_ms: u64, max_reconnect_delay_ms: u64) -> Duration {
    let base = 1000u64.saturating_mul(1u64 << attempt.min(20));
    let capped = base.min(max_reconnect_delay_ms);
    let jitter = xorshift_jitter(1000);
    Duration::from_millis(capped + jitter)
}

fn xorshift_jitter(bound: u64) -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let seed = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos() as u64;
    let mut x = seed ^ 0x9E3779B97F4A7C15;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x % bound.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_stream_url_includes_all_three_channels() {
        let symbols = HashSet::from(["BTCUSDT".to_string()]);
        let url = build_combined_stream_url("wss://fstream.binance.com", &symbols);
        assert!(url.contains("btcusdt@depth@100ms"));
        assert!(url.contains("btcusdt@aggTrade"));
        assert!(url.contains("btcusdt@miniTicker"));
    }

    #[test]
    fn reconnect_delay_caps_at_max() {
        let d = reconnect_delay(20, 2000, 30_000);
        assert!(d.as_millis() as u64 <= 30_000 + 1000);
    }

    #[test]
    fn reconnect_delay_grows_with_attempt() {
        let d0 = reconnect_delay(0, 2000, 30_000).as_millis() as u64;
        let d3 = reconnect_delay(3, 2000, 30_000).as_millis() as u64;
        assert!(d3 >= d0);
    }
}
