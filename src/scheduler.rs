//! Global snapshot scheduler: serializes REST snapshot fetches across
//! symbols so at most one is in flight process-wide, per tick. Also drives
//! the book registry's grace-period eviction sweep on the same tick, since
//! both are periodic, low-cost, whole-registry scans.

use crate::book_registry::BookRegistry;
use crate::depth_cache::DepthCache;
use crate::rate_limiter::RateLimitTracker;
use crate::snapshot_fetcher::SnapshotFetcher;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const TICK_INTERVAL: Duration = Duration::from_millis(100);
const SNAPSHOT_LIMIT: u32 = 1000;

pub struct SnapshotScheduler {
    books: Arc<BookRegistry>,
    cache: Arc<DepthCache>,
    limiter: Arc<RateLimitTracker>,
    fetcher: Arc<SnapshotFetcher>,
}

impl SnapshotScheduler {
    pub fn new(
        books: Arc<BookRegistry>,
        cache: Arc<DepthCache>,
        limiter: Arc<RateLimitTracker>,
        fetcher: Arc<SnapshotFetcher>,
    ) -> Self {
        Self {
            books,
            cache,
            limiter,
            fetcher,
        }
    }

    /// Runs forever; intended to be spawned as its own task.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        loop {
            interval.tick().await;
            self.tick().await;
        }
    }

    async fn tick(&self) {
        self.books.sweep();

        let now = now_ms();
        let candidate = self.books.symbols().into_iter().find_map(|symbol| {
            let engine = self.books.get(&symbol)?;
            if !engine.needs_resync() || engine.resync_in_flight() {
                return None;
            }
            if now - engine.last_resync_at_ms() < engine.backoff_ms() as i64 {
                return None;
            }
            if self.limiter.should_throttle(&symbol) {
                return None;
            }
            Some((symbol, engine))
        });

        let Some((symbol, engine)) = candidate else {
            return;
        };

        if !engine.begin_resync() {
            return;
        }

        debug!(symbol = %symbol, "scheduler dispatching snapshot fetch");
        match self.fetcher.fetch(&symbol, SNAPSHOT_LIMIT, &self.cache, &self.limiter).await {
            Some(snapshot) => {
                engine.apply_snapshot(&snapshot);
            }
            None => {
                engine.resync_failed();
            }
        }
    }
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
