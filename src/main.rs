//! Market-data fan-out gateway: proxies a single upstream exchange
//! WebSocket and REST depth endpoint to many downstream browser clients.

use depth_gateway::api::{router, AppState};
use depth_gateway::book_registry::BookRegistry;
use depth_gateway::config::Config;
use depth_gateway::depth_cache::DepthCache;
use depth_gateway::rate_limiter::RateLimitTracker;
use depth_gateway::registry::ClientRegistry;
use depth_gateway::scheduler::SnapshotScheduler;
use depth_gateway::snapshot_fetcher::SnapshotFetcher;
use depth_gateway::upstream::UpstreamManager;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Arc::new(Config::from_env()?);
    info!(port = config.port, "starting depth gateway");

    let cache = Arc::new(DepthCache::new(config.cache_ttl_ms));
    let limiter = Arc::new(RateLimitTracker::new(
        config.min_backoff_ms,
        config.max_backoff_ms,
        config.rate_limit_interval_ms,
    ));
    let fetcher = Arc::new(SnapshotFetcher::new(config.upstream_rest_base.clone()));
    let books = Arc::new(BookRegistry::new(&config));
    let (clients, symbols_rx) = ClientRegistry::new();
    let upstream = UpstreamManager::new(
        config.upstream_ws_base.clone(),
        books.clone(),
        clients.clone(),
        config.min_backoff_ms,
        config.max_reconnect_delay_ms,
    );

    tokio::spawn(upstream.clone().run(symbols_rx));
    tokio::spawn(
        SnapshotScheduler::new(books.clone(), cache.clone(), limiter.clone(), fetcher.clone()).run(),
    );

    let state = AppState {
        config: config.clone(),
        cache,
        limiter,
        fetcher,
        clients,
        books,
        upstream,
        started_at: Instant::now(),
    };

    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
