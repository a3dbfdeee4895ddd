//! Environment-driven configuration.

use anyhow::{Context, Result};

/// Process-wide configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub allowed_origins: Vec<String>,
    pub upstream_rest_base: String,
    pub upstream_ws_base: String,
    pub min_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub rate_limit_interval_ms: u64,
    pub cache_ttl_ms: u64,
    pub max_buffer: usize,
    pub max_reconnect_delay_ms: u64,
    pub book_grace_ms: i64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let port = env_parse("PORT", 8787)?;
        let allowed_origins = std::env::var("ALLOWED_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let upstream_rest_base = std::env::var("UPSTREAM_REST_BASE")
            .unwrap_or_else(|_| "https://fapi.binance.com".to_string());
        let upstream_ws_base = std::env::var("UPSTREAM_WS_BASE")
            .unwrap_or_else(|_| "wss://fstream.binance.com".to_string());

        let min_backoff_ms = env_parse("MIN_BACKOFF_MS", 2000)?;
        let max_backoff_ms = env_parse("MAX_BACKOFF_MS", 30_000)?;
        let rate_limit_interval_ms = env_parse("RATE_LIMIT_INTERVAL_MS", 500)?;
        let cache_ttl_ms = env_parse("CACHE_TTL_MS", 5_000)?;
        let max_buffer = env_parse("MAX_BUFFER", 2_000)?;
        let max_reconnect_delay_ms = env_parse("MAX_RECONNECT_DELAY_MS", 30_000)?;
        let book_grace_ms = env_parse("BOOK_GRACE_MS", 60_000)?;

        if min_backoff_ms > max_backoff_ms {
            anyhow::bail!("MIN_BACKOFF_MS ({min_backoff_ms}) exceeds MAX_BACKOFF_MS ({max_backoff_ms})");
        }

        Ok(Self {
            port,
            allowed_origins,
            upstream_rest_base,
            upstream_ws_base,
            min_backoff_ms,
            max_backoff_ms,
            rate_limit_interval_ms,
            cache_ttl_ms,
            max_buffer,
            max_reconnect_delay_ms,
            book_grace_ms,
        })
    }
}

/// Parses an environment variable, failing loudly on a present-but-invalid
/// value rather than silently falling back to `default` — a bad override is
/// a deploy-time mistake worth surfacing, not masking.
fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {key}={raw:?}: {e}"))
            .with_context(|| format!("parsing env var {key}")),
        Err(_) => Ok(default),
    }
}
