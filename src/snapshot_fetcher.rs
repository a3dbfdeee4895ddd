//! Single-shot REST snapshot fetcher (C3).
//!
//! Unlike the teacher's `execute_with_retry` (which loops internally), this
//! fetcher makes exactly one request per call: retries are driven externally
//! by whatever consults [`RateLimitTracker`], matching the spec's "the
//! fetcher itself never retries" requirement.

use crate::depth_cache::DepthCache;
use crate::error::GatewayError;
use crate::models::DepthSnapshot;
use crate::rate_limiter::RateLimitTracker;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, warn};

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

pub struct SnapshotFetcher {
    client: Client,
    rest_base: String,
}

impl SnapshotFetcher {
    pub fn new(rest_base: String) -> Self {
        let client = Client::builder()
            .timeout(FETCH_TIMEOUT)
            .user_agent("depth-gateway/0.1")
            .build()
            .expect("failed to build reqwest client");
        Self { client, rest_base }
    }

    /// Fetches a bounded-depth snapshot, writing it to `cache` and updating
    /// `limiter` on success, returning `None` on any classified failure.
    pub async fn fetch(
        &self,
        symbol: &str,
        limit: u32,
        cache: &DepthCache,
        limiter: &RateLimitTracker,
    ) -> Option<DepthSnapshot> {
        let limit = limit.min(1000);
        match self.fetch_inner(symbol, limit).await {
            Ok(snapshot) => {
                limiter.on_success(symbol);
                cache.put(symbol, snapshot.clone());
                debug!(symbol, last_update_id = snapshot.last_update_id, "snapshot fetched");
                Some(snapshot)
            }
            Err(GatewayError::RateLimited) => {
                warn!(symbol, "upstream rate limited snapshot fetch");
                limiter.on_rate_limited(symbol);
                None
            }
            Err(e) => {
                warn!(symbol, error = %e, "snapshot fetch failed");
                limiter.on_error(symbol);
                None
            }
        }
    }

    async fn fetch_inner(&self, symbol: &str, limit: u32) -> Result<DepthSnapshot, GatewayError> {
        let url = format!("{}/fapi/v1/depth", self.rest_base);
        let response = tokio::time::timeout(
            FETCH_TIMEOUT,
            self.client
                .get(&url)
                .query(&[("symbol", symbol), ("limit", &limit.to_string())])
                .send(),
        )
        .await
        .map_err(|_| GatewayError::Transient("request timed out".into()))?
        .map_err(|e| GatewayError::Transient(e.to_string()))?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::TOO_MANY_REQUESTS | StatusCode::IM_A_TEAPOT => {
                return Err(GatewayError::RateLimited)
            }
            status => return Err(GatewayError::Transient(format!("http {status}"))),
        }

        let snapshot: DepthSnapshot = response
            .json()
            .await
            .map_err(|e| GatewayError::Malformed(e.to_string()))?;
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_host_is_classified_as_transient_error() {
        let fetcher = SnapshotFetcher::new("https://depth-gateway.invalid.test".to_string());
        let err = fetcher.fetch_inner("BTCUSDT", 5000).await.unwrap_err();
        assert!(matches!(err, GatewayError::Transient(_)));
    }
}
