//! Error taxonomy for classification at fetch/parse boundaries.
//!
//! Top-level task bodies use `anyhow::Result` with `.context(...)`; this enum
//! exists only where a caller needs to branch on *kind* of failure (see
//! [`crate::snapshot_fetcher`]).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("rate limited by upstream")]
    RateLimited,

    #[error("transient upstream error: {0}")]
    Transient(String),

    #[error("malformed upstream payload: {0}")]
    Malformed(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}
