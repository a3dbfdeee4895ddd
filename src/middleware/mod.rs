//! Ambient HTTP middleware.
//!
//! This module provides request logging with latency tracking. Per-symbol
//! upstream rate limiting (C2) lives in [`crate::rate_limiter`] instead — it
//! tracks upstream `429`/`418` backoff, not inbound HTTP traffic.

pub mod logging;

pub use logging::{request_logging, request_logging_simple};
