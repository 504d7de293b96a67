//! Error types for pool operations

use std::fmt;

/// Per-state account counts included in pool-exhausted errors and the
/// health summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct PoolCounts {
    pub total: usize,
    pub available: usize,
    pub cooling_down: usize,
    pub disabled: usize,
}

impl fmt::Display for PoolCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total={} available={} cooling_down={} disabled={}",
            self.total, self.available, self.cooling_down, self.disabled
        )
    }
}

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing or unmapped client credential while auth is required
    #[error("missing or invalid api key")]
    Unauthorized,

    /// No binding matched and no default route is configured
    #[error("no route configured for this request")]
    NoRoute,

    /// Every eligible candidate failed or was unavailable
    #[error("pool exhausted: {0}")]
    PoolExhausted(PoolCounts),

    /// Non-retryable upstream rejection, surfaced to the caller
    #[error("upstream fatal error ({status}): {message}")]
    UpstreamFatal { status: u16, message: String },

    /// Token refresh failed; internal to the refresher, retried next cycle
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("invalid routing config: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
