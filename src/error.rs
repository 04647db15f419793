//! Error types for the orchestrator

use std::time::Duration;
use thiserror::Error;

/// Orchestrator result type
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Errors that can occur while acquiring or rejuvenating a proxy fleet
#[derive(Error, Debug)]
pub enum ProxyError {
    /// AWS SDK error
    #[error("AWS error: {0}")]
    Aws(#[from] aws_sdk_ec2::Error),

    /// Provider call failed in a way the gateway classifies as retryable
    /// (throttling, temporary unavailability). Retry policy is the caller's
    /// decision, never handled transparently inside the gateway.
    #[error("transient provider error: {0}")]
    TransientProvider(String),

    /// No remaining catalog row supports the required CPU architecture
    #[error("no catalog row supports architecture {0}")]
    NoSupportedArchitecture(String),

    /// Catalog exhausted before the target proxy capacity was reached
    #[error("insufficient capacity: fulfilled {fulfilled} of {requested} proxies")]
    InsufficientCapacity {
        /// Proxy capacity that was requested
        requested: u32,
        /// Proxy capacity that was actually credited before exhaustion
        fulfilled: u32,
    },

    /// A post-provisioning or post-rotation reachability check failed.
    /// Fatal: the experiment ends immediately, it is never retried next tick.
    #[error("liveness check failed for {}", .0.join(", "))]
    LivenessCheckFailed(Vec<String>),

    /// Cost model precondition violated (zero rejuvenation count, zero duration)
    #[error("invalid cost input: {0}")]
    InvalidCostInput(String),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Operation timed out
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
}

impl ProxyError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Convert from an EC2 SDK error, classifying throttling as transient.
    ///
    /// Throttling codes surface as [`ProxyError::TransientProvider`] so the
    /// caller can apply its retry policy; everything else is fatal.
    pub fn from_ec2<E>(err: E) -> Self
    where
        aws_sdk_ec2::Error: From<E>,
    {
        use aws_sdk_ec2::error::ProvideErrorMetadata;

        let err = aws_sdk_ec2::Error::from(err);
        match err.code() {
            Some(
                "RequestLimitExceeded" | "Throttling" | "ThrottlingException"
                | "ServiceUnavailable" | "Unavailable",
            ) => Self::TransientProvider(err.to_string()),
            _ => Self::Aws(err),
        }
    }

    /// Whether the bounded-retry policy may retry this error kind
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientProvider(_))
    }
}
