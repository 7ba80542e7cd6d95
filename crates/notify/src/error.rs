//! Error types for notification channels.

use thiserror::Error;

/// Errors that can occur when delivering an alert.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Webhook request could not be sent
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Channel has no webhook configured
    #[error("Channel not configured: {0} is not set")]
    NotConfigured(String),

    /// Rate limited by the service
    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Channel did not answer within the delivery bound
    #[error("Timed out after {0}s")]
    Timeout(u64),

    /// Webhook answered with a non-success status
    #[error("{0}")]
    Other(String),
}
