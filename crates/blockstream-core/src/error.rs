//! Error types for the blockstream pipeline.

use thiserror::Error;

use crate::reconcile::ReconcileError;

/// Convenience alias used throughout the crate.
pub type Result<T, E = BlockstreamError> = std::result::Result<T, E>;

/// Errors that can occur while tracking the canonical head.
#[derive(Debug, Error)]
pub enum BlockstreamError {
    /// The queue handed us a message without a body or receipt handle, or a
    /// body that does not decode into a block reference.
    #[error("Malformed message {}: {reason}", .message_id.as_deref().unwrap_or("<unknown>"))]
    MalformedMessage {
        message_id: Option<String>,
        reason: String,
    },

    #[error(transparent)]
    Reconciliation(#[from] ReconcileError),

    /// Another writer advanced the state record after we read it.
    #[error("Concurrent update of state record for network '{network_id}'")]
    ConcurrentUpdate { network_id: String },

    #[error("State store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Fan-out error: {0}")]
    FanOut(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl BlockstreamError {
    /// Returns `true` for the expected compare-and-set race outcome.
    pub fn is_concurrent_update(&self) -> bool {
        matches!(self, Self::ConcurrentUpdate { .. })
    }

    /// Returns `true` if the error is transient infrastructure trouble that a
    /// later redelivery may get past.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable(_) | Self::Queue(_) | Self::FanOut(_) | Self::ConcurrentUpdate { .. }
        )
    }

    pub(crate) fn malformed(message_id: Option<&str>, reason: impl Into<String>) -> Self {
        Self::MalformedMessage {
            message_id: message_id.map(str::to_string),
            reason: reason.into(),
        }
    }
}
