//! Transport error types.

use thiserror::Error;

use crate::transport::SubscriptionHandle;

/// Errors that can occur while talking to the hosted data backend.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The backend could not be reached.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The backend rejected the request.
    #[error("backend rejected request: {0}")]
    Rejected(String),

    /// A record could not be encoded or decoded.
    #[error("malformed record: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The handle does not name a live subscription.
    #[error("unknown subscription handle {0}")]
    UnknownHandle(SubscriptionHandle),
}
