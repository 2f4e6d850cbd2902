//! Engine error types.
//!
//! Nothing here is fatal: fetch failures retain the previous snapshot,
//! send failures leave a retryable entry in the list, and subscription
//! failures degrade to manual refresh.

use chat_core::TransportError;
use thiserror::Error;

/// Errors surfaced by the synchronization engine.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The message body was empty after trimming; nothing was sent.
    #[error("message body is empty")]
    EmptyBody,

    /// No conversation is bound; the operation needs an active one.
    #[error("no active conversation")]
    NoActiveConversation,

    /// A directory or history fetch failed; the previous snapshot is
    /// retained.
    #[error("fetch failed: {0}")]
    Fetch(#[source] TransportError),

    /// A create command failed; the entry named by `client_token` is now
    /// in the failed state and can be retried or discarded.
    #[error("send failed ({client_token}): {source}")]
    Send {
        client_token: String,
        #[source]
        source: TransportError,
    },

    /// A standing subscription could not be established; live updates are
    /// unavailable until the next successful subscribe.
    #[error("live updates unavailable: {0}")]
    Subscription(#[source] TransportError),

    /// The token does not name a failed entry in the current list.
    #[error("no failed entry for client token {0}")]
    UnknownToken(String),
}
