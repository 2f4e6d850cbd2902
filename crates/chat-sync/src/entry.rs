//! Per-message delivery state.

use chat_core::{AuthorRole, Message};
use chrono::{DateTime, Utc};

/// A locally queued message awaiting its authoritative identity.
///
/// The client token is a local correlation id only; it never becomes the
/// message identity and is retired the moment a server record arrives.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMessage {
    pub client_token: String,
    pub conversation_id: String,
    pub author_role: AuthorRole,
    /// Trimmed body text.
    pub body: String,
    /// Local queue time; stands in for `created_at` until confirmation.
    pub queued_at: DateTime<Utc>,
}

/// One entry in the canonical message list.
///
/// The only legal transitions are `Pending -> Confirmed` and
/// `Pending -> Failed`; confirmed and failed entries never change state
/// again. Retrying a failed entry removes it and queues a fresh pending
/// send with a new token.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageEntry {
    /// Queued locally, not yet acknowledged.
    Pending(PendingMessage),
    /// Has a server-assigned identity and timestamp; immutable.
    Confirmed(Message),
    /// The create command failed; user-actionable (retry or discard).
    Failed(PendingMessage),
}

impl MessageEntry {
    pub fn body(&self) -> &str {
        match self {
            MessageEntry::Pending(p) | MessageEntry::Failed(p) => &p.body,
            MessageEntry::Confirmed(m) => &m.body,
        }
    }

    pub fn author_role(&self) -> AuthorRole {
        match self {
            MessageEntry::Pending(p) | MessageEntry::Failed(p) => p.author_role,
            MessageEntry::Confirmed(m) => m.author_role,
        }
    }

    pub fn conversation_id(&self) -> &str {
        match self {
            MessageEntry::Pending(p) | MessageEntry::Failed(p) => &p.conversation_id,
            MessageEntry::Confirmed(m) => &m.conversation_id,
        }
    }

    /// Server timestamp for confirmed entries, local queue time otherwise.
    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            MessageEntry::Pending(p) | MessageEntry::Failed(p) => p.queued_at,
            MessageEntry::Confirmed(m) => m.created_at,
        }
    }

    /// The local correlation token, present only while unconfirmed.
    pub fn client_token(&self) -> Option<&str> {
        match self {
            MessageEntry::Pending(p) | MessageEntry::Failed(p) => Some(&p.client_token),
            MessageEntry::Confirmed(_) => None,
        }
    }

    /// The authoritative id, present only once confirmed.
    pub fn server_id(&self) -> Option<&str> {
        match self {
            MessageEntry::Confirmed(m) => Some(&m.id),
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, MessageEntry::Pending(_))
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, MessageEntry::Confirmed(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, MessageEntry::Failed(_))
    }

    /// Canonical ordering key: `(created_at, id)` for confirmed entries;
    /// unconfirmed entries use their queue time with the client token as
    /// the tiebreak.
    pub(crate) fn sort_key(&self) -> (DateTime<Utc>, &str) {
        match self {
            MessageEntry::Confirmed(m) => (m.created_at, m.id.as_str()),
            MessageEntry::Pending(p) | MessageEntry::Failed(p) => {
                (p.queued_at, p.client_token.as_str())
            }
        }
    }
}
