//! Conversation and message record types.
//!
//! Field names match the backend columns; records serialize to the row
//! shapes the transport carries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorRole {
    /// The non-admin party of the conversation.
    Participant,
    /// An admin operator.
    Operator,
}

impl AuthorRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthorRole::Participant => "participant",
            AuthorRole::Operator => "operator",
        }
    }
}

/// A conversation summary row.
///
/// Exactly one conversation exists per participant and topic; `updated_at`
/// is touched transactionally whenever a message is appended, so it is the
/// recency sort key for the directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    /// Identifier of the non-admin party.
    pub participant_id: String,
    /// Short text of the most recent message, if any.
    pub last_message_preview: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// A server-confirmed message row.
///
/// `id` and `created_at` are assigned by the authoritative store; within a
/// conversation, messages are totally ordered by `(created_at, id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub author_role: AuthorRole,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Authoritative ordering key within a conversation.
    pub fn sort_key(&self) -> (DateTime<Utc>, &str) {
        (self.created_at, &self.id)
    }
}

/// Payload for creating a message. The backend assigns `id` and
/// `created_at` and echoes the full row back in the acknowledgment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub conversation_id: String,
    pub author_role: AuthorRole,
    pub body: String,
}

/// Partial conversation row delivered on a directory-scope notification.
///
/// Push payloads may omit columns, so everything except `id` is optional;
/// absent fields leave the stored record untouched.
#[derive(Debug, Clone, Deserialize)]
pub struct ConversationPatch {
    pub id: String,
    #[serde(default)]
    pub participant_id: Option<String>,
    #[serde(default)]
    pub last_message_preview: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl ConversationPatch {
    /// Apply the patch to a stored conversation.
    ///
    /// `updated_at` never moves backwards: the subscription channel is
    /// at-least-once and possibly reordered, so a stale notification must
    /// not undo a newer one.
    pub fn apply(&self, conversation: &mut Conversation) {
        if let Some(participant_id) = &self.participant_id {
            conversation.participant_id = participant_id.clone();
        }
        match self.updated_at {
            Some(updated_at) if updated_at >= conversation.updated_at => {
                conversation.updated_at = updated_at;
                if let Some(preview) = &self.last_message_preview {
                    conversation.last_message_preview = Some(preview.clone());
                }
            }
            Some(_) => {}
            None => {
                if let Some(preview) = &self.last_message_preview {
                    conversation.last_message_preview = Some(preview.clone());
                }
            }
        }
    }
}
