//! Merge rules for optimistic and authoritative message records.
//!
//! Two asynchronous completion paths can deliver the authoritative
//! identity of the same locally queued send: the create acknowledgment and
//! the subscription echo, in either order. The merge rule is: the first
//! authoritative record to arrive wins and retires the pending entry's
//! client token; a second arrival for the same server id is a no-op.
//!
//! The subscription channel does not carry the client token, so echoes are
//! matched to pending entries by a composite key (conversation, author,
//! trimmed body, send-time window). Two identical bodies inside the window
//! can be confused with each other; the acknowledgment path deduplicates
//! by server id, so nothing is lost or doubled either way.

use chat_core::Message;
use chrono::Duration;

use crate::entry::{MessageEntry, PendingMessage};

/// How far a pending entry's queue time may sit from the server timestamp
/// of an echo and still be treated as the same send. Generous, because the
/// two clocks are unrelated.
pub const ECHO_MATCH_WINDOW_SECS: i64 = 30;

/// Outcome of merging one authoritative record into the canonical list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// A record with this server id was already present; nothing changed.
    Duplicate,
    /// A pending entry was promoted in place.
    Promoted,
    /// The record was inserted as a new entry.
    Inserted,
}

/// Restore the canonical `(created_at, id)` ascending order.
pub fn sort_canonical(entries: &mut [MessageEntry]) {
    entries.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
}

fn matches_pending(pending: &PendingMessage, message: &Message) -> bool {
    pending.conversation_id == message.conversation_id
        && pending.author_role == message.author_role
        && pending.body == message.body.trim()
        && (message.created_at - pending.queued_at).abs()
            <= Duration::seconds(ECHO_MATCH_WINDOW_SECS)
}

fn contains_id(entries: &[MessageEntry], id: &str) -> bool {
    entries.iter().any(|e| e.server_id() == Some(id))
}

/// Merge an authoritative record that arrived on the subscription channel.
///
/// Same-id duplicates are no-ops. Otherwise the oldest pending entry
/// matching the composite key is promoted in place; with no match the
/// record is inserted in sorted position.
pub fn insert_confirmed(entries: &mut Vec<MessageEntry>, message: Message) -> Reconciliation {
    if contains_id(entries, &message.id) {
        return Reconciliation::Duplicate;
    }

    let slot = entries.iter().position(
        |e| matches!(e, MessageEntry::Pending(p) if matches_pending(p, &message)),
    );
    match slot {
        Some(slot) => {
            entries[slot] = MessageEntry::Confirmed(message);
            sort_canonical(entries);
            Reconciliation::Promoted
        }
        None => {
            entries.push(MessageEntry::Confirmed(message));
            sort_canonical(entries);
            Reconciliation::Inserted
        }
    }
}

/// Merge the create acknowledgment for a locally queued send.
///
/// If the echo already retired the token, the acknowledgment deduplicates
/// by server id. If the echo landed but missed the heuristic match (it was
/// inserted as its own entry), the pending entry is removed here rather
/// than confirmed into a second copy.
pub fn confirm_by_token(
    entries: &mut Vec<MessageEntry>,
    client_token: &str,
    message: Message,
) -> Reconciliation {
    let duplicate = contains_id(entries, &message.id);
    let slot = entries.iter().position(
        |e| matches!(e, MessageEntry::Pending(p) if p.client_token == client_token),
    );
    match slot {
        Some(slot) if duplicate => {
            entries.remove(slot);
            Reconciliation::Duplicate
        }
        Some(slot) => {
            entries[slot] = MessageEntry::Confirmed(message);
            sort_canonical(entries);
            Reconciliation::Promoted
        }
        None if duplicate => Reconciliation::Duplicate,
        None => {
            // The token is gone (a re-bind discarded the entry) but the
            // record is authoritative for this conversation; keep it.
            entries.push(MessageEntry::Confirmed(message));
            sort_canonical(entries);
            Reconciliation::Inserted
        }
    }
}

/// Transition a pending entry to the failed state.
///
/// Returns false if no pending entry carries the token (for example after
/// a re-bind discarded it).
pub fn mark_failed(entries: &mut [MessageEntry], client_token: &str) -> bool {
    for entry in entries.iter_mut() {
        if let MessageEntry::Pending(pending) = entry {
            if pending.client_token == client_token {
                *entry = MessageEntry::Failed(pending.clone());
                return true;
            }
        }
    }
    false
}
