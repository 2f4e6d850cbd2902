//! Canonical message list for the active conversation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chat_core::{
    AuthorRole, Filter, Message, NewMessage, Order, Table, Transport, TransportError,
};
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::entry::{MessageEntry, PendingMessage};
use crate::error::SyncError;
use crate::reconcile;

#[derive(Default)]
struct StreamState {
    conversation_id: Option<String>,
    entries: Vec<MessageEntry>,
    loading: bool,
}

/// The deduplicated, ordered message history of exactly one conversation.
///
/// Locally queued sends appear in the list immediately as pending entries;
/// the transport acknowledgment and the subscription echo both resolve
/// against them through [`reconcile`], whichever arrives first.
pub struct MessageStream {
    transport: Arc<dyn Transport>,
    state: RwLock<StreamState>,
    /// Stamps each bind; a completing fetch with a stale stamp is a no-op.
    generation: AtomicU64,
}

impl MessageStream {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            state: RwLock::new(StreamState::default()),
            generation: AtomicU64::new(0),
        }
    }

    /// The bound conversation, if any.
    pub async fn conversation_id(&self) -> Option<String> {
        self.state.read().await.conversation_id.clone()
    }

    /// Whether a history fetch is in flight.
    pub async fn is_loading(&self) -> bool {
        self.state.read().await.loading
    }

    /// Snapshot of the canonical list: pending, confirmed, and failed
    /// entries in `(created_at, id)` order.
    pub async fn list(&self) -> Vec<MessageEntry> {
        self.state.read().await.entries.clone()
    }

    /// Bind to a conversation, replacing all prior state.
    ///
    /// Pending sends of the previous conversation are discarded; switching
    /// conversations cancels in-flight optimism for the old one. Entries
    /// that accumulate against the new binding while the history fetch is
    /// in flight are reconciled into the result, not dropped. A newer
    /// bind always wins: if this fetch completes after another bind has
    /// started, its result is dropped.
    pub async fn bind(&self, conversation_id: &str) -> Result<(), SyncError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut state = self.state.write().await;
            state.conversation_id = Some(conversation_id.to_string());
            state.entries.clear();
            state.loading = true;
        }
        debug!(conversation_id, "binding message stream");

        let fetched = self
            .transport
            .query(
                Table::Messages,
                Filter::eq("conversation_id", conversation_id),
                Order::asc("created_at"),
            )
            .await;

        let mut state = self.state.write().await;
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!(conversation_id, "discarding stale history fetch");
            return Ok(());
        }
        state.loading = false;

        match fetched {
            Ok(rows) => {
                let mut entries = Vec::with_capacity(rows.len());
                for row in rows {
                    match serde_json::from_value::<Message>(row) {
                        Ok(message) => entries.push(MessageEntry::Confirmed(message)),
                        Err(e) => warn!(error = %e, "skipping undecodable message row"),
                    }
                }
                // Anything in the list now arrived while the fetch was in
                // flight: sends queued against this binding, and echoes the
                // live subscription merged. The fetch snapshot may predate
                // those records, so they are reconciled in rather than
                // replaced away.
                let inflight = std::mem::take(&mut state.entries);
                let (confirmed, local): (Vec<_>, Vec<_>) =
                    inflight.into_iter().partition(MessageEntry::is_confirmed);
                entries.extend(local);
                for entry in confirmed {
                    if let MessageEntry::Confirmed(message) = entry {
                        reconcile::insert_confirmed(&mut entries, message);
                    }
                }
                reconcile::sort_canonical(&mut entries);
                debug!(conversation_id, count = entries.len(), "history loaded");
                state.entries = entries;
                Ok(())
            }
            Err(e) => {
                warn!(conversation_id, error = %e, "history fetch failed");
                Err(SyncError::Fetch(e))
            }
        }
    }

    /// Clear all state and detach from the current conversation.
    pub async fn unbind(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.write().await;
        state.conversation_id = None;
        state.entries.clear();
        state.loading = false;
    }

    /// Queue a message optimistically and push it to the backend.
    ///
    /// The pending entry is appended to the list before the transport call
    /// starts, so it is visible immediately. On acknowledgment it is
    /// confirmed in place, or deduplicated if the subscription echo won
    /// the race. On failure it transitions to failed and stays visible
    /// until retried or discarded; it is never silently dropped.
    pub async fn send_message(
        &self,
        body: &str,
        author_role: AuthorRole,
    ) -> Result<Message, SyncError> {
        let body = body.trim();
        if body.is_empty() {
            return Err(SyncError::EmptyBody);
        }

        let pending = {
            let mut state = self.state.write().await;
            let conversation_id = state
                .conversation_id
                .clone()
                .ok_or(SyncError::NoActiveConversation)?;
            let pending = PendingMessage {
                client_token: Uuid::new_v4().to_string(),
                conversation_id,
                author_role,
                body: body.to_string(),
                queued_at: Utc::now(),
            };
            // Optimistic insert at the tail; a locally queued send is
            // assumed to be the newest message.
            state.entries.push(MessageEntry::Pending(pending.clone()));
            pending
        };

        self.dispatch(pending).await
    }

    /// Remove a failed entry and resend its body as a fresh pending send.
    pub async fn retry_failed(&self, client_token: &str) -> Result<Message, SyncError> {
        let pending = {
            let mut state = self.state.write().await;
            let failed = state
                .entries
                .iter()
                .find_map(|e| match e {
                    MessageEntry::Failed(p) if p.client_token == client_token => Some(p.clone()),
                    _ => None,
                })
                .ok_or_else(|| SyncError::UnknownToken(client_token.to_string()))?;
            if state.conversation_id.as_deref() != Some(failed.conversation_id.as_str()) {
                return Err(SyncError::NoActiveConversation);
            }
            state
                .entries
                .retain(|e| e.client_token() != Some(client_token));
            let pending = PendingMessage {
                client_token: Uuid::new_v4().to_string(),
                queued_at: Utc::now(),
                ..failed
            };
            state.entries.push(MessageEntry::Pending(pending.clone()));
            pending
        };

        debug!(client_token, "retrying failed send");
        self.dispatch(pending).await
    }

    /// Drop a failed entry without resending it.
    pub async fn discard_failed(&self, client_token: &str) -> Result<(), SyncError> {
        let mut state = self.state.write().await;
        let before = state.entries.len();
        state
            .entries
            .retain(|e| !(e.is_failed() && e.client_token() == Some(client_token)));
        if state.entries.len() == before {
            return Err(SyncError::UnknownToken(client_token.to_string()));
        }
        debug!(client_token, "failed send discarded");
        Ok(())
    }

    /// Merge a message delivered on the conversation subscription.
    ///
    /// Messages for other conversations are ignored (a late event from a
    /// torn-down scope); same-id duplicates are no-ops.
    pub async fn apply_external_message(&self, message: Message) {
        let mut state = self.state.write().await;
        if state.conversation_id.as_deref() != Some(message.conversation_id.as_str()) {
            debug!(
                conversation_id = %message.conversation_id,
                "ignoring message for unbound conversation"
            );
            return;
        }
        let outcome = reconcile::insert_confirmed(&mut state.entries, message);
        debug!(?outcome, "external message merged");
    }

    async fn dispatch(&self, pending: PendingMessage) -> Result<Message, SyncError> {
        let payload = NewMessage {
            conversation_id: pending.conversation_id.clone(),
            author_role: pending.author_role,
            body: pending.body.clone(),
        };
        let payload = match serde_json::to_value(&payload) {
            Ok(value) => value,
            Err(e) => return self.fail(pending, TransportError::Malformed(e)).await,
        };

        match self.transport.create(Table::Messages, payload).await {
            Ok(row) => {
                let message = match serde_json::from_value::<Message>(row) {
                    Ok(message) => message,
                    Err(e) => return self.fail(pending, TransportError::Malformed(e)).await,
                };
                let mut state = self.state.write().await;
                if state.conversation_id.as_deref() != Some(message.conversation_id.as_str()) {
                    // The user switched conversations mid-send; the entry
                    // was discarded by the re-bind and stays discarded.
                    debug!(id = %message.id, "acknowledgment for unbound conversation");
                    return Ok(message);
                }
                let outcome = reconcile::confirm_by_token(
                    &mut state.entries,
                    &pending.client_token,
                    message.clone(),
                );
                debug!(?outcome, id = %message.id, "send acknowledged");
                Ok(message)
            }
            Err(source) => self.fail(pending, source).await,
        }
    }

    async fn fail(
        &self,
        pending: PendingMessage,
        source: TransportError,
    ) -> Result<Message, SyncError> {
        let mut state = self.state.write().await;
        if reconcile::mark_failed(&mut state.entries, &pending.client_token) {
            warn!(
                client_token = %pending.client_token,
                error = %source,
                "send failed; entry kept for retry"
            );
        }
        Err(SyncError::Send {
            client_token: pending.client_token,
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mock_transport::InMemoryTransport;
    use serde_json::json;

    async fn bound_stream() -> (Arc<InMemoryTransport>, MessageStream) {
        let transport = Arc::new(InMemoryTransport::new());
        transport.seed_conversation("c1", "u1").await;
        let stream = MessageStream::new(Arc::clone(&transport) as Arc<dyn Transport>);
        stream.bind("c1").await.unwrap();
        (transport, stream)
    }

    #[tokio::test]
    async fn test_send_message_confirms_in_place() {
        let (_transport, stream) = bound_stream().await;

        let message = stream
            .send_message("  hello  ", AuthorRole::Operator)
            .await
            .unwrap();
        assert_eq!(message.body, "hello");

        let entries = stream.list().await;
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_confirmed());
        assert_eq!(entries[0].server_id(), Some(message.id.as_str()));
    }

    #[tokio::test]
    async fn test_send_message_rejects_empty_body() {
        let (_transport, stream) = bound_stream().await;
        assert!(matches!(
            stream.send_message("   ", AuthorRole::Operator).await,
            Err(SyncError::EmptyBody)
        ));
        assert!(stream.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_send_message_requires_binding() {
        let transport = Arc::new(InMemoryTransport::new());
        let stream = MessageStream::new(transport as Arc<dyn Transport>);
        assert!(matches!(
            stream.send_message("hi", AuthorRole::Operator).await,
            Err(SyncError::NoActiveConversation)
        ));
    }

    #[tokio::test]
    async fn test_failed_send_is_kept_and_retryable() {
        let (transport, stream) = bound_stream().await;
        transport.fail_next_creates(1);

        let token = match stream.send_message("hi", AuthorRole::Operator).await {
            Err(SyncError::Send { client_token, .. }) => client_token,
            other => panic!("expected send error, got {other:?}"),
        };

        let entries = stream.list().await;
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_failed());

        stream.retry_failed(&token).await.unwrap();
        let entries = stream.list().await;
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_confirmed());
    }

    #[tokio::test]
    async fn test_discard_failed_removes_entry() {
        let (transport, stream) = bound_stream().await;
        transport.fail_next_creates(1);

        let token = match stream.send_message("hi", AuthorRole::Operator).await {
            Err(SyncError::Send { client_token, .. }) => client_token,
            other => panic!("expected send error, got {other:?}"),
        };

        stream.discard_failed(&token).await.unwrap();
        assert!(stream.list().await.is_empty());
        assert!(matches!(
            stream.discard_failed(&token).await,
            Err(SyncError::UnknownToken(_))
        ));
    }

    #[tokio::test]
    async fn test_external_message_for_other_conversation_is_ignored() {
        let (_transport, stream) = bound_stream().await;
        stream
            .apply_external_message(Message {
                id: "m9".to_string(),
                conversation_id: "c2".to_string(),
                author_role: AuthorRole::Participant,
                body: "elsewhere".to_string(),
                created_at: Utc::now(),
            })
            .await;
        assert!(stream.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_external_message_is_noop() {
        let (_transport, stream) = bound_stream().await;
        let message = Message {
            id: "m9".to_string(),
            conversation_id: "c1".to_string(),
            author_role: AuthorRole::Participant,
            body: "hi".to_string(),
            created_at: Utc::now(),
        };
        stream.apply_external_message(message.clone()).await;
        stream.apply_external_message(message).await;
        assert_eq!(stream.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_bind_replaces_history_and_discards_pending() {
        let (transport, stream) = bound_stream().await;
        transport.seed_conversation("c2", "u2").await;
        transport
            .create(
                Table::Messages,
                json!({ "conversation_id": "c2", "author_role": "participant", "body": "other" }),
            )
            .await
            .unwrap();

        transport.fail_next_creates(1);
        let _ = stream.send_message("stuck", AuthorRole::Operator).await;
        assert_eq!(stream.list().await.len(), 1);

        stream.bind("c2").await.unwrap();
        let entries = stream.list().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].body(), "other");
        assert_eq!(stream.conversation_id().await.as_deref(), Some("c2"));
    }

    #[tokio::test]
    async fn test_rebind_keeps_echo_merged_during_fetch() {
        let transport = Arc::new(InMemoryTransport::new());
        transport.seed_conversation("c1", "u1").await;
        let stream = Arc::new(MessageStream::new(
            Arc::clone(&transport) as Arc<dyn Transport>
        ));
        stream.bind("c1").await.unwrap();
        transport
            .create(
                Table::Messages,
                json!({ "conversation_id": "c1", "author_role": "participant", "body": "earlier" }),
            )
            .await
            .unwrap();

        // Stall the re-bind's history fetch, then merge an echo the fetch
        // snapshot does not contain.
        transport.pause_queries("c1");
        let rebind = {
            let stream = Arc::clone(&stream);
            tokio::spawn(async move { stream.bind("c1").await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        stream
            .apply_external_message(Message {
                id: "m-live".to_string(),
                conversation_id: "c1".to_string(),
                author_role: AuthorRole::Participant,
                body: "while fetching".to_string(),
                created_at: Utc::now(),
            })
            .await;
        transport.release_queries("c1");
        rebind.await.unwrap().unwrap();

        let entries = stream.list().await;
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().any(|e| e.server_id() == Some("m-live")));
        assert!(entries.iter().any(|e| e.body() == "earlier"));
    }

    #[tokio::test]
    async fn test_list_stays_sorted_under_out_of_order_delivery() {
        use chrono::TimeZone;
        let (_transport, stream) = bound_stream().await;
        for (id, secs) in [("m3", 300), ("m1", 100), ("m2", 200)] {
            stream
                .apply_external_message(Message {
                    id: id.to_string(),
                    conversation_id: "c1".to_string(),
                    author_role: AuthorRole::Participant,
                    body: id.to_string(),
                    created_at: Utc.timestamp_opt(secs, 0).unwrap(),
                })
                .await;
        }
        let ids: Vec<_> = stream
            .list()
            .await
            .iter()
            .map(|e| e.server_id().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
    }
}
