//! Recency-ordered conversation listing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chat_core::{Conversation, ConversationPatch, Filter, Order, Table, Transport};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::SyncError;

#[derive(Default)]
struct DirectoryState {
    conversations: Vec<Conversation>,
    active_id: Option<String>,
    loading: bool,
}

/// The set of known conversations, sorted by recency.
///
/// The snapshot is only ever replaced wholesale by [`refresh`](Self::refresh)
/// or patched per-id by [`apply_external_update`](Self::apply_external_update);
/// partial merges of fetch results are never performed, so the snapshot
/// cannot drift from the source of truth.
pub struct ConversationDirectory {
    transport: Arc<dyn Transport>,
    state: RwLock<DirectoryState>,
    /// Stamps each refresh; a completing fetch with a stale stamp is a
    /// no-op.
    generation: AtomicU64,
}

impl ConversationDirectory {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            state: RwLock::new(DirectoryState::default()),
            generation: AtomicU64::new(0),
        }
    }

    /// Current snapshot, sorted by `updated_at` descending.
    pub async fn list_conversations(&self) -> Vec<Conversation> {
        self.state.read().await.conversations.clone()
    }

    /// Whether a refresh is in flight.
    pub async fn is_loading(&self) -> bool {
        self.state.read().await.loading
    }

    /// The selected conversation, if any.
    pub async fn active_conversation_id(&self) -> Option<String> {
        self.state.read().await.active_id.clone()
    }

    /// Record the selection. Re-binding the stream and re-pointing the
    /// subscription are driven by the engine facade.
    pub(crate) async fn set_active_conversation_id(&self, conversation_id: Option<&str>) {
        self.state.write().await.active_id = conversation_id.map(str::to_string);
    }

    /// Re-fetch the full listing, replacing the snapshot wholesale.
    ///
    /// On failure the previous snapshot is retained and the error is
    /// surfaced; retrying is the caller's decision.
    pub async fn refresh(&self) -> Result<Vec<Conversation>, SyncError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.write().await.loading = true;

        let fetched = self
            .transport
            .query(Table::Conversations, Filter::All, Order::desc("updated_at"))
            .await;

        let mut state = self.state.write().await;
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!("discarding stale directory fetch");
            return Ok(state.conversations.clone());
        }
        state.loading = false;

        match fetched {
            Ok(rows) => {
                let mut conversations = Vec::with_capacity(rows.len());
                for row in rows {
                    match serde_json::from_value::<Conversation>(row) {
                        Ok(conversation) => conversations.push(conversation),
                        Err(e) => warn!(error = %e, "skipping undecodable conversation row"),
                    }
                }
                sort_recency(&mut conversations);
                debug!(count = conversations.len(), "directory refreshed");
                state.conversations = conversations.clone();
                Ok(conversations)
            }
            Err(e) => {
                warn!(error = %e, "directory refresh failed; keeping previous snapshot");
                Err(SyncError::Fetch(e))
            }
        }
    }

    /// Merge a directory-scope notification.
    ///
    /// Known ids are patched in place and the snapshot re-sorted. An
    /// unknown id triggers a full refresh instead of fabricating a row
    /// with missing required fields.
    pub async fn apply_external_update(&self, patch: ConversationPatch) -> Result<(), SyncError> {
        {
            let mut state = self.state.write().await;
            if let Some(existing) = state
                .conversations
                .iter_mut()
                .find(|c| c.id == patch.id)
            {
                patch.apply(existing);
                sort_recency(&mut state.conversations);
                debug!(id = %patch.id, "conversation patched");
                return Ok(());
            }
        }

        debug!(id = %patch.id, "update for unknown conversation; refreshing");
        self.refresh().await.map(|_| ())
    }
}

/// Most recently updated first; ties broken by id for a stable listing.
fn sort_recency(conversations: &mut [Conversation]) {
    conversations.sort_by(|a, b| {
        b.updated_at
            .cmp(&a.updated_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn conversation(id: &str, updated_secs: i64) -> Conversation {
        Conversation {
            id: id.to_string(),
            participant_id: format!("u-{id}"),
            last_message_preview: None,
            updated_at: at(updated_secs),
            created_at: at(0),
        }
    }

    #[test]
    fn test_sort_recency_orders_descending_with_id_tiebreak() {
        let mut conversations = vec![
            conversation("c2", 100),
            conversation("c3", 300),
            conversation("c1", 100),
        ];
        sort_recency(&mut conversations);
        let ids: Vec<&str> = conversations.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c3", "c1", "c2"]);
    }
}
