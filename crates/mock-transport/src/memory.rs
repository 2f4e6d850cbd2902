//! Deterministic in-memory transport.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use chat_core::{
    Filter, Order, RecordEvent, Subscription, SubscriptionHandle, Table, Transport, TransportError,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::debug;

/// Channel capacity for subscription event delivery.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Wall clock at construction, truncated to whole seconds. Every record
/// gets this base plus one second per sequence number, so orderings are
/// deterministic while timestamps stay close enough to the local clock
/// for the engine's echo-match window.
fn base_time() -> DateTime<Utc> {
    Utc.timestamp_opt(Utc::now().timestamp(), 0).unwrap()
}

#[derive(Default)]
struct Tables {
    conversations: Vec<Value>,
    messages: Vec<Value>,
}

impl Tables {
    fn rows(&self, table: Table) -> &Vec<Value> {
        match table {
            Table::Conversations => &self.conversations,
            Table::Messages => &self.messages,
        }
    }
}

struct SubEntry {
    handle: SubscriptionHandle,
    table: Table,
    filter: Filter,
    tx: mpsc::Sender<RecordEvent>,
}

/// An in-memory backend with deterministic ids and timestamps.
///
/// Message creates transactionally touch the parent conversation
/// (`updated_at`, `last_message_preview`) and broadcast events to matching
/// subscribers *before* the create acknowledgment returns, which is the
/// ordering that makes echo-before-ack races reachable. Test controls:
///
/// - [`pause_acks`](Self::pause_acks) holds acknowledgments after their
///   events went out, forcing the echo to win the race
/// - [`pause_queries`](Self::pause_queries) stalls history fetches for one
///   conversation, forcing bind races
/// - [`pause_listing_queries`](Self::pause_listing_queries) stalls
///   conversation-table fetches, forcing directory refresh races
/// - [`fail_next_creates`](Self::fail_next_creates) /
///   [`fail_next_subscribes`](Self::fail_next_subscribes) inject failures
pub struct InMemoryTransport {
    tables: Mutex<Tables>,
    subs: Mutex<Vec<SubEntry>>,
    base: DateTime<Utc>,
    next_seq: AtomicU64,
    next_handle: AtomicU64,
    fail_creates: AtomicU32,
    fail_queries: AtomicU32,
    fail_subscribes: AtomicU32,
    acks_paused: watch::Sender<bool>,
    paused_queries: watch::Sender<Vec<String>>,
    listing_paused: watch::Sender<bool>,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTransport {
    pub fn new() -> Self {
        let (acks_paused, _) = watch::channel(false);
        let (paused_queries, _) = watch::channel(Vec::new());
        let (listing_paused, _) = watch::channel(false);
        Self {
            tables: Mutex::new(Tables::default()),
            subs: Mutex::new(Vec::new()),
            base: base_time(),
            next_seq: AtomicU64::new(1),
            next_handle: AtomicU64::new(1),
            fail_creates: AtomicU32::new(0),
            fail_queries: AtomicU32::new(0),
            fail_subscribes: AtomicU32::new(0),
            acks_paused,
            paused_queries,
            listing_paused,
        }
    }

    /// Insert a conversation row directly, without emitting events.
    pub async fn seed_conversation(&self, id: &str, participant_id: &str) -> Value {
        let created_at = self.next_timestamp();
        let row = json!({
            "id": id,
            "participant_id": participant_id,
            "last_message_preview": Value::Null,
            "updated_at": created_at,
            "created_at": created_at,
        });
        self.tables.lock().await.conversations.push(row.clone());
        row
    }

    /// Fail the next `n` create calls.
    pub fn fail_next_creates(&self, n: u32) {
        self.fail_creates.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` query calls.
    pub fn fail_next_queries(&self, n: u32) {
        self.fail_queries.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` subscribe calls.
    pub fn fail_next_subscribes(&self, n: u32) {
        self.fail_subscribes.store(n, Ordering::SeqCst);
    }

    /// Hold create acknowledgments after their events have been broadcast.
    pub fn pause_acks(&self) {
        // `send` would discard the value while no receiver exists; waiters
        // only subscribe after the pause must already be in effect.
        self.acks_paused.send_replace(true);
    }

    /// Release held acknowledgments.
    pub fn release_acks(&self) {
        self.acks_paused.send_replace(false);
    }

    /// Stall history queries for one conversation.
    pub fn pause_queries(&self, conversation_id: &str) {
        let id = conversation_id.to_string();
        self.paused_queries.send_modify(|paused| {
            if !paused.contains(&id) {
                paused.push(id);
            }
        });
    }

    /// Release stalled queries for one conversation.
    pub fn release_queries(&self, conversation_id: &str) {
        self.paused_queries
            .send_modify(|paused| paused.retain(|id| id != conversation_id));
    }

    /// Stall conversation-table queries.
    pub fn pause_listing_queries(&self) {
        self.listing_paused.send_replace(true);
    }

    /// Release stalled conversation-table queries.
    pub fn release_listing_queries(&self) {
        self.listing_paused.send_replace(false);
    }

    /// Number of live subscriptions, across all scopes.
    pub async fn active_subscription_count(&self) -> usize {
        self.subs.lock().await.len()
    }

    fn next_timestamp(&self) -> DateTime<Utc> {
        let n = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.base + Duration::seconds(n as i64)
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    async fn broadcast(&self, table: Table, event: RecordEvent) {
        let subs = self.subs.lock().await;
        for sub in subs
            .iter()
            .filter(|s| s.table == table && s.filter.matches(event.record()))
        {
            // A closed receiver just means the consumer went away.
            let _ = sub.tx.send(event.clone()).await;
        }
    }

    async fn wait_while_acks_paused(&self) {
        let mut rx = self.acks_paused.subscribe();
        while *rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    async fn wait_while_listing_paused(&self) {
        let mut rx = self.listing_paused.subscribe();
        while *rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    async fn wait_while_query_paused(&self, conversation_id: &str) {
        let mut rx = self.paused_queries.subscribe();
        while rx
            .borrow_and_update()
            .iter()
            .any(|id| id == conversation_id)
        {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    async fn create_message(&self, payload: Value) -> Result<Value, TransportError> {
        let conversation_id = payload
            .get("conversation_id")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                TransportError::Rejected("message payload missing conversation_id".to_string())
            })?
            .to_string();
        let body = payload
            .get("body")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let n = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let created_at = self.base + Duration::seconds(n as i64);
        let mut row = payload;
        row["id"] = json!(format!("m{n}"));
        row["created_at"] = json!(created_at);

        // Message insert and conversation touch are one transaction.
        let touched = {
            let mut tables = self.tables.lock().await;
            let Some(conversation) = tables
                .conversations
                .iter_mut()
                .find(|c| c["id"].as_str() == Some(conversation_id.as_str()))
            else {
                return Err(TransportError::Rejected(format!(
                    "unknown conversation: {conversation_id}"
                )));
            };
            conversation["updated_at"] = json!(created_at);
            conversation["last_message_preview"] = json!(body);
            let touched = conversation.clone();
            tables.messages.push(row.clone());
            touched
        };

        self.broadcast(Table::Messages, RecordEvent::Created(row.clone()))
            .await;
        self.broadcast(Table::Conversations, RecordEvent::Updated(touched))
            .await;
        Ok(row)
    }

    async fn create_conversation(&self, payload: Value) -> Result<Value, TransportError> {
        let n = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let created_at = self.base + Duration::seconds(n as i64);
        let mut row = payload;
        if row.get("id").map_or(true, Value::is_null) {
            row["id"] = json!(format!("c{n}"));
        }
        row["created_at"] = json!(created_at);
        row["updated_at"] = json!(created_at);
        if row.get("last_message_preview").is_none() {
            row["last_message_preview"] = Value::Null;
        }

        self.tables.lock().await.conversations.push(row.clone());
        self.broadcast(Table::Conversations, RecordEvent::Created(row.clone()))
            .await;
        Ok(row)
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn create(&self, table: Table, payload: Value) -> Result<Value, TransportError> {
        if Self::take_failure(&self.fail_creates) {
            return Err(TransportError::Unavailable(
                "injected create failure".to_string(),
            ));
        }
        if !payload.is_object() {
            return Err(TransportError::Rejected(
                "payload must be an object".to_string(),
            ));
        }

        let row = match table {
            Table::Messages => self.create_message(payload).await?,
            Table::Conversations => self.create_conversation(payload).await?,
        };

        // Events are already out; the acknowledgment is what gets held.
        self.wait_while_acks_paused().await;
        Ok(row)
    }

    async fn query(
        &self,
        table: Table,
        filter: Filter,
        order: Order,
    ) -> Result<Vec<Value>, TransportError> {
        if Self::take_failure(&self.fail_queries) {
            return Err(TransportError::Unavailable(
                "injected query failure".to_string(),
            ));
        }
        if table == Table::Conversations {
            self.wait_while_listing_paused().await;
        }
        if let Filter::Eq {
            column: "conversation_id",
            value,
        } = &filter
        {
            self.wait_while_query_paused(value).await;
        }

        let tables = self.tables.lock().await;
        let mut rows: Vec<Value> = tables
            .rows(table)
            .iter()
            .filter(|row| filter.matches(row))
            .cloned()
            .collect();
        drop(tables);

        // Timestamps serialize as RFC 3339 with fixed precision, so string
        // comparison orders them correctly.
        rows.sort_by(|a, b| {
            let key = |row: &Value| {
                (
                    row.get(order.column)
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    row.get("id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                )
            };
            let ordering = key(a).cmp(&key(b));
            if order.ascending {
                ordering
            } else {
                ordering.reverse()
            }
        });
        Ok(rows)
    }

    async fn subscribe(
        &self,
        table: Table,
        filter: Filter,
    ) -> Result<Subscription, TransportError> {
        if Self::take_failure(&self.fail_subscribes) {
            return Err(TransportError::Unavailable(
                "injected subscribe failure".to_string(),
            ));
        }

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let handle = SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        self.subs.lock().await.push(SubEntry {
            handle,
            table,
            filter,
            tx,
        });
        debug!(table = table.as_str(), ?handle, "subscription opened");
        Ok(Subscription { handle, events: rx })
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), TransportError> {
        let mut subs = self.subs.lock().await;
        let Some(slot) = subs.iter().position(|s| s.handle == handle) else {
            return Err(TransportError::UnknownHandle(handle));
        };
        subs.remove(slot); // dropping the sender closes the event channel
        debug!(?handle, "subscription closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_message_assigns_identity_and_touches_conversation() {
        let transport = InMemoryTransport::new();
        transport.seed_conversation("c1", "u1").await;

        let row = transport
            .create(
                Table::Messages,
                json!({ "conversation_id": "c1", "author_role": "participant", "body": "hi" }),
            )
            .await
            .unwrap();
        assert_eq!(row["id"], "m2");
        assert!(row["created_at"].is_string());

        let conversations = transport
            .query(Table::Conversations, Filter::All, Order::desc("updated_at"))
            .await
            .unwrap();
        assert_eq!(conversations[0]["last_message_preview"], "hi");
        assert_eq!(conversations[0]["updated_at"], row["created_at"]);
    }

    #[tokio::test]
    async fn test_create_message_rejects_unknown_conversation() {
        let transport = InMemoryTransport::new();
        let result = transport
            .create(
                Table::Messages,
                json!({ "conversation_id": "missing", "author_role": "operator", "body": "hi" }),
            )
            .await;
        assert!(matches!(result, Err(TransportError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_subscription_receives_matching_events_only() {
        let transport = InMemoryTransport::new();
        transport.seed_conversation("c1", "u1").await;
        transport.seed_conversation("c2", "u2").await;

        let mut sub = transport
            .subscribe(Table::Messages, Filter::eq("conversation_id", "c1"))
            .await
            .unwrap();

        for conversation in ["c1", "c2"] {
            transport
                .create(
                    Table::Messages,
                    json!({ "conversation_id": conversation, "author_role": "participant", "body": "hi" }),
                )
                .await
                .unwrap();
        }

        let event = sub.events.recv().await.unwrap();
        assert_eq!(event.record()["conversation_id"], "c1");
        assert!(sub.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_closes_channel() {
        let transport = InMemoryTransport::new();
        let sub = transport
            .subscribe(Table::Conversations, Filter::All)
            .await
            .unwrap();
        assert_eq!(transport.active_subscription_count().await, 1);

        transport.unsubscribe(sub.handle).await.unwrap();
        assert_eq!(transport.active_subscription_count().await, 0);

        let mut events = sub.events;
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_failure_injection_is_consumed() {
        let transport = InMemoryTransport::new();
        transport.seed_conversation("c1", "u1").await;
        transport.fail_next_creates(1);

        let payload = json!({ "conversation_id": "c1", "author_role": "operator", "body": "x" });
        assert!(transport
            .create(Table::Messages, payload.clone())
            .await
            .is_err());
        assert!(transport.create(Table::Messages, payload).await.is_ok());
    }

    #[tokio::test]
    async fn test_paused_ack_still_broadcasts_event() {
        let transport = std::sync::Arc::new(InMemoryTransport::new());
        transport.seed_conversation("c1", "u1").await;
        let mut sub = transport
            .subscribe(Table::Messages, Filter::eq("conversation_id", "c1"))
            .await
            .unwrap();

        transport.pause_acks();
        let pending = {
            let transport = std::sync::Arc::clone(&transport);
            tokio::spawn(async move {
                transport
                    .create(
                        Table::Messages,
                        json!({ "conversation_id": "c1", "author_role": "operator", "body": "hi" }),
                    )
                    .await
            })
        };

        // The echo arrives while the acknowledgment is held.
        let event = sub.events.recv().await.unwrap();
        assert_eq!(event.record()["body"], "hi");
        assert!(!pending.is_finished());

        transport.release_acks();
        let row = pending.await.unwrap().unwrap();
        assert_eq!(row["id"], event.record()["id"]);
    }
}
