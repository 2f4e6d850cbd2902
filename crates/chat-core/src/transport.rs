//! Transport contract for the hosted data backend.
//!
//! The backend offers two primitives: a synchronous create/query surface
//! with exactly-once acknowledgment, and standing subscriptions with
//! at-least-once, possibly reordered delivery. The synchronization engine
//! is written against this trait; production wires it to the hosted
//! backend client, tests wire it to `mock-transport`.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::TransportError;

/// Tables the synchronization engine reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Conversations,
    Messages,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Conversations => "conversations",
            Table::Messages => "messages",
        }
    }
}

/// Row filter for queries and subscriptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// Match every row.
    All,
    /// Match rows whose `column` equals `value`.
    Eq { column: &'static str, value: String },
}

impl Filter {
    pub fn eq(column: &'static str, value: impl Into<String>) -> Self {
        Filter::Eq {
            column,
            value: value.into(),
        }
    }

    /// Whether a row passes the filter. Missing columns never match.
    pub fn matches(&self, row: &Value) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq { column, value } => row
                .get(column)
                .and_then(Value::as_str)
                .is_some_and(|v| v == value),
        }
    }
}

/// Sort order for queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: &'static str,
    pub ascending: bool,
}

impl Order {
    pub fn asc(column: &'static str) -> Self {
        Self {
            column,
            ascending: true,
        }
    }

    pub fn desc(column: &'static str) -> Self {
        Self {
            column,
            ascending: false,
        }
    }
}

/// Opaque identity of a standing subscription, used for teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub u64);

impl std::fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A change notification delivered on a standing subscription.
#[derive(Debug, Clone)]
pub enum RecordEvent {
    Created(Value),
    Updated(Value),
}

impl RecordEvent {
    /// The row the event carries.
    pub fn record(&self) -> &Value {
        match self {
            RecordEvent::Created(row) | RecordEvent::Updated(row) => row,
        }
    }
}

/// A live standing subscription: the backend-assigned handle plus the
/// channel events arrive on. Dropping the receiver does not tear the
/// subscription down; callers must `unsubscribe` the handle.
pub struct Subscription {
    pub handle: SubscriptionHandle,
    pub events: mpsc::Receiver<RecordEvent>,
}

/// Duplex client for the hosted data backend.
///
/// The client is stateless and shared read-only across all engine
/// components; subscription handles are owned by whoever opened them.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Create a record and return the authoritative row with server-assigned
    /// identity and timestamp. Acknowledgment is exactly-once.
    async fn create(&self, table: Table, payload: Value) -> Result<Value, TransportError>;

    /// Fetch all rows matching `filter`, sorted by `order`.
    async fn query(
        &self,
        table: Table,
        filter: Filter,
        order: Order,
    ) -> Result<Vec<Value>, TransportError>;

    /// Open a standing subscription for rows matching `filter`.
    ///
    /// Delivery on the returned channel is at-least-once and may be
    /// reordered relative to create acknowledgments.
    async fn subscribe(&self, table: Table, filter: Filter)
        -> Result<Subscription, TransportError>;

    /// Tear down a standing subscription; its event channel closes.
    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), TransportError>;
}
