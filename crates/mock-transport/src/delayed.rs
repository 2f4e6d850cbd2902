//! Delayed transport - wraps another transport with artificial latency.

use std::time::Duration;

use async_trait::async_trait;
use chat_core::{
    Filter, Order, Subscription, SubscriptionHandle, Table, Transport, TransportError,
};
use serde_json::Value;
use tokio::time::sleep;

/// A transport that delays every call by a fixed duration.
///
/// Useful for widening race windows and testing loading-flag behavior.
pub struct DelayedTransport<T: Transport> {
    inner: T,
    delay: Duration,
}

impl<T: Transport> DelayedTransport<T> {
    /// Wrap the given transport with the specified delay.
    pub fn new(inner: T, delay: Duration) -> Self {
        Self { inner, delay }
    }

    /// Wrap with a delay in milliseconds.
    pub fn with_millis(inner: T, millis: u64) -> Self {
        Self::new(inner, Duration::from_millis(millis))
    }
}

#[async_trait]
impl<T: Transport> Transport for DelayedTransport<T> {
    async fn create(&self, table: Table, payload: Value) -> Result<Value, TransportError> {
        sleep(self.delay).await;
        self.inner.create(table, payload).await
    }

    async fn query(
        &self,
        table: Table,
        filter: Filter,
        order: Order,
    ) -> Result<Vec<Value>, TransportError> {
        sleep(self.delay).await;
        self.inner.query(table, filter, order).await
    }

    async fn subscribe(
        &self,
        table: Table,
        filter: Filter,
    ) -> Result<Subscription, TransportError> {
        sleep(self.delay).await;
        self.inner.subscribe(table, filter).await
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), TransportError> {
        sleep(self.delay).await;
        self.inner.unsubscribe(handle).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryTransport;
    use std::time::Instant;

    #[tokio::test]
    async fn test_delayed_transport() {
        let transport = DelayedTransport::with_millis(InMemoryTransport::new(), 100);

        let start = Instant::now();
        let rows = transport
            .query(Table::Conversations, Filter::All, Order::desc("updated_at"))
            .await
            .unwrap();
        assert!(rows.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(100));
    }
}
