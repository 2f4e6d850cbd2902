//! Mock transport implementations for testing the chat synchronization
//! engine.
//!
//! This crate provides `Transport` implementations for tests:
//! - `InMemoryTransport` - a deterministic in-memory backend with failure
//!   injection and pausable acknowledgments/queries for forcing race
//!   orderings
//! - `DelayedTransport` - wraps another transport with artificial latency
//!
//! # Example
//!
//! ```rust
//! use mock_transport::{InMemoryTransport, Table, Transport};
//! use serde_json::json;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), mock_transport::TransportError> {
//!     let transport = InMemoryTransport::new();
//!     transport.seed_conversation("c1", "u1").await;
//!
//!     let row = transport
//!         .create(
//!             Table::Messages,
//!             json!({
//!                 "conversation_id": "c1",
//!                 "author_role": "participant",
//!                 "body": "hello",
//!             }),
//!         )
//!         .await?;
//!     println!("created {}", row["id"]);
//!     Ok(())
//! }
//! ```

mod delayed;
mod memory;

// Re-export chat-core types for convenience
pub use chat_core::{
    Filter, Order, RecordEvent, Subscription, SubscriptionHandle, Table, Transport, TransportError,
};

pub use delayed::DelayedTransport;
pub use memory::InMemoryTransport;
