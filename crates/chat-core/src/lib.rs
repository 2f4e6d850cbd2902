//! Core types and transport contract for the Atrium chat feature.
//!
//! This crate defines the shared vocabulary of the conversation
//! synchronization engine:
//!
//! - [`Conversation`] / [`Message`] - the two record types the engine syncs
//! - [`Transport`] - the trait the hosted data backend is consumed through
//! - [`RecordEvent`] / [`Subscription`] - the standing-subscription feed
//! - [`TransportError`] - failures crossing the transport boundary
//!
//! The engine itself lives in the `chat-sync` crate; test transports live
//! in `mock-transport`.
//!
//! # Example
//!
//! ```rust,no_run
//! use chat_core::{Filter, Order, Table, Transport};
//!
//! # async fn example(transport: &dyn Transport) -> Result<(), chat_core::TransportError> {
//! let rows = transport
//!     .query(
//!         Table::Messages,
//!         Filter::eq("conversation_id", "c1"),
//!         Order::asc("created_at"),
//!     )
//!     .await?;
//! println!("{} messages", rows.len());
//! # Ok(())
//! # }
//! ```

mod error;
mod record;
mod transport;

pub use error::TransportError;
pub use record::{AuthorRole, Conversation, ConversationPatch, Message, NewMessage};
pub use transport::{Filter, Order, RecordEvent, Subscription, SubscriptionHandle, Table, Transport};

// Re-export async_trait for implementors
pub use async_trait::async_trait;
