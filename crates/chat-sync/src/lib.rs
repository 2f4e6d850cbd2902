//! Real-time conversation synchronization engine for the Atrium admin chat.
//!
//! The engine reconciles three concurrent sources of truth about a live
//! conversation: locally queued sends that the backend has not acknowledged
//! yet, the acknowledgments themselves, and echoes of the same records
//! arriving on a standing subscription - possibly before the acknowledgment
//! resolves, and interleaved with messages from other parties and other
//! browser tabs.
//!
//! Components:
//!
//! - [`ConversationDirectory`] - the recency-sorted conversation listing
//! - [`MessageStream`] - the canonical message list for the active
//!   conversation, with optimistic sends
//! - [`SubscriptionManager`] - sole owner of standing subscription handles
//! - [`reconcile`] - the merge rules for optimistic and authoritative
//!   records
//! - [`ChatEngine`] - the facade a presentation layer talks to
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use chat_core::{AuthorRole, Transport};
//! use chat_sync::ChatEngine;
//!
//! # async fn example(transport: Arc<dyn Transport>) -> Result<(), chat_sync::SyncError> {
//! let engine = ChatEngine::new(transport);
//! engine.start().await?;
//!
//! engine.set_active_conversation(Some("c1")).await?;
//! engine.send_message("hello", AuthorRole::Operator).await?;
//!
//! for entry in engine.messages().await {
//!     println!("{:?}", entry);
//! }
//! # Ok(())
//! # }
//! ```

mod directory;
mod engine;
mod entry;
mod error;
pub mod reconcile;
mod stream;
mod subscription;

pub use directory::ConversationDirectory;
pub use engine::ChatEngine;
pub use entry::{MessageEntry, PendingMessage};
pub use error::SyncError;
pub use stream::MessageStream;
pub use subscription::{RetryPolicy, SubscriptionManager};

// Re-export the record types presentation code reads
pub use chat_core::{AuthorRole, Conversation, Message};
