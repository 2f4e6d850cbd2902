//! Engine facade: the single surface a presentation layer talks to.
//!
//! Reads go through [`list_conversations`](ChatEngine::list_conversations),
//! [`messages`](ChatEngine::messages), and the loading/degraded flags;
//! writes go through [`send_message`](ChatEngine::send_message),
//! [`refresh`](ChatEngine::refresh), and
//! [`set_active_conversation`](ChatEngine::set_active_conversation).
//! Nothing else is exposed.

use std::sync::Arc;

use chat_core::{AuthorRole, Conversation, Message, Transport};
use tracing::warn;

use crate::directory::ConversationDirectory;
use crate::entry::MessageEntry;
use crate::error::SyncError;
use crate::stream::MessageStream;
use crate::subscription::{RetryPolicy, SubscriptionManager};

/// Wires the directory, stream, and subscription manager over one shared
/// transport.
pub struct ChatEngine {
    directory: Arc<ConversationDirectory>,
    stream: Arc<MessageStream>,
    subscriptions: SubscriptionManager,
}

impl ChatEngine {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_retry_policy(transport, RetryPolicy::default())
    }

    pub fn with_retry_policy(transport: Arc<dyn Transport>, retry: RetryPolicy) -> Self {
        let directory = Arc::new(ConversationDirectory::new(Arc::clone(&transport)));
        let stream = Arc::new(MessageStream::new(Arc::clone(&transport)));
        let subscriptions =
            SubscriptionManager::new(transport, Arc::clone(&directory), Arc::clone(&stream))
                .with_retry_policy(retry);
        Self {
            directory,
            stream,
            subscriptions,
        }
    }

    /// Load the directory and open the directory-scope subscription.
    ///
    /// A subscription failure only degrades to manual refresh; the initial
    /// fetch result is what this returns.
    pub async fn start(&self) -> Result<(), SyncError> {
        let fetched = self.directory.refresh().await;
        if let Err(e) = self.subscriptions.start_directory_subscription().await {
            warn!(error = %e, "starting without live directory updates");
        }
        fetched.map(|_| ())
    }

    /// Tear down subscriptions and clear the active conversation.
    pub async fn shutdown(&self) {
        self.subscriptions.shutdown().await;
        self.stream.unbind().await;
        self.directory.set_active_conversation_id(None).await;
    }

    /// Select (or clear) the active conversation.
    ///
    /// Rebinds the message stream and re-points the conversation-scope
    /// subscription. A subscription failure leaves the stream usable in
    /// degraded mode and is not surfaced here; the bind result is.
    pub async fn set_active_conversation(
        &self,
        conversation_id: Option<&str>,
    ) -> Result<(), SyncError> {
        self.directory
            .set_active_conversation_id(conversation_id)
            .await;

        let bound = match conversation_id {
            Some(id) => self.stream.bind(id).await,
            None => {
                self.stream.unbind().await;
                Ok(())
            }
        };

        if let Err(e) = self
            .subscriptions
            .set_active_conversation(conversation_id)
            .await
        {
            warn!(error = %e, "conversation selected without live updates");
        }
        bound
    }

    // --- reads ---

    /// Conversation listing, most recently updated first.
    pub async fn list_conversations(&self) -> Vec<Conversation> {
        self.directory.list_conversations().await
    }

    pub async fn active_conversation_id(&self) -> Option<String> {
        self.directory.active_conversation_id().await
    }

    /// Canonical message list of the active conversation.
    pub async fn messages(&self) -> Vec<MessageEntry> {
        self.stream.list().await
    }

    pub async fn directory_loading(&self) -> bool {
        self.directory.is_loading().await
    }

    pub async fn messages_loading(&self) -> bool {
        self.stream.is_loading().await
    }

    /// False while live updates are unavailable (degraded polling mode).
    pub fn live_updates_available(&self) -> bool {
        self.subscriptions.live_updates_available()
    }

    // --- writes ---

    /// Re-fetch the conversation listing.
    pub async fn refresh(&self) -> Result<Vec<Conversation>, SyncError> {
        self.directory.refresh().await
    }

    /// Send a message in the active conversation.
    pub async fn send_message(
        &self,
        body: &str,
        author_role: AuthorRole,
    ) -> Result<Message, SyncError> {
        self.stream.send_message(body, author_role).await
    }

    /// Resend a failed entry as a fresh send.
    pub async fn retry_failed(&self, client_token: &str) -> Result<Message, SyncError> {
        self.stream.retry_failed(client_token).await
    }

    /// Drop a failed entry.
    pub async fn discard_failed(&self, client_token: &str) -> Result<(), SyncError> {
        self.stream.discard_failed(client_token).await
    }
}
