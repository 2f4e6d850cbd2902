//! Standing subscription lifecycle.
//!
//! The manager is the sole owner of live subscription handles: one
//! directory-scope subscription and at most one conversation-scope
//! subscription. Teardown is unconditional before setup, so duplicate
//! delivery from overlapping subscriptions cannot happen.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chat_core::{
    ConversationPatch, Filter, Message, Subscription, SubscriptionHandle, Table, Transport,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::directory::ConversationDirectory;
use crate::error::SyncError;
use crate::stream::MessageStream;

/// Bounded backoff for establishing a subscription.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts before giving up and entering degraded mode.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Cap on the delay between retries.
    pub max_delay: Duration,
    /// Backoff multiplier for each retry.
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay for a given attempt number (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_ms =
            self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_millis(delay_ms as u64).min(self.max_delay)
    }

    /// Whether another attempt is allowed after `attempts` failures.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

struct ActiveSubscription {
    handle: SubscriptionHandle,
    forwarder: JoinHandle<()>,
}

#[derive(Default)]
struct ManagerState {
    directory_sub: Option<ActiveSubscription>,
    conversation_sub: Option<(String, ActiveSubscription)>,
}

/// Owns the standing subscriptions and routes their events.
///
/// Directory-scope events are forwarded to
/// [`ConversationDirectory::apply_external_update`]; conversation-scope
/// events to [`MessageStream::apply_external_message`]. No other component
/// opens or closes subscriptions.
pub struct SubscriptionManager {
    transport: Arc<dyn Transport>,
    directory: Arc<ConversationDirectory>,
    stream: Arc<MessageStream>,
    retry: RetryPolicy,
    /// False after a subscribe exhausted its retries; the engine stays
    /// usable through manual refresh/bind in that state.
    live: AtomicBool,
    state: Mutex<ManagerState>,
}

impl SubscriptionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        directory: Arc<ConversationDirectory>,
        stream: Arc<MessageStream>,
    ) -> Self {
        Self {
            transport,
            directory,
            stream,
            retry: RetryPolicy::default(),
            live: AtomicBool::new(true),
            state: Mutex::new(ManagerState::default()),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Whether the live channels are currently established.
    pub fn live_updates_available(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Open the directory-scope subscription, tearing down any prior one.
    ///
    /// The state lock is held only to swap handles in and out, never
    /// across the subscribe retry cycle, so teardown paths stay
    /// responsive while a subscribe is backing off.
    pub async fn start_directory_subscription(&self) -> Result<(), SyncError> {
        let prior = self.state.lock().await.directory_sub.take();
        if let Some(prior) = prior {
            self.teardown(prior).await;
        }

        let subscription = self
            .subscribe_with_retry(Table::Conversations, Filter::All)
            .await?;
        let directory = Arc::clone(&self.directory);
        let handle = subscription.handle;
        let mut events = subscription.events;
        let forwarder = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match serde_json::from_value::<ConversationPatch>(event.record().clone()) {
                    Ok(patch) => {
                        if let Err(e) = directory.apply_external_update(patch).await {
                            warn!(error = %e, "directory update could not be applied");
                        }
                    }
                    Err(e) => warn!(error = %e, "skipping undecodable conversation event"),
                }
            }
            debug!("directory subscription channel closed");
        });

        // A concurrent setup may have installed its own subscription while
        // ours was being established; the loser is torn down.
        let stale = self
            .state
            .lock()
            .await
            .directory_sub
            .replace(ActiveSubscription { handle, forwarder });
        if let Some(stale) = stale {
            self.teardown(stale).await;
        }
        Ok(())
    }

    /// Tear down the directory-scope subscription, if any.
    pub async fn stop_directory_subscription(&self) {
        let prior = self.state.lock().await.directory_sub.take();
        if let Some(sub) = prior {
            self.teardown(sub).await;
        }
    }

    /// Re-point the conversation-scope subscription.
    ///
    /// The prior subscription is always torn down first; two live
    /// conversation-scope subscriptions never overlap, even transiently.
    pub async fn set_active_conversation(
        &self,
        conversation_id: Option<&str>,
    ) -> Result<(), SyncError> {
        let prior = self.state.lock().await.conversation_sub.take();
        if let Some((prior_id, sub)) = prior {
            debug!(conversation_id = %prior_id, "tearing down conversation subscription");
            self.teardown(sub).await;
        }
        let Some(conversation_id) = conversation_id else {
            return Ok(());
        };

        let subscription = self
            .subscribe_with_retry(
                Table::Messages,
                Filter::eq("conversation_id", conversation_id),
            )
            .await?;
        let stream = Arc::clone(&self.stream);
        let handle = subscription.handle;
        let mut events = subscription.events;
        let forwarder = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match serde_json::from_value::<Message>(event.record().clone()) {
                    Ok(message) => stream.apply_external_message(message).await,
                    Err(e) => warn!(error = %e, "skipping undecodable message event"),
                }
            }
            debug!("conversation subscription channel closed");
        });

        let stale = self.state.lock().await.conversation_sub.replace((
            conversation_id.to_string(),
            ActiveSubscription { handle, forwarder },
        ));
        if let Some((_, stale)) = stale {
            self.teardown(stale).await;
        }
        Ok(())
    }

    /// Tear down every live subscription.
    pub async fn shutdown(&self) {
        let (directory_sub, conversation_sub) = {
            let mut state = self.state.lock().await;
            (state.directory_sub.take(), state.conversation_sub.take())
        };
        if let Some(sub) = directory_sub {
            self.teardown(sub).await;
        }
        if let Some((_, sub)) = conversation_sub {
            self.teardown(sub).await;
        }
    }

    async fn teardown(&self, sub: ActiveSubscription) {
        if let Err(e) = self.transport.unsubscribe(sub.handle).await {
            warn!(error = %e, "unsubscribe failed");
        }
        sub.forwarder.abort();
    }

    async fn subscribe_with_retry(
        &self,
        table: Table,
        filter: Filter,
    ) -> Result<Subscription, SyncError> {
        let mut attempts = 0;
        loop {
            match self.transport.subscribe(table, filter.clone()).await {
                Ok(subscription) => {
                    self.live.store(true, Ordering::SeqCst);
                    info!(table = table.as_str(), "subscription established");
                    return Ok(subscription);
                }
                Err(e) => {
                    attempts += 1;
                    if !self.retry.should_retry(attempts) {
                        self.live.store(false, Ordering::SeqCst);
                        error!(
                            table = table.as_str(),
                            error = %e,
                            "live updates unavailable; falling back to manual refresh"
                        );
                        return Err(SyncError::Subscription(e));
                    }
                    let delay = self.retry.delay_for_attempt(attempts - 1);
                    warn!(
                        table = table.as_str(),
                        attempts,
                        ?delay,
                        error = %e,
                        "subscribe failed; retrying"
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}
