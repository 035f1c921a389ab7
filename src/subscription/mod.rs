//! Durable stream subscriptions, managed as first-class objects.
//!
//! The [SubscriptionManager] attaches handlers to agent mailboxes on
//! behalf of other agents, wrapping each handler with the cycle filter
//! (suppressing a subscriber's own non-local envelopes), an activity
//! timestamp, and error swallowing. Failed attachments are retried
//! according to a [RetryPolicy][retry::RetryPolicy], unhealthy
//! subscriptions can be [reconnected][SubscriptionManager::reconnect]
//! under their original identifier, and an optional
//! [health monitor][SubscriptionManager::spawn_health_monitor] does so on
//! a schedule.

pub mod retry;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::envelope::Direction;
use crate::mailbox::{Filter, Handler, MailboxRegistry, SubscriptionHandle};
use crate::subscription::retry::RetryPolicy;
use crate::AgentId;

/// All possible errors returned when creating or repairing a subscription.
#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    /// The target stream exists but has been closed.
    #[error("stream for agent {0} is closed")]
    StreamClosed(AgentId),

    /// No stream is registered for the target agent.
    #[error("no stream registered for agent {0}")]
    StreamNotFound(AgentId),

    /// The referenced subscription is not managed by this manager.
    #[error("unknown subscription: {0}")]
    UnknownSubscription(Uuid),

    /// The subscribe request itself is invalid and will never succeed.
    #[error("invalid subscription request: {0}")]
    Invalid(String),

    /// The substrate failed in an unspecified way.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl SubscribeError {
    /// Whether a retry of the same request could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            SubscribeError::Invalid(_) | SubscribeError::UnknownSubscription(_)
        )
    }
}

struct Managed {
    stream_owner: AgentId,
    subscriber: AgentId,
    handler: Handler,
    handle: SubscriptionHandle,
    last_activity_ms: Arc<AtomicU64>,
}

/// A point-in-time description of a managed subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    /// The manager-scoped identifier of the subscription.
    pub id: Uuid,

    /// The agent whose stream the handler is attached to.
    pub stream_owner: AgentId,

    /// The agent on whose behalf the handler runs.
    pub subscriber: AgentId,

    /// When the handler last saw an envelope, in Unix milliseconds;
    /// 0 when it never has.
    pub last_activity_ms: u64,

    /// Whether the subscription is currently attached and accepting.
    pub active: bool,
}

/// Creates, repairs and tears down stream subscriptions.
///
/// Cloning is cheap; every clone manages the same set of subscriptions.
#[derive(Clone)]
pub struct SubscriptionManager {
    mailboxes: MailboxRegistry,
    active: Arc<Mutex<HashMap<Uuid, Managed>>>,
}

impl SubscriptionManager {
    /// Creates a manager attaching subscriptions to the mailboxes of the
    /// given registry.
    #[must_use]
    pub fn new(mailboxes: MailboxRegistry) -> Self {
        Self {
            mailboxes,
            active: Arc::default(),
        }
    }

    /// Attaches `handler` to the stream of `stream_owner`, on behalf of
    /// `subscriber`, retrying failures according to `retry`.
    ///
    /// The stream is created when absent. The installed handler is wrapped
    /// with a filter suppressing the subscriber's own non-local envelopes,
    /// an activity timestamp, and error swallowing: a throwing handler is
    /// logged and never disturbs other subscribers.
    ///
    /// Returns the manager-scoped subscription identifier.
    ///
    /// # Errors
    ///
    /// Surfaces the last [SubscribeError] once the retry policy declines
    /// to continue.
    pub async fn subscribe(
        &self,
        stream_owner: AgentId,
        subscriber: AgentId,
        handler: Handler,
        retry: &dyn RetryPolicy,
    ) -> Result<Uuid, SubscribeError> {
        let last_activity_ms = Arc::new(AtomicU64::new(0));

        let mut attempt: u32 = 0;
        let handle = loop {
            attempt += 1;

            match self.attach(stream_owner, subscriber, &handler, &last_activity_ms) {
                Ok(handle) => break handle,
                Err(err) => {
                    if !retry.should_retry(&err, attempt) {
                        return Err(err);
                    }

                    let Some(delay) = retry.next_delay(attempt) else {
                        return Err(err);
                    };

                    debug!(
                        stream_owner = %stream_owner,
                        subscriber = %subscriber,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "subscribe attempt failed, retrying"
                    );

                    tokio::time::sleep(delay).await;
                }
            }
        };

        let id = Uuid::new_v4();

        self.active.lock().insert(
            id,
            Managed {
                stream_owner,
                subscriber,
                handler,
                handle,
                last_activity_ms,
            },
        );

        Ok(id)
    }

    fn attach(
        &self,
        stream_owner: AgentId,
        subscriber: AgentId,
        handler: &Handler,
        last_activity_ms: &Arc<AtomicU64>,
    ) -> Result<SubscriptionHandle, SubscribeError> {
        let mailbox = self.mailboxes.get_or_create(stream_owner);

        let filter: Filter = Arc::new(move |envelope| {
            envelope.publisher_id != subscriber || envelope.direction == Direction::Local
        });

        let inner = Arc::clone(handler);
        let activity = Arc::clone(last_activity_ms);
        let wrapped: Handler = Arc::new(move |envelope| {
            let inner = Arc::clone(&inner);
            let activity = Arc::clone(&activity);

            Box::pin(async move {
                activity.store(crate::unix_ms_now(), Ordering::Relaxed);

                let envelope_id = envelope.id;
                if let Err(err) = inner(envelope).await {
                    warn!(
                        envelope_id = %envelope_id,
                        stream_owner = %stream_owner,
                        subscriber = %subscriber,
                        error = %err,
                        "subscription handler failed"
                    );
                }

                Ok(())
            })
        });

        mailbox
            .subscribe(wrapped, Some(filter))
            .map_err(|_| SubscribeError::StreamClosed(stream_owner))
    }

    /// Whether the subscription is attached and its target stream is still
    /// registered.
    pub fn is_healthy(&self, id: Uuid) -> bool {
        let active = self.active.lock();

        match active.get(&id) {
            Some(managed) => {
                managed.handle.is_attached() && self.mailboxes.contains(&managed.stream_owner)
            }
            None => false,
        }
    }

    /// Detaches the old handle and re-attaches the saved handler, keeping
    /// the subscription identifier.
    ///
    /// # Errors
    ///
    /// Fails with [`SubscribeError::UnknownSubscription`] for an id this
    /// manager does not know, or with the error of the new attach attempt.
    pub async fn reconnect(&self, id: Uuid) -> Result<(), SubscribeError> {
        let (stream_owner, subscriber, handler, last_activity_ms) = {
            let active = self.active.lock();
            let managed = active
                .get(&id)
                .ok_or(SubscribeError::UnknownSubscription(id))?;

            managed.handle.unsubscribe();

            (
                managed.stream_owner,
                managed.subscriber,
                Arc::clone(&managed.handler),
                Arc::clone(&managed.last_activity_ms),
            )
        };

        let handle = self.attach(stream_owner, subscriber, &handler, &last_activity_ms)?;

        if let Some(managed) = self.active.lock().get_mut(&id) {
            managed.handle = handle;
        }

        debug!(subscription_id = %id, stream_owner = %stream_owner, "subscription reconnected");

        Ok(())
    }

    /// Detaches and forgets the subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: Uuid) -> bool {
        match self.active.lock().remove(&id) {
            Some(managed) => {
                managed.handle.unsubscribe();
                true
            }
            None => false,
        }
    }

    /// Whether the manager knows the subscription.
    pub fn contains(&self, id: Uuid) -> bool {
        self.active.lock().contains_key(&id)
    }

    /// Describes every managed subscription.
    pub fn active_subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.active
            .lock()
            .iter()
            .map(|(id, managed)| SubscriptionInfo {
                id: *id,
                stream_owner: managed.stream_owner,
                subscriber: managed.subscriber,
                last_activity_ms: managed.last_activity_ms.load(Ordering::Relaxed),
                active: managed.handle.is_active(),
            })
            .collect()
    }

    /// Spawns a background task polling [`is_healthy`][Self::is_healthy]
    /// every `interval`, reconnecting the subscription when unhealthy.
    ///
    /// The task stops when the subscription is no longer managed. Abort
    /// the returned handle to cancel it earlier.
    pub fn spawn_health_monitor(
        &self,
        id: Uuid,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;

                if !manager.contains(id) {
                    break;
                }

                if !manager.is_healthy(id) {
                    if let Err(err) = manager.reconnect(id).await {
                        warn!(
                            subscription_id = %id,
                            error = %err,
                            "health monitor failed to reconnect subscription"
                        );
                    }
                }
            }
        })
    }
}
