//! The per-agent mailbox: a bounded, ordered queue of incoming
//! [EventEnvelope]s with support for multiple filtered subscribers.
//!
//! Each mailbox has a single reader task that drains the queue one
//! envelope at a time and fans each envelope out to every subscriber
//! concurrently. Subscribers therefore observe envelopes in production
//! order without delaying one another, a failing subscriber never
//! prevents delivery to the others, and producers are only slowed down
//! by the bounded-queue back-pressure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, error};
use uuid::Uuid;

use crate::envelope::EventEnvelope;
use crate::AgentId;

/// The consumer side of a subscription: invoked once per envelope accepted
/// by the subscription's filter.
pub type Handler =
    Arc<dyn Fn(EventEnvelope) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// A predicate deciding whether an envelope is delivered to a subscriber.
pub type Filter = Arc<dyn Fn(&EventEnvelope) -> bool + Send + Sync>;

/// Configuration for a [Mailbox].
#[derive(Debug, Clone, Copy)]
pub struct MailboxConfig {
    /// Maximum number of envelopes the mailbox buffers before producers
    /// are blocked.
    pub capacity: usize,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self { capacity: 1000 }
    }
}

/// Error returned by [`Mailbox::produce`] and [`Mailbox::subscribe`] when
/// the mailbox has been closed.
#[derive(Debug, thiserror::Error)]
#[error("mailbox for agent {0} is closed")]
pub struct Closed(pub AgentId);

#[derive(Debug, Default)]
struct SubscriberState {
    paused: AtomicBool,
    detached: AtomicBool,
}

#[derive(Clone)]
struct Subscriber {
    id: Uuid,
    handler: Handler,
    filter: Option<Filter>,
    state: Arc<SubscriberState>,
}

/// A first-class, cancellable, resumable binding between a [Mailbox] and a
/// [Handler].
#[derive(Clone)]
pub struct SubscriptionHandle {
    id: Uuid,
    agent_id: AgentId,
    state: Arc<SubscriberState>,
    subscribers: std::sync::Weak<RwLock<Vec<Subscriber>>>,
}

impl SubscriptionHandle {
    /// Identifier of the subscription within its mailbox.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The agent whose mailbox this subscription is attached to.
    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    /// Pauses delivery: envelopes arriving while paused are dropped
    /// silently for this subscriber.
    pub fn pause(&self) {
        self.state.paused.store(true, Ordering::SeqCst);
    }

    /// Resumes delivery after a [pause][SubscriptionHandle::pause].
    pub fn resume(&self) {
        self.state.paused.store(false, Ordering::SeqCst);
    }

    /// Returns whether the subscription is attached and currently
    /// accepting envelopes.
    pub fn is_active(&self) -> bool {
        self.is_attached() && !self.state.paused.load(Ordering::SeqCst)
    }

    /// Returns whether the subscription is still attached to its mailbox.
    pub fn is_attached(&self) -> bool {
        !self.state.detached.load(Ordering::SeqCst)
    }

    /// Permanently detaches the subscription from its mailbox.
    pub fn unsubscribe(&self) {
        self.state.detached.store(true, Ordering::SeqCst);

        if let Some(subscribers) = self.subscribers.upgrade() {
            subscribers.write().retain(|subscriber| subscriber.id != self.id);
        }
    }
}

/// The bounded, ordered, per-agent queue of incoming envelopes.
pub struct Mailbox {
    agent_id: AgentId,
    tx: mpsc::Sender<EventEnvelope>,
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
    reader: Mutex<Option<tokio::task::JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Mailbox {
    /// Creates the mailbox and spawns its reader task.
    ///
    /// Must be called within a `tokio` runtime context.
    #[must_use]
    pub fn new(agent_id: AgentId, config: MailboxConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let subscribers: Arc<RwLock<Vec<Subscriber>>> = Arc::default();

        let reader = tokio::spawn(Self::consume(agent_id, rx, Arc::clone(&subscribers)));

        Self {
            agent_id,
            tx,
            subscribers,
            reader: Mutex::new(Some(reader)),
            closed: AtomicBool::new(false),
        }
    }

    async fn consume(
        agent_id: AgentId,
        mut rx: mpsc::Receiver<EventEnvelope>,
        subscribers: Arc<RwLock<Vec<Subscriber>>>,
    ) {
        while let Some(envelope) = rx.recv().await {
            let snapshot: Vec<Subscriber> = subscribers.read().clone();

            // Every subscriber gets the envelope at the same time; the
            // next envelope is not taken until all of them are done, so
            // each subscriber still observes production order.
            join_all(
                snapshot
                    .iter()
                    .map(|subscriber| Self::deliver_to(agent_id, subscriber, &envelope)),
            )
            .await;
        }
    }

    async fn deliver_to(agent_id: AgentId, subscriber: &Subscriber, envelope: &EventEnvelope) {
        if subscriber.state.detached.load(Ordering::SeqCst) {
            return;
        }

        if subscriber.state.paused.load(Ordering::SeqCst) {
            debug!(
                envelope_id = %envelope.id,
                subscription_id = %subscriber.id,
                "subscriber is paused, dropping envelope"
            );
            return;
        }

        if let Some(filter) = &subscriber.filter {
            if !filter(envelope) {
                return;
            }
        }

        if let Err(err) = (subscriber.handler)(envelope.clone()).await {
            error!(
                envelope_id = %envelope.id,
                agent_id = %agent_id,
                subscription_id = %subscriber.id,
                error = %err,
                "subscriber handler failed"
            );
        }
    }

    /// The agent this mailbox belongs to.
    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    /// Enqueues an envelope.
    ///
    /// When the mailbox is at capacity the call blocks until the reader
    /// task has drained enough envelopes to make room.
    ///
    /// # Errors
    ///
    /// Fails with [Closed] when the mailbox has been closed.
    pub async fn produce(&self, envelope: EventEnvelope) -> Result<(), Closed> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Closed(self.agent_id));
        }

        self.tx
            .send(envelope)
            .await
            .map_err(|_| Closed(self.agent_id))
    }

    /// Registers a consumer, invoked once per envelope for which the
    /// filter holds (no filter accepts every envelope).
    ///
    /// # Errors
    ///
    /// Fails with [Closed] when the mailbox has been closed.
    pub fn subscribe(
        &self,
        handler: Handler,
        filter: Option<Filter>,
    ) -> Result<SubscriptionHandle, Closed> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Closed(self.agent_id));
        }

        let subscriber = Subscriber {
            id: Uuid::new_v4(),
            handler,
            filter,
            state: Arc::default(),
        };

        let handle = SubscriptionHandle {
            id: subscriber.id,
            agent_id: self.agent_id,
            state: Arc::clone(&subscriber.state),
            subscribers: Arc::downgrade(&self.subscribers),
        };

        self.subscribers.write().push(subscriber);

        Ok(handle)
    }

    /// Number of currently attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Closes the mailbox: producers and new subscribers are rejected,
    /// the reader task is stopped, and all subscriptions are detached.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }

        let mut subscribers = self.subscribers.write();
        for subscriber in subscribers.iter() {
            subscriber.state.detached.store(true, Ordering::SeqCst);
        }
        subscribers.clear();
    }

    /// Returns whether the mailbox has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        self.close();
    }
}

/// Process-wide registry of the per-agent mailboxes.
#[derive(Clone, Default)]
pub struct MailboxRegistry {
    inner: Arc<Mutex<HashMap<AgentId, Arc<Mailbox>>>>,
    config: MailboxConfig,
}

impl MailboxRegistry {
    /// Creates a registry whose mailboxes use the given configuration.
    #[must_use]
    pub fn new(config: MailboxConfig) -> Self {
        Self {
            inner: Arc::default(),
            config,
        }
    }

    /// Returns the mailbox of the agent, if one is registered.
    pub fn get(&self, id: &AgentId) -> Option<Arc<Mailbox>> {
        self.inner.lock().get(id).cloned()
    }

    /// Returns the mailbox of the agent, creating it when absent.
    pub fn get_or_create(&self, id: AgentId) -> Arc<Mailbox> {
        Arc::clone(
            self.inner
                .lock()
                .entry(id)
                .or_insert_with(|| Arc::new(Mailbox::new(id, self.config))),
        )
    }

    /// Removes the agent's mailbox from the registry, without closing it.
    pub fn remove(&self, id: &AgentId) -> Option<Arc<Mailbox>> {
        self.inner.lock().remove(id)
    }

    /// Returns whether a mailbox is registered for the agent.
    pub fn contains(&self, id: &AgentId) -> bool {
        self.inner.lock().contains_key(id)
    }

    /// Number of registered mailboxes.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Returns whether the registry holds no mailboxes.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::envelope::{Direction, Payload};
    use crate::message::tests::StringMessage;

    fn envelope(publisher: AgentId) -> EventEnvelope {
        let payload = Payload::pack(&StringMessage("hello")).unwrap();
        EventEnvelope::new(publisher, payload, Direction::Local, 16)
    }

    fn collecting_handler(seen: Arc<Mutex<Vec<Uuid>>>) -> Handler {
        Arc::new(move |envelope| {
            let seen = Arc::clone(&seen);
            Box::pin(async move {
                seen.lock().push(envelope.id);
                Ok(())
            })
        })
    }

    async fn eventually(assertion: impl Fn() -> bool) {
        for _ in 0..200 {
            if assertion() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn subscribers_observe_envelopes_in_production_order() {
        let publisher = AgentId::new_v4();
        let mailbox = Mailbox::new(AgentId::new_v4(), MailboxConfig::default());

        let seen: Arc<Mutex<Vec<Uuid>>> = Arc::default();
        mailbox
            .subscribe(collecting_handler(Arc::clone(&seen)), None)
            .unwrap();

        let envelopes: Vec<EventEnvelope> = (0..3).map(|_| envelope(publisher)).collect();
        for envelope in &envelopes {
            mailbox.produce(envelope.clone()).await.unwrap();
        }

        eventually(|| seen.lock().len() == 3).await;

        let expected: Vec<Uuid> = envelopes.iter().map(|e| e.id).collect();
        assert_eq!(expected, *seen.lock());
    }

    #[tokio::test]
    async fn every_subscriber_receives_each_envelope() {
        let mailbox = Mailbox::new(AgentId::new_v4(), MailboxConfig::default());

        let first: Arc<Mutex<Vec<Uuid>>> = Arc::default();
        let second: Arc<Mutex<Vec<Uuid>>> = Arc::default();
        mailbox
            .subscribe(collecting_handler(Arc::clone(&first)), None)
            .unwrap();
        mailbox
            .subscribe(collecting_handler(Arc::clone(&second)), None)
            .unwrap();

        mailbox.produce(envelope(AgentId::new_v4())).await.unwrap();

        eventually(|| first.lock().len() == 1 && second.lock().len() == 1).await;
    }

    #[tokio::test]
    async fn a_slow_subscriber_does_not_delay_the_others() {
        let mailbox = Mailbox::new(AgentId::new_v4(), MailboxConfig::default());

        let slow_done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&slow_done);
        let slow: Handler = Arc::new(move |_| {
            let flag = Arc::clone(&flag);
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
        });
        mailbox.subscribe(slow, None).unwrap();

        let seen: Arc<Mutex<Vec<Uuid>>> = Arc::default();
        mailbox
            .subscribe(collecting_handler(Arc::clone(&seen)), None)
            .unwrap();

        mailbox.produce(envelope(AgentId::new_v4())).await.unwrap();

        // The fast subscriber hears the envelope while the slow one is
        // still working on it.
        eventually(|| seen.lock().len() == 1).await;
        assert!(!slow_done.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn a_failing_subscriber_does_not_prevent_delivery_to_others() {
        let mailbox = Mailbox::new(AgentId::new_v4(), MailboxConfig::default());

        let failing: Handler =
            Arc::new(|_| Box::pin(async { Err(anyhow::anyhow!("handler exploded")) }));
        mailbox.subscribe(failing, None).unwrap();

        let seen: Arc<Mutex<Vec<Uuid>>> = Arc::default();
        mailbox
            .subscribe(collecting_handler(Arc::clone(&seen)), None)
            .unwrap();

        mailbox.produce(envelope(AgentId::new_v4())).await.unwrap();

        eventually(|| seen.lock().len() == 1).await;
    }

    #[tokio::test]
    async fn filters_select_the_delivered_envelopes() {
        let wanted = AgentId::new_v4();
        let mailbox = Mailbox::new(AgentId::new_v4(), MailboxConfig::default());

        let seen: Arc<Mutex<Vec<Uuid>>> = Arc::default();
        let filter: Filter = Arc::new(move |envelope| envelope.publisher_id == wanted);
        mailbox
            .subscribe(collecting_handler(Arc::clone(&seen)), Some(filter))
            .unwrap();

        mailbox.produce(envelope(AgentId::new_v4())).await.unwrap();
        let accepted = envelope(wanted);
        mailbox.produce(accepted.clone()).await.unwrap();

        eventually(|| seen.lock().len() == 1).await;
        assert_eq!(vec![accepted.id], *seen.lock());
    }

    #[tokio::test]
    async fn paused_subscriptions_drop_envelopes_silently() {
        let mailbox = Mailbox::new(AgentId::new_v4(), MailboxConfig::default());

        let seen: Arc<Mutex<Vec<Uuid>>> = Arc::default();
        let handle = mailbox
            .subscribe(collecting_handler(Arc::clone(&seen)), None)
            .unwrap();

        handle.pause();
        assert!(!handle.is_active());

        mailbox.produce(envelope(AgentId::new_v4())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Resume and verify only envelopes produced after the resume arrive.
        // The paused one is gone for good.
        handle.resume();
        assert!(handle.is_active());

        let after_resume = envelope(AgentId::new_v4());
        mailbox.produce(after_resume.clone()).await.unwrap();

        eventually(|| !seen.lock().is_empty()).await;
        assert_eq!(vec![after_resume.id], *seen.lock());
    }

    #[tokio::test]
    async fn unsubscribe_detaches_permanently() {
        let mailbox = Mailbox::new(AgentId::new_v4(), MailboxConfig::default());

        let seen: Arc<Mutex<Vec<Uuid>>> = Arc::default();
        let handle = mailbox
            .subscribe(collecting_handler(Arc::clone(&seen)), None)
            .unwrap();

        handle.unsubscribe();
        assert!(!handle.is_attached());
        assert_eq!(0, mailbox.subscriber_count());

        mailbox.produce(envelope(AgentId::new_v4())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn closed_mailboxes_reject_producers_and_subscribers() {
        let mailbox = Mailbox::new(AgentId::new_v4(), MailboxConfig::default());
        let handle = mailbox.subscribe(collecting_handler(Arc::default()), None).unwrap();

        mailbox.close();

        assert!(mailbox.is_closed());
        assert!(!handle.is_attached());
        assert!(mailbox.produce(envelope(AgentId::new_v4())).await.is_err());
        assert!(mailbox
            .subscribe(collecting_handler(Arc::default()), None)
            .is_err());
    }

    #[tokio::test]
    async fn registry_creates_lazily_and_removes() {
        let registry = MailboxRegistry::default();
        let id = AgentId::new_v4();

        assert!(registry.get(&id).is_none());
        assert!(registry.is_empty());

        let mailbox = registry.get_or_create(id);
        assert_eq!(id, mailbox.agent_id());
        assert!(registry.contains(&id));
        assert_eq!(1, registry.len());

        // A second resolution returns the same mailbox.
        assert!(Arc::ptr_eq(&mailbox, &registry.get_or_create(id)));

        assert!(registry.remove(&id).is_some());
        assert!(!registry.contains(&id));
    }
}
