//! The kernel-owned wrapper binding one [Agent] to one mailbox.
//!
//! An [Actor] owns its agent exclusively: the agent, its mailbox and the
//! actor share one lifetime. On [activation][Actor::activate] the actor
//! subscribes a dispatching handler to the agent's mailbox and invokes the
//! agent's activation callback; afterwards, every envelope delivered to
//! the mailbox is dispatched to the agent's handler routes, and forwarded
//! along its direction (see [routing]).
//!
//! The agent lives behind an async mutex: the mailbox reader and any
//! external caller going through [`Actor::agent`] serialize on it, which
//! yields the at-most-one-handler-per-agent guarantee.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::agent::{Agent, Context, Handlers, Publish, PublishError};
use crate::envelope::{Direction, EventEnvelope, Payload};
use crate::mailbox::{Handler, MailboxRegistry};
use crate::message::Message;
use crate::routing::{self, HierarchyView};
use crate::subscription::retry::NoRetry;
use crate::subscription::{SubscribeError, SubscriptionManager};
use crate::AgentId;

/// Configuration for an [Actor].
#[derive(Debug, Clone, Copy)]
pub struct ActorConfig {
    /// Hop budget stamped on envelopes published by this actor.
    pub max_hops: u32,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self { max_hops: 16 }
    }
}

/// Error returned when linking agents into an invalid hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HierarchyError {
    /// An agent cannot be its own parent or child.
    #[error("agent {0} cannot be linked to itself")]
    SelfLink(AgentId),
}

/// All possible errors returned by [Actor] lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum ActorError {
    /// An agent lifecycle callback failed.
    #[error("agent lifecycle callback failed: {0}")]
    Lifecycle(#[source] anyhow::Error),

    /// The actor could not subscribe to its own stream.
    #[error("failed to subscribe the actor to its stream: {0}")]
    Subscribe(#[from] SubscribeError),
}

/// The mutable parent/child links of an agent.
///
/// Links are identifiers, never object references: resolution always goes
/// through the mailbox registry, so there are no reference cycles to
/// manage.
#[derive(Debug, Default)]
pub struct Hierarchy {
    parent: RwLock<Option<AgentId>>,
    children: RwLock<BTreeSet<AgentId>>,
}

impl Hierarchy {
    /// The current parent link.
    pub fn parent(&self) -> Option<AgentId> {
        *self.parent.read()
    }

    /// Replaces the parent link.
    pub fn set_parent(&self, parent: Option<AgentId>) {
        *self.parent.write() = parent;
    }

    /// Adds a child link; returns whether it was newly added.
    pub fn add_child(&self, child: AgentId) -> bool {
        self.children.write().insert(child)
    }

    /// Removes a child link; returns whether it was present.
    pub fn remove_child(&self, child: &AgentId) -> bool {
        self.children.write().remove(child)
    }

    /// The current child links, in stable order.
    pub fn children(&self) -> Vec<AgentId> {
        self.children.read().iter().copied().collect()
    }

    /// Snapshots the links into a [HierarchyView] for routing.
    pub fn view(&self) -> HierarchyView {
        HierarchyView {
            parent: self.parent(),
            children: self.children(),
        }
    }
}

struct RoutingPublisher {
    agent_id: AgentId,
    hierarchy: Arc<Hierarchy>,
    mailboxes: MailboxRegistry,
    max_hops: u32,
}

#[async_trait]
impl Publish for RoutingPublisher {
    async fn publish(&self, payload: Payload, direction: Direction) -> Result<Uuid, PublishError> {
        let envelope = EventEnvelope::new(self.agent_id, payload, direction, self.max_hops);
        let envelope_id = envelope.id;

        let view = self.hierarchy.view();
        routing::route(envelope, self.agent_id, &view, &self.mailboxes).await;

        Ok(envelope_id)
    }
}

/// Owns one [Agent] and binds it to one mailbox.
pub struct Actor<A>
where
    A: Agent,
{
    id: AgentId,
    agent: Arc<tokio::sync::Mutex<A>>,
    handlers: Arc<Handlers<A>>,
    context: Context,
    hierarchy: Arc<Hierarchy>,
    mailboxes: MailboxRegistry,
    subscriptions: SubscriptionManager,
    subscription_id: Mutex<Option<Uuid>>,
    active: AtomicBool,
}

impl<A> Actor<A>
where
    A: Agent,
{
    /// Wraps the agent, wiring the publish capability into its [Context].
    ///
    /// The actor is created inactive; call [`activate`][Actor::activate]
    /// to subscribe it to its stream.
    #[must_use]
    pub fn new(
        agent: A,
        mailboxes: MailboxRegistry,
        subscriptions: SubscriptionManager,
        config: ActorConfig,
    ) -> Self {
        let id = agent.id();

        let mut handlers = Handlers::default();
        A::register_handlers(&mut handlers);

        let hierarchy = Arc::new(Hierarchy::default());

        let publisher = Arc::new(RoutingPublisher {
            agent_id: id,
            hierarchy: Arc::clone(&hierarchy),
            mailboxes: mailboxes.clone(),
            max_hops: config.max_hops,
        });

        Self {
            id,
            agent: Arc::new(tokio::sync::Mutex::new(agent)),
            handlers: Arc::new(handlers),
            context: Context::new(id, publisher),
            hierarchy,
            mailboxes,
            subscriptions,
            subscription_id: Mutex::new(None),
            active: AtomicBool::new(false),
        }
    }

    /// The identity of the wrapped agent.
    pub fn id(&self) -> AgentId {
        self.id
    }

    /// Whether the actor is currently activated.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Exclusive access to the wrapped agent.
    ///
    /// Locking the returned mutex serializes with envelope dispatch, so a
    /// caller invoking business methods on the agent never races a
    /// handler.
    pub fn agent(&self) -> Arc<tokio::sync::Mutex<A>> {
        Arc::clone(&self.agent)
    }

    /// Activates the actor: creates or fetches the agent's mailbox,
    /// subscribes the dispatching handler, and invokes the agent's
    /// activation callback.
    ///
    /// Activating an already-active actor is an idempotent no-op.
    ///
    /// # Errors
    ///
    /// Fails when the stream subscription cannot be created or when the
    /// agent's activation callback fails; in both cases the actor is left
    /// inactive.
    pub async fn activate(&self) -> Result<(), ActorError> {
        if self.active.swap(true, Ordering::SeqCst) {
            debug!(agent_id = %self.id, "actor is already active");
            return Ok(());
        }

        let subscription_id = match self
            .subscriptions
            .subscribe(self.id, self.id, self.dispatching_handler(), &NoRetry)
            .await
        {
            Ok(subscription_id) => subscription_id,
            Err(err) => {
                self.active.store(false, Ordering::SeqCst);
                return Err(err.into());
            }
        };

        *self.subscription_id.lock() = Some(subscription_id);

        if let Err(err) = self.agent.lock().await.on_activate(&self.context).await {
            self.teardown();
            self.active.store(false, Ordering::SeqCst);
            return Err(ActorError::Lifecycle(err));
        }

        debug!(agent_id = %self.id, "actor activated");
        Ok(())
    }

    /// Deactivates the actor: invokes the agent's deactivation callback,
    /// unsubscribes the dispatching handler, and removes the agent's
    /// mailbox from the registry.
    ///
    /// Deactivating an inactive actor is a no-op.
    ///
    /// # Errors
    ///
    /// Surfaces a failing deactivation callback; the teardown itself still
    /// completes.
    pub async fn deactivate(&self) -> Result<(), ActorError> {
        if !self.active.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let callback = self.agent.lock().await.on_deactivate(&self.context).await;

        self.teardown();

        debug!(agent_id = %self.id, "actor deactivated");
        callback.map_err(ActorError::Lifecycle)
    }

    fn teardown(&self) {
        if let Some(subscription_id) = self.subscription_id.lock().take() {
            self.subscriptions.unsubscribe(subscription_id);
        }

        if let Some(mailbox) = self.mailboxes.remove(&self.id) {
            mailbox.close();
        }
    }

    fn dispatching_handler(&self) -> Handler {
        let agent = Arc::clone(&self.agent);
        let handlers = Arc::clone(&self.handlers);
        let context = self.context.clone();
        let hierarchy = Arc::clone(&self.hierarchy);
        let mailboxes = self.mailboxes.clone();
        let id = self.id;

        Arc::new(move |envelope: EventEnvelope| {
            let agent = Arc::clone(&agent);
            let handlers = Arc::clone(&handlers);
            let context = context.clone();
            let hierarchy = Arc::clone(&hierarchy);
            let mailboxes = mailboxes.clone();

            Box::pin(async move {
                let dispatched = {
                    let mut agent = agent.lock().await;
                    handlers.dispatch(&mut agent, &context, envelope.clone()).await
                };

                let view = hierarchy.view();
                if let Some(next) = routing::onward(&envelope, &view) {
                    routing::route(next, id, &view, &mailboxes).await;
                }

                dispatched.map(|_| ())
            })
        })
    }

    /// Publishes an event on behalf of the wrapped agent, returning the id
    /// of the routed envelope.
    ///
    /// # Errors
    ///
    /// Fails when the event cannot be packed into a payload.
    pub async fn publish<T>(&self, event: &T, direction: Direction) -> Result<Uuid, PublishError>
    where
        T: Message + serde::Serialize,
    {
        self.context.publish(event, direction).await
    }

    /// Supplies a typed configuration to the agent.
    ///
    /// # Errors
    ///
    /// Surfaces the error of the agent's configuration callback.
    pub async fn configure(&self, config: &Payload) -> Result<(), ActorError> {
        self.agent
            .lock()
            .await
            .on_configure(config)
            .await
            .map_err(ActorError::Lifecycle)
    }

    /// Links the agent under a parent.
    ///
    /// # Errors
    ///
    /// Rejects linking the agent to itself.
    pub fn set_parent(&self, parent: AgentId) -> Result<(), HierarchyError> {
        if parent == self.id {
            return Err(HierarchyError::SelfLink(self.id));
        }

        self.hierarchy.set_parent(Some(parent));
        Ok(())
    }

    /// Removes the parent link.
    pub fn clear_parent(&self) {
        self.hierarchy.set_parent(None);
    }

    /// The current parent link.
    pub fn parent(&self) -> Option<AgentId> {
        self.hierarchy.parent()
    }

    /// Links a child under the agent; returns whether it was newly added.
    ///
    /// # Errors
    ///
    /// Rejects linking the agent to itself.
    pub fn add_child(&self, child: AgentId) -> Result<bool, HierarchyError> {
        if child == self.id {
            return Err(HierarchyError::SelfLink(self.id));
        }

        Ok(self.hierarchy.add_child(child))
    }

    /// Removes a child link; returns whether it was present.
    pub fn remove_child(&self, child: &AgentId) -> bool {
        self.hierarchy.remove_child(child)
    }

    /// The current child links.
    pub fn children(&self) -> Vec<AgentId> {
        self.hierarchy.children()
    }

    /// The human-readable description of the wrapped agent.
    pub async fn describe(&self) -> String {
        self.agent.lock().await.description()
    }
}

/// The type-erased surface of an [Actor], used by the process-wide
/// registry to manage actors of heterogeneous agent types.
#[async_trait]
pub trait ActorHandle: Send + Sync {
    /// The identity of the wrapped agent.
    fn id(&self) -> AgentId;

    /// Whether the actor is currently activated.
    fn is_active(&self) -> bool;

    /// See [`Actor::activate`].
    async fn activate(&self) -> Result<(), ActorError>;

    /// See [`Actor::deactivate`].
    async fn deactivate(&self) -> Result<(), ActorError>;

    /// Publishes an already-packed payload on behalf of the agent.
    async fn publish_payload(
        &self,
        payload: Payload,
        direction: Direction,
    ) -> Result<Uuid, PublishError>;

    /// See [`Actor::configure`].
    async fn configure(&self, config: &Payload) -> Result<(), ActorError>;

    /// See [`Actor::describe`].
    async fn describe(&self) -> String;

    /// See [`Actor::set_parent`].
    fn set_parent(&self, parent: AgentId) -> Result<(), HierarchyError>;

    /// See [`Actor::clear_parent`].
    fn clear_parent(&self);

    /// See [`Actor::parent`].
    fn parent(&self) -> Option<AgentId>;

    /// See [`Actor::add_child`].
    fn add_child(&self, child: AgentId) -> Result<bool, HierarchyError>;

    /// See [`Actor::remove_child`].
    fn remove_child(&self, child: &AgentId) -> bool;

    /// See [`Actor::children`].
    fn children(&self) -> Vec<AgentId>;
}

#[async_trait]
impl<A> ActorHandle for Actor<A>
where
    A: Agent,
{
    fn id(&self) -> AgentId {
        Actor::id(self)
    }

    fn is_active(&self) -> bool {
        Actor::is_active(self)
    }

    async fn activate(&self) -> Result<(), ActorError> {
        Actor::activate(self).await
    }

    async fn deactivate(&self) -> Result<(), ActorError> {
        Actor::deactivate(self).await
    }

    async fn publish_payload(
        &self,
        payload: Payload,
        direction: Direction,
    ) -> Result<Uuid, PublishError> {
        self.context.publish_payload(payload, direction).await
    }

    async fn configure(&self, config: &Payload) -> Result<(), ActorError> {
        Actor::configure(self, config).await
    }

    async fn describe(&self) -> String {
        Actor::describe(self).await
    }

    fn set_parent(&self, parent: AgentId) -> Result<(), HierarchyError> {
        Actor::set_parent(self, parent)
    }

    fn clear_parent(&self) {
        Actor::clear_parent(self);
    }

    fn parent(&self) -> Option<AgentId> {
        Actor::parent(self)
    }

    fn add_child(&self, child: AgentId) -> Result<bool, HierarchyError> {
        Actor::add_child(self, child)
    }

    fn remove_child(&self, child: &AgentId) -> bool {
        Actor::remove_child(self, child)
    }

    fn children(&self) -> Vec<AgentId> {
        Actor::children(self)
    }
}
