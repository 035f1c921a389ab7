//! Foundation traits for implementing agents: long-lived, addressable,
//! message-driven entities with identity, state, and typed event handlers.
//!
//! An agent implementation provides its identity, its lifecycle callbacks,
//! and a set of typed handler routes registered through [Handlers]. The
//! surrounding [Actor][crate::actor::Actor] binds the agent to its mailbox
//! and injects the publish capability through [Context].

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::envelope::{Direction, EventEnvelope, Payload};
use crate::message::Message;
use crate::AgentId;

/// Error returned when publishing an event from an agent.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// The payload could not be serialized.
    #[error("failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// The capability to publish envelopes into the routing layer, injected
/// into agents by their actor.
#[async_trait]
pub trait Publish: Send + Sync {
    /// Publishes an already-packed payload, returning the id of the
    /// envelope that was routed.
    async fn publish(&self, payload: Payload, direction: Direction) -> Result<Uuid, PublishError>;
}

/// The execution context handed to an agent's handlers and lifecycle
/// callbacks.
///
/// Carries the agent's identity and the publish capability, so agent code
/// can emit events without knowing anything about the routing layer.
#[derive(Clone)]
pub struct Context {
    agent_id: AgentId,
    publisher: Arc<dyn Publish>,
}

impl Context {
    /// Builds a context for the given agent around a publish capability.
    #[must_use]
    pub fn new(agent_id: AgentId, publisher: Arc<dyn Publish>) -> Self {
        Self {
            agent_id,
            publisher,
        }
    }

    /// The identity of the agent this context belongs to.
    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    /// Publishes an event towards the given direction, returning the id
    /// of the envelope that was routed.
    ///
    /// # Errors
    ///
    /// Fails with [`PublishError::Serialize`] when the event cannot be
    /// packed into a payload.
    pub async fn publish<T>(&self, event: &T, direction: Direction) -> Result<Uuid, PublishError>
    where
        T: Message + Serialize,
    {
        let payload = Payload::pack(event)?;
        self.publisher.publish(payload, direction).await
    }

    /// Publishes an already-packed payload towards the given direction.
    ///
    /// # Errors
    ///
    /// Surfaces the error of the underlying publish capability.
    pub async fn publish_payload(
        &self,
        payload: Payload,
        direction: Direction,
    ) -> Result<Uuid, PublishError> {
        self.publisher.publish(payload, direction).await
    }
}

/// An agent: a long-lived, addressable, message-driven entity.
///
/// The kernel guarantees that at most one of the agent's callbacks is
/// executing at any instant, so implementations are free to mutate their
/// own state without further synchronization.
#[async_trait]
pub trait Agent: Send + Sync + 'static {
    /// The stable identity of this agent instance.
    fn id(&self) -> AgentId;

    /// A human-readable tag describing the agent.
    fn description(&self) -> String {
        format!("agent {}", self.id())
    }

    /// Invoked after the agent's mailbox subscription is in place, before
    /// the agent accepts external calls.
    async fn on_activate(&mut self, ctx: &Context) -> anyhow::Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Invoked before the agent's mailbox is torn down.
    async fn on_deactivate(&mut self, ctx: &Context) -> anyhow::Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Invoked when a typed configuration is supplied for the agent.
    async fn on_configure(&mut self, config: &Payload) -> anyhow::Result<()> {
        let _ = config;
        Ok(())
    }

    /// Registers the agent type's handler routes.
    ///
    /// The default registers none: an agent without routes simply ignores
    /// every envelope delivered to it.
    fn register_handlers(handlers: &mut Handlers<Self>)
    where
        Self: Sized,
    {
        let _ = handlers;
    }
}

/// A typed handler route: invoked with exclusive access to the agent, its
/// context, and the unpacked payload.
pub type RouteFn<A, T> =
    for<'a> fn(&'a mut A, &'a Context, T) -> BoxFuture<'a, anyhow::Result<()>>;

trait ErasedRoute<A>: Send + Sync {
    fn call<'a>(
        &'a self,
        agent: &'a mut A,
        ctx: &'a Context,
        envelope: EventEnvelope,
    ) -> BoxFuture<'a, anyhow::Result<()>>;
}

struct TypedRoute<A, T> {
    handler: RouteFn<A, T>,
    _payload: PhantomData<fn(T)>,
}

impl<A, T> ErasedRoute<A> for TypedRoute<A, T>
where
    A: Send,
    T: Message + DeserializeOwned + Send + 'static,
{
    fn call<'a>(
        &'a self,
        agent: &'a mut A,
        ctx: &'a Context,
        envelope: EventEnvelope,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        match envelope.payload.unpack::<T>() {
            Ok(payload) => (self.handler)(agent, ctx, payload),
            Err(err) => {
                warn!(
                    envelope_id = %envelope.id,
                    type_url = %envelope.payload.type_url,
                    error = %err,
                    "dropping envelope with malformed payload"
                );
                Box::pin(futures::future::ready(Ok(())))
            }
        }
    }
}

/// The dispatch table of an agent type: maps payload type names to the
/// handler routes registered for them.
pub struct Handlers<A> {
    routes: HashMap<&'static str, Box<dyn ErasedRoute<A>>>,
}

impl<A> Default for Handlers<A> {
    fn default() -> Self {
        Self {
            routes: HashMap::default(),
        }
    }
}

impl<A> Handlers<A>
where
    A: Send + 'static,
{
    /// Registers a handler route for payloads of type `T`, replacing any
    /// previous route for the same type.
    pub fn route<T>(&mut self, handler: RouteFn<A, T>) -> &mut Self
    where
        T: Message + DeserializeOwned + Send + 'static,
    {
        self.routes.insert(
            T::type_url(),
            Box::new(TypedRoute {
                handler,
                _payload: PhantomData,
            }),
        );
        self
    }

    /// The payload type names a route is registered for.
    pub fn routes(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.routes.keys().copied()
    }

    /// Number of registered routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Returns whether no route has been registered.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Dispatches an envelope to the route registered for its payload
    /// type. An envelope with no matching route is ignored, and `false`
    /// is returned.
    ///
    /// # Errors
    ///
    /// Propagates the error returned by the invoked handler.
    pub async fn dispatch(
        &self,
        agent: &mut A,
        ctx: &Context,
        envelope: EventEnvelope,
    ) -> anyhow::Result<bool> {
        let Some(route) = self.routes.get(envelope.payload.type_url.as_str()) else {
            debug!(
                envelope_id = %envelope.id,
                type_url = %envelope.payload.type_url,
                "no handler registered for payload type"
            );
            return Ok(false);
        };

        route.call(agent, ctx, envelope).await.map(|()| true)
    }
}
