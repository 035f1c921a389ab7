//! Creation and registration of actors.
//!
//! The [Factory] assembles an [Actor] around an agent, wires it to the
//! process-wide mailbox registry and subscription manager, registers it
//! with the [Manager], and activates it. Agent types can additionally be
//! [registered by name][Factory::register_type] so callers without the
//! concrete type at hand can create actors through
//! [`create_by_type`][Factory::create_by_type].
//!
//! The [Manager] is the process-wide `id -> actor` registry: lookups,
//! existence checks, statistics, and batch deactivation go through it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::actor::{Actor, ActorConfig, ActorError, ActorHandle};
use crate::agent::{Agent, Handlers};
use crate::mailbox::{MailboxConfig, MailboxRegistry};
use crate::subscription::SubscriptionManager;
use crate::AgentId;

/// All possible errors returned by the [Factory].
#[derive(Debug, thiserror::Error)]
pub enum FactoryError {
    /// An actor with the requested agent id is already registered.
    #[error("an actor with agent id {0} is already registered")]
    DuplicateAgentId(AgentId),

    /// No builder has been registered under the requested type name.
    #[error("no agent type registered under name: {0}")]
    UnknownAgentType(String),

    /// The freshly assembled actor failed to activate; it has been
    /// unregistered again.
    #[error("failed to activate the new actor: {0}")]
    Activate(#[source] ActorError),
}

struct Entry {
    actor: Arc<dyn ActorHandle>,
    registered_at_ms: u64,
    last_activity_ms: u64,
}

/// A point-in-time summary of the actors registered with a [Manager].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Statistics {
    /// Number of registered actors.
    pub registered: usize,

    /// How many of them are currently active.
    pub active: usize,

    /// How many of them are currently inactive.
    pub inactive: usize,
}

/// The process-wide registry of living actors.
///
/// Cloning is cheap; every clone shares the same registry.
#[derive(Clone, Default)]
pub struct Manager {
    inner: Arc<Mutex<HashMap<AgentId, Entry>>>,
}

impl Manager {
    pub(crate) fn register(
        &self,
        id: AgentId,
        actor: Arc<dyn ActorHandle>,
    ) -> Result<(), FactoryError> {
        let mut inner = self.inner.lock();

        if inner.contains_key(&id) {
            return Err(FactoryError::DuplicateAgentId(id));
        }

        let now = crate::unix_ms_now();
        inner.insert(
            id,
            Entry {
                actor,
                registered_at_ms: now,
                last_activity_ms: now,
            },
        );

        Ok(())
    }

    pub(crate) fn unregister(&self, id: &AgentId) -> Option<Arc<dyn ActorHandle>> {
        self.inner.lock().remove(id).map(|entry| entry.actor)
    }

    /// Returns the actor registered under the agent id, updating its
    /// last-activity timestamp.
    pub fn get(&self, id: &AgentId) -> Option<Arc<dyn ActorHandle>> {
        let mut inner = self.inner.lock();
        let entry = inner.get_mut(id)?;
        entry.last_activity_ms = crate::unix_ms_now();
        Some(Arc::clone(&entry.actor))
    }

    /// Returns every registered actor.
    pub fn get_all(&self) -> Vec<Arc<dyn ActorHandle>> {
        self.inner
            .lock()
            .values()
            .map(|entry| Arc::clone(&entry.actor))
            .collect()
    }

    /// Returns whether an actor is registered under the agent id.
    pub fn exists(&self, id: &AgentId) -> bool {
        self.inner.lock().contains_key(id)
    }

    /// Number of registered actors.
    pub fn count(&self) -> usize {
        self.inner.lock().len()
    }

    /// When the actor was last fetched through [`get`][Manager::get], in
    /// Unix milliseconds.
    pub fn last_activity_ms(&self, id: &AgentId) -> Option<u64> {
        self.inner.lock().get(id).map(|entry| entry.last_activity_ms)
    }

    /// When the actor was registered, in Unix milliseconds.
    pub fn registered_at_ms(&self, id: &AgentId) -> Option<u64> {
        self.inner.lock().get(id).map(|entry| entry.registered_at_ms)
    }

    /// Summarizes the registry.
    pub fn statistics(&self) -> Statistics {
        let inner = self.inner.lock();

        let registered = inner.len();
        let active = inner
            .values()
            .filter(|entry| entry.actor.is_active())
            .count();

        Statistics {
            registered,
            active,
            inactive: registered - active,
        }
    }

    /// Deactivates the actor and removes it from the registry.
    ///
    /// Returns `false` when no actor is registered under the id.
    ///
    /// # Errors
    ///
    /// Surfaces the deactivation error; the actor is unregistered either
    /// way.
    pub async fn deactivate_and_unregister(&self, id: &AgentId) -> Result<bool, ActorError> {
        let Some(actor) = self.unregister(id) else {
            return Ok(false);
        };

        actor.deactivate().await?;
        Ok(true)
    }

    /// Deactivates and unregisters every actor, returning how many were
    /// deactivated. Individual failures are logged and do not stop the
    /// sweep.
    pub async fn deactivate_all(&self) -> usize {
        let actors: Vec<Arc<dyn ActorHandle>> = {
            let mut inner = self.inner.lock();
            inner.drain().map(|(_, entry)| entry.actor).collect()
        };

        let mut deactivated = 0;
        for actor in actors {
            match actor.deactivate().await {
                Ok(()) => deactivated += 1,
                Err(err) => warn!(
                    agent_id = %actor.id(),
                    error = %err,
                    "failed to deactivate actor during sweep"
                ),
            }
        }

        deactivated
    }
}

type Builder = Box<dyn Fn(AgentId, &Factory) -> Arc<dyn ActorHandle> + Send + Sync>;

struct FactoryInner {
    mailboxes: MailboxRegistry,
    subscriptions: SubscriptionManager,
    manager: Manager,
    config: ActorConfig,
    builders: RwLock<HashMap<&'static str, Builder>>,
    handler_routes: RwLock<HashMap<&'static str, Vec<&'static str>>>,
}

/// Assembles, registers and activates actors.
///
/// Cloning is cheap; every clone shares the same registries.
#[derive(Clone)]
pub struct Factory {
    inner: Arc<FactoryInner>,
}

impl Default for Factory {
    fn default() -> Self {
        Self::new()
    }
}

impl Factory {
    /// Creates a factory with default actor and mailbox configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(ActorConfig::default(), MailboxConfig::default())
    }

    /// Creates a factory with the given actor and mailbox configuration.
    #[must_use]
    pub fn with_config(actor_config: ActorConfig, mailbox_config: MailboxConfig) -> Self {
        let mailboxes = MailboxRegistry::new(mailbox_config);
        let subscriptions = SubscriptionManager::new(mailboxes.clone());

        Self {
            inner: Arc::new(FactoryInner {
                mailboxes,
                subscriptions,
                manager: Manager::default(),
                config: actor_config,
                builders: RwLock::default(),
                handler_routes: RwLock::default(),
            }),
        }
    }

    /// The actor registry this factory populates.
    pub fn manager(&self) -> &Manager {
        &self.inner.manager
    }

    /// The process-wide mailbox registry.
    pub fn mailboxes(&self) -> &MailboxRegistry {
        &self.inner.mailboxes
    }

    /// The process-wide subscription manager.
    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.inner.subscriptions
    }

    fn assemble<A>(&self, agent: A) -> Actor<A>
    where
        A: Agent,
    {
        Actor::new(
            agent,
            self.inner.mailboxes.clone(),
            self.inner.subscriptions.clone(),
            self.inner.config,
        )
    }

    /// Wraps the agent in an [Actor], registers it, and activates it.
    ///
    /// # Errors
    ///
    /// Fails fast with [`FactoryError::DuplicateAgentId`] when an actor
    /// with the same agent id is already registered, and with
    /// [`FactoryError::Activate`] when activation fails (the actor is
    /// unregistered again).
    pub async fn create<A>(&self, agent: A) -> Result<Arc<Actor<A>>, FactoryError>
    where
        A: Agent,
    {
        let id = agent.id();

        if self.inner.manager.exists(&id) {
            return Err(FactoryError::DuplicateAgentId(id));
        }

        let actor = Arc::new(self.assemble(agent));
        self.register_and_activate(id, Arc::clone(&actor) as Arc<dyn ActorHandle>)
            .await?;

        Ok(actor)
    }

    /// Registers a builder for creating agents of this type by name, and
    /// records the type's handler routes for diagnostics.
    pub fn register_type<A, F>(&self, agent_type: &'static str, build: F)
    where
        A: Agent,
        F: Fn(AgentId) -> A + Send + Sync + 'static,
    {
        let mut handlers = Handlers::<A>::default();
        A::register_handlers(&mut handlers);
        self.inner
            .handler_routes
            .write()
            .insert(agent_type, handlers.routes().collect());

        self.inner.builders.write().insert(
            agent_type,
            Box::new(move |id, factory| {
                Arc::new(factory.assemble(build(id))) as Arc<dyn ActorHandle>
            }),
        );

        debug!(agent_type, "registered agent type");
    }

    /// Creates, registers and activates an actor for a type registered
    /// under `agent_type`.
    ///
    /// # Errors
    ///
    /// Fails with [`FactoryError::UnknownAgentType`] for an unregistered
    /// type name, and with the same errors as [`create`][Factory::create]
    /// otherwise.
    pub async fn create_by_type(
        &self,
        agent_type: &str,
        id: AgentId,
    ) -> Result<Arc<dyn ActorHandle>, FactoryError> {
        if self.inner.manager.exists(&id) {
            return Err(FactoryError::DuplicateAgentId(id));
        }

        let actor = {
            let builders = self.inner.builders.read();
            let builder = builders
                .get(agent_type)
                .ok_or_else(|| FactoryError::UnknownAgentType(agent_type.to_owned()))?;

            builder(id, self)
        };

        self.register_and_activate(id, Arc::clone(&actor)).await?;

        Ok(actor)
    }

    /// The handler route names recorded for a registered agent type.
    pub fn handler_routes(&self, agent_type: &str) -> Option<Vec<&'static str>> {
        self.inner.handler_routes.read().get(agent_type).cloned()
    }

    async fn register_and_activate(
        &self,
        id: AgentId,
        actor: Arc<dyn ActorHandle>,
    ) -> Result<(), FactoryError> {
        self.inner.manager.register(id, Arc::clone(&actor))?;

        if let Err(err) = actor.activate().await {
            self.inner.manager.unregister(&id);
            return Err(FactoryError::Activate(err));
        }

        Ok(())
    }
}
