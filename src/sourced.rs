//! Foundation for event-sourced agents: agents whose state is derived
//! from an append-only log of Domain Events.
//!
//! An agent type implements [Sourced] to describe its state and the pure
//! transition applied per event; the framework-owned [Root] carries the
//! live state, the log version, the staged-but-uncommitted events, and a
//! handle to the Event [Store][crate::event::Store].
//!
//! State changes follow the stage/commit discipline: [`Root::raise`]
//! stages an event in memory without touching state or store, and
//! [`Root::commit`] appends the staged batch under an optimistic version
//! check, applies the transitions, and consults the [SnapshotPolicy].

use futures::TryStreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::event::store::{AppendError, Appender, SnapshotError, Snapshotter, Store, Streamer};
use crate::event::{Envelope, Pending, Select, Snapshot};
use crate::message::{Message, Metadata};
use crate::serde::json::JsonSerde;
use crate::serde::{Deserializer, Serializer};
use crate::version::{self, Version};
use crate::AgentId;

/// The event-sourcing contract of an agent type.
pub trait Sourced: Send + Sync {
    /// State of the agent.
    ///
    /// The [`Default`] value is the state an agent is born with, before
    /// any event has been applied.
    type State: Clone + Default + Serialize + DeserializeOwned + Send + Sync;

    /// Domain Events that express mutations of the agent's [`State`].
    ///
    /// Usually an `enum` listing all possible Domain Events for this
    /// agent type.
    type Event: Message + Serialize + DeserializeOwned + Send + Sync;

    /// Applies the event to the supplied state.
    ///
    /// Must be deterministic and free of I/O: replaying the same events
    /// over the [`Default`] state must always yield the same value. The
    /// framework passes a fresh clone during commits, so previously
    /// observed state values are never mutated.
    fn transition(state: &mut Self::State, event: Self::Event);
}

/// Decides when a serialized copy of the state should be saved alongside
/// the event log, to shorten future replays.
pub trait SnapshotPolicy: Send + Sync {
    /// Consulted after every successful commit.
    fn should_snapshot(&self, version: Version, events_since_last: u64) -> bool;
}

/// Snapshot policy that takes a snapshot every `interval` committed events.
#[derive(Debug, Clone, Copy)]
pub struct EveryN {
    /// Number of committed events between snapshots.
    pub interval: u64,
}

impl Default for EveryN {
    fn default() -> Self {
        Self { interval: 100 }
    }
}

impl SnapshotPolicy for EveryN {
    fn should_snapshot(&self, _version: Version, events_since_last: u64) -> bool {
        self.interval > 0 && events_since_last >= self.interval
    }
}

/// Snapshot policy that never takes a snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct Never;

impl SnapshotPolicy for Never {
    fn should_snapshot(&self, _version: Version, _events_since_last: u64) -> bool {
        false
    }
}

/// List of possible errors returned by [`Root::commit`].
#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    /// The optimistic version check failed: another writer appended to the
    /// agent's log first. The staged batch has been discarded and the
    /// [Root] has caught up with the store; the caller decides whether to
    /// re-stage and retry.
    #[error("failed to append staged events: {0}")]
    Conflict(#[from] version::ConflictError),

    /// A staged event could not be serialized.
    #[error("failed to serialize staged event: {0}")]
    SerializeEvent(#[source] serde_json::Error),

    /// The current state could not be serialized into a snapshot.
    #[error("failed to serialize state snapshot: {0}")]
    SerializeSnapshot(#[source] serde_json::Error),

    /// The Event Store failed while appending the staged batch. The batch
    /// is kept staged so the caller may retry the commit.
    #[error("event store failed while appending events: {0}")]
    AppendToStore(#[source] anyhow::Error),

    /// The Event Store failed while saving the snapshot. The commit itself
    /// has succeeded.
    #[error("event store failed while saving snapshot: {0}")]
    Snapshot(#[from] SnapshotError),
}

/// List of possible errors returned by [`Root::replay`].
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    /// The Event Store failed while loading the latest snapshot.
    #[error("failed to load snapshot: {0}")]
    Snapshot(#[from] SnapshotError),

    /// The Event Store failed while streaming events.
    #[error("event store failed while streaming events: {0}")]
    Stream(#[source] anyhow::Error),
}

/// The framework-owned half of an event-sourced agent: live state, log
/// version, staged events, and the Event Store handle.
///
/// Concrete agents embed a [Root] and expose business methods that
/// [`raise`][Root::raise] Domain Events and [`commit`][Root::commit] them.
pub struct Root<A, S>
where
    A: Sourced,
    S: Store,
{
    agent_id: AgentId,
    state: A::State,
    version: Version,
    staged: Vec<Envelope<A::Event>>,
    store: S,
    snapshot_policy: Box<dyn SnapshotPolicy>,
    state_serde: JsonSerde<A::State>,
    events_since_snapshot: u64,
}

impl<A, S> Root<A, S>
where
    A: Sourced,
    S: Store,
{
    /// Creates a fresh [Root] for the given agent over the given store,
    /// with the default [EveryN] snapshot policy.
    ///
    /// The state starts at its [`Default`] value and version 0; call
    /// [`replay`][Root::replay] to rebuild from the store.
    #[must_use]
    pub fn new(agent_id: AgentId, store: S) -> Self {
        Self {
            agent_id,
            state: A::State::default(),
            version: 0,
            staged: Vec::new(),
            store,
            snapshot_policy: Box::new(EveryN::default()),
            state_serde: JsonSerde::default(),
            events_since_snapshot: 0,
        }
    }

    /// Replaces the snapshot policy.
    #[must_use]
    pub fn with_snapshot_policy(mut self, policy: impl SnapshotPolicy + 'static) -> Self {
        self.snapshot_policy = Box::new(policy);
        self
    }

    /// The identity of the agent this [Root] belongs to.
    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    /// Read access to the current state.
    pub fn state(&self) -> &A::State {
        &self.state
    }

    /// The version of the last committed event, 0 when none.
    pub fn current_version(&self) -> Version {
        self.version
    }

    /// The staged, not yet committed events.
    pub fn staged(&self) -> &[Envelope<A::Event>] {
        &self.staged
    }

    /// Stages a Domain Event in memory.
    ///
    /// Neither the state nor the store are touched until
    /// [`commit`][Root::commit] is called.
    pub fn raise(&mut self, event: A::Event) {
        self.staged.push(Envelope::from(event));
    }

    /// Stages a Domain Event with attached metadata.
    pub fn raise_with_metadata(&mut self, event: A::Event, metadata: Metadata) {
        self.staged.push(Envelope {
            message: event,
            metadata,
        });
    }

    /// Commits the staged events: appends them to the agent's log under an
    /// optimistic version check, applies each transition to the state in
    /// staging order, and consults the snapshot policy.
    ///
    /// Returns the new log version. Committing with nothing staged is a
    /// no-op returning the current version.
    ///
    /// # Errors
    ///
    /// On [`CommitError::Conflict`] the staged batch is discarded and the
    /// state is brought up to date with the store. Other errors keep the
    /// batch staged (see the individual [CommitError] variants).
    pub async fn commit(&mut self) -> Result<Version, CommitError> {
        if self.staged.is_empty() {
            return Ok(self.version);
        }

        let pending: Vec<Pending> = self
            .staged
            .iter()
            .map(|envelope| {
                Pending::new(&envelope.message)
                    .map(|pending| pending.with_metadata(envelope.metadata.clone()))
            })
            .collect::<Result<_, _>>()
            .map_err(CommitError::SerializeEvent)?;

        let append = self
            .store
            .append(self.agent_id, version::Check::MustBe(self.version), pending)
            .await;

        let new_version = match append {
            Ok(new_version) => new_version,
            Err(AppendError::Conflict(conflict)) => {
                self.staged.clear();

                if let Err(err) = self.fold_from_store(self.version + 1).await {
                    warn!(
                        agent_id = %self.agent_id,
                        error = %err,
                        "failed to catch up with the store after an append conflict"
                    );
                }

                return Err(CommitError::Conflict(conflict));
            }
            Err(AppendError::Internal(err)) => return Err(CommitError::AppendToStore(err)),
        };

        let committed = std::mem::take(&mut self.staged);
        self.events_since_snapshot += committed.len() as u64;

        for envelope in committed {
            let mut next = self.state.clone();
            A::transition(&mut next, envelope.message);
            self.state = next;
        }

        self.version = new_version;

        if self
            .snapshot_policy
            .should_snapshot(self.version, self.events_since_snapshot)
        {
            self.save_snapshot().await?;
            self.events_since_snapshot = 0;
        }

        Ok(new_version)
    }

    /// Rebuilds the state from the store: installs the latest snapshot
    /// when one exists, then applies every later event in version order.
    ///
    /// Events whose type cannot be decoded are skipped with a warning,
    /// while the version still advances past them.
    ///
    /// # Errors
    ///
    /// Fails when the store cannot be read; see [ReplayError].
    pub async fn replay(&mut self) -> Result<(), ReplayError> {
        self.state = A::State::default();
        self.version = 0;
        self.staged.clear();
        self.events_since_snapshot = 0;

        if let Some(snapshot) = self.store.latest_snapshot(&self.agent_id).await? {
            match self.state_serde.deserialize(&snapshot.state) {
                Ok(state) => {
                    self.state = state;
                    self.version = snapshot.version;
                    debug!(
                        agent_id = %self.agent_id,
                        version = snapshot.version,
                        "restored state from snapshot"
                    );
                }
                Err(err) => warn!(
                    agent_id = %self.agent_id,
                    version = snapshot.version,
                    error = %err,
                    "ignoring undecodable snapshot, replaying the full log"
                ),
            }
        }

        self.fold_from_store(self.version + 1).await
    }

    async fn fold_from_store(&mut self, from: Version) -> Result<(), ReplayError> {
        let mut stream = self.store.stream(&self.agent_id, Select::from(from));

        while let Some(persisted) = stream
            .try_next()
            .await
            .map_err(|err| ReplayError::Stream(anyhow::Error::new(err)))?
        {
            match serde_json::from_slice::<A::Event>(&persisted.data) {
                Ok(event) => A::transition(&mut self.state, event),
                Err(err) => warn!(
                    agent_id = %self.agent_id,
                    version = persisted.version,
                    event_type = %persisted.event_type,
                    error = %err,
                    "skipping event of unknown type during replay"
                ),
            }

            self.version = persisted.version;
            self.events_since_snapshot += 1;
        }

        Ok(())
    }

    async fn save_snapshot(&mut self) -> Result<(), CommitError> {
        let state = self
            .state_serde
            .serialize(&self.state)
            .map_err(CommitError::SerializeSnapshot)?;

        self.store
            .save_snapshot(Snapshot {
                agent_id: self.agent_id,
                version: self.version,
                state,
                taken_at_ms: crate::unix_ms_now(),
            })
            .await?;

        debug!(agent_id = %self.agent_id, version = self.version, "saved state snapshot");

        Ok(())
    }
}
