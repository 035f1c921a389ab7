//! Contains implementations of the [`event::Store`][Store] trait and
//! connected abstractions, such as the [`std::collections::HashMap`]'s
//! based [`InMemory`] Event Store implementation.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{iter, StreamExt};
use parking_lot::{Mutex, RwLock};
use tracing::instrument;
use uuid::Uuid;

use crate::event::{Pending, Persisted, Select, Snapshot};
use crate::version::{self, Version};
use crate::AgentId;

/// Interface used to stream [Persisted] Domain Events from an Event Store
/// back into an application, and to inspect the latest version of an
/// agent's event log.
#[async_trait]
pub trait Streamer: Send + Sync {
    /// The error type returned by the Store during a [`stream`] call.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Opens an Event Stream over the selected slice of the agent's
    /// event log, sorted by version ascending.
    fn stream(&self, id: &AgentId, select: Select) -> crate::event::Stream<'_, Self::Error>;

    /// Returns the version of the last event appended for the agent,
    /// or 0 when the agent has no events.
    async fn latest_version(&self, id: &AgentId) -> Result<Version, Self::Error>;
}

/// All possible error types returned by [`Appender::append`].
#[derive(Debug, thiserror::Error)]
pub enum AppendError {
    /// Error returned when [`Appender::append`] encounters a conflict error
    /// while appending the new Domain Events.
    #[error("failed to append new domain events: {0}")]
    Conflict(#[from] version::ConflictError),

    /// Error returned when the [Appender] implementation has encountered an error.
    #[error("failed to append new domain events, an error occurred: {0}")]
    Internal(#[from] anyhow::Error),
}

/// All possible error types returned by the [Snapshotter] operations.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// Error returned when the [Snapshotter] implementation has encountered an error.
    #[error("snapshot store operation failed: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Interface used to append new Domain Events to an agent's event log.
#[async_trait]
pub trait Appender: Send + Sync {
    /// Appends new Domain Events to the event log of the specified agent.
    ///
    /// The append is atomic: when the [version::Check] does not hold, no
    /// event is persisted and [`AppendError::Conflict`] is returned.
    /// Successfully appended events are assigned consecutive versions in
    /// input order, and the new latest version of the log is returned.
    async fn append(
        &self,
        id: AgentId,
        version_check: version::Check,
        events: Vec<Pending>,
    ) -> Result<Version, AppendError>;
}

/// Interface used to save and retrieve per-agent [Snapshot]s.
///
/// A store keeps at most one snapshot per agent: saving replaces any
/// previous one.
#[async_trait]
pub trait Snapshotter: Send + Sync {
    /// Saves the snapshot, replacing any previous snapshot of the agent.
    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), SnapshotError>;

    /// Returns the last snapshot saved for the agent, if any.
    async fn latest_snapshot(&self, id: &AgentId) -> Result<Option<Snapshot>, SnapshotError>;
}

/// An Event Store, used to store the Domain Events of agents in per-agent,
/// version-ordered event logs, and retrieve them.
pub trait Store: Streamer + Appender + Snapshotter + Send + Sync {}

impl<T> Store for T where T: Streamer + Appender + Snapshotter + Send + Sync {}

#[derive(Debug, Default)]
struct AgentLog {
    events: Vec<Persisted>,
    snapshot: Option<Snapshot>,
}

/// In-memory implementation of the [Store] trait, backed by a thread-safe
/// [`std::collections::HashMap`] of per-agent logs.
///
/// Operations on distinct agents never block each other: the map lock is
/// held only to resolve the per-agent log, and each log has its own lock.
#[derive(Debug, Clone, Default)]
pub struct InMemory {
    backend: Arc<RwLock<HashMap<AgentId, Arc<Mutex<AgentLog>>>>>,
}

impl InMemory {
    fn log(&self, id: AgentId) -> Arc<Mutex<AgentLog>> {
        if let Some(log) = self.backend.read().get(&id) {
            return Arc::clone(log);
        }

        Arc::clone(self.backend.write().entry(id).or_default())
    }
}

#[async_trait]
impl Streamer for InMemory {
    type Error = Infallible;

    fn stream(&self, id: &AgentId, select: Select) -> crate::event::Stream<'_, Self::Error> {
        let events: Vec<Persisted> = {
            let log = self.log(*id);
            let log = log.lock();

            log.events
                .iter()
                .filter(|event| select.contains(event.version))
                .take(select.limit.unwrap_or(usize::MAX))
                .cloned()
                .collect()
        };

        iter(events).map(Ok).boxed()
    }

    async fn latest_version(&self, id: &AgentId) -> Result<Version, Self::Error> {
        let log = self.log(*id);
        let log = log.lock();

        Ok(log.events.last().map(|event| event.version).unwrap_or_default())
    }
}

#[async_trait]
impl Appender for InMemory {
    async fn append(
        &self,
        id: AgentId,
        version_check: version::Check,
        events: Vec<Pending>,
    ) -> Result<Version, AppendError> {
        let log = self.log(id);
        let mut log = log.lock();

        let last_version = log.events.last().map(|event| event.version).unwrap_or_default();

        version_check.verify(last_version)?;

        let recorded_at_ms = crate::unix_ms_now();

        let mut persisted: Vec<Persisted> = events
            .into_iter()
            .enumerate()
            .map(|(i, event)| Persisted {
                event_id: Uuid::new_v4(),
                agent_id: id,
                version: last_version + (i as Version) + 1,
                event_type: event.event_type,
                data: event.data,
                metadata: event.metadata,
                recorded_at_ms,
            })
            .collect();

        let new_version = persisted
            .last()
            .map(|event| event.version)
            .unwrap_or(last_version);

        log.events.append(&mut persisted);

        Ok(new_version)
    }
}

#[async_trait]
impl Snapshotter for InMemory {
    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), SnapshotError> {
        let log = self.log(snapshot.agent_id);
        log.lock().snapshot = Some(snapshot);
        Ok(())
    }

    async fn latest_snapshot(&self, id: &AgentId) -> Result<Option<Snapshot>, SnapshotError> {
        let log = self.log(*id);
        let snapshot = log.lock().snapshot.clone();
        Ok(snapshot)
    }
}

/// A record of a single [`Appender::append`] call observed by a [Tracking]
/// decorator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendRecord {
    /// The agent the events were appended for.
    pub agent_id: AgentId,

    /// The version expectation the append was made under.
    pub expected: version::Check,

    /// The `event_type` keys of the appended batch, in input order.
    pub event_types: Vec<String>,

    /// The log version after the append.
    pub new_version: Version,
}

/// Decorator type for a [Store] implementation that tracks the append calls
/// made through it.
///
/// Useful for testing purposes, i.e. asserting that the Domain Events
/// written through this Event Store instance are the ones expected, and
/// that commits batch them the intended way.
#[derive(Debug, Clone)]
pub struct Tracking<T>
where
    T: Store,
{
    store: T,
    appends: Arc<RwLock<Vec<AppendRecord>>>,
}

impl<T> Tracking<T>
where
    T: Store,
{
    /// Returns the append calls recorded through this decorator so far.
    pub fn recorded_appends(&self) -> Vec<AppendRecord> {
        self.appends.read().clone()
    }

    /// Resets the list of recorded append calls.
    pub fn reset_recorded_appends(&self) {
        self.appends.write().clear();
    }
}

#[async_trait]
impl<T> Streamer for Tracking<T>
where
    T: Store,
{
    type Error = <T as Streamer>::Error;

    fn stream(&self, id: &AgentId, select: Select) -> crate::event::Stream<'_, Self::Error> {
        self.store.stream(id, select)
    }

    async fn latest_version(&self, id: &AgentId) -> Result<Version, Self::Error> {
        self.store.latest_version(id).await
    }
}

#[async_trait]
impl<T> Appender for Tracking<T>
where
    T: Store,
{
    async fn append(
        &self,
        id: AgentId,
        version_check: version::Check,
        events: Vec<Pending>,
    ) -> Result<Version, AppendError> {
        let event_types: Vec<String> = events.iter().map(|event| event.event_type.clone()).collect();

        let new_version = self.store.append(id, version_check, events).await?;

        self.appends.write().push(AppendRecord {
            agent_id: id,
            expected: version_check,
            event_types,
            new_version,
        });

        Ok(new_version)
    }
}

#[async_trait]
impl<T> Snapshotter for Tracking<T>
where
    T: Store,
{
    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), SnapshotError> {
        self.store.save_snapshot(snapshot).await
    }

    async fn latest_snapshot(&self, id: &AgentId) -> Result<Option<Snapshot>, SnapshotError> {
        self.store.latest_snapshot(id).await
    }
}

/// [Store] type wrapper that provides instrumentation features through
/// the `tracing` crate.
#[derive(Debug, Clone)]
pub struct Instrumented<T>
where
    T: Store,
{
    store: T,
}

#[async_trait]
impl<T> Streamer for Instrumented<T>
where
    T: Store,
{
    type Error = <T as Streamer>::Error;

    #[instrument(name = "event::Store.stream", skip(self))]
    fn stream(&self, id: &AgentId, select: Select) -> crate::event::Stream<'_, Self::Error> {
        self.store.stream(id, select)
    }

    #[instrument(name = "event::Store.latest_version", ret, err, skip(self))]
    async fn latest_version(&self, id: &AgentId) -> Result<Version, Self::Error> {
        self.store.latest_version(id).await
    }
}

#[async_trait]
impl<T> Appender for Instrumented<T>
where
    T: Store,
{
    #[instrument(
        name = "event::Store.append",
        ret,
        err,
        skip(self, events),
        fields(batch_size = events.len())
    )]
    async fn append(
        &self,
        id: AgentId,
        version_check: version::Check,
        events: Vec<Pending>,
    ) -> Result<Version, AppendError> {
        self.store.append(id, version_check, events).await
    }
}

#[async_trait]
impl<T> Snapshotter for Instrumented<T>
where
    T: Store,
{
    #[instrument(
        name = "event::Store.save_snapshot",
        err,
        skip(self, snapshot),
        fields(agent_id = %snapshot.agent_id, version = snapshot.version)
    )]
    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), SnapshotError> {
        self.store.save_snapshot(snapshot).await
    }

    #[instrument(name = "event::Store.latest_snapshot", err, skip(self))]
    async fn latest_snapshot(&self, id: &AgentId) -> Result<Option<Snapshot>, SnapshotError> {
        self.store.latest_snapshot(id).await
    }
}

/// Extension trait that can be used to pull in decorators implemented
/// in this module.
pub trait StoreExt: Store + Sized {
    /// Returns a [Tracking] instance that decorates the original [Store]
    /// instance this method has been called on.
    fn with_append_tracking(self) -> Tracking<Self> {
        Tracking {
            store: self,
            appends: Arc::default(),
        }
    }

    /// Returns an instrumented version of the [Store] instance.
    fn with_tracing(self) -> Instrumented<Self> {
        Instrumented { store: self }
    }
}

impl<T> StoreExt for T where T: Store {}

#[cfg(test)]
mod test {
    use futures::TryStreamExt;
    use lazy_static::lazy_static;
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::event::Select;
    use crate::message::Message;
    use crate::version::Check;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct TestEvent {
        value: u64,
    }

    impl Message for TestEvent {
        fn type_url() -> &'static str {
            "agentry.test.TestEvent"
        }
    }

    lazy_static! {
        static ref AGENT_ID: AgentId = AgentId::new_v4();
        static ref EVENTS: Vec<Pending> = vec![
            Pending::new(&TestEvent { value: 1 }).unwrap(),
            Pending::new(&TestEvent { value: 2 }).unwrap(),
            Pending::new(&TestEvent { value: 3 }).unwrap(),
        ];
    }

    #[tokio::test]
    async fn it_works() {
        let store = InMemory::default();

        let new_version = store
            .append(*AGENT_ID, Check::MustBe(0), EVENTS.clone())
            .await
            .expect("append should not fail");

        assert_eq!(3, new_version);
        assert_eq!(3, store.latest_version(&AGENT_ID).await.unwrap());

        let events: Vec<Persisted> = store
            .stream(&AGENT_ID, Select::all())
            .try_collect()
            .await
            .expect("opening an event stream should not fail");

        let versions: Vec<Version> = events.iter().map(|event| event.version).collect();
        assert_eq!(vec![1, 2, 3], versions);

        for (event, expected) in events.iter().zip(EVENTS.iter()) {
            assert_eq!(expected.event_type, event.event_type);
            assert_eq!(expected.data, event.data);
            assert_eq!(*AGENT_ID, event.agent_id);
        }
    }

    #[tokio::test]
    async fn select_bounds_and_limit_are_honored() {
        let store = InMemory::default();

        store
            .append(*AGENT_ID, Check::Any, EVENTS.clone())
            .await
            .unwrap();

        let from_two: Vec<Persisted> = store
            .stream(&AGENT_ID, Select::from(2))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(vec![2, 3], from_two.iter().map(|e| e.version).collect::<Vec<_>>());

        let middle: Vec<Persisted> = store
            .stream(&AGENT_ID, Select::from(2).to(2))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(vec![2], middle.iter().map(|e| e.version).collect::<Vec<_>>());

        let capped: Vec<Persisted> = store
            .stream(&AGENT_ID, Select::all().limit(2))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(vec![1, 2], capped.iter().map(|e| e.version).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn version_conflict_checks_work_as_expected() {
        let store = InMemory::default();

        let append_error = store
            .append(*AGENT_ID, Check::MustBe(3), EVENTS.clone())
            .await
            .expect_err("the event stream version should be zero");

        if let AppendError::Conflict(err) = append_error {
            assert_eq!(
                version::ConflictError {
                    expected: 3,
                    actual: 0,
                },
                err
            );
            return;
        }

        panic!("expected conflict error, received: {append_error}")
    }

    #[tokio::test]
    async fn failed_append_persists_nothing() {
        let store = InMemory::default();

        store
            .append(*AGENT_ID, Check::MustBe(1), EVENTS.clone())
            .await
            .expect_err("append should conflict");

        assert_eq!(0, store.latest_version(&AGENT_ID).await.unwrap());

        let events: Vec<Persisted> = store
            .stream(&AGENT_ID, Select::all())
            .try_collect()
            .await
            .unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn distinct_agents_have_independent_logs() {
        let store = InMemory::default();
        let other = AgentId::new_v4();

        store
            .append(*AGENT_ID, Check::MustBe(0), EVENTS.clone())
            .await
            .unwrap();
        store
            .append(other, Check::MustBe(0), EVENTS[..1].to_vec())
            .await
            .unwrap();

        assert_eq!(3, store.latest_version(&AGENT_ID).await.unwrap());
        assert_eq!(1, store.latest_version(&other).await.unwrap());
    }

    #[tokio::test]
    async fn snapshots_are_saved_and_replaced() {
        let store = InMemory::default();

        assert!(store.latest_snapshot(&AGENT_ID).await.unwrap().is_none());

        let first = Snapshot {
            agent_id: *AGENT_ID,
            version: 2,
            state: vec![1, 2, 3],
            taken_at_ms: crate::unix_ms_now(),
        };

        store.save_snapshot(first.clone()).await.unwrap();
        assert_eq!(Some(first.clone()), store.latest_snapshot(&AGENT_ID).await.unwrap());

        let second = Snapshot {
            version: 5,
            state: vec![4, 5, 6],
            ..first
        };

        store.save_snapshot(second.clone()).await.unwrap();
        assert_eq!(Some(second), store.latest_snapshot(&AGENT_ID).await.unwrap());
    }

    #[tokio::test]
    async fn tracking_store_records_append_calls() {
        let store = InMemory::default().with_append_tracking();

        store
            .append(*AGENT_ID, Check::MustBe(0), EVENTS.clone())
            .await
            .unwrap();

        let appends = store.recorded_appends();
        assert_eq!(1, appends.len());
        assert_eq!(*AGENT_ID, appends[0].agent_id);
        assert_eq!(Check::MustBe(0), appends[0].expected);
        assert_eq!(3, appends[0].event_types.len());
        assert_eq!(3, appends[0].new_version);

        store.reset_recorded_appends();
        assert!(store.recorded_appends().is_empty());
    }

    #[tokio::test]
    async fn tracking_store_does_not_record_failed_appends() {
        let store = InMemory::default().with_append_tracking();

        store
            .append(*AGENT_ID, Check::MustBe(7), EVENTS.clone())
            .await
            .expect_err("append should conflict");

        assert!(store.recorded_appends().is_empty());
    }
}
