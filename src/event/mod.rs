//! Module `event` contains types and abstractions helpful for working
//! with the Domain Events recorded by event-sourced agents.

pub mod store;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use crate::event::store::Store;
use crate::message::{Message, Metadata};
use crate::version::Version;
use crate::AgentId;

/// An Event is a [Message][crate::message::Message] carrying the information
/// about a Domain Event, an occurrence in the system lifetime that is
/// relevant for the Domain that is being implemented.
pub type Envelope<T> = crate::message::Envelope<T>;

/// An event record that has not yet been assigned a [Version] by the
/// Event [Store].
///
/// The payload is carried as serialized bytes tagged with the stable wire
/// name of its type, so that a single store can serve agents with
/// heterogeneous event types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pending {
    /// Stable wire name of the payload type.
    pub event_type: String,

    /// Serialized payload bytes.
    pub data: Vec<u8>,

    /// Optional context attached to the event.
    pub metadata: Metadata,
}

impl Pending {
    /// Serializes a Domain Event into a [Pending] record, keyed by the
    /// value-level [name][crate::message::Message::name] of the event.
    ///
    /// # Errors
    ///
    /// Returns the underlying codec error when the payload cannot
    /// be serialized.
    pub fn new<T>(event: &T) -> Result<Self, serde_json::Error>
    where
        T: Message + Serialize,
    {
        Ok(Self {
            event_type: event.name().to_owned(),
            data: serde_json::to_vec(event)?,
            metadata: Metadata::default(),
        })
    }

    /// Attaches metadata to the record.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// An event record that has been persisted to the Event [Store].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Persisted {
    /// Unique identifier of this record.
    pub event_id: Uuid,

    /// The agent whose event log the record belongs to.
    pub agent_id: AgentId,

    /// The version of the agent's event log when this record was appended.
    ///
    /// Versions are consecutive within an agent, starting at 1. This value
    /// is used for optimistic concurrency checks, to avoid data races in
    /// parallel commits.
    pub version: Version,

    /// Stable wire name of the payload type.
    pub event_type: String,

    /// Serialized payload bytes.
    pub data: Vec<u8>,

    /// Optional context attached to the event.
    pub metadata: Metadata,

    /// When the record was appended, in Unix milliseconds.
    pub recorded_at_ms: u64,
}

/// A serialized copy of an agent's state, stored alongside the event log
/// to shorten replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// The agent the snapshot belongs to.
    pub agent_id: AgentId,

    /// The log version the state was taken at. Replaying events with
    /// versions greater than this value on top of the snapshot state
    /// reproduces the current state.
    pub version: Version,

    /// Serialized state bytes.
    pub state: Vec<u8>,

    /// When the snapshot was taken, in Unix milliseconds.
    pub taken_at_ms: u64,
}

/// Specifies the slice of an agent's event log to select when calling
/// [`store::Streamer::stream`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Select {
    /// Lowest version to include (inclusive). `None` selects from the start.
    pub from: Option<Version>,

    /// Highest version to include (inclusive). `None` selects to the end.
    pub to: Option<Version>,

    /// Maximum number of events to return. `None` returns all selected.
    pub limit: Option<usize>,
}

impl Select {
    /// Selects every event in the log.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Selects events with version greater than or equal to `version`.
    #[must_use]
    pub fn from(version: Version) -> Self {
        Self {
            from: Some(version),
            ..Self::default()
        }
    }

    /// Bounds the selection to versions less than or equal to `version`.
    #[must_use]
    pub fn to(mut self, version: Version) -> Self {
        self.to = Some(version);
        self
    }

    /// Caps the number of events returned.
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub(crate) fn contains(&self, version: Version) -> bool {
        self.from.map_or(true, |from| version >= from)
            && self.to.map_or(true, |to| version <= to)
    }
}

/// Stream is a stream of [Persisted] Domain Events.
pub type Stream<'a, Err> = BoxStream<'a, Result<Persisted, Err>>;
