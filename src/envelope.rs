//! The uniform carrier for any message routed between agents.
//!
//! Unlike the [`message::Envelope`][crate::message::Envelope] used for
//! Domain Events inside a single agent, an [EventEnvelope] crosses agent
//! boundaries: its payload is type-erased into serialized bytes tagged
//! with the stable wire name of the payload type, and the envelope carries
//! the routing information (direction, hop counters, traversal path) used
//! by the [routing][crate::routing] layer.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::Message;
use crate::AgentId;

/// The routing intent of an [EventEnvelope].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Deliver to the publishing agent only.
    Local,

    /// Deliver towards the parent of the publishing agent.
    Up,

    /// Deliver towards the children of the publishing agent.
    Down,

    /// Deliver towards both the parent and the children.
    Both,
}

/// A [Message] payload packed for transport: serialized bytes tagged with
/// the wire name of the payload type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    /// Stable wire name of the payload type.
    pub type_url: String,

    /// Serialized payload bytes.
    pub data: Vec<u8>,
}

/// Error returned when a [Payload] cannot be unpacked into the requested
/// message type.
#[derive(Debug, thiserror::Error)]
pub enum MalformedPayload {
    /// The payload carries a different type than the requested one.
    #[error("payload type mismatch, expected: {expected}, found: {found}")]
    TypeMismatch {
        /// The wire name of the requested type.
        expected: &'static str,
        /// The wire name found in the payload.
        found: String,
    },

    /// The payload bytes could not be decoded into the requested type.
    #[error("failed to decode payload of type {type_url}: {source}")]
    Decode {
        /// The wire name found in the payload.
        type_url: String,
        /// The underlying codec error.
        #[source]
        source: serde_json::Error,
    },
}

impl Payload {
    /// Packs a message into a transport [Payload].
    ///
    /// # Errors
    ///
    /// Returns the underlying codec error when the message cannot
    /// be serialized.
    pub fn pack<T>(message: &T) -> Result<Self, serde_json::Error>
    where
        T: Message + Serialize,
    {
        Ok(Self {
            type_url: T::type_url().to_owned(),
            data: serde_json::to_vec(message)?,
        })
    }

    /// Unpacks the payload into the requested message type.
    ///
    /// # Errors
    ///
    /// Fails with [`MalformedPayload::TypeMismatch`] when the payload's
    /// type url does not match the requested type, and with
    /// [`MalformedPayload::Decode`] when the bytes cannot be decoded.
    pub fn unpack<T>(&self) -> Result<T, MalformedPayload>
    where
        T: Message + DeserializeOwned,
    {
        if self.type_url != T::type_url() {
            return Err(MalformedPayload::TypeMismatch {
                expected: T::type_url(),
                found: self.type_url.clone(),
            });
        }

        serde_json::from_slice(&self.data).map_err(|source| MalformedPayload::Decode {
            type_url: self.type_url.clone(),
            source,
        })
    }

    /// Returns whether the payload carries a message of type `T`.
    pub fn is<T>(&self) -> bool
    where
        T: Message,
    {
        self.type_url == T::type_url()
    }
}

/// Errors returned by the [EventEnvelope] wire codec.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The buffer is shorter than its length prefix declares.
    #[error("truncated envelope: expected {expected} bytes, found {found}")]
    Truncated {
        /// Bytes declared by the length prefix.
        expected: usize,
        /// Bytes actually available.
        found: usize,
    },

    /// The envelope record could not be encoded.
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),

    /// The envelope record could not be decoded.
    #[error("failed to decode envelope: {0}")]
    Decode(#[source] serde_json::Error),
}

/// The uniform carrier for any message exchanged between agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique identifier of this send.
    pub id: Uuid,

    /// The type-erased message being carried.
    pub payload: Payload,

    /// The agent that emitted the envelope.
    pub publisher_id: AgentId,

    /// The agents the envelope has traversed, in order. Used to
    /// suppress delivery cycles.
    pub publishers: Vec<AgentId>,

    /// Optional identifier grouping envelopes that belong to the same
    /// causal chain.
    pub correlation_id: Option<Uuid>,

    /// The routing intent of the envelope.
    pub direction: Direction,

    /// Upper bound on the number of hops the envelope may traverse.
    pub max_hops: u32,

    /// Number of hops traversed so far.
    pub current_hops: u32,

    /// When the envelope was published, in Unix milliseconds.
    pub published_at_ms: u64,
}

impl EventEnvelope {
    /// Builds a new envelope emitted by `publisher`.
    #[must_use]
    pub fn new(publisher: AgentId, payload: Payload, direction: Direction, max_hops: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            publisher_id: publisher,
            publishers: vec![publisher],
            correlation_id: None,
            direction,
            max_hops,
            current_hops: 0,
            published_at_ms: crate::unix_ms_now(),
        }
    }

    /// Sets the correlation identifier of the envelope.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Returns a copy of the envelope advanced by one hop through `agent`:
    /// the agent is recorded in the traversal path and the hop counter
    /// is incremented.
    #[must_use]
    pub fn hop(&self, agent: AgentId) -> Self {
        let mut next = self.clone();
        if next.publishers.last() != Some(&agent) {
            next.publishers.push(agent);
        }
        next.current_hops += 1;
        next
    }

    /// Returns whether the envelope has already traversed `agent`.
    pub fn has_traversed(&self, agent: &AgentId) -> bool {
        self.publishers.contains(agent)
    }

    /// Returns a copy of the envelope with a rewritten routing intent.
    #[must_use]
    pub fn redirected(&self, direction: Direction) -> Self {
        let mut next = self.clone();
        next.direction = direction;
        next
    }

    /// Encodes the envelope into its length-prefixed wire form.
    ///
    /// # Errors
    ///
    /// Fails with [`WireError::Encode`] when the record cannot be
    /// serialized.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let record = serde_json::to_vec(self).map_err(WireError::Encode)?;

        let mut buf = Vec::with_capacity(4 + record.len());
        buf.extend_from_slice(&(record.len() as u32).to_be_bytes());
        buf.extend_from_slice(&record);
        Ok(buf)
    }

    /// Decodes an envelope from its length-prefixed wire form.
    ///
    /// Unknown fields in the record are ignored, so envelopes produced by
    /// newer revisions of the wire format still decode.
    ///
    /// # Errors
    ///
    /// Fails with [`WireError::Truncated`] when the buffer is shorter than
    /// its length prefix declares, or with [`WireError::Decode`] when the
    /// record cannot be decoded.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let (prefix, record) = buf.split_at(buf.len().min(4));

        let mut len_bytes = [0u8; 4];
        len_bytes[..prefix.len()].copy_from_slice(prefix);
        let expected = u32::from_be_bytes(len_bytes) as usize;

        if prefix.len() < 4 || record.len() < expected {
            return Err(WireError::Truncated {
                expected,
                found: record.len(),
            });
        }

        serde_json::from_slice(&record[..expected]).map_err(WireError::Decode)
    }
}
