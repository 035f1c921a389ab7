//! This module contains the definition of a [Message] type, which
//! describes a piece of domain data exchanged between agents, such as a
//! Domain Event recorded by an event-sourced agent, or a payload routed
//! between agents through an [`EventEnvelope`][crate::envelope::EventEnvelope].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Represents a piece of domain data that occurs in the system.
///
/// Each Message type has a stable, ideally fully-qualified name, unique
/// within the domain you're operating in. Example: a Domain Event that
/// represents when an Order was created can have a [`Message::type_url`]
/// of `"OrderWasCreated"`.
pub trait Message: Send + Sync {
    /// Returns the stable wire name of the [Message] type.
    ///
    /// Typed handler registration and payload unpacking are keyed
    /// by this value.
    fn type_url() -> &'static str
    where
        Self: Sized;

    /// Returns the wire name of this specific value.
    ///
    /// Defaults to [`Message::type_url`]. Enum messages typically override
    /// this to return the variant name, which is the key persisted as the
    /// `event_type` of a stored event.
    fn name(&self) -> &'static str
    where
        Self: Sized,
    {
        Self::type_url()
    }
}

/// Optional metadata to attach to an [Envelope] to provide additional context
/// to the [Message] carried out.
pub type Metadata = HashMap<String, String>;

/// Represents a [Message] packaged for persistence and/or processing by other
/// parts of the system.
///
/// It carries both the actual message (i.e. a payload) and some optional [Metadata].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T>
where
    T: Message,
{
    /// The message payload.
    pub message: T,
    /// Optional metadata to provide additional context to the message.
    pub metadata: Metadata,
}

impl<T> Envelope<T>
where
    T: Message,
{
    /// Adds a new entry in the [Envelope]'s [Metadata].
    #[must_use]
    pub fn with_metadata(mut self, key: String, value: String) -> Self {
        self.metadata.insert(key, value);
        self
    }
}

impl<T> From<T> for Envelope<T>
where
    T: Message,
{
    fn from(message: T) -> Self {
        Envelope {
            message,
            metadata: Metadata::default(),
        }
    }
}

impl<T> PartialEq for Envelope<T>
where
    T: Message + PartialEq,
{
    fn eq(&self, other: &Envelope<T>) -> bool {
        self.message == other.message
    }
}
