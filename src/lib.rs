//! Agentry is a minimalistic crate that exposes a few building blocks to
//! build hierarchies of long-lived, message-driven agents in Rust.
//!
//! Agents are addressable entities with identity, state, and typed event
//! handlers. Each agent is owned by an [Actor][crate::actor::Actor] that
//! binds it to a bounded, ordered [mailbox][crate::mailbox::Mailbox] and
//! drives its lifecycle. Agents are linked into parent/child hierarchies
//! and communicate by publishing [envelopes][crate::envelope::EventEnvelope]
//! that travel [up, down, or both ways][crate::envelope::Direction] through
//! the hierarchy.
//!
//! Agents that derive their state from an append-only log of Domain Events
//! implement the [sourced][crate::sourced] contract: events are staged,
//! committed to an [Event Store][crate::event::Store] under optimistic
//! concurrency, and replayed (optionally from a snapshot) when the agent
//! is activated again.

pub mod actor;
pub mod agent;
pub mod envelope;
pub mod event;
pub mod factory;
pub mod mailbox;
pub mod message;
pub mod routing;
pub mod serde;
pub mod sourced;
pub mod state;
pub mod subscription;
pub mod version;

use std::time::{SystemTime, UNIX_EPOCH};

/// The stable, 128-bit identity of an agent.
pub type AgentId = uuid::Uuid;

/// Current wall-clock time in Unix milliseconds.
pub(crate) fn unix_ms_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
