//! Direction-aware delivery of [EventEnvelope]s into agent mailboxes.
//!
//! Routing is invoked twice in an envelope's life: once by the publishing
//! actor, and once by every receiving actor that forwards the envelope
//! further along its direction (see [onward]). Each pass records the
//! current agent in the envelope's traversal path, increments the hop
//! counter, and fans the envelope out into the mailboxes selected by its
//! [Direction].
//!
//! Recoverable problems are absorbed here: an exhausted hop budget, a
//! traversal cycle, or a missing target mailbox drop the affected delivery
//! with a log line, and never fail the publication.

use tracing::{debug, warn};

use crate::envelope::{Direction, EventEnvelope};
use crate::mailbox::MailboxRegistry;
use crate::AgentId;

/// The publisher-side view of an agent's position in the hierarchy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HierarchyView {
    /// The agent's parent, when linked.
    pub parent: Option<AgentId>,

    /// The agent's children.
    pub children: Vec<AgentId>,
}

/// Routes an envelope from `current` into the mailboxes selected by the
/// envelope's direction and the agent's [HierarchyView].
pub async fn route(
    envelope: EventEnvelope,
    current: AgentId,
    view: &HierarchyView,
    mailboxes: &MailboxRegistry,
) {
    if envelope.current_hops >= envelope.max_hops {
        debug!(
            envelope_id = %envelope.id,
            max_hops = envelope.max_hops,
            "hop budget exhausted, dropping envelope"
        );
        return;
    }

    if envelope.publisher_id != current && envelope.has_traversed(&current) {
        debug!(
            envelope_id = %envelope.id,
            agent_id = %current,
            "delivery cycle detected, dropping envelope"
        );
        return;
    }

    let envelope = envelope.hop(current);

    match envelope.direction {
        Direction::Local => deliver(&envelope, current, mailboxes).await,
        Direction::Up => {
            if let Some(parent) = view.parent {
                deliver(&envelope, parent, mailboxes).await;
            }
        }
        Direction::Down => {
            for child in &view.children {
                deliver(&envelope, *child, mailboxes).await;
            }
        }
        Direction::Both => {
            deliver(&envelope, current, mailboxes).await;
            if let Some(parent) = view.parent {
                deliver(&envelope, parent, mailboxes).await;
            }
            for child in &view.children {
                deliver(&envelope, *child, mailboxes).await;
            }
        }
    }
}

/// Computes the envelope a receiver forwards onwards, if any.
///
/// Envelopes travelling [Up][Direction::Up] or [Down][Direction::Down]
/// keep their direction. An envelope travelling in [both][Direction::Both]
/// directions is narrowed based on where it came from: received from the
/// parent it continues [Down][Direction::Down] only, received from a child
/// it continues [Up][Direction::Up] only, so legs are never re-broadcast
/// sideways. [Local][Direction::Local] envelopes never travel.
#[must_use]
pub fn onward(envelope: &EventEnvelope, view: &HierarchyView) -> Option<EventEnvelope> {
    match envelope.direction {
        Direction::Local => None,
        Direction::Up | Direction::Down => Some(envelope.clone()),
        Direction::Both => {
            let from = envelope.publishers.last().copied()?;

            if view.parent == Some(from) {
                Some(envelope.redirected(Direction::Down))
            } else if view.children.contains(&from) {
                Some(envelope.redirected(Direction::Up))
            } else {
                None
            }
        }
    }
}

async fn deliver(envelope: &EventEnvelope, target: AgentId, mailboxes: &MailboxRegistry) {
    let Some(mailbox) = mailboxes.get(&target) else {
        warn!(
            envelope_id = %envelope.id,
            agent_id = %target,
            "no stream for target agent, dropping delivery"
        );
        return;
    };

    if let Err(err) = mailbox.produce(envelope.clone()).await {
        warn!(
            envelope_id = %envelope.id,
            agent_id = %target,
            error = %err,
            "failed to produce into target stream"
        );
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;
    use uuid::Uuid;

    use super::*;
    use crate::envelope::Payload;
    use crate::mailbox::Handler;
    use crate::message::tests::StringMessage;

    fn envelope(publisher: AgentId, direction: Direction) -> EventEnvelope {
        let payload = Payload::pack(&StringMessage("hello")).unwrap();
        EventEnvelope::new(publisher, payload, direction, 16)
    }

    fn collect(
        registry: &MailboxRegistry,
        agent: AgentId,
    ) -> Arc<Mutex<Vec<EventEnvelope>>> {
        let seen: Arc<Mutex<Vec<EventEnvelope>>> = Arc::default();
        let sink = Arc::clone(&seen);

        let handler: Handler = Arc::new(move |envelope| {
            let sink = Arc::clone(&sink);
            Box::pin(async move {
                sink.lock().push(envelope);
                Ok(())
            })
        });

        registry
            .get_or_create(agent)
            .subscribe(handler, None)
            .unwrap();

        seen
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    #[tokio::test]
    async fn local_envelopes_reach_only_the_publisher() {
        let registry = MailboxRegistry::default();
        let publisher = AgentId::new_v4();
        let child = AgentId::new_v4();

        let own = collect(&registry, publisher);
        let child_seen = collect(&registry, child);

        let view = HierarchyView {
            parent: None,
            children: vec![child],
        };

        route(envelope(publisher, Direction::Local), publisher, &view, &registry).await;
        settle().await;

        assert_eq!(1, own.lock().len());
        assert!(child_seen.lock().is_empty());
    }

    #[tokio::test]
    async fn down_envelopes_fan_out_to_every_child() {
        let registry = MailboxRegistry::default();
        let publisher = AgentId::new_v4();
        let children: Vec<AgentId> = (0..3).map(|_| AgentId::new_v4()).collect();

        let seen: Vec<_> = children
            .iter()
            .map(|child| collect(&registry, *child))
            .collect();

        let view = HierarchyView {
            parent: None,
            children: children.clone(),
        };

        route(envelope(publisher, Direction::Down), publisher, &view, &registry).await;
        settle().await;

        for sink in &seen {
            let sink = sink.lock();
            assert_eq!(1, sink.len());
            assert_eq!(1, sink[0].current_hops);
            assert_eq!(vec![publisher], sink[0].publishers);
        }
    }

    #[tokio::test]
    async fn up_envelopes_without_a_parent_go_nowhere() {
        let registry = MailboxRegistry::default();
        let publisher = AgentId::new_v4();
        let own = collect(&registry, publisher);

        route(
            envelope(publisher, Direction::Up),
            publisher,
            &HierarchyView::default(),
            &registry,
        )
        .await;
        settle().await;

        assert!(own.lock().is_empty());
    }

    #[tokio::test]
    async fn exhausted_hop_budgets_drop_the_envelope() {
        let registry = MailboxRegistry::default();
        let publisher = AgentId::new_v4();
        let parent = AgentId::new_v4();
        let seen = collect(&registry, parent);

        let mut envelope = envelope(publisher, Direction::Up);
        envelope.current_hops = envelope.max_hops;

        let view = HierarchyView {
            parent: Some(parent),
            children: Vec::new(),
        };

        route(envelope, publisher, &view, &registry).await;
        settle().await;

        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn already_traversed_agents_break_cycles() {
        let registry = MailboxRegistry::default();
        let publisher = AgentId::new_v4();
        let forwarder = AgentId::new_v4();
        let target = AgentId::new_v4();
        let seen = collect(&registry, target);

        // The envelope went publisher -> forwarder once already.
        let envelope = envelope(publisher, Direction::Down).hop(forwarder);

        let view = HierarchyView {
            parent: None,
            children: vec![target],
        };

        route(envelope, forwarder, &view, &registry).await;
        settle().await;

        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn missing_target_streams_do_not_fail_the_publication() {
        let registry = MailboxRegistry::default();
        let publisher = AgentId::new_v4();

        let view = HierarchyView {
            parent: Some(AgentId::new_v4()),
            children: Vec::new(),
        };

        // No mailbox exists for the parent; the call simply returns.
        route(envelope(publisher, Direction::Up), publisher, &view, &registry).await;
    }

    #[test]
    fn onward_keeps_vertical_directions() {
        let view = HierarchyView::default();
        let up = envelope(AgentId::new_v4(), Direction::Up);

        assert_eq!(
            Some(Direction::Up),
            onward(&up, &view).map(|e| e.direction)
        );
        assert!(onward(&envelope(AgentId::new_v4(), Direction::Local), &view).is_none());
    }

    #[test]
    fn onward_narrows_both_based_on_the_sender() {
        let parent = AgentId::new_v4();
        let child = AgentId::new_v4();
        let stranger = AgentId::new_v4();

        let view = HierarchyView {
            parent: Some(parent),
            children: vec![child],
        };

        let from_parent = envelope(parent, Direction::Both).hop(parent);
        assert_eq!(
            Some(Direction::Down),
            onward(&from_parent, &view).map(|e| e.direction)
        );

        let from_child = envelope(child, Direction::Both).hop(child);
        assert_eq!(
            Some(Direction::Up),
            onward(&from_child, &view).map(|e| e.direction)
        );

        let from_stranger = envelope(stranger, Direction::Both).hop(stranger);
        assert!(onward(&from_stranger, &view).is_none());
    }

    #[test]
    fn hop_budget_bounds_chain_length() {
        let mut envelope = envelope(AgentId::new_v4(), Direction::Down);
        envelope.max_hops = 3;

        let mut hops = 0;
        while envelope.current_hops < envelope.max_hops {
            envelope = envelope.hop(Uuid::new_v4());
            hops += 1;
        }

        assert_eq!(3, hops);
    }
}
