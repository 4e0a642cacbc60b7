//! Contact lifecycle
//!
//! The host opens a contact when two nodes come into range, completes the
//! transfers their ticks started, and closes the contact when the link goes
//! away. State shared across a contact (acks, relay counts, predictability
//! tables) is exchanged in two phases: both updates are computed from the
//! untouched state of the two nodes, then applied together.

use carrymesh_protocol::{MessageId, SimTime};
use std::sync::Arc;
use tracing::debug;

use crate::ack::AckExchange;
use crate::error::{Result, RoutingError};
use crate::node::Node;
use crate::router::TransferOutcome;

/// Everything two contacted nodes tell each other on a tick
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContactExchange {
    pub acks: AckExchange,
    /// Agreed relay count for messages both sides hold
    pub relay_counts: Vec<(MessageId, u32)>,
}

/// Copies purged on each side by an applied exchange
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Purged {
    pub first: usize,
    pub second: usize,
}

impl ContactExchange {
    pub fn plan(first: &Node, second: &Node) -> Self {
        let relay_counts = first
            .buffer()
            .iter()
            .filter_map(|mine| {
                let theirs = second.buffer().get(&mine.id())?;
                let (a, b) = (mine.routing.relay_count, theirs.routing.relay_count);
                (a != b).then_some((mine.id(), a.max(b)))
            })
            .collect();

        ContactExchange {
            acks: AckExchange::plan(first.acks(), second.acks()),
            relay_counts,
        }
    }

    pub fn apply(&self, first: &mut Node, second: &mut Node) -> Purged {
        self.acks
            .apply(&mut first.state.acks, &mut second.state.acks);

        for node in [&mut *first, &mut *second] {
            for (id, count) in &self.relay_counts {
                if let Some(msg) = node.state.buffer.get_mut(id) {
                    msg.routing.relay_count = *count;
                }
            }
        }

        Purged {
            first: purge(first),
            second: purge(second),
        }
    }
}

fn purge(node: &mut Node) -> usize {
    let state = &mut node.state;
    let purged = state.acks.purge(&mut state.buffer).len();
    state.stats.acked += purged as u64;
    purged
}

/// Plan and apply the per-tick exchange between two contacted nodes
pub fn exchange(first: &mut Node, second: &mut Node) -> Purged {
    let exchange = ContactExchange::plan(first, second);
    exchange.apply(first, second)
}

/// A link between two nodes came up
///
/// Opening an already open contact is a no-op. Both nodes must either run
/// compatible decision engines or none at all.
pub fn open_contact(first: &mut Node, second: &mut Node, now: SimTime) -> Result<()> {
    let (a, b) = (first.id(), second.id());
    if a == b || first.is_linked(&b) {
        return Ok(());
    }

    match (first.state.engine.as_mut(), second.state.engine.as_mut()) {
        (Some(mine), Some(theirs)) => {
            mine.connection_up(a, b, now);
            theirs.connection_up(b, a, now);
            mine.exchange_for_new_connection(a, b, &mut **theirs, now)?;
        }
        (None, None) => {}
        (Some(_), None) => return Err(RoutingError::IncompatiblePeer(b)),
        (None, Some(_)) => return Err(RoutingError::IncompatiblePeer(a)),
    }

    first.state.links.insert(b);
    second.state.links.insert(a);
    first.state.encounters += 1;
    second.state.encounters += 1;
    debug!(%a, %b, "contact up");
    Ok(())
}

/// A link went down; transfers in flight across it are abandoned
pub fn close_contact(first: &mut Node, second: &mut Node, now: SimTime) {
    let (a, b) = (first.id(), second.id());
    if !first.is_linked(&b) {
        return;
    }

    abort_transfer(first, second);
    abort_transfer(second, first);

    if let Some(engine) = first.state.engine.as_mut() {
        engine.connection_down(a, b, now);
    }
    if let Some(engine) = second.state.engine.as_mut() {
        engine.connection_down(b, a, now);
    }
    first.state.links.remove(&b);
    second.state.links.remove(&a);
    debug!(%a, %b, "contact down");
}

/// Abandon the transfer `initiator` started with `counterpart`, if any
pub fn abort_transfer(initiator: &mut Node, counterpart: &mut Node) -> bool {
    let pending = initiator
        .transfer()
        .is_some_and(|t| t.counterpart() == counterpart.id());
    if !pending {
        return false;
    }
    let Some(transfer) = initiator.state.transfer.take() else {
        return false;
    };

    for node in [&mut *initiator, &mut *counterpart] {
        if node.id() == transfer.from {
            node.state.buffer.clear_sending(&transfer.message);
        } else {
            node.state.buffer.release(&transfer.message);
        }
    }
    initiator.state.stats.aborted += 1;
    debug!(from = %transfer.from, to = %transfer.to, id = %transfer.message, "transfer aborted");
    true
}

/// Complete whatever the two nodes started with each other
pub fn complete_pending(
    first: &mut Node,
    second: &mut Node,
    now: SimTime,
) -> Result<Vec<TransferOutcome>> {
    let policy = Arc::clone(first.policy());
    let mut outcomes = Vec::new();
    if let Some(outcome) = policy.complete(first, second, now)? {
        outcomes.push(outcome);
    }
    if let Some(outcome) = policy.complete(second, first, now)? {
        outcomes.push(outcome);
    }
    Ok(outcomes)
}
