//! Delivery acknowledgments
//!
//! Every node carries the set of message ids it knows to be delivered
//! somewhere in the network. Contacts union the two sets; a node then purges
//! buffered copies of anything in its set. The set only ever grows.

use carrymesh_protocol::{MessageId, SimTime};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::buffer::MessageBuffer;

/// Known-delivered ids of one node
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AckPropagator {
    /// Network-wide known deliveries, learned directly or through contacts
    delivered: BTreeSet<MessageId>,
    /// Messages this node itself received as final destination
    received: BTreeMap<MessageId, SimTime>,
}

impl AckPropagator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a local delivery. Returns false if it was already known.
    pub fn record_delivery(&mut self, id: MessageId, now: SimTime) -> bool {
        self.received.entry(id).or_insert(now);
        self.delivered.insert(id)
    }

    pub fn is_delivered(&self, id: &MessageId) -> bool {
        self.delivered.contains(id)
    }

    /// Whether this node was the final recipient of `id`
    pub fn received_here(&self, id: &MessageId) -> Option<SimTime> {
        self.received.get(id).copied()
    }

    pub fn delivered(&self) -> &BTreeSet<MessageId> {
        &self.delivered
    }

    pub fn len(&self) -> usize {
        self.delivered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.delivered.is_empty()
    }

    /// Ids in `other` this node does not know yet
    pub fn missing_from(&self, other: &AckPropagator) -> BTreeSet<MessageId> {
        other
            .delivered
            .difference(&self.delivered)
            .copied()
            .collect()
    }

    /// Union `ids` into the set, returning how many were new
    pub fn merge<'a>(&mut self, ids: impl IntoIterator<Item = &'a MessageId>) -> usize {
        let before = self.delivered.len();
        self.delivered.extend(ids);
        self.delivered.len() - before
    }

    /// Drop every buffered message already known as delivered
    ///
    /// Messages in flight are purged as well; a transfer that later finds
    /// its message gone is treated as aborted.
    pub fn purge(&self, buffer: &mut MessageBuffer) -> Vec<MessageId> {
        let stale: Vec<MessageId> = buffer
            .ids()
            .filter(|id| self.delivered.contains(id))
            .collect();

        for id in &stale {
            buffer.remove(id);
        }
        if !stale.is_empty() {
            debug!(count = stale.len(), "purged acknowledged messages");
        }
        stale
    }
}

/// The two halves of an ack exchange, computed before either side changes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AckExchange {
    pub to_first: BTreeSet<MessageId>,
    pub to_second: BTreeSet<MessageId>,
}

impl AckExchange {
    pub fn plan(first: &AckPropagator, second: &AckPropagator) -> Self {
        AckExchange {
            to_first: first.missing_from(second),
            to_second: second.missing_from(first),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.to_first.is_empty() && self.to_second.is_empty()
    }

    /// Apply both halves. Returns the number of ids each side learned.
    pub fn apply(&self, first: &mut AckPropagator, second: &mut AckPropagator) -> (usize, usize) {
        (first.merge(&self.to_first), second.merge(&self.to_second))
    }
}
