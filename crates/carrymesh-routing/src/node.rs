//! Per-node routing state

use carrymesh_protocol::{Message, MessageId, NodeId, SimTime};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::ack::AckPropagator;
use crate::buffer::MessageBuffer;
use crate::decision::RoutingDecisionEngine;
use crate::error::Result;
use crate::router::{RouterPolicy, RouterStats, Transfer};
use crate::spray::EncounterRate;

/// Everything a node's router keeps between ticks
#[derive(Debug)]
pub struct NodeRoutingState {
    pub(crate) buffer: MessageBuffer,
    pub(crate) acks: AckPropagator,
    pub(crate) engine: Option<Box<dyn RoutingDecisionEngine>>,
    /// Contacts ever opened by this node
    pub(crate) encounters: u64,
    pub(crate) encounter_rate: EncounterRate,
    /// Peers with an open contact
    pub(crate) links: BTreeSet<NodeId>,
    /// Outbound transfer this node started and has not finished
    pub(crate) transfer: Option<Transfer>,
    pub(crate) stats: RouterStats,
    sequence: u32,
}

/// A node of the network, as seen by the routing layer
#[derive(Debug)]
pub struct Node {
    id: NodeId,
    policy: Arc<RouterPolicy>,
    pub(crate) state: NodeRoutingState,
}

impl Node {
    pub fn new(id: NodeId, policy: Arc<RouterPolicy>) -> Self {
        let config = policy.config();
        let state = NodeRoutingState {
            buffer: MessageBuffer::new(config.buffer_capacity),
            acks: AckPropagator::new(),
            engine: policy.new_engine(),
            encounters: 0,
            encounter_rate: EncounterRate::new(
                config.spray.encounter_alpha,
                config.spray.fragment_secs,
            ),
            links: BTreeSet::new(),
            transfer: None,
            stats: RouterStats::default(),
            sequence: 0,
        };

        Node { id, policy, state }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn policy(&self) -> &Arc<RouterPolicy> {
        &self.policy
    }

    pub fn buffer(&self) -> &MessageBuffer {
        &self.state.buffer
    }

    pub fn acks(&self) -> &AckPropagator {
        &self.state.acks
    }

    pub fn engine(&self) -> Option<&dyn RoutingDecisionEngine> {
        self.state.engine.as_deref()
    }

    pub fn encounters(&self) -> u64 {
        self.state.encounters
    }

    pub fn encounter_rate(&self) -> &EncounterRate {
        &self.state.encounter_rate
    }

    pub fn is_linked(&self, peer: &NodeId) -> bool {
        self.state.links.contains(peer)
    }

    pub fn links(&self) -> impl Iterator<Item = &NodeId> {
        self.state.links.iter()
    }

    /// Whether this node has an outbound transfer pending
    pub fn is_transferring(&self) -> bool {
        self.state.transfer.is_some()
    }

    pub fn transfer(&self) -> Option<&Transfer> {
        self.state.transfer.as_ref()
    }

    pub fn has_message(&self, id: &MessageId) -> bool {
        self.state.buffer.contains(id)
    }

    /// Stored, incoming, or known to be delivered
    pub(crate) fn holds_or_knows(&self, id: &MessageId) -> bool {
        self.state.buffer.contains(id)
            || self.state.buffer.is_reserved(id)
            || self.state.acks.is_delivered(id)
    }

    /// Counters, with evictions read from the buffer
    pub fn stats(&self) -> RouterStats {
        let mut stats = self.state.stats.clone();
        stats.evicted = self.state.buffer.evictions();
        stats
    }

    pub(crate) fn next_sequence(&mut self) -> u32 {
        let seq = self.state.sequence;
        self.state.sequence = self.state.sequence.wrapping_add(1);
        seq
    }

    /// Create a data message at this node
    ///
    /// Returns Ok(None) when the buffer cannot admit it.
    pub fn create_message(
        &mut self,
        destination: NodeId,
        size: u64,
        response_size: u64,
        now: SimTime,
    ) -> Result<Option<MessageId>> {
        let sequence = self.next_sequence();
        let message = Message::new(self.id, destination, size, now, sequence)?
            .with_response_size(response_size);
        let policy = Arc::clone(&self.policy);
        policy.create_message(self, message, now)
    }

    /// Run this node's router for one simulated step
    ///
    /// `peers` may contain any nodes; only those with an open contact take
    /// part. Returns the transfer started this tick, if any.
    pub fn tick(&mut self, peers: &mut [&mut Node], now: SimTime) -> Result<Option<Transfer>> {
        let policy = Arc::clone(&self.policy);
        policy.tick(self, peers, now)
    }
}
