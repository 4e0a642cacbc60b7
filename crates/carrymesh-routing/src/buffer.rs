//! Bounded message buffer with pluggable eviction
//!
//! Admission never exceeds capacity. Room is made by evicting one victim at a
//! time, chosen by the configured [`EvictionPolicy`]; messages that are being
//! sent are never victims.

use carrymesh_protocol::{MessageId, SimTime};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::debug;

use crate::buffered::BufferedMessage;
use crate::decision::RoutingDecisionEngine;
use crate::error::{Result, RoutingError};
use crate::scorer::PriorityScorer;

/// Victim selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Lowest stored priority
    MinPriority,
    /// Earliest receive time
    #[default]
    OldestReceived,
    /// Lowest relay count; ties re-scored, lower score evicted
    LeastReplicated,
    /// Highest relay count; ties re-scored, lower score evicted
    MostReplicated,
    /// Lowest delivery predictability for the message's destination
    LowestPredictability,
}

/// What a victim comparison may consult
#[derive(Clone, Copy, Default)]
pub struct EvictionContext<'a> {
    pub scorer: Option<&'a PriorityScorer>,
    pub engine: Option<&'a dyn RoutingDecisionEngine>,
    pub now: SimTime,
}

/// A node's message store
#[derive(Debug, Clone)]
pub struct MessageBuffer {
    capacity: u64,
    messages: BTreeMap<MessageId, BufferedMessage>,
    used: u64,
    reserved: BTreeMap<MessageId, u64>,
    /// Outbound sends in progress per message
    sending: BTreeMap<MessageId, u32>,
    evictions: u64,
}

impl MessageBuffer {
    pub fn new(capacity: u64) -> Self {
        MessageBuffer {
            capacity,
            messages: BTreeMap::new(),
            used: 0,
            reserved: BTreeMap::new(),
            sending: BTreeMap::new(),
            evictions: 0,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes held by stored messages
    pub fn occupancy(&self) -> u64 {
        self.used
    }

    /// Space left after stored messages and pending reservations
    pub fn free_space(&self) -> u64 {
        let reserved: u64 = self.reserved.values().sum();
        self.capacity.saturating_sub(self.used + reserved)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Messages evicted over the buffer's lifetime
    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.messages.contains_key(id)
    }

    pub fn get(&self, id: &MessageId) -> Option<&BufferedMessage> {
        self.messages.get(id)
    }

    pub fn get_mut(&mut self, id: &MessageId) -> Option<&mut BufferedMessage> {
        self.messages.get_mut(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = MessageId> + '_ {
        self.messages.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BufferedMessage> {
        self.messages.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut BufferedMessage> {
        self.messages.values_mut()
    }

    /// Store a message if it fits in the free space
    ///
    /// Returns false (and stores nothing) when the id is already present or
    /// the message does not fit.
    pub fn insert(&mut self, msg: BufferedMessage) -> bool {
        if self.messages.contains_key(&msg.id()) || msg.size() > self.free_space() {
            return false;
        }
        self.used += msg.size();
        self.messages.insert(msg.id(), msg);
        true
    }

    pub fn remove(&mut self, id: &MessageId) -> Option<BufferedMessage> {
        let msg = self.messages.remove(id)?;
        self.used -= msg.size();
        self.sending.remove(id);
        Some(msg)
    }

    pub fn mark_sending(&mut self, id: MessageId) -> Result<()> {
        if !self.messages.contains_key(&id) {
            return Err(RoutingError::UnknownMessage(id));
        }
        *self.sending.entry(id).or_insert(0) += 1;
        Ok(())
    }

    /// Undo one [`MessageBuffer::mark_sending`]
    pub fn clear_sending(&mut self, id: &MessageId) {
        if let Some(count) = self.sending.get_mut(id) {
            *count -= 1;
            if *count == 0 {
                self.sending.remove(id);
            }
        }
    }

    pub fn is_sending(&self, id: &MessageId) -> bool {
        self.sending.contains_key(id)
    }

    /// Hold space for an incoming message. Returns false if it does not fit.
    pub fn reserve(&mut self, id: MessageId, size: u64) -> bool {
        if self.reserved.contains_key(&id) || size > self.free_space() {
            return false;
        }
        self.reserved.insert(id, size);
        true
    }

    pub fn release(&mut self, id: &MessageId) -> Option<u64> {
        self.reserved.remove(id)
    }

    pub fn is_reserved(&self, id: &MessageId) -> bool {
        self.reserved.contains_key(id)
    }

    /// Remove and return every message for which `f` is true
    pub fn drain_where<F>(&mut self, mut f: F) -> Vec<BufferedMessage>
    where
        F: FnMut(&BufferedMessage) -> bool,
    {
        let ids: Vec<MessageId> = self
            .messages
            .values()
            .filter(|m| f(m))
            .map(|m| m.id())
            .collect();
        ids.iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Evict until `required` bytes are free
    ///
    /// Returns Ok(false) when the message can never fit or every remaining
    /// message is being sent. Errors only on precondition violations of the
    /// comparator (missing properties, missing decision engine).
    pub fn make_room(
        &mut self,
        required: u64,
        policy: EvictionPolicy,
        ctx: &EvictionContext<'_>,
    ) -> Result<bool> {
        if required > self.capacity {
            return Ok(false);
        }

        while self.free_space() < required {
            let Some(victim) = self.select_victim(policy, ctx)? else {
                return Ok(false);
            };
            if let Some(evicted) = self.remove(&victim) {
                debug!(id = %victim, size = evicted.size(), ?policy, "evicted message");
                self.evictions += 1;
            }
        }
        Ok(true)
    }

    /// Next message `policy` would evict, ignoring messages being sent
    pub fn select_victim(
        &self,
        policy: EvictionPolicy,
        ctx: &EvictionContext<'_>,
    ) -> Result<Option<MessageId>> {
        let mut victim: Option<&BufferedMessage> = None;
        for msg in self
            .messages
            .values()
            .filter(|m| !self.sending.contains_key(&m.id()))
        {
            victim = match victim {
                Some(current) if !evicts_before(msg, current, policy, ctx)? => Some(current),
                _ => Some(msg),
            };
        }
        Ok(victim.map(|m| m.id()))
    }
}

/// Whether `candidate` is a strictly better victim than `current`
fn evicts_before(
    candidate: &BufferedMessage,
    current: &BufferedMessage,
    policy: EvictionPolicy,
    ctx: &EvictionContext<'_>,
) -> Result<bool> {
    let ordering = match policy {
        EvictionPolicy::MinPriority => candidate
            .routing
            .priority
            .total_cmp(&current.routing.priority)
            .then(candidate.received_at.total_cmp(&current.received_at)),
        EvictionPolicy::OldestReceived => candidate.received_at.total_cmp(&current.received_at),
        EvictionPolicy::LeastReplicated => match candidate
            .routing
            .relay_count
            .cmp(&current.routing.relay_count)
        {
            Ordering::Equal => rescored(candidate, ctx)?.total_cmp(&rescored(current, ctx)?),
            other => other,
        },
        EvictionPolicy::MostReplicated => match current
            .routing
            .relay_count
            .cmp(&candidate.routing.relay_count)
        {
            Ordering::Equal => rescored(candidate, ctx)?.total_cmp(&rescored(current, ctx)?),
            other => other,
        },
        EvictionPolicy::LowestPredictability => {
            let engine = ctx.engine.ok_or_else(|| {
                RoutingError::InvalidConfig(
                    "lowest_predictability eviction needs a decision engine".to_string(),
                )
            })?;
            let mine = engine.delivery_predictability(&candidate.message.destination, ctx.now);
            let theirs = engine.delivery_predictability(&current.message.destination, ctx.now);
            mine.total_cmp(&theirs)
                .then(candidate.received_at.total_cmp(&current.received_at))
        }
    };
    Ok(ordering == Ordering::Less)
}

fn rescored(msg: &BufferedMessage, ctx: &EvictionContext<'_>) -> Result<f64> {
    match ctx.scorer {
        Some(scorer) => Ok(scorer.assess(msg, ctx.now)?.priority),
        None => Ok(msg.routing.priority),
    }
}
