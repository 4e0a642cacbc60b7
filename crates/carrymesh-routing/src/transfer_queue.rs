//! Transfer queue ordering
//!
//! Candidates for a contact are ranked by the configured queue mode. When a
//! node has to consider its peer's buffer together with its own, both sides
//! are ranked independently and then merged into one combined sorted
//! transfer queue (CSTQ) ordered by relay count.

use carrymesh_protocol::{MessageId, NodeId, SimTime};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::buffered::BufferedMessage;

/// Order in which candidate messages are offered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueMode {
    /// Highest priority first
    PriorityDesc,
    /// Earliest receive time first
    #[default]
    Fifo,
    /// Shuffled, seeded by the current simulated time
    Random,
}

/// One message that could move across a contact
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub id: MessageId,
    /// Node currently holding the message
    pub holder: NodeId,
    /// Node that would receive it
    pub target: NodeId,
    pub size: u64,
    pub priority: f64,
    pub received_at: SimTime,
    pub relay_count: u32,
}

impl Candidate {
    pub fn new(msg: &BufferedMessage, holder: NodeId, target: NodeId) -> Self {
        Candidate {
            id: msg.id(),
            holder,
            target,
            size: msg.size(),
            priority: msg.routing.priority,
            received_at: msg.received_at,
            relay_count: msg.routing.relay_count,
        }
    }
}

/// Sort in place by `mode`; equal keys keep their relative order
pub fn sort_by_queue_mode(candidates: &mut [Candidate], mode: QueueMode, now: SimTime) {
    match mode {
        QueueMode::PriorityDesc => {
            candidates.sort_by(|a, b| b.priority.total_cmp(&a.priority));
        }
        QueueMode::Fifo => {
            candidates.sort_by(|a, b| a.received_at.total_cmp(&b.received_at));
        }
        QueueMode::Random => {
            let mut rng = StdRng::seed_from_u64(now.to_bits());
            candidates.shuffle(&mut rng);
        }
    }
}

/// Combined sorted transfer queue
///
/// Each side is ranked by `mode`, the two lists are concatenated (local
/// first) and stably re-sorted by relay count, least replicated first. A
/// message present on both sides is offered once, from its first position.
pub fn merge_cstq(
    mut local: Vec<Candidate>,
    mut peer: Vec<Candidate>,
    mode: QueueMode,
    now: SimTime,
) -> Vec<Candidate> {
    sort_by_queue_mode(&mut local, mode, now);
    sort_by_queue_mode(&mut peer, mode, now);

    let mut merged = local;
    merged.append(&mut peer);
    merged.sort_by_key(|c| c.relay_count);

    let mut seen = BTreeSet::new();
    merged.retain(|c| seen.insert(c.id));
    merged
}
