//! Router policy
//!
//! One [`RouterPolicy`] is shared by every node of a network. It owns the
//! configured strategies (priority scorer, eviction policy, queue mode, copy
//! control, decision-engine prototype) and drives each node once per tick:
//!
//! 1. drop expired messages, age predictabilities, exchange acks and relay
//!    counts with every open contact, purge acknowledged messages
//! 2. stop if a transfer is pending or no contact is open
//! 3. offer messages addressed to a contacted peer, then pull messages
//!    addressed to this node
//! 4. build the forwarding queue for the configured mode and offer it
//!
//! Transfers complete (or abort) when the host says so; see [`crate::contact`].

use carrymesh_protocol::{Message, MessageId, NodeId, SimTime};
use tracing::{debug, info, trace, warn};

use crate::buffer::EvictionContext;
use crate::buffered::BufferedMessage;
use crate::config::{ForwardingMode, RouterConfig};
use crate::contact;
use crate::decision::{ProphetDecisionEngine, RoutingDecisionEngine};
use crate::error::{Result, RoutingError};
use crate::node::Node;
use crate::scorer::{OracleRegistry, PriorityScorer};
use crate::spray::CopyController;
use crate::transfer_queue::{merge_cstq, sort_by_queue_mode, Candidate, QueueMode};

/// Router statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RouterStats {
    pub created: u64,
    /// Copies handed to another node
    pub relayed: u64,
    /// Copies stored after a relay
    pub received: u64,
    /// Messages received here as final destination
    pub delivered: u64,
    pub responses: u64,
    pub evicted: u64,
    pub expired: u64,
    /// Copies purged because an ack arrived
    pub acked: u64,
    /// Admissions refused for lack of space
    pub denied: u64,
    pub transfers_started: u64,
    pub aborted: u64,
}

impl RouterStats {
    pub fn accumulate(&mut self, other: &RouterStats) {
        self.created += other.created;
        self.relayed += other.relayed;
        self.received += other.received;
        self.delivered += other.delivered;
        self.responses += other.responses;
        self.evicted += other.evicted;
        self.expired += other.expired;
        self.acked += other.acked;
        self.denied += other.denied;
        self.transfers_started += other.transfers_started;
        self.aborted += other.aborted;
    }
}

/// Receiver's answer to an offered message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Space reserved; the copy will be stored
    Accepted,
    /// Receiver is the final destination
    Delivered,
    AlreadyHave,
    AlreadyDelivered,
    /// Too large, or nothing left to evict
    NoSpace,
    /// Expired before it could move
    Rejected,
}

impl ReceiveOutcome {
    pub fn is_admitted(self) -> bool {
        matches!(self, ReceiveOutcome::Accepted | ReceiveOutcome::Delivered)
    }
}

/// What became of a finished transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Delivered,
    Stored,
    /// Receiver already had it, refused to keep it, or ran out of room
    Discarded,
    /// The holder lost the message while it was in flight
    Aborted,
}

/// A message on its way across a contact
#[derive(Debug, Clone, PartialEq)]
pub struct Transfer {
    pub message: MessageId,
    pub from: NodeId,
    pub to: NodeId,
    /// Node whose tick started the transfer
    pub initiator: NodeId,
    pub started_at: SimTime,
    pub final_delivery: bool,
    /// The copy as the receiver will store it
    pub(crate) payload: BufferedMessage,
}

impl Transfer {
    /// The node on the other end from the initiator
    pub fn counterpart(&self) -> NodeId {
        if self.initiator == self.from {
            self.to
        } else {
            self.from
        }
    }

    pub fn size(&self) -> u64 {
        self.payload.size()
    }

    /// Copies the receiver starts with, in spray-and-wait mode
    pub fn copies(&self) -> Option<u32> {
        self.payload.routing.copies
    }
}

/// Forwarding policy shared by the nodes of one network
#[derive(Debug)]
pub struct RouterPolicy {
    config: RouterConfig,
    scorer: Option<PriorityScorer>,
    copies: CopyController,
    engine: Option<Box<dyn RoutingDecisionEngine>>,
}

impl RouterPolicy {
    /// Build a policy, loading the fuzzy ruleset from `oracles`
    pub fn new(config: RouterConfig, oracles: &OracleRegistry) -> Result<Self> {
        let engine: Option<Box<dyn RoutingDecisionEngine>> = match config.forwarding {
            ForwardingMode::DecisionEngine => {
                Some(Box::new(ProphetDecisionEngine::new(config.prophet)))
            }
            _ => None,
        };
        Self::build(config, oracles, engine)
    }

    /// Build a decision-engine policy around a custom engine prototype
    pub fn with_engine(
        config: RouterConfig,
        oracles: &OracleRegistry,
        engine: Box<dyn RoutingDecisionEngine>,
    ) -> Result<Self> {
        if config.forwarding != ForwardingMode::DecisionEngine {
            return Err(RoutingError::InvalidConfig(
                "a decision engine needs decision_engine forwarding".to_string(),
            ));
        }
        Self::build(config, oracles, Some(engine))
    }

    fn build(
        config: RouterConfig,
        oracles: &OracleRegistry,
        engine: Option<Box<dyn RoutingDecisionEngine>>,
    ) -> Result<Self> {
        config.validate()?;

        let scorer = match &config.fuzzy_ruleset {
            Some(name) => Some(PriorityScorer::new(
                oracles.load(name)?,
                config.features,
                config.priority_convention,
            )),
            None => None,
        };

        Ok(RouterPolicy {
            copies: CopyController::new(config.spray),
            config,
            scorer,
            engine,
        })
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn scorer(&self) -> Option<&PriorityScorer> {
        self.scorer.as_ref()
    }

    pub fn copies(&self) -> &CopyController {
        &self.copies
    }

    /// Engine instance for a new node
    pub fn new_engine(&self) -> Option<Box<dyn RoutingDecisionEngine>> {
        self.engine.as_ref().map(|e| e.replicate())
    }

    /// Admit a message created (or answered) at `node`
    pub fn create_message(
        &self,
        node: &mut Node,
        mut message: Message,
        now: SimTime,
    ) -> Result<Option<MessageId>> {
        if message.ttl.is_none() {
            if let Some(ttl) = self.config.message_ttl_secs {
                message = message.with_ttl(ttl);
            }
        }

        let mut msg = BufferedMessage::new(message, now);
        msg.routing.ftc = Some(msg.message.hop_count);
        if self.config.forwarding == ForwardingMode::SprayAndWait {
            self.copies.initialize(&mut msg);
        }

        let node_id = node.id();
        let state = &mut node.state;
        if let Some(engine) = state.engine.as_mut() {
            if !engine.new_message(&mut msg) {
                debug!(node = %node_id, id = %msg.id(), "engine refused new message");
                return Ok(None);
            }
        }
        if let Some(scorer) = &self.scorer {
            scorer.refresh(&mut msg, now)?;
        }

        let id = msg.id();
        let size = msg.size();
        let ctx = EvictionContext {
            scorer: self.scorer.as_ref(),
            engine: state.engine.as_deref(),
            now,
        };
        let admitted =
            state.buffer.make_room(size, self.config.eviction, &ctx)? && state.buffer.insert(msg);
        if !admitted {
            state.stats.denied += 1;
            warn!(node = %node_id, %id, size, "no room for new message");
            return Ok(None);
        }

        state.stats.created += 1;
        debug!(node = %node_id, %id, size, "created message");
        Ok(Some(id))
    }

    /// One simulated step of `node`'s router
    pub fn tick(
        &self,
        node: &mut Node,
        peers: &mut [&mut Node],
        now: SimTime,
    ) -> Result<Option<Transfer>> {
        let expired = node
            .state
            .buffer
            .drain_where(|m| m.message.is_expired(now));
        if !expired.is_empty() {
            node.state.stats.expired += expired.len() as u64;
            debug!(node = %node.id(), count = expired.len(), "dropped expired messages");
        }

        if let Some(engine) = node.state.engine.as_mut() {
            engine.update(now);
        }
        let encounters = node.state.encounters;
        node.state.encounter_rate.update(now, encounters);

        let mut linked: Vec<&mut Node> = peers
            .iter_mut()
            .filter(|p| node.is_linked(&p.id()))
            .map(|p| &mut **p)
            .collect();

        for peer in linked.iter_mut() {
            contact::exchange(node, peer);
        }

        if node.is_transferring() || linked.is_empty() {
            return Ok(None);
        }
        if node.buffer().is_empty() && linked.iter().all(|p| p.buffer().is_empty()) {
            return Ok(None);
        }

        if let Some(scorer) = &self.scorer {
            for msg in node.state.buffer.iter_mut() {
                scorer.refresh(msg, now)?;
            }
        }

        if let Some(transfer) = self.exchange_deliverable(node, &mut linked, now)? {
            return Ok(Some(transfer));
        }
        self.forward(node, &mut linked, now)
    }

    /// Direct delivery first: own messages for a contacted peer, then
    /// messages the peers hold for this node
    fn exchange_deliverable(
        &self,
        node: &mut Node,
        linked: &mut [&mut Node],
        now: SimTime,
    ) -> Result<Option<Transfer>> {
        let node_id = node.id();

        let mut own = Vec::new();
        for peer in linked.iter() {
            let peer_id = peer.id();
            own.extend(
                node.buffer()
                    .iter()
                    .filter(|m| m.message.destination == peer_id)
                    .map(|m| Candidate::new(m, node_id, peer_id)),
            );
        }
        sort_by_queue_mode(&mut own, QueueMode::PriorityDesc, now);

        for candidate in &own {
            let Some(peer) = linked.iter_mut().find(|p| p.id() == candidate.target) else {
                continue;
            };
            if let Some(transfer) = self.start(node, peer, candidate, now)? {
                return Ok(Some(transfer));
            }
        }

        for peer in linked.iter_mut() {
            let peer_id = peer.id();
            let mut theirs: Vec<Candidate> = peer
                .buffer()
                .iter()
                .filter(|m| m.message.destination == node_id)
                .map(|m| Candidate::new(m, peer_id, node_id))
                .collect();
            sort_by_queue_mode(&mut theirs, QueueMode::PriorityDesc, now);

            for candidate in &theirs {
                if let Some(transfer) = self.start(node, peer, candidate, now)? {
                    return Ok(Some(transfer));
                }
            }
        }

        Ok(None)
    }

    fn forward(
        &self,
        node: &mut Node,
        linked: &mut [&mut Node],
        now: SimTime,
    ) -> Result<Option<Transfer>> {
        for peer in linked.iter_mut() {
            let queue = self.forwarding_queue(node, peer, now)?;
            trace!(node = %node.id(), peer = %peer.id(), len = queue.len(), "forwarding queue");

            for candidate in &queue {
                if let Some(transfer) = self.start(node, peer, candidate, now)? {
                    return Ok(Some(transfer));
                }
            }
        }
        Ok(None)
    }

    /// Ranked candidates for one contact
    fn forwarding_queue(
        &self,
        node: &mut Node,
        peer: &Node,
        now: SimTime,
    ) -> Result<Vec<Candidate>> {
        let node_id = node.id();
        let peer_id = peer.id();
        let mode = self.config.queue_mode;

        match self.config.forwarding {
            ForwardingMode::Epidemic => {
                let local: Vec<Candidate> = node
                    .buffer()
                    .iter()
                    .filter(|m| m.message.destination != peer_id && !peer.holds_or_knows(&m.id()))
                    .map(|m| Candidate::new(m, node_id, peer_id))
                    .collect();
                let remote = peer
                    .buffer()
                    .iter()
                    .filter(|m| m.message.destination != node_id && !node.holds_or_knows(&m.id()))
                    .map(|m| Candidate::new(m, peer_id, node_id));

                let peer_free = peer.buffer().free_space();
                let node_free = node.buffer().free_space();
                if node.buffer().occupancy() > peer_free {
                    // Peer cannot take everything: rank both buffers together
                    let local = local.into_iter().filter(|c| c.size < peer_free).collect();
                    let remote = remote.filter(|c| c.size < node_free).collect();
                    Ok(merge_cstq(local, remote, mode, now))
                } else {
                    let mut queue = local;
                    queue.extend(remote.filter(|c| c.size <= node_free));
                    sort_by_queue_mode(&mut queue, mode, now);
                    Ok(queue)
                }
            }
            ForwardingMode::SprayAndWait => {
                let mut queue = Vec::new();
                for msg in node.buffer().iter() {
                    if msg.message.destination == peer_id || peer.holds_or_knows(&msg.id()) {
                        continue;
                    }
                    if self.copies.is_spray_eligible(msg)? {
                        queue.push(Candidate::new(msg, node_id, peer_id));
                    }
                }
                sort_by_queue_mode(&mut queue, mode, now);
                Ok(queue)
            }
            ForwardingMode::DecisionEngine => {
                let other = peer
                    .engine()
                    .ok_or(RoutingError::IncompatiblePeer(peer_id))?;
                let state = &mut node.state;
                let engine = state.engine.as_mut().ok_or_else(|| {
                    RoutingError::InvalidConfig("node has no decision engine".to_string())
                })?;

                let mut queue = Vec::new();
                for msg in state.buffer.iter_mut() {
                    if msg.message.destination == peer_id || peer.holds_or_knows(&msg.id()) {
                        continue;
                    }
                    if engine.should_send(msg, &peer_id, other, now)? {
                        queue.push(Candidate::new(msg, node_id, peer_id));
                    }
                }
                sort_by_queue_mode(&mut queue, mode, now);
                Ok(queue)
            }
        }
    }

    /// Try to start moving `candidate` between `initiator` and `peer`
    fn start(
        &self,
        initiator: &mut Node,
        peer: &mut Node,
        candidate: &Candidate,
        now: SimTime,
    ) -> Result<Option<Transfer>> {
        let initiator_id = initiator.id();
        let started = if candidate.holder == initiator_id {
            self.offer(initiator, peer, candidate.id, initiator_id, now)?
        } else {
            self.offer(peer, initiator, candidate.id, initiator_id, now)?
        };

        if let Some(transfer) = &started {
            initiator.state.transfer = Some(transfer.clone());
        }
        Ok(started)
    }

    /// Offer one message from `holder` to `receiver`
    fn offer(
        &self,
        holder: &mut Node,
        receiver: &mut Node,
        id: MessageId,
        initiator: NodeId,
        now: SimTime,
    ) -> Result<Option<Transfer>> {
        let msg = holder
            .buffer()
            .get(&id)
            .cloned()
            .ok_or(RoutingError::UnknownMessage(id))?;
        let receiver_id = receiver.id();
        let final_delivery = match receiver.engine() {
            Some(engine) => engine.is_final_dest(&msg, &receiver_id),
            None => msg.message.destination == receiver_id,
        };

        let mut payload = msg.relayed(now);
        if self.config.forwarding == ForwardingMode::SprayAndWait && !final_delivery {
            let copies = self.copies.copies_for_receiver(
                &msg,
                holder.encounter_rate().rate(),
                receiver.encounter_rate().rate(),
            )?;
            payload.routing.copies = Some(copies);
        }

        let outcome = self.admit(receiver, &msg, final_delivery, now)?;
        trace!(from = %holder.id(), to = %receiver_id, %id, ?outcome, "offered message");

        match outcome {
            ReceiveOutcome::Accepted | ReceiveOutcome::Delivered => {
                holder.state.buffer.mark_sending(id)?;
                holder.state.stats.transfers_started += 1;
                Ok(Some(Transfer {
                    message: id,
                    from: holder.id(),
                    to: receiver_id,
                    initiator,
                    started_at: now,
                    final_delivery,
                    payload,
                }))
            }
            ReceiveOutcome::AlreadyHave | ReceiveOutcome::AlreadyDelivered => {
                let drop_old = holder
                    .engine()
                    .is_some_and(|e| e.should_delete_old(&msg, &receiver_id));
                if drop_old {
                    holder.state.buffer.remove(&id);
                    debug!(node = %holder.id(), %id, "dropped copy already held by destination");
                }
                Ok(None)
            }
            ReceiveOutcome::NoSpace | ReceiveOutcome::Rejected => Ok(None),
        }
    }

    /// Decide whether `receiver` takes `msg`, reserving space if it does
    ///
    /// Final deliveries are admitted without eviction and reserve no space;
    /// they only mark the id as incoming so it is not accepted twice.
    pub fn admit(
        &self,
        receiver: &mut Node,
        msg: &BufferedMessage,
        final_delivery: bool,
        now: SimTime,
    ) -> Result<ReceiveOutcome> {
        let id = msg.id();
        if msg.message.is_expired(now) {
            return Ok(ReceiveOutcome::Rejected);
        }
        if receiver.acks().is_delivered(&id) {
            return Ok(ReceiveOutcome::AlreadyDelivered);
        }
        if receiver.buffer().contains(&id) || receiver.buffer().is_reserved(&id) {
            return Ok(ReceiveOutcome::AlreadyHave);
        }
        if final_delivery {
            receiver.state.buffer.reserve(id, 0);
            return Ok(ReceiveOutcome::Delivered);
        }

        let receiver_id = receiver.id();
        let state = &mut receiver.state;
        let ctx = EvictionContext {
            scorer: self.scorer.as_ref(),
            engine: state.engine.as_deref(),
            now,
        };
        if !state.buffer.make_room(msg.size(), self.config.eviction, &ctx)?
            || !state.buffer.reserve(id, msg.size())
        {
            state.stats.denied += 1;
            warn!(node = %receiver_id, %id, size = msg.size(), "no room for incoming message");
            return Ok(ReceiveOutcome::NoSpace);
        }
        Ok(ReceiveOutcome::Accepted)
    }

    /// Finish the transfer `initiator` started with `counterpart`
    ///
    /// Returns Ok(None) when `initiator` has no transfer with `counterpart`.
    pub fn complete(
        &self,
        initiator: &mut Node,
        counterpart: &mut Node,
        now: SimTime,
    ) -> Result<Option<TransferOutcome>> {
        let pending = initiator
            .transfer()
            .is_some_and(|t| t.counterpart() == counterpart.id());
        if !pending {
            return Ok(None);
        }
        let Some(transfer) = initiator.state.transfer.take() else {
            return Ok(None);
        };

        let outcome = if transfer.from == initiator.id() {
            self.finish(initiator, counterpart, transfer, now)?
        } else {
            self.finish(counterpart, initiator, transfer, now)?
        };
        Ok(Some(outcome))
    }

    fn finish(
        &self,
        holder: &mut Node,
        receiver: &mut Node,
        transfer: Transfer,
        now: SimTime,
    ) -> Result<TransferOutcome> {
        let id = transfer.message;
        holder.state.buffer.clear_sending(&id);
        receiver.state.buffer.release(&id);

        if !holder.has_message(&id) {
            holder.state.stats.aborted += 1;
            debug!(node = %holder.id(), %id, "message vanished during transfer");
            return Ok(TransferOutcome::Aborted);
        }

        let receiver_id = receiver.id();
        let mut payload = transfer.payload;
        let outcome = if transfer.final_delivery {
            if let Some(engine) = receiver.state.engine.as_mut() {
                engine.should_save_received(&payload, &receiver_id);
            }
            if receiver.state.acks.record_delivery(id, now) {
                receiver.state.stats.delivered += 1;
                info!(
                    node = %receiver_id,
                    %id,
                    hops = payload.message.hop_count,
                    latency = now - payload.message.created_at,
                    "message delivered"
                );
                if self.config.reply_on_delivery && payload.message.response_size > 0 {
                    let response = payload.message.response(now)?;
                    if self.create_message(receiver, response, now)?.is_some() {
                        receiver.state.stats.responses += 1;
                    }
                }
                TransferOutcome::Delivered
            } else {
                TransferOutcome::Discarded
            }
        } else if receiver.holds_or_knows(&id) {
            TransferOutcome::Discarded
        } else {
            payload.routing.relay_count += 1;
            let save = match receiver.state.engine.as_mut() {
                Some(engine) => engine.should_save_received(&payload, &receiver_id),
                None => true,
            };
            if save && self.store(receiver, payload, now)? {
                receiver.state.stats.received += 1;
                TransferOutcome::Stored
            } else {
                TransferOutcome::Discarded
            }
        };

        if matches!(outcome, TransferOutcome::Delivered | TransferOutcome::Stored) {
            holder.state.stats.relayed += 1;
            if self.config.forwarding == ForwardingMode::SprayAndWait && !transfer.final_delivery {
                if let Some(msg) = holder.state.buffer.get_mut(&id) {
                    self.copies.on_transfer_done(msg)?;
                }
            }

            let state = &mut holder.state;
            let delete_sent = match (state.engine.as_deref(), state.buffer.get(&id)) {
                (Some(engine), Some(msg)) => engine.should_delete_sent(msg, &receiver_id),
                _ => false,
            };
            if delete_sent {
                state.buffer.remove(&id);
            }
        }

        debug!(from = %holder.id(), to = %receiver_id, %id, ?outcome, "transfer finished");
        Ok(outcome)
    }

    /// Store a relayed copy at `receiver`, re-scored for its new holder
    fn store(&self, receiver: &mut Node, mut msg: BufferedMessage, now: SimTime) -> Result<bool> {
        if let Some(scorer) = &self.scorer {
            scorer.refresh(&mut msg, now)?;
        }

        let state = &mut receiver.state;
        let ctx = EvictionContext {
            scorer: self.scorer.as_ref(),
            engine: state.engine.as_deref(),
            now,
        };
        let size = msg.size();
        Ok(state.buffer.make_room(size, self.config.eviction, &ctx)? && state.buffer.insert(msg))
    }
}
