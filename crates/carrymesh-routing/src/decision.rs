//! Pluggable per-contact routing decisions
//!
//! A router running in decision-engine mode asks its engine, per message
//! and contact, whether to forward. Engines only talk to engines of their
//! own kind; a peer running something else is an [`RoutingError::IncompatiblePeer`].

use carrymesh_protocol::{MessageId, NodeId, SimTime};
use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use tracing::trace;

use crate::buffered::BufferedMessage;
use crate::error::{Result, RoutingError};
use crate::prophet::{DeliveryPredictor, ProphetParams};

/// Decision hooks a router consults during contacts
pub trait RoutingDecisionEngine: fmt::Debug + Send {
    /// Fresh engine for another node, sharing this one's settings
    fn replicate(&self) -> Box<dyn RoutingDecisionEngine>;

    fn connection_up(&mut self, _this: NodeId, _peer: NodeId, _now: SimTime) {}

    fn connection_down(&mut self, _this: NodeId, _peer: NodeId, _now: SimTime) {}

    /// Exchange state with the peer's engine when a contact opens
    fn exchange_for_new_connection(
        &mut self,
        this: NodeId,
        peer: NodeId,
        other: &mut dyn RoutingDecisionEngine,
        now: SimTime,
    ) -> Result<()>;

    /// A message was created at this node. Returns false to refuse it.
    fn new_message(&mut self, msg: &mut BufferedMessage) -> bool;

    fn is_final_dest(&self, msg: &BufferedMessage, host: &NodeId) -> bool {
        msg.message.destination == *host
    }

    /// Whether a received message should be kept in the buffer
    fn should_save_received(&mut self, msg: &BufferedMessage, this: &NodeId) -> bool;

    /// Whether `msg` should be offered to `peer`, whose engine is `other`
    fn should_send(
        &mut self,
        msg: &mut BufferedMessage,
        peer: &NodeId,
        other: &dyn RoutingDecisionEngine,
        now: SimTime,
    ) -> Result<bool>;

    /// Whether the sender drops its copy after handing it to `peer`
    fn should_delete_sent(&self, msg: &BufferedMessage, peer: &NodeId) -> bool;

    /// Whether a copy should go once `reporter` says it already has the message
    fn should_delete_old(&self, msg: &BufferedMessage, reporter: &NodeId) -> bool;

    /// Per-tick housekeeping
    fn update(&mut self, now: SimTime);

    /// Current estimate of reaching `destination`; read-only
    fn delivery_predictability(&self, destination: &NodeId, now: SimTime) -> f64;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// PRoPHET with forwarding-threshold ratchet and relay counting
///
/// A message is handed to a peer only if the peer predicts delivery better
/// than this node and better than the best peer the message was already
/// given to. The engine also counts forwarding checks made on messages this
/// node received from others.
#[derive(Debug, Clone)]
pub struct ProphetDecisionEngine {
    predictor: DeliveryPredictor,
    best_threshold: f64,
    stamped: BTreeSet<MessageId>,
    relayed: u64,
}

impl ProphetDecisionEngine {
    pub fn new(params: ProphetParams) -> Self {
        ProphetDecisionEngine {
            predictor: DeliveryPredictor::new(params),
            best_threshold: 0.0,
            stamped: BTreeSet::new(),
            relayed: 0,
        }
    }

    pub fn predictor(&self) -> &DeliveryPredictor {
        &self.predictor
    }

    /// Highest peer predictability this node ever forwarded to
    pub fn best_threshold(&self) -> f64 {
        self.best_threshold
    }

    /// Forwarding checks made on messages this node received
    pub fn relayed(&self) -> u64 {
        self.relayed
    }

    fn peer_engine<'a>(
        other: &'a dyn RoutingDecisionEngine,
        peer: &NodeId,
    ) -> Result<&'a ProphetDecisionEngine> {
        other
            .as_any()
            .downcast_ref::<ProphetDecisionEngine>()
            .ok_or(RoutingError::IncompatiblePeer(*peer))
    }
}

impl RoutingDecisionEngine for ProphetDecisionEngine {
    fn replicate(&self) -> Box<dyn RoutingDecisionEngine> {
        Box::new(ProphetDecisionEngine::new(*self.predictor.params()))
    }

    fn exchange_for_new_connection(
        &mut self,
        this: NodeId,
        peer: NodeId,
        other: &mut dyn RoutingDecisionEngine,
        now: SimTime,
    ) -> Result<()> {
        let de = other
            .as_any_mut()
            .downcast_mut::<ProphetDecisionEngine>()
            .ok_or(RoutingError::IncompatiblePeer(peer))?;

        let (mine, theirs) =
            DeliveryPredictor::plan_contact(&self.predictor, this, &de.predictor, peer, now);
        self.predictor = mine;
        de.predictor = theirs;
        Ok(())
    }

    fn new_message(&mut self, msg: &mut BufferedMessage) -> bool {
        msg.routing.forward_threshold = Some(self.best_threshold);
        true
    }

    fn should_save_received(&mut self, msg: &BufferedMessage, this: &NodeId) -> bool {
        self.stamped.insert(msg.id());
        msg.message.destination != *this
    }

    fn should_send(
        &mut self,
        msg: &mut BufferedMessage,
        peer: &NodeId,
        other: &dyn RoutingDecisionEngine,
        now: SimTime,
    ) -> Result<bool> {
        if msg.message.destination == *peer {
            return Ok(true);
        }

        let de = Self::peer_engine(other, peer)?;
        if self.stamped.contains(&msg.id()) {
            self.relayed += 1;
        }

        let destination = msg.message.destination;
        let theirs = de.predictor.predictability_at(&destination, now);
        let mine = self.predictor.pred_for(&destination, now);
        if theirs > mine && theirs > msg.forward_threshold()? {
            trace!(id = %msg.id(), mine, theirs, "peer is a better carrier");
            self.best_threshold = theirs;
            msg.routing.forward_threshold = Some(theirs);
            return Ok(true);
        }
        Ok(false)
    }

    fn should_delete_sent(&self, _msg: &BufferedMessage, _peer: &NodeId) -> bool {
        false
    }

    fn should_delete_old(&self, msg: &BufferedMessage, reporter: &NodeId) -> bool {
        msg.message.destination == *reporter
    }

    fn update(&mut self, now: SimTime) {
        self.predictor.age(now);
    }

    fn delivery_predictability(&self, destination: &NodeId, now: SimTime) -> f64 {
        self.predictor.predictability_at(destination, now)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carrymesh_protocol::Message;

    fn node(byte: u8) -> NodeId {
        NodeId::from_bytes([byte; 32])
    }

    /// Engine of another kind, for compatibility checks
    #[derive(Debug)]
    struct NeverForward;

    impl RoutingDecisionEngine for NeverForward {
        fn replicate(&self) -> Box<dyn RoutingDecisionEngine> {
            Box::new(NeverForward)
        }
        fn exchange_for_new_connection(
            &mut self,
            _this: NodeId,
            _peer: NodeId,
            _other: &mut dyn RoutingDecisionEngine,
            _now: SimTime,
        ) -> Result<()> {
            Ok(())
        }
        fn new_message(&mut self, _msg: &mut BufferedMessage) -> bool {
            true
        }
        fn should_save_received(&mut self, _msg: &BufferedMessage, _this: &NodeId) -> bool {
            true
        }
        fn should_send(
            &mut self,
            _msg: &mut BufferedMessage,
            _peer: &NodeId,
            _other: &dyn RoutingDecisionEngine,
            _now: SimTime,
        ) -> Result<bool> {
            Ok(false)
        }
        fn should_delete_sent(&self, _msg: &BufferedMessage, _peer: &NodeId) -> bool {
            false
        }
        fn should_delete_old(&self, _msg: &BufferedMessage, _reporter: &NodeId) -> bool {
            false
        }
        fn update(&mut self, _now: SimTime) {}
        fn delivery_predictability(&self, _destination: &NodeId, _now: SimTime) -> f64 {
            0.0
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn message_to(dest: NodeId) -> BufferedMessage {
        let msg = Message::new(node(9), dest, 4, 0.0, 0).unwrap();
        BufferedMessage::new(msg, 0.0)
    }

    #[test]
    fn test_always_send_to_destination() {
        let mut a = ProphetDecisionEngine::new(ProphetParams::default());
        let b = ProphetDecisionEngine::new(ProphetParams::default());
        let mut msg = message_to(node(2));

        // No threshold needed for direct delivery
        assert!(a.should_send(&mut msg, &node(2), &b, 0.0).unwrap());
    }

    #[test]
    fn test_forward_only_to_better_peer_once() {
        let mut a = ProphetDecisionEngine::new(ProphetParams::default());
        let mut b = ProphetDecisionEngine::new(ProphetParams::default());
        let mut c = ProphetDecisionEngine::new(ProphetParams::default());

        // B has met the destination D, A has not
        b.exchange_for_new_connection(node(2), node(4), &mut c, 0.0)
            .unwrap();
        a.exchange_for_new_connection(node(1), node(2), &mut b, 0.0)
            .unwrap();

        let mut msg = message_to(node(4));
        assert!(a.new_message(&mut msg));
        assert_eq!(msg.routing.forward_threshold, Some(0.0));

        assert!(a.should_send(&mut msg, &node(2), &b, 0.0).unwrap());
        assert_eq!(msg.routing.forward_threshold, Some(0.75));
        assert_eq!(a.best_threshold(), 0.75);

        // Same peer again: the marker has caught up with it
        assert!(!a.should_send(&mut msg, &node(2), &b, 0.0).unwrap());

        // B itself is never handed the message back by a worse peer
        let mut back = msg.clone();
        back.routing.forward_threshold = Some(0.0);
        let a_view = a.clone();
        assert!(!b.should_send(&mut back, &node(1), &a_view, 0.0).unwrap());
    }

    #[test]
    fn test_missing_marker_fails_fast() {
        let mut a = ProphetDecisionEngine::new(ProphetParams::default());
        let mut b = ProphetDecisionEngine::new(ProphetParams::default());
        let mut c = ProphetDecisionEngine::new(ProphetParams::default());
        b.exchange_for_new_connection(node(2), node(4), &mut c, 0.0)
            .unwrap();

        let mut msg = message_to(node(4));
        assert!(matches!(
            a.should_send(&mut msg, &node(2), &b, 0.0),
            Err(RoutingError::MissingProperty { .. })
        ));
    }

    #[test]
    fn test_incompatible_peer() {
        let mut a = ProphetDecisionEngine::new(ProphetParams::default());
        let mut other = NeverForward;

        assert_eq!(
            a.exchange_for_new_connection(node(1), node(2), &mut other, 0.0),
            Err(RoutingError::IncompatiblePeer(node(2)))
        );

        let mut msg = message_to(node(4));
        a.new_message(&mut msg);
        assert!(a.should_send(&mut msg, &node(2), &other, 0.0).is_err());
    }

    #[test]
    fn test_relay_counting_and_save() {
        let mut a = ProphetDecisionEngine::new(ProphetParams::default());
        let b = ProphetDecisionEngine::new(ProphetParams::default());

        let mut relayed = message_to(node(4));
        relayed.routing.forward_threshold = Some(0.0);
        assert!(a.should_save_received(&relayed, &node(1)));
        assert!(!a.should_save_received(&message_to(node(1)), &node(1)));

        a.should_send(&mut relayed, &node(2), &b, 0.0).unwrap();
        a.should_send(&mut relayed, &node(3), &b, 0.0).unwrap();
        assert_eq!(a.relayed(), 2);
    }

    #[test]
    fn test_delete_hooks() {
        let a = ProphetDecisionEngine::new(ProphetParams::default());
        let msg = message_to(node(4));

        assert!(!a.should_delete_sent(&msg, &node(4)));
        assert!(a.should_delete_old(&msg, &node(4)));
        assert!(!a.should_delete_old(&msg, &node(2)));
        assert!(a.is_final_dest(&msg, &node(4)));
    }
}
