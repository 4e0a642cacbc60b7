//! Integration tests for the router policy
//!
//! Each test plays the host scheduler by hand: it opens contacts, ticks
//! nodes, and completes the transfers the ticks start.

use carrymesh_protocol::{MessageId, NodeId};
use carrymesh_routing::{
    close_contact, complete_pending, open_contact, CopyAllocation, EvictionPolicy, FeaturePair,
    ForwardingMode, LinearInput, LinearOracle, Node, OracleRegistry, PriorityConvention,
    ProphetDecisionEngine, QueueMode, RouterConfig, RouterPolicy, RoutingDecisionEngine,
    SprayConfig, Transfer, TransferOutcome,
};
use std::sync::Arc;

fn create_test_node_id(byte: u8) -> NodeId {
    NodeId::from_bytes([byte; 32])
}

fn network(config: RouterConfig, count: u8) -> Vec<Node> {
    network_with(config, &OracleRegistry::new(), count)
}

fn network_with(config: RouterConfig, oracles: &OracleRegistry, count: u8) -> Vec<Node> {
    let policy = Arc::new(RouterPolicy::new(config, oracles).unwrap());
    (1..=count)
        .map(|i| Node::new(create_test_node_id(i), Arc::clone(&policy)))
        .collect()
}

/// Two distinct nodes of the network, mutably
fn pair(nodes: &mut [Node], i: usize, j: usize) -> (&mut Node, &mut Node) {
    assert!(i != j);
    if i < j {
        let (left, right) = nodes.split_at_mut(j);
        (&mut left[i], &mut right[0])
    } else {
        let (left, right) = nodes.split_at_mut(i);
        (&mut right[0], &mut left[j])
    }
}

fn tick(nodes: &mut [Node], index: usize, now: f64) -> Option<Transfer> {
    let (before, rest) = nodes.split_at_mut(index);
    let (node, after) = rest.split_first_mut().unwrap();
    let mut peers: Vec<&mut Node> = before.iter_mut().chain(after.iter_mut()).collect();
    node.tick(&mut peers, now).unwrap()
}

fn open(nodes: &mut [Node], i: usize, j: usize, now: f64) {
    let (a, b) = pair(nodes, i, j);
    open_contact(a, b, now).unwrap();
}

fn close(nodes: &mut [Node], i: usize, j: usize, now: f64) {
    let (a, b) = pair(nodes, i, j);
    close_contact(a, b, now);
}

fn complete(nodes: &mut [Node], i: usize, j: usize, now: f64) -> Vec<TransferOutcome> {
    let (a, b) = pair(nodes, i, j);
    complete_pending(a, b, now).unwrap()
}

fn copies(node: &Node, id: &MessageId) -> Option<u32> {
    node.buffer().get(id).and_then(|m| m.routing.copies)
}

#[test]
fn test_direct_delivery_and_ack_purge() {
    let config = RouterConfig {
        buffer_capacity: 10,
        ..RouterConfig::default()
    };
    let mut nodes = network(config, 2);
    let b = nodes[1].id();
    let id = nodes[0].create_message(b, 4, 0, 0.0).unwrap().unwrap();

    open(&mut nodes, 0, 1, 0.0);
    let transfer = tick(&mut nodes, 0, 0.0).unwrap();
    assert!(transfer.final_delivery);
    assert_eq!(transfer.to, b);

    // The receiver does not start a second copy of the same delivery
    assert!(tick(&mut nodes, 1, 0.0).is_none());

    assert_eq!(complete(&mut nodes, 0, 1, 0.0), vec![TransferOutcome::Delivered]);
    assert!(nodes[1].acks().is_delivered(&id));
    assert!(!nodes[1].has_message(&id));
    assert!(nodes[0].has_message(&id));

    // Within one tick the sender learns the ack and drops its copy
    tick(&mut nodes, 0, 1.0);
    assert!(nodes[0].acks().is_delivered(&id));
    assert!(!nodes[0].has_message(&id));
    assert_eq!(nodes[0].stats().acked, 1);
    assert_eq!(nodes[1].stats().delivered, 1);
}

#[test]
fn test_spray_and_wait_copy_sequence() {
    let config = RouterConfig {
        forwarding: ForwardingMode::SprayAndWait,
        buffer_capacity: 100,
        ..RouterConfig::default()
    };
    let mut nodes = network(config, 5);
    let dest = nodes[4].id();
    let id = nodes[0].create_message(dest, 4, 0, 0.0).unwrap().unwrap();
    assert_eq!(copies(&nodes[0], &id), Some(6));

    // First relay: 6 -> 3, relay receives 3
    open(&mut nodes, 0, 1, 0.0);
    let transfer = tick(&mut nodes, 0, 0.0).unwrap();
    assert_eq!(transfer.copies(), Some(3));
    assert_eq!(complete(&mut nodes, 0, 1, 0.0), vec![TransferOutcome::Stored]);
    assert_eq!(copies(&nodes[0], &id), Some(3));
    assert_eq!(copies(&nodes[1], &id), Some(3));
    close(&mut nodes, 0, 1, 1.0);

    // Second relay: 3 -> 1, relay receives 2
    open(&mut nodes, 0, 2, 1.0);
    tick(&mut nodes, 0, 1.0).unwrap();
    complete(&mut nodes, 0, 2, 1.0);
    assert_eq!(copies(&nodes[0], &id), Some(1));
    assert_eq!(copies(&nodes[2], &id), Some(2));
    close(&mut nodes, 0, 2, 2.0);

    // One copy left: intermediates are never offered the message
    open(&mut nodes, 0, 3, 2.0);
    assert!(tick(&mut nodes, 0, 2.0).is_none());
    assert!(!nodes[0].is_transferring());
    assert!(!nodes[3].has_message(&id));
    close(&mut nodes, 0, 3, 3.0);

    // ...but the destination is
    open(&mut nodes, 0, 4, 3.0);
    let transfer = tick(&mut nodes, 0, 3.0).unwrap();
    assert!(transfer.final_delivery);
    assert_eq!(complete(&mut nodes, 0, 4, 3.0), vec![TransferOutcome::Delivered]);
    assert_eq!(copies(&nodes[0], &id), Some(1));
    assert!(nodes[4].acks().is_delivered(&id));
}

#[test]
fn test_acks_spread_through_later_contacts() {
    let config = RouterConfig {
        buffer_capacity: 10,
        ..RouterConfig::default()
    };
    let mut nodes = network(config, 3);
    let b = nodes[1].id();
    let id = nodes[0].create_message(b, 4, 0, 0.0).unwrap().unwrap();

    // A hands a copy to C
    open(&mut nodes, 0, 2, 0.0);
    tick(&mut nodes, 0, 0.0).unwrap();
    assert_eq!(complete(&mut nodes, 0, 2, 0.0), vec![TransferOutcome::Stored]);
    assert_eq!(nodes[2].buffer().get(&id).unwrap().routing.relay_count, 2);
    close(&mut nodes, 0, 2, 1.0);

    // C delivers to B
    open(&mut nodes, 2, 1, 1.0);
    assert!(tick(&mut nodes, 2, 1.0).unwrap().final_delivery);
    complete(&mut nodes, 2, 1, 1.0);
    tick(&mut nodes, 2, 2.0);
    assert!(!nodes[2].has_message(&id));
    close(&mut nodes, 2, 1, 3.0);

    // A learns about it when it meets B
    assert!(nodes[0].has_message(&id));
    open(&mut nodes, 0, 1, 3.0);
    assert!(tick(&mut nodes, 0, 3.0).is_none());
    assert!(!nodes[0].has_message(&id));

    let before = nodes[1].acks().clone();
    tick(&mut nodes, 1, 4.0);
    assert_eq!(nodes[1].acks(), &before);
    assert_eq!(nodes[1].stats().delivered, 1);
}

#[test]
fn test_expired_messages_are_dropped() {
    let config = RouterConfig {
        message_ttl_secs: Some(10.0),
        ..RouterConfig::default()
    };
    let mut nodes = network(config, 2);
    let b = nodes[1].id();
    let id = nodes[0].create_message(b, 4, 0, 0.0).unwrap().unwrap();

    tick(&mut nodes, 0, 9.0);
    assert!(nodes[0].has_message(&id));
    tick(&mut nodes, 0, 10.0);
    assert!(!nodes[0].has_message(&id));
    assert_eq!(nodes[0].stats().expired, 1);
}

#[test]
fn test_link_loss_aborts_transfer() {
    let config = RouterConfig {
        buffer_capacity: 10,
        ..RouterConfig::default()
    };
    let mut nodes = network(config, 2);
    let id = nodes[0]
        .create_message(create_test_node_id(9), 4, 0, 0.0)
        .unwrap()
        .unwrap();

    open(&mut nodes, 0, 1, 0.0);
    tick(&mut nodes, 0, 0.0).unwrap();
    assert_eq!(nodes[1].buffer().free_space(), 6);
    assert!(nodes[0].buffer().is_sending(&id));

    close(&mut nodes, 0, 1, 0.5);
    assert!(!nodes[0].is_transferring());
    assert!(!nodes[0].buffer().is_sending(&id));
    assert_eq!(nodes[1].buffer().free_space(), 10);
    assert_eq!(nodes[0].stats().aborted, 1);
    assert!(complete(&mut nodes, 0, 1, 1.0).is_empty());
}

#[test]
fn test_oversize_message_is_refused() {
    let config = RouterConfig {
        buffer_capacity: 10,
        ..RouterConfig::default()
    };
    let mut nodes = network(config, 1);
    let created = nodes[0]
        .create_message(create_test_node_id(9), 11, 0, 0.0)
        .unwrap();

    assert!(created.is_none());
    assert_eq!(nodes[0].stats().denied, 1);
    assert_eq!(nodes[0].stats().evicted, 0);
}

#[test]
fn test_receiver_evicts_but_never_the_message_it_sends() {
    let config = RouterConfig {
        forwarding: ForwardingMode::SprayAndWait,
        buffer_capacity: 10,
        ..RouterConfig::default()
    };
    let mut nodes = network(config, 2);
    let far = create_test_node_id(9);
    let m1 = nodes[1].create_message(far, 4, 0, 0.0).unwrap().unwrap();
    let m2 = nodes[1].create_message(far, 4, 0, 1.0).unwrap().unwrap();
    let a1 = nodes[0].create_message(far, 4, 0, 2.0).unwrap().unwrap();

    open(&mut nodes, 0, 1, 2.0);
    let sent = tick(&mut nodes, 1, 2.0).unwrap();
    assert_eq!(sent.message, m1);

    // B is full; the oldest message is being sent, so the next one goes
    let received = tick(&mut nodes, 0, 2.0).unwrap();
    assert_eq!(received.message, a1);
    assert!(nodes[1].has_message(&m1));
    assert!(!nodes[1].has_message(&m2));
    assert_eq!(nodes[1].stats().evicted, 1);

    let outcomes = complete(&mut nodes, 0, 1, 2.0);
    assert_eq!(outcomes, vec![TransferOutcome::Stored, TransferOutcome::Stored]);
    assert!(nodes[0].has_message(&m1));
    assert!(nodes[1].has_message(&a1));
    assert_eq!(copies(&nodes[1], &m1), Some(3));
}

#[test]
fn test_cstq_pulls_from_crowded_peer() {
    let config = RouterConfig {
        buffer_capacity: 10,
        ..RouterConfig::default()
    };
    let mut nodes = network(config, 2);
    let far = create_test_node_id(9);
    let m1 = nodes[1].create_message(far, 4, 0, 0.0).unwrap().unwrap();
    nodes[1].create_message(far, 4, 0, 1.0).unwrap().unwrap();
    nodes[0].create_message(far, 4, 0, 2.0).unwrap().unwrap();

    // A's occupancy (4) exceeds B's free space (2): both buffers are ranked
    // together and only what fits is offered
    open(&mut nodes, 0, 1, 2.0);
    let transfer = tick(&mut nodes, 0, 2.0).unwrap();
    assert_eq!(transfer.from, nodes[1].id());
    assert_eq!(transfer.message, m1);
    assert_eq!(transfer.initiator, nodes[0].id());
}

#[test]
fn test_decision_engine_forwards_to_better_carrier() {
    let config = RouterConfig {
        forwarding: ForwardingMode::DecisionEngine,
        ..RouterConfig::default()
    };
    let mut nodes = network(config, 3);
    let dest = nodes[2].id();

    // B has met the destination
    open(&mut nodes, 1, 2, 0.0);
    close(&mut nodes, 1, 2, 0.0);

    let id = nodes[0].create_message(dest, 4, 0, 0.0).unwrap().unwrap();
    open(&mut nodes, 0, 1, 0.0);
    let transfer = tick(&mut nodes, 0, 0.0).unwrap();
    assert_eq!(transfer.to, nodes[1].id());
    assert_eq!(complete(&mut nodes, 0, 1, 0.0), vec![TransferOutcome::Stored]);

    // The sender keeps its copy and will not offer it to B again
    assert!(nodes[0].has_message(&id));
    assert!(nodes[1].has_message(&id));
    assert!(tick(&mut nodes, 0, 0.0).is_none());

    let engine = nodes[0]
        .engine()
        .and_then(|e| e.as_any().downcast_ref::<ProphetDecisionEngine>())
        .unwrap();
    assert_eq!(engine.best_threshold(), 0.75);
}

#[test]
fn test_priority_queue_mode_offers_best_first() {
    let mut oracles = OracleRegistry::new();
    oracles.register(Arc::new(LinearOracle {
        name: "by-size".to_string(),
        inputs: vec![LinearInput {
            name: "ms".to_string(),
            weight: 1.0,
            scale: 10.0,
        }],
        bias: 0.0,
        output: "priority".to_string(),
    }));
    let config = RouterConfig {
        fuzzy_ruleset: Some("by-size".to_string()),
        features: FeaturePair::FtcSize,
        priority_convention: PriorityConvention::Coa,
        queue_mode: QueueMode::PriorityDesc,
        ..RouterConfig::default()
    };
    let mut nodes = network_with(config, &oracles, 2);
    let far = create_test_node_id(9);
    nodes[0].create_message(far, 2, 0, 0.0).unwrap().unwrap();
    let large = nodes[0].create_message(far, 6, 0, 0.0).unwrap().unwrap();

    for msg in nodes[0].buffer().iter() {
        assert!((0.0..=1.0).contains(&msg.routing.priority));
    }

    open(&mut nodes, 0, 1, 0.0);
    let transfer = tick(&mut nodes, 0, 0.0).unwrap();
    assert_eq!(transfer.message, large);
}

#[test]
fn test_response_on_delivery() {
    let config = RouterConfig {
        reply_on_delivery: true,
        ..RouterConfig::default()
    };
    let mut nodes = network(config, 2);
    let (a, b) = (nodes[0].id(), nodes[1].id());
    let id = nodes[0].create_message(b, 4, 1, 0.0).unwrap().unwrap();

    open(&mut nodes, 0, 1, 0.0);
    tick(&mut nodes, 0, 0.0).unwrap();
    complete(&mut nodes, 0, 1, 0.0);

    let reply = MessageId::response_for(&id);
    assert_eq!(nodes[1].stats().responses, 1);
    let stored = nodes[1].buffer().get(&reply).unwrap();
    assert_eq!(stored.message.destination, a);
    assert_eq!(stored.message.in_reply_to, Some(id));

    // B answers on its next tick
    let transfer = tick(&mut nodes, 1, 1.0).unwrap();
    assert_eq!(transfer.message, reply);
    assert!(transfer.final_delivery);
    complete(&mut nodes, 0, 1, 1.0);
    assert!(nodes[0].acks().is_delivered(&reply));
}

#[test]
fn test_encounter_rate_splits_copies_towards_busier_node() {
    let config = RouterConfig {
        forwarding: ForwardingMode::SprayAndWait,
        spray: SprayConfig {
            allocation: CopyAllocation::EncounterRate,
            encounter_alpha: 0.0,
            ..SprayConfig::default()
        },
        ..RouterConfig::default()
    };
    let mut nodes = network(config, 5);

    // B meets three nodes before it meets A
    for other in 2..5 {
        open(&mut nodes, 1, other, 0.0);
        close(&mut nodes, 1, other, 0.0);
    }
    open(&mut nodes, 0, 1, 10.0);
    assert!(tick(&mut nodes, 1, 10.0).is_none());

    let id = nodes[0]
        .create_message(create_test_node_id(9), 4, 0, 10.0)
        .unwrap()
        .unwrap();
    let transfer = tick(&mut nodes, 0, 10.0).unwrap();

    // QoN: A saw 1 encounter in 10s, B saw 4
    assert!((nodes[0].encounter_rate().rate() - 0.1).abs() < 1e-12);
    assert!((nodes[1].encounter_rate().rate() - 0.4).abs() < 1e-12);
    assert_eq!(nodes[0].encounter_rate().last_update(), 10.0);

    // ceil(0.4 / (0.1 + 0.4) * 6) = 5, where the fixed split would give 3
    assert_eq!(transfer.copies(), Some(5));
    assert_eq!(transfer.size(), 4);

    assert_eq!(complete(&mut nodes, 0, 1, 10.0), vec![TransferOutcome::Stored]);
    assert_eq!(copies(&nodes[1], &id), Some(5));
    assert_eq!(copies(&nodes[0], &id), Some(3));
}

#[test]
fn test_lowest_predictability_eviction_keeps_reachable_messages() {
    let config = RouterConfig {
        forwarding: ForwardingMode::DecisionEngine,
        eviction: EvictionPolicy::LowestPredictability,
        buffer_capacity: 10,
        ..RouterConfig::default()
    };
    let mut nodes = network(config, 3);
    let (b, c) = (nodes[1].id(), nodes[2].id());

    // The message for B is the oldest, so oldest-first would drop it
    let to_b = nodes[0].create_message(b, 4, 0, 0.0).unwrap().unwrap();
    let to_c = nodes[0].create_message(c, 4, 0, 0.5).unwrap().unwrap();

    // A has met B but never C
    open(&mut nodes, 0, 1, 1.0);
    close(&mut nodes, 0, 1, 1.0);
    let engine = nodes[0].engine().unwrap();
    assert!(engine.delivery_predictability(&b, 2.0) > 0.0);
    assert_eq!(engine.delivery_predictability(&c, 2.0), 0.0);

    let fresh = nodes[0]
        .create_message(create_test_node_id(9), 4, 0, 2.0)
        .unwrap()
        .unwrap();

    assert!(nodes[0].has_message(&to_b));
    assert!(!nodes[0].has_message(&to_c));
    assert!(nodes[0].has_message(&fresh));
    assert_eq!(nodes[0].stats().evicted, 1);
}
