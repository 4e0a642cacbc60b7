//! Replays a scenario against a set of routed nodes
//!
//! Each step applies the events that are due, ticks every node once in a
//! fixed order, then completes the transfers started during the step.

use anyhow::{Context, Result};
use carrymesh_protocol::{NodeId, SimTime};
use carrymesh_routing::{
    close_contact, complete_pending, open_contact, Node, OracleRegistry, RouterConfig,
    RouterPolicy, RouterStats,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::scenario::{Event, Scenario};

pub struct World {
    names: Vec<String>,
    nodes: Vec<Node>,
    index: BTreeMap<String, usize>,
    by_id: BTreeMap<NodeId, usize>,
    now: SimTime,
    /// Messages the trace asked for that a full buffer refused
    refused: u64,
}

/// Outcome of a replay
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub end_time: SimTime,
    pub nodes: Vec<(String, RouterStats)>,
    pub total: RouterStats,
    pub refused: u64,
}

impl Report {
    /// Share of created data messages that reached their destination
    pub fn delivery_ratio(&self) -> f64 {
        let created = self.total.created.saturating_sub(self.total.responses);
        if created == 0 {
            return 0.0;
        }
        let delivered = self.total.delivered.min(created);
        delivered as f64 / created as f64
    }
}

impl World {
    pub fn new(names: &[String], config: RouterConfig, oracles: &OracleRegistry) -> Result<Self> {
        let policy =
            Arc::new(RouterPolicy::new(config, oracles).context("Failed to build router policy")?);

        let mut world = World {
            names: Vec::with_capacity(names.len()),
            nodes: Vec::with_capacity(names.len()),
            index: BTreeMap::new(),
            by_id: BTreeMap::new(),
            now: 0.0,
            refused: 0,
        };
        for name in names {
            let id = NodeId::from_name(name);
            let slot = world.nodes.len();
            if world.index.insert(name.clone(), slot).is_some() {
                anyhow::bail!("duplicate node name {}", name);
            }
            world.by_id.insert(id, slot);
            world.names.push(name.clone());
            world.nodes.push(Node::new(id, Arc::clone(&policy)));
            debug!(%name, %id, "node added");
        }
        Ok(world)
    }

    pub fn now(&self) -> SimTime {
        self.now
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    fn slot(&self, name: &str) -> Result<usize> {
        self.index
            .get(name)
            .copied()
            .with_context(|| format!("unknown node {}", name))
    }

    /// Two distinct nodes, mutably; callers rule out `i == j`
    fn pair(&mut self, i: usize, j: usize) -> (&mut Node, &mut Node) {
        if i < j {
            let (left, right) = self.nodes.split_at_mut(j);
            (&mut left[i], &mut right[0])
        } else {
            let (left, right) = self.nodes.split_at_mut(i);
            (&mut right[0], &mut left[j])
        }
    }

    /// Contact slots of `a` and `b`, which must be two different nodes
    fn contact_slots(&self, a: &str, b: &str) -> Result<(usize, usize)> {
        let (i, j) = (self.slot(a)?, self.slot(b)?);
        if i == j {
            anyhow::bail!("contact joins node {} with itself", a);
        }
        Ok((i, j))
    }

    pub fn apply(&mut self, event: &Event) -> Result<()> {
        let now = self.now;
        match event {
            Event::ContactUp { a, b, .. } => {
                let (i, j) = self.contact_slots(a, b)?;
                let (first, second) = self.pair(i, j);
                open_contact(first, second, now)
                    .with_context(|| format!("opening contact {}-{}", a, b))?;
            }
            Event::ContactDown { a, b, .. } => {
                let (i, j) = self.contact_slots(a, b)?;
                let (first, second) = self.pair(i, j);
                close_contact(first, second, now);
            }
            Event::Create {
                from,
                to,
                size,
                response_size,
                ..
            } => {
                let i = self.slot(from)?;
                let destination = self.nodes[self.slot(to)?].id();
                let created = self.nodes[i]
                    .create_message(destination, *size, *response_size, now)
                    .with_context(|| format!("creating message {} -> {}", from, to))?;
                if created.is_none() {
                    warn!(%from, %to, size, "message refused by full buffer");
                    self.refused += 1;
                }
            }
        }
        Ok(())
    }

    /// Tick every node once, then finish what the ticks started
    pub fn step(&mut self) -> Result<()> {
        let now = self.now;
        for i in 0..self.nodes.len() {
            let (before, rest) = self.nodes.split_at_mut(i);
            let Some((node, after)) = rest.split_first_mut() else {
                break;
            };
            let mut peers: Vec<&mut Node> = before.iter_mut().chain(after.iter_mut()).collect();
            if let Some(transfer) = node.tick(&mut peers, now)? {
                debug!(
                    node = %self.names[i],
                    id = %transfer.message,
                    from = %transfer.from,
                    to = %transfer.to,
                    "transfer started"
                );
            }
        }

        for i in 0..self.nodes.len() {
            let Some(counterpart) = self.nodes[i].transfer().map(|t| t.counterpart()) else {
                continue;
            };
            let Some(&j) = self.by_id.get(&counterpart) else {
                continue;
            };
            let (first, second) = self.pair(i, j);
            let outcomes = complete_pending(first, second, now)?;
            debug!(at = now, node = %self.names[i], ?outcomes, "transfers completed");
        }
        Ok(())
    }

    /// Replay the whole scenario
    pub fn run(&mut self, scenario: &Scenario) -> Result<Report> {
        let timeline = scenario.timeline();
        let mut pending = timeline.iter().peekable();
        let mut steps: u64 = 0;

        loop {
            self.now = steps as f64 * scenario.tick_secs;
            if self.now > scenario.end_time {
                break;
            }
            while let Some(event) = pending.next_if(|e| e.at() <= self.now) {
                self.apply(event)?;
            }
            self.step()?;
            steps += 1;
        }

        self.now = scenario.end_time;
        Ok(self.report())
    }

    pub fn report(&self) -> Report {
        let mut total = RouterStats::default();
        let nodes = self
            .names
            .iter()
            .zip(&self.nodes)
            .map(|(name, node)| {
                let stats = node.stats();
                total.accumulate(&stats);
                (name.clone(), stats)
            })
            .collect();

        Report {
            end_time: self.now,
            nodes,
            total,
            refused: self.refused,
        }
    }
}
