//! PRoPHET delivery predictability
//!
//! Each node keeps, per known host, an estimate of how likely it is to
//! deliver to that host. Direct contacts raise the estimate, contacts with
//! well-connected peers raise it transitively, and every entry decays
//! geometrically with elapsed time.

use carrymesh_protocol::{NodeId, SimTime};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Default transitivity weight
pub const DEFAULT_BETA: f64 = 0.45;

/// Default decay base per time unit
pub const DEFAULT_GAMMA: f64 = 0.92;

/// Default direct-contact bump
pub const DEFAULT_P_INIT: f64 = 0.75;

/// Default length of one aging time unit in seconds
pub const DEFAULT_SECONDS_IN_TIME_UNIT: u32 = 30;

/// PRoPHET constants for one node
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProphetParams {
    pub beta: f64,
    pub gamma: f64,
    pub p_init: f64,
    pub seconds_in_time_unit: u32,
}

impl Default for ProphetParams {
    fn default() -> Self {
        Self {
            beta: DEFAULT_BETA,
            gamma: DEFAULT_GAMMA,
            p_init: DEFAULT_P_INIT,
            seconds_in_time_unit: DEFAULT_SECONDS_IN_TIME_UNIT,
        }
    }
}

/// Per-node predictability table with lazy aging
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryPredictor {
    params: ProphetParams,
    preds: BTreeMap<NodeId, f64>,
    last_age: SimTime,
}

impl DeliveryPredictor {
    pub fn new(params: ProphetParams) -> Self {
        DeliveryPredictor {
            params,
            preds: BTreeMap::new(),
            last_age: 0.0,
        }
    }

    pub fn params(&self) -> &ProphetParams {
        &self.params
    }

    pub fn last_age(&self) -> SimTime {
        self.last_age
    }

    /// Stored (unaged) entries
    pub fn entries(&self) -> impl Iterator<Item = (&NodeId, &f64)> {
        self.preds.iter()
    }

    pub fn len(&self) -> usize {
        self.preds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.preds.is_empty()
    }

    fn time_units_since_age(&self, now: SimTime) -> f64 {
        (now - self.last_age) / f64::from(self.params.seconds_in_time_unit)
    }

    /// Decay every entry by gamma^dt, where dt is measured in time units
    pub fn age(&mut self, now: SimTime) {
        let dt = self.time_units_since_age(now);
        if dt == 0.0 {
            return;
        }

        let mult = self.params.gamma.powf(dt);
        for value in self.preds.values_mut() {
            *value *= mult;
        }
        self.last_age = now;
    }

    /// Predictability for `host` as aging to `now` would leave it
    ///
    /// Read-only: used when looking at a peer's table during a contact.
    pub fn predictability_at(&self, host: &NodeId, now: SimTime) -> f64 {
        match self.preds.get(host) {
            Some(value) => {
                let dt = self.time_units_since_age(now);
                if dt == 0.0 {
                    *value
                } else {
                    value * self.params.gamma.powf(dt)
                }
            }
            None => 0.0,
        }
    }

    /// Age the table, then return the entry for `host` (0 when unknown)
    pub fn pred_for(&mut self, host: &NodeId, now: SimTime) -> f64 {
        self.age(now);
        self.preds.get(host).copied().unwrap_or(0.0)
    }

    /// Compute both sides' tables after a contact between `me` and `peer`
    ///
    /// Neither input is modified; callers install the returned tables
    /// together. The direct values are computed once and every transitive
    /// entry reads the aged, pre-transitive values of both tables.
    pub fn plan_contact(
        mine: &DeliveryPredictor,
        me: NodeId,
        theirs: &DeliveryPredictor,
        peer: NodeId,
        now: SimTime,
    ) -> (DeliveryPredictor, DeliveryPredictor) {
        let hosts: BTreeSet<NodeId> = mine
            .preds
            .keys()
            .chain(theirs.preds.keys())
            .copied()
            .collect();

        let mut my_next = mine.clone();
        let mut peer_next = theirs.clone();
        my_next.age(now);
        peer_next.age(now);

        let my_old = my_next.preds.get(&peer).copied().unwrap_or(0.0);
        let peer_old = peer_next.preds.get(&me).copied().unwrap_or(0.0);
        let my_p_for_peer = my_old + (1.0 - my_old) * my_next.params.p_init;
        let peer_p_for_me = peer_old + (1.0 - peer_old) * peer_next.params.p_init;
        my_next.preds.insert(peer, my_p_for_peer);
        peer_next.preds.insert(me, peer_p_for_me);

        // Snapshot after the direct update so transitive entries never see
        // each other's results.
        let my_base = my_next.preds.clone();
        let peer_base = peer_next.preds.clone();

        for host in hosts {
            if host == me || host == peer {
                continue;
            }
            let mine_h = my_base.get(&host).copied().unwrap_or(0.0);
            let theirs_h = peer_base.get(&host).copied().unwrap_or(0.0);

            let my_beta = my_next.params.beta;
            let peer_beta = peer_next.params.beta;
            my_next.preds.insert(
                host,
                mine_h + (1.0 - mine_h) * my_p_for_peer * theirs_h * my_beta,
            );
            peer_next.preds.insert(
                host,
                theirs_h + (1.0 - theirs_h) * peer_p_for_me * mine_h * peer_beta,
            );
        }

        (my_next, peer_next)
    }

    /// Apply a contact between `me` (this table) and `peer` to both tables
    pub fn on_contact_up(
        &mut self,
        me: NodeId,
        peer_table: &mut DeliveryPredictor,
        peer: NodeId,
        now: SimTime,
    ) {
        let (mine, theirs) = Self::plan_contact(self, me, peer_table, peer, now);
        *self = mine;
        *peer_table = theirs;
    }
}
