//! Spray-and-wait copy control
//!
//! A message starts with `initial_copies` forwarding tokens. While a copy
//! holds more than one token it may be sprayed to intermediate nodes; with a
//! single token left it waits for a direct encounter with the destination.

use carrymesh_protocol::SimTime;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::buffered::BufferedMessage;
use crate::error::Result;

/// Default number of copies a new message starts with
pub const DEFAULT_INITIAL_COPIES: u32 = 6;

/// Default smoothing factor for the encounter-rate estimate
pub const DEFAULT_ENCOUNTER_ALPHA: f64 = 0.15;

/// Elapsed time after which the (k, Q) pair is snapshotted
pub const DEFAULT_FRAGMENT_SECS: f64 = 3600.0;

/// How many copies the receiving node gets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyAllocation {
    /// Half of the sender's copies (rounded up) in binary mode, one otherwise
    #[default]
    Fixed,
    /// Share proportional to the peer's encounter rate
    EncounterRate,
}

/// Spray-and-wait settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SprayConfig {
    pub initial_copies: u32,
    pub binary_mode: bool,
    pub allocation: CopyAllocation,
    pub encounter_alpha: f64,
    pub fragment_secs: f64,
}

impl Default for SprayConfig {
    fn default() -> Self {
        Self {
            initial_copies: DEFAULT_INITIAL_COPIES,
            binary_mode: true,
            allocation: CopyAllocation::Fixed,
            encounter_alpha: DEFAULT_ENCOUNTER_ALPHA,
            fragment_secs: DEFAULT_FRAGMENT_SECS,
        }
    }
}

/// Copy bookkeeping for spray-and-wait messages
#[derive(Debug, Clone)]
pub struct CopyController {
    config: SprayConfig,
}

impl CopyController {
    pub fn new(config: SprayConfig) -> Self {
        CopyController { config }
    }

    /// Give a freshly created message its initial copies
    pub fn initialize(&self, msg: &mut BufferedMessage) {
        msg.routing.copies = Some(self.config.initial_copies);
    }

    /// Whether the message may still be handed to an intermediate node
    pub fn is_spray_eligible(&self, msg: &BufferedMessage) -> Result<bool> {
        Ok(msg.copies()? > 1)
    }

    /// Copies the receiving node starts with
    ///
    /// `own_rate` and `peer_rate` are the two nodes' encounter-rate
    /// estimates; they only matter for [`CopyAllocation::EncounterRate`].
    pub fn copies_for_receiver(
        &self,
        msg: &BufferedMessage,
        own_rate: f64,
        peer_rate: f64,
    ) -> Result<u32> {
        let copies = msg.copies()?;
        let fixed = if self.config.binary_mode {
            copies.div_ceil(2)
        } else {
            1
        };

        let allocated = match self.config.allocation {
            CopyAllocation::Fixed => fixed,
            CopyAllocation::EncounterRate => {
                let total = own_rate + peer_rate;
                if total > 0.0 && total.is_finite() {
                    (peer_rate / total * f64::from(copies)).ceil() as u32
                } else {
                    fixed
                }
            }
        };

        Ok(allocated.clamp(1, copies.max(1)))
    }

    /// Sender-side bookkeeping once a spray transfer completed
    pub fn on_transfer_done(&self, msg: &mut BufferedMessage) -> Result<u32> {
        let copies = msg.copies()?;
        let left = if self.config.binary_mode {
            copies / 2
        } else {
            copies.saturating_sub(1)
        };
        trace!(id = %msg.id(), before = copies, after = left, "spent copies");
        msg.routing.copies = Some(left);
        Ok(left)
    }
}

/// The (k, Q) pair captured when an update gap exceeds the fragment length
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EncounterSnapshot {
    pub encounters: u64,
    pub rate: f64,
    pub taken_at: SimTime,
}

/// Smoothed encounter-rate estimate (QoN) of one node
#[derive(Debug, Clone, PartialEq)]
pub struct EncounterRate {
    alpha: f64,
    fragment_secs: f64,
    rate: f64,
    last_update: SimTime,
    last_tick: Option<SimTime>,
    snapshot: Option<EncounterSnapshot>,
}

impl EncounterRate {
    pub fn new(alpha: f64, fragment_secs: f64) -> Self {
        EncounterRate {
            alpha,
            fragment_secs,
            rate: 0.0,
            last_update: 0.0,
            last_tick: None,
            snapshot: None,
        }
    }

    /// Current estimate
    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn last_update(&self) -> SimTime {
        self.last_update
    }

    /// Last (k, Q) pair captured at a fragment boundary
    pub fn snapshot(&self) -> Option<&EncounterSnapshot> {
        self.snapshot.as_ref()
    }

    /// Fold the cumulative encounter count into the estimate
    ///
    /// Runs at most once per tick; repeated calls with the same `now` and
    /// calls with no elapsed time are no-ops.
    pub fn update(&mut self, now: SimTime, encounters: u64) -> f64 {
        if self.last_tick == Some(now) {
            return self.rate;
        }
        self.last_tick = Some(now);

        let elapsed = now - self.last_update;
        if elapsed <= 0.0 {
            return self.rate;
        }

        if elapsed > self.fragment_secs {
            self.snapshot = Some(EncounterSnapshot {
                encounters,
                rate: self.rate,
                taken_at: now,
            });
        }

        let average = encounters as f64 / elapsed;
        self.rate = self.alpha * self.rate + (1.0 - self.alpha) * average;
        self.last_update = now;
        self.rate
    }
}
