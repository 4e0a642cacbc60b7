//! Router configuration
//!
//! All tuning constants live here and are handed to each component at
//! construction. Hosts usually deserialize this from their own config file.

use serde::{Deserialize, Serialize};

use crate::buffer::EvictionPolicy;
use crate::error::{Result, RoutingError};
use crate::prophet::ProphetParams;
use crate::scorer::{FeaturePair, PriorityConvention};
use crate::spray::SprayConfig;
use crate::transfer_queue::QueueMode;

/// Default buffer size in buffer units
pub const DEFAULT_BUFFER_CAPACITY: u64 = 5_000_000;

/// How forwarding candidates are chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardingMode {
    /// Replicate everything the peer lacks, falling back to CSTQ
    #[default]
    Epidemic,
    /// Spray copies while more than one is left
    SprayAndWait,
    /// Ask the decision engine per message
    DecisionEngine,
}

/// Settings for one router instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub buffer_capacity: u64,
    /// Lifetime given to created messages, in simulated seconds
    pub message_ttl_secs: Option<f64>,
    pub forwarding: ForwardingMode,
    pub queue_mode: QueueMode,
    pub eviction: EvictionPolicy,
    /// Name of the registered fuzzy ruleset, if priorities are scored
    pub fuzzy_ruleset: Option<String>,
    pub features: FeaturePair,
    pub priority_convention: PriorityConvention,
    pub spray: SprayConfig,
    pub prophet: ProphetParams,
    /// Final recipients answer with a response message
    pub reply_on_delivery: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            message_ttl_secs: None,
            forwarding: ForwardingMode::default(),
            queue_mode: QueueMode::default(),
            eviction: EvictionPolicy::default(),
            fuzzy_ruleset: None,
            features: FeaturePair::default(),
            priority_convention: PriorityConvention::default(),
            spray: SprayConfig::default(),
            prophet: ProphetParams::default(),
            reply_on_delivery: false,
        }
    }
}

fn invalid(reason: &str) -> RoutingError {
    RoutingError::InvalidConfig(reason.to_string())
}

impl RouterConfig {
    /// Reject inconsistent combinations before any node is built
    pub fn validate(&self) -> Result<()> {
        if self.buffer_capacity == 0 {
            return Err(invalid("buffer_capacity must be positive"));
        }

        if let Some(ttl) = self.message_ttl_secs {
            if ttl.is_nan() || ttl <= 0.0 {
                return Err(invalid("message_ttl_secs must be positive"));
            }
        }

        let scored = self.fuzzy_ruleset.is_some();
        if !scored && self.queue_mode == QueueMode::PriorityDesc {
            return Err(invalid("priority_desc queue mode needs a fuzzy_ruleset"));
        }
        if !scored && self.eviction == EvictionPolicy::MinPriority {
            return Err(invalid("min_priority eviction needs a fuzzy_ruleset"));
        }
        if scored && self.features == FeaturePair::FtcTtl && self.message_ttl_secs.is_none() {
            return Err(invalid("ftc_ttl features need message_ttl_secs"));
        }

        if self.eviction == EvictionPolicy::LowestPredictability
            && self.forwarding != ForwardingMode::DecisionEngine
        {
            return Err(invalid(
                "lowest_predictability eviction needs decision_engine forwarding",
            ));
        }

        if self.spray.initial_copies == 0 {
            return Err(invalid("spray.initial_copies must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.spray.encounter_alpha) {
            return Err(invalid("spray.encounter_alpha must lie in [0, 1]"));
        }
        if self.spray.fragment_secs.is_nan() || self.spray.fragment_secs <= 0.0 {
            return Err(invalid("spray.fragment_secs must be positive"));
        }

        let p = &self.prophet;
        for (name, value) in [("beta", p.beta), ("gamma", p.gamma), ("p_init", p.p_init)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(RoutingError::InvalidConfig(format!(
                    "prophet.{} must lie in [0, 1]",
                    name
                )));
            }
        }
        if p.seconds_in_time_unit == 0 {
            return Err(invalid("prophet.seconds_in_time_unit must be positive"));
        }

        Ok(())
    }
}
