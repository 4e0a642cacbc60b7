//! Fuzzy-feature priority scoring
//!
//! The rule base itself is not part of this crate. A [`FuzzyOracle`] is a
//! named, stateless evaluator (`evaluate(namedInputs) -> namedOutputs`) that
//! the host registers up front; [`PriorityScorer`] feeds it two message
//! features and turns its center-of-area output into a forwarding priority.

use carrymesh_protocol::SimTime;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::trace;

use crate::buffered::BufferedMessage;
use crate::error::{Result, RoutingError};

/// Oracle input carrying the forward transmission count
pub const INPUT_FTC: &str = "ftc";

/// Oracle input carrying the remaining time-to-live
pub const INPUT_TTL: &str = "ttl";

/// Oracle input carrying the message size
pub const INPUT_SIZE: &str = "ms";

/// Oracle output read back as the center of area
pub const OUTPUT_PRIORITY: &str = "priority";

/// A named, stateless rule-based evaluator
pub trait FuzzyOracle: fmt::Debug + Send + Sync {
    /// Ruleset name the oracle was registered under
    fn name(&self) -> &str;

    /// Evaluate the rule base for one set of crisp inputs
    fn evaluate(&self, inputs: &BTreeMap<String, f64>) -> BTreeMap<String, f64>;
}

/// Oracles available to routers, by ruleset name
#[derive(Debug, Default, Clone)]
pub struct OracleRegistry {
    oracles: HashMap<String, Arc<dyn FuzzyOracle>>,
}

impl OracleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an oracle under its own name, replacing any previous one
    pub fn register(&mut self, oracle: Arc<dyn FuzzyOracle>) {
        self.oracles.insert(oracle.name().to_string(), oracle);
    }

    /// Look up an oracle by ruleset name
    pub fn load(&self, name: &str) -> Result<Arc<dyn FuzzyOracle>> {
        self.oracles
            .get(name)
            .cloned()
            .ok_or_else(|| RoutingError::UnknownOracle(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.oracles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.oracles.is_empty()
    }
}

/// One weighted input of a [`LinearOracle`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearInput {
    pub name: String,
    /// Contribution at full scale; negative weights invert the input
    pub weight: f64,
    /// Input value treated as full scale (inputs are clamped to it)
    pub scale: f64,
}

/// Weighted-sum stand-in for a fuzzy rule base
///
/// Useful where no inference engine is wired in: each input is normalised
/// against its scale, weighted, summed with a bias and clamped to [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearOracle {
    pub name: String,
    pub inputs: Vec<LinearInput>,
    #[serde(default)]
    pub bias: f64,
    #[serde(default = "default_output")]
    pub output: String,
}

fn default_output() -> String {
    OUTPUT_PRIORITY.to_string()
}

impl FuzzyOracle for LinearOracle {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, inputs: &BTreeMap<String, f64>) -> BTreeMap<String, f64> {
        let mut sum = self.bias;
        for input in &self.inputs {
            let value = inputs.get(&input.name).copied().unwrap_or(0.0);
            let normalized = if input.scale > 0.0 {
                (value / input.scale).clamp(0.0, 1.0)
            } else {
                0.0
            };
            sum += input.weight * normalized;
        }

        let mut outputs = BTreeMap::new();
        outputs.insert(self.output.clone(), sum.clamp(0.0, 1.0));
        outputs
    }
}

/// Which message features feed the oracle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeaturePair {
    /// Forward transmission count and remaining TTL
    #[default]
    FtcTtl,
    /// Forward transmission count and message size
    FtcSize,
}

/// How the oracle's output maps to a priority value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityConvention {
    /// priority = 1 - coa
    #[default]
    InverseCoa,
    /// priority = coa
    Coa,
}

/// Result of scoring one message
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Assessment {
    pub coa: f64,
    pub priority: f64,
}

/// Maps two message features to a priority through a fuzzy oracle
#[derive(Debug, Clone)]
pub struct PriorityScorer {
    oracle: Arc<dyn FuzzyOracle>,
    features: FeaturePair,
    convention: PriorityConvention,
}

impl PriorityScorer {
    pub fn new(
        oracle: Arc<dyn FuzzyOracle>,
        features: FeaturePair,
        convention: PriorityConvention,
    ) -> Self {
        PriorityScorer {
            oracle,
            features,
            convention,
        }
    }

    pub fn features(&self) -> FeaturePair {
        self.features
    }

    /// Evaluate the oracle for a feature pair, returning coa in [0, 1]
    pub fn score(&self, feature_a: f64, feature_b: f64) -> Result<f64> {
        let second = match self.features {
            FeaturePair::FtcTtl => INPUT_TTL,
            FeaturePair::FtcSize => INPUT_SIZE,
        };

        let mut inputs = BTreeMap::new();
        inputs.insert(INPUT_FTC.to_string(), feature_a);
        inputs.insert(second.to_string(), feature_b);

        let outputs = self.oracle.evaluate(&inputs);
        match outputs.get(OUTPUT_PRIORITY) {
            Some(coa) if coa.is_finite() => Ok(coa.clamp(0.0, 1.0)),
            _ => Err(RoutingError::OracleOutput {
                oracle: self.oracle.name().to_string(),
                output: OUTPUT_PRIORITY.to_string(),
            }),
        }
    }

    /// Priority derived from an oracle output
    pub fn priority_from_coa(&self, coa: f64) -> f64 {
        match self.convention {
            PriorityConvention::InverseCoa => 1.0 - coa,
            PriorityConvention::Coa => coa,
        }
    }

    /// Feature pair for a buffered message at `now`
    pub fn features_for(&self, msg: &BufferedMessage, now: SimTime) -> Result<(f64, f64)> {
        let ftc = f64::from(msg.ftc()?);
        let second = match self.features {
            FeaturePair::FtcTtl => {
                msg.message
                    .remaining_ttl(now)
                    .ok_or(RoutingError::MissingProperty {
                        id: msg.id(),
                        property: "ttl",
                    })?
            }
            FeaturePair::FtcSize => msg.size() as f64,
        };
        Ok((ftc, second))
    }

    /// Score a message without touching it
    pub fn assess(&self, msg: &BufferedMessage, now: SimTime) -> Result<Assessment> {
        let (a, b) = self.features_for(msg, now)?;
        let coa = self.score(a, b)?;
        Ok(Assessment {
            coa,
            priority: self.priority_from_coa(coa),
        })
    }

    /// Re-score a message and store the result on it
    pub fn refresh(&self, msg: &mut BufferedMessage, now: SimTime) -> Result<f64> {
        let assessment = self.assess(msg, now)?;
        trace!(
            id = %msg.id(),
            coa = assessment.coa,
            priority = assessment.priority,
            "rescored message"
        );
        msg.routing.coa = Some(assessment.coa);
        msg.routing.priority = assessment.priority;
        Ok(assessment.priority)
    }
}
