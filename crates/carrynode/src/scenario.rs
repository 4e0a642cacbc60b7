//! Scripted contact traces
//!
//! A scenario names the nodes, lists timed events (contacts coming up or
//! going down, messages created) and says how far and in which steps to run.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub nodes: Vec<String>,
    #[serde(default)]
    pub events: Vec<Event>,
    /// Simulated seconds to run for
    pub end_time: f64,
    /// Simulated seconds per tick
    #[serde(default = "default_tick_secs")]
    pub tick_secs: f64,
}

fn default_tick_secs() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    ContactUp {
        at: f64,
        a: String,
        b: String,
    },
    ContactDown {
        at: f64,
        a: String,
        b: String,
    },
    Create {
        at: f64,
        from: String,
        to: String,
        size: u64,
        #[serde(default)]
        response_size: u64,
    },
}

impl Event {
    pub fn at(&self) -> f64 {
        match self {
            Event::ContactUp { at, .. }
            | Event::ContactDown { at, .. }
            | Event::Create { at, .. } => *at,
        }
    }

    fn names(&self) -> [&str; 2] {
        match self {
            Event::ContactUp { a, b, .. } | Event::ContactDown { a, b, .. } => {
                [a.as_str(), b.as_str()]
            }
            Event::Create { from, to, .. } => [from.as_str(), to.as_str()],
        }
    }
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario {}", path.display()))?;
        let scenario: Scenario =
            serde_yaml::from_str(&contents).context("Failed to parse scenario")?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tick_secs.is_nan() || self.tick_secs <= 0.0 {
            anyhow::bail!("tick_secs must be positive");
        }
        if self.end_time.is_nan() || self.end_time < 0.0 {
            anyhow::bail!("end_time must not be negative");
        }

        let mut known = BTreeSet::new();
        for name in &self.nodes {
            if !known.insert(name.as_str()) {
                anyhow::bail!("node {} listed twice", name);
            }
        }

        for event in &self.events {
            if event.at().is_nan() {
                anyhow::bail!("event time is not a number: {:?}", event);
            }
            for name in event.names() {
                if !known.contains(name) {
                    anyhow::bail!("event refers to unknown node {}", name);
                }
            }
            if let Event::Create { size: 0, .. } = event {
                anyhow::bail!("message size must be positive: {:?}", event);
            }
            let [a, b] = event.names();
            if a == b {
                anyhow::bail!("event joins node {} with itself", a);
            }
        }
        Ok(())
    }

    /// Events ordered by time, stable for equal times
    pub fn timeline(&self) -> Vec<Event> {
        let mut events = self.events.clone();
        events.sort_by(|x, y| x.at().total_cmp(&y.at()));
        events
    }
}
