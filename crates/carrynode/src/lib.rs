//! CarryNode - contact-trace host for the CarryMesh router policy
//!
//! Loads a router configuration and a scripted contact trace, drives the
//! nodes through it tick by tick and reports router statistics.

pub mod config;
pub mod scenario;
pub mod world;

pub use config::{Config, LoggingConfig};
pub use scenario::{Event, Scenario};
pub use world::{Report, World};
