//! CarryMesh Routing Policy
//!
//! Store-carry-forward routing for intermittently connected nodes:
//! - Fuzzy-feature priority scoring through a pluggable oracle
//! - PRoPHET delivery predictability with aging and transitivity
//! - Spray-and-wait copy control with an encounter-rate allocator
//! - Delivery acknowledgments that purge obsolete copies
//! - Bounded buffers with named eviction strategies
//! - A per-tick router policy tying the pieces together over contacts
//!
//! The crate is synchronous and single-threaded. A host scheduler owns the
//! [`Node`]s, opens and closes contacts, calls [`Node::tick`] once per
//! simulated step and completes the transfers the ticks start.

pub mod ack;
pub mod buffer;
pub mod buffered;
pub mod config;
pub mod contact;
pub mod decision;
pub mod error;
pub mod node;
pub mod prophet;
pub mod router;
pub mod scorer;
pub mod spray;
pub mod transfer_queue;

pub use ack::{AckExchange, AckPropagator};
pub use buffer::{EvictionContext, EvictionPolicy, MessageBuffer};
pub use buffered::{BufferedMessage, RoutingFields};
pub use config::{ForwardingMode, RouterConfig};
pub use contact::{
    abort_transfer, close_contact, complete_pending, open_contact, ContactExchange,
};
pub use decision::{ProphetDecisionEngine, RoutingDecisionEngine};
pub use error::{Result, RoutingError};
pub use node::{Node, NodeRoutingState};
pub use prophet::{DeliveryPredictor, ProphetParams};
pub use router::{ReceiveOutcome, RouterPolicy, RouterStats, Transfer, TransferOutcome};
pub use scorer::{
    FeaturePair, FuzzyOracle, LinearInput, LinearOracle, OracleRegistry, PriorityConvention,
    PriorityScorer,
};
pub use spray::{CopyAllocation, CopyController, EncounterRate, SprayConfig};
pub use transfer_queue::{Candidate, QueueMode};
