//! Routing error types
//!
//! Only precondition violations are errors. Capacity and admission outcomes
//! are ordinary return values (`bool`, [`crate::router::ReceiveOutcome`]).

use carrymesh_protocol::{MessageId, NodeId};
use thiserror::Error;

/// Routing-specific errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RoutingError {
    #[error("Message {id} has no {property}")]
    MissingProperty {
        id: MessageId,
        property: &'static str,
    },

    #[error("Unknown message: {0}")]
    UnknownMessage(MessageId),

    #[error("Peer {0} runs an incompatible decision engine")]
    IncompatiblePeer(NodeId),

    #[error("Unknown fuzzy ruleset: {0}")]
    UnknownOracle(String),

    #[error("Oracle {oracle} produced no usable '{output}' output")]
    OracleOutput { oracle: String, output: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] carrymesh_protocol::ProtocolError),
}

/// Result type for routing operations
pub type Result<T> = std::result::Result<T, RoutingError>;
