//! Error types for protocol operations

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Invalid message ID")]
    InvalidMessageId,

    #[error("Invalid node ID: {0}")]
    InvalidNodeId(String),

    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}
