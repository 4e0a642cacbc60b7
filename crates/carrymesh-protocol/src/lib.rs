//! CarryMesh Protocol Module
//!
//! Identifiers and the message envelope shared by every node of a
//! store-carry-forward network. Routing state that changes as a message is
//! replicated (priority, copies, relay counts) lives in the routing crate.

pub mod error;
pub mod message;
pub mod types;

pub use error::{ProtocolError, Result};
pub use message::{Message, MessageId, MessageType};
pub use types::{NodeId, SimTime};
