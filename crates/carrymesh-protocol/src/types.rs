//! Core protocol types

use blake2::{Blake2b512, Digest};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ProtocolError;

/// Size of a node ID in bytes (32 bytes / 256 bits)
pub const NODE_ID_SIZE: usize = 32;

/// Simulated time in seconds, as handed out by the host scheduler
pub type SimTime = f64;

/// A unique identifier for a node in the CarryMesh network
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct NodeId([u8; NODE_ID_SIZE]);

impl NodeId {
    /// Create a NodeId from a byte array
    pub fn from_bytes(bytes: [u8; NODE_ID_SIZE]) -> Self {
        NodeId(bytes)
    }

    /// Derive a NodeId from a human-readable host name
    ///
    /// Contact traces name their hosts; hashing the name keeps ids stable
    /// across runs without a registry.
    pub fn from_name(name: &str) -> Self {
        let mut hasher = Blake2b512::new();
        hasher.update(b"carrymesh-node:");
        hasher.update(name.as_bytes());
        let hash = hasher.finalize();

        let mut id = [0u8; NODE_ID_SIZE];
        id.copy_from_slice(&hash[..NODE_ID_SIZE]);
        NodeId(id)
    }

    /// Get the bytes of this NodeId
    pub fn as_bytes(&self) -> &[u8; NODE_ID_SIZE] {
        &self.0
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string
    pub fn from_hex(s: &str) -> Result<Self, ProtocolError> {
        let bytes = hex::decode(s).map_err(|e| ProtocolError::InvalidNodeId(e.to_string()))?;

        if bytes.len() != NODE_ID_SIZE {
            return Err(ProtocolError::InvalidNodeId(format!(
                "expected {} bytes, got {}",
                NODE_ID_SIZE,
                bytes.len()
            )));
        }

        let mut arr = [0u8; NODE_ID_SIZE];
        arr.copy_from_slice(&bytes);
        Ok(NodeId(arr))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}
