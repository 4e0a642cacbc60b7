//! Message types and structures

use blake2::{Blake2b512, Digest};
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};
use crate::types::{NodeId, SimTime};

#[cfg(test)]
use crate::types::NODE_ID_SIZE;

/// Size of a message ID in bytes
pub const MESSAGE_ID_SIZE: usize = 16;

/// A unique identifier for a message
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId([u8; MESSAGE_ID_SIZE]);

impl MessageId {
    /// Generate a new message ID from the message header
    /// Uses BLAKE2b(source + destination + size + created_at + sequence)[0:16]
    pub fn generate(
        source: &NodeId,
        destination: &NodeId,
        size: u64,
        created_at: SimTime,
        sequence: u32,
    ) -> Self {
        let mut hasher = Blake2b512::new();

        hasher.update(source.as_bytes());
        hasher.update(destination.as_bytes());
        hasher.update(size.to_le_bytes());
        hasher.update(created_at.to_bits().to_le_bytes());
        hasher.update(sequence.to_le_bytes());

        MessageId::from_digest(&hasher.finalize())
    }

    /// Derive the id of the response to a request
    pub fn response_for(request: &MessageId) -> Self {
        let mut hasher = Blake2b512::new();
        hasher.update(b"response:");
        hasher.update(request.as_bytes());
        MessageId::from_digest(&hasher.finalize())
    }

    fn from_digest(hash: &[u8]) -> Self {
        let mut id = [0u8; MESSAGE_ID_SIZE];
        id.copy_from_slice(&hash[..MESSAGE_ID_SIZE]);
        MessageId(id)
    }

    /// Create from bytes
    pub fn from_bytes(bytes: [u8; MESSAGE_ID_SIZE]) -> Self {
        MessageId(bytes)
    }

    /// Get bytes
    pub fn as_bytes(&self) -> &[u8; MESSAGE_ID_SIZE] {
        &self.0
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes =
            hex::decode(s).map_err(|e| ProtocolError::DeserializationFailed(e.to_string()))?;

        if bytes.len() != MESSAGE_ID_SIZE {
            return Err(ProtocolError::InvalidMessageId);
        }

        let mut arr = [0u8; MESSAGE_ID_SIZE];
        arr.copy_from_slice(&bytes);
        Ok(MessageId(arr))
    }
}

impl std::fmt::Debug for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MessageId({}...)", &self.to_hex()[..12])
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.to_hex()[..12])
    }
}

/// Message type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// User data message
    Data = 0x01,
    /// Reply generated by the final recipient of a data message
    Response = 0x02,
}

/// A message carried through the network
///
/// The envelope is immutable apart from `hop_count`, which grows by one per
/// completed relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier
    pub id: MessageId,

    /// Source node ID
    pub source: NodeId,

    /// Destination node ID
    pub destination: NodeId,

    /// Message type
    pub message_type: MessageType,

    /// Payload size in buffer units
    pub size: u64,

    /// Creation time (simulated seconds)
    pub created_at: SimTime,

    /// Lifetime in simulated seconds, counted from `created_at`
    pub ttl: Option<SimTime>,

    /// Number of relays this copy has gone through
    pub hop_count: u32,

    /// Size of the response the destination should send back (0 = none)
    pub response_size: u64,

    /// Request this message answers, for responses
    pub in_reply_to: Option<MessageId>,
}

impl Message {
    /// Create a new data message
    pub fn new(
        source: NodeId,
        destination: NodeId,
        size: u64,
        created_at: SimTime,
        sequence: u32,
    ) -> Result<Self> {
        if size == 0 {
            return Err(ProtocolError::ValidationFailed(
                "message size must be positive".to_string(),
            ));
        }

        if source == destination {
            return Err(ProtocolError::ValidationFailed(
                "source and destination must differ".to_string(),
            ));
        }

        Ok(Message {
            id: MessageId::generate(&source, &destination, size, created_at, sequence),
            source,
            destination,
            message_type: MessageType::Data,
            size,
            created_at,
            ttl: None,
            hop_count: 0,
            response_size: 0,
            in_reply_to: None,
        })
    }

    /// Set TTL (simulated seconds)
    pub fn with_ttl(mut self, ttl: SimTime) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Set the size of the expected response
    pub fn with_response_size(mut self, size: u64) -> Self {
        self.response_size = size;
        self
    }

    /// Build the response the destination sends back to the source
    pub fn response(&self, created_at: SimTime) -> Result<Message> {
        if self.response_size == 0 {
            return Err(ProtocolError::ValidationFailed(format!(
                "message {} does not request a response",
                self.id
            )));
        }

        Ok(Message {
            id: MessageId::response_for(&self.id),
            source: self.destination,
            destination: self.source,
            message_type: MessageType::Response,
            size: self.response_size,
            created_at,
            ttl: self.ttl,
            hop_count: 0,
            response_size: 0,
            in_reply_to: Some(self.id),
        })
    }

    /// Remaining lifetime at `now`, if the message has a TTL
    pub fn remaining_ttl(&self, now: SimTime) -> Option<SimTime> {
        self.ttl.map(|ttl| ttl - (now - self.created_at))
    }

    /// Check whether the TTL has run out
    pub fn is_expired(&self, now: SimTime) -> bool {
        matches!(self.remaining_ttl(now), Some(left) if left <= 0.0)
    }

    /// Copy of this message as it arrives one hop further
    pub fn relayed(&self) -> Message {
        let mut copy = self.clone();
        copy.hop_count += 1;
        copy
    }
}
