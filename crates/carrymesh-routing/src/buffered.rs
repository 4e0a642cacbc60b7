//! Buffered message with routing metadata

use carrymesh_protocol::{Message, MessageId, SimTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Result, RoutingError};

/// Relay count every message starts with at its source
pub const INITIAL_RELAY_COUNT: u32 = 1;

/// Policy-owned fields that travel with each copy of a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingFields {
    /// Derived forwarding priority in [0, 1]
    pub priority: f64,

    /// Last raw oracle output (center of area) the priority came from
    pub coa: Option<f64>,

    /// Forward transmission count
    pub ftc: Option<u32>,

    /// Remaining spray-and-wait copies
    pub copies: Option<u32>,

    /// Replication count, exchanged between contacts as the maximum seen
    pub relay_count: u32,

    /// Best peer predictability this message has already been forwarded to
    pub forward_threshold: Option<f64>,
}

impl Default for RoutingFields {
    fn default() -> Self {
        Self {
            priority: 0.0,
            coa: None,
            ftc: None,
            copies: None,
            relay_count: INITIAL_RELAY_COUNT,
            forward_threshold: None,
        }
    }
}

/// Message with routing metadata, as held in a node's buffer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferedMessage {
    /// The message
    pub message: Message,

    /// When this node received (or created) the message
    pub received_at: SimTime,

    /// Typed routing state
    pub routing: RoutingFields,

    /// Open-ended extension values for experimental policies
    pub extensions: BTreeMap<String, f64>,
}

impl BufferedMessage {
    /// Wrap a message received or created at `received_at`
    pub fn new(message: Message, received_at: SimTime) -> Self {
        BufferedMessage {
            message,
            received_at,
            routing: RoutingFields::default(),
            extensions: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> MessageId {
        self.message.id
    }

    pub fn size(&self) -> u64 {
        self.message.size
    }

    pub fn ftc(&self) -> Result<u32> {
        self.routing.ftc.ok_or(RoutingError::MissingProperty {
            id: self.id(),
            property: "forward transmission count",
        })
    }

    pub fn copies(&self) -> Result<u32> {
        self.routing.copies.ok_or(RoutingError::MissingProperty {
            id: self.id(),
            property: "copy count",
        })
    }

    pub fn forward_threshold(&self) -> Result<f64> {
        self.routing
            .forward_threshold
            .ok_or(RoutingError::MissingProperty {
                id: self.id(),
                property: "forward threshold",
            })
    }

    /// Copy of this message as the next hop will store it
    ///
    /// Hop count and FTC advance by one; the relay count is bumped by the
    /// receiver once the transfer completes.
    pub fn relayed(&self, received_at: SimTime) -> BufferedMessage {
        let message = self.message.relayed();
        let mut routing = self.routing.clone();
        routing.ftc = routing.ftc.map(|_| message.hop_count);
        BufferedMessage {
            message,
            received_at,
            routing,
            extensions: self.extensions.clone(),
        }
    }
}
