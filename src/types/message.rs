//! Message types shared by every stage.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Caller-assigned identifier threaded unchanged through every stage.
///
/// It is the only key used to join a primary message with its broadcast
/// counterpart, and every published message carries the id of the delivery
/// that triggered it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for CorrelationId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl FromStr for CorrelationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A message handed out by the broker and not yet acknowledged.
///
/// The delivery tag is only meaningful on the channel that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub correlation_id: CorrelationId,
    pub payload: Vec<u8>,
}

impl Delivery {
    pub fn new(delivery_tag: u64, correlation_id: CorrelationId, payload: Vec<u8>) -> Self {
        Self {
            delivery_tag,
            correlation_id,
            payload,
        }
    }
}
