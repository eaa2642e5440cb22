//! Correlation of primary messages with broadcast payloads.

mod buffer;
mod matcher;

pub use buffer::{BroadcastDisposition, BufferSnapshot, MatchBuffer, TombstoneDisposition};
pub use matcher::{BroadcastMatcher, MatcherConfig};
