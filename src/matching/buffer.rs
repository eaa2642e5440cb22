//! Bookkeeping for broadcast payloads awaiting their primary message.

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::error::StageError;
use crate::types::CorrelationId;

/// What happened to a broadcast payload offered to the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastDisposition {
    /// It carries the id being searched for; the payload is handed back.
    Matched(Vec<u8>),
    /// Stored until a primary message asks for it.
    Buffered,
    /// A newer copy replaced an earlier payload with the same id.
    Replaced,
    /// Another replica already consumed this id; the tombstone is cleared.
    Discarded,
}

/// What a tombstone did to local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TombstoneDisposition {
    /// The local copy of the payload was dropped.
    Evicted,
    /// No local copy yet; it will be discarded when it arrives.
    Recorded,
}

/// Unresolved broadcast payloads and early tombstones.
///
/// Invariants: an id is never both unresolved and tombstoned, and the
/// unresolved map never holds more than `capacity` entries.
#[derive(Debug)]
pub struct MatchBuffer {
    unresolved: HashMap<CorrelationId, Vec<u8>>,
    tombstoned: HashSet<CorrelationId>,
    capacity: usize,
}

impl MatchBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            unresolved: HashMap::with_capacity(capacity),
            tombstoned: HashSet::new(),
            capacity,
        }
    }

    /// Remove and return the buffered payload for `id`.
    pub fn take(&mut self, id: CorrelationId) -> Option<Vec<u8>> {
        self.unresolved.remove(&id)
    }

    /// File a broadcast payload that arrived while searching for `target`.
    ///
    /// Fails with [`StageError::CapacityExhausted`] when storing it would
    /// push the buffer past its capacity; the buffer is left unchanged.
    pub fn offer(
        &mut self,
        target: CorrelationId,
        id: CorrelationId,
        payload: Vec<u8>,
    ) -> Result<BroadcastDisposition, StageError> {
        if self.tombstoned.remove(&id) {
            return Ok(BroadcastDisposition::Discarded);
        }
        if id == target {
            // A stale copy for the same id must not outlive the join.
            self.unresolved.remove(&id);
            return Ok(BroadcastDisposition::Matched(payload));
        }
        if let Some(existing) = self.unresolved.get_mut(&id) {
            *existing = payload;
            return Ok(BroadcastDisposition::Replaced);
        }
        if self.unresolved.len() >= self.capacity {
            return Err(StageError::CapacityExhausted {
                target,
                snapshot: self.snapshot(),
            });
        }
        self.unresolved.insert(id, payload);
        Ok(BroadcastDisposition::Buffered)
    }

    /// Put a joined payload back after its primary message was requeued.
    ///
    /// Returns `false` when the buffer is full and the payload was dropped.
    pub fn restore(&mut self, id: CorrelationId, payload: Vec<u8>) -> bool {
        if self.unresolved.len() >= self.capacity && !self.unresolved.contains_key(&id) {
            return false;
        }
        self.tombstoned.remove(&id);
        self.unresolved.insert(id, payload);
        true
    }

    /// Apply a tombstone from a sibling replica.
    pub fn apply_tombstone(&mut self, id: CorrelationId) -> TombstoneDisposition {
        if self.unresolved.remove(&id).is_some() {
            TombstoneDisposition::Evicted
        } else {
            self.tombstoned.insert(id);
            TombstoneDisposition::Recorded
        }
    }

    pub fn len(&self) -> usize {
        self.unresolved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.unresolved.is_empty()
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstoned.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_unresolved(&self, id: CorrelationId) -> bool {
        self.unresolved.contains_key(&id)
    }

    pub fn is_tombstoned(&self, id: CorrelationId) -> bool {
        self.tombstoned.contains(&id)
    }

    /// Full state, for diagnostics.
    pub fn snapshot(&self) -> BufferSnapshot {
        let mut unresolved: Vec<_> = self
            .unresolved
            .iter()
            .map(|(id, payload)| (*id, payload.len()))
            .collect();
        unresolved.sort();
        let mut tombstoned: Vec<_> = self.tombstoned.iter().copied().collect();
        tombstoned.sort();

        BufferSnapshot {
            capacity: self.capacity,
            unresolved,
            tombstoned,
        }
    }
}

/// Point-in-time copy of a [`MatchBuffer`], reported on capacity exhaustion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferSnapshot {
    pub capacity: usize,
    /// Buffered ids with their payload sizes in bytes
    pub unresolved: Vec<(CorrelationId, usize)>,
    pub tombstoned: Vec<CorrelationId>,
}

impl fmt::Display for BufferSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} unresolved [",
            self.unresolved.len(),
            self.capacity
        )?;
        for (i, (id, size)) in self.unresolved.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{id} ({size} bytes)")?;
        }
        write!(f, "], {} tombstoned [", self.tombstoned.len())?;
        for (i, id) in self.tombstoned.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{id}")?;
        }
        f.write_str("]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ids(n: usize) -> Vec<CorrelationId> {
        (0..n).map(|_| CorrelationId::new()).collect()
    }

    #[test]
    fn test_target_is_returned_not_buffered() {
        let mut buffer = MatchBuffer::new(2);
        let target = CorrelationId::new();

        let got = buffer.offer(target, target, b"terms".to_vec()).unwrap();
        assert_eq!(got, BroadcastDisposition::Matched(b"terms".to_vec()));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_buffered_then_taken() {
        let mut buffer = MatchBuffer::new(2);
        let ids = ids(2);

        assert_eq!(
            buffer.offer(ids[0], ids[1], b"later".to_vec()).unwrap(),
            BroadcastDisposition::Buffered
        );
        assert_eq!(buffer.take(ids[1]), Some(b"later".to_vec()));
        assert_eq!(buffer.take(ids[1]), None);
    }

    #[test]
    fn test_duplicate_keeps_latest_without_growing() {
        let mut buffer = MatchBuffer::new(1);
        let ids = ids(2);

        buffer.offer(ids[0], ids[1], b"v1".to_vec()).unwrap();
        assert_eq!(
            buffer.offer(ids[0], ids[1], b"v2".to_vec()).unwrap(),
            BroadcastDisposition::Replaced
        );
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.take(ids[1]), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_capacity_exhaustion_reports_state() {
        let mut buffer = MatchBuffer::new(2);
        let ids = ids(4);
        let target = ids[0];

        buffer.offer(target, ids[1], vec![0; 3]).unwrap();
        buffer.offer(target, ids[2], vec![0; 5]).unwrap();
        let err = buffer.offer(target, ids[3], vec![]).unwrap_err();

        match err {
            StageError::CapacityExhausted { target: t, snapshot } => {
                assert_eq!(t, target);
                assert_eq!(snapshot.capacity, 2);
                assert_eq!(snapshot.unresolved.len(), 2);
                assert!(snapshot.unresolved.contains(&(ids[1], 3)));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(buffer.len(), 2);
        assert!(!buffer.is_unresolved(ids[3]));
    }

    #[test]
    fn test_target_still_matches_when_full() {
        let mut buffer = MatchBuffer::new(1);
        let ids = ids(2);

        buffer.offer(ids[0], ids[1], vec![]).unwrap();
        assert!(matches!(
            buffer.offer(ids[0], ids[0], b"x".to_vec()),
            Ok(BroadcastDisposition::Matched(_))
        ));
    }

    #[test]
    fn test_tombstone_after_payload_evicts() {
        let mut buffer = MatchBuffer::new(4);
        let ids = ids(2);

        buffer.offer(ids[0], ids[1], vec![1]).unwrap();
        assert_eq!(buffer.apply_tombstone(ids[1]), TombstoneDisposition::Evicted);
        assert!(buffer.is_empty());
        assert_eq!(buffer.tombstone_count(), 0);
    }

    #[test]
    fn test_tombstone_before_payload_discards_on_arrival() {
        let mut buffer = MatchBuffer::new(4);
        let ids = ids(2);

        assert_eq!(buffer.apply_tombstone(ids[1]), TombstoneDisposition::Recorded);
        assert!(buffer.is_tombstoned(ids[1]));
        assert_eq!(
            buffer.offer(ids[0], ids[1], vec![1]).unwrap(),
            BroadcastDisposition::Discarded
        );
        assert!(buffer.is_empty());
        assert!(!buffer.is_tombstoned(ids[1]));
    }

    #[test]
    fn test_tombstone_order_converges() {
        let ids = ids(2);

        let mut early = MatchBuffer::new(4);
        early.apply_tombstone(ids[1]);
        early.offer(ids[0], ids[1], vec![1]).unwrap();

        let mut late = MatchBuffer::new(4);
        late.offer(ids[0], ids[1], vec![1]).unwrap();
        late.apply_tombstone(ids[1]);

        assert_eq!(early.snapshot(), late.snapshot());
        assert!(early.is_empty() && early.tombstone_count() == 0);
    }

    #[test]
    fn test_never_in_both_sets() {
        let mut buffer = MatchBuffer::new(8);
        let ids = ids(5);
        let target = ids[0];

        buffer.apply_tombstone(ids[1]);
        buffer.offer(target, ids[2], vec![]).unwrap();
        buffer.offer(target, ids[1], vec![]).unwrap();
        buffer.apply_tombstone(ids[2]);
        buffer.apply_tombstone(ids[3]);
        buffer.offer(target, ids[4], vec![]).unwrap();

        for id in &ids {
            assert!(!(buffer.is_unresolved(*id) && buffer.is_tombstoned(*id)));
        }
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.tombstone_count(), 1);
    }

    #[test]
    fn test_snapshot_display() {
        let mut buffer = MatchBuffer::new(3);
        let ids = ids(2);
        buffer.offer(ids[0], ids[1], vec![0; 7]).unwrap();

        let text = buffer.snapshot().to_string();
        assert!(text.starts_with("1/3 unresolved ["));
        assert!(text.contains(&format!("{} (7 bytes)", ids[1])));
        assert!(text.ends_with("0 tombstoned []"));
    }

    #[test]
    fn test_restore_respects_capacity() {
        let mut buffer = MatchBuffer::new(1);
        let ids = ids(2);

        assert!(buffer.restore(ids[0], b"a".to_vec()));
        assert!(buffer.restore(ids[0], b"b".to_vec()));
        assert!(!buffer.restore(ids[1], b"c".to_vec()));
        assert_eq!(buffer.take(ids[0]), Some(b"b".to_vec()));
        assert!(!buffer.is_unresolved(ids[1]));
    }
}
