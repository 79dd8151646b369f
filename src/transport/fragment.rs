//! Fragmentation and reassembly of oversized payloads.
//!
//! A payload larger than one packet's capacity is split into ordered
//! fragments that share a group id (the packet id of fragment 0's first
//! transmission). The receiver collects fragments per group in any order and
//! releases the payload exactly once, when the last missing index arrives.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tracing::trace;

use crate::core::{PacketId, COMPLETED_GROUP_MEMORY, MAX_PENDING_ASSEMBLIES};

use super::error::{TransportError, TransportResult};
use super::packet::FragmentHeader;

/// One outgoing piece of a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Position within the payload.
    pub index: u16,
    /// Total pieces.
    pub count: u16,
    /// Bytes of this piece.
    pub payload: Bytes,
}

#[derive(Debug)]
struct FragmentAssembly {
    count: u16,
    slots: Vec<Option<Bytes>>,
    received: u16,
    created_at: Instant,
}

impl FragmentAssembly {
    fn new(count: u16, now: Instant) -> Self {
        Self {
            count,
            slots: vec![None; count as usize],
            received: 0,
            created_at: now,
        }
    }

    /// Store a piece; returns whether the assembly is now complete.
    fn insert(&mut self, index: u16, payload: Bytes) -> bool {
        let slot = &mut self.slots[index as usize];
        if slot.is_none() {
            *slot = Some(payload);
            self.received += 1;
        }
        self.received == self.count
    }

    fn reassemble(self) -> Bytes {
        let total = self.slots.iter().flatten().map(Bytes::len).sum();
        let mut buf = BytesMut::with_capacity(total);
        for piece in self.slots.into_iter().flatten() {
            buf.extend_from_slice(&piece);
        }
        buf.freeze()
    }
}

/// Per-connection fragment splitter and reassembly buffer.
#[derive(Debug)]
pub struct FragmentQueue {
    max_count: u16,
    assemblies: HashMap<PacketId, FragmentAssembly>,
    completed: VecDeque<PacketId>,
    rejected: u64,
}

impl FragmentQueue {
    /// Create a queue accepting at most `max_count` fragments per payload.
    pub fn new(max_count: u16) -> Self {
        Self {
            max_count,
            assemblies: HashMap::new(),
            completed: VecDeque::with_capacity(COMPLETED_GROUP_MEMORY),
            rejected: 0,
        }
    }

    /// Split `payload` into pieces of at most `capacity` bytes.
    pub fn split(&self, payload: &Bytes, capacity: usize) -> TransportResult<Vec<Fragment>> {
        if capacity == 0 {
            return Err(TransportError::NoPayloadCapacity);
        }

        let fragments = payload.len().div_ceil(capacity).max(1);
        if fragments > self.max_count as usize {
            return Err(TransportError::PayloadTooLarge {
                size: payload.len(),
                fragments,
                max: self.max_count,
            });
        }

        let count = fragments as u16;
        Ok((0..count)
            .map(|index| {
                let start = index as usize * capacity;
                let end = (start + capacity).min(payload.len());
                Fragment {
                    index,
                    count,
                    payload: payload.slice(start..end),
                }
            })
            .collect())
    }

    /// Accept one received fragment.
    ///
    /// Returns the reassembled payload when this fragment completes its
    /// group. Malformed fragments are counted and dropped.
    pub fn on_fragment_received(
        &mut self,
        header: FragmentHeader,
        payload: Bytes,
        now: Instant,
    ) -> Option<Bytes> {
        let FragmentHeader { group, index, count } = header;

        if count == 0 || count > self.max_count || index >= count {
            self.reject(group, "fragment geometry out of range");
            return None;
        }
        if self.completed.contains(&group) {
            trace!(%group, index, "late fragment of completed group");
            return None;
        }

        if !self.assemblies.contains_key(&group) {
            if self.assemblies.len() >= MAX_PENDING_ASSEMBLIES {
                self.evict_oldest();
            }
            self.assemblies.insert(group, FragmentAssembly::new(count, now));
        }

        let complete = match self.assemblies.get_mut(&group) {
            Some(assembly) if assembly.count != count => {
                self.reject(group, "fragment count mismatch");
                return None;
            }
            Some(assembly) => assembly.insert(index, payload),
            None => return None,
        };
        if !complete {
            return None;
        }

        let assembly = self.assemblies.remove(&group)?;
        if self.completed.len() == COMPLETED_GROUP_MEMORY {
            self.completed.pop_front();
        }
        self.completed.push_back(group);
        Some(assembly.reassemble())
    }

    /// Drop partial assemblies older than `max_age`; returns how many.
    pub fn prune(&mut self, now: Instant, max_age: Duration) -> usize {
        let before = self.assemblies.len();
        self.assemblies
            .retain(|_, assembly| now.saturating_duration_since(assembly.created_at) <= max_age);
        before - self.assemblies.len()
    }

    /// Drop all partial assemblies.
    pub fn clear(&mut self) {
        self.assemblies.clear();
        self.completed.clear();
    }

    /// Partial assemblies in progress.
    pub fn pending_count(&self) -> usize {
        self.assemblies.len()
    }

    /// Malformed fragments dropped so far.
    pub fn rejected_count(&self) -> u64 {
        self.rejected
    }

    fn reject(&mut self, group: PacketId, reason: &'static str) {
        self.rejected += 1;
        trace!(%group, reason, "fragment rejected");
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .assemblies
            .iter()
            .min_by_key(|(_, assembly)| assembly.created_at)
            .map(|(group, _)| *group);
        if let Some(group) = oldest {
            trace!(%group, "evicting partial assembly");
            self.assemblies.remove(&group);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MAX_FRAGMENT_COUNT;

    fn header(group: u32, index: u16, count: u16) -> FragmentHeader {
        FragmentHeader {
            group: PacketId(group),
            index,
            count,
        }
    }

    #[test]
    fn test_split_sizes() {
        let queue = FragmentQueue::new(MAX_FRAGMENT_COUNT);
        let payload = Bytes::from(vec![7u8; 5000]);

        let fragments = queue.split(&payload, 1147).unwrap();
        assert_eq!(fragments.len(), 5);
        assert!(fragments.iter().all(|f| f.count == 5));
        assert_eq!(fragments[4].payload.len(), 5000 - 4 * 1147);
        assert_eq!(fragments.iter().map(|f| f.payload.len()).sum::<usize>(), 5000);
    }

    #[test]
    fn test_split_small_payload() {
        let queue = FragmentQueue::new(MAX_FRAGMENT_COUNT);
        let fragments = queue.split(&Bytes::from_static(b"hi"), 100).unwrap();
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].count, 1);
    }

    #[test]
    fn test_split_over_ceiling() {
        let queue = FragmentQueue::new(4);
        let err = queue.split(&Bytes::from(vec![0u8; 500]), 100).unwrap_err();
        assert!(matches!(
            err,
            TransportError::PayloadTooLarge { fragments: 5, max: 4, .. }
        ));
        assert!(queue.split(&Bytes::from(vec![0u8; 10]), 0).is_err());
    }

    #[test]
    fn test_out_of_order_completes_once() {
        let now = Instant::now();
        let mut queue = FragmentQueue::new(MAX_FRAGMENT_COUNT);
        let payload = Bytes::from((0..50u8).collect::<Vec<_>>());
        let fragments = queue.split(&payload, 10).unwrap();

        let mut completions = Vec::new();
        for index in [2usize, 0, 1, 4, 3] {
            let fragment = &fragments[index];
            let result = queue.on_fragment_received(
                header(77, fragment.index, fragment.count),
                fragment.payload.clone(),
                now,
            );
            if let Some(done) = result {
                completions.push((index, done));
            }
        }

        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].0, 3);
        assert_eq!(completions[0].1, payload);

        // Duplicate after completion is not surfaced again
        let fragment = &fragments[1];
        assert!(queue
            .on_fragment_received(header(77, 1, 5), fragment.payload.clone(), now)
            .is_none());
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn test_duplicate_fragment_ignored() {
        let now = Instant::now();
        let mut queue = FragmentQueue::new(MAX_FRAGMENT_COUNT);
        let piece = Bytes::from_static(b"abc");

        assert!(queue.on_fragment_received(header(1, 0, 2), piece.clone(), now).is_none());
        assert!(queue.on_fragment_received(header(1, 0, 2), piece.clone(), now).is_none());
        let done = queue.on_fragment_received(header(1, 1, 2), piece, now).unwrap();
        assert_eq!(done, Bytes::from_static(b"abcabc"));
    }

    #[test]
    fn test_malformed_fragments_rejected() {
        let now = Instant::now();
        let mut queue = FragmentQueue::new(8);
        let piece = Bytes::from_static(b"x");

        assert!(queue.on_fragment_received(header(1, 0, 0), piece.clone(), now).is_none());
        assert!(queue.on_fragment_received(header(1, 0, 9), piece.clone(), now).is_none());
        assert!(queue.on_fragment_received(header(1, 3, 3), piece.clone(), now).is_none());
        assert_eq!(queue.pending_count(), 0);

        assert!(queue.on_fragment_received(header(2, 0, 3), piece.clone(), now).is_none());
        assert!(queue.on_fragment_received(header(2, 1, 4), piece, now).is_none());
        assert_eq!(queue.rejected_count(), 4);
    }

    #[test]
    fn test_prune_stale_assemblies() {
        let start = Instant::now();
        let mut queue = FragmentQueue::new(MAX_FRAGMENT_COUNT);
        queue.on_fragment_received(header(1, 0, 2), Bytes::from_static(b"a"), start);
        queue.on_fragment_received(
            header(2, 0, 2),
            Bytes::from_static(b"b"),
            start + Duration::from_secs(8),
        );

        let dropped = queue.prune(start + Duration::from_secs(11), Duration::from_secs(10));
        assert_eq!(dropped, 1);
        assert_eq!(queue.pending_count(), 1);
    }

    #[test]
    fn test_assembly_limit_evicts_oldest() {
        let start = Instant::now();
        let mut queue = FragmentQueue::new(MAX_FRAGMENT_COUNT);
        for group in 0..MAX_PENDING_ASSEMBLIES as u32 {
            queue.on_fragment_received(
                header(group, 0, 2),
                Bytes::from_static(b"a"),
                start + Duration::from_millis(group as u64),
            );
        }
        queue.on_fragment_received(
            header(1000, 0, 2),
            Bytes::from_static(b"a"),
            start + Duration::from_secs(1),
        );

        assert_eq!(queue.pending_count(), MAX_PENDING_ASSEMBLIES);
        // Group 0 was the oldest; its second half now starts a new assembly
        assert!(queue
            .on_fragment_received(header(0, 1, 2), Bytes::from_static(b"b"), start)
            .is_none());
    }
}
