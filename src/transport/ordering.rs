//! In-order delivery of reliable messages.
//!
//! Messages arriving ahead of the next expected sequence id wait in a ring
//! buffer. The sender's floor (its oldest sequence still retried) lets the
//! receiver step over ids the sender gave up on.

use bytes::Bytes;
use tracing::trace;

use crate::core::{sequence_distance, SequenceId, ORDERING_WINDOW_SIZE};

/// Receive-side reorder buffer.
#[derive(Debug)]
pub struct OrderingBuffer {
    expected: SequenceId,
    slots: Vec<Option<(SequenceId, Bytes)>>,
    buffered: usize,
}

impl Default for OrderingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderingBuffer {
    /// Buffer expecting sequence id 0 first.
    pub fn new() -> Self {
        Self::starting_at(SequenceId(0))
    }

    /// Buffer expecting `expected` first.
    pub fn starting_at(expected: SequenceId) -> Self {
        Self {
            expected,
            slots: vec![None; ORDERING_WINDOW_SIZE as usize],
            buffered: 0,
        }
    }

    /// Next sequence id to deliver.
    pub fn expected(&self) -> SequenceId {
        self.expected
    }

    /// Messages waiting for a gap to fill.
    pub fn buffered(&self) -> usize {
        self.buffered
    }

    /// Whether `sequence` fits the window (duplicates included).
    pub fn accepts(&self, sequence: SequenceId) -> bool {
        sequence_distance(sequence.0, self.expected.0) < ORDERING_WINDOW_SIZE as i64
    }

    /// Accept a message; returns everything now deliverable, in order.
    pub fn insert(&mut self, sequence: SequenceId, payload: Bytes) -> Vec<Bytes> {
        let distance = sequence_distance(sequence.0, self.expected.0);
        if distance < 0 {
            trace!(%sequence, "duplicate reliable message");
            return Vec::new();
        }
        if distance >= ORDERING_WINDOW_SIZE as i64 {
            trace!(%sequence, expected = %self.expected, "reliable message beyond window");
            return Vec::new();
        }

        if distance == 0 {
            self.expected = sequence.next();
            let mut delivered = vec![payload];
            self.drain(&mut delivered);
            return delivered;
        }

        let slot = self.slot(sequence);
        if self.slots[slot].is_none() {
            self.slots[slot] = Some((sequence, payload));
            self.buffered += 1;
        }
        Vec::new()
    }

    /// Skip every id older than `floor`, releasing what was buffered.
    pub fn advance_floor(&mut self, floor: SequenceId) -> Vec<Bytes> {
        let mut delivered = Vec::new();
        if !floor.is_newer_than(self.expected) {
            return delivered;
        }

        let gap = sequence_distance(floor.0, self.expected.0);
        if gap >= ORDERING_WINDOW_SIZE as i64 {
            // Nothing buffered can precede the floor any more
            for slot in self.slots.iter_mut() {
                if let Some((sequence, payload)) = slot.take() {
                    if !floor.is_newer_than(sequence) {
                        *slot = Some((sequence, payload));
                    } else {
                        self.buffered -= 1;
                    }
                }
            }
            trace!(from = %self.expected, to = %floor, "ordering window jumped");
            self.expected = floor;
        } else {
            while self.expected != floor {
                let slot = self.slot(self.expected);
                match self.slots[slot].take() {
                    Some((sequence, payload)) if sequence == self.expected => {
                        self.buffered -= 1;
                        delivered.push(payload);
                    }
                    other => {
                        self.slots[slot] = other;
                        trace!(sequence = %self.expected, "skipping abandoned message");
                    }
                }
                self.expected = self.expected.next();
            }
        }

        self.drain(&mut delivered);
        delivered
    }

    /// Drop everything buffered.
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.buffered = 0;
    }

    fn drain(&mut self, delivered: &mut Vec<Bytes>) {
        loop {
            let slot = self.slot(self.expected);
            match self.slots[slot].take() {
                Some((sequence, payload)) if sequence == self.expected => {
                    self.buffered -= 1;
                    delivered.push(payload);
                    self.expected = self.expected.next();
                }
                other => {
                    self.slots[slot] = other;
                    return;
                }
            }
        }
    }

    fn slot(&self, sequence: SequenceId) -> usize {
        (sequence.0 % ORDERING_WINDOW_SIZE) as usize
    }
}
