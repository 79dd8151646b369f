//! Packet id assignment and acknowledgment bookkeeping.
//!
//! Outbound: every datagram gets the next free [`PacketId`]; the tracker
//! remembers the last [`SENT_WINDOW_SIZE`] ids and whether each was acked.
//!
//! Inbound: a ring of [`RECEIVE_WINDOW_SIZE`] slots records which ids arrived,
//! which both rejects duplicates and produces the piggybacked [`AckField`].

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::core::{
    sequence_distance, PacketId, ACK_BITFIELD_SIZE, RECEIVE_WINDOW_SIZE, SENT_WINDOW_SIZE,
};

use super::packet::AckField;

/// Outcome of recording an inbound packet id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveStatus {
    /// First time seen; process the packet.
    Accepted,
    /// Already received; drop.
    Duplicate,
    /// Older than the receive window; drop.
    OutOfWindow,
}

#[derive(Debug, Clone, Copy)]
struct SentRecord {
    sent_at: Instant,
    acked: bool,
}

/// Per-connection packet id tracker.
#[derive(Debug)]
pub struct PacketTracker {
    next_id: PacketId,
    sent: HashMap<u32, SentRecord>,
    in_flight: usize,
    /// Slot `id % RECEIVE_WINDOW_SIZE` holds `id` once received.
    received: Vec<Option<u32>>,
    latest_received: Option<PacketId>,
}

impl Default for PacketTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketTracker {
    /// Tracker starting at packet id 0.
    pub fn new() -> Self {
        Self::starting_at(PacketId(0))
    }

    /// Tracker whose first assigned id is `first`.
    pub fn starting_at(first: PacketId) -> Self {
        Self {
            next_id: first,
            sent: HashMap::new(),
            in_flight: 0,
            received: vec![None; RECEIVE_WINDOW_SIZE as usize],
            latest_received: None,
        }
    }

    /// Assign the next packet id, skipping ids still awaiting an ack.
    pub fn next_packet_id(&mut self, now: Instant) -> PacketId {
        let mut id = self.next_id;
        while self.sent.get(&id.0).is_some_and(|record| !record.acked) {
            id = id.next();
        }
        self.next_id = id.next();

        // Forget the id that just left the send window
        if let Some(old) = self.sent.remove(&id.minus(SENT_WINDOW_SIZE).0) {
            if !old.acked {
                self.in_flight -= 1;
            }
        }
        if let Some(previous) = self.sent.insert(id.0, SentRecord { sent_at: now, acked: false }) {
            if !previous.acked {
                self.in_flight -= 1;
            }
        }
        self.in_flight += 1;
        id
    }

    /// Mark a sent id acknowledged.
    ///
    /// Returns `false` for ids never sent, no longer tracked, or already acked.
    pub fn process_ack(&mut self, id: PacketId) -> bool {
        match self.sent.get_mut(&id.0) {
            Some(record) if !record.acked => {
                record.acked = true;
                self.in_flight -= 1;
                true
            }
            _ => false,
        }
    }

    /// Apply a piggybacked ack field, returning the ids it newly acknowledged.
    pub fn process_ack_field(&mut self, ack: AckField) -> Vec<PacketId> {
        let mut acked = Vec::new();
        if self.process_ack(ack.latest) {
            acked.push(ack.latest);
        }
        for i in 0..ACK_BITFIELD_SIZE {
            if ack.bits & (1 << i) != 0 {
                let id = ack.latest.minus(i + 1);
                if self.process_ack(id) {
                    acked.push(id);
                }
            }
        }
        acked
    }

    /// Whether `id` was sent and acknowledged.
    pub fn was_packet_acked(&self, id: PacketId) -> bool {
        self.sent.get(&id.0).is_some_and(|record| record.acked)
    }

    /// Sent ids not yet acknowledged.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Time `id` was sent, while it is tracked.
    pub fn sent_at(&self, id: PacketId) -> Option<Instant> {
        self.sent.get(&id.0).map(|record| record.sent_at)
    }

    /// Forget sent records older than `max_age`.
    pub fn prune(&mut self, now: Instant, max_age: Duration) {
        let mut dropped = 0;
        self.sent.retain(|_, record| {
            let keep = now.saturating_duration_since(record.sent_at) <= max_age;
            if !keep && !record.acked {
                dropped += 1;
            }
            keep
        });
        self.in_flight -= dropped;
    }

    /// Record an inbound packet id.
    pub fn process_received(&mut self, id: PacketId) -> ReceiveStatus {
        let Some(latest) = self.latest_received else {
            self.latest_received = Some(id);
            self.mark_received(id);
            return ReceiveStatus::Accepted;
        };

        let distance = sequence_distance(id.0, latest.0);
        if distance > 0 {
            // Clear the slots skipped over between latest and id
            let skipped = (distance as u32).min(RECEIVE_WINDOW_SIZE);
            for step in 1..skipped {
                let slot = self.slot(id.minus(step));
                self.received[slot] = None;
            }
            self.latest_received = Some(id);
            self.mark_received(id);
            return ReceiveStatus::Accepted;
        }

        if -distance >= RECEIVE_WINDOW_SIZE as i64 {
            return ReceiveStatus::OutOfWindow;
        }
        if self.has_received(id) {
            return ReceiveStatus::Duplicate;
        }
        self.mark_received(id);
        ReceiveStatus::Accepted
    }

    /// Latest received id plus receipt bits for the 32 ids before it.
    pub fn ack_field(&self) -> Option<AckField> {
        let latest = self.latest_received?;
        let mut bits = 0u32;
        for i in 0..ACK_BITFIELD_SIZE {
            if self.has_received(latest.minus(i + 1)) {
                bits |= 1 << i;
            }
        }
        Some(AckField { latest, bits })
    }

    /// Most recent id received from the peer.
    pub fn latest_received(&self) -> Option<PacketId> {
        self.latest_received
    }

    /// Whether `id` is inside the receive window and was received.
    pub fn has_received(&self, id: PacketId) -> bool {
        self.received[self.slot(id)] == Some(id.0)
    }

    fn mark_received(&mut self, id: PacketId) {
        let slot = self.slot(id);
        self.received[slot] = Some(id.0);
    }

    fn slot(&self, id: PacketId) -> usize {
        (id.0 % RECEIVE_WINDOW_SIZE) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_increment() {
        let now = Instant::now();
        let mut tracker = PacketTracker::new();
        assert_eq!(tracker.next_packet_id(now), PacketId(0));
        assert_eq!(tracker.next_packet_id(now), PacketId(1));
        assert_eq!(tracker.in_flight(), 2);
    }

    #[test]
    fn test_ids_wrap() {
        let now = Instant::now();
        let mut tracker = PacketTracker::starting_at(PacketId(u32::MAX));
        assert_eq!(tracker.next_packet_id(now), PacketId(u32::MAX));
        assert_eq!(tracker.next_packet_id(now), PacketId(0));
    }

    #[test]
    fn test_in_flight_id_skipped() {
        let now = Instant::now();
        let mut tracker = PacketTracker::starting_at(PacketId(u32::MAX));
        let pending = tracker.next_packet_id(now);

        // Force the counter back onto the unacked id
        tracker.next_id = pending;
        let id = tracker.next_packet_id(now);
        assert_ne!(id, pending);
        assert_eq!(id, PacketId(0));
    }

    #[test]
    fn test_process_ack() {
        let now = Instant::now();
        let mut tracker = PacketTracker::new();
        let id = tracker.next_packet_id(now);

        assert!(tracker.process_ack(id));
        assert!(tracker.was_packet_acked(id));
        assert_eq!(tracker.in_flight(), 0);

        // Idempotent, and unknown ids are a no-op
        assert!(!tracker.process_ack(id));
        assert!(!tracker.process_ack(PacketId(999)));
        assert!(!tracker.was_packet_acked(PacketId(999)));
    }

    #[test]
    fn test_ack_field_order_independent() {
        let now = Instant::now();
        let mut a = PacketTracker::new();
        let mut b = PacketTracker::new();
        for _ in 0..6 {
            a.next_packet_id(now);
            b.next_packet_id(now);
        }

        let first = AckField { latest: PacketId(2), bits: 0b11 };
        let second = AckField { latest: PacketId(5), bits: 0b100 };

        a.process_ack_field(first);
        a.process_ack_field(second);
        b.process_ack_field(second);
        b.process_ack_field(first);

        for id in 0..6 {
            assert_eq!(
                a.was_packet_acked(PacketId(id)),
                b.was_packet_acked(PacketId(id)),
                "id {id}"
            );
        }
        assert!(a.was_packet_acked(PacketId(5)));
        assert!(a.was_packet_acked(PacketId(2)));
        assert!(!a.was_packet_acked(PacketId(3)));
        assert!(!a.was_packet_acked(PacketId(4)));
    }

    #[test]
    fn test_process_ack_field_reports_new_acks() {
        let now = Instant::now();
        let mut tracker = PacketTracker::new();
        for _ in 0..4 {
            tracker.next_packet_id(now);
        }

        let acked = tracker.process_ack_field(AckField { latest: PacketId(3), bits: 0b101 });
        assert_eq!(acked, vec![PacketId(3), PacketId(2), PacketId(0)]);

        let acked = tracker.process_ack_field(AckField { latest: PacketId(3), bits: 0b111 });
        assert_eq!(acked, vec![PacketId(1)]);
    }

    #[test]
    fn test_receive_duplicate_and_reorder() {
        let mut tracker = PacketTracker::new();
        assert_eq!(tracker.process_received(PacketId(10)), ReceiveStatus::Accepted);
        assert_eq!(tracker.process_received(PacketId(10)), ReceiveStatus::Duplicate);
        assert_eq!(tracker.process_received(PacketId(8)), ReceiveStatus::Accepted);
        assert_eq!(tracker.process_received(PacketId(8)), ReceiveStatus::Duplicate);
        assert_eq!(tracker.process_received(PacketId(11)), ReceiveStatus::Accepted);

        let ack = tracker.ack_field().unwrap();
        assert_eq!(ack.latest, PacketId(11));
        // 10 -> bit 0, 9 missing -> bit 1, 8 -> bit 2
        assert_eq!(ack.bits, 0b101);
    }

    #[test]
    fn test_receive_out_of_window() {
        let mut tracker = PacketTracker::new();
        tracker.process_received(PacketId(5000));
        assert_eq!(
            tracker.process_received(PacketId(5000 - RECEIVE_WINDOW_SIZE)),
            ReceiveStatus::OutOfWindow
        );
        assert_eq!(
            tracker.process_received(PacketId(5000 - RECEIVE_WINDOW_SIZE + 1)),
            ReceiveStatus::Accepted
        );
    }

    #[test]
    fn test_receive_across_wrap() {
        let mut tracker = PacketTracker::new();
        assert_eq!(tracker.process_received(PacketId(u32::MAX - 1)), ReceiveStatus::Accepted);
        assert_eq!(tracker.process_received(PacketId(1)), ReceiveStatus::Accepted);
        assert_eq!(tracker.process_received(PacketId(u32::MAX)), ReceiveStatus::Accepted);
        assert_eq!(tracker.process_received(PacketId(u32::MAX - 1)), ReceiveStatus::Duplicate);

        let ack = tracker.ack_field().unwrap();
        assert_eq!(ack.latest, PacketId(1));
        // 0 missing, u32::MAX and u32::MAX - 1 received
        assert_eq!(ack.bits, 0b110);
    }

    #[test]
    fn test_large_jump_clears_stale_slots() {
        let mut tracker = PacketTracker::new();
        tracker.process_received(PacketId(3));
        tracker.process_received(PacketId(3 + RECEIVE_WINDOW_SIZE));
        assert!(!tracker.has_received(PacketId(3)));
        assert_eq!(tracker.ack_field().unwrap().bits, 0);
    }

    #[test]
    fn test_prune_forgets_old_records() {
        let start = Instant::now();
        let mut tracker = PacketTracker::new();
        let old = tracker.next_packet_id(start);
        let fresh = tracker.next_packet_id(start + Duration::from_secs(10));

        tracker.prune(start + Duration::from_secs(11), Duration::from_secs(5));
        assert_eq!(tracker.sent_at(old), None);
        assert!(tracker.sent_at(fresh).is_some());
        assert_eq!(tracker.in_flight(), 1);
    }
}
