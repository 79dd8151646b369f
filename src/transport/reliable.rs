//! Retransmission bookkeeping for reliable messages.
//!
//! Each reliable message becomes one [`ReliableEntry`] holding all of its
//! fragments. Every transmission of a fragment uses a fresh packet id; acks
//! for any of them retire the fragment, and the entry is retired once every
//! fragment is acked.
//!
//! When an entry's deadline passes, its unacked fragments are resent. The
//! resend that brings the retry count to the policy ceiling is the final
//! attempt, and the entry is reported [`PacketTimeoutResult::Lost`] in that
//! same scan.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::trace;

use crate::core::{PacketId, PacketTimeoutResult, RetransmitPolicy, SequenceId};

use super::fragment::Fragment;
use super::timing::RttEstimator;

/// A fragment awaiting acknowledgment.
#[derive(Debug, Clone)]
pub struct ReliableFragment {
    /// Position within the message.
    pub index: u16,
    /// Total fragments of the message.
    pub count: u16,
    /// Fragment bytes.
    pub payload: Bytes,
    /// Packet ids of every transmission so far, oldest first.
    pub packet_ids: Vec<PacketId>,
    /// Acknowledged by the peer.
    pub acked: bool,
}

/// A queued reliable message.
#[derive(Debug, Clone)]
pub struct ReliableEntry {
    /// Ordering id.
    pub sequence: SequenceId,
    /// Packet id of fragment 0's first transmission.
    pub group: Option<PacketId>,
    /// The message's fragments.
    pub fragments: Vec<ReliableFragment>,
    /// First transmission.
    pub first_sent: Instant,
    /// Latest (re)transmission.
    pub last_sent: Instant,
    /// Retransmissions so far.
    pub retries: u32,
    /// When the next retransmission is due.
    pub deadline: Instant,
}

impl ReliableEntry {
    fn unacked(&self) -> impl Iterator<Item = &ReliableFragment> {
        self.fragments.iter().filter(|f| !f.acked)
    }
}

/// A fragment the connection must (re)send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResendFragment {
    /// Position within the message.
    pub index: u16,
    /// Total fragments of the message.
    pub count: u16,
    /// Group id, once fragment 0 was sent.
    pub group: Option<PacketId>,
    /// Fragment bytes.
    pub payload: Bytes,
}

/// Outcome of one expired deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutReport {
    /// Message the report is about.
    pub sequence: SequenceId,
    /// `Pending` = resend and keep waiting, `Lost` = final attempt.
    pub result: PacketTimeoutResult,
    /// Fragments to put back on the wire.
    pub resend: Vec<ResendFragment>,
}

/// Per-connection reliable send queue.
#[derive(Debug)]
pub struct ReliableQueue {
    policy: RetransmitPolicy,
    entries: VecDeque<ReliableEntry>,
    /// Every transmission of each unacked fragment.
    by_packet: HashMap<PacketId, (SequenceId, u16)>,
    next_sequence: SequenceId,
    rtt: RttEstimator,
}

impl ReliableQueue {
    /// Create an empty queue.
    pub fn new(policy: RetransmitPolicy) -> Self {
        Self {
            policy,
            entries: VecDeque::new(),
            by_packet: HashMap::new(),
            next_sequence: SequenceId(0),
            rtt: RttEstimator::new(),
        }
    }

    /// Retransmit policy in force.
    pub fn policy(&self) -> &RetransmitPolicy {
        &self.policy
    }

    /// Queue a message and return its sequence id.
    pub fn enqueue(&mut self, fragments: Vec<Fragment>, now: Instant) -> SequenceId {
        let sequence = self.next_sequence;
        self.next_sequence = sequence.next();

        let fragments = fragments
            .into_iter()
            .map(|f| ReliableFragment {
                index: f.index,
                count: f.count,
                payload: f.payload,
                packet_ids: Vec::new(),
                acked: false,
            })
            .collect();

        self.entries.push_back(ReliableEntry {
            sequence,
            group: None,
            fragments,
            first_sent: now,
            last_sent: now,
            retries: 0,
            deadline: now + self.timeout_for(0),
        });
        sequence
    }

    /// Record that fragment `index` of `sequence` went out as `packet_id`.
    pub fn register_transmission(&mut self, sequence: SequenceId, index: u16, packet_id: PacketId) {
        let Some(entry) = self.entries.iter_mut().find(|e| e.sequence == sequence) else {
            return;
        };
        let Some(fragment) = entry.fragments.get_mut(index as usize) else {
            return;
        };
        if fragment.acked {
            return;
        }
        fragment.packet_ids.push(packet_id);
        if index == 0 && entry.group.is_none() {
            entry.group = Some(packet_id);
        }
        self.by_packet.insert(packet_id, (sequence, index));
    }

    /// Group id of a queued message.
    pub fn group(&self, sequence: SequenceId) -> Option<PacketId> {
        self.entry(sequence).and_then(|e| e.group)
    }

    /// Apply an acknowledged packet id.
    ///
    /// Returns `Some(Acked)` when this ack retires the message's last
    /// fragment, `Some(Pending)` when fragments remain, and `None` when the
    /// packet id belongs to no queued transmission.
    pub fn on_ack(&mut self, packet_id: PacketId, now: Instant) -> Option<PacketTimeoutResult> {
        let (sequence, index) = self.by_packet.remove(&packet_id)?;
        let position = self.entries.iter().position(|e| e.sequence == sequence)?;

        let entry = &mut self.entries[position];
        let fragment = entry.fragments.get_mut(index as usize)?;
        fragment.acked = true;
        // Any transmission retires the fragment; forget the others
        for other in fragment.packet_ids.drain(..) {
            self.by_packet.remove(&other);
        }

        if entry.unacked().next().is_some() {
            return Some(PacketTimeoutResult::Pending);
        }

        let entry = self.entries.remove(position)?;
        // Karn's rule: only never-retransmitted messages give clean samples
        if entry.retries == 0 {
            self.rtt.update(now.saturating_duration_since(entry.first_sent));
        }
        trace!(%sequence, "reliable message acked");
        Some(PacketTimeoutResult::Acked)
    }

    /// Evaluate every expired deadline.
    pub fn scan_for_timeouts(&mut self, now: Instant) -> Vec<TimeoutReport> {
        let max_retries = self.policy.max_retries;
        let mut reports = Vec::new();
        let mut lost = Vec::new();

        for position in 0..self.entries.len() {
            if self.entries[position].deadline > now {
                continue;
            }

            let retries = self.entries[position].retries;
            let mut resend = Vec::new();
            let result = if retries >= max_retries {
                PacketTimeoutResult::Lost
            } else {
                let next_timeout = self.timeout_for(retries + 1);
                let entry = &mut self.entries[position];
                entry.retries += 1;
                entry.last_sent = now;
                entry.deadline = now + next_timeout;
                resend = entry
                    .unacked()
                    .map(|f| ResendFragment {
                        index: f.index,
                        count: f.count,
                        group: entry.group,
                        payload: f.payload.clone(),
                    })
                    .collect();
                if entry.retries >= max_retries {
                    PacketTimeoutResult::Lost
                } else {
                    PacketTimeoutResult::Pending
                }
            };

            let sequence = self.entries[position].sequence;
            if result == PacketTimeoutResult::Lost {
                lost.push(sequence);
            }
            reports.push(TimeoutReport {
                sequence,
                result,
                resend,
            });
        }

        for sequence in lost {
            self.cancel(sequence);
        }
        reports
    }

    /// Oldest sequence still being retried, or the next sequence to assign.
    pub fn floor(&self) -> SequenceId {
        self.entries
            .front()
            .map(|e| e.sequence)
            .unwrap_or(self.next_sequence)
    }

    /// Sequence id the next message will get.
    pub fn next_sequence(&self) -> SequenceId {
        self.next_sequence
    }

    /// Messages awaiting acknowledgment.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing awaits acknowledgment.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a queued message.
    pub fn entry(&self, sequence: SequenceId) -> Option<&ReliableEntry> {
        self.entries.iter().find(|e| e.sequence == sequence)
    }

    /// Abandon every queued message; returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        self.by_packet.clear();
        dropped
    }

    /// Current retransmission timeout estimate.
    pub fn rto(&self) -> Duration {
        self.rtt.rto()
    }

    /// Smoothed RTT, once sampled.
    pub fn srtt(&self) -> Option<Duration> {
        self.rtt.srtt()
    }

    fn timeout_for(&self, retry: u32) -> Duration {
        self.policy.timeout_for(retry, self.rtt.rto())
    }

    /// Drop a message without waiting for acks; returns whether it was queued.
    pub fn cancel(&mut self, sequence: SequenceId) -> bool {
        let Some(position) = self.entries.iter().position(|e| e.sequence == sequence) else {
            return false;
        };
        let Some(entry) = self.entries.remove(position) else {
            return false;
        };
        for packet_id in entry.fragments.iter().flat_map(|f| &f.packet_ids) {
            self.by_packet.remove(packet_id);
        }
        true
    }
}
