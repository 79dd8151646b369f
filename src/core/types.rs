//! Identifiers and state enums shared across the crate.

use std::fmt;

/// Returns `true` if `a` is ahead of `b` in 32-bit serial-number order.
///
/// Ids are compared modulo 2^32: `a` is newer when the wrapping distance from
/// `b` to `a` is non-zero and less than half the id space.
#[inline]
pub fn sequence_greater_than(a: u32, b: u32) -> bool {
    let diff = a.wrapping_sub(b);
    diff != 0 && diff < 0x8000_0000
}

/// Signed wrapping distance from `b` to `a` (positive when `a` is newer).
#[inline]
pub fn sequence_distance(a: u32, b: u32) -> i64 {
    a.wrapping_sub(b) as i32 as i64
}

/// Opaque identifier for a peer connection, unique within its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Per-connection packet identifier (wrapping).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PacketId(pub u32);

impl PacketId {
    /// The id following this one.
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// The id `n` steps before this one.
    pub fn minus(self, n: u32) -> Self {
        Self(self.0.wrapping_sub(n))
    }

    /// Modular "newer than" comparison.
    pub fn is_newer_than(self, other: Self) -> bool {
        sequence_greater_than(self.0, other.0)
    }
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ordering identifier of a reliable message (wrapping).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SequenceId(pub u32);

impl SequenceId {
    /// The id following this one.
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// Modular "newer than" comparison.
    pub fn is_newer_than(self, other: Self) -> bool {
        sequence_greater_than(self.0, other.0)
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle correlating a connection with its owner's heartbeat scheduler entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeoutId(pub u64);

/// Which side initiated the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionRole {
    /// Opened the connection and sends the first handshake message.
    Connector,
    /// Created when a new peer was observed.
    Acceptor,
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not connected (initial and terminal state).
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Established; application data flows.
    Connected,
    /// Closing; final notices are being flushed.
    Disconnecting,
}

/// Outcome of evaluating a tracked reliable message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketTimeoutResult {
    /// Every fragment was acknowledged.
    Acked,
    /// Retry budget exhausted; delivery is not confirmed.
    Lost,
    /// Still waiting; fragments were (re)sent.
    Pending,
}

/// Encryption handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeState {
    /// Nothing sent or received yet.
    Idle,
    /// Messages exchanged, not finished.
    Pending,
    /// Handshake failed; the connection must close.
    Failed,
    /// Session keys established.
    Complete,
}

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// Local application asked to close.
    Requested,
    /// Peer sent a disconnect notice.
    RemoteClosed,
    /// Handshake message rejected.
    HandshakeFailed,
    /// Handshake retries exhausted.
    HandshakeTimeout,
    /// Nothing heard from the peer within the dead interval.
    Timeout,
    /// Too many records failed authentication.
    SecurityViolation,
    /// A reliable message was lost and the loss policy is fatal.
    MessageLost,
    /// Too many malformed packets.
    ProtocolAbuse,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DisconnectReason::Requested => "requested",
            DisconnectReason::RemoteClosed => "closed by peer",
            DisconnectReason::HandshakeFailed => "handshake failed",
            DisconnectReason::HandshakeTimeout => "handshake timed out",
            DisconnectReason::Timeout => "timed out",
            DisconnectReason::SecurityViolation => "security violation",
            DisconnectReason::MessageLost => "reliable message lost",
            DisconnectReason::ProtocolAbuse => "protocol abuse",
        };
        f.write_str(text)
    }
}
