//! Packet header encoding and decoding.
//!
//! Wire format (all integers little-endian):
//!
//! ```text
//! +-------+-----------+------------+----------+
//! | Flags | Packet ID | Ack latest | Ack bits |   base, 13 bytes
//! | 1     | 4         | 4          | 4        |
//! +-------+-----------+------------+----------+
//! | Sequence | Floor |                            RELIABLE, 8 bytes
//! | 4        | 4     |
//! +-------+-------+-------+
//! | Group | Index | Count |                       FRAGMENT, 8 bytes
//! | 4     | 2     | 2     |
//! +-------+-------+-------+
//! ```
//!
//! The encoded header is the associated data of an encrypted payload.

use bytes::{Buf, BufMut};

use crate::core::{
    PacketError, PacketId, SequenceId, BASE_HEADER_SIZE, FLAG_ACK_VALID, FLAG_DISCONNECT,
    FLAG_ENCRYPTED, FLAG_FRAGMENT, FLAG_HANDSHAKE, FLAG_RELIABLE, FRAGMENT_HEADER_SIZE,
    RELIABLE_HEADER_SIZE,
};

/// Header flag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketFlags(u8);

impl PacketFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// Every defined bit.
    const DEFINED: u8 = FLAG_RELIABLE
        | FLAG_FRAGMENT
        | FLAG_HANDSHAKE
        | FLAG_ENCRYPTED
        | FLAG_DISCONNECT
        | FLAG_ACK_VALID;

    /// Create flags from a raw byte.
    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    /// Get the raw byte value.
    pub fn as_byte(self) -> u8 {
        self.0
    }

    /// Check if every bit in `flag` is set.
    pub fn contains(self, flag: u8) -> bool {
        self.0 & flag == flag
    }

    /// Return a copy with `flag` set.
    pub fn with(self, flag: u8) -> Self {
        Self(self.0 | flag)
    }

    /// Reserved bits must be zero.
    pub fn is_valid(self) -> bool {
        self.0 & !Self::DEFINED == 0
    }
}

/// Piggybacked acknowledgment: the latest received id and, in bit `i`, whether
/// id `latest - 1 - i` was received too.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckField {
    /// Most recent packet id received.
    pub latest: PacketId,
    /// Receipt bits for the 32 ids before `latest`.
    pub bits: u32,
}

/// Reliable extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReliableHeader {
    /// Ordering id of the message.
    pub sequence: SequenceId,
    /// Oldest sequence the sender still retransmits.
    pub floor: SequenceId,
}

/// Fragment extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    /// Packet id of the first transmission of fragment 0.
    pub group: PacketId,
    /// Position of this fragment.
    pub index: u16,
    /// Total fragments in the group.
    pub count: u16,
}

/// Decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Handshake / encrypted / disconnect bits; the others follow the fields.
    pub flags: PacketFlags,
    /// Connection-scoped packet id.
    pub packet_id: PacketId,
    /// Piggybacked acks.
    pub ack: Option<AckField>,
    /// Present on reliable packets.
    pub reliable: Option<ReliableHeader>,
    /// Present on fragments.
    pub fragment: Option<FragmentHeader>,
}

impl PacketHeader {
    /// Header for an ordinary packet.
    pub fn new(packet_id: PacketId) -> Self {
        Self {
            flags: PacketFlags::NONE,
            packet_id,
            ack: None,
            reliable: None,
            fragment: None,
        }
    }

    /// Header for a handshake payload.
    ///
    /// Handshake packets sit outside the packet-id space and carry no acks.
    pub fn handshake() -> Self {
        Self {
            flags: PacketFlags::NONE.with(FLAG_HANDSHAKE),
            ..Self::new(PacketId(0))
        }
    }

    /// Whether the payload is a handshake message.
    pub fn is_handshake(&self) -> bool {
        self.flags.contains(FLAG_HANDSHAKE)
    }

    /// Whether the payload is an encrypted record.
    pub fn is_encrypted(&self) -> bool {
        self.flags.contains(FLAG_ENCRYPTED)
    }

    /// Whether the sender is closing the connection.
    pub fn is_disconnect(&self) -> bool {
        self.flags.contains(FLAG_DISCONNECT)
    }

    /// Full flag byte as it goes on the wire.
    pub fn wire_flags(&self) -> PacketFlags {
        let mut flags = self.flags;
        if self.ack.is_some() {
            flags = flags.with(FLAG_ACK_VALID);
        }
        if self.reliable.is_some() {
            flags = flags.with(FLAG_RELIABLE);
        }
        if self.fragment.is_some() {
            flags = flags.with(FLAG_FRAGMENT);
        }
        flags
    }

    /// Encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        let mut len = BASE_HEADER_SIZE;
        if self.reliable.is_some() {
            len += RELIABLE_HEADER_SIZE;
        }
        if self.fragment.is_some() {
            len += FRAGMENT_HEADER_SIZE;
        }
        len
    }

    /// Append the encoded header to `buf`.
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.wire_flags().as_byte());
        buf.put_u32_le(self.packet_id.0);
        match self.ack {
            Some(ack) => {
                buf.put_u32_le(ack.latest.0);
                buf.put_u32_le(ack.bits);
            }
            None => {
                buf.put_u32_le(0);
                buf.put_u32_le(0);
            }
        }
        if let Some(reliable) = self.reliable {
            buf.put_u32_le(reliable.sequence.0);
            buf.put_u32_le(reliable.floor.0);
        }
        if let Some(fragment) = self.fragment {
            buf.put_u32_le(fragment.group.0);
            buf.put_u16_le(fragment.index);
            buf.put_u16_le(fragment.count);
        }
    }

    /// Decode a header from the front of `bytes`.
    ///
    /// Returns the header and its encoded length; the payload follows.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize), PacketError> {
        if bytes.len() < BASE_HEADER_SIZE {
            return Err(PacketError::TooShort {
                expected: BASE_HEADER_SIZE,
                actual: bytes.len(),
            });
        }

        let mut buf = bytes;
        let raw = buf.get_u8();
        let wire = PacketFlags::from_byte(raw);
        if !wire.is_valid() {
            return Err(PacketError::InvalidFlags(raw));
        }
        if wire.contains(FLAG_HANDSHAKE)
            && raw & (FLAG_ENCRYPTED | FLAG_RELIABLE | FLAG_FRAGMENT) != 0
        {
            return Err(PacketError::InvalidFlagCombination(raw));
        }

        let mut expected = BASE_HEADER_SIZE;
        if wire.contains(FLAG_RELIABLE) {
            expected += RELIABLE_HEADER_SIZE;
        }
        if wire.contains(FLAG_FRAGMENT) {
            expected += FRAGMENT_HEADER_SIZE;
        }
        if bytes.len() < expected {
            return Err(PacketError::TooShort {
                expected,
                actual: bytes.len(),
            });
        }

        let packet_id = PacketId(buf.get_u32_le());
        let latest = PacketId(buf.get_u32_le());
        let bits = buf.get_u32_le();
        let ack = wire
            .contains(FLAG_ACK_VALID)
            .then_some(AckField { latest, bits });

        let reliable = wire.contains(FLAG_RELIABLE).then(|| ReliableHeader {
            sequence: SequenceId(buf.get_u32_le()),
            floor: SequenceId(buf.get_u32_le()),
        });
        let fragment = wire.contains(FLAG_FRAGMENT).then(|| FragmentHeader {
            group: PacketId(buf.get_u32_le()),
            index: buf.get_u16_le(),
            count: buf.get_u16_le(),
        });

        let flags = PacketFlags::from_byte(raw & (FLAG_HANDSHAKE | FLAG_ENCRYPTED | FLAG_DISCONNECT));
        Ok((
            Self {
                flags,
                packet_id,
                ack,
                reliable,
                fragment,
            },
            expected,
        ))
    }
}
