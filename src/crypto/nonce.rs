//! Nonce construction for XChaCha20-Poly1305
//!
//! Nonces are 24 bytes:
//! - Direction (1 byte): 0x00 = Connector→Acceptor, 0x01 = Acceptor→Connector
//! - Zeros (15 bytes)
//! - Counter (8 bytes, LE)

use crate::core::{AEAD_NONCE_SIZE, ConnectionRole, NONCE_DIR_ACCEPTOR, NONCE_DIR_CONNECTOR};

/// Direction of communication for nonce construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Connector → Acceptor (0x00)
    ConnectorToAcceptor,
    /// Acceptor → Connector (0x01)
    AcceptorToConnector,
}

impl Direction {
    /// Direction of records sent by `role`.
    pub fn sending(role: ConnectionRole) -> Self {
        match role {
            ConnectionRole::Connector => Direction::ConnectorToAcceptor,
            ConnectionRole::Acceptor => Direction::AcceptorToConnector,
        }
    }

    /// Get the byte representation.
    pub fn as_byte(self) -> u8 {
        match self {
            Direction::ConnectorToAcceptor => NONCE_DIR_CONNECTOR,
            Direction::AcceptorToConnector => NONCE_DIR_ACCEPTOR,
        }
    }

    /// Get the opposite direction.
    pub fn opposite(self) -> Self {
        match self {
            Direction::ConnectorToAcceptor => Direction::AcceptorToConnector,
            Direction::AcceptorToConnector => Direction::ConnectorToAcceptor,
        }
    }
}

/// Construct a 24-byte XChaCha20-Poly1305 nonce.
///
/// Layout:
/// ```text
/// [ direction (1) | zeros (15) | counter (8) ]
/// ```
pub fn construct_nonce(direction: Direction, counter: u64) -> [u8; AEAD_NONCE_SIZE] {
    let mut nonce = [0u8; AEAD_NONCE_SIZE];
    nonce[0] = direction.as_byte();
    nonce[16..24].copy_from_slice(&counter.to_le_bytes());
    nonce
}
