//! Error types for rudp-link.

use thiserror::Error;

/// Errors while decoding a packet header.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Datagram shorter than the header it announces.
    #[error("packet too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum bytes required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// Reserved flag bits are set.
    #[error("invalid flags: 0x{0:02x}")]
    InvalidFlags(u8),

    /// Flag combination that no sender produces.
    #[error("invalid flag combination: 0x{0:02x}")]
    InvalidFlagCombination(u8),
}

/// Errors in the crypto layer.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Handshake failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Operation is not valid in the current handshake state.
    #[error("handshake not in a state to {0}")]
    InvalidHandshakeState(&'static str),

    /// AEAD encryption failed.
    #[error("AEAD encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (invalid tag or corrupted).
    #[error("AEAD decryption failed (invalid tag or corrupted)")]
    DecryptionFailed,

    /// Record shorter than counter + tag.
    #[error("malformed record")]
    MalformedRecord,

    /// Nonce counter exhausted - session must terminate.
    #[error("nonce counter exhausted - session must terminate")]
    CounterExhaustion,

    /// Replay detected.
    #[error("replay detected")]
    ReplayDetected,

    /// Key derivation failed.
    #[error("key derivation failed")]
    KeyDerivationFailed,
}

/// Configuration errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// MTU outside the supported range.
    #[error("mtu {mtu} outside [{min}, {max}]")]
    MtuOutOfRange {
        /// Requested MTU.
        mtu: usize,
        /// Smallest accepted MTU.
        min: usize,
        /// Largest accepted MTU.
        max: usize,
    },

    /// Retransmit policy is unusable.
    #[error("invalid retransmit policy: {0}")]
    InvalidRetransmitPolicy(&'static str),

    /// Fragment ceiling is unusable.
    #[error("fragment ceiling must be between 1 and {0}")]
    InvalidFragmentCeiling(u16),
}
