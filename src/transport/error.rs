//! Transport layer error types.
//!
//! Per-packet failures on the receive path never reach the application; they
//! are dropped and counted. The variants below are what send calls, socket
//! setup, and the receive path report at their boundaries.

use std::io;

use thiserror::Error;

use crate::core::{ConfigError, ConnectionState, CryptoError, PacketError};

/// Transport layer errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Header decode error.
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    /// Handshake or record protection error.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error (socket operations).
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Binding the requested port failed.
    #[error("port {port} unavailable: {source}")]
    PortUnavailable {
        /// Requested port (0 = ephemeral).
        port: u16,
        /// Underlying bind error.
        source: io::Error,
    },

    /// Accepting peers in an untrusted zone requires a static keypair.
    #[error("accepting connections in an untrusted zone requires credentials")]
    MissingCredentials,

    /// Operation needs an established connection.
    #[error("connection not established (state {0:?})")]
    NotConnected(ConnectionState),

    /// Application payloads must not be empty.
    #[error("empty payload")]
    EmptyPayload,

    /// Payload needs more fragments than allowed.
    #[error("payload of {size} bytes needs {fragments} fragments (max {max})")]
    PayloadTooLarge {
        /// Payload size.
        size: usize,
        /// Fragments required.
        fragments: usize,
        /// Fragment ceiling.
        max: u16,
    },

    /// Fragment ceiling cannot carry any payload at this MTU.
    #[error("mtu leaves no room for payload")]
    NoPayloadCapacity,

    /// Fragment announced impossible geometry.
    #[error("invalid fragment {index}/{count}")]
    InvalidFragment {
        /// Fragment index.
        index: u16,
        /// Declared count.
        count: u16,
    },

    /// Packet id already received.
    #[error("duplicate packet")]
    DuplicatePacket,

    /// Packet id too old for the receive window.
    #[error("packet outside receive window")]
    OutOfWindow,

    /// Encrypted packet before the handshake completed.
    #[error("session not established")]
    SessionNotEstablished,

    /// No connection for this peer.
    #[error("unknown connection")]
    UnknownConnection,

    /// Connection is closed.
    #[error("connection closed")]
    ConnectionClosed,
}

impl TransportError {
    /// Check if this error should result in silent drop (no response sent).
    pub fn is_silent_drop(&self) -> bool {
        matches!(
            self,
            TransportError::Packet(_)
                | TransportError::Crypto(
                    CryptoError::DecryptionFailed
                        | CryptoError::MalformedRecord
                        | CryptoError::ReplayDetected
                )
                | TransportError::InvalidFragment { .. }
                | TransportError::DuplicatePacket
                | TransportError::OutOfWindow
                | TransportError::SessionNotEstablished
                | TransportError::UnknownConnection
        )
    }

    /// Check if this error is fatal to the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::Crypto(
                CryptoError::HandshakeFailed(_)
                    | CryptoError::CounterExhaustion
                    | CryptoError::KeyDerivationFailed
            ) | TransportError::ConnectionClosed
        )
    }

    /// Check if this error is a security-related error.
    pub fn is_security_error(&self) -> bool {
        matches!(
            self,
            TransportError::Crypto(
                CryptoError::DecryptionFailed
                    | CryptoError::ReplayDetected
                    | CryptoError::CounterExhaustion
                    | CryptoError::HandshakeFailed(_)
            ) | TransportError::MissingCredentials
        )
    }

    /// Whether a socket error is the non-blocking "try again" case.
    pub fn is_would_block(&self) -> bool {
        matches!(self, TransportError::Io(e) if e.kind() == io::ErrorKind::WouldBlock)
    }

    /// Whether a socket error only affects the current read or write.
    ///
    /// ICMP feedback (reset, refused, unreachable) and oversized or
    /// interrupted reads leave the socket usable.
    pub fn is_transient_io(&self) -> bool {
        let TransportError::Io(e) = self else {
            return false;
        };
        matches!(
            e.kind(),
            io::ErrorKind::WouldBlock
                | io::ErrorKind::Interrupted
                | io::ErrorKind::TimedOut
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionRefused
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::HostUnreachable
                | io::ErrorKind::NetworkUnreachable
                | io::ErrorKind::InvalidData
        )
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
