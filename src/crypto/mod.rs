//! Encryption layer
//!
//! - [`noise`]: Noise IK/XX handshake and session key derivation
//! - [`session`]: record sealing with an anti-replay window
//! - [`endpoint`]: per-connection handshake + protection state machine
//! - [`aead`], [`nonce`]: XChaCha20-Poly1305 primitives
//! - [`keys`]: long-term X25519 identity keys

pub mod aead;
pub mod endpoint;
pub mod keys;
pub mod noise;
pub mod nonce;
pub mod session;

pub use aead::{SessionKey, SESSION_KEY_SIZE};
pub use endpoint::{EncryptionEndpoint, HandshakeStep};
pub use keys::StaticKeypair;
pub use noise::{HandshakeResult, NoiseHandshake, NoisePattern, SessionKeys};
pub use nonce::{construct_nonce, Direction};
pub use session::{CryptoSession, ReplayWindow};
