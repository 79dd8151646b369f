//! Protocol constants.
//!
//! Wire-format values are fixed and MUST NOT be changed; timing and limit
//! values are the defaults behind [`ConnectionConfig`](super::ConnectionConfig).

use std::time::Duration;

// =============================================================================
// CRYPTOGRAPHIC CONSTANTS
// =============================================================================

/// Poly1305 authentication tag size.
pub const AEAD_TAG_SIZE: usize = 16;

/// XChaCha20 nonce size.
pub const AEAD_NONCE_SIZE: usize = 24;

/// X25519 public key size.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// X25519 private key size.
pub const PRIVATE_KEY_SIZE: usize = 32;

/// Noise handshake hash size (BLAKE2s).
pub const HASH_SIZE: usize = 32;

/// Explicit record counter carried in front of every ciphertext.
pub const RECORD_COUNTER_SIZE: usize = 8;

/// Bytes an encrypted record adds on top of the plaintext.
pub const RECORD_OVERHEAD: usize = RECORD_COUNTER_SIZE + AEAD_TAG_SIZE;

/// Nonce direction: Connector -> Acceptor.
pub const NONCE_DIR_CONNECTOR: u8 = 0x00;

/// Nonce direction: Acceptor -> Connector.
pub const NONCE_DIR_ACCEPTOR: u8 = 0x01;

/// Anti-replay window size in bits.
pub const REPLAY_WINDOW_SIZE: usize = 2048;

/// Hard limit on records per direction; the session MUST terminate.
pub const REJECT_AFTER_MESSAGES: u64 = u64::MAX;

// =============================================================================
// PACKET FLAGS
// =============================================================================

/// Packet belongs to the reliable stream (carries sequence + floor).
pub const FLAG_RELIABLE: u8 = 0x01;

/// Packet is one fragment of a larger payload.
pub const FLAG_FRAGMENT: u8 = 0x02;

/// Packet carries a handshake message.
pub const FLAG_HANDSHAKE: u8 = 0x04;

/// Payload is an encrypted record.
pub const FLAG_ENCRYPTED: u8 = 0x08;

/// Sender is closing the connection.
pub const FLAG_DISCONNECT: u8 = 0x10;

/// The ack fields are meaningful.
pub const FLAG_ACK_VALID: u8 = 0x20;

// =============================================================================
// PACKET SIZES
// =============================================================================

/// Fixed header: flags + packet id + ack latest + ack bits.
pub const BASE_HEADER_SIZE: usize = 1 + 4 + 4 + 4;

/// Reliable extension: sequence + floor.
pub const RELIABLE_HEADER_SIZE: usize = 4 + 4;

/// Fragment extension: group + index + count.
pub const FRAGMENT_HEADER_SIZE: usize = 4 + 2 + 2;

/// Largest header a packet can carry.
pub const MAX_HEADER_SIZE: usize = BASE_HEADER_SIZE + RELIABLE_HEADER_SIZE + FRAGMENT_HEADER_SIZE;

/// Default connection MTU (safe for mobile networks).
pub const DEFAULT_MTU: usize = 1200;

/// Smallest accepted MTU.
pub const MIN_MTU: usize = 128;

/// Largest accepted MTU.
pub const MAX_MTU: usize = 65_507;

/// Receive buffer for the socket adapter.
pub const MAX_DATAGRAM_SIZE: usize = 65_535;

// =============================================================================
// WINDOWS AND LIMITS
// =============================================================================

/// Number of preceding packet ids covered by the piggybacked ack bitfield.
pub const ACK_BITFIELD_SIZE: u32 = 32;

/// Inbound packet-id window (duplicate detection).
pub const RECEIVE_WINDOW_SIZE: u32 = 1024;

/// Outbound packet ids remembered for ack lookups.
pub const SENT_WINDOW_SIZE: u32 = 4096;

/// Reliable messages buffered ahead of the next expected sequence id.
pub const ORDERING_WINDOW_SIZE: u32 = 1024;

/// Hard ceiling on the declared fragment count of one payload.
pub const MAX_FRAGMENT_COUNT: u16 = 256;

/// Concurrent partial assemblies per connection.
pub const MAX_PENDING_ASSEMBLIES: usize = 64;

/// Completed fragment groups remembered to drop late duplicates.
pub const COMPLETED_GROUP_MEMORY: usize = 128;

/// Unprotect failures tolerated before the connection is torn down.
pub const DEFAULT_DECRYPT_FAILURE_LIMIT: u32 = 16;

/// Malformed packets tolerated before the connection is torn down.
pub const DEFAULT_MALFORMED_LIMIT: u32 = 64;

// =============================================================================
// TIMING CONSTANTS
// =============================================================================

/// Initial retransmission timeout.
pub const INITIAL_RTO: Duration = Duration::from_millis(1000);

/// Minimum retransmission timeout.
pub const MIN_RTO: Duration = Duration::from_millis(100);

/// Maximum retransmission timeout.
pub const MAX_RTO: Duration = Duration::from_millis(60000);

/// Maximum retransmission attempts before a message is reported lost.
pub const MAX_RETRANSMITS: u32 = 10;

/// Maximum delay before owed acks are flushed in an empty packet.
pub const DELAYED_ACK_TIMEOUT: Duration = Duration::from_millis(100);

/// Send keepalive if idle for this long.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Consider the peer dead after this long without packets.
pub const DEAD_INTERVAL: Duration = Duration::from_secs(30);

/// Partial fragment assemblies older than this are pruned.
pub const FRAGMENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Window in which a disconnecting connection flushes its final notices.
pub const DISCONNECT_LINGER: Duration = Duration::from_millis(200);

/// Handshake timeout (initial).
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Maximum handshake retries.
pub const HANDSHAKE_MAX_RETRIES: u32 = 5;

/// Handshake backoff multiplier.
pub const HANDSHAKE_BACKOFF: u32 = 2;
