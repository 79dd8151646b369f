//! Noise handshake driver
//!
//! Two patterns are supported:
//!
//! ```text
//! Noise_IK(s, rs):              Noise_XX(s, rs):
//!   <- s                          -> e
//!   ...                           <- e, ee, s, es
//!   -> e, es, s, ss               -> s, se
//!   <- e, ee, se
//! ```
//!
//! IK is used when the connector already knows the acceptor's static key
//! (one round trip); XX otherwise. After the handshake both sides derive the
//! directional session keys from the handshake hash with HKDF.

use crate::core::{ConnectionRole, CryptoError, HASH_SIZE, PUBLIC_KEY_SIZE};
use hkdf::Hkdf;
use sha2::Sha256;
use snow::{params::NoiseParams, Builder, HandshakeState};
use zeroize::Zeroize;

use super::{SessionKey, StaticKeypair, SESSION_KEY_SIZE};

/// Largest Noise message (protocol limit).
const NOISE_MAX_MESSAGE: usize = 65_535;

/// HKDF info label for the session keys.
const SESSION_KEY_LABEL: &[u8] = b"rudp-link v1 session keys";

/// Handshake pattern, announced in the first byte of every handshake payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoisePattern {
    /// Connector knows the acceptor's static key.
    IK,
    /// Neither side knows the other in advance.
    XX,
}

impl NoisePattern {
    /// Wire tag.
    pub fn tag(self) -> u8 {
        match self {
            NoisePattern::IK => 0x01,
            NoisePattern::XX => 0x02,
        }
    }

    /// Parse a wire tag.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(NoisePattern::IK),
            0x02 => Some(NoisePattern::XX),
            _ => None,
        }
    }

    fn protocol_name(self) -> &'static str {
        match self {
            NoisePattern::IK => "Noise_IK_25519_ChaChaPoly_BLAKE2s",
            NoisePattern::XX => "Noise_XX_25519_ChaChaPoly_BLAKE2s",
        }
    }

    fn builder<'a>(self) -> Result<Builder<'a>, CryptoError> {
        let params = self
            .protocol_name()
            .parse::<NoiseParams>()
            .map_err(|e| CryptoError::HandshakeFailed(e.to_string()))?;
        Ok(Builder::new(params))
    }
}

/// Result of a completed handshake
pub struct HandshakeResult {
    /// The handshake hash (used for key derivation)
    pub handshake_hash: [u8; HASH_SIZE],
    /// The peer's authenticated static public key
    pub remote_static: [u8; PUBLIC_KEY_SIZE],
}

/// One side of a Noise handshake.
pub struct NoiseHandshake {
    state: HandshakeState,
    pattern: NoisePattern,
}

impl NoiseHandshake {
    /// Start the connector side.
    ///
    /// With `remote_public` the IK pattern is used, otherwise XX.
    pub fn initiator(
        local_keypair: &StaticKeypair,
        remote_public: Option<&[u8; PUBLIC_KEY_SIZE]>,
    ) -> Result<Self, CryptoError> {
        let pattern = match remote_public {
            Some(_) => NoisePattern::IK,
            None => NoisePattern::XX,
        };
        let mut builder = pattern
            .builder()?
            .local_private_key(local_keypair.private_key());
        if let Some(remote) = remote_public {
            builder = builder.remote_public_key(remote);
        }
        let state = builder
            .build_initiator()
            .map_err(|e| CryptoError::HandshakeFailed(e.to_string()))?;

        Ok(Self { state, pattern })
    }

    /// Start the acceptor side for the pattern the connector announced.
    pub fn responder(
        local_keypair: &StaticKeypair,
        pattern: NoisePattern,
    ) -> Result<Self, CryptoError> {
        let state = pattern
            .builder()?
            .local_private_key(local_keypair.private_key())
            .build_responder()
            .map_err(|e| CryptoError::HandshakeFailed(e.to_string()))?;

        Ok(Self { state, pattern })
    }

    /// Pattern in use.
    pub fn pattern(&self) -> NoisePattern {
        self.pattern
    }

    /// Whether the next step is a write.
    pub fn is_my_turn(&self) -> bool {
        self.state.is_my_turn()
    }

    /// Whether all messages have been exchanged.
    pub fn is_finished(&self) -> bool {
        self.state.is_handshake_finished()
    }

    /// Produce the next handshake message.
    pub fn write_message(&mut self, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut buf = vec![0u8; NOISE_MAX_MESSAGE];
        let len = self
            .state
            .write_message(payload, &mut buf)
            .map_err(|e| CryptoError::HandshakeFailed(e.to_string()))?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Consume a handshake message from the peer, returning its payload.
    pub fn read_message(&mut self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut payload = vec![0u8; NOISE_MAX_MESSAGE];
        let len = self
            .state
            .read_message(message, &mut payload)
            .map_err(|e| CryptoError::HandshakeFailed(e.to_string()))?;
        payload.truncate(len);
        Ok(payload)
    }

    /// Finish a completed handshake.
    pub fn finish(self) -> Result<HandshakeResult, CryptoError> {
        if !self.state.is_handshake_finished() {
            return Err(CryptoError::InvalidHandshakeState("finish"));
        }

        // Capture the hash before the state is consumed
        let mut handshake_hash = [0u8; HASH_SIZE];
        handshake_hash.copy_from_slice(self.state.get_handshake_hash());

        let remote = self
            .state
            .get_remote_static()
            .ok_or_else(|| CryptoError::HandshakeFailed("no remote static key".into()))?;
        let mut remote_static = [0u8; PUBLIC_KEY_SIZE];
        remote_static.copy_from_slice(remote);

        Ok(HandshakeResult {
            handshake_hash,
            remote_static,
        })
    }
}

/// Session keys derived from the Noise handshake.
///
/// ```text
/// (connector_key, acceptor_key) = HKDF-Expand(
///     handshake_hash,
///     "rudp-link v1 session keys",
///     64
/// )
/// ```
pub struct SessionKeys {
    connector_key: SessionKey,
    acceptor_key: SessionKey,
}

impl SessionKeys {
    /// Derive session keys from a finished handshake.
    pub fn derive(result: &HandshakeResult) -> Result<Self, CryptoError> {
        let hk = Hkdf::<Sha256>::from_prk(&result.handshake_hash)
            .map_err(|_| CryptoError::KeyDerivationFailed)?;
        let mut key_material = [0u8; 2 * SESSION_KEY_SIZE];
        hk.expand(SESSION_KEY_LABEL, &mut key_material)
            .map_err(|_| CryptoError::KeyDerivationFailed)?;

        let mut connector_key = [0u8; SESSION_KEY_SIZE];
        let mut acceptor_key = [0u8; SESSION_KEY_SIZE];
        connector_key.copy_from_slice(&key_material[..SESSION_KEY_SIZE]);
        acceptor_key.copy_from_slice(&key_material[SESSION_KEY_SIZE..]);
        key_material.zeroize();

        Ok(Self::from_parts(
            SessionKey::from_bytes(connector_key),
            SessionKey::from_bytes(acceptor_key),
        ))
    }

    pub(crate) fn from_parts(connector_key: SessionKey, acceptor_key: SessionKey) -> Self {
        Self {
            connector_key,
            acceptor_key,
        }
    }

    /// Get the send key for the given role.
    pub fn send_key(&self, role: ConnectionRole) -> &SessionKey {
        match role {
            ConnectionRole::Connector => &self.connector_key,
            ConnectionRole::Acceptor => &self.acceptor_key,
        }
    }

    /// Get the receive key for the given role.
    pub fn recv_key(&self, role: ConnectionRole) -> &SessionKey {
        match role {
            ConnectionRole::Connector => &self.acceptor_key,
            ConnectionRole::Acceptor => &self.connector_key,
        }
    }
}
