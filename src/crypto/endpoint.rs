//! Per-connection encryption endpoint
//!
//! Drives the handshake for one peer and, once it completes, protects and
//! unprotects packet bodies. Handshake payloads on the wire are a one-byte
//! [`NoisePattern`] tag followed by the Noise message.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, warn};

use crate::core::{
    ConnectionRole, CryptoError, EncryptionConfig, HandshakeState, PUBLIC_KEY_SIZE,
};

use super::{
    noise::{NoiseHandshake, NoisePattern, SessionKeys},
    session::CryptoSession,
    StaticKeypair,
};

/// Outcome of feeding a handshake message to the endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeStep {
    /// Handshake progress after the message.
    pub state: HandshakeState,
    /// Handshake payload to send back, if any.
    pub reply: Option<Bytes>,
}

/// Handshake and record protection for one connection.
pub struct EncryptionEndpoint {
    role: ConnectionRole,
    local_keypair: StaticKeypair,
    expected_remote: Option<[u8; PUBLIC_KEY_SIZE]>,
    state: HandshakeState,
    handshake: Option<NoiseHandshake>,
    session: Option<CryptoSession>,
    remote_static: Option<[u8; PUBLIC_KEY_SIZE]>,
    /// Latest handshake payload we produced.
    last_outbound: Option<Bytes>,
    /// Latest handshake payload accepted from the peer.
    last_inbound: Option<Bytes>,
    /// Reply produced for `last_inbound`.
    last_reply: Option<Bytes>,
    failures: u32,
    failure_limit: u32,
}

impl EncryptionEndpoint {
    /// Create an idle endpoint.
    pub fn new(role: ConnectionRole, config: &EncryptionConfig, failure_limit: u32) -> Self {
        Self {
            role,
            local_keypair: config.local_keypair.clone(),
            expected_remote: config.remote_public_key,
            state: HandshakeState::Idle,
            handshake: None,
            session: None,
            remote_static: None,
            last_outbound: None,
            last_inbound: None,
            last_reply: None,
            failures: 0,
            failure_limit,
        }
    }

    /// Handshake progress.
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Whether records can be protected.
    pub fn is_established(&self) -> bool {
        self.state == HandshakeState::Complete
    }

    /// The peer's authenticated static key, once known.
    pub fn remote_static(&self) -> Option<&[u8; PUBLIC_KEY_SIZE]> {
        self.remote_static.as_ref()
    }

    /// Our static public key.
    pub fn local_public_key(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        self.local_keypair.public_key()
    }

    /// Unprotect failures so far.
    pub fn failure_count(&self) -> u32 {
        self.failures
    }

    /// Whether enough records failed authentication to give up on the peer.
    pub fn failure_limit_reached(&self) -> bool {
        self.failures >= self.failure_limit
    }

    /// Start the handshake as connector and return the first payload.
    pub fn connect(&mut self) -> Result<Bytes, CryptoError> {
        if self.role != ConnectionRole::Connector || self.state != HandshakeState::Idle {
            return Err(CryptoError::InvalidHandshakeState("connect"));
        }

        let mut handshake =
            NoiseHandshake::initiator(&self.local_keypair, self.expected_remote.as_ref())
                .inspect_err(|_| self.state = HandshakeState::Failed)?;
        let pattern = handshake.pattern();
        let message = handshake
            .write_message(&[])
            .inspect_err(|_| self.state = HandshakeState::Failed)?;

        let payload = frame(pattern, &message);
        debug!(?pattern, len = payload.len(), "handshake initiated");

        self.handshake = Some(handshake);
        self.state = HandshakeState::Pending;
        self.last_outbound = Some(payload.clone());
        Ok(payload)
    }

    /// Accept the connector's first handshake payload.
    pub fn accept(&mut self, inbound: &[u8]) -> Result<HandshakeStep, CryptoError> {
        if self.role != ConnectionRole::Acceptor || self.state != HandshakeState::Idle {
            return Err(CryptoError::InvalidHandshakeState("accept"));
        }

        let pattern = inbound
            .first()
            .copied()
            .and_then(NoisePattern::from_tag)
            .ok_or_else(|| fail(&mut self.state, "unknown handshake pattern"))?;
        let handshake = NoiseHandshake::responder(&self.local_keypair, pattern)
            .inspect_err(|_| self.state = HandshakeState::Failed)?;

        self.handshake = Some(handshake);
        self.state = HandshakeState::Pending;
        self.advance(inbound)
    }

    /// Feed a handshake payload received after `connect`/`accept`.
    ///
    /// A repeat of the last accepted payload re-emits the reply produced for
    /// it, so a peer whose copy of our reply was lost can still finish.
    pub fn process_handshake(&mut self, inbound: &[u8]) -> Result<HandshakeStep, CryptoError> {
        match self.state {
            HandshakeState::Idle if self.role == ConnectionRole::Acceptor => self.accept(inbound),
            HandshakeState::Idle => Err(CryptoError::InvalidHandshakeState("process before connect")),
            HandshakeState::Failed => Err(CryptoError::InvalidHandshakeState("process after failure")),
            HandshakeState::Pending | HandshakeState::Complete => {
                if self.last_inbound.as_deref() == Some(inbound) {
                    return Ok(HandshakeStep {
                        state: self.state,
                        reply: self.last_reply.clone(),
                    });
                }
                if self.state == HandshakeState::Complete {
                    // Stale message from a finished exchange
                    return Ok(HandshakeStep {
                        state: self.state,
                        reply: None,
                    });
                }
                self.advance(inbound)
            }
        }
    }

    /// Payload to resend while the handshake is pending.
    pub fn retransmit_payload(&self) -> Option<Bytes> {
        match self.state {
            HandshakeState::Pending => self.last_outbound.clone(),
            _ => None,
        }
    }

    /// Seal a packet body, with the packet header as associated data.
    pub fn protect(&mut self, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let session = self
            .session
            .as_mut()
            .ok_or(CryptoError::InvalidHandshakeState("protect"))?;
        session.seal(aad, plaintext)
    }

    #[cfg(test)]
    pub(crate) fn exhaust_after(&mut self, remaining: u64) {
        if let Some(session) = self.session.as_mut() {
            session.exhaust_after(remaining);
        }
    }

    /// Open a sealed packet body.
    ///
    /// Authentication failures count towards the failure limit; replays are
    /// rejected without counting.
    pub fn unprotect(&mut self, aad: &[u8], record: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let session = self
            .session
            .as_mut()
            .ok_or(CryptoError::InvalidHandshakeState("unprotect"))?;
        let result = session.open(aad, record);
        if let Err(err) = &result {
            if !matches!(err, CryptoError::ReplayDetected) {
                self.failures += 1;
                warn!(failures = self.failures, error = %err, "record rejected");
            }
        }
        result
    }

    fn advance(&mut self, inbound: &[u8]) -> Result<HandshakeStep, CryptoError> {
        let handshake = self
            .handshake
            .as_mut()
            .ok_or(CryptoError::InvalidHandshakeState("advance"))?;
        let pattern = handshake.pattern();

        let message = match inbound.split_first() {
            Some((&tag, message)) if tag == pattern.tag() => message,
            _ => return Err(fail(&mut self.state, "handshake pattern mismatch")),
        };
        if handshake.is_my_turn() {
            return Err(fail(&mut self.state, "unexpected handshake message"));
        }
        if let Err(err) = handshake.read_message(message) {
            self.state = HandshakeState::Failed;
            warn!(error = %err, "handshake message rejected");
            return Err(err);
        }

        let mut reply = None;
        if !handshake.is_finished() && handshake.is_my_turn() {
            let message = handshake
                .write_message(&[])
                .inspect_err(|_| self.state = HandshakeState::Failed)?;
            reply = Some(frame(pattern, &message));
        }

        self.last_inbound = Some(Bytes::copy_from_slice(inbound));
        self.last_reply = reply.clone();
        if let Some(reply) = &reply {
            self.last_outbound = Some(reply.clone());
        }

        let finished = self
            .handshake
            .as_ref()
            .is_some_and(NoiseHandshake::is_finished);
        if finished {
            self.complete()?;
        }

        Ok(HandshakeStep {
            state: self.state,
            reply,
        })
    }

    fn complete(&mut self) -> Result<(), CryptoError> {
        let handshake = self
            .handshake
            .take()
            .ok_or(CryptoError::InvalidHandshakeState("complete"))?;
        let result = handshake
            .finish()
            .inspect_err(|_| self.state = HandshakeState::Failed)?;
        let keys = SessionKeys::derive(&result)
            .inspect_err(|_| self.state = HandshakeState::Failed)?;

        self.session = Some(CryptoSession::new(self.role, &keys));
        self.remote_static = Some(result.remote_static);
        self.state = HandshakeState::Complete;
        debug!(role = ?self.role, "handshake complete");
        Ok(())
    }
}

fn fail(state: &mut HandshakeState, reason: &str) -> CryptoError {
    *state = HandshakeState::Failed;
    warn!(reason, "handshake failed");
    CryptoError::HandshakeFailed(reason.to_string())
}

fn frame(pattern: NoisePattern, message: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + message.len());
    buf.put_u8(pattern.tag());
    buf.put_slice(message);
    buf.freeze()
}
