//! Record protection after the handshake
//!
//! A [`CryptoSession`] owns the two directional keys, the outbound record
//! counter, and the inbound anti-replay window. Records are laid out as
//! `counter (LE64) || ciphertext || tag`.

use crate::core::{
    ConnectionRole, CryptoError, AEAD_TAG_SIZE, RECORD_COUNTER_SIZE, REJECT_AFTER_MESSAGES,
    REPLAY_WINDOW_SIZE,
};

use super::{
    aead::SessionKey,
    noise::SessionKeys,
    nonce::{construct_nonce, Direction},
};

const WORDS: usize = REPLAY_WINDOW_SIZE / 64;

/// Anti-replay sliding window over record counters.
///
/// - Below window: reject
/// - Seen counter: reject
/// - Above highest: slide the window forward
#[derive(Debug, Clone)]
pub struct ReplayWindow {
    /// Bit `i` set = counter `highest - i` was seen.
    bitmap: [u64; WORDS],
    highest: u64,
    initialized: bool,
}

impl ReplayWindow {
    /// Create an empty window.
    pub fn new() -> Self {
        Self {
            bitmap: [0; WORDS],
            highest: 0,
            initialized: false,
        }
    }

    /// Check whether `counter` would be rejected, without recording it.
    pub fn is_replay(&self, counter: u64) -> bool {
        if !self.initialized || counter > self.highest {
            return false;
        }
        let diff = self.highest - counter;
        if diff >= REPLAY_WINDOW_SIZE as u64 {
            return true;
        }
        self.bit(diff as usize)
    }

    /// Record `counter`, rejecting replays and counters below the window.
    pub fn check_and_update(&mut self, counter: u64) -> Result<(), CryptoError> {
        if !self.initialized {
            self.initialized = true;
            self.highest = counter;
            self.set_bit(0);
            return Ok(());
        }

        if counter > self.highest {
            self.slide(counter - self.highest);
            self.highest = counter;
            self.set_bit(0);
            return Ok(());
        }

        if self.is_replay(counter) {
            return Err(CryptoError::ReplayDetected);
        }
        self.set_bit((self.highest - counter) as usize);
        Ok(())
    }

    fn bit(&self, offset: usize) -> bool {
        self.bitmap[offset / 64] & (1u64 << (offset % 64)) != 0
    }

    fn set_bit(&mut self, offset: usize) {
        self.bitmap[offset / 64] |= 1u64 << (offset % 64);
    }

    /// Move every recorded offset `shift` positions older.
    fn slide(&mut self, shift: u64) {
        if shift >= REPLAY_WINDOW_SIZE as u64 {
            self.bitmap = [0; WORDS];
            return;
        }

        let words = (shift / 64) as usize;
        let bits = (shift % 64) as u32;

        if words > 0 {
            self.bitmap.copy_within(0..WORDS - words, words);
            self.bitmap[..words].fill(0);
        }

        if bits > 0 {
            let mut carry = 0u64;
            for word in self.bitmap.iter_mut() {
                let next_carry = *word >> (64 - bits);
                *word = (*word << bits) | carry;
                carry = next_carry;
            }
        }
    }
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Keys, counters, and replay state of an established session.
pub struct CryptoSession {
    send_key: SessionKey,
    recv_key: SessionKey,
    send_direction: Direction,
    send_counter: u64,
    replay_window: ReplayWindow,
}

impl CryptoSession {
    /// Build the session for `role` from freshly derived keys.
    pub fn new(role: ConnectionRole, keys: &SessionKeys) -> Self {
        Self {
            send_key: keys.send_key(role).clone(),
            recv_key: keys.recv_key(role).clone(),
            send_direction: Direction::sending(role),
            send_counter: 0,
            replay_window: ReplayWindow::new(),
        }
    }

    /// Records sealed so far.
    pub fn records_sent(&self) -> u64 {
        self.send_counter
    }

    /// Seal `plaintext`, authenticating `aad` alongside it.
    pub fn seal(&mut self, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.send_counter == REJECT_AFTER_MESSAGES {
            return Err(CryptoError::CounterExhaustion);
        }
        let counter = self.send_counter;
        self.send_counter += 1;

        let nonce = construct_nonce(self.send_direction, counter);
        let mut record = Vec::with_capacity(RECORD_COUNTER_SIZE + plaintext.len() + AEAD_TAG_SIZE);
        record.extend_from_slice(&counter.to_le_bytes());
        self.send_key.seal_into(&nonce, aad, plaintext, &mut record)?;
        Ok(record)
    }

    #[cfg(test)]
    pub(crate) fn exhaust_after(&mut self, remaining: u64) {
        self.send_counter = REJECT_AFTER_MESSAGES - remaining;
    }

    /// Open a record produced by the peer's [`seal`](Self::seal).
    ///
    /// The replay check runs before decryption; the window is only updated
    /// once the record authenticates.
    pub fn open(&mut self, aad: &[u8], record: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if record.len() < RECORD_COUNTER_SIZE + AEAD_TAG_SIZE {
            return Err(CryptoError::MalformedRecord);
        }
        let (counter_bytes, ciphertext) = record.split_at(RECORD_COUNTER_SIZE);
        let mut raw = [0u8; RECORD_COUNTER_SIZE];
        raw.copy_from_slice(counter_bytes);
        let counter = u64::from_le_bytes(raw);

        if self.replay_window.is_replay(counter) {
            return Err(CryptoError::ReplayDetected);
        }

        let nonce = construct_nonce(self.send_direction.opposite(), counter);
        let mut plaintext = ciphertext.to_vec();
        let len = self.recv_key.open_in_place(&nonce, aad, &mut plaintext)?;
        plaintext.truncate(len);
        self.replay_window.check_and_update(counter)?;
        Ok(plaintext)
    }
}
