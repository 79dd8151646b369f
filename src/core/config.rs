//! Connection configuration.

use std::time::Duration;

use super::constants::*;
use super::error::ConfigError;
use crate::crypto::StaticKeypair;

/// Shape of the retransmission timeout curve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackoffCurve {
    /// Every retry waits `initial_timeout`.
    Fixed,
    /// Retry `n` waits `initial_timeout * multiplier^n`.
    Exponential {
        /// Growth factor per retry (>= 1).
        multiplier: u32,
    },
    /// Retry `n` waits `rto * 2^n`, with the RTO estimated from acks.
    Adaptive,
}

/// Retransmission policy for reliable messages.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetransmitPolicy {
    /// Timeout before the first retransmission (also the adaptive fallback).
    pub initial_timeout: Duration,
    /// Curve applied to subsequent retries.
    pub curve: BackoffCurve,
    /// Retransmissions before the message is reported lost.
    pub max_retries: u32,
    /// Upper bound for any single timeout.
    pub max_timeout: Duration,
}

impl Default for RetransmitPolicy {
    fn default() -> Self {
        Self {
            initial_timeout: INITIAL_RTO,
            curve: BackoffCurve::Adaptive,
            max_retries: MAX_RETRANSMITS,
            max_timeout: MAX_RTO,
        }
    }
}

impl RetransmitPolicy {
    /// Fixed spacing between retries.
    pub fn fixed(timeout: Duration, max_retries: u32) -> Self {
        Self {
            initial_timeout: timeout,
            curve: BackoffCurve::Fixed,
            max_retries,
            max_timeout: MAX_RTO,
        }
    }

    /// Exponential spacing between retries.
    pub fn exponential(initial_timeout: Duration, multiplier: u32, max_retries: u32) -> Self {
        Self {
            initial_timeout,
            curve: BackoffCurve::Exponential { multiplier },
            max_retries,
            max_timeout: MAX_RTO,
        }
    }

    /// Timeout to wait after transmission number `retry` (0 = first send).
    ///
    /// `rto` is the current estimate and only used by [`BackoffCurve::Adaptive`].
    pub fn timeout_for(&self, retry: u32, rto: Duration) -> Duration {
        let timeout = match self.curve {
            BackoffCurve::Fixed => self.initial_timeout,
            BackoffCurve::Exponential { multiplier } => {
                let factor = multiplier.max(1).saturating_pow(retry);
                self.initial_timeout.saturating_mul(factor)
            }
            BackoffCurve::Adaptive => rto.saturating_mul(2u32.saturating_pow(retry)),
        };
        timeout.min(self.max_timeout)
    }

    /// Check the policy is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_timeout.is_zero() {
            return Err(ConfigError::InvalidRetransmitPolicy("initial timeout is zero"));
        }
        if self.max_timeout < self.initial_timeout {
            return Err(ConfigError::InvalidRetransmitPolicy(
                "max timeout below initial timeout",
            ));
        }
        if let BackoffCurve::Exponential { multiplier: 0 } = self.curve {
            return Err(ConfigError::InvalidRetransmitPolicy("multiplier is zero"));
        }
        Ok(())
    }
}

/// What a lost reliable message does to the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LossPolicy {
    /// Report the loss and keep the connection.
    #[default]
    ReportOnly,
    /// Report the loss and disconnect.
    Disconnect,
}

/// Static key material for the encryption handshake.
#[derive(Clone)]
pub struct EncryptionConfig {
    /// Our long-term keypair.
    pub local_keypair: StaticKeypair,
    /// The peer's static public key, when known in advance.
    ///
    /// A connector that knows it runs the one round-trip IK pattern; without
    /// it the three-message XX pattern is used.
    pub remote_public_key: Option<[u8; PUBLIC_KEY_SIZE]>,
}

impl std::fmt::Debug for EncryptionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionConfig")
            .field("local_public_key", self.local_keypair.public_key())
            .field("remote_public_key", &self.remote_public_key)
            .finish()
    }
}

/// Per-connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Maximum datagram size, headers and encryption overhead included.
    pub mtu: usize,
    /// Reliable retransmission policy.
    pub retransmit: RetransmitPolicy,
    /// Effect of a lost reliable message.
    pub loss_policy: LossPolicy,
    /// Handshake + record protection; `None` sends plaintext.
    pub encryption: Option<EncryptionConfig>,
    /// Hard ceiling on fragments per payload.
    pub max_fragment_count: u16,
    /// Partial assemblies older than this are dropped.
    pub fragment_timeout: Duration,
    /// Owed acks are flushed after this long without outgoing traffic.
    pub ack_delay: Duration,
    /// Idle time before an empty keepalive packet is sent.
    pub keepalive_interval: Duration,
    /// Silence after which the peer is considered gone.
    pub dead_interval: Duration,
    /// Flush window for a disconnecting connection.
    pub disconnect_linger: Duration,
    /// Initial handshake retry timeout.
    pub handshake_timeout: Duration,
    /// Handshake retries before giving up.
    pub handshake_max_retries: u32,
    /// Unprotect failures tolerated before disconnecting.
    pub decrypt_failure_limit: u32,
    /// Malformed packets tolerated before disconnecting.
    pub malformed_limit: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            retransmit: RetransmitPolicy::default(),
            loss_policy: LossPolicy::default(),
            encryption: None,
            max_fragment_count: MAX_FRAGMENT_COUNT,
            fragment_timeout: FRAGMENT_TIMEOUT,
            ack_delay: DELAYED_ACK_TIMEOUT,
            keepalive_interval: KEEPALIVE_INTERVAL,
            dead_interval: DEAD_INTERVAL,
            disconnect_linger: DISCONNECT_LINGER,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            handshake_max_retries: HANDSHAKE_MAX_RETRIES,
            decrypt_failure_limit: DEFAULT_DECRYPT_FAILURE_LIMIT,
            malformed_limit: DEFAULT_MALFORMED_LIMIT,
        }
    }
}

impl ConnectionConfig {
    /// Start a builder from the defaults.
    pub fn builder() -> ConnectionConfigBuilder {
        ConnectionConfigBuilder::new()
    }

    /// Check every field is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_mtu(self.mtu)?;
        self.retransmit.validate()?;
        if self.max_fragment_count == 0 || self.max_fragment_count > MAX_FRAGMENT_COUNT {
            return Err(ConfigError::InvalidFragmentCeiling(MAX_FRAGMENT_COUNT));
        }
        Ok(())
    }

    /// Whether the connection runs the handshake and protects records.
    pub fn is_encrypted(&self) -> bool {
        self.encryption.is_some()
    }
}

/// Validate an MTU against the supported range.
pub fn check_mtu(mtu: usize) -> Result<(), ConfigError> {
    if !(MIN_MTU..=MAX_MTU).contains(&mtu) {
        return Err(ConfigError::MtuOutOfRange {
            mtu,
            min: MIN_MTU,
            max: MAX_MTU,
        });
    }
    Ok(())
}

/// Builder for [`ConnectionConfig`].
#[derive(Debug, Default)]
pub struct ConnectionConfigBuilder {
    config: ConnectionConfig,
}

impl ConnectionConfigBuilder {
    /// Create a new builder with default options.
    pub fn new() -> Self {
        Self {
            config: ConnectionConfig::default(),
        }
    }

    /// Set the MTU.
    pub fn mtu(mut self, mtu: usize) -> Self {
        self.config.mtu = mtu;
        self
    }

    /// Set the retransmit policy.
    pub fn retransmit(mut self, policy: RetransmitPolicy) -> Self {
        self.config.retransmit = policy;
        self
    }

    /// Set the loss policy.
    pub fn loss_policy(mut self, policy: LossPolicy) -> Self {
        self.config.loss_policy = policy;
        self
    }

    /// Enable encryption with the given key material.
    pub fn encryption(mut self, encryption: EncryptionConfig) -> Self {
        self.config.encryption = Some(encryption);
        self
    }

    /// Set the fragment ceiling.
    pub fn max_fragment_count(mut self, count: u16) -> Self {
        self.config.max_fragment_count = count;
        self
    }

    /// Set the ack flush delay.
    pub fn ack_delay(mut self, delay: Duration) -> Self {
        self.config.ack_delay = delay;
        self
    }

    /// Set the keepalive interval.
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.config.keepalive_interval = interval;
        self
    }

    /// Set the dead-peer interval.
    pub fn dead_interval(mut self, interval: Duration) -> Self {
        self.config.dead_interval = interval;
        self
    }

    /// Set the disconnect flush window.
    pub fn disconnect_linger(mut self, linger: Duration) -> Self {
        self.config.disconnect_linger = linger;
        self
    }

    /// Set the handshake retry timeout and retry count.
    pub fn handshake_retry(mut self, timeout: Duration, max_retries: u32) -> Self {
        self.config.handshake_timeout = timeout;
        self.config.handshake_max_retries = max_retries;
        self
    }

    /// Set the unprotect failure threshold.
    pub fn decrypt_failure_limit(mut self, limit: u32) -> Self {
        self.config.decrypt_failure_limit = limit;
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<ConnectionConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_timeouts() {
        let policy = RetransmitPolicy::fixed(Duration::from_millis(100), 3);
        for retry in 0..4 {
            assert_eq!(
                policy.timeout_for(retry, Duration::from_secs(9)),
                Duration::from_millis(100)
            );
        }
    }

    #[test]
    fn test_exponential_timeouts_capped() {
        let mut policy = RetransmitPolicy::exponential(Duration::from_millis(100), 2, 10);
        policy.max_timeout = Duration::from_millis(500);
        assert_eq!(policy.timeout_for(0, Duration::ZERO), Duration::from_millis(100));
        assert_eq!(policy.timeout_for(1, Duration::ZERO), Duration::from_millis(200));
        assert_eq!(policy.timeout_for(2, Duration::ZERO), Duration::from_millis(400));
        assert_eq!(policy.timeout_for(3, Duration::ZERO), Duration::from_millis(500));
    }

    #[test]
    fn test_adaptive_uses_rto() {
        let policy = RetransmitPolicy::default();
        assert_eq!(
            policy.timeout_for(1, Duration::from_millis(250)),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn test_builder_rejects_bad_mtu() {
        let err = ConnectionConfig::builder().mtu(16).build().unwrap_err();
        assert!(matches!(err, ConfigError::MtuOutOfRange { mtu: 16, .. }));
    }

    #[test]
    fn test_builder_rejects_zero_timeout() {
        let result = ConnectionConfig::builder()
            .retransmit(RetransmitPolicy::fixed(Duration::ZERO, 3))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_defaults() {
        let config = ConnectionConfig::builder().mtu(1400).build().unwrap();
        assert_eq!(config.mtu, 1400);
        assert!(!config.is_encrypted());
        assert_eq!(config.max_fragment_count, MAX_FRAGMENT_COUNT);
    }
}
