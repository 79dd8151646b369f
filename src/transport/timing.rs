//! Round-trip time estimation (RFC 6298).
//!
//! Samples come from reliable messages acknowledged without ever being
//! retransmitted (Karn's rule), so an ack can never be matched to the wrong
//! transmission.

use std::time::Duration;

use crate::core::{INITIAL_RTO, MAX_RTO, MIN_RTO};

/// Clock granularity term of the RTO formula.
const GRANULARITY: Duration = Duration::from_millis(10);

/// RTT estimator producing an adaptive retransmission timeout.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    /// Smoothed RTT.
    srtt: Duration,
    /// RTT variance.
    rttvar: Duration,
    rto: Duration,
    samples: u64,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl RttEstimator {
    /// Create an estimator with no samples; the RTO starts at [`INITIAL_RTO`].
    pub fn new() -> Self {
        Self {
            srtt: Duration::ZERO,
            rttvar: Duration::ZERO,
            rto: INITIAL_RTO,
            samples: 0,
        }
    }

    /// Feed one RTT sample.
    ///
    /// - First sample: SRTT = R, RTTVAR = R / 2
    /// - Then: RTTVAR = 3/4 RTTVAR + 1/4 |SRTT - R|, SRTT = 7/8 SRTT + 1/8 R
    /// - RTO = SRTT + max(G, 4 RTTVAR), clamped to [MIN_RTO, MAX_RTO]
    pub fn update(&mut self, sample: Duration) {
        if self.samples == 0 {
            self.srtt = sample;
            self.rttvar = sample / 2;
        } else {
            let delta = self.srtt.abs_diff(sample);
            self.rttvar = (self.rttvar * 3 + delta) / 4;
            self.srtt = (self.srtt * 7 + sample) / 8;
        }
        self.samples += 1;

        let rto = self.srtt + GRANULARITY.max(self.rttvar * 4);
        self.rto = rto.clamp(MIN_RTO, MAX_RTO);
    }

    /// Smoothed RTT, `None` before the first sample.
    pub fn srtt(&self) -> Option<Duration> {
        (self.samples > 0).then_some(self.srtt)
    }

    /// RTT variance.
    pub fn rttvar(&self) -> Duration {
        self.rttvar
    }

    /// Current retransmission timeout.
    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// Number of samples taken.
    pub fn sample_count(&self) -> u64 {
        self.samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_rto() {
        let estimator = RttEstimator::new();
        assert_eq!(estimator.rto(), INITIAL_RTO);
        assert_eq!(estimator.srtt(), None);
    }

    #[test]
    fn test_first_sample() {
        let mut estimator = RttEstimator::new();
        estimator.update(Duration::from_millis(100));

        assert_eq!(estimator.srtt(), Some(Duration::from_millis(100)));
        assert_eq!(estimator.rttvar(), Duration::from_millis(50));
        // 100 + 4 * 50
        assert_eq!(estimator.rto(), Duration::from_millis(300));
    }

    #[test]
    fn test_smoothing() {
        let mut estimator = RttEstimator::new();
        estimator.update(Duration::from_millis(100));
        estimator.update(Duration::from_millis(200));

        // SRTT = (7 * 100 + 200) / 8
        assert_eq!(estimator.srtt(), Some(Duration::from_micros(112_500)));
        // RTTVAR = (3 * 50 + 100) / 4
        assert_eq!(estimator.rttvar(), Duration::from_micros(62_500));
    }

    #[test]
    fn test_rto_clamped() {
        let mut estimator = RttEstimator::new();
        estimator.update(Duration::from_micros(500));
        assert_eq!(estimator.rto(), MIN_RTO);

        let mut estimator = RttEstimator::new();
        estimator.update(Duration::from_secs(100));
        assert_eq!(estimator.rto(), MAX_RTO);
    }

    #[test]
    fn test_stable_rtt_converges() {
        let mut estimator = RttEstimator::new();
        for _ in 0..50 {
            estimator.update(Duration::from_millis(80));
        }
        let srtt = estimator.srtt().unwrap();
        assert!(srtt.abs_diff(Duration::from_millis(80)) < Duration::from_millis(1));
        assert!(estimator.rto() >= MIN_RTO);
        assert!(estimator.rto() < Duration::from_millis(150));
    }
}
