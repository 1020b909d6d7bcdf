//! Smoothed-RTT / retransmission-timeout estimator (Jacobson/Karels style,
//! as used by the TCP-over-UDP draft this crate generalizes).

use std::time::Duration;

const ALPHA: f64 = 0.125;
const BETA: f64 = 0.25;

pub const INITIAL_TIMEOUT_MICROS: i64 = 1_000_000;
const BACKOFF_FACTOR: f64 = 1.1;

#[derive(Debug, Clone, Copy)]
pub struct RttEstimator {
    /// -1 until the first sample is accepted.
    estimated_rtt: i64,
    dev_rtt: i64,
    timeout_micros: i64,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl RttEstimator {
    pub fn new() -> Self {
        RttEstimator {
            estimated_rtt: -1,
            dev_rtt: 0,
            timeout_micros: INITIAL_TIMEOUT_MICROS,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_micros(self.timeout_micros.max(0) as u64)
    }

    /// Feeds a new RTT sample (in microseconds). Samples of zero or less are
    /// ignored — a caller must never offer a sample from a segment that was
    /// retransmitted.
    pub fn update(&mut self, sample_micros: i64) {
        if sample_micros <= 0 {
            return;
        }
        if self.estimated_rtt < 0 {
            self.estimated_rtt = sample_micros;
            self.dev_rtt = sample_micros / 2;
        } else {
            let old_estimated = self.estimated_rtt;
            self.estimated_rtt =
                ((1.0 - ALPHA) * old_estimated as f64 + ALPHA * sample_micros as f64) as i64;
            self.dev_rtt = ((1.0 - BETA) * self.dev_rtt as f64
                + BETA * (old_estimated - sample_micros).unsigned_abs() as f64) as i64;
        }
        self.timeout_micros = self.estimated_rtt + 4 * self.dev_rtt;
    }

    /// Called on every timer expiry: backs the timeout off multiplicatively.
    pub fn backoff(&mut self) {
        self.timeout_micros = (self.timeout_micros as f64 * BACKOFF_FACTOR).ceil() as i64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_the_initial_timeout() {
        let rtt = RttEstimator::new();
        assert_eq!(rtt.timeout(), Duration::from_micros(1_000_000));
    }

    #[test]
    fn first_sample_seeds_estimate_and_deviation() {
        let mut rtt = RttEstimator::new();
        rtt.update(100_000);
        // estimatedRTT = 100000, devRTT = 50000, timeout = 100000 + 4*50000
        assert_eq!(rtt.timeout(), Duration::from_micros(300_000));
    }

    #[test]
    fn subsequent_sample_uses_jacobson_update() {
        let mut rtt = RttEstimator::new();
        rtt.update(100_000);
        rtt.update(100_000);
        // no deviation from a repeated identical sample
        assert_eq!(rtt.timeout(), Duration::from_micros(100_000));
    }

    #[test]
    fn zero_or_negative_samples_are_ignored() {
        let mut rtt = RttEstimator::new();
        rtt.update(0);
        assert_eq!(rtt.timeout(), Duration::from_micros(INITIAL_TIMEOUT_MICROS as u64));
    }

    #[test]
    fn backoff_multiplies_by_one_point_one_and_rounds_up() {
        let mut rtt = RttEstimator::new();
        rtt.backoff();
        assert_eq!(rtt.timeout(), Duration::from_micros(1_100_000));
        rtt.backoff();
        assert_eq!(rtt.timeout(), Duration::from_micros(1_210_000));
    }
}
