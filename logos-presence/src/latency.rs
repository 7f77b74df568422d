//! Signal delivery latency estimate and remote clock correction.
//!
//! Only local echoes (our own signals looped back by the transport) feed the
//! estimate. Clocks are never synchronised explicitly: each receiver corrects
//! remote timestamps by the skew computed for the message that carried them.
//!
//! Reference: Cristian, "Probabilistic Clock Synchronization" (1989)

/// Default cap on the number of samples in the running average.
pub const DEFAULT_MAX_SAMPLES: u32 = 256;

/// Count-weighted running average of one-way signal delivery time.
#[derive(Debug, Clone)]
pub struct LatencyTracker {
    average_latency: f64,
    samples: u32,
    max_samples: u32,
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SAMPLES)
    }
}

impl LatencyTracker {
    pub fn new(max_samples: u32) -> Self {
        Self {
            average_latency: 0.0,
            samples: 0,
            max_samples: max_samples.max(1),
        }
    }

    /// Fold in the delivery time of a looped-back local signal.
    ///
    /// Once the sample count reaches the cap, every new sample keeps the same
    /// weight so old samples decay instead of dominating.
    pub fn record_round_trip(&mut self, send_timestamp: i64, receive_timestamp: i64) {
        let delta = receive_timestamp.saturating_sub(send_timestamp) as f64;
        self.samples = (self.samples + 1).min(self.max_samples);
        let n = f64::from(self.samples);
        self.average_latency = (self.average_latency * (n - 1.0) + delta) / n;
    }

    /// Offset to add to a remote timestamp so it reads in local wall-clock
    /// terms: `received - (local_avg + sender_avg + sender_send_timestamp)`.
    pub fn clock_skew(&self, received: i64, sender_avg_latency: f64, sender_send_timestamp: i64) -> i64 {
        let expected = self.average_latency + sender_avg_latency + sender_send_timestamp as f64;
        (received as f64 - expected).round() as i64
    }

    pub fn average_latency(&self) -> f64 {
        self.average_latency
    }

    pub fn samples(&self) -> u32 {
        self.samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sample_sets_average() {
        let mut tracker = LatencyTracker::default();
        tracker.record_round_trip(1_000, 1_040);
        assert_eq!(tracker.average_latency(), 40.0);
        assert_eq!(tracker.samples(), 1);
    }

    #[test]
    fn test_constant_delta_converges() {
        let mut tracker = LatencyTracker::default();
        for i in 0..300 {
            tracker.record_round_trip(i * 100, i * 100 + 17);
        }
        assert!((tracker.average_latency() - 17.0).abs() < 1e-9);
        assert_eq!(tracker.samples(), 256);
    }

    #[test]
    fn test_capped_samples_keep_adapting() {
        let mut tracker = LatencyTracker::new(4);
        for _ in 0..10 {
            tracker.record_round_trip(0, 10);
        }
        tracker.record_round_trip(0, 50);
        // (10 * 3 + 50) / 4
        assert!((tracker.average_latency() - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_clock_skew_formula() {
        let mut tracker = LatencyTracker::default();
        tracker.record_round_trip(0, 10);
        // Sender clock runs 500ms ahead; both sides see ~10ms delivery.
        let skew = tracker.clock_skew(1_000, 10.0, 1_480);
        assert_eq!(skew, 1_000 - (10 + 10 + 1_480));
    }

    #[test]
    fn test_clock_skew_zero_without_offset() {
        let tracker = LatencyTracker::default();
        assert_eq!(tracker.clock_skew(2_000, 0.0, 2_000), 0);
    }

    #[test]
    fn test_extreme_timestamps_do_not_overflow() {
        let mut tracker = LatencyTracker::default();
        tracker.record_round_trip(i64::MIN, i64::MAX);
        assert_eq!(tracker.samples(), 1);
        assert!(tracker.clock_skew(0, 0.0, -9_000_000_000_000_000_000) > 0);
    }
}
