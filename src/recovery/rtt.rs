//! RTT estimation and PTO computation (RFC 9002 Sections 5-6).
//!
//! All arithmetic is integer millisecond math; the 7/8-1/8 and 3/4-1/4
//! EWMA weights are expressed as `(a*7 + b) / 8` and `(a*3 + b) / 4`.

use core::time::Duration;

/// Smoothed RTT state for a connection (one estimator across all packet
/// number spaces).
#[derive(Debug, Clone)]
pub struct RttEstimator {
    latest: Duration,
    min: Option<Duration>,
    smoothed: Duration,
    rttvar: Duration,
}

impl RttEstimator {
    /// Before the first sample the estimator carries the configured
    /// initial RTT (RFC 9002 Section 6.2.2).
    pub fn new(initial_rtt: Duration) -> Self {
        Self {
            latest: Duration::ZERO,
            min: None,
            smoothed: initial_rtt,
            rttvar: initial_rtt / 2,
        }
    }

    /// Record an RTT sample (RFC 9002 Section 5.3).
    ///
    /// `ack_delay` is already decoded and capped by the caller; it is
    /// zero outside the Application space.
    pub fn sample(&mut self, latest: Duration, ack_delay: Duration) {
        self.latest = latest;

        match self.min {
            None => {
                self.min = Some(latest);
                self.smoothed = latest;
                self.rttvar = latest / 2;
            }
            Some(min) => {
                let min = min.min(latest);
                self.min = Some(min);

                let adjusted = if min + ack_delay < latest {
                    latest - ack_delay
                } else {
                    latest
                };

                self.smoothed = (self.smoothed * 7 + adjusted) / 8;
                let rttvar_sample = if self.smoothed > adjusted {
                    self.smoothed - adjusted
                } else {
                    adjusted - self.smoothed
                };
                self.rttvar = (self.rttvar * 3 + rttvar_sample) / 4;
            }
        }
    }

    pub fn latest(&self) -> Duration {
        self.latest
    }

    pub fn smoothed(&self) -> Duration {
        self.smoothed
    }

    pub fn rttvar(&self) -> Duration {
        self.rttvar
    }

    pub fn min(&self) -> Option<Duration> {
        self.min
    }

    /// Whether any sample has been taken yet.
    pub fn has_sample(&self) -> bool {
        self.min.is_some()
    }

    /// Probe timeout (RFC 9002 Section 6.2.1), backed off by `pto_count`.
    ///
    /// `max_ack_delay` is added (also backed off) only when computing the
    /// Application-space PTO after handshake confirmation with packets in
    /// flight; the caller passes `None` otherwise.
    pub fn pto(
        &self,
        pto_count: u32,
        max_ack_delay: Option<Duration>,
        granularity: Duration,
    ) -> Duration {
        let backoff = 1u32 << pto_count.min(16);

        let mut duration = self.smoothed + (self.rttvar * 4).max(granularity);
        duration *= backoff;

        if let Some(mad) = max_ack_delay {
            duration += mad * backoff;
        }

        duration
    }

    /// The time-threshold loss deadline: 9/8 of the greater of the
    /// latest and smoothed RTT, floored at `granularity`
    /// (RFC 9002 Section 6.1.2).
    pub fn loss_threshold(&self, granularity: Duration) -> Duration {
        let rtt = self.latest.max(self.smoothed);
        (rtt * crate::types::TIME_THRESHOLD_NUM / crate::types::TIME_THRESHOLD_DEN)
            .max(granularity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn test_first_sample_initializes() {
        let mut rtt = RttEstimator::new(333 * MS);
        assert!(!rtt.has_sample());

        rtt.sample(100 * MS, Duration::ZERO);

        assert_eq!(rtt.smoothed(), 100 * MS);
        assert_eq!(rtt.rttvar(), 50 * MS);
        assert_eq!(rtt.min(), Some(100 * MS));
        assert!(rtt.has_sample());
    }

    #[test]
    fn test_ewma_weights() {
        let mut rtt = RttEstimator::new(333 * MS);
        rtt.sample(100 * MS, Duration::ZERO);
        rtt.sample(120 * MS, Duration::ZERO);

        // smoothed = (100*7 + 120) / 8 = 102.5ms
        assert_eq!(rtt.smoothed(), Duration::from_micros(102_500));
        // rttvar = (50*3 + |102.5 - 120|) / 4 = (150 + 17.5) / 4
        assert_eq!(rtt.rttvar(), Duration::from_micros(41_875));
        assert_eq!(rtt.min(), Some(100 * MS));
    }

    #[test]
    fn test_ack_delay_adjustment() {
        let mut rtt = RttEstimator::new(333 * MS);
        rtt.sample(100 * MS, Duration::ZERO);

        // min (100) + delay (20) < latest (150): delay subtracted
        rtt.sample(150 * MS, 20 * MS);
        assert_eq!(rtt.smoothed(), (100 * 7 * MS + 130 * MS) / 8);

        // delay would push adjusted below min: used as-is
        let before = rtt.smoothed();
        rtt.sample(101 * MS, 50 * MS);
        let expected = (before * 7 + 101 * MS) / 8;
        assert_eq!(rtt.smoothed(), expected);
    }

    #[test]
    fn test_min_tracks_floor() {
        let mut rtt = RttEstimator::new(333 * MS);
        rtt.sample(100 * MS, Duration::ZERO);
        rtt.sample(50 * MS, Duration::ZERO);
        rtt.sample(80 * MS, Duration::ZERO);
        assert_eq!(rtt.min(), Some(50 * MS));
    }

    #[test]
    fn test_pto_formula() {
        let mut rtt = RttEstimator::new(100 * MS);
        rtt.sample(100 * MS, Duration::ZERO);
        // smoothed=100, rttvar=50: pto = 100 + max(200, 1) = 300

        assert_eq!(rtt.pto(0, None, MS), 300 * MS);
        assert_eq!(rtt.pto(1, None, MS), 600 * MS);
        assert_eq!(rtt.pto(2, None, MS), 1200 * MS);

        // Application space after handshake: + max_ack_delay << count
        assert_eq!(rtt.pto(0, Some(25 * MS), MS), 325 * MS);
        assert_eq!(rtt.pto(1, Some(25 * MS), MS), 650 * MS);
    }

    #[test]
    fn test_pto_granularity_floor() {
        let mut rtt = RttEstimator::new(MS);
        rtt.sample(Duration::from_micros(100), Duration::ZERO);
        assert!(rtt.pto(0, None, MS) >= MS);
    }

    #[test]
    fn test_loss_threshold() {
        let mut rtt = RttEstimator::new(100 * MS);
        rtt.sample(80 * MS, Duration::ZERO);
        rtt.sample(80 * MS, Duration::ZERO);

        // 9/8 of max(latest, smoothed)
        let thr = rtt.loss_threshold(MS);
        assert!(thr >= 80 * MS * 9 / 8);

        // floored at granularity
        let mut tiny = RttEstimator::new(MS);
        tiny.sample(Duration::from_micros(10), Duration::ZERO);
        assert_eq!(tiny.loss_threshold(MS), MS);
    }
}
