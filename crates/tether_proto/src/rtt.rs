//! See [`RttEstimator`].

use core::time::Duration;

/// Default initial RTT to use before any samples have been taken.
pub const DEFAULT_INITIAL_RTT: Duration = Duration::from_millis(333);

/// Lower bound on the retransmission timeout.
pub const MIN_RTO: Duration = Duration::from_millis(200);

/// Upper bound on the retransmission timeout.
pub const MAX_RTO: Duration = Duration::from_secs(3);

/// Computes an RTT estimation for a network path using standard
/// Jacobson/Karels smoothing.
///
/// Samples must only be taken from datagrams which were never retransmitted
/// (Karn's rule); the caller is responsible for filtering those out.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    latest: Duration,
    smoothed: Duration,
    var: Duration,
}

impl RttEstimator {
    /// Creates a new estimator from a given initial RTT.
    #[must_use]
    pub fn new(initial_rtt: Duration) -> Self {
        Self {
            latest: initial_rtt,
            smoothed: initial_rtt,
            var: initial_rtt / 2,
        }
    }

    /// Gets the current best RTT estimation.
    #[must_use]
    pub const fn get(&self) -> Duration {
        self.smoothed
    }

    /// Gets the most recent RTT sample.
    #[must_use]
    pub const fn latest(&self) -> Duration {
        self.latest
    }

    /// Gets the current smoothed RTT deviation.
    #[must_use]
    pub const fn var(&self) -> Duration {
        self.var
    }

    /// Computes the retransmission timeout `srtt + 4 * rttvar`, clamped to
    /// `[`[`MIN_RTO`]`, `[`MAX_RTO`]`]`.
    ///
    /// # Examples
    ///
    /// ```
    /// # use {tether_proto::rtt::RttEstimator, core::time::Duration};
    /// let rtt = RttEstimator::new(Duration::from_millis(400));
    /// // 400 + 4 * 200 = 1200
    /// assert_eq!(Duration::from_millis(1200), rtt.rto());
    ///
    /// let rtt = RttEstimator::new(Duration::from_millis(1));
    /// assert_eq!(Duration::from_millis(200), rtt.rto());
    ///
    /// let rtt = RttEstimator::new(Duration::from_secs(10));
    /// assert_eq!(Duration::from_secs(3), rtt.rto());
    /// ```
    #[must_use]
    pub fn rto(&self) -> Duration {
        (self.smoothed + self.var * 4).clamp(MIN_RTO, MAX_RTO)
    }

    /// Adds an RTT sample to this estimation.
    ///
    /// `srtt <- 7/8 srtt + 1/8 sample`, `rttvar <- 3/4 rttvar + 1/4 |sample
    /// - srtt|`.
    pub fn update(&mut self, rtt: Duration) {
        self.latest = rtt;

        let var_sample = if self.smoothed > rtt {
            self.smoothed - rtt
        } else {
            rtt - self.smoothed
        };
        self.var = (3 * self.var + var_sample) / 4;
        self.smoothed = (7 * self.smoothed + rtt) / 8;
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_RTT)
    }
}
