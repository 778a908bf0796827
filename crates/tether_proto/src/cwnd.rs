//! See [`CongestionControl`].

use core::time::Duration;

/// Slow-start / congestion-avoidance window, counted in datagrams.
///
/// The window starts at [`Config::initial_cwnd`] and grows by one datagram
/// per round trip while below the slow-start threshold, then by `1 / cwnd`
/// per acknowledged datagram. A retransmission timeout halves the window
/// (and the threshold) down to a floor of one datagram.
///
/// The scheduler may only put a datagram on the wire while
/// [`CongestionControl::can_send`], and no sooner than the pacing interval
/// derived from `cwnd / srtt`.
///
/// [`Config::initial_cwnd`]: crate::conn::Config::initial_cwnd
#[derive(Debug, Clone)]
pub struct CongestionControl {
    /// Congestion window, scaled by [`Self::SCALE`] so that the `1 / cwnd`
    /// growth in congestion avoidance needs no floating point.
    cwnd_scaled: u64,
    ssthresh: u64,
    in_flight: usize,
}

impl CongestionControl {
    const SCALE: u64 = 1024;

    /// Creates a new window.
    #[must_use]
    pub fn new(initial_cwnd: u32, ssthresh: u32) -> Self {
        Self {
            cwnd_scaled: u64::from(initial_cwnd.max(1)) * Self::SCALE,
            ssthresh: u64::from(ssthresh.max(1)) * Self::SCALE,
            in_flight: 0,
        }
    }

    /// Gets the current window size in whole datagrams.
    #[must_use]
    pub fn window(&self) -> usize {
        usize::try_from(self.cwnd_scaled / Self::SCALE).unwrap_or(usize::MAX)
    }

    /// Gets the number of datagrams currently in flight.
    #[must_use]
    pub const fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Gets whether another datagram may be put on the wire.
    #[must_use]
    pub fn can_send(&self) -> bool {
        self.in_flight < self.window()
    }

    /// Records a reliable datagram entering the sent-not-acked table.
    pub fn on_sent(&mut self) {
        self.in_flight += 1;
    }

    /// Records a sent datagram leaving the table because the peer
    /// acknowledged it.
    pub fn on_ack(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
        if self.cwnd_scaled < self.ssthresh {
            // slow start: +1 datagram per ack, doubling per round trip
            self.cwnd_scaled += Self::SCALE;
        } else {
            // congestion avoidance: +1/cwnd per ack, +1 per round trip
            let cwnd = (self.cwnd_scaled / Self::SCALE).max(1);
            self.cwnd_scaled += Self::SCALE / cwnd;
        }
    }

    /// Records a sent datagram leaving the table because its retransmission
    /// timer fired.
    pub fn on_loss(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.cwnd_scaled = (self.cwnd_scaled / 2).max(Self::SCALE);
        self.ssthresh = self.cwnd_scaled;
    }

    /// Gets the minimum interval between two datagram sends, derived from
    /// `cwnd / srtt`.
    ///
    /// # Examples
    ///
    /// ```
    /// # use {tether_proto::cwnd::CongestionControl, core::time::Duration};
    /// let cwnd = CongestionControl::new(10, 64);
    /// // 10 datagrams per 100 ms round trip = one every 10 ms
    /// assert_eq!(
    ///     Duration::from_millis(10),
    ///     cwnd.pacing_interval(Duration::from_millis(100)),
    /// );
    /// ```
    #[must_use]
    pub fn pacing_interval(&self, srtt: Duration) -> Duration {
        let window = u32::try_from(self.window()).unwrap_or(u32::MAX).max(1);
        srtt / window
    }
}
