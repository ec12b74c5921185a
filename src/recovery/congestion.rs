//! NewReno-style congestion control (RFC 9002 Section 7).
//!
//! Window credit and loss reactions are attributed per packet via the
//! `plen` recorded on the first frame of each sent packet. Packets sent
//! before the current recovery epoch neither grow nor shrink the window.

use std::time::Instant;

use tracing::debug;

/// Initial window: min(10 * max_datagram_size, max(2 * max_datagram_size,
/// 14720)) per RFC 9002 Section 7.2.
fn initial_window(max_udp_payload: usize) -> usize {
    (10 * max_udp_payload).min((2 * max_udp_payload).max(14720))
}

pub struct Congestion {
    /// Congestion window in bytes.
    pub window: usize,

    /// Slow start threshold; `usize::MAX` until the first loss.
    pub ssthresh: usize,

    /// Start of the current recovery epoch.
    recovery_start: Instant,

    /// Sum of `plen` over all in-flight packets.
    pub in_flight: usize,

    max_udp_payload: usize,
}

impl Congestion {
    pub fn new(max_udp_payload: usize, now: Instant) -> Self {
        Self {
            window: initial_window(max_udp_payload),
            ssthresh: usize::MAX,
            recovery_start: now,
            in_flight: 0,
            max_udp_payload,
        }
    }

    /// Account an ack-eliciting packet entering the network.
    pub fn on_sent(&mut self, bytes: usize) {
        self.in_flight += bytes;
    }

    /// Whether `extra` more ack-eliciting bytes fit in the window.
    pub fn fits(&self, extra: usize) -> bool {
        self.in_flight + extra <= self.window
    }

    /// Credit an acknowledged packet. `sent` is the packet's send time,
    /// `plen` its in-flight contribution (0 for every frame but the
    /// packet's first).
    pub fn ack(&mut self, plen: usize, sent: Instant) {
        if plen == 0 {
            return;
        }

        self.in_flight = self.in_flight.saturating_sub(plen);

        if sent <= self.recovery_start {
            debug!(
                window = self.window,
                in_flight = self.in_flight,
                "congestion ack in recovery"
            );
            return;
        }

        if self.window < self.ssthresh {
            self.window += plen;
            debug!(window = self.window, in_flight = self.in_flight, "slow start");
        } else {
            self.window += self.max_udp_payload * plen / self.window;
            debug!(
                window = self.window,
                in_flight = self.in_flight,
                "congestion avoidance"
            );
        }
    }

    /// React to a lost packet: halve the window and open a new recovery
    /// epoch, unless the loss predates the current one.
    pub fn lost(&mut self, plen: usize, sent: Instant, now: Instant) {
        if plen == 0 {
            return;
        }

        self.in_flight = self.in_flight.saturating_sub(plen);

        if sent <= self.recovery_start {
            return;
        }

        self.recovery_start = now;
        self.window = (self.window / 2).max(2 * self.max_udp_payload);
        self.ssthresh = self.window;

        debug!(
            window = self.window,
            ssthresh = self.ssthresh,
            in_flight = self.in_flight,
            "congestion loss"
        );
    }

    /// Remove a packet's bytes without window consequences; used when a
    /// space is discarded wholesale (RFC 9002 Section 6.4).
    pub fn forget(&mut self, plen: usize) {
        self.in_flight = self.in_flight.saturating_sub(plen);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;

    const MTU: usize = 1200;

    #[test]
    fn test_initial_window() {
        // 10 * 1200 = 12000 < max(2400, 14720)
        assert_eq!(initial_window(1200), 12000);
        // large MTU capped by 10x rule
        assert_eq!(initial_window(65527), 14720.max(2 * 65527).min(655270));
    }

    #[test]
    fn test_slow_start_growth() {
        let t0 = Instant::now();
        let mut cg = Congestion::new(MTU, t0);
        let w0 = cg.window;

        cg.on_sent(1000);
        cg.ack(1000, t0 + Duration::from_millis(10));

        assert_eq!(cg.window, w0 + 1000);
        assert_eq!(cg.in_flight, 0);
    }

    #[test]
    fn test_loss_halves_and_floors() {
        let t0 = Instant::now();
        let mut cg = Congestion::new(MTU, t0);

        cg.on_sent(1200);
        cg.lost(1200, t0 + Duration::from_millis(5), t0 + Duration::from_millis(50));

        assert_eq!(cg.window, initial_window(MTU) / 2);
        assert_eq!(cg.ssthresh, cg.window);

        // repeated losses floor at 2 * MTU
        for i in 0..10 {
            let sent = t0 + Duration::from_millis(100 + i * 10);
            let now = sent + Duration::from_millis(5);
            cg.on_sent(1200);
            cg.lost(1200, sent, now);
        }
        assert_eq!(cg.window, 2 * MTU);
    }

    #[test]
    fn test_recovery_epoch_suppresses_reaction() {
        let t0 = Instant::now();
        let mut cg = Congestion::new(MTU, t0);

        cg.on_sent(1200);
        cg.lost(1200, t0 + Duration::from_millis(10), t0 + Duration::from_millis(20));
        let w = cg.window;

        // both sent before recovery_start (t0+20): no further reaction
        cg.on_sent(1200);
        cg.lost(1200, t0 + Duration::from_millis(15), t0 + Duration::from_millis(30));
        assert_eq!(cg.window, w);

        cg.on_sent(800);
        cg.ack(800, t0 + Duration::from_millis(18));
        assert_eq!(cg.window, w);
        assert_eq!(cg.in_flight, 0);
    }

    #[test]
    fn test_congestion_avoidance_growth() {
        let t0 = Instant::now();
        let mut cg = Congestion::new(MTU, t0);

        cg.on_sent(1200);
        cg.lost(1200, t0 + Duration::from_millis(10), t0 + Duration::from_millis(20));
        let w = cg.window;
        assert!(cg.ssthresh <= w);

        // post-recovery ack grows additively, not by plen
        cg.on_sent(1200);
        cg.ack(1200, t0 + Duration::from_millis(100));
        assert_eq!(cg.window, w + MTU * 1200 / w);
    }

    #[test]
    fn test_fits() {
        let t0 = Instant::now();
        let mut cg = Congestion::new(MTU, t0);
        assert!(cg.fits(cg.window));
        cg.on_sent(cg.window - 100);
        assert!(cg.fits(100));
        assert!(!cg.fits(101));
    }
}
