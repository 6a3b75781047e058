//! Congestion control for the TCP socket.
//!
//! Only Reno (slow start + additive increase / multiplicative decrease,
//! [RFC 5681]) is implemented; it is the one algorithm every peer is
//! guaranteed to interoperate with, and it is what this stack negotiates
//! regardless of what the remote end advertises.
//!
//! [RFC 5681]: https://tools.ietf.org/html/rfc5681

/// A congestion control algorithm.
pub(crate) trait Controller {
    /// Record that an ACK was received that acknowledged `ack_len` new octets of data,
    /// out of a total in-flight window of `cwnd_max` controlled by the remote's advertised
    /// receive window.
    fn on_ack(&mut self, now: crate::time::Instant, len: usize, rtt: &RttEstimate);

    /// Record that a retransmission timeout fired, or that duplicate ACKs
    /// triggered a fast retransmit.
    fn on_retransmit(&mut self, now: crate::time::Instant);

    /// Record a duplicate ACK; used to trigger fast retransmit/recovery once a
    /// threshold of duplicates is reached.
    fn on_duplicate_ack(&mut self, now: crate::time::Instant) -> bool;

    /// The current congestion window, in octets.
    fn window(&self) -> usize;

    /// Called once per received segment regardless of whether it advanced the
    /// send window, to let time-based controllers update their idea of "now".
    fn set_mss(&mut self, mss: usize);
}

/// The subset of round-trip time information a congestion controller needs;
/// kept separate from [`super::RttEstimator`] so this module has no private
/// access to the rest of the socket.
pub(crate) struct RttEstimate {
    pub rtt: crate::time::Duration,
}

const DUP_ACK_THRESHOLD: u8 = 3;

/// Reno congestion control, as specified by RFC 5681.
#[derive(Debug, Clone)]
pub(crate) struct Reno {
    /// Congestion window, in octets.
    cwnd: usize,
    /// Slow start threshold, in octets.
    ssthresh: usize,
    /// Maximum segment size currently negotiated with the remote.
    mss: usize,
    /// Number of consecutive duplicate ACKs seen since the last new ACK.
    dup_acks: u8,
    /// Whether we are in fast recovery, and the cwnd to restore once it ends.
    in_recovery: bool,
    /// Set by `on_retransmit`, cleared by the next `on_ack`: whether slow
    /// start should grow by one MSS (just after an RTO) rather than two
    /// (RFC 3465).
    rto_pending: bool,
}

impl Reno {
    pub(crate) fn new() -> Self {
        Reno {
            // RFC 5681 initial window: min(4*MSS, max(2*MSS, 4380 bytes)). We don't
            // know MSS yet at construction time, so seed conservatively and let
            // `set_mss` correct it once the handshake completes.
            cwnd: 2 * 536,
            ssthresh: usize::MAX,
            mss: 536,
            dup_acks: 0,
            in_recovery: false,
            rto_pending: false,
        }
    }
}

impl Controller for Reno {
    fn on_ack(&mut self, _now: crate::time::Instant, ack_len: usize, _rtt: &RttEstimate) {
        if ack_len == 0 {
            return;
        }

        if self.in_recovery {
            // Fast recovery ends on the first new-data ACK: restore cwnd to
            // ssthresh rather than leaving it inflated by the dup-ack bump
            // (section 4.7.2 step 3).
            self.cwnd = self.ssthresh;
        }
        self.dup_acks = 0;
        self.in_recovery = false;

        if self.cwnd < self.ssthresh {
            // Slow start (RFC 3465): up to k*MSS of growth per ACKed
            // segment, k=1 just after an RTO, 2 otherwise.
            let k = if self.rto_pending { 1 } else { 2 };
            self.cwnd += ack_len.min(k * self.mss);
        } else {
            // Congestion avoidance: roughly one MSS of growth per RTT.
            self.cwnd += (self.mss * ack_len) / self.cwnd.max(1);
        }
        self.rto_pending = false;
    }

    fn on_retransmit(&mut self, _now: crate::time::Instant) {
        self.ssthresh = (self.cwnd / 2).max(2 * self.mss);
        self.cwnd = self.mss;
        self.dup_acks = 0;
        self.in_recovery = false;
        self.rto_pending = true;
    }

    fn on_duplicate_ack(&mut self, _now: crate::time::Instant) -> bool {
        self.dup_acks = self.dup_acks.saturating_add(1);
        if self.dup_acks == DUP_ACK_THRESHOLD && !self.in_recovery {
            // Fast retransmit / fast recovery.
            self.ssthresh = (self.cwnd / 2).max(2 * self.mss);
            self.cwnd = self.ssthresh + DUP_ACK_THRESHOLD as usize * self.mss;
            self.in_recovery = true;
            return true;
        }
        if self.in_recovery {
            // Each further duplicate inflates the window by one segment.
            self.cwnd += self.mss;
        }
        false
    }

    fn window(&self) -> usize {
        self.cwnd
    }

    fn set_mss(&mut self, mss: usize) {
        if mss == 0 {
            return;
        }
        if self.mss != mss {
            self.mss = mss;
            // RFC 3390/5681 initial window, per section 4.7.1:
            // min(4*MSS, max(2*MSS, 4380 bytes)).
            self.cwnd = (4 * mss).min((2 * mss).max(4380));
        }
    }
}

/// A congestion controller that never restricts the send window, used when
/// congestion control is disabled.
#[derive(Debug, Clone, Default)]
pub(crate) struct Nop;

impl Controller for Nop {
    fn on_ack(&mut self, _now: crate::time::Instant, _len: usize, _rtt: &RttEstimate) {}
    fn on_retransmit(&mut self, _now: crate::time::Instant) {}
    fn on_duplicate_ack(&mut self, _now: crate::time::Instant) -> bool {
        false
    }
    fn window(&self) -> usize {
        usize::MAX
    }
    fn set_mss(&mut self, _mss: usize) {}
}

/// The congestion controller in use by a socket, chosen at construction time.
#[derive(Debug, Clone)]
pub(crate) enum AnyController {
    Reno(Reno),
    Nop(Nop),
}

impl AnyController {
    pub(crate) fn new() -> Self {
        AnyController::Reno(Reno::new())
    }
}

impl Controller for AnyController {
    fn on_ack(&mut self, now: crate::time::Instant, len: usize, rtt: &RttEstimate) {
        match self {
            AnyController::Reno(c) => c.on_ack(now, len, rtt),
            AnyController::Nop(c) => c.on_ack(now, len, rtt),
        }
    }

    fn on_retransmit(&mut self, now: crate::time::Instant) {
        match self {
            AnyController::Reno(c) => c.on_retransmit(now),
            AnyController::Nop(c) => c.on_retransmit(now),
        }
    }

    fn on_duplicate_ack(&mut self, now: crate::time::Instant) -> bool {
        match self {
            AnyController::Reno(c) => c.on_duplicate_ack(now),
            AnyController::Nop(c) => c.on_duplicate_ack(now),
        }
    }

    fn window(&self) -> usize {
        match self {
            AnyController::Reno(c) => c.window(),
            AnyController::Nop(c) => c.window(),
        }
    }

    fn set_mss(&mut self, mss: usize) {
        match self {
            AnyController::Reno(c) => c.set_mss(mss),
            AnyController::Nop(c) => c.set_mss(mss),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::{Duration, Instant};

    fn rtt() -> RttEstimate {
        RttEstimate {
            rtt: Duration::from_millis(100),
        }
    }

    #[test]
    fn slow_start_doubles_window_per_round_trip() {
        let mut reno = Reno::new();
        reno.set_mss(1460);
        let before = reno.window();
        // Acking a full window's worth of segments in slow start should
        // roughly double cwnd (one MSS of growth per ACKed segment).
        for _ in 0..(before / 1460).max(1) {
            reno.on_ack(Instant::ZERO, 1460, &rtt());
        }
        assert!(reno.window() > before);
    }

    #[test]
    fn three_duplicate_acks_trigger_fast_retransmit() {
        let mut reno = Reno::new();
        reno.set_mss(1460);
        assert!(!reno.on_duplicate_ack(Instant::ZERO));
        assert!(!reno.on_duplicate_ack(Instant::ZERO));
        assert!(reno.on_duplicate_ack(Instant::ZERO));
    }

    #[test]
    fn retransmit_halves_ssthresh_and_resets_cwnd() {
        let mut reno = Reno::new();
        reno.set_mss(1460);
        reno.cwnd = 40000;
        reno.on_retransmit(Instant::ZERO);
        assert_eq!(reno.ssthresh, 20000);
        assert_eq!(reno.cwnd, reno.mss);
    }

    #[test]
    fn initial_window_follows_min_max_formula() {
        // section 4.7.1: min(4*mss, max(2*mss, 4380)).
        let mut reno = Reno::new();
        reno.set_mss(1460);
        assert_eq!(reno.cwnd, 4380);

        // For a large MSS, 4*mss is the binding term instead of 4380.
        let mut reno = Reno::new();
        reno.set_mss(2000);
        assert_eq!(reno.cwnd, 8000);
    }

    #[test]
    fn fast_recovery_restores_ssthresh_on_exit() {
        let mut reno = Reno::new();
        reno.set_mss(1460);
        reno.cwnd = 4380;
        reno.on_duplicate_ack(Instant::ZERO);
        reno.on_duplicate_ack(Instant::ZERO);
        assert!(reno.on_duplicate_ack(Instant::ZERO));
        assert_eq!(reno.cwnd, 2920 + 3 * 1460);

        // The next new-data ACK ends fast recovery: cwnd must drop back to
        // ssthresh, not stay inflated at ssthresh + 3*mss forever.
        reno.on_ack(Instant::ZERO, 1, &rtt());
        assert_eq!(reno.cwnd, reno.ssthresh);
    }

    #[test]
    fn slow_start_after_rto_caps_growth_at_one_mss_then_two() {
        let mut reno = Reno::new();
        reno.mss = 1000;
        reno.ssthresh = 10000;
        reno.cwnd = 1000;
        reno.rto_pending = true;

        // Just after an RTO, growth is capped at one MSS (k=1) even though
        // the ACK covers more than that.
        reno.on_ack(Instant::ZERO, 1500, &rtt());
        assert_eq!(reno.cwnd, 1000 + 1000);

        // The following ACK is no longer "just after an RTO": growth is
        // capped at two MSS instead (RFC 3465).
        reno.on_ack(Instant::ZERO, 1500, &rtt());
        assert_eq!(reno.cwnd, 2000 + 1500);
    }
}
