//! Congestion window controller: slow start, congestion avoidance, and the
//! reactions to fast retransmit and timeout loss.
//!
//! The window is counted in segments. Every adjustment is clipped to
//! `limit = min(snd_wnd, rmt_wnd)` supplied by the caller and never drops
//! below one segment.

use crate::protocol::constants;

#[derive(Debug, Clone)]
pub struct CongestionWindow {
    cwnd: u32,     // Congestion window
    ssthresh: u32, // Slow start threshold
    incr: u32,     // Byte accumulator for congestion avoidance
    mss: u32,
}

impl CongestionWindow {
    pub fn new(mss: u32) -> Self {
        Self {
            cwnd: 1,
            ssthresh: constants::IKCP_THRESH_INIT,
            incr: mss,
            mss,
        }
    }

    pub fn cwnd(&self) -> u32 {
        self.cwnd
    }

    pub fn ssthresh(&self) -> u32 {
        self.ssthresh
    }

    pub fn incr(&self) -> u32 {
        self.incr
    }

    pub fn in_slow_start(&self) -> bool {
        self.cwnd < self.ssthresh
    }

    pub fn set_mss(&mut self, mss: u32) {
        self.mss = mss;
        self.incr = self.cwnd.saturating_mul(mss);
    }

    /// Cumulative ACK moved forward: grow by one segment per RTT in slow
    /// start, by a fractional AIMD step in congestion avoidance.
    pub fn on_ack_progress(&mut self, limit: u32) {
        if self.cwnd >= limit {
            return;
        }

        let mss = self.mss.max(1) as u64;
        if self.cwnd < self.ssthresh {
            self.cwnd += 1;
            self.incr = self.incr.saturating_add(self.mss);
        } else {
            let mut incr = (self.incr as u64).max(mss);
            incr += (mss * mss) / incr + mss / 16;
            if (self.cwnd as u64 + 1) * mss <= incr {
                self.cwnd = incr.div_ceil(mss).min(u32::MAX as u64) as u32;
            }
            self.incr = incr.min(u32::MAX as u64) as u32;
        }

        self.clip(limit);
    }

    /// Fast retransmit fired: halve to the in-flight count, then inflate by
    /// the resend threshold.
    pub fn on_fast_retransmit(&mut self, inflight: u32, resend: u32, limit: u32) {
        self.ssthresh = (inflight / 2).max(constants::IKCP_THRESH_MIN);
        self.cwnd = self.ssthresh.saturating_add(resend);
        self.incr = self.cwnd.saturating_mul(self.mss);
        self.clip(limit);
    }

    /// Timeout loss: halve the threshold and restart slow start from one segment.
    pub fn on_loss(&mut self, window: u32, limit: u32) {
        self.ssthresh = (window / 2).max(constants::IKCP_THRESH_MIN);
        self.cwnd = 1;
        self.incr = self.mss;
        self.clip(limit);
    }

    /// Re-apply the limit after the peer shrinks its advertised window.
    pub fn clamp_to(&mut self, limit: u32) {
        self.clip(limit);
    }

    fn clip(&mut self, limit: u32) {
        if self.cwnd > limit {
            self.cwnd = limit;
            self.incr = limit.saturating_mul(self.mss);
        }
        if self.cwnd < 1 {
            self.cwnd = 1;
            self.incr = self.mss;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MSS: u32 = 1376;

    #[test]
    fn test_slow_start_then_avoidance() {
        let mut cc = CongestionWindow::new(MSS);
        assert_eq!(cc.cwnd(), 1);
        assert!(cc.in_slow_start());

        cc.on_ack_progress(32);
        assert_eq!(cc.cwnd(), 2);
        assert!(!cc.in_slow_start());

        // congestion avoidance needs roughly cwnd acks per extra segment
        let mut acks = 0;
        while cc.cwnd() == 2 {
            cc.on_ack_progress(32);
            acks += 1;
        }
        assert!(cc.cwnd() > 2);
        assert!(acks > 1);
    }

    #[test]
    fn test_growth_clipped_to_limit() {
        let mut cc = CongestionWindow::new(MSS);
        for _ in 0..1000 {
            cc.on_ack_progress(8);
            assert!(cc.cwnd() <= 8);
        }
        assert_eq!(cc.cwnd(), 8);
        cc.on_fast_retransmit(40, 2, 8);
        assert_eq!(cc.cwnd(), 8);
        cc.on_ack_progress(8);
        assert_eq!(cc.cwnd(), 8);
    }

    #[test]
    fn test_fast_retransmit_reaction() {
        let mut cc = CongestionWindow::new(MSS);
        cc.on_fast_retransmit(10, 2, 32);
        assert_eq!(cc.ssthresh(), 5);
        assert_eq!(cc.cwnd(), 7);
        assert_eq!(cc.incr(), 7 * MSS);

        cc.on_fast_retransmit(1, 2, 32);
        assert_eq!(cc.ssthresh(), constants::IKCP_THRESH_MIN);
        assert_eq!(cc.cwnd(), 4);
    }

    #[test]
    fn test_loss_restarts_slow_start() {
        let mut cc = CongestionWindow::new(MSS);
        cc.on_fast_retransmit(20, 2, 32);
        cc.on_loss(12, 32);
        assert_eq!(cc.cwnd(), 1);
        assert_eq!(cc.ssthresh(), 6);
        assert!(cc.in_slow_start());
    }

    #[test]
    fn test_zero_limit_keeps_one_segment() {
        let mut cc = CongestionWindow::new(MSS);
        cc.on_loss(0, 0);
        assert_eq!(cc.cwnd(), 1);
    }
}
