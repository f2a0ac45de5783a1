//! Smoothed RTT estimation and adaptive retransmission timeout

use crate::protocol::constants;

/// RTT calculation state
#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt: u32,   // Smoothed RTT
    rttval: u32, // RTT variance
    rto: u32,    // Retransmission timeout
    min_rto: u32,
}

impl RttEstimator {
    pub fn new(min_rto: u32) -> Self {
        Self {
            srtt: 0,
            rttval: 0,
            rto: constants::IKCP_RTO_DEF,
            min_rto: min_rto.min(constants::IKCP_RTO_MAX),
        }
    }

    /// Feed one RTT sample; returns the new RTO, always within `[min_rto, RTO_MAX]`.
    pub fn observe(&mut self, rtt: u32, interval: u32) -> u32 {
        if self.srtt == 0 {
            self.srtt = rtt;
            self.rttval = rtt / 2;
        } else {
            let delta = rtt.abs_diff(self.srtt);
            self.rttval = ((3 * self.rttval as u64 + delta as u64) / 4) as u32;
            self.srtt = ((7 * self.srtt as u64 + rtt as u64) / 8) as u32;
            if self.srtt < 1 {
                self.srtt = 1;
            }
        }

        let rto = self
            .srtt
            .saturating_add(interval.max(self.rttval.saturating_mul(4)));
        self.rto = rto.clamp(self.min_rto, constants::IKCP_RTO_MAX);
        self.rto
    }

    pub fn rto(&self) -> u32 {
        self.rto
    }

    pub fn srtt(&self) -> u32 {
        self.srtt
    }

    pub fn rttval(&self) -> u32 {
        self.rttval
    }

    pub fn min_rto(&self) -> u32 {
        self.min_rto
    }

    pub fn set_min_rto(&mut self, min_rto: u32) {
        self.min_rto = min_rto.min(constants::IKCP_RTO_MAX);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sample_seeds_estimate() {
        let mut rtt = RttEstimator::new(constants::IKCP_RTO_MIN);
        let rto = rtt.observe(80, 10);
        assert_eq!(rtt.srtt(), 80);
        assert_eq!(rtt.rttval(), 40);
        assert_eq!(rto, 80 + 160);
    }

    #[test]
    fn test_smoothing() {
        let mut rtt = RttEstimator::new(constants::IKCP_RTO_NDL);
        rtt.observe(100, 10);
        rtt.observe(60, 10);
        // rttval = (3*50 + 40)/4, srtt = (7*100 + 60)/8
        assert_eq!(rtt.rttval(), 47);
        assert_eq!(rtt.srtt(), 95);
        assert_eq!(rtt.rto(), 95 + 188);
    }

    #[test]
    fn test_rto_bounds() {
        let mut rtt = RttEstimator::new(constants::IKCP_RTO_MIN);
        for sample in [0, 1, 3, 250_000, 5, 0, 70_000, 2] {
            let rto = rtt.observe(sample, 100);
            assert!(rto >= constants::IKCP_RTO_MIN);
            assert!(rto <= constants::IKCP_RTO_MAX);
        }
    }

    #[test]
    fn test_min_rto_never_exceeds_max() {
        let mut rtt = RttEstimator::new(u32::MAX);
        assert_eq!(rtt.min_rto(), constants::IKCP_RTO_MAX);
        assert_eq!(rtt.observe(1, 10), constants::IKCP_RTO_MAX);
        rtt.set_min_rto(5);
        assert_eq!(rtt.observe(1, 1), 5);
    }
}
