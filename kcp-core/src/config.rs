//! Configuration types for the KCP core protocol engine

use crate::error::{KcpCoreError, KcpCoreResult};
use crate::protocol::constants;

/// Node delay configuration for different performance modes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDelayConfig {
    /// Enable no-delay mode (lower min RTO, gentler backoff)
    pub nodelay: bool,
    /// Internal update interval in milliseconds
    pub interval: u32,
    /// Fast resend threshold (0 disables fast resend)
    pub resend: u32,
    /// Disable congestion control
    pub no_congestion_control: bool,
}

impl NodeDelayConfig {
    /// Normal mode - balanced performance and reliability
    pub fn normal() -> Self {
        Self {
            nodelay: false,
            interval: 40,
            resend: 0,
            no_congestion_control: false,
        }
    }

    /// Fast mode - optimized for low latency
    pub fn fast() -> Self {
        Self {
            nodelay: true,
            interval: 10,
            resend: 2,
            no_congestion_control: false,
        }
    }

    /// Turbo mode - maximum performance, minimum latency
    pub fn turbo() -> Self {
        Self {
            nodelay: true,
            interval: 10,
            resend: 1,
            no_congestion_control: true,
        }
    }

    /// Custom configuration
    pub fn custom(nodelay: bool, interval: u32, resend: u32, no_congestion_control: bool) -> Self {
        Self {
            nodelay,
            interval,
            resend,
            no_congestion_control,
        }
    }

    /// Minimum RTO implied by the delay mode
    pub fn min_rto(&self) -> u32 {
        if self.nodelay {
            constants::IKCP_RTO_NDL
        } else {
            constants::IKCP_RTO_MIN
        }
    }

    /// Interval clamped to the range the update clock accepts
    pub fn clamped_interval(&self) -> u32 {
        self.interval
            .clamp(constants::IKCP_INTERVAL_MIN, constants::IKCP_INTERVAL_MAX)
    }
}

impl Default for NodeDelayConfig {
    fn default() -> Self {
        Self::normal()
    }
}

/// Protocol-only configuration for the KCP engine.
///
/// Contains only the fields the engine reads; no transport or I/O settings.
#[derive(Debug, Clone)]
pub struct KcpCoreConfig {
    /// Maximum transmission unit
    pub mtu: u32,
    /// Send window size (segments)
    pub snd_wnd: u32,
    /// Receive window size (segments)
    pub rcv_wnd: u32,
    /// Node delay configuration
    pub nodelay: NodeDelayConfig,
    /// Transmit count at which a segment marks the link dead
    pub dead_link: u32,
    /// Overrides the min RTO implied by `nodelay`
    pub min_rto: Option<u32>,
    /// Max transmit count for which fast retransmit still fires (0 = unlimited)
    pub fastack_limit: u32,
    /// Only count a fast ack when the acked segment was sent no earlier
    pub fastack_conserve: bool,
    /// Enable stream mode (no message boundaries)
    pub stream_mode: bool,
}

impl Default for KcpCoreConfig {
    fn default() -> Self {
        Self {
            mtu: constants::IKCP_MTU_DEF,
            snd_wnd: constants::IKCP_WND_SND,
            rcv_wnd: constants::IKCP_WND_RCV,
            nodelay: NodeDelayConfig::normal(),
            dead_link: constants::IKCP_DEADLINK,
            min_rto: None,
            fastack_limit: constants::IKCP_FASTACK_LIMIT,
            fastack_conserve: false,
            stream_mode: false,
        }
    }
}

impl KcpCoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mtu(mut self, mtu: u32) -> Self {
        self.mtu = mtu;
        self
    }

    /// Engines raise `rcv_wnd` to at least `IKCP_WND_RCV`.
    pub fn window_size(mut self, snd_wnd: u32, rcv_wnd: u32) -> Self {
        self.snd_wnd = snd_wnd;
        self.rcv_wnd = rcv_wnd;
        self
    }

    pub fn nodelay_config(mut self, config: NodeDelayConfig) -> Self {
        self.nodelay = config;
        self
    }

    pub fn fast_mode(self) -> Self {
        self.nodelay_config(NodeDelayConfig::fast())
    }

    pub fn dead_link(mut self, xmit: u32) -> Self {
        self.dead_link = xmit;
        self
    }

    pub fn min_rto(mut self, rto: u32) -> Self {
        self.min_rto = Some(rto);
        self
    }

    pub fn fastack_conserve(mut self, enabled: bool) -> Self {
        self.fastack_conserve = enabled;
        self
    }

    pub fn stream_mode(mut self, enabled: bool) -> Self {
        self.stream_mode = enabled;
        self
    }

    /// Maximum segment size (MTU - overhead)
    pub fn mss(&self) -> u32 {
        self.mtu.saturating_sub(constants::IKCP_OVERHEAD)
    }

    pub fn effective_min_rto(&self) -> u32 {
        self.min_rto.unwrap_or_else(|| self.nodelay.min_rto())
    }

    pub fn validate(&self) -> KcpCoreResult<()> {
        if self.mtu < constants::IKCP_MTU_MIN || self.mtu > 65535 {
            return Err(KcpCoreError::invalid_argument(format!(
                "MTU must be between {} and 65535",
                constants::IKCP_MTU_MIN
            )));
        }
        if self.snd_wnd == 0 || self.rcv_wnd == 0 {
            return Err(KcpCoreError::invalid_argument(
                "Window sizes must be greater than 0",
            ));
        }
        if self.rcv_wnd > u16::MAX as u32 {
            return Err(KcpCoreError::invalid_argument(
                "Receive window must fit the 16-bit window field",
            ));
        }
        if self.nodelay.interval == 0 {
            return Err(KcpCoreError::invalid_argument(
                "Update interval must be greater than 0",
            ));
        }
        if self.dead_link == 0 {
            return Err(KcpCoreError::invalid_argument(
                "Dead link threshold must be greater than 0",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = KcpCoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.mss(), 1376);
        assert_eq!(config.effective_min_rto(), constants::IKCP_RTO_MIN);
    }

    #[test]
    fn test_validation_failures() {
        assert!(KcpCoreConfig::new().mtu(24).validate().is_err());
        assert!(KcpCoreConfig::new().mtu(70_000).validate().is_err());
        assert!(KcpCoreConfig::new().window_size(0, 32).validate().is_err());
        assert!(KcpCoreConfig::new().window_size(32, 70_000).validate().is_err());
        assert!(KcpCoreConfig::new().dead_link(0).validate().is_err());
        let mut config = KcpCoreConfig::new();
        config.nodelay.interval = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_min_rto_follows_mode() {
        assert_eq!(KcpCoreConfig::new().fast_mode().effective_min_rto(), 30);
        assert_eq!(KcpCoreConfig::new().fast_mode().min_rto(50).effective_min_rto(), 50);
    }

    #[test]
    fn test_interval_clamp() {
        assert_eq!(NodeDelayConfig::custom(true, 1, 2, false).clamped_interval(), 10);
        assert_eq!(NodeDelayConfig::custom(true, 9000, 2, false).clamped_interval(), 5000);
        assert_eq!(NodeDelayConfig::normal().clamped_interval(), 40);
    }
}
