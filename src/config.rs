//! Configuration types for the async layer.
//!
//! [`KcpConfig`] extends the core protocol settings with runtime settings
//! (keep-alive, idle timeout, channel sizes).

use crate::error::{KcpError, Result};
use std::time::Duration;
use ukcp_core::protocol::constants;
use ukcp_core::KcpCoreConfig;

// Re-export from the core crate so users see a single NodeDelayConfig type.
pub use ukcp_core::config::NodeDelayConfig;

// ── KcpConfig ───────────────────────────────────────────────────────────

/// Full KCP configuration: protocol settings + runtime settings.
#[derive(Debug, Clone)]
pub struct KcpConfig {
    // Protocol settings (forwarded to the core engine)
    pub mtu: u32,
    pub snd_wnd: u32,
    pub rcv_wnd: u32,
    pub nodelay: NodeDelayConfig,
    pub dead_link: u32,
    pub min_rto: Option<u32>,
    pub fastack_conserve: bool,
    pub stream_mode: bool,

    // Runtime settings (used only by the actor and endpoint)
    pub keep_alive: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    pub channel_capacity: usize,
    pub accept_backlog: usize,
}

impl Default for KcpConfig {
    fn default() -> Self {
        Self {
            mtu: constants::IKCP_MTU_DEF,
            snd_wnd: constants::IKCP_WND_SND,
            rcv_wnd: constants::IKCP_WND_RCV,
            nodelay: NodeDelayConfig::normal(),
            dead_link: constants::IKCP_DEADLINK,
            min_rto: None,
            fastack_conserve: false,
            stream_mode: false,
            keep_alive: Some(Duration::from_secs(10)),
            idle_timeout: Some(Duration::from_secs(60)),
            channel_capacity: 256,
            accept_backlog: 128,
        }
    }
}

/// Extracts the protocol-only fields that `KcpEngine` reads.
impl From<&KcpConfig> for KcpCoreConfig {
    fn from(c: &KcpConfig) -> Self {
        let mut core = KcpCoreConfig::new()
            .mtu(c.mtu)
            .window_size(c.snd_wnd, c.rcv_wnd)
            .nodelay_config(c.nodelay.clone())
            .dead_link(c.dead_link)
            .fastack_conserve(c.fastack_conserve)
            .stream_mode(c.stream_mode);
        core.min_rto = c.min_rto;
        core
    }
}

impl From<KcpConfig> for KcpCoreConfig {
    fn from(c: KcpConfig) -> Self {
        Self::from(&c)
    }
}

// ── Builder methods ─────────────────────────────────────────────────────

impl KcpConfig {
    pub fn new() -> Self {
        Self::default()
    }

    // -- Protocol tuning --

    pub fn mtu(mut self, mtu: u32) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn window_size(mut self, snd_wnd: u32, rcv_wnd: u32) -> Self {
        self.snd_wnd = snd_wnd;
        self.rcv_wnd = rcv_wnd;
        self
    }

    pub fn normal_mode(mut self) -> Self {
        self.nodelay = NodeDelayConfig::normal();
        self
    }

    pub fn fast_mode(mut self) -> Self {
        self.nodelay = NodeDelayConfig::fast();
        self
    }

    pub fn turbo_mode(mut self) -> Self {
        self.nodelay = NodeDelayConfig::turbo();
        self
    }

    pub fn nodelay_config(mut self, config: NodeDelayConfig) -> Self {
        self.nodelay = config;
        self
    }

    pub fn dead_link(mut self, xmit: u32) -> Self {
        self.dead_link = xmit;
        self
    }

    pub fn min_rto(mut self, rto: u32) -> Self {
        self.min_rto = Some(rto);
        self
    }

    pub fn stream_mode(mut self, enabled: bool) -> Self {
        self.stream_mode = enabled;
        self
    }

    // -- Runtime tuning --

    pub fn keep_alive(mut self, interval: Option<Duration>) -> Self {
        self.keep_alive = interval;
        self
    }

    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    pub fn accept_backlog(mut self, backlog: usize) -> Self {
        self.accept_backlog = backlog;
        self
    }

    /// Protocol settings for a new engine
    pub fn core(&self) -> KcpCoreConfig {
        KcpCoreConfig::from(self)
    }

    // -- Validation --

    pub fn validate(&self) -> Result<()> {
        self.core()
            .validate()
            .map_err(|e| KcpError::config(e.to_string()))?;
        if self.channel_capacity == 0 || self.accept_backlog == 0 {
            return Err(KcpError::config("Channel capacities must be greater than 0"));
        }
        if let (Some(keep_alive), Some(idle)) = (self.keep_alive, self.idle_timeout) {
            if keep_alive >= idle {
                return Err(KcpError::config(
                    "Keep-alive interval must be shorter than the idle timeout",
                ));
            }
        }
        Ok(())
    }
}

// ── Presets ──────────────────────────────────────────────────────────────

impl KcpConfig {
    pub fn gaming() -> Self {
        Self::default()
            .turbo_mode()
            .window_size(64, 128)
            .mtu(1200)
            .keep_alive(Some(Duration::from_secs(5)))
            .idle_timeout(Some(Duration::from_secs(15)))
    }

    pub fn file_transfer() -> Self {
        Self::default()
            .normal_mode()
            .window_size(256, 256)
            .mtu(1400)
            .stream_mode(true)
            .keep_alive(Some(Duration::from_secs(30)))
            .idle_timeout(Some(Duration::from_secs(120)))
    }

    pub fn realtime() -> Self {
        Self::default()
            .fast_mode()
            .window_size(64, 64)
            .mtu(1200)
            .keep_alive(Some(Duration::from_secs(5)))
            .idle_timeout(Some(Duration::from_secs(30)))
    }
}
