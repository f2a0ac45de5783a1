//! Process-wide counters for KCP conversations

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::LazyLock;
use std::time::Duration;
use ukcp_core::KcpStats;

/// Global performance metrics collector
#[derive(Debug, Default)]
pub struct GlobalMetrics {
    /// Conversations opened (explicitly or on first datagram)
    pub conversations_opened: AtomicU64,
    /// Conversations currently running
    pub active_conversations: AtomicUsize,
    /// Datagrams handed to the transport
    pub datagrams_sent: AtomicU64,
    /// Datagrams accepted by an engine
    pub datagrams_received: AtomicU64,
    /// Datagrams dropped as malformed, misrouted, or over capacity
    pub datagrams_dropped: AtomicU64,
    /// Payload bytes queued by applications
    pub bytes_sent: AtomicU64,
    /// Payload bytes delivered to applications
    pub bytes_received: AtomicU64,
    /// Timeout and fast retransmissions
    pub retransmissions: AtomicU64,
}

impl GlobalMetrics {
    /// Record a new conversation
    pub fn conversation_opened(&self) {
        self.conversations_opened.fetch_add(1, Ordering::Relaxed);
        self.active_conversations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a conversation shutting down, folding in its final stats
    pub fn conversation_closed(&self, stats: &KcpStats) {
        self.active_conversations.fetch_sub(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(stats.bytes_sent, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(stats.bytes_received, Ordering::Relaxed);
        self.retransmissions.fetch_add(
            stats.retransmissions + stats.fast_retransmissions,
            Ordering::Relaxed,
        );
    }

    pub fn datagram_sent(&self) {
        self.datagrams_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn datagram_received(&self) {
        self.datagrams_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn datagram_dropped(&self) {
        self.datagrams_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            conversations_opened: self.conversations_opened.load(Ordering::Relaxed),
            active_conversations: self.active_conversations.load(Ordering::Relaxed),
            datagrams_sent: self.datagrams_sent.load(Ordering::Relaxed),
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            datagrams_dropped: self.datagrams_dropped.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            retransmissions: self.retransmissions.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub conversations_opened: u64,
    pub active_conversations: usize,
    pub datagrams_sent: u64,
    pub datagrams_received: u64,
    pub datagrams_dropped: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub retransmissions: u64,
}

impl MetricsSnapshot {
    /// Retransmissions per datagram sent
    pub fn retransmission_rate(&self) -> f64 {
        if self.datagrams_sent == 0 {
            0.0
        } else {
            self.retransmissions as f64 / self.datagrams_sent as f64
        }
    }

    /// Calculate total throughput in bytes per second
    pub fn throughput_bps(&self, duration: Duration) -> f64 {
        let total_bytes = self.bytes_sent + self.bytes_received;
        total_bytes as f64 / duration.as_secs_f64()
    }
}

/// Global metrics instance
pub static GLOBAL_METRICS: LazyLock<GlobalMetrics> = LazyLock::new(GlobalMetrics::default);

/// Get global metrics
pub fn global_metrics() -> &'static GlobalMetrics {
    &GLOBAL_METRICS
}

/// Format metrics for human-readable display
pub fn format_metrics(snapshot: &MetricsSnapshot) -> String {
    format!(
        "KCP Metrics:\n\
         Conversations: {} opened, {} active\n\
         Traffic: {} bytes sent, {} bytes received\n\
         Datagrams: {} sent, {} received, {} dropped\n\
         Retransmissions: {} ({:.2}% of sent)",
        snapshot.conversations_opened,
        snapshot.active_conversations,
        snapshot.bytes_sent,
        snapshot.bytes_received,
        snapshot.datagrams_sent,
        snapshot.datagrams_received,
        snapshot.datagrams_dropped,
        snapshot.retransmissions,
        snapshot.retransmission_rate() * 100.0,
    )
}
