//! KCP conversation state machine.
//!
//! One [`KcpEngine`] owns all state of a single conversation: the send queue
//! and in-flight send buffer, the reorder buffer and deliverable receive
//! queue, the pending ACK list, the RTT estimator, and the congestion window.
//! It performs no I/O and reads no clock: the caller supplies the time to
//! [`update`](KcpEngine::update), and datagrams leave through the output
//! callback or [`drain_output`](KcpEngine::drain_output).
//!
//! ```text
//!  send() ──► snd_queue ──(flush: window admits)──► snd_buf ──► datagrams
//!                                                     ▲
//!  input() ──ACK/una───────────────────────────────────┘
//!     └──PUSH──► rcv_buf ──(contiguous)──► rcv_queue ──► recv()
//! ```

use crate::config::{KcpCoreConfig, NodeDelayConfig};
use crate::congestion::CongestionWindow;
use crate::error::{KcpCoreError, KcpCoreResult};
use crate::output::{DatagramWriter, OutputFn};
use crate::pool::SegmentPool;
use crate::protocol::*;
use crate::rtt::RttEstimator;
use crate::segment::KcpSegment;

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Link status of a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvState {
    Active,
    /// A segment reached the dead-link transmit count
    Broken,
}

/// Probe state for window probing
#[derive(Debug, Default)]
struct ProbeState {
    flags: u32,
    wait: u32,
    ts: Timestamp,
}

/// Synchronous KCP engine implementing the core protocol logic
pub struct KcpEngine {
    // Core
    conv: ConvId,
    config: KcpCoreConfig,
    mss: u32,
    interval: u32,
    state: ConvState,

    // Sequence numbers
    snd_una: SeqNum,
    snd_nxt: SeqNum,
    rcv_nxt: SeqNum,
    rmt_wnd: u32,

    // Timing and window
    rtt: RttEstimator,
    cc: CongestionWindow,
    probe: ProbeState,

    // Clock
    current: Timestamp,
    ts_flush: Timestamp,
    updated: bool,
    last_input: Timestamp,
    xmit: u32,

    // Buffers
    snd_queue: VecDeque<KcpSegment>,
    snd_buf: VecDeque<KcpSegment>,
    rcv_buf: VecDeque<KcpSegment>,
    rcv_queue: VecDeque<KcpSegment>,
    ack_list: Vec<(SeqNum, Timestamp)>,

    pool: Arc<SegmentPool>,
    writer: DatagramWriter,
    stats: KcpStats,
}

impl KcpEngine {
    /// Create a new KCP engine with its own segment pool
    pub fn new(conv: ConvId, config: KcpCoreConfig) -> KcpCoreResult<Self> {
        Self::with_pool(conv, config, Arc::new(SegmentPool::new()))
    }

    /// Create a conversation with the given MTU and window sizes, other settings default
    pub fn create(conv: ConvId, mtu: u32, snd_wnd: u32, rcv_wnd: u32) -> KcpCoreResult<Self> {
        Self::new(
            conv,
            KcpCoreConfig::default().mtu(mtu).window_size(snd_wnd, rcv_wnd),
        )
    }

    /// Create a new KCP engine drawing payload buffers from a shared pool
    pub fn with_pool(
        conv: ConvId,
        mut config: KcpCoreConfig,
        pool: Arc<SegmentPool>,
    ) -> KcpCoreResult<Self> {
        config.validate()?;
        config.rcv_wnd = config.rcv_wnd.max(constants::IKCP_WND_RCV);

        let mss = config.mss();
        let interval = config.nodelay.clamped_interval();
        let rtt = RttEstimator::new(config.effective_min_rto());
        let writer = DatagramWriter::new(config.mtu as usize);

        debug!(conv = %conv, mtu = config.mtu, snd_wnd = config.snd_wnd, rcv_wnd = config.rcv_wnd, "KCP conversation created");

        Ok(Self {
            conv,
            mss,
            interval,
            state: ConvState::Active,

            snd_una: 0,
            snd_nxt: 0,
            rcv_nxt: 0,
            rmt_wnd: constants::IKCP_WND_RCV,

            rtt,
            cc: CongestionWindow::new(mss),
            probe: ProbeState::default(),

            current: 0,
            ts_flush: 0,
            updated: false,
            last_input: 0,
            xmit: 0,

            snd_queue: VecDeque::new(),
            snd_buf: VecDeque::new(),
            rcv_buf: VecDeque::new(),
            rcv_queue: VecDeque::new(),
            ack_list: Vec::new(),

            pool,
            writer,
            stats: KcpStats::default(),

            config,
        })
    }

    // ── Tuning ──────────────────────────────────────────────────────────

    /// Route emitted datagrams to `output` instead of buffering them
    pub fn set_output(&mut self, output: impl FnMut(Bytes) + Send + 'static) {
        let output: OutputFn = Box::new(output);
        self.writer.set_output(output);
    }

    /// Take the datagrams emitted since the last drain (only used without an output callback)
    pub fn drain_output(&mut self) -> Vec<Bytes> {
        self.writer.drain()
    }

    pub fn set_nodelay(
        &mut self,
        nodelay: bool,
        interval: u32,
        resend: u32,
        no_congestion_control: bool,
    ) {
        self.config.nodelay = NodeDelayConfig::custom(nodelay, interval, resend, no_congestion_control);
        self.interval = self.config.nodelay.clamped_interval();
        self.rtt.set_min_rto(self.config.effective_min_rto());
    }

    pub fn set_interval(&mut self, interval: u32) {
        self.config.nodelay.interval = interval;
        self.interval = self.config.nodelay.clamped_interval();
    }

    pub fn set_fast_resend(&mut self, resend: u32) {
        self.config.nodelay.resend = resend;
    }

    pub fn set_min_rto(&mut self, min_rto: u32) {
        self.config.min_rto = Some(min_rto);
        self.rtt.set_min_rto(min_rto);
    }

    /// Zero leaves the corresponding window unchanged.
    ///
    /// The receive window never drops below [`constants::IKCP_WND_RCV`] (the
    /// largest fragment chain) nor below what is already buffered.
    pub fn set_window_size(&mut self, snd_wnd: u32, rcv_wnd: u32) {
        if snd_wnd > 0 {
            self.config.snd_wnd = snd_wnd;
        }
        if rcv_wnd > 0 {
            let occupied = self.rcv_buf_span().max(self.rcv_queue.len() as u32);
            self.config.rcv_wnd = rcv_wnd
                .max(constants::IKCP_WND_RCV)
                .max(occupied)
                .min(u16::MAX as u32);
        }
    }

    pub fn set_mtu(&mut self, mtu: u32) -> KcpCoreResult<()> {
        if mtu < constants::IKCP_MTU_MIN || mtu <= constants::IKCP_OVERHEAD || mtu > 65535 {
            return Err(KcpCoreError::invalid_argument(format!("unsupported MTU {mtu}")));
        }

        let mss = mtu - constants::IKCP_OVERHEAD;
        let oversized = self
            .snd_queue
            .iter()
            .chain(self.snd_buf.iter())
            .any(|seg| seg.data.len() > mss as usize);
        if oversized {
            return Err(KcpCoreError::invalid_argument(
                "queued segments are larger than the new MSS",
            ));
        }

        self.config.mtu = mtu;
        self.mss = mss;
        self.cc.set_mss(mss);
        self.writer.set_mtu(mtu as usize);
        Ok(())
    }

    // ── Accessors ───────────────────────────────────────────────────────

    pub fn conv(&self) -> ConvId {
        self.conv
    }

    pub fn config(&self) -> &KcpCoreConfig {
        &self.config
    }

    pub fn state(&self) -> ConvState {
        self.state
    }

    /// Check if the link has been declared dead
    pub fn is_dead(&self) -> bool {
        self.state == ConvState::Broken
    }

    pub fn mtu(&self) -> u32 {
        self.config.mtu
    }

    pub fn mss(&self) -> u32 {
        self.mss
    }

    pub fn interval(&self) -> u32 {
        self.interval
    }

    pub fn rto(&self) -> u32 {
        self.rtt.rto()
    }

    pub fn min_rto(&self) -> u32 {
        self.rtt.min_rto()
    }

    pub fn cwnd(&self) -> u32 {
        self.cc.cwnd()
    }

    pub fn ssthresh(&self) -> u32 {
        self.cc.ssthresh()
    }

    pub fn remote_window(&self) -> u32 {
        self.rmt_wnd
    }

    pub fn snd_una(&self) -> SeqNum {
        self.snd_una
    }

    pub fn snd_nxt(&self) -> SeqNum {
        self.snd_nxt
    }

    pub fn rcv_nxt(&self) -> SeqNum {
        self.rcv_nxt
    }

    /// Segments assigned a sequence number but not yet acknowledged
    pub fn inflight(&self) -> u32 {
        self.snd_nxt.wrapping_sub(self.snd_una)
    }

    /// Segments waiting to be sent or acknowledged
    pub fn wait_snd(&self) -> usize {
        self.snd_queue.len() + self.snd_buf.len()
    }

    /// Distance from `rcv_nxt` to the highest buffered out-of-order segment, inclusive
    pub fn rcv_buf_span(&self) -> u32 {
        self.rcv_buf
            .back()
            .map(|seg| seg.sn().wrapping_sub(self.rcv_nxt) + 1)
            .unwrap_or(0)
    }

    /// Segments ready in the receive queue
    pub fn rcv_queue_len(&self) -> usize {
        self.rcv_queue.len()
    }

    /// `min(snd_wnd, rmt_wnd)`, further limited by `cwnd` unless congestion control is off
    pub fn effective_window(&self) -> u32 {
        let window = self.cwnd_limit();
        if self.config.nodelay.no_congestion_control {
            window
        } else {
            window.min(self.cc.cwnd())
        }
    }

    pub fn stats(&self) -> &KcpStats {
        &self.stats
    }

    pub fn pool(&self) -> &Arc<SegmentPool> {
        &self.pool
    }

    /// Milliseconds since the last accepted datagram
    pub fn idle_ms(&self, now: Timestamp) -> u32 {
        time_diff(now, self.last_input).max(0) as u32
    }

    // ── Send path ───────────────────────────────────────────────────────

    /// Queue a message. Splits it into MSS-sized segments; no I/O happens here.
    pub fn send(&mut self, data: &[u8]) -> KcpCoreResult<()> {
        if data.is_empty() {
            return Err(KcpCoreError::invalid_argument("cannot send an empty message"));
        }

        let mss = self.mss as usize;
        let total = data.len();
        let mut rest = data;

        if self.config.stream_mode {
            if let Some(tail) = self.snd_queue.back_mut() {
                let room = mss.saturating_sub(tail.data.len());
                if room > 0 {
                    let take = room.min(rest.len());
                    tail.data.extend_from_slice(&rest[..take]);
                    rest = &rest[take..];
                }
            }
            if rest.is_empty() {
                self.stats.bytes_sent += total as u64;
                return Ok(());
            }
        }

        let count = rest.len().div_ceil(mss).max(1);

        if !self.config.stream_mode {
            let limit = constants::IKCP_FRG_MAX.min(self.config.rcv_wnd.saturating_sub(1) as usize);
            if count > limit {
                return Err(KcpCoreError::WindowExceeded {
                    fragments: count,
                    limit,
                });
            }
        }

        for (i, chunk) in rest.chunks(mss).enumerate() {
            let capacity = if self.config.stream_mode { mss } else { chunk.len() };
            let mut buf = self.pool.rent(capacity);
            buf.extend_from_slice(chunk);

            let frg = if self.config.stream_mode {
                0
            } else {
                (count - i - 1) as u8
            };
            self.snd_queue.push_back(KcpSegment::push(self.conv, frg, buf));
        }

        self.stats.bytes_sent += total as u64;

        trace!(
            conv = %self.conv,
            bytes = total,
            fragments = count,
            "Data queued for sending"
        );

        Ok(())
    }

    // ── Receive path ────────────────────────────────────────────────────

    /// Size of the next complete message, or `WouldBlock` if none is ready
    pub fn peek_size(&self) -> KcpCoreResult<usize> {
        let Some(front) = self.rcv_queue.front() else {
            return Err(KcpCoreError::WouldBlock);
        };

        if front.header.frg == 0 {
            return Ok(front.data.len());
        }

        if self.rcv_queue.len() < front.header.frg as usize + 1 {
            return Err(KcpCoreError::WouldBlock);
        }

        let mut length = 0;
        for segment in &self.rcv_queue {
            length += segment.data.len();
            if segment.header.frg == 0 {
                break;
            }
        }

        Ok(length)
    }

    /// Copy the next complete message into `buf`.
    ///
    /// Returns `BufferTooSmall` without consuming anything if `buf` cannot
    /// hold the whole message.
    pub fn recv(&mut self, buf: &mut [u8]) -> KcpCoreResult<usize> {
        let size = self.peek_size()?;
        if size > buf.len() {
            return Err(KcpCoreError::BufferTooSmall {
                needed: size,
                available: buf.len(),
            });
        }

        let mut offset = 0;
        self.take_message(|chunk| {
            buf[offset..offset + chunk.len()].copy_from_slice(chunk);
            offset += chunk.len();
        });

        Ok(size)
    }

    /// Take the next complete message as an owned buffer
    pub fn recv_bytes(&mut self) -> KcpCoreResult<Bytes> {
        let size = self.peek_size()?;
        let mut data = BytesMut::with_capacity(size);
        self.take_message(|chunk| data.extend_from_slice(chunk));
        Ok(data.freeze())
    }

    fn take_message(&mut self, mut sink: impl FnMut(&[u8])) {
        let rcv_wnd = self.config.rcv_wnd as usize;
        let recover = self.rcv_queue.len() >= rcv_wnd;

        let mut total = 0;
        while let Some(segment) = self.rcv_queue.pop_front() {
            sink(&segment.data[..]);
            total += segment.data.len();
            let last = segment.header.frg == 0;
            self.pool.give_back(segment.data);
            if last {
                break;
            }
        }

        self.move_to_rcv_queue();

        // window reopened: tell the peer on the next flush
        if recover && self.rcv_queue.len() < rcv_wnd {
            self.probe.flags |= constants::IKCP_ASK_TELL;
            debug!(conv = %self.conv, "Receive window reopened");
        }

        self.stats.bytes_received += total as u64;

        trace!(conv = %self.conv, bytes = total, "Data received");
    }

    // ── Input ───────────────────────────────────────────────────────────

    /// Process one datagram from the transport.
    ///
    /// The datagram is validated in full first; a malformed or misaddressed
    /// datagram is dropped without touching any state.
    pub fn input(&mut self, datagram: &[u8]) -> KcpCoreResult<()> {
        if datagram.len() < KcpHeader::SIZE {
            return Err(self.reject(KcpCoreError::malformed(format!(
                "datagram of {} bytes is shorter than a header",
                datagram.len()
            ))));
        }

        for parsed in SegmentIter::new(datagram) {
            let header = match parsed {
                Ok((header, _)) => header,
                Err(e) => return Err(self.reject(e)),
            };
            if header.conv != self.conv {
                return Err(self.reject(KcpCoreError::ConvMismatch {
                    expected: self.conv,
                    actual: header.conv,
                }));
            }
        }

        let prev_una = self.snd_una;
        let mut max_ack: Option<(SeqNum, Timestamp)> = None;

        for (header, payload) in SegmentIter::new(datagram).flatten() {
            self.rmt_wnd = header.wnd as u32;
            self.parse_una(header.una);
            self.shrink_buf();

            match header.cmd {
                Command::Ack => {
                    let rtt = time_diff(self.current, header.ts);
                    if rtt >= 0 {
                        self.rtt.observe(rtt as u32, self.interval);
                    }
                    self.parse_ack(header.sn);
                    self.shrink_buf();

                    max_ack = match max_ack {
                        None => Some((header.sn, header.ts)),
                        Some((sn, ts))
                            if seq_after(header.sn, sn)
                                && (!self.config.fastack_conserve
                                    || time_diff(header.ts, ts) > 0) =>
                        {
                            Some((header.sn, header.ts))
                        }
                        keep => keep,
                    };

                    trace!(conv = %self.conv, sn = header.sn, rtt, rto = self.rtt.rto(), "Input ack");
                }

                Command::Push => {
                    let upper = self.rcv_nxt.wrapping_add(self.config.rcv_wnd);
                    if seq_before(header.sn, upper) {
                        self.ack_list.push((header.sn, header.ts));
                        if !seq_before(header.sn, self.rcv_nxt) {
                            self.parse_data(&header, payload);
                        }
                    }

                    trace!(conv = %self.conv, sn = header.sn, frg = header.frg, "Input push");
                }

                Command::WindowAsk => {
                    self.probe.flags |= constants::IKCP_ASK_TELL;
                    trace!(conv = %self.conv, "Input window probe");
                }

                Command::WindowTell => {
                    trace!(conv = %self.conv, wnd = header.wnd, "Input window size");
                }
            }
        }

        if let Some((sn, ts)) = max_ack {
            self.parse_fastack(sn, ts);
        }

        let limit = self.cwnd_limit();
        if seq_after(self.snd_una, prev_una) {
            self.cc.on_ack_progress(limit);
        }
        self.cc.clamp_to(limit);

        self.last_input = self.current;
        self.stats.packets_received += 1;
        Ok(())
    }

    fn reject(&mut self, error: KcpCoreError) -> KcpCoreError {
        self.stats.packets_dropped += 1;
        warn!(conv = %self.conv, error = %error, "Dropping datagram");
        error
    }

    fn parse_una(&mut self, una: SeqNum) {
        while self
            .snd_buf
            .front()
            .is_some_and(|seg| seq_before(seg.sn(), una))
        {
            if let Some(segment) = self.snd_buf.pop_front() {
                self.pool.give_back(segment.data);
            }
        }
    }

    fn shrink_buf(&mut self) {
        self.snd_una = match self.snd_buf.front() {
            Some(segment) => segment.sn(),
            None => self.snd_nxt,
        };
    }

    fn parse_ack(&mut self, sn: SeqNum) {
        if seq_before(sn, self.snd_una) || !seq_before(sn, self.snd_nxt) {
            return;
        }

        let base = self.snd_una;
        if let Ok(index) = self
            .snd_buf
            .binary_search_by_key(&sn.wrapping_sub(base), |seg| seg.sn().wrapping_sub(base))
        {
            if let Some(segment) = self.snd_buf.remove(index) {
                self.pool.give_back(segment.data);
            }
        }
    }

    fn parse_fastack(&mut self, sn: SeqNum, ts: Timestamp) {
        if seq_before(sn, self.snd_una) || !seq_before(sn, self.snd_nxt) {
            return;
        }

        let conserve = self.config.fastack_conserve;
        for segment in &mut self.snd_buf {
            if seq_before(sn, segment.sn()) {
                break;
            }
            if segment.sn() != sn && (!conserve || time_diff(ts, segment.header.ts) >= 0) {
                segment.fastack += 1;
            }
        }
    }

    fn parse_data(&mut self, header: &KcpHeader, payload: &[u8]) {
        let rcv_nxt = self.rcv_nxt;
        let offset = header.sn.wrapping_sub(rcv_nxt);
        if offset >= self.config.rcv_wnd {
            return;
        }

        match self
            .rcv_buf
            .binary_search_by_key(&offset, |seg| seg.sn().wrapping_sub(rcv_nxt))
        {
            Ok(_) => {
                trace!(conv = %self.conv, sn = header.sn, "Duplicate segment");
            }
            Err(index) => {
                let mut data = self.pool.rent(payload.len());
                data.extend_from_slice(payload);
                self.rcv_buf.insert(index, KcpSegment::new(*header, data));
            }
        }

        self.move_to_rcv_queue();
    }

    fn move_to_rcv_queue(&mut self) {
        let rcv_wnd = self.config.rcv_wnd as usize;
        while self.rcv_queue.len() < rcv_wnd
            && self
                .rcv_buf
                .front()
                .is_some_and(|seg| seg.sn() == self.rcv_nxt)
        {
            if let Some(segment) = self.rcv_buf.pop_front() {
                self.rcv_queue.push_back(segment);
                self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
            }
        }
    }

    // ── Clock ───────────────────────────────────────────────────────────

    /// Advance the caller's clock; flushes when the interval has elapsed.
    ///
    /// The first call only establishes the flush baseline (and flushes).
    /// Call it every 10–100 ms, or at the time [`check`](Self::check) returns.
    pub fn update(&mut self, now: Timestamp) {
        self.current = now;

        if !self.updated {
            self.updated = true;
            self.ts_flush = now;
        }

        let mut slap = time_diff(now, self.ts_flush);
        if !(-constants::IKCP_SLAP_LIMIT..constants::IKCP_SLAP_LIMIT).contains(&slap) {
            self.ts_flush = now;
            slap = 0;
        }

        if slap >= 0 {
            self.ts_flush = self.ts_flush.wrapping_add(self.interval);
            if time_diff(now, self.ts_flush) >= 0 {
                self.ts_flush = now.wrapping_add(self.interval);
            }
            self.flush();
        }
    }

    /// When [`update`](Self::update) should next be called, absent any send or input
    pub fn check(&self, now: Timestamp) -> Timestamp {
        if !self.updated {
            return now;
        }

        let mut ts_flush = self.ts_flush;
        let slap = time_diff(now, ts_flush);
        if !(-constants::IKCP_SLAP_LIMIT..constants::IKCP_SLAP_LIMIT).contains(&slap) {
            ts_flush = now;
        }

        if time_diff(now, ts_flush) >= 0 {
            return now;
        }

        let tm_flush = time_diff(ts_flush, now);
        let mut tm_packet = i32::MAX;
        for segment in &self.snd_buf {
            let diff = time_diff(segment.resendts, now);
            if diff <= 0 {
                return now;
            }
            tm_packet = tm_packet.min(diff);
        }

        let minimal = (tm_packet.min(tm_flush) as u32).min(self.interval);
        now.wrapping_add(minimal)
    }

    /// Ask the peer for its window on the next flush
    pub fn keep_alive_probe(&mut self) {
        self.probe.flags |= constants::IKCP_ASK_SEND;
    }

    // ── Flush ───────────────────────────────────────────────────────────

    /// Emit pending ACKs, window probes, new data, and due retransmissions.
    ///
    /// No-op until [`update`](Self::update) has been called once.
    pub fn flush(&mut self) {
        if !self.updated {
            return;
        }

        let current = self.current;
        let wnd = self.wnd_unused().min(u16::MAX as u32) as u16;
        let rcv_nxt = self.rcv_nxt;

        let mut seg = KcpHeader::new(self.conv, Command::Ack);
        seg.wnd = wnd;
        seg.una = rcv_nxt;

        // flush acknowledges
        for &(sn, ts) in &self.ack_list {
            seg.sn = sn;
            seg.ts = ts;
            seg.encode(self.writer.reserve(KcpHeader::SIZE));
        }
        self.ack_list.clear();

        // probe window size (if remote window size equals zero)
        if self.rmt_wnd == 0 {
            if self.probe.wait == 0 {
                self.probe.wait = constants::IKCP_PROBE_INIT;
                self.probe.ts = current.wrapping_add(self.probe.wait);
            } else if time_diff(current, self.probe.ts) >= 0 {
                self.probe.wait = self.probe.wait.max(constants::IKCP_PROBE_INIT);
                self.probe.wait += self.probe.wait / 2;
                self.probe.wait = self.probe.wait.min(constants::IKCP_PROBE_LIMIT);
                self.probe.ts = current.wrapping_add(self.probe.wait);
                self.probe.flags |= constants::IKCP_ASK_SEND;
            }
        } else {
            self.probe.ts = 0;
            self.probe.wait = 0;
        }

        seg.sn = 0;
        seg.ts = current;
        if self.probe.flags & constants::IKCP_ASK_SEND != 0 {
            seg.cmd = Command::WindowAsk;
            seg.encode(self.writer.reserve(KcpHeader::SIZE));
            trace!(conv = %self.conv, "Output window probe");
        }
        if self.probe.flags & constants::IKCP_ASK_TELL != 0 {
            seg.cmd = Command::WindowTell;
            seg.encode(self.writer.reserve(KcpHeader::SIZE));
            trace!(conv = %self.conv, wnd, "Output window size");
        }
        self.probe.flags = 0;

        // move data from snd_queue to snd_buf
        let window = self.effective_window();
        while seq_before(self.snd_nxt, self.snd_una.wrapping_add(window)) {
            let Some(mut segment) = self.snd_queue.pop_front() else {
                break;
            };
            segment.header.conv = self.conv;
            segment.header.cmd = Command::Push;
            segment.header.wnd = wnd;
            segment.header.ts = current;
            segment.header.sn = self.snd_nxt;
            segment.header.una = rcv_nxt;
            segment.resendts = current;
            segment.rto = self.rtt.rto();
            segment.fastack = 0;
            segment.xmit = 0;

            self.snd_buf.push_back(segment);
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
        }

        // retransmission policy
        let nodelay = self.config.nodelay.nodelay;
        let resent = if self.config.nodelay.resend > 0 {
            self.config.nodelay.resend
        } else {
            u32::MAX
        };
        let rx_rto = self.rtt.rto();
        let rtomin = if nodelay { 0 } else { rx_rto >> 3 };
        let fastack_limit = self.config.fastack_limit;
        let dead_link = self.config.dead_link;

        let mut lost = false;
        let mut change = false;
        let mut dead = false;

        for segment in self.snd_buf.iter_mut() {
            let mut needsend = false;

            if segment.xmit == 0 {
                // First transmission
                needsend = true;
                segment.xmit = 1;
                segment.rto = rx_rto;
                segment.resendts = current.wrapping_add(segment.rto + rtomin);
            } else if time_diff(current, segment.resendts) >= 0 {
                // Timeout retransmission
                needsend = true;
                segment.xmit += 1;
                self.xmit += 1;

                let step = if nodelay {
                    segment.rto / 2
                } else {
                    segment.rto.max(rx_rto)
                };
                segment.rto = segment
                    .rto
                    .saturating_add(step)
                    .min(constants::IKCP_RTO_MAX);
                segment.resendts = current.wrapping_add(segment.rto);
                lost = true;
                self.stats.retransmissions += 1;

                trace!(conv = %self.conv, sn = segment.sn(), xmit = segment.xmit, rto = segment.rto, "Timeout retransmit");
            } else if segment.fastack >= resent
                && (fastack_limit == 0 || segment.xmit <= fastack_limit)
            {
                // Fast retransmission
                needsend = true;
                segment.xmit += 1;
                segment.fastack = 0;
                segment.resendts = current.wrapping_add(segment.rto);
                change = true;
                self.stats.fast_retransmissions += 1;

                trace!(conv = %self.conv, sn = segment.sn(), xmit = segment.xmit, "Fast retransmit");
            }

            if needsend {
                segment.header.ts = current;
                segment.header.wnd = wnd;
                segment.header.una = rcv_nxt;
                segment.encode(self.writer.reserve(segment.size()));

                if segment.xmit >= dead_link {
                    dead = true;
                }
            }
        }

        self.writer.emit();

        if dead && self.state == ConvState::Active {
            self.state = ConvState::Broken;
            warn!(conv = %self.conv, dead_link, "Dead link detected, conversation broken");
        }

        let limit = self.cwnd_limit();
        if change {
            let inflight = self.snd_nxt.wrapping_sub(self.snd_una);
            self.cc.on_fast_retransmit(inflight, resent, limit);
            debug!(conv = %self.conv, cwnd = self.cc.cwnd(), ssthresh = self.cc.ssthresh(), "Fast retransmit, window reduced");
        }
        if lost {
            self.cc.on_loss(window, limit);
            debug!(conv = %self.conv, ssthresh = self.cc.ssthresh(), "Loss detected, slow start restarted");
        }

        self.refresh_stats();
    }

    // ── Helpers ─────────────────────────────────────────────────────────

    fn wnd_unused(&self) -> u32 {
        self.config
            .rcv_wnd
            .saturating_sub(self.rcv_queue.len() as u32)
    }

    fn cwnd_limit(&self) -> u32 {
        self.config.snd_wnd.min(self.rmt_wnd)
    }

    fn refresh_stats(&mut self) {
        self.stats.packets_sent = self.writer.datagrams;
        self.stats.rtt = self.rtt.srtt();
        self.stats.rtt_var = self.rtt.rttval();
        self.stats.rto = self.rtt.rto();
        self.stats.snd_wnd = self.config.snd_wnd;
        self.stats.rcv_wnd = self.config.rcv_wnd;
        self.stats.rmt_wnd = self.rmt_wnd;
        self.stats.cwnd = self.cc.cwnd();
        self.stats.ssthresh = self.cc.ssthresh();
        self.stats.snd_buf_size = self.snd_buf.len() as u32;
        self.stats.rcv_buf_size = self.rcv_buf.len() as u32;
    }

    /// Tear the conversation down, returning every payload buffer to the pool.
    /// The buffers go back in `Drop`; this only consumes the engine.
    pub fn release(self) {
        drop(self);
    }

    fn release_segments(&mut self) {
        let queues = [
            &mut self.snd_queue,
            &mut self.snd_buf,
            &mut self.rcv_buf,
            &mut self.rcv_queue,
        ];
        for queue in queues {
            for segment in queue.drain(..) {
                self.pool.give_back(segment.data);
            }
        }
        self.ack_list.clear();
    }
}

impl Drop for KcpEngine {
    fn drop(&mut self) {
        self.release_segments();
        trace!(conv = %self.conv, "KCP conversation released");
    }
}

impl std::fmt::Debug for KcpEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KcpEngine")
            .field("conv", &self.conv)
            .field("state", &self.state)
            .field("snd_una", &self.snd_una)
            .field("snd_nxt", &self.snd_nxt)
            .field("rcv_nxt", &self.rcv_nxt)
            .field("cwnd", &self.cc.cwnd())
            .field("rto", &self.rtt.rto())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(config: KcpCoreConfig) -> (KcpEngine, KcpEngine) {
        let a = KcpEngine::new(1, config.clone()).unwrap();
        let b = KcpEngine::new(1, config).unwrap();
        (a, b)
    }

    fn deliver(src: &mut KcpEngine, dst: &mut KcpEngine) -> usize {
        let packets = src.drain_output();
        let n = packets.len();
        for packet in packets {
            dst.input(&packet).unwrap();
        }
        n
    }

    #[test]
    fn test_send_fragments_with_descending_index() {
        let (mut a, _) = pair(KcpCoreConfig::default());
        a.send(&[7u8; 5000]).unwrap();
        let frgs: Vec<u8> = a.snd_queue.iter().map(|s| s.header.frg).collect();
        assert_eq!(frgs, vec![3, 2, 1, 0]);
        let sizes: Vec<usize> = a.snd_queue.iter().map(|s| s.data.len()).collect();
        assert_eq!(sizes, vec![1376, 1376, 1376, 872]);
        assert!(a.drain_output().is_empty(), "send performs no I/O");
    }

    #[test]
    fn test_send_rejects_empty_and_oversized() {
        let (mut a, _) = pair(KcpCoreConfig::default());
        assert!(matches!(a.send(&[]), Err(KcpCoreError::InvalidArgument { .. })));
        let err = a.send(&vec![0u8; 1376 * 128]).unwrap_err();
        assert_eq!(err, KcpCoreError::WindowExceeded { fragments: 128, limit: 127 });
        assert_eq!(a.wait_snd(), 0);
        a.send(&vec![0u8; 1376 * 127]).unwrap();
        assert_eq!(a.wait_snd(), 127);
    }

    #[test]
    fn test_small_receive_window_still_sends() {
        let mut a = KcpEngine::create(1, 1400, 32, 1).unwrap();
        assert_eq!(a.config().rcv_wnd, constants::IKCP_WND_RCV);
        a.send(b"x").unwrap();

        let mut b = KcpEngine::create(1, 1400, 32, 2).unwrap();
        b.send(&[0u8; 2000]).unwrap();
        assert_eq!(b.wait_snd(), 2);
    }

    #[test]
    fn test_set_window_size() {
        let (mut a, mut b) = pair(KcpCoreConfig::default().window_size(256, 256));
        a.set_nodelay(true, 10, 0, true);
        a.rmt_wnd = 256;
        for i in 0..200u8 {
            a.send(&[i]).unwrap();
        }
        a.update(0);
        b.update(0);
        let mut packets = a.drain_output();
        // hold back the datagram carrying sn 0 so everything else buffers out of order
        packets.remove(0);
        for packet in packets {
            b.input(&packet).unwrap();
        }
        let span = b.rcv_buf_span();
        assert!(span > constants::IKCP_WND_RCV);

        // zero keeps a side, small values are raised to the floor or to what is buffered
        b.set_window_size(0, 4);
        assert_eq!(b.config().snd_wnd, 256);
        assert_eq!(b.config().rcv_wnd, span);
        assert!(b.rcv_buf_span() <= b.config().rcv_wnd);

        a.set_window_size(64, 0);
        assert_eq!(a.config().snd_wnd, 64);
        assert_eq!(a.config().rcv_wnd, 256);
        a.set_window_size(0, 1);
        assert_eq!(a.config().rcv_wnd, constants::IKCP_WND_RCV);
    }

    #[test]
    fn test_nodelay_backoff_grows_by_half() {
        let (mut a, _) = pair(KcpCoreConfig::default());
        a.set_nodelay(true, 10, 0, true);
        a.send(b"unanswered").unwrap();

        let mut sent_at = Vec::new();
        let mut now = 0;
        while now <= 1000 {
            a.update(now);
            if !a.drain_output().is_empty() {
                sent_at.push(now);
            }
            now += 10;
        }
        assert_eq!(sent_at, vec![0, 200, 500, 950]);
    }

    #[test]
    fn test_normal_backoff_doubles() {
        let (mut a, _) = pair(KcpCoreConfig::default());
        a.send(b"unanswered").unwrap();

        let mut sent_at = Vec::new();
        let mut now = 0;
        while now <= 2000 {
            a.update(now);
            if !a.drain_output().is_empty() {
                sent_at.push(now);
            }
            now += 10;
        }
        // flushes every 40 ms; first resend due at rto + rto/8, then rto doubles
        assert_eq!(sent_at, vec![0, 240, 640, 1440]);
    }

    #[test]
    fn test_stream_mode_coalesces_tail() {
        let (mut a, _) = pair(KcpCoreConfig::default().stream_mode(true));
        a.send(b"hel").unwrap();
        a.send(b"lo").unwrap();
        assert_eq!(a.snd_queue.len(), 1);
        assert_eq!(&a.snd_queue[0].data[..], b"hello");

        a.send(&vec![1u8; 2000]).unwrap();
        assert_eq!(a.snd_queue.len(), 2);
        assert_eq!(a.snd_queue[0].data.len(), 1376);
        assert!(a.snd_queue.iter().all(|s| s.header.frg == 0));
    }

    #[test]
    fn test_flush_before_first_update_is_noop() {
        let (mut a, _) = pair(KcpCoreConfig::default());
        a.send(b"x").unwrap();
        a.flush();
        assert!(a.drain_output().is_empty());
        a.update(0);
        assert_eq!(a.drain_output().len(), 1);
    }

    #[test]
    fn test_update_respects_interval() {
        let (mut a, _) = pair(KcpCoreConfig::default());
        a.update(1000);
        a.send(b"x").unwrap();
        a.update(1010);
        assert!(a.drain_output().is_empty(), "interval 40 not elapsed");
        assert_eq!(a.check(1010), 1040);
        a.update(1040);
        assert_eq!(a.drain_output().len(), 1);
    }

    #[test]
    fn test_check_tracks_resend_deadline() {
        let (mut a, _) = pair(KcpCoreConfig::default().fast_mode());
        assert_eq!(a.check(5), 5);
        a.update(0);
        a.send(b"x").unwrap();
        a.update(10);
        // next flush at 20, resend at 10 + 200
        assert_eq!(a.check(11), 20);
        a.update(20);
        assert_eq!(a.check(20), 30);
    }

    #[test]
    fn test_malformed_datagram_changes_nothing() {
        let (mut a, mut b) = pair(KcpCoreConfig::default());
        a.send(b"hello").unwrap();
        a.update(0);
        let mut packet = a.drain_output().pop().unwrap().to_vec();

        let truncated = &packet[..10];
        assert!(matches!(b.input(truncated), Err(KcpCoreError::MalformedSegment { .. })));

        let mut over = packet.clone();
        over.truncate(packet.len() - 1);
        assert!(matches!(b.input(&over), Err(KcpCoreError::MalformedSegment { .. })));

        packet[4] = 90;
        assert!(matches!(b.input(&packet), Err(KcpCoreError::MalformedSegment { .. })));

        assert_eq!(b.rcv_nxt(), 0);
        assert!(b.ack_list.is_empty());
        assert_eq!(b.stats().packets_dropped, 3);
        assert_eq!(b.stats().packets_received, 0);
    }

    #[test]
    fn test_conv_mismatch_rejected() {
        let mut a = KcpEngine::new(100, KcpCoreConfig::default()).unwrap();
        let mut b = KcpEngine::new(999, KcpCoreConfig::default()).unwrap();
        a.send(b"mismatch").unwrap();
        a.update(0);
        let packet = a.drain_output().pop().unwrap();
        let err = b.input(&packet).unwrap_err();
        assert_eq!(err, KcpCoreError::ConvMismatch { expected: 999, actual: 100 });
        assert_eq!(b.peek_size(), Err(KcpCoreError::WouldBlock));
    }

    #[test]
    fn test_duplicate_push_does_not_duplicate_data() {
        let (mut a, mut b) = pair(KcpCoreConfig::default());
        a.send(b"once").unwrap();
        a.update(0);
        let packet = a.drain_output().pop().unwrap();

        b.update(0);
        for _ in 0..3 {
            b.input(&packet).unwrap();
        }
        assert_eq!(b.rcv_nxt(), 1);
        assert_eq!(b.rcv_queue_len(), 1);
        // every copy is still acknowledged
        assert_eq!(b.ack_list.len(), 3);

        let mut buf = [0u8; 16];
        assert_eq!(b.recv(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"once");
        assert_eq!(b.recv(&mut buf), Err(KcpCoreError::WouldBlock));
    }

    #[test]
    fn test_recv_buffer_too_small_consumes_nothing() {
        let (mut a, mut b) = pair(KcpCoreConfig::default());
        a.send(b"0123456789").unwrap();
        a.update(0);
        deliver(&mut a, &mut b);

        let mut small = [0u8; 4];
        assert_eq!(
            b.recv(&mut small),
            Err(KcpCoreError::BufferTooSmall { needed: 10, available: 4 })
        );
        assert_eq!(b.peek_size(), Ok(10));
        assert_eq!(b.recv_bytes().unwrap(), Bytes::from_static(b"0123456789"));
    }

    #[test]
    fn test_out_of_order_reassembly() {
        let (mut a, mut b) = pair(KcpCoreConfig::default().window_size(32, 32));
        a.set_nodelay(true, 10, 0, true);
        a.send(&[1u8; 3000]).unwrap();
        a.update(0);
        let mut packets = a.drain_output();
        // three fragments packed into three datagrams (mtu-sized)
        assert_eq!(packets.len(), 3);
        packets.reverse();

        b.update(0);
        b.input(&packets[0]).unwrap();
        b.input(&packets[1]).unwrap();
        assert_eq!(b.peek_size(), Err(KcpCoreError::WouldBlock));
        assert_eq!(b.rcv_buf_span(), 3);
        b.input(&packets[2]).unwrap();
        assert_eq!(b.peek_size(), Ok(3000));
        assert_eq!(b.recv_bytes().unwrap().len(), 3000);
    }

    #[test]
    fn test_push_outside_window_is_ignored() {
        let mut a = KcpEngine::new(1, KcpCoreConfig::default().window_size(512, 512)).unwrap();
        let mut b = KcpEngine::new(1, KcpCoreConfig::default()).unwrap();
        a.set_nodelay(true, 10, 0, true);
        a.rmt_wnd = 512;
        for i in 0..300u32 {
            a.send(&[i as u8]).unwrap();
        }
        a.update(0);
        b.update(0);
        let packets = a.drain_output();
        assert_eq!(packets.len(), 6, "small segments share datagrams");
        for packet in &packets {
            b.input(packet).unwrap();
        }

        // 0..128 delivered, 128..256 buffered while the queue is full,
        // 256..300 dropped unacked
        assert_eq!(b.rcv_nxt(), 128);
        assert_eq!(b.rcv_queue_len(), 128);
        assert_eq!(b.rcv_buf_span(), 128);
        assert_eq!(b.ack_list.len(), 256);
        assert_eq!(b.wnd_unused(), 0);
    }

    #[test]
    fn test_ack_retires_segment_and_feeds_rtt() {
        let (mut a, mut b) = pair(KcpCoreConfig::default());
        a.update(0);
        b.update(0);
        a.send(b"ping").unwrap();
        a.flush();
        deliver(&mut a, &mut b);

        b.update(50);
        a.update(30);
        assert_eq!(deliver(&mut b, &mut a), 1);

        assert_eq!(a.wait_snd(), 0);
        assert_eq!(a.snd_una(), 1);
        assert_eq!(a.rtt.srtt(), 30);
        assert_eq!(a.rto(), constants::IKCP_RTO_MIN);
    }

    #[test]
    fn test_window_tell_after_full_queue_drains() {
        let config = KcpCoreConfig::default().window_size(128, 128);
        let (mut a, mut b) = pair(config);
        a.set_nodelay(true, 10, 0, true);
        for _ in 0..128 {
            a.send(b"x").unwrap();
        }
        a.update(0);
        b.update(0);
        deliver(&mut a, &mut b);
        assert_eq!(b.rcv_queue_len(), 128);
        assert_eq!(b.wnd_unused(), 0);

        b.recv_bytes().unwrap();
        assert_ne!(b.probe.flags & constants::IKCP_ASK_TELL, 0);
    }

    #[test]
    fn test_release_returns_every_buffer() {
        let pool = Arc::new(SegmentPool::new());
        let config = KcpCoreConfig::default();
        let mut a = KcpEngine::with_pool(1, config.clone(), pool.clone()).unwrap();
        let mut b = KcpEngine::with_pool(1, config, pool.clone()).unwrap();

        a.send(&[0u8; 4000]).unwrap();
        a.send(b"queued").unwrap();
        a.update(0);
        b.update(0);
        deliver(&mut a, &mut b);
        assert!(pool.outstanding() > 0);

        a.release();
        b.release();
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_set_mtu_validation() {
        let (mut a, _) = pair(KcpCoreConfig::default());
        assert!(a.set_mtu(24).is_err());
        assert!(a.set_mtu(49).is_err());
        a.send(&[0u8; 1000]).unwrap();
        assert!(a.set_mtu(500).is_err());
        assert!(a.set_mtu(1200).is_ok());
        assert_eq!(a.mss(), 1176);
    }

    #[test]
    fn test_set_nodelay_adjusts_min_rto_and_interval() {
        let (mut a, _) = pair(KcpCoreConfig::default());
        assert_eq!(a.min_rto(), constants::IKCP_RTO_MIN);
        a.set_nodelay(true, 1, 2, false);
        assert_eq!(a.min_rto(), constants::IKCP_RTO_NDL);
        assert_eq!(a.interval(), constants::IKCP_INTERVAL_MIN);
        a.set_min_rto(10);
        a.set_nodelay(false, 20, 0, false);
        assert_eq!(a.min_rto(), 10, "explicit min rto survives mode changes");
    }
}
