//! KCP protocol types, constants, and utilities

use crate::error::{KcpCoreError, KcpCoreResult};
use bytes::{Buf, BufMut, BytesMut};

/// KCP protocol constants
pub mod constants {
    pub const IKCP_RTO_NDL: u32 = 30; // no delay min rto
    pub const IKCP_RTO_MIN: u32 = 100; // normal min rto
    pub const IKCP_RTO_DEF: u32 = 200; // default rto
    pub const IKCP_RTO_MAX: u32 = 60000; // max rto
    pub const IKCP_CMD_PUSH: u8 = 81; // cmd: push data
    pub const IKCP_CMD_ACK: u8 = 82; // cmd: ack
    pub const IKCP_CMD_WASK: u8 = 83; // cmd: window probe (ask)
    pub const IKCP_CMD_WINS: u8 = 84; // cmd: window size (tell)
    pub const IKCP_ASK_SEND: u32 = 1; // need to send IKCP_CMD_WASK
    pub const IKCP_ASK_TELL: u32 = 2; // need to send IKCP_CMD_WINS
    pub const IKCP_WND_SND: u32 = 32; // default send window
    pub const IKCP_WND_RCV: u32 = 128; // default receive window
    pub const IKCP_MTU_DEF: u32 = 1400; // default mtu
    pub const IKCP_MTU_MIN: u32 = 50; // smallest accepted mtu
    pub const IKCP_ACK_FAST: u32 = 3; // fast ack threshold
    pub const IKCP_INTERVAL: u32 = 100; // default update interval
    pub const IKCP_INTERVAL_MIN: u32 = 10;
    pub const IKCP_INTERVAL_MAX: u32 = 5000;
    pub const IKCP_OVERHEAD: u32 = 24; // kcp header overhead
    pub const IKCP_DEADLINK: u32 = 20; // max dead link count
    pub const IKCP_THRESH_INIT: u32 = 2; // initial slow start threshold
    pub const IKCP_THRESH_MIN: u32 = 2; // min slow start threshold
    pub const IKCP_PROBE_INIT: u32 = 7000; // 7 secs to probe window size
    pub const IKCP_PROBE_LIMIT: u32 = 120000; // up to 120 secs to probe window
    pub const IKCP_FASTACK_LIMIT: u32 = 5; // max times to trigger fastack
    pub const IKCP_FRG_MAX: usize = 255; // frg is a single byte on the wire
    pub const IKCP_SLAP_LIMIT: i32 = 10000; // clock jump that resets the flush baseline
}

/// Conversation ID type
pub type ConvId = u32;

/// Sequence number type
pub type SeqNum = u32;

/// Timestamp type (milliseconds on the caller's clock)
pub type Timestamp = u32;

/// Segment command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    Push = constants::IKCP_CMD_PUSH,
    Ack = constants::IKCP_CMD_ACK,
    WindowAsk = constants::IKCP_CMD_WASK,
    WindowTell = constants::IKCP_CMD_WINS,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Push => "PUSH",
            Command::Ack => "ACK",
            Command::WindowAsk => "WASK",
            Command::WindowTell => "WINS",
        }
    }
}

impl TryFrom<u8> for Command {
    type Error = KcpCoreError;

    fn try_from(value: u8) -> KcpCoreResult<Self> {
        match value {
            constants::IKCP_CMD_PUSH => Ok(Command::Push),
            constants::IKCP_CMD_ACK => Ok(Command::Ack),
            constants::IKCP_CMD_WASK => Ok(Command::WindowAsk),
            constants::IKCP_CMD_WINS => Ok(Command::WindowTell),
            other => Err(KcpCoreError::malformed(format!("unknown command {other}"))),
        }
    }
}

/// KCP segment header structure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KcpHeader {
    pub conv: ConvId,
    pub cmd: Command,
    pub frg: u8,
    pub wnd: u16,
    pub ts: Timestamp,
    pub sn: SeqNum,
    pub una: SeqNum,
    pub len: u32,
}

impl KcpHeader {
    /// Size of KCP header in bytes
    pub const SIZE: usize = constants::IKCP_OVERHEAD as usize;

    pub fn new(conv: ConvId, cmd: Command) -> Self {
        Self {
            conv,
            cmd,
            frg: 0,
            wnd: 0,
            ts: 0,
            sn: 0,
            una: 0,
            len: 0,
        }
    }

    /// Encode header into buffer
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.conv);
        buf.put_u8(self.cmd as u8);
        buf.put_u8(self.frg);
        buf.put_u16_le(self.wnd);
        buf.put_u32_le(self.ts);
        buf.put_u32_le(self.sn);
        buf.put_u32_le(self.una);
        buf.put_u32_le(self.len);
    }

    /// Decode header from the front of `buf`, advancing it past the header.
    pub fn decode(buf: &mut impl Buf) -> KcpCoreResult<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(KcpCoreError::malformed(format!(
                "truncated header: {} bytes",
                buf.remaining()
            )));
        }

        let conv = buf.get_u32_le();
        let cmd = Command::try_from(buf.get_u8())?;
        Ok(Self {
            conv,
            cmd,
            frg: buf.get_u8(),
            wnd: buf.get_u16_le(),
            ts: buf.get_u32_le(),
            sn: buf.get_u32_le(),
            una: buf.get_u32_le(),
            len: buf.get_u32_le(),
        })
    }
}

/// Read the conversation id of a raw datagram without parsing the rest.
pub fn peek_conv(datagram: &[u8]) -> Option<ConvId> {
    let head: [u8; 4] = datagram.get(..4)?.try_into().ok()?;
    Some(u32::from_le_bytes(head))
}

/// Iterator over the segments packed into one datagram.
///
/// Yields `(header, payload)` pairs while at least one header worth of bytes
/// remains; a trailing fragment shorter than a header is ignored. After the
/// first error the iterator is exhausted.
pub struct SegmentIter<'a> {
    rest: &'a [u8],
    failed: bool,
}

impl<'a> SegmentIter<'a> {
    pub fn new(datagram: &'a [u8]) -> Self {
        Self {
            rest: datagram,
            failed: false,
        }
    }
}

impl<'a> Iterator for SegmentIter<'a> {
    type Item = KcpCoreResult<(KcpHeader, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.rest.len() < KcpHeader::SIZE {
            return None;
        }

        let mut cursor = self.rest;
        let header = match KcpHeader::decode(&mut cursor) {
            Ok(header) => header,
            Err(e) => {
                self.failed = true;
                return Some(Err(e));
            }
        };

        let len = header.len as usize;
        if len > cursor.len() {
            self.failed = true;
            return Some(Err(KcpCoreError::malformed(format!(
                "declared length {len} exceeds remaining {}",
                cursor.len()
            ))));
        }

        let (payload, rest) = cursor.split_at(len);
        self.rest = rest;
        Some(Ok((header, payload)))
    }
}

/// Statistics for KCP connection
#[derive(Debug, Default, Clone, Copy)]
pub struct KcpStats {
    /// Total payload bytes accepted by `send`
    pub bytes_sent: u64,
    /// Total payload bytes delivered by `recv`
    pub bytes_received: u64,
    /// Datagrams emitted
    pub packets_sent: u64,
    /// Datagrams accepted by `input`
    pub packets_received: u64,
    /// Datagrams dropped as malformed or misaddressed
    pub packets_dropped: u64,
    /// Timeout retransmissions
    pub retransmissions: u64,
    /// Fast retransmissions
    pub fast_retransmissions: u64,
    /// Smoothed RTT in milliseconds
    pub rtt: u32,
    /// RTT variance
    pub rtt_var: u32,
    /// Current RTO
    pub rto: u32,
    /// Send window size
    pub snd_wnd: u32,
    /// Receive window size
    pub rcv_wnd: u32,
    /// Remote advertised window
    pub rmt_wnd: u32,
    /// Congestion window size
    pub cwnd: u32,
    /// Slow start threshold
    pub ssthresh: u32,
    /// Packets in send buffer
    pub snd_buf_size: u32,
    /// Packets in receive buffer
    pub rcv_buf_size: u32,
}

/// Calculate time difference handling wrapping
pub fn time_diff(later: Timestamp, earlier: Timestamp) -> i32 {
    later.wrapping_sub(earlier) as i32
}

/// Check if a sequence number is before another (handling wrapping)
pub fn seq_before(seq1: SeqNum, seq2: SeqNum) -> bool {
    (seq1.wrapping_sub(seq2) as i32) < 0
}

/// Check if a sequence number is after another (handling wrapping)
pub fn seq_after(seq1: SeqNum, seq2: SeqNum) -> bool {
    (seq1.wrapping_sub(seq2) as i32) > 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> KcpHeader {
        KcpHeader {
            conv: 0x0102_0304,
            cmd: Command::Push,
            frg: 3,
            wnd: 128,
            ts: 0xAABB_CCDD,
            sn: 7,
            una: 5,
            len: 2,
        }
    }

    #[test]
    fn test_header_layout_is_little_endian() {
        let mut buf = BytesMut::new();
        sample_header().encode(&mut buf);
        assert_eq!(buf.len(), KcpHeader::SIZE);
        assert_eq!(&buf[..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(buf[4], 81);
        assert_eq!(buf[5], 3);
        assert_eq!(&buf[6..8], &[128, 0]);
        assert_eq!(&buf[8..12], &[0xDD, 0xCC, 0xBB, 0xAA]);
        assert_eq!(&buf[20..24], &[2, 0, 0, 0]);
    }

    #[test]
    fn test_unknown_command_rejected() {
        let mut buf = BytesMut::new();
        sample_header().encode(&mut buf);
        buf[4] = 99;
        let err = KcpHeader::decode(&mut &buf[..]).unwrap_err();
        assert!(matches!(err, KcpCoreError::MalformedSegment { .. }));
    }

    #[test]
    fn test_segment_iter_packed_datagram() {
        let mut buf = BytesMut::new();
        sample_header().encode(&mut buf);
        buf.extend_from_slice(b"hi");
        let mut ack = KcpHeader::new(0x0102_0304, Command::Ack);
        ack.sn = 9;
        ack.encode(&mut buf);
        // trailing bytes shorter than a header are ignored
        buf.extend_from_slice(&[0u8; 5]);

        let segs: Vec<_> = SegmentIter::new(&buf).collect::<KcpCoreResult<_>>().unwrap();
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[0].1, b"hi");
        assert_eq!(segs[1].0.cmd, Command::Ack);
        assert_eq!(segs[1].0.sn, 9);
    }

    #[test]
    fn test_segment_iter_over_length() {
        let mut header = sample_header();
        header.len = 100;
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        buf.extend_from_slice(b"short");

        let mut iter = SegmentIter::new(&buf);
        assert!(iter.next().unwrap().is_err());
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_peek_conv() {
        assert_eq!(peek_conv(&[1, 0, 0, 0, 81]), Some(1));
        assert_eq!(peek_conv(&[1, 0]), None);
    }

    #[test]
    fn test_sequence_wrapping() {
        assert!(seq_before(u32::MAX, 0));
        assert!(seq_after(1, u32::MAX));
        assert_eq!(time_diff(5, u32::MAX - 4), 10);
        assert_eq!(time_diff(0, 10), -10);
    }
}
