//! Retransmittable segment: wire header, pooled payload, and ARQ bookkeeping

use crate::pool::PooledBuf;
use crate::protocol::{constants, Command, ConvId, KcpHeader, Timestamp};
use bytes::BytesMut;

#[derive(Debug)]
pub struct KcpSegment {
    pub header: KcpHeader,
    pub data: PooledBuf,

    // Internal fields for protocol logic
    pub resendts: Timestamp,
    pub rto: u32,
    pub fastack: u32,
    pub xmit: u32,
}

impl KcpSegment {
    pub fn new(header: KcpHeader, data: PooledBuf) -> Self {
        Self {
            header,
            data,
            resendts: 0,
            rto: constants::IKCP_RTO_DEF,
            fastack: 0,
            xmit: 0,
        }
    }

    /// Create an unsequenced PUSH segment; `sn` is assigned on admission to the send buffer
    pub fn push(conv: ConvId, frg: u8, data: PooledBuf) -> Self {
        let mut header = KcpHeader::new(conv, Command::Push);
        header.frg = frg;
        Self::new(header, data)
    }

    /// Encode header and payload; the header length always mirrors the payload.
    pub fn encode(&self, buf: &mut BytesMut) {
        let mut header = self.header;
        header.len = self.data.len() as u32;
        header.encode(buf);
        buf.extend_from_slice(&self.data);
    }

    /// Get total encoded size
    pub fn size(&self) -> usize {
        KcpHeader::SIZE + self.data.len()
    }

    pub fn sn(&self) -> u32 {
        self.header.sn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::SegmentPool;
    use crate::protocol::SegmentIter;

    #[test]
    fn test_encode_sets_length() {
        let pool = SegmentPool::new();
        let mut data = pool.rent(5);
        data.extend_from_slice(b"hello");
        let mut seg = KcpSegment::push(42, 1, data);
        seg.header.sn = 3;

        let mut buf = BytesMut::new();
        seg.encode(&mut buf);
        assert_eq!(buf.len(), seg.size());

        let (header, payload) = SegmentIter::new(&buf).next().unwrap().unwrap();
        assert_eq!(header.len, 5);
        assert_eq!(header.frg, 1);
        assert_eq!(header.sn, 3);
        assert_eq!(payload, b"hello");

        pool.give_back(seg.data);
    }
}
