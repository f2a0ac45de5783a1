//! Datagram assembly for the flush cycle.
//!
//! Segments are packed back to back into one buffer; when the next segment
//! would push the datagram past the MTU the buffer is emitted first. Emitted
//! datagrams go to the conversation's output callback when one is installed,
//! otherwise they queue up until the caller drains them.

use bytes::{Bytes, BytesMut};

/// Per-conversation output callback
pub type OutputFn = Box<dyn FnMut(Bytes) + Send>;

pub(crate) struct DatagramWriter {
    buf: BytesMut,
    mtu: usize,
    output: Option<OutputFn>,
    pending: Vec<Bytes>,
    pub(crate) datagrams: u64,
}

impl DatagramWriter {
    pub(crate) fn new(mtu: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(mtu),
            mtu,
            output: None,
            pending: Vec::new(),
            datagrams: 0,
        }
    }

    pub(crate) fn set_mtu(&mut self, mtu: usize) {
        self.emit();
        self.mtu = mtu;
    }

    pub(crate) fn set_output(&mut self, output: OutputFn) {
        self.output = Some(output);
    }

    /// Make room for `need` more bytes, emitting the current datagram if it would overflow.
    pub(crate) fn reserve(&mut self, need: usize) -> &mut BytesMut {
        if !self.buf.is_empty() && self.buf.len() + need > self.mtu {
            self.emit();
        }
        &mut self.buf
    }

    pub(crate) fn emit(&mut self) {
        if self.buf.is_empty() {
            return;
        }

        let datagram = self.buf.split().freeze();
        self.datagrams += 1;
        match self.output.as_mut() {
            Some(output) => output(datagram),
            None => self.pending.push(datagram),
        }
        self.buf.reserve(self.mtu);
    }

    pub(crate) fn drain(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_rolls_over_at_mtu() {
        let mut writer = DatagramWriter::new(50);
        writer.reserve(24).extend_from_slice(&[1u8; 24]);
        writer.reserve(24).extend_from_slice(&[2u8; 24]);
        // 48 + 24 > 50: previous datagram goes out first
        writer.reserve(24).extend_from_slice(&[3u8; 24]);
        writer.emit();

        let out = writer.drain();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].len(), 48);
        assert_eq!(out[1].len(), 24);
        assert_eq!(writer.datagrams, 2);
    }

    #[test]
    fn test_callback_receives_datagrams() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut writer = DatagramWriter::new(1400);
        writer.set_output(Box::new(move |d| sink.lock().unwrap().push(d)));
        writer.reserve(3).extend_from_slice(b"abc");
        writer.emit();
        writer.emit();

        assert!(writer.drain().is_empty());
        assert_eq!(seen.lock().unwrap().as_slice(), &[Bytes::from_static(b"abc")]);
    }
}
