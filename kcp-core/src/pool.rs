//! Size-classed buffer pool for segment payloads.
//!
//! Every segment payload is rented from a [`SegmentPool`] and handed back
//! exactly once, when the segment is consumed (acknowledged, delivered, or
//! released with its conversation). [`PooledBuf`] is not
//! `Clone`, so a payload has exactly one owner at any time.

use bytes::BytesMut;
use crossbeam_queue::ArrayQueue;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};

// (buffer capacity, max cached buffers) per tier
const DEFAULT_TIERS: [(usize, usize); 4] = [(256, 4096), (1500, 2048), (9000, 256), (65536, 32)];

struct Tier {
    capacity: usize,
    free: ArrayQueue<BytesMut>,
}

/// Payload buffer rented from a [`SegmentPool`].
#[derive(Debug)]
pub struct PooledBuf {
    buf: BytesMut,
    tier: Option<usize>,
}

impl PooledBuf {
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

/// Lock-free pool of payload buffers keyed by size class.
///
/// A single pool may be shared (`Arc<SegmentPool>`) by conversations pinned
/// to different workers; the free lists are `crossbeam_queue::ArrayQueue`s.
pub struct SegmentPool {
    tiers: Vec<Tier>,
    rented: AtomicU64,
    returned: AtomicU64,
    hits: AtomicU64,
}

/// Pool counters at a point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub rented: u64,
    pub returned: u64,
    pub hits: u64,
    pub cached: usize,
}

impl SegmentPool {
    pub fn new() -> Self {
        Self::with_tiers(&DEFAULT_TIERS)
    }

    /// Build a pool from `(capacity, max_cached)` pairs, smallest first.
    pub fn with_tiers(tiers: &[(usize, usize)]) -> Self {
        let mut tiers: Vec<Tier> = tiers
            .iter()
            .filter(|(_, cached)| *cached > 0)
            .map(|&(capacity, cached)| Tier {
                capacity,
                free: ArrayQueue::new(cached),
            })
            .collect();
        tiers.sort_by_key(|t| t.capacity);

        Self {
            tiers,
            rented: AtomicU64::new(0),
            returned: AtomicU64::new(0),
            hits: AtomicU64::new(0),
        }
    }

    /// Rent an empty buffer able to hold `size` bytes without reallocating.
    pub fn rent(&self, size: usize) -> PooledBuf {
        self.rented.fetch_add(1, Ordering::Relaxed);

        let Some(index) = self.tiers.iter().position(|t| t.capacity >= size) else {
            return PooledBuf {
                buf: BytesMut::with_capacity(size),
                tier: None,
            };
        };

        let tier = &self.tiers[index];
        let buf = match tier.free.pop() {
            Some(buf) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => BytesMut::with_capacity(tier.capacity),
        };

        PooledBuf {
            buf,
            tier: Some(index),
        }
    }

    /// Hand a buffer back. Consumes it, so the same buffer cannot come back twice.
    pub fn give_back(&self, pooled: PooledBuf) {
        self.returned.fetch_add(1, Ordering::Relaxed);

        let PooledBuf { mut buf, tier } = pooled;
        let Some(tier) = tier.and_then(|i| self.tiers.get(i)) else {
            return;
        };

        // grown past the tier by an oversized extend: let it drop
        if buf.capacity() < tier.capacity || buf.capacity() > tier.capacity * 2 {
            return;
        }
        buf.clear();
        let _ = tier.free.push(buf); // Ignore if full
    }

    /// Buffers rented and not yet handed back
    pub fn outstanding(&self) -> u64 {
        let rented = self.rented.load(Ordering::Relaxed);
        let returned = self.returned.load(Ordering::Relaxed);
        rented.saturating_sub(returned)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            rented: self.rented.load(Ordering::Relaxed),
            returned: self.returned.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            cached: self.tiers.iter().map(|t| t.free.len()).sum(),
        }
    }
}

impl Default for SegmentPool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SegmentPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentPool")
            .field("tiers", &self.tiers.iter().map(|t| t.capacity).collect::<Vec<_>>())
            .field("stats", &self.stats())
            .finish()
    }
}
