//! Lockless SPSC message rings.
//!
//! Each ring carries self-describing frames: an 8-byte header (total size,
//! type URID) followed by the body.  The producer commits a frame as a
//! single chunk, so the consumer only ever observes whole messages.  A send
//! that does not fit is dropped with a counter bump - the engine never
//! blocks on a full ring.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use rtrb::{Consumer, Producer, RingBuffer};

use crate::urid::Urid;

pub const FRAME_HEADER: usize = 8;

/// Lock-free traffic counters, readable from any thread.
#[derive(Debug, Default)]
pub struct RingStats {
    pub sent: AtomicU64,
    pub dropped: AtomicU64,
}

impl RingStats {
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

/// Producer half.
pub struct RingTx {
    prod: Producer<u8>,
    stats: Arc<RingStats>,
}

/// Consumer half.
pub struct RingRx {
    cons: Consumer<u8>,
}

/// One decoded frame header; the body lives in the caller's scratch buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub type_urid: Urid,
    pub body_len: usize,
}

/// Create a connected ring of `capacity` bytes.
pub fn ring(capacity: usize) -> (RingTx, RingRx) {
    let (prod, cons) = RingBuffer::new(capacity);
    let stats = Arc::new(RingStats::default());
    (RingTx { prod, stats }, RingRx { cons })
}

impl RingTx {
    pub fn stats(&self) -> Arc<RingStats> {
        self.stats.clone()
    }

    /// Send one frame.  Returns `false` (ring unchanged, drop counted) when
    /// the reservation fails.
    pub fn send(&mut self, type_urid: Urid, body: &[u8]) -> bool {
        self.send_parts(type_urid, &[body])
    }

    /// Send one frame whose body is the concatenation of `parts`, without
    /// gathering them first.  RT-safe.
    pub fn send_parts(&mut self, type_urid: Urid, parts: &[&[u8]]) -> bool {
        let body_len: usize = parts.iter().map(|p| p.len()).sum();
        let total = FRAME_HEADER + body_len;

        let Ok(chunk) = self.prod.write_chunk_uninit(total) else {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        };

        let header = (total as u32).to_ne_bytes();
        let ty = type_urid.to_ne_bytes();
        let iter = header
            .into_iter()
            .chain(ty)
            .chain(parts.iter().flat_map(|p| p.iter().copied()));
        let written = chunk.fill_from_iter(iter);
        debug_assert_eq!(written, total);

        self.stats.sent.fetch_add(1, Ordering::Relaxed);
        true
    }
}

impl RingRx {
    /// Whether at least one full frame is waiting.
    pub fn is_empty(&self) -> bool {
        self.cons.slots() < FRAME_HEADER
    }

    /// Receive one frame into `scratch` (cleared first).  Returns `None`
    /// when the ring is empty.  `scratch` must have been reserved large
    /// enough by the caller if allocation is not allowed on this thread.
    pub fn recv(&mut self, scratch: &mut Vec<u8>) -> Option<FrameHeader> {
        // Peek the header without committing.
        let total;
        let type_urid;
        {
            let Ok(chunk) = self.cons.read_chunk(FRAME_HEADER) else {
                return None;
            };
            let (a, b) = chunk.as_slices();
            let mut hdr = [0u8; FRAME_HEADER];
            let n = a.len().min(FRAME_HEADER);
            hdr[..n].copy_from_slice(&a[..n]);
            hdr[n..].copy_from_slice(&b[..FRAME_HEADER - n]);
            total = u32::from_ne_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]) as usize;
            type_urid = u32::from_ne_bytes([hdr[4], hdr[5], hdr[6], hdr[7]]);
            // chunk dropped uncommitted - pure peek
        }

        if total < FRAME_HEADER {
            // Corrupt header; skip what we peeked to resynchronise.
            if let Ok(chunk) = self.cons.read_chunk(FRAME_HEADER) {
                chunk.commit_all();
            }
            return None;
        }

        let Ok(chunk) = self.cons.read_chunk(total) else {
            // Producer commits whole frames, so this only happens mid-write;
            // leave the ring untouched and try again next drain.
            return None;
        };

        scratch.clear();
        let (a, b) = chunk.as_slices();
        scratch.extend_from_slice(&a[FRAME_HEADER.min(a.len())..]);
        if a.len() < FRAME_HEADER {
            scratch.extend_from_slice(&b[FRAME_HEADER - a.len()..]);
        } else {
            scratch.extend_from_slice(b);
        }
        chunk.commit_all();

        Some(FrameHeader {
            type_urid,
            body_len: total - FRAME_HEADER,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_arrive_in_order() {
        let (mut tx, mut rx) = ring(256);
        assert!(tx.send(7, b"hello"));
        assert!(tx.send_parts(9, &[b"wor", b"ld"]));

        let mut scratch = Vec::new();
        let h = rx.recv(&mut scratch).unwrap();
        assert_eq!(h.type_urid, 7);
        assert_eq!(&scratch[..], b"hello");

        let h = rx.recv(&mut scratch).unwrap();
        assert_eq!(h.type_urid, 9);
        assert_eq!(&scratch[..], b"world");

        assert!(rx.recv(&mut scratch).is_none());
    }

    #[test]
    fn failed_reservation_leaves_ring_unchanged() {
        let (mut tx, mut rx) = ring(32);
        assert!(tx.send(1, &[0u8; 16])); // 24 of 32 bytes used
        let stats = tx.stats();
        assert!(!tx.send(2, &[0u8; 16])); // would need 24 more
        assert_eq!(stats.dropped(), 1);

        // The first frame is still intact.
        let mut scratch = Vec::new();
        let h = rx.recv(&mut scratch).unwrap();
        assert_eq!(h.type_urid, 1);
        assert_eq!(scratch.len(), 16);
        assert!(rx.recv(&mut scratch).is_none());

        // And the ring is usable again after draining.
        assert!(tx.send(3, &[0u8; 16]));
        assert_eq!(stats.sent(), 2);
    }

    #[test]
    fn empty_body_frames() {
        let (mut tx, mut rx) = ring(64);
        assert!(tx.send(42, &[]));
        let mut scratch = vec![1u8; 8];
        let h = rx.recv(&mut scratch).unwrap();
        assert_eq!(h.type_urid, 42);
        assert_eq!(h.body_len, 0);
        assert!(scratch.is_empty());
    }
}
