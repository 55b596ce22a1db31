//! Bounded overwrite queue for frames waiting on the analysis worker

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;

use crate::capture::Frame;

/// Ring buffer that never blocks the producer: when full, the oldest pending
/// frame is evicted and handed back so the caller can release it.
pub struct FrameRingBuffer {
    ring: HeapRb<Frame>,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    frames_written: AtomicUsize,
    frames_read: AtomicUsize,
    frames_dropped: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RingStats {
    pub written: usize,
    pub read: usize,
    pub dropped: usize,
}

impl FrameRingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: HeapRb::new(capacity.max(1)),
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Producer: push a frame, returning the stale frame it displaced.
    pub fn push(&mut self, frame: Frame) -> Option<Frame> {
        let evicted = self.ring.push_overwrite(frame);
        if evicted.is_some() {
            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.frames_written.fetch_add(1, Ordering::Relaxed);
        evicted
    }

    /// Consumer: pop the oldest pending frame.
    pub fn pop(&mut self) -> Option<Frame> {
        let frame = self.ring.try_pop()?;
        self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
        Some(frame)
    }

    /// Remove every pending frame without counting them as read.
    pub fn clear(&mut self) -> Vec<Frame> {
        let mut drained = Vec::with_capacity(self.len());
        while let Some(frame) = self.ring.try_pop() {
            drained.push(frame);
        }
        self.stats
            .frames_dropped
            .fetch_add(drained.len(), Ordering::Relaxed);
        drained
    }

    pub fn len(&self) -> usize {
        self.ring.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity().get()
    }

    pub fn stats(&self) -> RingStats {
        RingStats {
            written: self.stats.frames_written.load(Ordering::Relaxed),
            read: self.stats.frames_read.load(Ordering::Relaxed),
            dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FrameMetadata, PixelFormat};
    use bytes::Bytes;

    fn frame(sequence: u64) -> Frame {
        Frame::new(
            Bytes::new(),
            FrameMetadata {
                sequence,
                width: 1,
                height: 1,
                stride: 0,
                format: PixelFormat::Rgba32,
                rotation_degrees: 0,
                device_timestamp: None,
            },
        )
    }

    #[test]
    fn single_slot_keeps_only_latest() {
        let mut ring = FrameRingBuffer::new(1);
        assert!(ring.push(frame(1)).is_none());
        let stale = ring.push(frame(2)).expect("first frame evicted");
        assert_eq!(stale.sequence(), 1);

        assert_eq!(ring.pop().map(|f| f.sequence()), Some(2));
        assert!(ring.pop().is_none());
        assert_eq!(
            ring.stats(),
            RingStats {
                written: 2,
                read: 1,
                dropped: 1
            }
        );
    }

    #[test]
    fn deeper_ring_drops_oldest() {
        let mut ring = FrameRingBuffer::new(3);
        for seq in 1..=5 {
            ring.push(frame(seq));
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.pop().map(|f| f.sequence()), Some(3));
        assert_eq!(ring.clear().len(), 2);
        assert!(ring.is_empty());
        assert_eq!(ring.stats().dropped, 4);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        assert_eq!(FrameRingBuffer::new(0).capacity(), 1);
    }
}
