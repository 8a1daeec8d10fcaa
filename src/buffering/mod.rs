//! Multichannel ring-buffered sample store addressed by absolute sample index.
//!
//! The absolute sample counter is the pipeline's universal clock: it never
//! decreases and always equals the total number of samples ever written per
//! channel. Reads address that counter directly and come back as wrap-aware
//! [`Segment`] views, so downstream stages never deal with ring positions.
//!
//! The readable window is `[total_write_count − capacity, total_write_count)`;
//! writing past capacity is an explicit overwrite of the oldest samples.

pub mod segment;

use crate::error::{Result, VadError};
use segment::{Segment, SplitSlice};

/// Per-channel circular storage with a shared absolute write counter.
#[derive(Debug)]
pub struct MultiRingBuffer<T> {
    capacity: usize,
    channels: Vec<Vec<T>>,
    total_write_count: u64,
}

impl<T: Copy + Default> MultiRingBuffer<T> {
    /// Allocate `n_channels × capacity` storage up front.
    ///
    /// # Panics
    /// Panics on a zero channel count or capacity.
    pub fn new(n_channels: usize, capacity: usize) -> Self {
        assert!(n_channels > 0, "ring buffer needs at least one channel");
        assert!(capacity > 0, "ring buffer needs a non-zero capacity");
        Self {
            capacity,
            channels: vec![vec![T::default(); capacity]; n_channels],
            total_write_count: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn n_channels(&self) -> usize {
        self.channels.len()
    }

    /// Total samples ever written per channel; the absolute clock.
    pub fn total_write_count(&self) -> u64 {
        self.total_write_count
    }

    /// Current ring write position.
    pub fn write_index(&self) -> usize {
        (self.total_write_count % self.capacity as u64) as usize
    }

    /// Oldest absolute index still readable.
    pub fn oldest_readable(&self) -> u64 {
        self.total_write_count.saturating_sub(self.capacity as u64)
    }

    /// Write up to `max_count` samples per channel starting at `src_offset`,
    /// returning the count actually written.
    ///
    /// A count larger than the capacity still advances the absolute counter
    /// by the full amount; only the last `capacity` samples remain readable
    /// afterwards (explicit overwrite of everything older).
    pub fn write(&mut self, src: &[&[T]], src_offset: usize, max_count: usize) -> Result<usize> {
        if src.len() != self.channels.len() {
            return Err(VadError::ChannelMismatch {
                expected: self.channels.len(),
                got: src.len(),
            });
        }
        let len = src[0].len();
        if let Some(other) = src.iter().find(|ch| ch.len() != len) {
            return Err(VadError::ChannelMismatch {
                expected: len,
                got: other.len(),
            });
        }

        let written = max_count.min(len.saturating_sub(src_offset));
        let mut offset = src_offset;
        let mut remaining = written;
        while remaining > 0 {
            let chunk = remaining.min(self.capacity);
            self.write_chunk(src, offset, chunk);
            offset += chunk;
            remaining -= chunk;
        }
        Ok(written)
    }

    /// One wrap-aware copy of `count ≤ capacity` samples per channel.
    fn write_chunk(&mut self, src: &[&[T]], offset: usize, count: usize) {
        let at = self.write_index();
        let tail = (self.capacity - at).min(count);
        for (dst, ch) in self.channels.iter_mut().zip(src) {
            dst[at..at + tail].copy_from_slice(&ch[offset..offset + tail]);
            if tail < count {
                dst[..count - tail].copy_from_slice(&ch[offset + tail..offset + count]);
            }
        }
        self.total_write_count += count as u64;
    }

    /// Non-consuming view of the absolute range `[abs_from, abs_to)`.
    ///
    /// # Errors
    /// - [`VadError::InvalidRange`] when `abs_to ≤ abs_from`.
    /// - [`VadError::RangeTooLong`] when the span exceeds the capacity.
    /// - [`VadError::IndexOutOfBounds`] when the range is not wholly inside
    ///   the readable window.
    pub fn read_slice(&self, abs_from: u64, abs_to: u64) -> Result<Segment<'_, T>> {
        if abs_to <= abs_from {
            return Err(VadError::InvalidRange {
                from: abs_from,
                to: abs_to,
            });
        }
        if abs_to - abs_from > self.capacity as u64 {
            return Err(VadError::RangeTooLong {
                from: abs_from,
                to: abs_to,
                capacity: self.capacity,
            });
        }
        if abs_from < self.oldest_readable() || abs_to > self.total_write_count {
            return Err(VadError::IndexOutOfBounds {
                from: abs_from,
                to: abs_to,
                oldest: self.oldest_readable(),
                newest: self.total_write_count,
            });
        }

        let rel_from = (abs_from % self.capacity as u64) as usize;
        let rel_to = (abs_to % self.capacity as u64) as usize;
        let channels = self
            .channels
            .iter()
            .map(|buf| {
                if rel_from < rel_to {
                    SplitSlice::new(&buf[rel_from..rel_to], &[])
                } else {
                    // wrapped read, including the full-capacity case
                    SplitSlice::new(&buf[rel_from..], &buf[..rel_to])
                }
            })
            .collect();
        Ok(Segment::new(abs_from, channels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(from: usize, len: usize) -> Vec<f32> {
        (from..from + len).map(|i| i as f32).collect()
    }

    fn read_channel(buf: &MultiRingBuffer<f32>, ch: usize, from: u64, to: u64) -> Vec<f32> {
        let seg = buf.read_slice(from, to).unwrap();
        seg.channel(ch).iter().copied().collect()
    }

    #[test]
    fn write_then_read_back_verbatim() {
        let mut buf = MultiRingBuffer::<f32>::new(2, 16);
        let c0 = ramp(0, 10);
        let c1 = ramp(100, 10);
        let written = buf.write(&[&c0, &c1], 0, 10).unwrap();
        assert_eq!(written, 10);
        assert_eq!(buf.total_write_count(), 10);

        assert_eq!(read_channel(&buf, 0, 0, 10), c0);
        assert_eq!(read_channel(&buf, 1, 0, 10), c1);
    }

    #[test]
    fn wrapped_read_concatenates_both_halves() {
        let mut buf = MultiRingBuffer::<f32>::new(1, 8);
        let data = ramp(0, 12);
        buf.write(&[&data], 0, 12).unwrap();

        // readable window is [4, 12); the range [6, 12) wraps at index 8
        assert_eq!(read_channel(&buf, 0, 6, 12), ramp(6, 6));
        let seg = buf.read_slice(6, 12).unwrap();
        assert!(!seg.channel(0).second.is_empty());
    }

    #[test]
    fn overwrite_makes_oldest_samples_unreadable() {
        let mut buf = MultiRingBuffer::<f32>::new(1, 8);
        let data = ramp(0, 11);
        buf.write(&[&data], 0, 11).unwrap();

        assert!(matches!(
            buf.read_slice(0, 4),
            Err(VadError::IndexOutOfBounds { .. })
        ));
        assert_eq!(read_channel(&buf, 0, 3, 11), ramp(3, 8));
    }

    #[test]
    fn oversized_write_keeps_only_the_tail() {
        let mut buf = MultiRingBuffer::<f32>::new(1, 4);
        let data = ramp(0, 10);
        let written = buf.write(&[&data], 0, 10).unwrap();
        assert_eq!(written, 10);
        assert_eq!(buf.total_write_count(), 10);
        assert_eq!(read_channel(&buf, 0, 6, 10), ramp(6, 4));
    }

    #[test]
    fn full_capacity_read_wraps_once() {
        let mut buf = MultiRingBuffer::<f32>::new(1, 8);
        buf.write(&[&ramp(0, 10)], 0, 10).unwrap();
        // [2, 10) spans exactly the capacity; rel_from == rel_to
        assert_eq!(read_channel(&buf, 0, 2, 10), ramp(2, 8));
    }

    #[test]
    fn offset_and_max_count_limit_the_write() {
        let mut buf = MultiRingBuffer::<f32>::new(1, 16);
        let data = ramp(0, 10);
        let written = buf.write(&[&data], 4, 3).unwrap();
        assert_eq!(written, 3);
        assert_eq!(read_channel(&buf, 0, 0, 3), ramp(4, 3));
    }

    #[test]
    fn rejects_malformed_ranges() {
        let mut buf = MultiRingBuffer::<f32>::new(1, 8);
        buf.write(&[&ramp(0, 8)], 0, 8).unwrap();

        assert!(matches!(
            buf.read_slice(5, 5),
            Err(VadError::InvalidRange { .. })
        ));
        assert!(matches!(
            buf.read_slice(0, 9),
            Err(VadError::RangeTooLong { .. })
        ));
        assert!(matches!(
            buf.read_slice(4, 9),
            Err(VadError::IndexOutOfBounds { .. })
        ));
    }

    #[test]
    fn rejects_channel_shape_mismatch() {
        let mut buf = MultiRingBuffer::<f32>::new(2, 8);
        let a = ramp(0, 4);
        let b = ramp(0, 3);
        assert!(matches!(
            buf.write(&[&a], 0, 4),
            Err(VadError::ChannelMismatch { .. })
        ));
        assert!(matches!(
            buf.write(&[&a, &b], 0, 4),
            Err(VadError::ChannelMismatch { .. })
        ));
    }
}
