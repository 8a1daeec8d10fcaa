//! Growable speech capture fed from ring-buffer slices.
//!
//! The recorder owns a [`SegmentWriter`] whose target grows in ten-second
//! steps, so a long radio message costs a handful of reallocations instead
//! of one per frame. The pipeline copies ranges out of the ring buffer into
//! it: eagerly when old samples are about to be overwritten, and finally up
//! to the padded segment end when a capture completes.

use tracing::{debug, info};

use crate::buffering::segment::{Segment, SegmentWriter};
use crate::error::{Result, VadError};

/// Minimum growth step in seconds of audio.
const GROWTH_SEC: u64 = 10;

/// A finished recording, handed to the `on_recording` callback.
///
/// Ownership passes to the callback for the duration of the call; the callee
/// must copy anything it wants to keep.
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    pub sample_rate: u32,
    pub n_channels: usize,
    /// Samples per channel.
    pub length: usize,
    pub channel_pcm: Vec<Vec<f32>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecorderStatus {
    Idle,
    Recording,
}

/// Captures a padded copy of one speech range at a time.
#[derive(Debug)]
pub struct Recorder {
    status: RecorderStatus,
    writer: SegmentWriter<f32>,
    sample_rate: u32,
    n_channels: usize,
}

impl Recorder {
    pub fn new(n_channels: usize, sample_rate: u32) -> Self {
        Self {
            status: RecorderStatus::Idle,
            writer: SegmentWriter::new(n_channels, 0),
            sample_rate,
            n_channels,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.status == RecorderStatus::Recording
    }

    /// Absolute index of the first sample not yet stored.
    pub fn next_index(&self) -> u64 {
        self.writer.target().index() + self.writer.write_index() as u64
    }

    /// Begin a capture whose first sample is absolute index `from`.
    ///
    /// # Panics
    /// Re-entering while a recording is active is a caller bug and panics.
    pub fn start(&mut self, from: u64) {
        assert!(
            self.status == RecorderStatus::Idle,
            "recorder is already recording"
        );
        self.writer.reset(from);
        self.status = RecorderStatus::Recording;
        info!(from, "recording started");
    }

    /// Append a segment; `seg.index()` must continue exactly where the last
    /// write stopped.
    ///
    /// # Errors
    /// Returns [`VadError::ResourceExhaustion`] when growing the backing
    /// store fails; the capture is then discarded.
    pub fn write(&mut self, seg: &Segment<'_, f32>) -> Result<()> {
        debug_assert_eq!(
            seg.index(),
            self.next_index(),
            "recorder writes must be contiguous"
        );
        let required = self.writer.write_index() + seg.len();
        if let Err(e) = self.ensure_len(required) {
            self.discard();
            return Err(e);
        }
        let written = self.writer.write(seg, 0);
        debug_assert_eq!(written, seg.len());
        Ok(())
    }

    /// End the capture. With `keep = false` the storage is retained for the
    /// next recording and nothing is returned.
    ///
    /// # Errors
    /// Returns [`VadError::RecorderMissingData`] when `keep = true` but the
    /// samples up to `to` were never written.
    pub fn finalize(&mut self, to: u64, keep: bool) -> Result<Option<AudioBuffer>> {
        self.status = RecorderStatus::Idle;
        if !keep {
            debug!("recording discarded");
            self.writer.reset(0);
            return Ok(None);
        }

        let written_up_to = self.next_index();
        if written_up_to < to {
            self.writer.reset(0);
            return Err(VadError::RecorderMissingData {
                needed: to,
                written: written_up_to,
            });
        }

        let start = self.writer.target().index();
        let length = (to - start) as usize;
        // hand the storage out and keep an empty target; the next capture
        // regrows from scratch
        let mut target = self.writer.take_target();
        target.truncate(length);
        info!(from = start, to, length, "recording finalized");
        Ok(Some(AudioBuffer {
            sample_rate: self.sample_rate,
            n_channels: self.n_channels,
            length,
            channel_pcm: target.into_channels(),
        }))
    }

    fn discard(&mut self) {
        self.status = RecorderStatus::Idle;
        self.writer.reset(0);
    }

    fn ensure_len(&mut self, required: usize) -> Result<()> {
        if self.writer.target().len() >= required {
            return Ok(());
        }
        let step = (GROWTH_SEC * self.sample_rate as u64) as usize;
        let new_len = required.max(self.writer.target().len() + step);
        self.writer.grow(new_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::segment::SplitSlice;

    const RATE: u32 = 48_000;

    fn segment_at(index: u64, channels: &[Vec<f32>]) -> Segment<'_, f32> {
        Segment::new(
            index,
            channels
                .iter()
                .map(|ch| SplitSlice::contiguous(ch))
                .collect(),
        )
    }

    #[test]
    fn capture_round_trips_samples() {
        let mut rec = Recorder::new(2, RATE);
        rec.start(1000);
        assert!(rec.is_recording());
        assert_eq!(rec.next_index(), 1000);

        let chunk = vec![vec![0.25f32; 300], vec![-0.5f32; 300]];
        rec.write(&segment_at(1000, &chunk)).unwrap();
        assert_eq!(rec.next_index(), 1300);

        let buffer = rec.finalize(1300, true).unwrap().unwrap();
        assert!(!rec.is_recording());
        assert_eq!(buffer.length, 300);
        assert_eq!(buffer.n_channels, 2);
        assert_eq!(buffer.sample_rate, RATE);
        assert!(buffer.channel_pcm[0].iter().all(|&s| s == 0.25));
        assert!(buffer.channel_pcm[1].iter().all(|&s| s == -0.5));
    }

    #[test]
    fn growth_covers_long_captures_and_shrinks_to_exact_size() {
        let mut rec = Recorder::new(1, RATE);
        rec.start(0);

        // two writes spanning more than one growth step
        let first = vec![vec![0.1f32; (GROWTH_SEC * RATE as u64) as usize]];
        rec.write(&segment_at(0, &first)).unwrap();
        let second = vec![vec![0.2f32; 5_000]];
        rec.write(&segment_at(first[0].len() as u64, &second)).unwrap();

        let total = first[0].len() + 5_000;
        let buffer = rec.finalize(total as u64, true).unwrap().unwrap();
        assert_eq!(buffer.length, total);
        assert_eq!(buffer.channel_pcm[0].len(), total);
        assert_eq!(buffer.channel_pcm[0][total - 1], 0.2);
    }

    #[test]
    fn finalize_requires_all_samples() {
        let mut rec = Recorder::new(1, RATE);
        rec.start(0);
        let chunk = vec![vec![0.1f32; 100]];
        rec.write(&segment_at(0, &chunk)).unwrap();

        assert!(matches!(
            rec.finalize(200, true),
            Err(VadError::RecorderMissingData {
                needed: 200,
                written: 100
            })
        ));
        assert!(!rec.is_recording());
    }

    #[test]
    fn discard_keeps_recorder_usable() {
        let mut rec = Recorder::new(1, RATE);
        rec.start(500);
        let chunk = vec![vec![0.3f32; 64]];
        rec.write(&segment_at(500, &chunk)).unwrap();

        assert!(rec.finalize(0, false).unwrap().is_none());
        assert!(!rec.is_recording());

        rec.start(9_000);
        rec.write(&segment_at(9_000, &chunk)).unwrap();
        let buffer = rec.finalize(9_064, true).unwrap().unwrap();
        assert_eq!(buffer.length, 64);
        assert!(buffer.channel_pcm[0].iter().all(|&s| s == 0.3));
    }

    #[test]
    #[should_panic(expected = "already recording")]
    fn double_start_panics() {
        let mut rec = Recorder::new(1, RATE);
        rec.start(0);
        rec.start(1);
    }
}
