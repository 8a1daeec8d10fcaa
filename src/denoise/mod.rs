//! Per-channel RNNoise denoising with intrinsic VAD.
//!
//! Wraps [`nnnoiseless::DenoiseState`], the pure-Rust port of RNNoise.
//! The model works on 480-sample frames of 48 kHz mono audio and expects
//! samples on the i16 scale, so input in `[-1, 1]` is scaled up by
//! `2^15 − 1` and the cleaned frame scaled back down.
//!
//! Each library handle carries RNN hidden state, so multichannel audio gets
//! one state per channel. The reported speech likelihood is the per-frame
//! **minimum** across channels: a frame only counts as speech when every
//! channel's model agrees, which keeps single-channel artifacts (wind, bumps)
//! from opening the detector.

use nnnoiseless::DenoiseState;

use crate::buffering::segment::{OwnedSegment, Segment};

/// Samples per denoiser frame (10 ms at 48 kHz).
pub const FRAME_SIZE: usize = DenoiseState::FRAME_SIZE;

/// i16 full-scale factor applied around the RNNoise call.
const PCM_SCALE: f32 = 32767.0;

/// N parallel RNNoise states with shared scratch buffers.
pub struct FrameDenoiser {
    states: Vec<Box<DenoiseState<'static>>>,
    scaled_in: Vec<f32>,
    scaled_out: Vec<f32>,
}

impl FrameDenoiser {
    /// # Panics
    /// Panics on a zero channel count.
    pub fn new(n_channels: usize) -> Self {
        assert!(n_channels > 0, "denoiser needs at least one channel");
        Self {
            states: (0..n_channels).map(|_| DenoiseState::new()).collect(),
            scaled_in: vec![0.0; FRAME_SIZE],
            scaled_out: vec![0.0; FRAME_SIZE],
        }
    }

    pub fn n_channels(&self) -> usize {
        self.states.len()
    }

    /// Denoise one frame per channel into `out` and return the minimum
    /// speech likelihood across channels, in `[0, 1]`.
    ///
    /// # Panics
    /// A frame length other than [`FRAME_SIZE`] or a channel-count mismatch
    /// is a pipeline bug and panics.
    pub fn process(&mut self, input: &Segment<'_, f32>, out: &mut OwnedSegment<f32>) -> f32 {
        assert_eq!(
            input.len(),
            FRAME_SIZE,
            "denoiser frame must be {FRAME_SIZE} samples"
        );
        assert_eq!(input.n_channels(), self.states.len());
        assert_eq!(out.n_channels(), self.states.len());
        assert_eq!(out.len(), FRAME_SIZE);

        let mut min_vad = 1.0f32;
        for (ch, state) in self.states.iter_mut().enumerate() {
            input.channel(ch).copy_to(0, &mut self.scaled_in);
            for s in self.scaled_in.iter_mut() {
                *s *= PCM_SCALE;
            }

            let vad = state.process_frame(&mut self.scaled_out, &self.scaled_in);

            for (dst, &s) in out.channel_mut(ch).iter_mut().zip(self.scaled_out.iter()) {
                *dst = s / PCM_SCALE;
            }
            min_vad = min_vad.min(vad.clamp(0.0, 1.0));
        }
        min_vad
    }
}

impl std::fmt::Debug for FrameDenoiser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameDenoiser")
            .field("n_channels", &self.states.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::segment::SplitSlice;

    fn segment_of<'a>(channels: &'a [Vec<f32>]) -> Segment<'a, f32> {
        Segment::new(
            0,
            channels
                .iter()
                .map(|ch| SplitSlice::contiguous(ch))
                .collect(),
        )
    }

    #[test]
    fn silence_produces_low_vad_and_bounded_output() {
        let mut denoiser = FrameDenoiser::new(2);
        let channels = vec![vec![0.0f32; FRAME_SIZE]; 2];
        let mut out = OwnedSegment::zeroed(2, FRAME_SIZE);

        let vad = denoiser.process(&segment_of(&channels), &mut out);
        assert!((0.0..=1.0).contains(&vad));
        assert!(vad < 0.5, "silence should not look like speech, vad={vad}");
        for ch in 0..2 {
            assert!(out.channel(ch).iter().all(|s| s.abs() <= 1.0));
        }
    }

    #[test]
    fn output_stays_normalized_for_loud_input() {
        let mut denoiser = FrameDenoiser::new(1);
        let channels = vec![(0..FRAME_SIZE)
            .map(|i| 0.9 * (2.0 * std::f32::consts::PI * 300.0 * i as f32 / 48_000.0).sin())
            .collect::<Vec<f32>>()];
        let mut out = OwnedSegment::zeroed(1, FRAME_SIZE);

        let vad = denoiser.process(&segment_of(&channels), &mut out);
        assert!((0.0..=1.0).contains(&vad));
        assert!(out.channel(0).iter().all(|s| s.is_finite()));
    }

    #[test]
    fn min_vad_is_taken_across_channels() {
        // one loud tonal channel, one silent channel: the silent channel's
        // likelihood caps the result
        let mut stereo = FrameDenoiser::new(2);
        let loud: Vec<f32> = (0..FRAME_SIZE)
            .map(|i| 0.8 * (2.0 * std::f32::consts::PI * 250.0 * i as f32 / 48_000.0).sin())
            .collect();
        let channels = vec![loud.clone(), vec![0.0f32; FRAME_SIZE]];
        let mut out = OwnedSegment::zeroed(2, FRAME_SIZE);
        let stereo_vad = stereo.process(&segment_of(&channels), &mut out);

        let mut silent_only = FrameDenoiser::new(1);
        let silent_channels = vec![vec![0.0f32; FRAME_SIZE]];
        let mut silent_out = OwnedSegment::zeroed(1, FRAME_SIZE);
        let silent_vad = silent_only.process(&segment_of(&silent_channels), &mut silent_out);

        assert!(stereo_vad <= silent_vad + 1e-6);
    }

    #[test]
    #[should_panic(expected = "denoiser frame")]
    fn wrong_frame_length_panics() {
        let mut denoiser = FrameDenoiser::new(1);
        let channels = vec![vec![0.0f32; FRAME_SIZE / 2]];
        let mut out = OwnedSegment::zeroed(1, FRAME_SIZE);
        denoiser.process(&segment_of(&channels), &mut out);
    }
}
