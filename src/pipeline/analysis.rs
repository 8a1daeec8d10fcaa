//! Frame-aligned analysis stages.
//!
//! ## Stages (per drained slice)
//!
//! ```text
//! 1. Slice [read_count, read_count + read_size) off the ring buffer
//! 2. Per-channel RMS → volume ratio (min/max over channels)
//! 3. Optional denoise: one RNNoise state per channel, min VAD
//! 4. Accumulate into the fft_size SegmentWriter; weight VAD and ratio by
//!    the samples each frame contributed to the current FFT window
//! 5. Window full: FFT per channel, evaluate primary + alternate machines
//! 6. Reset the writer onto the next window index, clear accumulators
//! ```
//!
//! The slice size is the denoiser frame (480) when denoising, otherwise the
//! FFT size itself, so the passthrough path fills a window per slice.

use crate::buffering::segment::{OwnedSegment, Segment, SegmentWriter};
use crate::buffering::MultiRingBuffer;
use crate::denoise::{FrameDenoiser, FRAME_SIZE};
use crate::error::Result;
use crate::spectrum::{FftAnalyzer, FftResult};
use crate::vad::machine::{VadMachine, VadSegment};
use crate::vad::{AnalyzedWindow, RecorderCommand};

/// Preprocessing ahead of FFT windowing.
enum Preprocess {
    /// Raw slices go straight to the window writer.
    Passthrough,
    /// Per-channel RNNoise into the preallocated `denoised` scratch.
    Denoise(FrameDenoiser),
}

/// Steps A–F of the streaming analysis; owns all scratch and the machines.
pub(crate) struct AnalysisStage {
    read_size: usize,
    read_count: u64,
    pre: Preprocess,
    denoised: OwnedSegment<f32>,
    windowing: WindowStage,
}

/// FFT accumulation plus state-machine dispatch.
struct WindowStage {
    writer: SegmentWriter<f32>,
    analyzer: FftAnalyzer,
    result: FftResult,
    // sample-weighted accumulators over the current FFT window
    acc_vad: f64,
    acc_ratio: f64,
    machine: VadMachine,
    alt_machines: Vec<VadMachine>,
}

impl AnalysisStage {
    pub fn new(
        analyzer: FftAnalyzer,
        machine: VadMachine,
        alt_machines: Vec<VadMachine>,
        n_channels: usize,
        use_denoiser: bool,
    ) -> Self {
        let fft_size = analyzer.fft_size();
        let (pre, read_size, denoised) = if use_denoiser {
            (
                Preprocess::Denoise(FrameDenoiser::new(n_channels)),
                FRAME_SIZE,
                OwnedSegment::zeroed(n_channels, FRAME_SIZE),
            )
        } else {
            // no denoiser: never allocated, never invoked
            (
                Preprocess::Passthrough,
                fft_size,
                OwnedSegment::zeroed(n_channels, 0),
            )
        };

        Self {
            read_size,
            read_count: 0,
            pre,
            denoised,
            windowing: WindowStage {
                writer: SegmentWriter::new(n_channels, fft_size),
                result: FftResult::new(n_channels, fft_size),
                analyzer,
                acc_vad: 0.0,
                acc_ratio: 0.0,
                machine,
                alt_machines,
            },
        }
    }

    pub fn machine(&self) -> &VadMachine {
        &self.windowing.machine
    }

    pub fn alt_segments(&self, index: usize) -> Option<&[VadSegment]> {
        self.windowing
            .alt_machines
            .get(index)
            .map(|m| m.segments())
    }

    pub fn n_alt_machines(&self) -> usize {
        self.windowing.alt_machines.len()
    }

    /// Drain every complete slice the ring buffer holds, collecting any
    /// recording commands the primary machine emits.
    pub fn process(
        &mut self,
        ring: &MultiRingBuffer<f32>,
        out: &mut Vec<RecorderCommand>,
    ) -> Result<()> {
        while ring.total_write_count() - self.read_count >= self.read_size as u64 {
            let from = self.read_count;
            let to = from + self.read_size as u64;
            let slice = ring.read_slice(from, to)?;
            let ratio = channel_volume_ratio(&slice);

            match &mut self.pre {
                Preprocess::Passthrough => self.windowing.feed(&slice, None, ratio, out),
                Preprocess::Denoise(denoiser) => {
                    let vad = denoiser.process(&slice, &mut self.denoised);
                    self.denoised.set_index(from);
                    self.windowing
                        .feed(&self.denoised.view(), Some(vad), ratio, out);
                }
            }
            self.read_count = to;
        }
        Ok(())
    }
}

impl WindowStage {
    /// Forward one preprocessed frame into the FFT window, dispatching every
    /// window it completes. A frame larger than the remaining window space
    /// splits across consecutive windows.
    fn feed(
        &mut self,
        src: &Segment<'_, f32>,
        vad: Option<f32>,
        ratio: f32,
        out: &mut Vec<RecorderCommand>,
    ) {
        let mut offset = 0;
        while offset < src.len() {
            let written = self.writer.write(src, offset);
            offset += written;
            if let Some(v) = vad {
                self.acc_vad += v as f64 * written as f64;
            }
            self.acc_ratio += ratio as f64 * written as f64;

            if self.writer.is_full() {
                self.dispatch(vad.is_some(), out);
            }
        }
    }

    fn dispatch(&mut self, has_vad: bool, out: &mut Vec<RecorderCommand>) {
        let fft_size = self.analyzer.fft_size() as f64;
        let index = self.writer.target().index();

        for ch in 0..self.result.n_channels() {
            let samples = crate::buffering::segment::SplitSlice::contiguous(
                self.writer.target().channel(ch),
            );
            self.analyzer
                .process(&samples, self.result.channel_bins_mut(ch));
        }
        self.result.set_index(index);

        let window = AnalyzedWindow {
            index,
            vad: if has_vad {
                Some((self.acc_vad / fft_size) as f32)
            } else {
                None
            },
            volume_ratio: (self.acc_ratio / fft_size) as f32,
        };

        if let Some(command) = self.machine.evaluate(&window, &self.result, &self.analyzer) {
            out.push(command);
        }
        // alternates are observe-only: their segments accumulate but their
        // recording decisions are dropped
        for alt in &mut self.alt_machines {
            let _ = alt.evaluate(&window, &self.result, &self.analyzer);
        }

        self.writer.reset(index + self.analyzer.fft_size() as u64);
        self.acc_vad = 0.0;
        self.acc_ratio = 0.0;
    }
}

/// Min/max RMS ratio across channels; 0 when the loudest channel is silent.
fn channel_volume_ratio(slice: &Segment<'_, f32>) -> f32 {
    let mut min_rms = f32::MAX;
    let mut max_rms = 0.0f32;
    for ch in 0..slice.n_channels() {
        let sum_sq: f32 = slice.channel(ch).iter().map(|&s| s * s).sum();
        let rms = (sum_sq / slice.len() as f32).sqrt();
        min_rms = min_rms.min(rms);
        max_rms = max_rms.max(rms);
    }
    if max_rms == 0.0 {
        0.0
    } else {
        min_rms / max_rms
    }
}
