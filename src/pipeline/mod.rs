//! `AudioPipeline` — the public facade.
//!
//! ## Lifecycle
//!
//! ```text
//! AudioPipeline::new(config, callback)
//!     └─► push(pcm)          → ring write + analysis + recorder, repeatedly
//!         └─► segments()     → everything detected so far
//!     (drop)                 → all storage released
//! ```
//!
//! `push` runs synchronously to completion: denoiser, FFT, state machine and
//! any recording callback all execute on the caller's thread before it
//! returns. One pipeline instance is single-threaded by design; run parallel
//! streams as independent instances.

mod analysis;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::buffering::segment::Segment;
use crate::buffering::MultiRingBuffer;
use crate::error::{Result, VadError};
use crate::recorder::{AudioBuffer, Recorder};
use crate::spectrum::FftAnalyzer;
use crate::vad::machine::{VadMachine, VadMachineConfig, VadSegment};
use crate::vad::RecorderCommand;

use analysis::AnalysisStage;

/// The only sample rate the denoiser model supports.
pub const REQUIRED_SAMPLE_RATE: u32 = 48_000;

/// Invoked from inside `push`/`end_capture` with a completed recording.
pub type RecordingCallback = Box<dyn FnMut(AudioBuffer) + Send>;

/// Pipeline construction parameters.
///
/// Deserializes from partial documents; every omitted field takes its
/// default, including inside `vad` and each entry of `alt_vad`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Must be 48000.
    pub sample_rate: u32,
    pub n_channels: usize,
    /// FFT window and hop length in samples; positive and even.
    pub fft_size: usize,
    /// Run per-channel RNNoise ahead of the FFT.
    pub use_denoiser: bool,
    /// Ring buffer length in seconds; must cover the 2 s lookbehind.
    pub buffer_len_sec: f32,
    /// Primary state machine configuration; drives the recorder.
    pub vad: VadMachineConfig,
    /// Alternate configurations evaluated in parallel for tuning. Their
    /// segments are retrievable but never drive the recorder.
    pub alt_vad: Vec<VadMachineConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sample_rate: REQUIRED_SAMPLE_RATE,
            n_channels: 2,
            fft_size: 2048,
            use_denoiser: false,
            buffer_len_sec: 10.0,
            vad: VadMachineConfig::default(),
            alt_vad: Vec::new(),
        }
    }
}

/// Streaming VAD pipeline over multichannel 48 kHz PCM.
pub struct AudioPipeline {
    config: PipelineConfig,
    ring: MultiRingBuffer<f32>,
    analysis: AnalysisStage,
    recorder: Recorder,
    on_recording: Option<RecordingCallback>,
    /// Padded end of a completed capture still waiting for lookahead samples.
    pending_end: Option<u64>,
    /// Reused command scratch; empty between pushes.
    commands: Vec<RecorderCommand>,
    /// Per-iteration write chunk, half the ring capacity.
    chunk: usize,
}

impl AudioPipeline {
    /// Validate the configuration and preallocate every steady-state buffer.
    ///
    /// # Errors
    /// Returns [`VadError::Config`] for a sample rate other than 48000, a
    /// zero channel count, a zero or odd FFT size, or a ring buffer too
    /// small for the lookbehind padding.
    pub fn new(config: PipelineConfig, on_recording: Option<RecordingCallback>) -> Result<Self> {
        if config.sample_rate != REQUIRED_SAMPLE_RATE {
            return Err(VadError::Config(format!(
                "sample rate must be {REQUIRED_SAMPLE_RATE} Hz, got {}",
                config.sample_rate
            )));
        }
        if config.n_channels == 0 {
            return Err(VadError::Config("channel count must be non-zero".into()));
        }

        // the analysis reader lags at most read_size behind a half-capacity
        // write chunk, and the lookbehind padding needs two seconds of history
        let capacity = (config.buffer_len_sec as f64 * config.sample_rate as f64) as usize;
        if capacity < 2 * config.fft_size || capacity < 2 * config.sample_rate as usize {
            return Err(VadError::Config(format!(
                "ring buffer of {capacity} samples is too small for analysis and lookbehind"
            )));
        }

        let analyzer = FftAnalyzer::new(config.fft_size, config.sample_rate)?;
        let machine = VadMachine::new(config.vad.clone(), &analyzer, config.n_channels)?;
        let alt_machines = config
            .alt_vad
            .iter()
            .map(|alt| VadMachine::new(alt.clone(), &analyzer, config.n_channels))
            .collect::<Result<Vec<_>>>()?;

        info!(
            sample_rate = config.sample_rate,
            n_channels = config.n_channels,
            fft_size = config.fft_size,
            use_denoiser = config.use_denoiser,
            alt_machines = alt_machines.len(),
            "pipeline created"
        );

        Ok(Self {
            ring: MultiRingBuffer::new(config.n_channels, capacity),
            analysis: AnalysisStage::new(
                analyzer,
                machine,
                alt_machines,
                config.n_channels,
                config.use_denoiser,
            ),
            recorder: Recorder::new(config.n_channels, config.sample_rate),
            on_recording,
            pending_end: None,
            commands: Vec::new(),
            chunk: (capacity / 2).max(1),
            config,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Total samples admitted per channel; the absolute clock.
    pub fn total_samples(&self) -> u64 {
        self.ring.total_write_count()
    }

    /// Segments emitted by the primary state machine, in stream order.
    pub fn segments(&self) -> &[VadSegment] {
        self.analysis.machine().segments()
    }

    /// Segments of the `index`-th alternate machine.
    pub fn alt_segments(&self, index: usize) -> Option<&[VadSegment]> {
        self.analysis.alt_segments(index)
    }

    pub fn n_alt_machines(&self) -> usize {
        self.analysis.n_alt_machines()
    }

    /// Admit PCM for every channel and run the pipeline to completion.
    /// Returns the absolute index of the first sample pushed.
    ///
    /// Writes proceed in half-capacity chunks, each followed by a full
    /// analysis pass, so the ring can never outrun the reader. A push with
    /// empty slices is a no-op.
    ///
    /// # Errors
    /// [`VadError::ChannelMismatch`] when the slice count or lengths differ;
    /// recorder errors propagate unchanged.
    pub fn push(&mut self, pcm: &[&[f32]]) -> Result<u64> {
        let first_index = self.ring.total_write_count();
        if pcm.len() != self.ring.n_channels() {
            return Err(VadError::ChannelMismatch {
                expected: self.ring.n_channels(),
                got: pcm.len(),
            });
        }
        let len = pcm[0].len();
        if let Some(other) = pcm.iter().find(|ch| ch.len() != len) {
            return Err(VadError::ChannelMismatch {
                expected: len,
                got: other.len(),
            });
        }
        if len == 0 {
            return Ok(first_index);
        }

        let mut offset = 0;
        while offset < len {
            let count = self.chunk.min(len - offset);
            self.protect_recording(count)?;
            let written = self.ring.write(pcm, offset, count)?;
            offset += written;
            self.run_analysis()?;
        }
        Ok(first_index)
    }

    /// View of the absolute range `[abs_from, abs_to)` across all channels.
    pub fn slice_segment(&self, abs_from: u64, abs_to: u64) -> Result<Segment<'_, f32>> {
        self.ring.read_slice(abs_from, abs_to)
    }

    /// Begin a manual capture at `abs_from` (clamped to the oldest sample
    /// still buffered).
    ///
    /// # Panics
    /// Panics when a capture is already active.
    pub fn begin_capture(&mut self, abs_from: u64) {
        let from = abs_from.max(self.ring.oldest_readable());
        self.recorder.start(from);
    }

    /// End a manual capture at `abs_to`. With `keep = true` the recording is
    /// delivered through the callback; otherwise it is discarded.
    ///
    /// # Errors
    /// [`VadError::RecorderMissingData`] when `abs_to` lies beyond the
    /// samples pushed so far.
    pub fn end_capture(&mut self, abs_to: u64, keep: bool) -> Result<()> {
        if !keep {
            self.pending_end = None;
            self.recorder.finalize(0, false)?;
            return Ok(());
        }
        if abs_to > self.ring.total_write_count() {
            return Err(VadError::RecorderMissingData {
                needed: abs_to,
                written: self.ring.total_write_count(),
            });
        }
        self.pending_end = Some(abs_to);
        self.finish_capture(false)
    }

    // ── Internal helpers ─────────────────────────────────────────────────

    /// Copy samples the next write would overwrite into the recorder.
    fn protect_recording(&mut self, incoming: usize) -> Result<()> {
        if !self.recorder.is_recording() {
            return Ok(());
        }
        let endangered = (self.ring.total_write_count() + incoming as u64)
            .saturating_sub(self.ring.capacity() as u64);
        if endangered > self.recorder.next_index() {
            self.copy_to_recorder(endangered)?;
        }
        Ok(())
    }

    /// Bring the recorder up to `upto` from the ring buffer.
    fn copy_to_recorder(&mut self, upto: u64) -> Result<()> {
        let from = self.recorder.next_index();
        if from >= upto {
            return Ok(());
        }
        let slice = self.ring.read_slice(from, upto)?;
        self.recorder.write(&slice)
    }

    fn run_analysis(&mut self) -> Result<()> {
        let mut commands = std::mem::take(&mut self.commands);
        let result = self.analysis.process(&self.ring, &mut commands);
        if result.is_err() {
            commands.clear();
            self.commands = commands;
            return result;
        }
        for command in commands.drain(..) {
            self.handle_command(command)?;
        }
        self.commands = commands;
        self.flush_pending()
    }

    fn handle_command(&mut self, command: RecorderCommand) -> Result<()> {
        match command {
            RecorderCommand::Start { at } => {
                if self.pending_end.is_some() {
                    // back-to-back segments with a gap shorter than the
                    // lookahead: close the previous capture with whatever
                    // samples exist
                    warn!("new segment before previous capture drained; clamping lookahead");
                    self.finish_capture(true)?;
                }
                self.recorder.start(at.max(self.ring.oldest_readable()));
                Ok(())
            }
            RecorderCommand::Complete { until } => {
                self.pending_end = Some(until);
                Ok(())
            }
            RecorderCommand::Abort => {
                self.pending_end = None;
                self.recorder.finalize(0, false)?;
                Ok(())
            }
        }
    }

    /// Finalize a completed capture once its lookahead samples arrived.
    fn flush_pending(&mut self) -> Result<()> {
        if let Some(end) = self.pending_end {
            if self.ring.total_write_count() >= end {
                self.finish_capture(false)?;
            }
        }
        Ok(())
    }

    fn finish_capture(&mut self, clamp: bool) -> Result<()> {
        let Some(end) = self.pending_end.take() else {
            return Ok(());
        };
        let end = if clamp {
            end.min(self.ring.total_write_count())
        } else {
            end
        };
        self.copy_to_recorder(end)?;
        if let Some(buffer) = self.recorder.finalize(end, true)? {
            if let Some(callback) = self.on_recording.as_mut() {
                callback(buffer);
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for AudioPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioPipeline")
            .field("total_samples", &self.ring.total_write_count())
            .field("segments", &self.segments().len())
            .finish_non_exhaustive()
    }
}
