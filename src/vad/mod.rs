//! Voice-activity decision layer.
//!
//! The analysis stage condenses each FFT window into an [`AnalyzedWindow`];
//! the [`machine::VadMachine`] folds those into speech segments and answers
//! with [`RecorderCommand`]s that the pipeline facade executes. The machine
//! never touches the recorder itself — it is a pure function of its inputs
//! plus its own rolling state.

pub mod machine;
pub mod rolling;

pub use machine::{SpeechState, VadMachine, VadMachineConfig, VadSegment};
pub use rolling::RollingAverage;

/// One FFT window's worth of pre-computed evidence.
#[derive(Debug, Clone, Copy)]
pub struct AnalyzedWindow {
    /// Absolute sample index of the first sample in the window.
    pub index: u64,
    /// Minimum RNN speech likelihood across channels, when denoising ran.
    pub vad: Option<f32>,
    /// Min/max per-channel RMS ratio of the raw input, in `[0, 1]`.
    pub volume_ratio: f32,
}

/// Recording decision returned by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderCommand {
    /// Speech confirmed: begin capturing at the padded start index.
    Start { at: u64 },
    /// A segment finalized: capture runs through the padded end index.
    Complete { until: u64 },
    /// The provisional segment was too short; discard any capture.
    Abort,
}
