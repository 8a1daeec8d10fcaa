//! # onboard-vad
//!
//! Streaming voice-activity detection for multichannel PCM from motorsport
//! onboard cameras: each channel carries the driver's radio voice under
//! strong broadband engine noise, and the pipeline emits time-stamped speech
//! segments plus optional padded audio recordings of each one.
//!
//! ## Architecture
//!
//! ```text
//! PCM source → AudioPipeline::push → MultiRingBuffer
//!                                         │
//!                              frame-aligned slices
//!                                         │
//!                         [RNNoise denoise + intrinsic VAD]
//!                                         │
//!                          SegmentWriter → FFT → band volumes
//!                                         │
//!                                    VadMachine ──► VadSegment list
//!                                         │
//!                               RecorderCommand → Recorder
//!                                         │
//!                               on_recording(AudioBuffer)
//! ```
//!
//! A pipeline instance is single-threaded and synchronous: `push` runs every
//! stage, including callbacks, on the caller's thread. Parallel streams run
//! as independent instances. All timestamps are absolute sample indices at
//! 48 kHz; steady-state processing reuses preallocated scratch buffers.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod buffering;
pub mod denoise;
pub mod error;
pub mod pipeline;
pub mod recorder;
pub mod spectrum;
pub mod vad;

// Convenience re-exports for downstream crates
pub use buffering::MultiRingBuffer;
pub use error::VadError;
pub use pipeline::{AudioPipeline, PipelineConfig, RecordingCallback, REQUIRED_SAMPLE_RATE};
pub use recorder::AudioBuffer;
pub use vad::{RecorderCommand, SpeechState, VadMachineConfig, VadSegment};
