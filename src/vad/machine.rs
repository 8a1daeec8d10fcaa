//! Speech state machine.
//!
//! ## Decision per FFT window
//!
//! 1. Sum the normalized bin magnitudes over the speech band per channel;
//!    take the min and max across channels.
//! 2. The short-term average follows the loudest channel (radio voice is
//!    mixed into one channel); the ratio average follows the raw min/max
//!    RMS ratio.
//! 3. `threshold = long_term_noise_floor × speech_threshold_factor`.
//! 4. Triggered when the short-term average exceeds the threshold AND the
//!    channels are asymmetric enough (`ratio < channel_vol_ratio_threshold`).
//! 5. While triggered the long-term average is frozen so it cannot chase the
//!    speaker; otherwise it keeps calibrating on the quietest channel.
//!
//! ## Speech FSM
//!
//! ```text
//! closed ──triggered──► opening ──held min_consecutive──► open
//!    ▲                     │                                │
//!    │                 ¬triggered                       ¬triggered
//!    │                     ▼                                ▼
//!    └──gap ≥ max_gap── closing ◄────────────────────── (speech_end)
//!                          │ triggered
//!                          └──────────► open   (gap joined)
//! ```
//!
//! Finalization appends a [`VadSegment`] with two seconds of lookbehind and
//! lookahead padding, unless the speech ran shorter than
//! `min_vad_duration_sec`, in which case the capture is aborted.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::rolling::RollingAverage;
use super::{AnalyzedWindow, RecorderCommand};
use crate::error::{Result, VadError};
use crate::spectrum::{FftAnalyzer, FftResult};

/// Lookbehind/lookahead applied around detected speech, in seconds.
const PADDING_SEC: u64 = 2;

/// Thresholds and window lengths of one state machine instance.
///
/// All fields have defaults, so a harness can deserialize a partial config
/// (e.g. `{"speech_max_freq": 1000}`) and inherit the rest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadMachineConfig {
    /// Lower edge of the speech band in Hz.
    pub speech_min_freq: f32,
    /// Upper edge of the speech band in Hz.
    pub speech_max_freq: f32,
    /// Noise-floor calibration window in seconds.
    pub long_term_speech_avg_sec: f32,
    /// Seed for the noise floor before calibration has data. `None` falls
    /// back to the short-term value until the first untriggered evaluation.
    pub initial_long_term_avg: Option<f32>,
    /// Speech-volume smoothing window in seconds.
    pub short_term_speech_avg_sec: f32,
    /// The short-term average must exceed the noise floor by this factor.
    pub speech_threshold_factor: f32,
    /// Channel-volume-ratio smoothing window in seconds.
    pub channel_vol_ratio_avg_sec: f32,
    /// The smoothed ratio must stay below this for speech (asymmetry test).
    pub channel_vol_ratio_threshold: f32,
    /// Trigger must hold this long before the detector opens.
    pub min_consecutive_sec_to_open: f32,
    /// Silence longer than this closes the detector.
    pub max_speech_gap_sec: f32,
    /// Segments shorter than this are dropped.
    pub min_vad_duration_sec: f32,
}

impl Default for VadMachineConfig {
    fn default() -> Self {
        Self {
            speech_min_freq: 100.0,
            speech_max_freq: 1500.0,
            long_term_speech_avg_sec: 180.0,
            initial_long_term_avg: Some(0.005),
            short_term_speech_avg_sec: 0.2,
            speech_threshold_factor: 18.0,
            channel_vol_ratio_avg_sec: 0.5,
            channel_vol_ratio_threshold: 0.5,
            min_consecutive_sec_to_open: 0.2,
            max_speech_gap_sec: 2.0,
            min_vad_duration_sec: 0.7,
        }
    }
}

/// Detector phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechState {
    /// No speech.
    Closed,
    /// Triggered, waiting for `min_consecutive_sec_to_open` to confirm.
    Opening,
    /// Confirmed speech; a recording is running.
    Open,
    /// Trigger dropped; waiting out `max_speech_gap_sec` before closing.
    Closing,
}

/// One emitted speech segment, in absolute sample indices with padding.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VadSegment {
    pub sample_from: u64,
    pub sample_to: u64,
    /// Mean RNN speech likelihood over the triggered evaluations; 0.0 when
    /// the denoiser was disabled.
    pub debug_rnn_vad: f32,
    /// Mean channel-volume ratio over the triggered evaluations.
    pub debug_avg_speech_vol_ratio: f32,
}

/// Threshold computation plus the 4-state speech FSM.
pub struct VadMachine {
    config: VadMachineConfig,
    /// Speech band clamped to `[0, nyquist]` at construction.
    band_min_freq: f32,
    band_max_freq: f32,
    /// Per-channel band volume scratch, reused every evaluation.
    band_volumes: Vec<f32>,
    long_term: RollingAverage,
    short_term: RollingAverage,
    ratio_avg: RollingAverage,
    state: SpeechState,
    speech_start: u64,
    speech_end: u64,
    min_consecutive_samples: u64,
    max_gap_samples: u64,
    min_duration_samples: u64,
    padding_samples: u64,
    acc_vad: f64,
    n_vad: u64,
    acc_ratio: f64,
    n_ratio: u64,
    segments: Vec<VadSegment>,
}

impl VadMachine {
    /// Derive window lengths and clamp the speech band to the given analyzer
    /// geometry.
    ///
    /// # Errors
    /// Returns [`VadError::Config`] on an inverted band or non-positive
    /// window lengths.
    pub fn new(
        config: VadMachineConfig,
        analyzer: &FftAnalyzer,
        n_channels: usize,
    ) -> Result<Self> {
        let band_min_freq = config.speech_min_freq.clamp(0.0, analyzer.nyquist());
        let band_max_freq = config.speech_max_freq.clamp(0.0, analyzer.nyquist());
        if analyzer.freq_to_bin(band_max_freq)? < analyzer.freq_to_bin(band_min_freq)? {
            return Err(VadError::Config(format!(
                "inverted speech band [{}, {}] Hz",
                config.speech_min_freq, config.speech_max_freq
            )));
        }
        for (name, value) in [
            ("long_term_speech_avg_sec", config.long_term_speech_avg_sec),
            ("short_term_speech_avg_sec", config.short_term_speech_avg_sec),
            ("channel_vol_ratio_avg_sec", config.channel_vol_ratio_avg_sec),
        ] {
            if value <= 0.0 {
                return Err(VadError::Config(format!("{name} must be positive")));
            }
        }

        let sample_rate = analyzer.sample_rate();
        let evals_per_sec = sample_rate as f64 / analyzer.fft_size() as f64;
        let window = |sec: f32| ((evals_per_sec * sec as f64).floor() as usize).max(1);

        let long_term = match config.initial_long_term_avg {
            Some(prior) => {
                RollingAverage::with_prior(window(config.long_term_speech_avg_sec), prior as f64)
            }
            None => RollingAverage::new(window(config.long_term_speech_avg_sec)),
        };
        let short_term = RollingAverage::new(window(config.short_term_speech_avg_sec));
        let ratio_avg = RollingAverage::new(window(config.channel_vol_ratio_avg_sec));

        let to_samples = |sec: f32| (sec as f64 * sample_rate as f64) as u64;

        Ok(Self {
            min_consecutive_samples: to_samples(config.min_consecutive_sec_to_open),
            max_gap_samples: to_samples(config.max_speech_gap_sec),
            min_duration_samples: to_samples(config.min_vad_duration_sec),
            padding_samples: PADDING_SEC * sample_rate as u64,
            config,
            band_min_freq,
            band_max_freq,
            band_volumes: vec![0.0; n_channels],
            long_term,
            short_term,
            ratio_avg,
            state: SpeechState::Closed,
            speech_start: 0,
            speech_end: 0,
            acc_vad: 0.0,
            n_vad: 0,
            acc_ratio: 0.0,
            n_ratio: 0,
            segments: Vec::new(),
        })
    }

    pub fn config(&self) -> &VadMachineConfig {
        &self.config
    }

    pub fn state(&self) -> SpeechState {
        self.state
    }

    /// All segments emitted so far, in stream order.
    pub fn segments(&self) -> &[VadSegment] {
        self.segments.as_slice()
    }

    /// Fold one analyzed FFT window into the detector.
    ///
    /// Never fails: the band was validated against this analyzer geometry at
    /// construction and everything else clamps or discards.
    pub fn evaluate(
        &mut self,
        window: &AnalyzedWindow,
        spectrum: &FftResult,
        analyzer: &FftAnalyzer,
    ) -> Option<RecorderCommand> {
        if analyzer
            .average_volume_in_band(
                spectrum,
                self.band_min_freq,
                self.band_max_freq,
                &mut self.band_volumes,
            )
            .is_err()
        {
            return None;
        }
        let mut min_volume = f32::MAX;
        let mut max_volume = 0.0f32;
        for &volume in &self.band_volumes {
            min_volume = min_volume.min(volume);
            max_volume = max_volume.max(volume);
        }

        let short = self.short_term.push(max_volume as f64);
        let ratio = self.ratio_avg.push(window.volume_ratio as f64);

        let base = self.long_term.last_avg().unwrap_or(short);
        let threshold = base * self.config.speech_threshold_factor as f64;
        let triggered =
            short > threshold && ratio < self.config.channel_vol_ratio_threshold as f64;

        // Noise-floor calibration freezes while voice is detected, otherwise
        // the average would chase the speaker.
        if !triggered {
            self.long_term.push(min_volume as f64);
        }

        self.transition(window, triggered)
    }

    fn transition(&mut self, window: &AnalyzedWindow, triggered: bool) -> Option<RecorderCommand> {
        let index = window.index;
        match (self.state, triggered) {
            (SpeechState::Closed, false) => None,
            (SpeechState::Closed, true) => {
                self.state = SpeechState::Opening;
                self.speech_start = index;
                self.acc_vad = 0.0;
                self.n_vad = 0;
                self.acc_ratio = 0.0;
                self.n_ratio = 0;
                self.accumulate(window);
                None
            }
            (SpeechState::Opening, true) => {
                self.accumulate(window);
                if index - self.speech_start >= self.min_consecutive_samples {
                    self.state = SpeechState::Open;
                    debug!(speech_start = self.speech_start, "speech opened");
                    Some(RecorderCommand::Start {
                        at: self.offset_start(self.speech_start),
                    })
                } else {
                    None
                }
            }
            (SpeechState::Opening, false) => {
                self.state = SpeechState::Closed;
                None
            }
            (SpeechState::Open, true) => {
                self.accumulate(window);
                None
            }
            (SpeechState::Open, false) => {
                self.state = SpeechState::Closing;
                self.speech_end = index;
                None
            }
            (SpeechState::Closing, true) => {
                self.state = SpeechState::Open;
                self.accumulate(window);
                None
            }
            (SpeechState::Closing, false) => {
                if index - self.speech_end >= self.max_gap_samples {
                    self.state = SpeechState::Closed;
                    Some(self.finalize())
                } else {
                    None
                }
            }
        }
    }

    fn finalize(&mut self) -> RecorderCommand {
        let duration = self.speech_end - self.speech_start;
        if duration < self.min_duration_samples {
            debug!(
                speech_start = self.speech_start,
                speech_end = self.speech_end,
                "segment below minimum duration, aborting"
            );
            return RecorderCommand::Abort;
        }

        let segment = VadSegment {
            sample_from: self.offset_start(self.speech_start),
            sample_to: self.offset_end(self.speech_end),
            debug_rnn_vad: if self.n_vad > 0 {
                (self.acc_vad / self.n_vad as f64) as f32
            } else {
                0.0
            },
            debug_avg_speech_vol_ratio: if self.n_ratio > 0 {
                (self.acc_ratio / self.n_ratio as f64) as f32
            } else {
                0.0
            },
        };
        debug!(
            from = segment.sample_from,
            to = segment.sample_to,
            "speech segment finalized"
        );
        self.segments.push(segment);
        RecorderCommand::Complete {
            until: self.offset_end(self.speech_end),
        }
    }

    fn accumulate(&mut self, window: &AnalyzedWindow) {
        if let Some(vad) = window.vad {
            self.acc_vad += vad as f64;
            self.n_vad += 1;
        }
        self.acc_ratio += window.volume_ratio as f64;
        self.n_ratio += 1;
    }

    fn offset_start(&self, index: u64) -> u64 {
        index.saturating_sub(self.padding_samples)
    }

    fn offset_end(&self, index: u64) -> u64 {
        index + self.padding_samples
    }
}

impl std::fmt::Debug for VadMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VadMachine")
            .field("state", &self.state)
            .field("segments", &self.segments.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 48_000;
    // 0.1 s per evaluation keeps the test arithmetic readable
    const FFT: usize = 4_800;

    struct Harness {
        machine: VadMachine,
        spectrum: FftResult,
        analyzer: FftAnalyzer,
        eval: u64,
    }

    impl Harness {
        fn new(config: VadMachineConfig) -> Self {
            let analyzer = FftAnalyzer::new(FFT, RATE).unwrap();
            let machine = VadMachine::new(config, &analyzer, 2).unwrap();
            Self {
                machine,
                spectrum: FftResult::new(2, FFT),
                analyzer,
                eval: 0,
            }
        }

        /// Feed one evaluation with the given in-band volume on channel 0.
        fn step(&mut self, volume: f32, ratio: f32) -> Option<RecorderCommand> {
            let bin = self.analyzer.freq_to_bin(400.0).unwrap();
            for ch in 0..2 {
                self.spectrum.channel_bins_mut(ch).fill(0.0);
            }
            self.spectrum.channel_bins_mut(0)[bin] = volume;
            let index = self.eval * FFT as u64;
            self.spectrum.set_index(index);
            self.eval += 1;
            self.machine.evaluate(
                &AnalyzedWindow {
                    index,
                    vad: Some(0.8),
                    volume_ratio: ratio,
                },
                &self.spectrum,
                &self.analyzer,
            )
        }

        fn run(&mut self, evals: usize, volume: f32, ratio: f32) -> Vec<RecorderCommand> {
            (0..evals).filter_map(|_| self.step(volume, ratio)).collect()
        }
    }

    fn test_config() -> VadMachineConfig {
        VadMachineConfig {
            // tighter smoothing so each test evaluation counts fully
            short_term_speech_avg_sec: 0.1,
            channel_vol_ratio_avg_sec: 0.1,
            ..VadMachineConfig::default()
        }
    }

    #[test]
    fn silence_never_opens() {
        let mut h = Harness::new(test_config());
        let commands = h.run(100, 0.0, 0.0);
        assert!(commands.is_empty());
        assert_eq!(h.machine.state(), SpeechState::Closed);
        assert!(h.machine.segments().is_empty());
    }

    #[test]
    fn sustained_speech_opens_completes_and_pads() {
        let mut h = Harness::new(test_config());

        // 3 s of loud asymmetric speech-band volume
        let commands = h.run(30, 1.0, 0.0);
        assert_eq!(
            commands,
            vec![RecorderCommand::Start { at: 0 }],
            "start is emitted once the trigger held for min_consecutive"
        );
        assert_eq!(h.machine.state(), SpeechState::Open);

        // silence until the gap closes the detector
        let commands = h.run(30, 0.0, 0.0);
        let speech_end = 30 * FFT as u64;
        assert_eq!(
            commands,
            vec![RecorderCommand::Complete {
                until: speech_end + 2 * RATE as u64
            }]
        );

        let segments = h.machine.segments();
        assert_eq!(segments.len(), 1);
        // speech started at index 0, so the 2 s lookbehind clamps to 0
        assert_eq!(segments[0].sample_from, 0);
        assert_eq!(segments[0].sample_to, speech_end + 2 * RATE as u64);
        assert!((segments[0].debug_avg_speech_vol_ratio - 0.0).abs() < 1e-6);
        assert!((segments[0].debug_rnn_vad - 0.8).abs() < 1e-6);
    }

    #[test]
    fn symmetric_volume_fails_the_ratio_test() {
        let mut h = Harness::new(test_config());
        // loud but symmetric (engine noise on both channels)
        let commands = h.run(50, 1.0, 1.0);
        assert!(commands.is_empty());
        assert_eq!(h.machine.state(), SpeechState::Closed);
    }

    #[test]
    fn brief_trigger_never_opens() {
        let mut h = Harness::new(test_config());
        // one evaluation (0.1 s) is below min_consecutive_sec_to_open
        h.step(1.0, 0.0);
        let commands = h.run(50, 0.0, 0.0);
        assert!(commands.is_empty());
        assert_eq!(h.machine.state(), SpeechState::Closed);
    }

    #[test]
    fn short_segment_is_aborted() {
        let mut cfg = test_config();
        cfg.min_consecutive_sec_to_open = 0.1;
        let mut h = Harness::new(cfg);

        // 0.4 s of speech: opens, but stays under min_vad_duration_sec
        let commands = h.run(4, 1.0, 0.0);
        assert_eq!(commands.len(), 1);
        assert!(matches!(commands[0], RecorderCommand::Start { .. }));

        let commands = h.run(30, 0.0, 0.0);
        assert_eq!(commands, vec![RecorderCommand::Abort]);
        assert!(h.machine.segments().is_empty());
    }

    #[test]
    fn short_gap_joins_two_bursts() {
        let mut h = Harness::new(test_config());

        h.run(10, 1.0, 0.0);
        // 1 s gap, shorter than max_speech_gap_sec
        h.run(10, 0.0, 0.0);
        h.run(10, 1.0, 0.0);
        let commands = h.run(30, 0.0, 0.0);

        assert_eq!(commands.len(), 1);
        assert!(matches!(commands[0], RecorderCommand::Complete { .. }));
        let segments = h.machine.segments();
        assert_eq!(segments.len(), 1, "bursts across a short gap must merge");
        // the merged segment spans both bursts
        assert!(segments[0].sample_to - segments[0].sample_from >= 3 * RATE as u64);
    }

    #[test]
    fn long_gap_separates_two_segments() {
        let mut h = Harness::new(test_config());

        h.run(10, 1.0, 0.0);
        // 3 s gap closes the first segment
        h.run(30, 0.0, 0.0);
        h.run(10, 1.0, 0.0);
        h.run(30, 0.0, 0.0);

        assert_eq!(h.machine.segments().len(), 2);
    }

    #[test]
    fn calibration_freezes_while_triggered() {
        let mut h = Harness::new(test_config());
        let seed = 0.005f64;

        // sustained trigger: the long-term average must not move
        h.run(50, 1.0, 0.0);
        let frozen = h.machine.long_term.last_avg().unwrap();
        assert!((frozen - seed).abs() < 1e-12);

        // untriggered evaluations resume calibration on the min channel (0.0)
        h.run(10, 0.0, 1.0);
        assert!(h.machine.long_term.last_avg().unwrap() < seed);
    }

    #[test]
    fn partial_config_deserializes_with_defaults() {
        let cfg: VadMachineConfig = serde_json::from_str(r#"{"speech_max_freq": 1000}"#).unwrap();
        assert_eq!(cfg.speech_max_freq, 1000.0);
        assert_eq!(cfg.speech_min_freq, 100.0);
        assert_eq!(cfg.speech_threshold_factor, 18.0);
        assert_eq!(cfg.initial_long_term_avg, Some(0.005));
    }

    #[test]
    fn rejects_inverted_band() {
        let analyzer = FftAnalyzer::new(FFT, RATE).unwrap();
        let cfg = VadMachineConfig {
            speech_min_freq: 2000.0,
            speech_max_freq: 500.0,
            ..VadMachineConfig::default()
        };
        assert!(matches!(
            VadMachine::new(cfg, &analyzer, 2),
            Err(VadError::Config(_))
        ));
    }
}
