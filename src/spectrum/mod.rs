//! Real-FFT wrapper with periodic-Hann windowing and band summation.
//!
//! ## Normalization
//!
//! Each output bin is `sqrt(re² + im²) · window_norm / (fft_size / 2)` where
//! `window_norm = fft_size / Σ window` corrects the window's amplitude loss
//! (2.0 for the periodic Hann). A pure tone at unit amplitude on an exact
//! bin therefore reads ≈ 1.0, independent of the FFT size.

use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};

use crate::buffering::segment::SplitSlice;
use crate::error::{Result, VadError};

/// Per-window FFT output: normalized bin magnitudes for every channel.
#[derive(Debug, Clone)]
pub struct FftResult {
    index: u64,
    fft_size: usize,
    bins: Vec<Vec<f32>>,
}

impl FftResult {
    pub fn new(n_channels: usize, fft_size: usize) -> Self {
        Self {
            index: 0,
            fft_size,
            bins: vec![vec![0.0; fft_size / 2 + 1]; n_channels],
        }
    }

    /// Absolute sample index of the first sample in the analyzed window.
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn set_index(&mut self, index: u64) {
        self.index = index;
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    pub fn n_channels(&self) -> usize {
        self.bins.len()
    }

    pub fn bin_count(&self) -> usize {
        self.fft_size / 2 + 1
    }

    pub fn channel_bins(&self, ch: usize) -> &[f32] {
        &self.bins[ch]
    }

    pub fn channel_bins_mut(&mut self, ch: usize) -> &mut [f32] {
        &mut self.bins[ch]
    }
}

/// Forward real FFT at a fixed size and sample rate, with a reusable plan
/// and preallocated scratch.
pub struct FftAnalyzer {
    fft_size: usize,
    sample_rate: u32,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    window_norm: f32,
    buf: Vec<Complex<f32>>,
}

impl FftAnalyzer {
    /// # Errors
    /// Returns [`VadError::Config`] when `fft_size` is zero or odd, or the
    /// sample rate is zero.
    pub fn new(fft_size: usize, sample_rate: u32) -> Result<Self> {
        if fft_size == 0 || fft_size % 2 != 0 {
            return Err(VadError::Config(format!(
                "fft_size must be positive and even, got {fft_size}"
            )));
        }
        if sample_rate == 0 {
            return Err(VadError::Config("sample rate must be non-zero".into()));
        }

        let window = periodic_hann(fft_size);
        let window_sum: f32 = window.iter().sum();
        let window_norm = fft_size as f32 / window_sum;
        let fft = FftPlanner::<f32>::new().plan_fft_forward(fft_size);

        Ok(Self {
            fft_size,
            sample_rate,
            fft,
            window,
            window_norm,
            buf: vec![Complex::new(0.0, 0.0); fft_size],
        })
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn bin_count(&self) -> usize {
        self.fft_size / 2 + 1
    }

    /// Width of one frequency bin in Hz.
    pub fn bin_width(&self) -> f32 {
        self.sample_rate as f32 / self.fft_size as f32
    }

    pub fn nyquist(&self) -> f32 {
        self.sample_rate as f32 / 2.0
    }

    /// Nearest bin for `freq`.
    ///
    /// # Errors
    /// Returns [`VadError::Config`] for negative frequencies or frequencies
    /// above Nyquist.
    pub fn freq_to_bin(&self, freq: f32) -> Result<usize> {
        if freq < 0.0 || freq > self.nyquist() {
            return Err(VadError::Config(format!(
                "frequency {freq} Hz outside [0, {}]",
                self.nyquist()
            )));
        }
        Ok((freq / self.bin_width()).round() as usize)
    }

    pub fn bin_to_freq(&self, bin: usize) -> f32 {
        bin as f32 * self.bin_width()
    }

    /// Run one windowed FFT over `samples`, writing normalized magnitudes
    /// for bins `0..=fft_size/2` into `out`.
    ///
    /// # Panics
    /// Panics when `samples` is not `fft_size` long or `out` is not
    /// `bin_count` long.
    pub fn process(&mut self, samples: &SplitSlice<'_, f32>, out: &mut [f32]) {
        assert_eq!(samples.len(), self.fft_size, "fft input length mismatch");
        assert_eq!(out.len(), self.bin_count(), "fft output length mismatch");

        for (i, &s) in samples.iter().enumerate() {
            self.buf[i] = Complex::new(s * self.window[i], 0.0);
        }
        self.fft.process(&mut self.buf);

        let scale = self.window_norm / (self.fft_size as f32 / 2.0);
        for (bin, o) in out.iter_mut().enumerate() {
            *o = self.buf[bin].norm() * scale;
        }
    }

    /// Per-channel sum of bin magnitudes over `[f_min, f_max]`, inclusive on
    /// both bin ends. A sum rather than a mean: the state machine calibrates
    /// its long-term averages against the same quantity.
    ///
    /// # Errors
    /// Returns [`VadError::Config`] when either frequency is out of range or
    /// the band is inverted, and [`VadError::ChannelMismatch`] when `out`
    /// does not match the result's channel count.
    pub fn average_volume_in_band(
        &self,
        result: &FftResult,
        f_min: f32,
        f_max: f32,
        out: &mut [f32],
    ) -> Result<()> {
        if out.len() != result.n_channels() {
            return Err(VadError::ChannelMismatch {
                expected: result.n_channels(),
                got: out.len(),
            });
        }
        let lo = self.freq_to_bin(f_min)?;
        let hi = self.freq_to_bin(f_max)?;
        if hi < lo {
            return Err(VadError::Config(format!(
                "inverted frequency band [{f_min}, {f_max}]"
            )));
        }
        for (ch, o) in out.iter_mut().enumerate() {
            *o = result.channel_bins(ch)[lo..=hi].iter().sum();
        }
        Ok(())
    }
}

impl std::fmt::Debug for FftAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FftAnalyzer")
            .field("fft_size", &self.fft_size)
            .field("sample_rate", &self.sample_rate)
            .finish_non_exhaustive()
    }
}

fn periodic_hann(n: usize) -> Vec<f32> {
    use std::f32::consts::PI;
    (0..n)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / n as f32).cos()))
        .collect()
}
