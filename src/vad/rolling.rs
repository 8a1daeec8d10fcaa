//! Fixed-window arithmetic mean over a circular window.
//!
//! Runs in f64: the long-term speech average spans minutes of evaluations
//! and f32 accumulation drifts over windows that long. The O(W) recompute
//! per push is fine — this sits on the control path, not the audio path.

/// Rolling mean with an optional seeded prior.
#[derive(Debug, Clone)]
pub struct RollingAverage {
    window: Vec<f64>,
    write_idx: usize,
    written: usize,
    last_avg: Option<f64>,
}

impl RollingAverage {
    /// # Panics
    /// Panics on a zero window length.
    pub fn new(window_len: usize) -> Self {
        assert!(window_len > 0, "rolling window must be non-empty");
        Self {
            window: vec![0.0; window_len],
            write_idx: 0,
            written: 0,
            last_avg: None,
        }
    }

    /// Pre-fill the window with `prior` so the average is defined before the
    /// first real sample and early samples only dilute it gradually.
    pub fn with_prior(window_len: usize, prior: f64) -> Self {
        assert!(window_len > 0, "rolling window must be non-empty");
        Self {
            window: vec![prior; window_len],
            write_idx: 0,
            written: window_len,
            last_avg: Some(prior),
        }
    }

    /// Insert a sample and return the mean over the valid window prefix.
    pub fn push(&mut self, value: f64) -> f64 {
        self.window[self.write_idx] = value;
        self.write_idx = (self.write_idx + 1) % self.window.len();
        self.written = (self.written + 1).min(self.window.len());

        let avg = self.window[..self.written].iter().sum::<f64>() / self.written as f64;
        self.last_avg = Some(avg);
        avg
    }

    /// Mean as of the most recent push, or the prior when seeded.
    pub fn last_avg(&self) -> Option<f64> {
        self.last_avg
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }
}
