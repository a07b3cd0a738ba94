//! Sliding DFT Estimator: incremental one-bin DFT per channel over a
//! 1-cycle window, strictly O(1) per sample.

use crate::error::{PmuError, Result};
use crate::types::SIGNAL_COUNT;
use num_complex::Complex64;
use std::f64::consts::PI;

/// Per-channel incremental single-bin DFT tracking the fundamental frequency.
pub struct SlidingDft {
    window_len: usize,
    twiddle: Complex64,
    history: [Vec<f64>; SIGNAL_COUNT],
    phasors: [Complex64; SIGNAL_COUNT],
    write_idx: usize,
}

impl SlidingDft {
    /// `fs` and `f0` are the sampling rate and nominal fundamental frequency in Hz.
    /// Fails if `fs mod f0 != 0` or `fs <= 2*f0` (Nyquist).
    pub fn new(fs: u32, f0: u32) -> Result<Self> {
        if f0 == 0 || fs % f0 != 0 || fs <= 2 * f0 {
            return Err(PmuError::EstimatorPrecondition { fs, f0 });
        }
        let window_len = (fs / f0) as usize;
        let twiddle = Complex64::from_polar(1.0, -2.0 * PI / window_len as f64);
        Ok(SlidingDft {
            window_len,
            twiddle,
            history: std::array::from_fn(|_| vec![0.0; window_len]),
            phasors: [Complex64::new(0.0, 0.0); SIGNAL_COUNT],
            write_idx: 0,
        })
    }

    pub fn window_len(&self) -> usize {
        self.window_len
    }

    /// Advances every channel's bin by one sample.
    pub fn update(&mut self, channels: &[f64; SIGNAL_COUNT]) {
        for signal in 0..SIGNAL_COUNT {
            let x_old = self.history[signal][self.write_idx];
            let x_new = channels[signal];
            self.history[signal][self.write_idx] = x_new;
            let prev = self.phasors[signal];
            self.phasors[signal] = self.twiddle * (prev - x_old + x_new);
        }
        self.write_idx = (self.write_idx + 1) % self.window_len;
    }

    /// Reads the normalized phasor for `signal` (raw accumulator divided by window length).
    pub fn phasor(&self, signal: usize) -> Complex64 {
        self.phasors[signal] / self.window_len as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_scratch_dft(samples: &[f64], window_len: usize) -> Complex64 {
        let mut acc = Complex64::new(0.0, 0.0);
        for (n, &x) in samples.iter().enumerate() {
            let angle = -2.0 * PI * n as f64 / window_len as f64;
            acc += Complex64::from_polar(x, angle);
        }
        acc / window_len as f64
    }

    #[test]
    fn rejects_non_divisible_fs() {
        assert!(matches!(
            SlidingDft::new(1000, 60),
            Err(PmuError::EstimatorPrecondition { fs: 1000, f0: 60 })
        ));
    }

    #[test]
    fn rejects_sub_nyquist_fs() {
        assert!(matches!(
            SlidingDft::new(100, 60),
            Err(PmuError::EstimatorPrecondition { .. })
        ));
    }

    #[test]
    fn matches_from_scratch_dft_after_full_window() {
        let fs = 1200;
        let f0 = 50;
        let mut sdft = SlidingDft::new(fs, f0).unwrap();
        let n = sdft.window_len();
        assert_eq!(n, 24);

        let mut samples = Vec::with_capacity(n);
        for i in 0..n {
            let x = 1000.0 + 1000.0 * (2.0 * PI * f0 as f64 * i as f64 / fs as f64).cos();
            samples.push(x);
            let mut channels = [0.0; SIGNAL_COUNT];
            channels[0] = x;
            sdft.update(&channels);
        }

        let expected = from_scratch_dft(&samples, n);
        let got = sdft.phasor(0);
        let rel_err = (got - expected).norm() / expected.norm().max(1e-12);
        assert!(rel_err < 1e-9, "rel_err={rel_err}");
    }

    #[test]
    fn tolerates_small_measurement_noise() {
        let fs = 1200;
        let f0 = 50;
        let mut sdft = SlidingDft::new(fs, f0).unwrap();
        let n = sdft.window_len();
        for i in 0..(5 * n) {
            let clean = 1000.0 * (2.0 * PI * f0 as f64 * i as f64 / fs as f64).cos();
            let noise: f64 = rand::random::<f64>() * 2.0 - 1.0; // +/-1 count jitter
            let mut channels = [0.0; SIGNAL_COUNT];
            channels[0] = clean + noise;
            sdft.update(&channels);
        }
        let mag = sdft.phasor(0).norm();
        assert!((mag - 1000.0).abs() < 10.0, "mag={mag}");
    }

    #[test]
    fn synthetic_50hz_fs_1200_settles_to_expected_magnitude() {
        let fs = 1200;
        let f0 = 50;
        let mut sdft = SlidingDft::new(fs, f0).unwrap();
        for n in 0..24 {
            let x = (1000.0 + 1000.0 * (2.0 * PI * 50.0 * n as f64 / 1200.0).cos()).round();
            let mut channels = [0.0; SIGNAL_COUNT];
            channels[0] = x;
            sdft.update(&channels);
        }
        let mag = sdft.phasor(0).norm();
        assert!((mag - 500.0).abs() < 5.0, "mag={mag}");
    }
}
