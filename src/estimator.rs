//! Ties the Sliding DFT and Frequency/ROCOF estimators together into the
//! per-sample `Estimation` the Data Processor publishes.

use crate::error::Result;
use crate::freq::FrequencyEstimator;
use crate::sdft::SlidingDft;
use crate::types::{Estimation, Sample, SIGNAL_COUNT};

pub struct Estimator {
    sdft: SlidingDft,
    freq: FrequencyEstimator,
}

impl Estimator {
    pub fn new(fs: u32, f0: u32) -> Result<Self> {
        Ok(Estimator { sdft: SlidingDft::new(fs, f0)?, freq: FrequencyEstimator::new() })
    }

    pub fn update(&mut self, sample: &Sample) -> Estimation {
        let mut channels = [0.0; SIGNAL_COUNT];
        for (i, &c) in sample.channels.iter().enumerate() {
            channels[i] = c as f64;
        }
        self.sdft.update(&channels);
        self.freq.update(sample.timestamp_us, &channels, sample.time_delta_us);

        let mut phasors = [num_complex::Complex64::new(0.0, 0.0); SIGNAL_COUNT];
        let mut frequencies = [0.0; SIGNAL_COUNT];
        let mut rocofs = [0.0; SIGNAL_COUNT];
        for signal in 0..SIGNAL_COUNT {
            phasors[signal] = self.sdft.phasor(signal);
            frequencies[signal] = self.freq.frequency(signal);
            rocofs[signal] = self.freq.rocof(signal);
        }

        Estimation { phasors, frequencies, rocofs, sampling_rate: self.freq.sampling_rate() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produces_an_estimation_per_sample() {
        let mut est = Estimator::new(1200, 50).unwrap();
        let sample = Sample { seq: 0, channels: [100; 6], timestamp_us: 0, time_delta_us: 0 };
        let estimation = est.update(&sample);
        assert_eq!(estimation.phasors.len(), SIGNAL_COUNT);
    }
}
