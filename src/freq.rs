//! Frequency & ROCOF Estimator: zero-crossing-based frequency over a rolling
//! 1-second window aligned to sample timestamps.

use crate::types::SIGNAL_COUNT;

const ONE_SECOND_US: i64 = 1_000_000;

#[derive(Debug, Clone, Copy)]
struct TimedSample {
    timestamp_us: i64,
    value: f64,
}

struct ChannelWindow {
    samples: Vec<TimedSample>,
    window_start: i64,
    window_end: i64,
    frequency: f64,
    rocof: f64,
}

impl ChannelWindow {
    fn new() -> Self {
        ChannelWindow {
            samples: Vec::new(),
            window_start: 0,
            window_end: ONE_SECOND_US,
            frequency: 0.0,
            rocof: 0.0,
        }
    }
}

/// Per-channel rolling frequency/ROCOF estimator, one instance shared across
/// all six signals (the window reset is aligned on the common sample stream).
pub struct FrequencyEstimator {
    channels: [ChannelWindow; SIGNAL_COUNT],
    sampling_rate: f64,
    initialized: bool,
}

impl FrequencyEstimator {
    pub fn new() -> Self {
        FrequencyEstimator {
            channels: std::array::from_fn(|_| ChannelWindow::new()),
            sampling_rate: 0.0,
            initialized: false,
        }
    }

    pub fn sampling_rate(&self) -> f64 {
        self.sampling_rate
    }

    pub fn frequency(&self, signal: usize) -> f64 {
        self.channels[signal].frequency
    }

    pub fn rocof(&self, signal: usize) -> f64 {
        self.channels[signal].rocof
    }

    /// Feeds one multi-channel sample at `timestamp_us`, closing and
    /// re-opening the 1-second window when it has elapsed.
    pub fn update(&mut self, timestamp_us: i64, values: &[f64; SIGNAL_COUNT], time_delta_us: i64) {
        if !self.initialized {
            for ch in &mut self.channels {
                ch.window_start = timestamp_us;
                ch.window_end = timestamp_us + ONE_SECOND_US;
            }
            self.initialized = true;
        }

        let mut window_closed = false;
        for (signal, ch) in self.channels.iter_mut().enumerate() {
            ch.samples.push(TimedSample { timestamp_us, value: values[signal] });
            if timestamp_us >= ch.window_end {
                window_closed = true;
            }
        }

        if window_closed {
            let samples_in_window = self.channels[0].samples.len();
            let window_start = self.channels[0].window_start;
            for ch in &mut self.channels {
                close_window(ch, time_delta_us);
                ch.window_start = timestamp_us;
                ch.window_end = timestamp_us + ONE_SECOND_US;
                ch.samples.clear();
            }
            // residue-corrected sampling rate, shared across channels (same
            // underlying sample stream). The closing sample usually overshoots
            // the 1s boundary by a fraction of a sample period; residue is
            // that overshoot expressed in seconds.
            let samples_window_s = (timestamp_us - window_start) as f64 / 1_000_000.0;
            let residue = 1.0 - samples_window_s;
            self.sampling_rate = samples_in_window as f64 * (1.0 + residue);
        }
    }
}

impl Default for FrequencyEstimator {
    fn default() -> Self {
        Self::new()
    }
}

fn close_window(ch: &mut ChannelWindow, time_delta_us: i64) {
    if ch.samples.len() < 2 {
        return;
    }
    let min = ch.samples.iter().map(|s| s.value).fold(f64::INFINITY, f64::min);
    let max = ch.samples.iter().map(|s| s.value).fold(f64::NEG_INFINITY, f64::max);
    let v_zero = (min + max) / 2.0;

    let mut crossings = 0u32;
    let mut t_first: Option<f64> = None;
    let mut t_last: Option<f64> = None;

    for window in ch.samples.windows(2) {
        let (s0, s1) = (window[0], window[1]);
        let x0 = s0.value - v_zero;
        let x1 = s1.value - v_zero;
        if x0 == 0.0 || (x0 < 0.0) != (x1 < 0.0) {
            crossings += 1;
            let t = if x1 == x0 {
                s0.timestamp_us as f64
            } else {
                s0.timestamp_us as f64
                    + (0.0 - x0) * (s1.timestamp_us - s0.timestamp_us) as f64 / (x1 - x0)
            };
            if t_first.is_none() {
                t_first = Some(t);
            }
            t_last = Some(t);
        }
    }

    if crossings < 2 {
        let freq_prev = ch.frequency;
        ch.frequency = 0.0;
        ch.rocof = if time_delta_us != 0 {
            (ch.frequency - freq_prev) * 1_000_000.0 / time_delta_us as f64
        } else {
            ch.rocof
        };
        return;
    }

    let t_first = t_first.unwrap();
    let t_last = t_last.unwrap();
    let crossing_span = (t_last - t_first) / 1_000_000.0;
    let residue = 1.0 - crossing_span;
    let cycles = ((crossings.saturating_sub(1)) as f64) / 2.0;
    let freq_new = cycles * (1.0 + residue);

    let freq_prev = ch.frequency;
    ch.frequency = freq_new;
    ch.rocof = if time_delta_us != 0 {
        (freq_new - freq_prev) * 1_000_000.0 / time_delta_us as f64
    } else {
        ch.rocof
    };
}
