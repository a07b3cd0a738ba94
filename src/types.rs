//! Clock & Types: time helpers, signal enums, and the `Sample`/`Estimation` records.

use num_complex::Complex64;
use std::time::{SystemTime, UNIX_EPOCH};

/// Number of monitored signals: VA, VB, VC, IA, IB, IC.
pub const SIGNAL_COUNT: usize = 6;

/// Fractional-second denominator used on the C37.118 wire (`TIME_BASE`).
pub const TIME_BASE: u32 = 1_000_000;

pub const SIGNAL_NAMES: [&str; SIGNAL_COUNT] = ["VA", "VB", "VC", "IA", "IB", "IC"];

/// Index into `Sample::channels` / `Estimation::phasors` etc.
pub type SignalIndex = usize;

/// Voltage channel indices: VA, VB, VC.
pub const VOLTAGE_SIGNALS: [SignalIndex; 3] = [0, 1, 2];
/// Current channel indices: IA, IB, IC.
pub const CURRENT_SIGNALS: [SignalIndex; 3] = [3, 4, 5];
/// Same-phase pairs: (VA,IA), (VB,IB), (VC,IC).
pub const PHASE_PAIRS: [(SignalIndex, SignalIndex); 3] = [(0, 3), (1, 4), (2, 5)];

/// Whether `signal` carries a voltage (vs current).
pub fn is_voltage(signal: SignalIndex) -> bool {
    VOLTAGE_SIGNALS.contains(&signal)
}

/// The signals sharing `signal`'s electrical phase (the other member of its VA/IA-style pair).
pub fn signals_of_phase(signal: SignalIndex) -> Option<(SignalIndex, SignalIndex)> {
    PHASE_PAIRS.into_iter().find(|&(v, i)| v == signal || i == signal)
}

/// Microseconds since the Unix epoch, per the clock backing the running process.
pub fn wall_now_us() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_micros() as i64
}

/// One time-stamped multi-channel ADC reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Sample {
    pub seq: u64,
    pub channels: [u16; SIGNAL_COUNT],
    pub timestamp_us: i64,
    pub time_delta_us: i64,
}

impl Sample {
    pub fn format_csv(&self) -> String {
        format!(
            "seq_no={},ch0={},ch1={},ch2={},ch3={},ch4={},ch5={},ts={},delta={}",
            self.seq,
            self.channels[0],
            self.channels[1],
            self.channels[2],
            self.channels[3],
            self.channels[4],
            self.channels[5],
            self.timestamp_us,
            self.time_delta_us,
        )
    }

    /// Parses a `key=value,...` CSV line, tolerating surrounding whitespace and
    /// a trailing comma.
    pub fn parse_csv(line: &str) -> Option<Sample> {
        let mut sample = Sample::default();
        for field in line.trim().trim_end_matches(',').split(',') {
            let field = field.trim();
            if field.is_empty() {
                continue;
            }
            let (key, value) = field.split_once('=')?;
            let key = key.trim();
            let value = value.trim();
            match key {
                "seq_no" => sample.seq = value.parse().ok()?,
                "ts" => sample.timestamp_us = value.parse().ok()?,
                "delta" => sample.time_delta_us = value.parse().ok()?,
                _ if key.starts_with("ch") => {
                    let idx: usize = key[2..].parse().ok()?;
                    if idx >= SIGNAL_COUNT {
                        return None;
                    }
                    sample.channels[idx] = value.parse().ok()?;
                }
                _ => {}
            }
        }
        Some(sample)
    }

    pub fn to_binary(&self) -> [u8; 64] {
        use byteorder::{BigEndian, ByteOrder};
        let mut buf = [0u8; 64];
        BigEndian::write_u64(&mut buf[0..8], self.seq);
        for (i, &ch) in self.channels.iter().enumerate() {
            BigEndian::write_u16(&mut buf[8 + i * 2..10 + i * 2], ch);
        }
        BigEndian::write_i64(&mut buf[20..28], self.timestamp_us);
        BigEndian::write_i64(&mut buf[28..36], self.time_delta_us);
        buf
    }

    pub fn from_binary(buf: &[u8; 64]) -> Sample {
        use byteorder::{BigEndian, ByteOrder};
        let mut channels = [0u16; SIGNAL_COUNT];
        for (i, ch) in channels.iter_mut().enumerate() {
            *ch = BigEndian::read_u16(&buf[8 + i * 2..10 + i * 2]);
        }
        Sample {
            seq: BigEndian::read_u64(&buf[0..8]),
            channels,
            timestamp_us: BigEndian::read_i64(&buf[20..28]),
            time_delta_us: BigEndian::read_i64(&buf[28..36]),
        }
    }
}

/// One estimation produced per incoming sample.
#[derive(Debug, Clone, Copy)]
pub struct Estimation {
    pub phasors: [Complex64; SIGNAL_COUNT],
    pub frequencies: [f64; SIGNAL_COUNT],
    pub rocofs: [f64; SIGNAL_COUNT],
    pub sampling_rate: f64,
}

impl Default for Estimation {
    fn default() -> Self {
        Estimation {
            phasors: [Complex64::new(0.0, 0.0); SIGNAL_COUNT],
            frequencies: [0.0; SIGNAL_COUNT],
            rocofs: [0.0; SIGNAL_COUNT],
            sampling_rate: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_round_trip() {
        let line = "seq_no=42,ch0=100,ch1=200,ch2=300,ch3=400,ch4=500,ch5=600,ts=1700000000000000,delta=833";
        let sample = Sample::parse_csv(line).unwrap();
        assert_eq!(sample.seq, 42);
        assert_eq!(sample.channels, [100, 200, 300, 400, 500, 600]);
        assert_eq!(sample.timestamp_us, 1_700_000_000_000_000);
        assert_eq!(sample.time_delta_us, 833);
        assert_eq!(Sample::parse_csv(&sample.format_csv()).unwrap(), sample);
    }

    #[test]
    fn csv_tolerates_whitespace_and_trailing_comma() {
        let line = " seq_no=1, ch0=1,ch1=2,ch2=3,ch3=4,ch4=5,ch5=6,ts=10,delta=0, ";
        let sample = Sample::parse_csv(line).unwrap();
        assert_eq!(sample.seq, 1);
        assert_eq!(sample.channels, [1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn binary_round_trip() {
        let sample = Sample {
            seq: 7,
            channels: [1, 2, 3, 4, 5, 6],
            timestamp_us: -5,
            time_delta_us: 833,
        };
        assert_eq!(Sample::from_binary(&sample.to_binary()), sample);
    }

    #[test]
    fn signal_helpers() {
        assert!(is_voltage(0));
        assert!(!is_voltage(3));
        assert_eq!(signals_of_phase(0), Some((0, 3)));
        assert_eq!(signals_of_phase(3), Some((0, 3)));
    }
}
