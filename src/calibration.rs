//! Calibration Table: per-channel affine transform with settings-store persistence.

use crate::error::{PmuError, Result};
use crate::settings::SettingsStore;
use crate::types::{SIGNAL_COUNT, SignalIndex};

const MAX_POINTS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationEntry {
    pub slope: f64,
    pub intercept: f64,
}

impl Default for CalibrationEntry {
    fn default() -> Self {
        CalibrationEntry { slope: 1.0, intercept: 0.0 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CalibrationTable {
    entries: [CalibrationEntry; SIGNAL_COUNT],
    points: [Vec<(f64, f64)>; SIGNAL_COUNT],
}

impl CalibrationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(&self, signal: SignalIndex) -> Result<CalibrationEntry> {
        self.entries.get(signal).copied().ok_or(PmuError::InvalidSignalIndex(signal))
    }

    /// Fits `y = slope*x + intercept` by ordinary least squares. Falls back to
    /// the identity transform when fewer than two points are given or the
    /// x-variance is zero (collinear/degenerate input).
    pub fn calibrate_from_points(
        &mut self,
        signal: SignalIndex,
        points: &[(f64, f64)],
    ) -> Result<(f64, f64)> {
        if signal >= SIGNAL_COUNT {
            return Err(PmuError::InvalidSignalIndex(signal));
        }
        for &(x, y) in points {
            if x < 0.0 || y < 0.0 {
                return Err(PmuError::InvalidPoint(x, y));
            }
        }

        let fit = least_squares(points).unwrap_or(CalibrationEntry::default());
        self.entries[signal] = fit;
        self.points[signal] = points.iter().take(MAX_POINTS).copied().collect();
        Ok((fit.slope, fit.intercept))
    }

    pub fn apply(&self, signal: SignalIndex, raw_magnitude: f64) -> Result<f64> {
        let entry = self.entry(signal)?;
        Ok(entry.slope * raw_magnitude + entry.intercept)
    }

    pub fn load(&mut self, store: &dyn SettingsStore) -> Result<()> {
        for signal in 0..SIGNAL_COUNT {
            let slope_key = format!("calibration/{}/slope", signal);
            let intercept_key = format!("calibration/{}/intercept", signal);
            let points_key = format!("calibration/{}/points", signal);

            let slope = store.get_f64(&slope_key)?.unwrap_or(1.0);
            let intercept = store.get_f64(&intercept_key)?.unwrap_or(0.0);
            self.entries[signal] = CalibrationEntry { slope, intercept };
            self.points[signal] = store.get_points(&points_key)?.unwrap_or_default();
        }
        Ok(())
    }

    pub fn save(&self, store: &dyn SettingsStore) -> Result<()> {
        for signal in 0..SIGNAL_COUNT {
            let entry = self.entries[signal];
            store.set_f64(&format!("calibration/{}/slope", signal), entry.slope)?;
            store.set_f64(&format!("calibration/{}/intercept", signal), entry.intercept)?;
            store.set_points(&format!("calibration/{}/points", signal), &self.points[signal])?;
        }
        Ok(())
    }
}

/// Ordinary least-squares fit of `y = slope*x + intercept`. Returns `None`
/// when there are fewer than two points or the x-variance is zero.
fn least_squares(points: &[(f64, f64)]) -> Option<CalibrationEntry> {
    if points.len() < 2 {
        return None;
    }
    let n = points.len() as f64;
    let sum_x: f64 = points.iter().map(|(x, _)| x).sum();
    let sum_y: f64 = points.iter().map(|(_, y)| y).sum();
    let sum_xx: f64 = points.iter().map(|(x, _)| x * x).sum();
    let sum_xy: f64 = points.iter().map(|(x, y)| x * y).sum();

    let denom = n * sum_xx - sum_x * sum_x;
    if denom == 0.0 {
        return None;
    }
    let slope = (n * sum_xy - sum_x * sum_y) / denom;
    let intercept = (sum_y - slope * sum_x) / n;
    Some(CalibrationEntry { slope, intercept })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_when_fewer_than_two_points() {
        let mut table = CalibrationTable::new();
        let (slope, intercept) = table.calibrate_from_points(0, &[(100.0, 120.0)]).unwrap();
        assert_eq!((slope, intercept), (1.0, 0.0));
    }

    #[test]
    fn identity_when_collinear_x() {
        let mut table = CalibrationTable::new();
        let (slope, intercept) = table
            .calibrate_from_points(0, &[(100.0, 10.0), (100.0, 20.0)])
            .unwrap();
        assert_eq!((slope, intercept), (1.0, 0.0));
    }

    #[test]
    fn fits_exact_affine_points() {
        let mut table = CalibrationTable::new();
        let (slope, intercept) = table
            .calibrate_from_points(0, &[(100.0, 120.0), (200.0, 240.0), (300.0, 360.0)])
            .unwrap();
        assert!((slope - 1.2).abs() < 1e-9);
        assert!(intercept.abs() < 1e-9);

        assert!((table.apply(0, 100.0).unwrap() - 120.0).abs() < 1e-6);
        assert!((table.apply(0, 300.0).unwrap() - 360.0).abs() < 1e-6);
    }

    #[test]
    fn rejects_negative_points() {
        let mut table = CalibrationTable::new();
        assert!(matches!(
            table.calibrate_from_points(0, &[(-1.0, 1.0), (2.0, 2.0)]),
            Err(PmuError::InvalidPoint(_, _))
        ));
    }

    #[test]
    fn rejects_out_of_range_signal() {
        let mut table = CalibrationTable::new();
        assert!(matches!(
            table.calibrate_from_points(6, &[(1.0, 1.0), (2.0, 2.0)]),
            Err(PmuError::InvalidSignalIndex(6))
        ));
    }
}
