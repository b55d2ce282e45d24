//! Lead-off impedance estimation.
//!
//! In impedance mode the board drives a known AC current through the electrode.
//! The impedance of each channel follows from Ohm's law applied to RMS values:
//! `Z = V_rms / I_rms`, with `I_rms = I_peak / sqrt(2)`.

use std::f64::consts::SQRT_2;

/// Peak lead-off drive current (6 nA).
pub const DRIVE_CURRENT_AMPS: f64 = 6e-9;

/// RMS value of the lead-off drive current.
pub fn rms_current() -> f64 {
    DRIVE_CURRENT_AMPS / SQRT_2
}

/// Accumulates per-channel squared voltages over a window of samples.
#[derive(Debug, Clone)]
pub struct ImpedanceEstimator {
    sum_squares: Vec<f64>,
    count: usize,
}

impl ImpedanceEstimator {
    /// Create an estimator for `channels` channels.
    pub fn new(channels: usize) -> Self {
        Self {
            sum_squares: vec![0.0; channels],
            count: 0,
        }
    }

    /// Add one reading, in volts.
    pub fn push(&mut self, volts: &[f32]) {
        for (acc, &v) in self.sum_squares.iter_mut().zip(volts) {
            *acc += f64::from(v) * f64::from(v);
        }
        self.count += 1;
    }

    /// Number of readings added.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Returns true if no readings were added.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// RMS voltage per channel; NaN before any reading.
    pub fn rms_volts(&self) -> Vec<f64> {
        if self.count == 0 {
            return vec![f64::NAN; self.sum_squares.len()];
        }
        self.sum_squares
            .iter()
            .map(|s| (s / self.count as f64).sqrt())
            .collect()
    }

    /// Impedance per channel in ohms.
    pub fn ohms(&self) -> Vec<f32> {
        let irms = rms_current();
        self.rms_volts()
            .into_iter()
            .map(|vrms| (vrms / irms) as f32)
            .collect()
    }
}
