//! Linear load-cell model and the operator side of calibrating it.

use irrigator_config::ScaleKey;

use crate::error::IrrigationError;

/// Per-scale linear model: `weight = (raw - zero_offset) / gain_factor`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    /// Raw counts with the scale empty.
    pub zero_offset: i32,
    /// Raw counts per unit of mass.
    pub gain_factor: f64,
}

impl Calibration {
    pub fn new(zero_offset: i32, gain_factor: f64) -> Self {
        Self {
            zero_offset,
            gain_factor,
        }
    }

    /// Gain used for conversion. A zero (or non-finite) gain would divide by
    /// zero, so it is replaced by 1.
    pub fn effective_gain(&self) -> f64 {
        if self.gain_factor == 0.0 || !self.gain_factor.is_finite() {
            1.0
        } else {
            self.gain_factor
        }
    }

    /// Convert one raw reading to mass units.
    pub fn to_weight(&self, raw: i32) -> f64 {
        (f64::from(raw) - f64::from(self.zero_offset)) / self.effective_gain()
    }

    /// Gain derived from the averaged raw reading under a known mass.
    pub fn gain_from(&self, raw_avg: f64, known_mass: f64) -> f64 {
        (raw_avg - f64::from(self.zero_offset)) / known_mass
    }
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            zero_offset: 0,
            gain_factor: 1.0,
        }
    }
}

/// Operator-facing half of calibration.
///
/// Calibration needs a person (or a rig) to empty the scale and then put a
/// reference mass on it. The controller asks through this trait so the same
/// procedure runs with a console prompt, a fixed mass or a test script.
pub trait CalibrationProvider {
    /// Called before zeroing `key`; the scale must be empty on return.
    fn prepare_zero(&mut self, key: ScaleKey) -> Result<(), IrrigationError>;

    /// Called before computing the gain; returns the mass now on `key`.
    fn reference_mass(&mut self, key: ScaleKey) -> Result<f64, IrrigationError>;
}

impl<P: CalibrationProvider + ?Sized> CalibrationProvider for Box<P> {
    fn prepare_zero(&mut self, key: ScaleKey) -> Result<(), IrrigationError> {
        (**self).prepare_zero(key)
    }
    fn reference_mass(&mut self, key: ScaleKey) -> Result<f64, IrrigationError> {
        (**self).reference_mass(key)
    }
}

/// Non-interactive provider: assumes scales are staged by someone else and
/// always reports the same reference mass.
#[derive(Debug, Clone, Copy)]
pub struct FixedMassProvider {
    mass: f64,
}

impl FixedMassProvider {
    pub fn new(mass: f64) -> Result<Self, IrrigationError> {
        if !(mass.is_finite() && mass > 0.0) {
            return Err(IrrigationError::InvalidConfig(format!(
                "reference mass must be > 0 (got {mass})"
            )));
        }
        Ok(Self { mass })
    }
}

impl CalibrationProvider for FixedMassProvider {
    fn prepare_zero(&mut self, key: ScaleKey) -> Result<(), IrrigationError> {
        tracing::debug!(scale = %key, "assuming scale is empty");
        Ok(())
    }

    fn reference_mass(&mut self, _key: ScaleKey) -> Result<f64, IrrigationError> {
        Ok(self.mass)
    }
}

/// Round to `decimals` places.
pub fn round_to(x: f64, decimals: u32) -> f64 {
    let p = 10f64.powi(decimals.min(15) as i32);
    (x * p).round() / p
}
