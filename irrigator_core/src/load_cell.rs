//! One load cell: its amplifier behind a mux channel plus its calibration.

use irrigator_config::ScaleKey;
use irrigator_traits::{Amplifier, MuxDriver};

use crate::bus::BusHandle;
use crate::calibration::{Calibration, CalibrationProvider, round_to};
use crate::error::{BusError, IrrigationError};
use crate::hw_error::map_amp_error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Unprobed,
    Connected,
    Absent,
}

#[derive(Debug, Clone)]
pub struct LoadCell {
    key: ScaleKey,
    calibration: Option<Calibration>,
    link: Link,
}

impl LoadCell {
    pub fn new(key: ScaleKey) -> Self {
        Self {
            key,
            calibration: None,
            link: Link::Unprobed,
        }
    }

    pub fn key(&self) -> ScaleKey {
        self.key
    }

    pub fn calibration(&self) -> Option<Calibration> {
        self.calibration
    }

    pub fn set_calibration(&mut self, cal: Calibration) {
        self.calibration = Some(cal);
    }

    pub fn is_connected(&self) -> bool {
        self.link == Link::Connected
    }

    pub fn is_probed(&self) -> bool {
        self.link != Link::Unprobed
    }

    /// Initialise the amplifier. Returns whether it answered; a cell that did
    /// not is left out of later reads.
    pub fn connect<M: MuxDriver, A: Amplifier>(&mut self, bus: &mut BusHandle<M, A>) -> bool {
        let key = self.key;
        let res = bus.with_channel(key, |amp, _| {
            amp.begin().map_err(|e| map_amp_error(key, &*e))
        });
        self.link = match res {
            Ok(true) => {
                tracing::info!(scale = %key, "amplifier connected");
                Link::Connected
            }
            Ok(false) => {
                tracing::warn!(scale = %key, "no amplifier answered, skipping scale");
                Link::Absent
            }
            Err(e) => {
                tracing::warn!(scale = %key, error = %e, "amplifier init failed, skipping scale");
                Link::Absent
            }
        };
        self.is_connected()
    }

    /// Average raw counts over `samples` conversions, all inside one
    /// channel selection.
    pub fn raw_average<M: MuxDriver, A: Amplifier>(
        &self,
        bus: &mut BusHandle<M, A>,
        samples: usize,
    ) -> Result<f64, IrrigationError> {
        self.ensure_connected()?;
        let key = self.key;
        let n = samples.max(1);
        let sum = bus.with_channel(key, |amp, timeout| {
            let mut sum = 0i64;
            for _ in 0..n {
                let raw = amp.read_raw(timeout).map_err(|e| map_amp_error(key, &*e))?;
                sum += i64::from(raw);
            }
            Ok(sum)
        })?;
        Ok(sum as f64 / n as f64)
    }

    /// Measure the empty-scale reading and store it as the zero offset.
    /// An existing gain is kept; a fresh cell starts with gain 1.
    pub fn compute_zero_offset<M: MuxDriver, A: Amplifier>(
        &mut self,
        bus: &mut BusHandle<M, A>,
        samples: usize,
    ) -> Result<i32, IrrigationError> {
        let avg = self.raw_average(bus, samples)?;
        let zero = avg.round() as i32;
        let gain = self.calibration.map_or(1.0, |c| c.gain_factor);
        self.calibration = Some(Calibration::new(zero, gain));
        tracing::debug!(scale = %self.key, zero, "zero offset computed");
        Ok(zero)
    }

    /// Derive the gain from a reading taken with `known_mass` on the scale.
    /// Requires a zero offset.
    pub fn compute_gain_factor<M: MuxDriver, A: Amplifier>(
        &mut self,
        bus: &mut BusHandle<M, A>,
        known_mass: f64,
        samples: usize,
    ) -> Result<f64, IrrigationError> {
        if !(known_mass.is_finite() && known_mass > 0.0) {
            return Err(IrrigationError::InvalidConfig(format!(
                "reference mass must be > 0 (got {known_mass})"
            )));
        }
        let mut cal = self
            .calibration
            .ok_or(IrrigationError::CalibrationMissing(self.key))?;
        let avg = self.raw_average(bus, samples)?;
        cal.gain_factor = cal.gain_from(avg, known_mass);
        if cal.gain_factor == 0.0 {
            tracing::warn!(scale = %self.key, "reference mass produced no signal; gain will read as 1");
        }
        self.calibration = Some(cal);
        tracing::debug!(scale = %self.key, gain = cal.gain_factor, "gain factor computed");
        Ok(cal.gain_factor)
    }

    /// Full two-point calibration driven by `provider`.
    pub fn calibrate<M: MuxDriver, A: Amplifier>(
        &mut self,
        bus: &mut BusHandle<M, A>,
        provider: &mut dyn CalibrationProvider,
        samples: usize,
    ) -> Result<Calibration, IrrigationError> {
        self.ensure_connected()?;
        provider.prepare_zero(self.key)?;
        self.compute_zero_offset(bus, samples)?;
        let mass = provider.reference_mass(self.key)?;
        self.compute_gain_factor(bus, mass, samples)?;
        let cal = self
            .calibration
            .ok_or(IrrigationError::CalibrationMissing(self.key))?;
        tracing::info!(
            scale = %self.key,
            zero_offset = cal.zero_offset,
            gain_factor = cal.gain_factor,
            "scale calibrated"
        );
        Ok(cal)
    }

    /// Calibrated weight averaged over `samples` readings, rounded to
    /// `decimals` places.
    pub fn read_weight<M: MuxDriver, A: Amplifier>(
        &self,
        bus: &mut BusHandle<M, A>,
        samples: usize,
        decimals: u32,
    ) -> Result<f64, IrrigationError> {
        // Amplifiers share one address; always convert with this cell's own
        // calibration, never whatever the last channel used.
        let cal = self
            .calibration
            .ok_or(IrrigationError::CalibrationMissing(self.key))?;
        let avg = self.raw_average(bus, samples)?;
        let weight = (avg - f64::from(cal.zero_offset)) / cal.effective_gain();
        Ok(round_to(weight, decimals))
    }

    fn ensure_connected(&self) -> Result<(), BusError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(BusError::NotConnected(self.key))
        }
    }
}
