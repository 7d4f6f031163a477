//! Test doubles for the operator and storage seams.

use std::sync::{Arc, Mutex};

use irrigator_config::ScaleKey;

use crate::calibration::CalibrationProvider;
use crate::error::IrrigationError;
use crate::water_log::{WaterLogSink, WaterRecord};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CalibrationStep {
    Zero(ScaleKey),
    Reference(ScaleKey, f64),
}

/// Shared record of the steps a `ScriptedProvider` was asked to perform.
#[derive(Debug, Clone, Default)]
pub struct StepLog(Arc<Mutex<Vec<CalibrationStep>>>);

impl StepLog {
    pub fn steps(&self) -> Vec<CalibrationStep> {
        self.0.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.steps().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, step: CalibrationStep) {
        if let Ok(mut s) = self.0.lock() {
            s.push(step);
        }
    }
}

type Hook = Box<dyn FnMut(&CalibrationStep)>;

/// Provider that plays the operator: logs every step and runs an optional
/// hook, typically one that moves mass on a simulated scale.
pub struct ScriptedProvider {
    mass: f64,
    hook: Option<Hook>,
    log: StepLog,
}

impl ScriptedProvider {
    pub fn new(mass: f64) -> Self {
        Self {
            mass,
            hook: None,
            log: StepLog::default(),
        }
    }

    pub fn with_hook(mut self, hook: impl FnMut(&CalibrationStep) + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    pub fn log(&self) -> StepLog {
        self.log.clone()
    }

    fn step(&mut self, step: CalibrationStep) {
        if let Some(h) = self.hook.as_mut() {
            h(&step);
        }
        self.log.push(step);
    }
}

impl CalibrationProvider for ScriptedProvider {
    fn prepare_zero(&mut self, key: ScaleKey) -> Result<(), IrrigationError> {
        self.step(CalibrationStep::Zero(key));
        Ok(())
    }

    fn reference_mass(&mut self, key: ScaleKey) -> Result<f64, IrrigationError> {
        self.step(CalibrationStep::Reference(key, self.mass));
        Ok(self.mass)
    }
}

/// Provider whose operator never shows up.
#[derive(Debug, Default, Clone, Copy)]
pub struct AbsentOperator;

impl CalibrationProvider for AbsentOperator {
    fn prepare_zero(&mut self, _key: ScaleKey) -> Result<(), IrrigationError> {
        Err(IrrigationError::Io("operator input closed".into()))
    }

    fn reference_mass(&mut self, _key: ScaleKey) -> Result<f64, IrrigationError> {
        Err(IrrigationError::Io("operator input closed".into()))
    }
}

/// Sink that keeps published records in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<WaterRecord>>>,
    fail: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink whose every publish fails.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn records(&self) -> Vec<WaterRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl WaterLogSink for MemorySink {
    fn publish(&mut self, records: &[WaterRecord]) -> Result<(), IrrigationError> {
        if self.fail {
            return Err(IrrigationError::Io("sink unavailable".into()));
        }
        if let Ok(mut r) = self.records.lock() {
            r.extend_from_slice(records);
        }
        Ok(())
    }
}
