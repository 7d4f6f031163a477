//! One irrigation cycle: measure, compute doses, actuate, log.
//!
//! ```text
//! Idle -> MeasuringBaseline -> ComputingDoses -> Actuating -> Logging -> Idle
//! ```
//!
//! Read-only and calibrate-only runs stop after `MeasuringBaseline`. A
//! failing scale or mux is recorded and skipped; it never aborts the cycle.

use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::NaiveDateTime;
use irrigator_config::{Config, ScaleKey, WateringKey};
use irrigator_traits::{Amplifier, MuxDriver};

use crate::actuation::{ActuationReport, Actuator};
use crate::bus::BusHandle;
use crate::calibration::{Calibration, CalibrationProvider};
use crate::calibration_store::{CalibrationStore, CalibrationTable};
use crate::dose::{WaterDose, compute_dose, mean_loss, weight_loss};
use crate::error::{BusError, IrrigationError, Result};
use crate::registry::ScaleRegistry;
use crate::water_log::{WaterLog, WaterLogSink, WaterRecord};
use crate::weight_log::{WeightLog, WeightSample};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    MeasuringBaseline,
    ComputingDoses,
    Actuating,
    Logging,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Calibrate every selected scale and persist the result.
    CalibrateOnly,
    /// Read every selected scale and append to the weight log.
    ReadOnly,
    /// Read, compute doses, water and log.
    FullCycle,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerSettings {
    pub read_samples: usize,
    pub calibration_samples: usize,
    pub weight_decimals: u32,
    pub watering_key: WateringKey,
    pub calibration_path: PathBuf,
    pub weight_log_path: PathBuf,
}

impl ControllerSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            read_samples: cfg.sampling.read_samples,
            calibration_samples: cfg.sampling.calibration_samples,
            weight_decimals: cfg.sampling.weight_decimals,
            watering_key: cfg.experiment.watering_key,
            calibration_path: cfg.experiment.calibration_path(),
            weight_log_path: cfg.experiment.weight_log_path(),
        }
    }
}

/// A scale that produced no reading this cycle, and why.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleFailure {
    pub key: ScaleKey,
    pub error: IrrigationError,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub mode: Mode,
    pub started_at: NaiveDateTime,
    pub samples: Vec<WeightSample>,
    pub calibrated: Vec<(ScaleKey, Calibration)>,
    pub failures: Vec<ScaleFailure>,
    pub doses: Vec<WaterDose>,
    pub actuation: Option<ActuationReport>,
    pub records: Vec<WaterRecord>,
    /// Files or sinks that could not be written; the cycle itself went on.
    pub persist_errors: Vec<String>,
}

impl CycleReport {
    fn new(mode: Mode, started_at: NaiveDateTime) -> Self {
        Self {
            mode,
            started_at,
            samples: Vec::new(),
            calibrated: Vec::new(),
            failures: Vec::new(),
            doses: Vec::new(),
            actuation: None,
            records: Vec::new(),
            persist_errors: Vec::new(),
        }
    }
}

type TimestampSource = Box<dyn FnMut() -> NaiveDateTime>;

pub struct IrrigationController<M, A> {
    bus: BusHandle<M, A>,
    registry: ScaleRegistry,
    settings: ControllerSettings,
    provider: Box<dyn CalibrationProvider>,
    actuator: Option<Actuator>,
    weight_log: WeightLog,
    water_log: WaterLog,
    sinks: Vec<Box<dyn WaterLogSink>>,
    timestamps: TimestampSource,
    state: ControllerState,
}

impl<M: MuxDriver, A: Amplifier> IrrigationController<M, A> {
    pub fn new(
        bus: BusHandle<M, A>,
        registry: ScaleRegistry,
        settings: ControllerSettings,
        provider: Box<dyn CalibrationProvider>,
    ) -> Self {
        Self {
            bus,
            registry,
            settings,
            provider,
            actuator: None,
            weight_log: WeightLog::new(),
            water_log: WaterLog::new(),
            sinks: Vec::new(),
            timestamps: Box::new(|| chrono::Local::now().naive_local()),
            state: ControllerState::Idle,
        }
    }

    pub fn with_actuator(mut self, actuator: Actuator) -> Self {
        self.actuator = Some(actuator);
        self
    }

    pub fn with_sink(mut self, sink: Box<dyn WaterLogSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// History used for weight-loss windows.
    pub fn with_weight_log(mut self, log: WeightLog) -> Self {
        self.weight_log = log;
        self
    }

    /// Past waterings used to find each valve's last watering.
    pub fn with_water_log(mut self, log: WaterLog) -> Self {
        self.water_log = log;
        self
    }

    pub fn with_timestamp_source(mut self, f: impl FnMut() -> NaiveDateTime + 'static) -> Self {
        self.timestamps = Box::new(f);
        self
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn registry(&self) -> &ScaleRegistry {
        &self.registry
    }

    pub fn weight_log(&self) -> &WeightLog {
        &self.weight_log
    }

    pub fn water_log(&self) -> &WaterLog {
        &self.water_log
    }

    pub fn bus(&self) -> &BusHandle<M, A> {
        &self.bus
    }

    /// Apply stored calibrations; returns the selected scales without one.
    pub fn attach_calibration(&mut self, table: &CalibrationTable) -> Vec<ScaleKey> {
        self.registry.attach_calibration(table)
    }

    /// Initialise every amplifier not probed yet. Returns connected scales.
    pub fn connect(&mut self) -> Vec<ScaleKey> {
        let Self { bus, registry, .. } = self;
        for key in registry.keys() {
            if bus.is_failed(key.mux) {
                continue;
            }
            if let Some(cell) = registry.cell_mut(key) {
                if !cell.is_probed() {
                    cell.connect(bus);
                }
            }
        }
        registry
            .cells()
            .filter(|c| c.is_connected())
            .map(|c| c.key())
            .collect()
    }

    /// Run one cycle in `mode`. Scale-level problems land in the report;
    /// `Err` means the cycle could not run at all.
    pub fn run(&mut self, mode: Mode) -> Result<CycleReport> {
        if self.state != ControllerState::Idle {
            return Err(IrrigationError::State(format!("cycle already running ({:?})", self.state)).into());
        }
        if mode == Mode::FullCycle && self.actuator.is_none() {
            return Err(IrrigationError::State("a full cycle needs valves attached".into()).into());
        }
        let started_at = (self.timestamps)();
        let mut report = CycleReport::new(mode, started_at);
        tracing::info!(?mode, start = %started_at, scales = self.registry.keys().len(), "cycle start");

        self.connect();
        let res = match mode {
            Mode::CalibrateOnly => {
                self.calibrate_all(&mut report);
                Ok(())
            }
            Mode::ReadOnly => {
                self.measure(&mut report);
                Ok(())
            }
            Mode::FullCycle => self.full_cycle(&mut report),
        };
        self.transition(ControllerState::Idle);
        res?;
        tracing::info!(
            samples = report.samples.len(),
            failures = report.failures.len(),
            "cycle done"
        );
        Ok(report)
    }

    fn transition(&mut self, to: ControllerState) {
        if self.state != to {
            tracing::debug!(from = ?self.state, ?to, "controller state");
            self.state = to;
        }
    }

    fn unavailable(&self, key: ScaleKey) -> Option<IrrigationError> {
        if self.bus.is_failed(key.mux) {
            return Some(BusError::Mux {
                addr: key.mux,
                reason: "mux unreachable".into(),
            }
            .into());
        }
        match self.registry.cell(key) {
            Some(c) if c.is_connected() => None,
            _ => Some(BusError::NotConnected(key).into()),
        }
    }

    fn calibrate_all(&mut self, report: &mut CycleReport) {
        self.transition(ControllerState::MeasuringBaseline);
        let mut fresh = CalibrationTable::new();
        for key in self.registry.keys() {
            if let Some(error) = self.unavailable(key) {
                report.failures.push(ScaleFailure { key, error });
                continue;
            }
            let Self {
                bus,
                registry,
                provider,
                settings,
                ..
            } = self;
            let Some(cell) = registry.cell_mut(key) else {
                continue;
            };
            match cell.calibrate(bus, provider.as_mut(), settings.calibration_samples) {
                Ok(cal) => {
                    fresh.insert(key, cal);
                    report.calibrated.push((key, cal));
                }
                Err(error) => {
                    tracing::warn!(scale = %key, %error, "calibration failed, skipping scale");
                    report.failures.push(ScaleFailure { key, error });
                }
            }
        }
        if fresh.is_empty() {
            return;
        }
        if let Err(e) = CalibrationStore::save_all(&self.settings.calibration_path, &fresh) {
            for (key, cal) in &fresh {
                tracing::warn!(
                    scale = %key,
                    zero_offset = cal.zero_offset,
                    gain_factor = cal.gain_factor,
                    "calibration not persisted"
                );
            }
            tracing::error!(error = %e, "could not write calibration file");
            report.persist_errors.push(e.to_string());
        }
    }

    fn measure(&mut self, report: &mut CycleReport) {
        self.transition(ControllerState::MeasuringBaseline);
        for key in self.registry.keys() {
            if let Some(error) = self.unavailable(key) {
                tracing::warn!(scale = %key, %error, "scale unavailable, skipping");
                report.failures.push(ScaleFailure { key, error });
                continue;
            }
            match self.read_with_fallback(key, report) {
                Ok(weight) => {
                    let sample = WeightSample {
                        key,
                        weight,
                        timestamp: (self.timestamps)(),
                    };
                    tracing::info!(scale = %key, weight, "scale read");
                    self.weight_log.record(report.started_at, sample);
                    report.samples.push(sample);
                }
                Err(error) => {
                    tracing::warn!(scale = %key, %error, "read failed, skipping scale");
                    report.failures.push(ScaleFailure { key, error });
                }
            }
        }
        if report.samples.is_empty() {
            return;
        }
        if let Err(e) = self.weight_log.merge_into_file(&self.settings.weight_log_path) {
            tracing::error!(error = %e, "could not write weight log");
            report.persist_errors.push(e.to_string());
        }
    }

    /// Read `key`; if it has no calibration, calibrate once and retry once.
    fn read_with_fallback(
        &mut self,
        key: ScaleKey,
        report: &mut CycleReport,
    ) -> std::result::Result<f64, IrrigationError> {
        let Self {
            bus,
            registry,
            provider,
            settings,
            ..
        } = self;
        let cell = registry
            .cell_mut(key)
            .ok_or_else(|| IrrigationError::State(format!("scale {key} not registered")))?;
        match cell.read_weight(bus, settings.read_samples, settings.weight_decimals) {
            Err(IrrigationError::CalibrationMissing(_)) => {
                tracing::warn!(scale = %key, "no calibration stored, recalibrating");
                let cal = cell.calibrate(bus, provider.as_mut(), settings.calibration_samples)?;
                report.calibrated.push((key, cal));
                if let Err(e) = CalibrationStore::save(&settings.calibration_path, key, cal) {
                    tracing::warn!(
                        scale = %key,
                        zero_offset = cal.zero_offset,
                        gain_factor = cal.gain_factor,
                        error = %e,
                        "calibration not persisted"
                    );
                    report.persist_errors.push(e.to_string());
                }
                cell.read_weight(bus, settings.read_samples, settings.weight_decimals)
            }
            other => other,
        }
    }

    /// Doses for every selected valve from scales read this cycle.
    pub fn compute_doses(&self, start_time: NaiveDateTime, fresh: &BTreeSet<ScaleKey>) -> Vec<WaterDose> {
        let mut doses = Vec::new();
        for valve in self.registry.valves() {
            let members = match self.settings.watering_key {
                WateringKey::Valve => vec![valve.id.as_str()],
                WateringKey::Group => self.registry.group_members(&valve.id),
            };
            let since = self.water_log.last_watering(&members);
            let losses: Vec<f64> = self
                .registry
                .dose_scales(&valve.id)
                .iter()
                .filter(|k| fresh.contains(*k))
                .filter_map(|k| weight_loss(&self.weight_log.series(*k), since))
                .collect();
            if losses.is_empty() {
                tracing::warn!(valve = %valve.id, "no fresh readings for this valve's scales");
            }
            let loss = mean_loss(&losses);
            let dose = compute_dose(valve, loss, start_time);
            tracing::info!(
                valve = %valve.id,
                loss,
                amount = dose.target_amount,
                seconds = dose.open_duration.as_secs_f64(),
                "dose computed"
            );
            doses.push(dose);
        }
        doses
    }

    fn full_cycle(&mut self, report: &mut CycleReport) -> Result<()> {
        self.measure(report);

        self.transition(ControllerState::ComputingDoses);
        let fresh: BTreeSet<ScaleKey> = report.samples.iter().map(|s| s.key).collect();
        report.doses = self.compute_doses(report.started_at, &fresh);

        self.transition(ControllerState::Actuating);
        let actuator = self
            .actuator
            .as_mut()
            .ok_or_else(|| IrrigationError::State("no valves attached".into()))?;
        let act = actuator.actuate(&report.doses)?;

        self.transition(ControllerState::Logging);
        let delivered: BTreeSet<&str> = act
            .succeeded()
            .map(|o| o.valve.as_str())
            .chain(act.skipped.iter().map(String::as_str))
            .collect();
        report.records = report
            .doses
            .iter()
            .filter(|d| delivered.contains(d.valve.as_str()))
            .map(|d| WaterRecord {
                timestamp: d.start_time,
                valve: d.valve.clone(),
                target_amount: d.target_amount,
            })
            .collect();
        self.water_log.extend(&report.records);
        for sink in &mut self.sinks {
            if let Err(e) = sink.publish(&report.records) {
                tracing::error!(error = %e, "could not publish water records");
                report.persist_errors.push(e.to_string());
            }
        }
        report.actuation = Some(act);
        Ok(())
    }
}
