#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation
)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Core irrigation logic (hardware-agnostic).
//!
//! All hardware goes through the `irrigator_traits` seams: `MuxDriver` and
//! `Amplifier` for the scales, `Valve` for the solenoids, `Clock` for time.
//!
//! ## Architecture
//!
//! - **Bus**: exclusive mux channel selection around every amplifier access (`bus`)
//! - **Scales**: per-channel calibration and averaged reads (`load_cell`, `calibration`)
//! - **Persistence**: calibration table, weight log, water log
//! - **Dosing**: weight loss since last watering scaled into a timed dose (`dose`)
//! - **Actuation**: master valve plus a bounded worker pool and completion barrier
//! - **Control**: the cycle state machine with recalibration fallback (`controller`)

pub mod actuation;
pub mod atomic;
pub mod bus;
pub mod calibration;
pub mod calibration_store;
pub mod controller;
pub mod dose;
pub mod error;
pub mod hw_error;
pub mod load_cell;
pub mod mocks;
pub mod registry;
pub mod water_log;
pub mod weight_log;

pub use actuation::{ActuationReport, Actuator, MASTER_VALVE, ValveOutcome};
pub use bus::{BusHandle, MuxChannel};
pub use calibration::{Calibration, CalibrationProvider, FixedMassProvider};
pub use calibration_store::{CalibrationStore, CalibrationTable};
pub use controller::{
    ControllerSettings, ControllerState, CycleReport, IrrigationController, Mode, ScaleFailure,
};
pub use dose::{WaterDose, compute_dose, open_duration, weight_loss};
pub use error::{BusError, IrrigationError, Result, StoreError};
pub use load_cell::LoadCell;
pub use registry::{ScaleRegistry, ValveSpec};
pub use water_log::{CsvWaterLog, WaterLog, WaterLogSink, WaterRecord};
pub use weight_log::{WeightLog, WeightSample};
