//! Command execution: assemble the controller, run it, report the outcome.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use eyre::WrapErr;
use irrigator_config::{Config, MassUnit, ScaleSelection, ValveSelection, VolumeUnit};
use irrigator_core::mocks::AbsentOperator;
use irrigator_core::{
    Actuator, BusError, BusHandle, CalibrationProvider, CalibrationStore, ControllerSettings,
    CsvWaterLog, CycleReport, FixedMassProvider, IrrigationController, IrrigationError, Mode,
    ScaleRegistry, StoreError, WaterLog, WeightLog,
};
use irrigator_traits::{Amplifier, MonotonicClock, MuxDriver};
use serde_json::json;

use crate::backend::{self, Rig};
use crate::cli::{Cli, Commands, MassArgs};

/// Resolved inputs shared by every command.
struct Ctx<'a> {
    cfg: &'a Config,
    settings: ControllerSettings,
    /// `--calibration` was given, so the file must load.
    explicit_calibration: bool,
    json: bool,
}

pub fn execute(cli: &Cli, cfg: &Config) -> eyre::Result<()> {
    let out = &cfg.experiment.output_dir;
    std::fs::create_dir_all(out).map_err(|e| StoreError::Io {
        path: out.clone(),
        source: e,
    })?;

    let mut settings = ControllerSettings::from_config(cfg);
    if let Some(path) = &cli.calibration {
        if !path.exists() {
            return Err(StoreError::NotFound(path.clone()).into());
        }
        settings.calibration_path.clone_from(path);
    }
    let ctx = Ctx {
        cfg,
        settings,
        explicit_calibration: cli.calibration.is_some(),
        json: cli.json,
    };

    match &cli.cmd {
        Commands::Calibrate { scales, mass } => {
            let report = run_mode(&ctx, scales, &ValveSelection::All, *mass, &[Mode::CalibrateOnly])?;
            emit(&ctx, &report);
        }
        Commands::Read {
            scales,
            new_calibration,
            mass,
        } => {
            let modes = modes(*new_calibration, Mode::ReadOnly);
            let report = run_mode(&ctx, scales, &ValveSelection::All, *mass, &modes)?;
            emit(&ctx, &report);
        }
        Commands::Cycle {
            scales,
            valves,
            new_calibration,
            mass,
        } => {
            let modes = modes(*new_calibration, Mode::FullCycle);
            let report = run_mode(&ctx, scales, valves, *mass, &modes)?;
            emit(&ctx, &report);
            if report.actuation.as_ref().is_some_and(|a| a.aborted) {
                return Err(IrrigationError::State("watering interrupted".into()).into());
            }
        }
        Commands::SelfCheck => self_check(&ctx)?,
    }
    Ok(())
}

fn modes(new_calibration: bool, mode: Mode) -> Vec<Mode> {
    if new_calibration {
        vec![Mode::CalibrateOnly, mode]
    } else {
        vec![mode]
    }
}

fn provider(ctx: &Ctx<'_>, mass: MassArgs) -> Result<Box<dyn CalibrationProvider>, IrrigationError> {
    match mass.mass {
        Some(m) => Ok(Box::new(FixedMassProvider::new(m)?)),
        None => Ok(Box::new(crate::provider::ConsoleProvider::stdio(ctx.cfg.units.mass))),
    }
}

/// Registry, bus, calibrations and history wired into a controller.
fn assemble<M: MuxDriver, A: Amplifier>(
    ctx: &Ctx<'_>,
    mux: M,
    amp: A,
    scales: &ScaleSelection,
    valves: &ValveSelection,
    provider: Box<dyn CalibrationProvider>,
) -> eyre::Result<IrrigationController<M, A>> {
    let cfg = ctx.cfg;
    let registry = ScaleRegistry::from_config(cfg, scales, valves)?;
    let cal_path = &ctx.settings.calibration_path;
    let table = if ctx.explicit_calibration {
        CalibrationStore::load(cal_path)?
    } else {
        CalibrationStore::load_or_default(cal_path)?
    };

    let timeout = Duration::from_millis(cfg.hardware.sensor_read_timeout_ms);
    let bus = BusHandle::open(mux, amp, registry.mux_addresses(), timeout);
    for addr in bus.failed_muxes() {
        tracing::warn!(mux = %addr, "mux did not answer; its scales will be skipped");
    }

    let weight_log = WeightLog::load_or_default(&ctx.settings.weight_log_path)
        .wrap_err("load weight log")?;
    let water_log = WaterLog::load_or_default(&cfg.experiment.water_log_path())
        .wrap_err("load water log")?;

    let mut ctrl = IrrigationController::new(bus, registry, ctx.settings.clone(), provider)
        .with_weight_log(weight_log)
        .with_water_log(water_log);
    for key in ctrl.attach_calibration(&table) {
        tracing::info!(scale = %key, "no stored calibration");
    }
    Ok(ctrl)
}

fn run_mode(
    ctx: &Ctx<'_>,
    scales: &ScaleSelection,
    valves: &ValveSelection,
    mass: MassArgs,
    modes: &[Mode],
) -> eyre::Result<CycleReport> {
    let provider = provider(ctx, mass)?;
    let Rig {
        mux,
        amp,
        master,
        branches,
    } = backend::open(ctx.cfg, valves)?;
    let mut ctrl = assemble(ctx, mux, amp, scales, valves, provider)?;

    if modes.contains(&Mode::FullCycle) {
        let cfg = ctx.cfg;
        let mut actuator = Actuator::new(master, Arc::new(MonotonicClock::new()))
            .with_max_workers(cfg.actuation.max_workers)
            .with_watchdog_margin(Duration::from_millis(cfg.actuation.watchdog_margin_ms))
            .with_max_open(Duration::from_millis(cfg.actuation.max_open_ms));
        for (id, valve) in branches {
            actuator = actuator.with_branch(id, valve);
        }
        let abort = actuator.abort_handle();
        if let Err(e) = ctrlc::set_handler(move || {
            abort.store(true, Ordering::Relaxed);
        }) {
            tracing::warn!(error = %e, "failed to install Ctrl-C handler; continuing");
        }
        ctrl = ctrl
            .with_actuator(actuator)
            .with_sink(Box::new(CsvWaterLog::new(cfg.experiment.water_log_path())));
    }

    let mut merged: Option<CycleReport> = None;
    for &mode in modes {
        let report = ctrl.run(mode)?;
        merged = Some(match merged {
            None => report,
            Some(mut first) => {
                first.mode = report.mode;
                first.samples = report.samples;
                first.calibrated.extend(report.calibrated);
                first.failures.extend(report.failures);
                first.doses = report.doses;
                first.actuation = report.actuation;
                first.records = report.records;
                first.persist_errors.extend(report.persist_errors);
                first
            }
        });
    }
    merged.ok_or_else(|| IrrigationError::State("no mode to run".into()).into())
}

fn self_check(ctx: &Ctx<'_>) -> eyre::Result<()> {
    let Rig { mux, amp, .. } = backend::open(ctx.cfg, &ValveSelection::All)?;
    let mut ctrl = assemble(
        ctx,
        mux,
        amp,
        &ScaleSelection::All,
        &ValveSelection::All,
        Box::new(AbsentOperator),
    )?;
    ctrl.connect();

    let mut first_problem: Option<BusError> = None;
    let mut rows = Vec::new();
    for cell in ctrl.registry().cells() {
        let key = cell.key();
        let status = if ctrl.bus().is_failed(key.mux) {
            first_problem.get_or_insert(BusError::Mux {
                addr: key.mux,
                reason: "no acknowledge".into(),
            });
            "mux unreachable"
        } else if !cell.is_connected() {
            first_problem.get_or_insert(BusError::NotConnected(key));
            "absent"
        } else if cell.calibration().is_none() {
            "ok (uncalibrated)"
        } else {
            "ok"
        };
        rows.push((key, status));
    }

    if ctx.json {
        let scales: Vec<_> = rows
            .iter()
            .map(|(k, s)| json!({ "scale": k.to_string(), "status": s }))
            .collect();
        println!("{}", json!({ "self_check": scales }));
    } else {
        for (key, status) in &rows {
            println!("{key}  {status}");
        }
    }

    match first_problem {
        Some(e) => Err(IrrigationError::from(e).into()),
        None => {
            if !ctx.json {
                println!("self-check ok");
            }
            Ok(())
        }
    }
}

fn mass_label(u: MassUnit) -> &'static str {
    match u {
        MassUnit::G => "g",
        MassUnit::Kg => "kg",
    }
}

fn volume_label(u: VolumeUnit) -> &'static str {
    match u {
        VolumeUnit::Ml => "ml",
        VolumeUnit::L => "l",
    }
}

fn emit(ctx: &Ctx<'_>, report: &CycleReport) {
    if ctx.json {
        println!("{}", report_json(report));
    } else {
        print_report(ctx, report);
    }
}

fn report_json(report: &CycleReport) -> serde_json::Value {
    let act = report.actuation.as_ref();
    json!({
        "mode": format!("{:?}", report.mode),
        "started_at": report.started_at.to_string(),
        "calibrated": report.calibrated.iter().map(|(k, c)| json!({
            "scale": k.to_string(),
            "zero_offset": c.zero_offset,
            "gain_factor": c.gain_factor,
        })).collect::<Vec<_>>(),
        "samples": report.samples.iter().map(|s| json!({
            "scale": s.key.to_string(),
            "weight": s.weight,
            "timestamp": s.timestamp.to_string(),
        })).collect::<Vec<_>>(),
        "failures": report.failures.iter().map(|f| json!({
            "scale": f.key.to_string(),
            "error": f.error.to_string(),
        })).collect::<Vec<_>>(),
        "doses": report.doses.iter().map(|d| json!({
            "valve": d.valve,
            "target_amount": d.target_amount,
            "open_seconds": d.open_duration.as_secs_f64(),
        })).collect::<Vec<_>>(),
        "watered": report.records.iter().map(|r| json!({
            "valve": r.valve,
            "target_amount": r.target_amount,
        })).collect::<Vec<_>>(),
        "valve_errors": act.map(|a| a.failed().map(|o| json!({
            "valve": o.valve,
            "error": o.error.as_ref().map(ToString::to_string),
        })).collect::<Vec<_>>()),
        "unfinished": act.map(|a| a.unfinished.clone()),
        "aborted": act.is_some_and(|a| a.aborted),
        "persist_errors": report.persist_errors,
    })
}

fn print_report(ctx: &Ctx<'_>, report: &CycleReport) {
    let mass = mass_label(ctx.cfg.units.mass);
    let volume = volume_label(ctx.cfg.units.volume);
    for (key, cal) in &report.calibrated {
        println!(
            "{key}  calibrated  zero_offset={} gain_factor={:.3}",
            cal.zero_offset, cal.gain_factor
        );
    }
    for s in &report.samples {
        println!("{}  {:.*} {mass}", s.key, ctx.settings.weight_decimals as usize, s.weight);
    }
    for f in &report.failures {
        println!("{}  skipped: {}", f.key, f.error);
    }
    for d in &report.doses {
        println!(
            "{}  dose {:.3} {volume} over {:.2} min",
            d.valve,
            d.target_amount,
            d.open_duration.as_secs_f64() / 60.0
        );
    }
    if let Some(act) = &report.actuation {
        for o in act.failed() {
            if let Some(e) = &o.error {
                println!("{}  not watered: {e}", o.valve);
            }
        }
        for v in &act.unfinished {
            println!("{v}  did not report back before the watchdog");
        }
        println!("{} water record(s) logged", report.records.len());
    }
    for e in &report.persist_errors {
        eprintln!("warning: {e}");
    }
    match report.mode {
        Mode::CalibrateOnly => println!("calibration complete"),
        Mode::ReadOnly => println!("read complete"),
        Mode::FullCycle => println!("cycle complete"),
    }
}
