//! CLI argument definitions and shared statics.

use clap::{ArgAction, Args, Parser, Subcommand};
use irrigator_config::{ScaleSelection, ValveSelection};
use std::path::PathBuf;
use std::sync::OnceLock;

pub static FILE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();
/// Whether the user asked for JSON output (controls structured error output).
pub static JSON_MODE: OnceLock<bool> = OnceLock::new();

#[derive(Parser, Debug)]
#[command(name = "irrigator", version, about = "Weight-driven plant irrigation")]
pub struct Cli {
    /// Path to the experiment config (TOML, or JSON for .json files)
    #[arg(long, value_name = "FILE", default_value = "etc/irrigator.toml")]
    pub config: PathBuf,

    /// Calibration file; overrides experiment.calibration_file and must exist
    #[arg(long, value_name = "FILE")]
    pub calibration: Option<PathBuf>,

    /// Log and report as JSON lines instead of pretty text
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,

    /// Log level (error|warn|info|debug|trace); defaults to logging.level, then info
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Command to execute
    #[command(subcommand)]
    pub cmd: Commands,
}

/// How calibration masses are obtained.
#[derive(Args, Debug, Clone, Copy, Default)]
pub struct MassArgs {
    /// Known reference mass; skips the interactive prompts
    #[arg(long, value_name = "MASS")]
    pub mass: Option<f64>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Calibrate scales and write the calibration file
    Calibrate {
        /// Scales to calibrate: `all` or e.g. 0x70-0,0x70-1
        #[arg(long, value_name = "LIST", default_value = "all")]
        scales: ScaleSelection,
        #[command(flatten)]
        mass: MassArgs,
    },
    /// Read and log every selected scale without watering
    Read {
        /// Scales to read: `all` or e.g. 0x70-0,0x70-1
        #[arg(long, value_name = "LIST", default_value = "all")]
        scales: ScaleSelection,
        /// Recalibrate the selected scales before reading
        #[arg(long, action = ArgAction::SetTrue)]
        new_calibration: bool,
        #[command(flatten)]
        mass: MassArgs,
    },
    /// Weigh, compute doses and water
    Cycle {
        /// Scales to read: `all` or e.g. 0x70-0,0x70-1
        #[arg(long, value_name = "LIST", default_value = "all")]
        scales: ScaleSelection,
        /// Valves allowed to open: `all` or e.g. v1,v2
        #[arg(long, value_name = "LIST", default_value = "all")]
        valves: ValveSelection,
        /// Recalibrate the selected scales before reading
        #[arg(long, action = ArgAction::SetTrue)]
        new_calibration: bool,
        #[command(flatten)]
        mass: MassArgs,
    },
    /// Probe the mux and every configured scale
    SelfCheck,
}
