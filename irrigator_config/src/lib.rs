#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Experiment configuration for the irrigation rig.
//!
//! - `Config` and its sections deserialize from TOML (or JSON for `.json`
//!   files) and are checked by `Config::validate` before any hardware is
//!   touched.
//! - `ids` holds the bus addressing types shared with the core.
//! - `selection` parses the `all | mux-channel,...` CLI syntax.
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;

pub mod ids;
pub mod selection;

pub use ids::{ChannelId, MuxAddress, ScaleKey};
pub use selection::{ScaleSelection, ValveSelection};

/// Flow rate of the original rig's solenoids, in volume units per second.
pub const DEFAULT_FLOW_RATE: f64 = 2.103;

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Experiment {
    /// Directory holding the calibration file and both logs; created on demand.
    pub output_dir: PathBuf,
    pub calibration_file: String,
    pub weight_log: String,
    pub water_log: String,
    /// Which water log entries count as "the last watering" for a valve.
    pub watering_key: WateringKey,
}

impl Default for Experiment {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            calibration_file: "cal_file.json".into(),
            weight_log: "weight_data.json".into(),
            water_log: "water_log.csv".into(),
            watering_key: WateringKey::Valve,
        }
    }
}

impl Experiment {
    pub fn calibration_path(&self) -> PathBuf {
        self.output_dir.join(&self.calibration_file)
    }
    pub fn weight_log_path(&self) -> PathBuf {
        self.output_dir.join(&self.weight_log)
    }
    pub fn water_log_path(&self) -> PathBuf {
        self.output_dir.join(&self.water_log)
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WateringKey {
    /// Only the valve's own records reset its weight-loss window.
    #[default]
    Valve,
    /// Any valve dosing from the same scale group resets the window.
    Group,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MassUnit {
    G,
    #[default]
    Kg,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VolumeUnit {
    Ml,
    #[default]
    L,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Units {
    pub mass: MassUnit,
    pub volume: VolumeUnit,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Hardware {
    /// Linux I2C bus number (`/dev/i2c-N`).
    pub i2c_bus: u8,
    /// Max time to wait for an amplifier conversion before failing the read.
    pub sensor_read_timeout_ms: u64,
    /// BCM pin of the supply valve feeding every branch valve.
    pub master_valve_gpio: u8,
}

impl Default for Hardware {
    fn default() -> Self {
        Self {
            i2c_bus: 1,
            sensor_read_timeout_ms: 150,
            master_valve_gpio: 24,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Sampling {
    /// Raw readings averaged into one weight sample.
    pub read_samples: usize,
    /// Raw readings averaged for zero offset and gain factor.
    pub calibration_samples: usize,
    /// Decimal places kept on averaged weights.
    pub weight_decimals: u32,
}

impl Default for Sampling {
    fn default() -> Self {
        Self {
            read_samples: 5,
            calibration_samples: 8,
            weight_decimals: 3,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Actuation {
    /// Upper bound on concurrently open branch valves.
    pub max_workers: usize,
    /// Extra time past the longest dose before the barrier gives up on
    /// stuck workers and closes the supply valve.
    pub watchdog_margin_ms: u64,
    /// Longest a single branch valve may stay open; larger doses are refused.
    pub max_open_ms: u64,
}

impl Default for Actuation {
    fn default() -> Self {
        Self {
            max_workers: 8,
            watchdog_margin_ms: 30_000,
            max_open_ms: 1_800_000,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Logging {
    pub file: Option<String>,  // path to .log (JSON lines)
    pub level: Option<String>, // "info","debug"
    /// Log rotation policy: "never" | "daily" | "hourly" (default: never)
    pub rotation: Option<String>,
}

/// Identifiers for the external spreadsheet sync; parsed so the same file
/// serves both tools, never used here.
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct Remote {
    pub spreadsheet_id: Option<String>,
    pub drive_folder: Option<String>,
    pub credentials: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ValveCfg {
    /// BCM pin driving this branch solenoid.
    pub gpio: u8,
    /// Mux address as hex text, e.g. "0x70".
    pub mux: String,
    /// Channels on that mux whose pots this valve waters.
    pub channels: Vec<u8>,
    /// Volume per second delivered while open.
    #[serde(default = "default_flow_rate")]
    pub flow_rate: f64,
    /// Volume unit `flow_rate` is expressed in; must match `units.volume`.
    #[serde(default)]
    pub flow_volume_unit: Option<VolumeUnit>,
    /// Volume delivered per unit of mass lost.
    #[serde(default = "default_dose_coefficient")]
    pub dose_coefficient: f64,
    /// Valve whose scales determine this valve's weight loss; defaults to
    /// the valve itself.
    #[serde(default)]
    pub group: Option<String>,
}

fn default_flow_rate() -> f64 {
    DEFAULT_FLOW_RATE
}

fn default_dose_coefficient() -> f64 {
    1.0
}

impl ValveCfg {
    pub fn mux_address(&self) -> eyre::Result<MuxAddress> {
        self.mux.parse()
    }

    /// Every `(mux, channel)` pair this valve is wired to.
    pub fn scale_keys(&self) -> eyre::Result<Vec<ScaleKey>> {
        let mux = self.mux_address()?;
        self.channels
            .iter()
            .map(|&ch| {
                ChannelId::new(ch)
                    .map(|channel| ScaleKey::new(mux, channel))
                    .ok_or_else(|| eyre::eyre!("channel {ch} out of range 0..=7"))
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub experiment: Experiment,
    #[serde(default)]
    pub units: Units,
    #[serde(default)]
    pub hardware: Hardware,
    #[serde(default)]
    pub sampling: Sampling,
    #[serde(default)]
    pub actuation: Actuation,
    #[serde(default)]
    pub logging: Logging,
    #[serde(default)]
    pub remote: Remote,
    /// Branch valves by name.
    pub valves: BTreeMap<String, ValveCfg>,
}

pub fn load_toml(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(s)
}

pub fn load_json(s: &str) -> Result<Config, serde_json::Error> {
    serde_json::from_str::<Config>(s)
}

/// Read, parse and validate a config file. `.json` files are parsed as JSON,
/// everything else as TOML.
pub fn load_path(path: &Path) -> eyre::Result<Config> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| eyre::eyre!("read config {}: {e}", path.display()))?;
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let cfg = if is_json {
        load_json(&text).map_err(|e| eyre::eyre!("invalid configuration {}: {e}", path.display()))?
    } else {
        load_toml(&text).map_err(|e| eyre::eyre!("invalid configuration {}: {e}", path.display()))?
    };
    cfg.validate()?;
    Ok(cfg)
}

impl Config {
    /// Name of the valve whose scales define `valve`'s weight loss.
    pub fn group_of<'a>(&'a self, valve: &'a str) -> &'a str {
        self.valves
            .get(valve)
            .and_then(|v| v.group.as_deref())
            .unwrap_or(valve)
    }

    /// Every configured scale, deduplicated and ordered.
    pub fn all_scale_keys(&self) -> eyre::Result<BTreeSet<ScaleKey>> {
        let mut keys = BTreeSet::new();
        for (name, v) in &self.valves {
            let vk = v
                .scale_keys()
                .map_err(|e| eyre::eyre!("valves.{name}: {e}"))?;
            keys.extend(vk);
        }
        Ok(keys)
    }

    /// Every distinct mux address in use.
    pub fn mux_addresses(&self) -> eyre::Result<BTreeSet<MuxAddress>> {
        Ok(self.all_scale_keys()?.into_iter().map(|k| k.mux).collect())
    }

    pub fn validate(&self) -> eyre::Result<()> {
        // Experiment
        if self.experiment.calibration_file.trim().is_empty() {
            eyre::bail!("experiment.calibration_file must not be empty");
        }
        if self.experiment.weight_log.trim().is_empty() {
            eyre::bail!("experiment.weight_log must not be empty");
        }
        if self.experiment.water_log.trim().is_empty() {
            eyre::bail!("experiment.water_log must not be empty");
        }

        // Sampling
        if self.sampling.read_samples == 0 {
            eyre::bail!("sampling.read_samples must be >= 1");
        }
        if self.sampling.calibration_samples == 0 {
            eyre::bail!("sampling.calibration_samples must be >= 1");
        }
        if self.sampling.weight_decimals > 6 {
            eyre::bail!("sampling.weight_decimals must be in [0, 6]");
        }

        // Hardware
        if self.hardware.sensor_read_timeout_ms == 0 {
            eyre::bail!("hardware.sensor_read_timeout_ms must be >= 1");
        }

        // Actuation
        if self.actuation.max_workers == 0 {
            eyre::bail!("actuation.max_workers must be >= 1");
        }
        if self.actuation.watchdog_margin_ms == 0 {
            eyre::bail!("actuation.watchdog_margin_ms must be >= 1");
        }
        if self.actuation.max_open_ms == 0 {
            eyre::bail!("actuation.max_open_ms must be >= 1");
        }

        // Logging
        if let Some(rot) = self.logging.rotation.as_deref()
            && !matches!(rot, "never" | "daily" | "hourly")
        {
            eyre::bail!("logging.rotation must be one of never|daily|hourly, got {rot:?}");
        }

        // Valves
        if self.valves.is_empty() {
            eyre::bail!("at least one [valves.<name>] section is required");
        }
        let mut gpios: BTreeMap<u8, &str> = BTreeMap::new();
        gpios.insert(self.hardware.master_valve_gpio, "hardware.master_valve_gpio");
        for (name, v) in &self.valves {
            if let Some(other) = gpios.insert(v.gpio, name) {
                eyre::bail!("valves.{name}.gpio {} is already used by {other}", v.gpio);
            }
            v.mux_address()
                .map_err(|e| eyre::eyre!("valves.{name}.mux: {e}"))?;
            if v.channels.is_empty() {
                eyre::bail!("valves.{name}.channels must list at least one channel");
            }
            let keys = v
                .scale_keys()
                .map_err(|e| eyre::eyre!("valves.{name}.channels: {e}"))?;
            let unique: BTreeSet<_> = keys.iter().collect();
            if unique.len() != keys.len() {
                eyre::bail!("valves.{name}.channels contains duplicates");
            }
            if !(v.flow_rate.is_finite() && v.flow_rate > 0.0) {
                eyre::bail!("valves.{name}.flow_rate must be > 0, got {}", v.flow_rate);
            }
            if !(v.dose_coefficient.is_finite() && v.dose_coefficient >= 0.0) {
                eyre::bail!(
                    "valves.{name}.dose_coefficient must be >= 0, got {}",
                    v.dose_coefficient
                );
            }
            if let Some(unit) = v.flow_volume_unit
                && unit != self.units.volume
            {
                eyre::bail!(
                    "valves.{name}.flow_volume_unit {unit:?} does not match units.volume {:?}",
                    self.units.volume
                );
            }
            if let Some(group) = v.group.as_deref()
                && !self.valves.contains_key(group)
            {
                eyre::bail!("valves.{name}.group refers to unknown valve {group:?}");
            }
            if let Some(group) = v.group.as_deref()
                && let Some(next) = self.valves.get(group).and_then(|g| g.group.as_deref())
                && next != group
            {
                eyre::bail!(
                    "valves.{name}.group {group:?} is itself grouped under {next:?}; point at {next:?} directly"
                );
            }
        }

        Ok(())
    }
}
