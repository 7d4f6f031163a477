//! Hardware assembly: the Raspberry Pi drivers with the `hardware` feature,
//! the in-process simulation otherwise.

use irrigator_config::{Config, MuxAddress, ScaleKey, ValveSelection};
use irrigator_core::IrrigationError;
use irrigator_traits::Valve;

/// Uniform weight reported by every simulated scale, or per-scale overrides:
/// `2.5` or `1.0,0x70-1=3.2`.
pub const SIM_LOAD_ENV: &str = "IRRIGATOR_SIM_LOAD";
/// Comma-separated mux addresses that never acknowledge.
pub const SIM_SILENT_MUX_ENV: &str = "IRRIGATOR_SIM_SILENT_MUX";
/// Comma-separated scales with no amplifier behind them.
pub const SIM_ABSENT_ENV: &str = "IRRIGATOR_SIM_ABSENT";

pub type BoxedValve = Box<dyn Valve + Send>;

/// Everything the controller needs from the physical side.
pub struct Rig<M, A> {
    pub mux: M,
    pub amp: A,
    pub master: BoxedValve,
    pub branches: Vec<(String, BoxedValve)>,
}

fn selected_valves<'a>(cfg: &'a Config, valves: &'a ValveSelection) -> impl Iterator<Item = (&'a String, u8)> {
    cfg.valves
        .iter()
        .filter(|(name, _)| valves.includes(name))
        .map(|(name, v)| (name, v.gpio))
}

#[cfg(feature = "hardware")]
pub fn open(
    cfg: &Config,
    valves: &ValveSelection,
) -> eyre::Result<Rig<irrigator_hardware::Tca9548a, irrigator_hardware::Nau7802>> {
    use eyre::WrapErr;
    use irrigator_hardware::{Nau7802, SharedI2c, Tca9548a, solenoid};

    let i2c = SharedI2c::open(cfg.hardware.i2c_bus)
        .wrap_err_with(|| format!("open i2c bus {}", cfg.hardware.i2c_bus))?;
    let names: Vec<(&String, u8)> = selected_valves(cfg, valves).collect();
    let mut pins = vec![cfg.hardware.master_valve_gpio];
    pins.extend(names.iter().map(|(_, gpio)| *gpio));
    let mut claimed = solenoid::claim(&pins)
        .wrap_err("claim valve gpio pins")?
        .into_iter();
    let master = claimed
        .next()
        .ok_or_else(|| IrrigationError::State("master valve pin not claimed".into()))?;
    let branches = names
        .iter()
        .zip(claimed)
        .map(|((name, _), s)| ((*name).clone(), Box::new(s) as BoxedValve))
        .collect();
    tracing::info!(bus = cfg.hardware.i2c_bus, valves = pins.len(), "hardware backend ready");
    Ok(Rig {
        mux: Tca9548a::new(i2c.clone()),
        amp: Nau7802::new(i2c),
        master: Box::new(master),
        branches,
    })
}

#[cfg(not(feature = "hardware"))]
pub fn open(
    cfg: &Config,
    valves: &ValveSelection,
) -> eyre::Result<Rig<irrigator_hardware::SimMux, irrigator_hardware::SimAmplifier>> {
    simulated(cfg, valves, &SimEnv::from_env()?)
}

/// Shape of the simulated rig, read from `IRRIGATOR_SIM_*`.
#[cfg_attr(feature = "hardware", allow(dead_code))]
#[derive(Debug, Default)]
pub struct SimEnv {
    pub default_load: f64,
    pub loads: Vec<(ScaleKey, f64)>,
    pub silent: Vec<MuxAddress>,
    pub absent: Vec<ScaleKey>,
}

#[cfg_attr(feature = "hardware", allow(dead_code))]
fn invalid(var: &str, e: impl std::fmt::Display) -> IrrigationError {
    IrrigationError::InvalidConfig(format!("{var}: {e}"))
}

#[cfg_attr(feature = "hardware", allow(dead_code))]
fn list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|p| !p.is_empty())
}

#[cfg_attr(feature = "hardware", allow(dead_code))]
impl SimEnv {
    pub fn from_env() -> Result<Self, IrrigationError> {
        let var = |name: &str| std::env::var(name).unwrap_or_default();
        Self::parse(&var(SIM_LOAD_ENV), &var(SIM_SILENT_MUX_ENV), &var(SIM_ABSENT_ENV))
    }

    pub fn parse(load: &str, silent: &str, absent: &str) -> Result<Self, IrrigationError> {
        let mut env = Self::default();
        for part in list(load) {
            match part.split_once('=') {
                Some((key, value)) => {
                    let key: ScaleKey = key.trim().parse().map_err(|e| invalid(SIM_LOAD_ENV, e))?;
                    let value: f64 = value.trim().parse().map_err(|e| invalid(SIM_LOAD_ENV, e))?;
                    env.loads.push((key, value));
                }
                None => env.default_load = part.parse().map_err(|e| invalid(SIM_LOAD_ENV, e))?,
            }
        }
        for part in list(silent) {
            env.silent
                .push(part.parse().map_err(|e| invalid(SIM_SILENT_MUX_ENV, e))?);
        }
        for part in list(absent) {
            env.absent
                .push(part.parse().map_err(|e| invalid(SIM_ABSENT_ENV, e))?);
        }
        Ok(env)
    }

    fn load_for(&self, key: ScaleKey) -> f64 {
        self.loads
            .iter()
            .rev()
            .find(|(k, _)| *k == key)
            .map_or(self.default_load, |(_, w)| *w)
    }
}

/// Simulated rig with one cell per configured scale. The sim cells share a
/// single known response so a calibration file of `[8000, 400000.0]` reads
/// the configured loads back exactly.
#[cfg_attr(feature = "hardware", allow(dead_code))]
pub fn simulated(
    cfg: &Config,
    valves: &ValveSelection,
    env: &SimEnv,
) -> eyre::Result<Rig<irrigator_hardware::SimMux, irrigator_hardware::SimAmplifier>> {
    use irrigator_hardware::{SimBus, SimCell, ValveJournal};
    use irrigator_core::MASTER_VALVE;

    let bus = SimBus::new();
    for key in cfg.all_scale_keys()? {
        bus.add_cell(
            key.mux.get(),
            key.channel.get(),
            SimCell {
                load: env.load_for(key),
                present: !env.absent.contains(&key),
                ..SimCell::default()
            },
        );
    }
    for addr in &env.silent {
        bus.silence_mux(addr.get());
    }
    let journal = ValveJournal::new();
    let branches = selected_valves(cfg, valves)
        .map(|(name, _)| (name.clone(), Box::new(journal.valve(name.as_str())) as BoxedValve))
        .collect();
    tracing::info!(silent = env.silent.len(), absent = env.absent.len(), "simulated backend ready");
    Ok(Rig {
        mux: bus.mux(),
        amp: bus.amplifier(),
        master: Box::new(journal.valve(MASTER_VALVE)),
        branches,
    })
}
