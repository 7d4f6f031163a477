//! Which scales exist, which valve waters them and how valves are grouped.

use std::collections::{BTreeMap, BTreeSet};

use irrigator_config::{Config, MuxAddress, ScaleKey, ScaleSelection, ValveSelection};

use crate::calibration_store::CalibrationTable;
use crate::error::IrrigationError;
use crate::load_cell::LoadCell;

/// Everything the controller needs to know about one solenoid.
#[derive(Debug, Clone, PartialEq)]
pub struct ValveSpec {
    pub id: String,
    pub gpio: u8,
    /// Volume per second while open.
    pub flow_rate: f64,
    pub dose_coefficient: f64,
    /// Valve whose scales define this valve's weight loss (itself unless
    /// grouped).
    pub group: String,
    /// Scales under this valve's own outlets.
    pub scales: Vec<ScaleKey>,
}

#[derive(Debug, Clone)]
pub struct ScaleRegistry {
    cells: BTreeMap<ScaleKey, LoadCell>,
    valves: BTreeMap<String, ValveSpec>,
    /// Scales each group leader owns, from the full configuration.
    group_scales: BTreeMap<String, Vec<ScaleKey>>,
    /// Every configured valve per group leader.
    group_members: BTreeMap<String, Vec<String>>,
}

impl ScaleRegistry {
    /// Build from a validated config. `scales` limits which cells get polled;
    /// `valves` limits which solenoids a cycle may open. Naming a scale or
    /// valve that is not configured is an error.
    pub fn from_config(
        cfg: &Config,
        scales: &ScaleSelection,
        valves: &ValveSelection,
    ) -> Result<Self, IrrigationError> {
        let invalid = |e: eyre::Report| IrrigationError::InvalidConfig(format!("{e:#}"));

        let mut own: BTreeMap<String, Vec<ScaleKey>> = BTreeMap::new();
        let mut group_members: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, v) in &cfg.valves {
            own.insert(name.clone(), v.scale_keys().map_err(invalid)?);
            group_members
                .entry(cfg.group_of(name).to_string())
                .or_default()
                .push(name.clone());
        }
        let mut group_scales: BTreeMap<String, Vec<ScaleKey>> = BTreeMap::new();
        for (name, keys) in &own {
            let leader = cfg.group_of(name).to_string();
            let entry = group_scales.entry(leader).or_default();
            for k in keys {
                if !entry.contains(k) {
                    entry.push(*k);
                }
            }
        }

        let configured: BTreeSet<ScaleKey> = own.values().flatten().copied().collect();
        let polled: BTreeSet<ScaleKey> = match scales {
            ScaleSelection::All => configured.clone(),
            ScaleSelection::Only(keys) => {
                if let Some(k) = keys.iter().find(|k| !configured.contains(k)) {
                    return Err(IrrigationError::InvalidConfig(format!(
                        "scale {k} is not attached to any configured valve"
                    )));
                }
                keys.iter().copied().collect()
            }
        };

        if let ValveSelection::Only(names) = valves {
            if let Some(n) = names.iter().find(|n| !cfg.valves.contains_key(n.as_str())) {
                return Err(IrrigationError::InvalidConfig(format!("unknown valve {n:?}")));
            }
        }
        let mut specs = BTreeMap::new();
        for (name, v) in cfg.valves.iter().filter(|(n, _)| valves.includes(n)) {
            specs.insert(
                name.clone(),
                ValveSpec {
                    id: name.clone(),
                    gpio: v.gpio,
                    flow_rate: v.flow_rate,
                    dose_coefficient: v.dose_coefficient,
                    group: cfg.group_of(name).to_string(),
                    scales: own.get(name).cloned().unwrap_or_default(),
                },
            );
        }

        Ok(Self {
            cells: polled.into_iter().map(|k| (k, LoadCell::new(k))).collect(),
            valves: specs,
            group_scales,
            group_members,
        })
    }

    pub fn keys(&self) -> Vec<ScaleKey> {
        self.cells.keys().copied().collect()
    }

    pub fn cell(&self, key: ScaleKey) -> Option<&LoadCell> {
        self.cells.get(&key)
    }

    pub fn cell_mut(&mut self, key: ScaleKey) -> Option<&mut LoadCell> {
        self.cells.get_mut(&key)
    }

    pub fn cells(&self) -> impl Iterator<Item = &LoadCell> {
        self.cells.values()
    }

    pub fn valves(&self) -> impl Iterator<Item = &ValveSpec> {
        self.valves.values()
    }

    pub fn valve(&self, id: &str) -> Option<&ValveSpec> {
        self.valves.get(id)
    }

    /// Scales whose weight loss decides `valve`'s dose.
    pub fn dose_scales(&self, valve: &str) -> &[ScaleKey] {
        self.valves
            .get(valve)
            .and_then(|v| self.group_scales.get(&v.group))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// All configured valves that share `valve`'s group, including itself.
    pub fn group_members(&self, valve: &str) -> Vec<&str> {
        self.valves
            .get(valve)
            .and_then(|v| self.group_members.get(&v.group))
            .map(|m| m.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn mux_addresses(&self) -> BTreeSet<MuxAddress> {
        self.cells.keys().map(|k| k.mux).collect()
    }

    /// Apply stored calibrations. Returns the polled scales with no entry.
    pub fn attach_calibration(&mut self, table: &CalibrationTable) -> Vec<ScaleKey> {
        let mut missing = Vec::new();
        for (key, cell) in &mut self.cells {
            match table.get(key) {
                Some(cal) => cell.set_calibration(*cal),
                None => missing.push(*key),
            }
        }
        missing
    }

    /// Current calibration of every calibrated cell.
    pub fn calibration_table(&self) -> CalibrationTable {
        self.cells
            .iter()
            .filter_map(|(k, c)| c.calibration().map(|cal| (*k, cal)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::Calibration;

    const CFG: &str = r#"
[experiment]
watering_key = "group"

[valves.v1]
gpio = 13
mux = "0x70"
channels = [0, 1]

[valves.v2]
gpio = 19
mux = "0x70"
channels = [2]
group = "v1"

[valves.v3]
gpio = 26
mux = "0x71"
channels = [0]
"#;

    fn cfg() -> Config {
        let c = irrigator_config::load_toml(CFG).unwrap();
        c.validate().unwrap();
        c
    }

    fn key(s: &str) -> ScaleKey {
        s.parse().unwrap()
    }

    #[test]
    fn all_scales_are_polled_once() {
        let r = ScaleRegistry::from_config(&cfg(), &ScaleSelection::All, &ValveSelection::All).unwrap();
        assert_eq!(r.keys().len(), 4);
        assert_eq!(r.mux_addresses().len(), 2);
        assert_eq!(r.valves().count(), 3);
    }

    #[test]
    fn grouped_valves_share_the_leaders_scales() {
        let r = ScaleRegistry::from_config(&cfg(), &ScaleSelection::All, &ValveSelection::All).unwrap();
        let leader = r.dose_scales("v1").to_vec();
        assert_eq!(leader, vec![key("0x70-0"), key("0x70-1"), key("0x70-2")]);
        assert_eq!(r.dose_scales("v2"), leader.as_slice());
        assert_eq!(r.dose_scales("v3"), &[key("0x71-0")]);
        assert_eq!(r.group_members("v2"), vec!["v1", "v2"]);
        assert_eq!(r.group_members("v3"), vec!["v3"]);
    }

    #[test]
    fn selections_restrict_and_validate() {
        let scales: ScaleSelection = "0x71-0".parse().unwrap();
        let valves: ValveSelection = "v3".parse().unwrap();
        let r = ScaleRegistry::from_config(&cfg(), &scales, &valves).unwrap();
        assert_eq!(r.keys(), vec![key("0x71-0")]);
        assert!(r.valve("v1").is_none());

        let bad: ScaleSelection = "0x72-0".parse().unwrap();
        assert!(matches!(
            ScaleRegistry::from_config(&cfg(), &bad, &ValveSelection::All),
            Err(IrrigationError::InvalidConfig(_))
        ));
        let bad: ValveSelection = "v9".parse().unwrap();
        assert!(matches!(
            ScaleRegistry::from_config(&cfg(), &ScaleSelection::All, &bad),
            Err(IrrigationError::InvalidConfig(_))
        ));
    }

    #[test]
    fn attach_reports_missing_calibrations() {
        let mut r = ScaleRegistry::from_config(&cfg(), &ScaleSelection::All, &ValveSelection::All).unwrap();
        let mut t = CalibrationTable::new();
        t.insert(key("0x70-0"), Calibration::new(1, 2.0));
        t.insert(key("0x7f-0"), Calibration::new(1, 2.0));
        let missing = r.attach_calibration(&t);
        assert_eq!(missing, vec![key("0x70-1"), key("0x70-2"), key("0x71-0")]);
        assert_eq!(r.calibration_table().len(), 1);
    }
}
