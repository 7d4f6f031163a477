//! Persistent calibration table.
//!
//! On disk the table is a JSON object keyed by mux address, then channel,
//! each entry a `[zero_offset, gain_factor]` pair:
//!
//! ```json
//! { "0x70": { "0": [8123, 401234.5], "3": [7990, 398870.0] } }
//! ```
//!
//! Saving one scale merges into whatever is already on disk.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use irrigator_config::{ChannelId, MuxAddress, ScaleKey};

use crate::atomic::write_json_atomic;
use crate::calibration::Calibration;
use crate::error::StoreError;

pub type CalibrationTable = BTreeMap<ScaleKey, Calibration>;

type DiskTable<Z> = BTreeMap<String, BTreeMap<String, (Z, f64)>>;

#[derive(Debug, Clone, Copy, Default)]
pub struct CalibrationStore;

impl CalibrationStore {
    /// Read the whole table. A missing file is `StoreError::NotFound`.
    pub fn load(path: &Path) -> Result<CalibrationTable, StoreError> {
        let text = fs::read_to_string(path).map_err(|e| StoreError::io(path, e))?;
        // Older files may carry the zero offset as a float.
        let disk: DiskTable<serde_json::Number> =
            serde_json::from_str(&text).map_err(|e| StoreError::parse(path, e))?;

        let mut table = CalibrationTable::new();
        for (mux, channels) in disk {
            let mux: MuxAddress = mux
                .parse()
                .map_err(|e: eyre::Report| StoreError::parse(path, e))?;
            for (ch, (zero, gain)) in channels {
                let channel: ChannelId = ch
                    .parse()
                    .map_err(|e: eyre::Report| StoreError::parse(path, e))?;
                let zero = zero_offset(&zero).ok_or_else(|| {
                    StoreError::parse(path, format!("zero offset {zero} for {mux}-{channel} is out of range"))
                })?;
                table.insert(ScaleKey::new(mux, channel), Calibration::new(zero, gain));
            }
        }
        tracing::debug!(path = %path.display(), scales = table.len(), "calibration loaded");
        Ok(table)
    }

    /// Like `load`, but a missing file is an empty table.
    pub fn load_or_default(path: &Path) -> Result<CalibrationTable, StoreError> {
        match Self::load(path) {
            Err(StoreError::NotFound(_)) => Ok(CalibrationTable::new()),
            other => other,
        }
    }

    /// Persist one scale, keeping every other entry already on disk.
    pub fn save(path: &Path, key: ScaleKey, cal: Calibration) -> Result<(), StoreError> {
        let mut table = Self::load_or_default(path)?;
        table.insert(key, cal);
        Self::write(path, &table)
    }

    /// Merge `entries` into the file in one write.
    pub fn save_all(path: &Path, entries: &CalibrationTable) -> Result<(), StoreError> {
        let mut table = Self::load_or_default(path)?;
        table.extend(entries.iter().map(|(k, c)| (*k, *c)));
        Self::write(path, &table)
    }

    fn write(path: &Path, table: &CalibrationTable) -> Result<(), StoreError> {
        let mut disk: DiskTable<i32> = BTreeMap::new();
        for (key, cal) in table {
            disk.entry(key.mux.to_string())
                .or_default()
                .insert(key.channel.to_string(), (cal.zero_offset, cal.gain_factor));
        }
        write_json_atomic(path, &disk)?;
        tracing::info!(path = %path.display(), scales = table.len(), "calibration saved");
        Ok(())
    }
}

fn zero_offset(n: &serde_json::Number) -> Option<i32> {
    if let Some(i) = n.as_i64() {
        return i32::try_from(i).ok();
    }
    let f = n.as_f64()?.round();
    (f >= f64::from(i32::MIN) && f <= f64::from(i32::MAX)).then_some(f as i32)
}
