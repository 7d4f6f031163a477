//! Append-only record of every watering.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::{IrrigationError, StoreError};

/// One watering: when it started, which valve, how much was targeted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaterRecord {
    pub timestamp: NaiveDateTime,
    pub valve: String,
    pub target_amount: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WaterLog {
    records: Vec<WaterRecord>,
}

impl WaterLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a CSV water log. A missing file is `StoreError::NotFound`.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let file = fs::File::open(path).map_err(|e| StoreError::io(path, e))?;
        let mut rdr = csv::Reader::from_reader(file);
        let records = rdr
            .deserialize()
            .collect::<Result<Vec<WaterRecord>, _>>()
            .map_err(|e| StoreError::parse(path, e))?;
        Ok(Self { records })
    }

    /// Like `load`, but a missing file is an empty log.
    pub fn load_or_default(path: &Path) -> Result<Self, StoreError> {
        match Self::load(path) {
            Err(StoreError::NotFound(_)) => Ok(Self::new()),
            other => other,
        }
    }

    pub fn records(&self) -> &[WaterRecord] {
        &self.records
    }

    pub fn extend(&mut self, records: &[WaterRecord]) {
        self.records.extend_from_slice(records);
    }

    /// Most recent watering by any of `valves`. Zero-amount records are
    /// logged for completeness but delivered no water, so they do not count.
    pub fn last_watering(&self, valves: &[&str]) -> Option<NaiveDateTime> {
        self.records
            .iter()
            .filter(|r| r.target_amount > 0.0)
            .filter(|r| valves.contains(&r.valve.as_str()))
            .map(|r| r.timestamp)
            .max()
    }
}

/// Destination for new water records: the local CSV, or whatever an
/// external uploader watches.
pub trait WaterLogSink {
    fn publish(&mut self, records: &[WaterRecord]) -> Result<(), IrrigationError>;
}

/// Appends to a CSV file, writing the header only when the file is new.
#[derive(Debug, Clone)]
pub struct CsvWaterLog {
    path: PathBuf,
}

impl CsvWaterLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, records: &[WaterRecord]) -> Result<(), StoreError> {
        let path = self.path.as_path();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
        }
        let fresh = fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| StoreError::io(path, e))?;
        let mut wtr = csv::WriterBuilder::new().has_headers(fresh).from_writer(file);
        for r in records {
            wtr.serialize(r).map_err(|e| StoreError::parse(path, e))?;
        }
        wtr.flush().map_err(|e| StoreError::io(path, e))?;
        Ok(())
    }
}

impl WaterLogSink for CsvWaterLog {
    fn publish(&mut self, records: &[WaterRecord]) -> Result<(), IrrigationError> {
        if records.is_empty() {
            return Ok(());
        }
        self.append(records)?;
        tracing::info!(path = %self.path.display(), records = records.len(), "water log appended");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    fn rec(h: u32, valve: &str, amount: f64) -> WaterRecord {
        WaterRecord {
            timestamp: ts(h),
            valve: valve.into(),
            target_amount: amount,
        }
    }

    #[test]
    fn appends_with_a_single_header() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("logs/water_log.csv");
        let mut sink = CsvWaterLog::new(&p);
        sink.publish(&[rec(8, "v1", 10.0)]).unwrap();
        sink.publish(&[rec(12, "v2", 0.0), rec(12, "v1", 3.5)]).unwrap();

        let text = fs::read_to_string(&p).unwrap();
        assert_eq!(text.matches("timestamp,valve,target_amount").count(), 1);
        let log = WaterLog::load(&p).unwrap();
        assert_eq!(log.records().len(), 3);
        assert_eq!(log.records()[2], rec(12, "v1", 3.5));
    }

    #[test]
    fn last_watering_filters_by_valve() {
        let mut log = WaterLog::new();
        log.extend(&[rec(8, "v1", 1.0), rec(10, "v2", 1.0), rec(9, "v1", 1.0)]);
        assert_eq!(log.last_watering(&["v1"]), Some(ts(9)));
        assert_eq!(log.last_watering(&["v1", "v2"]), Some(ts(10)));
        assert_eq!(log.last_watering(&["v3"]), None);
    }

    #[test]
    fn zero_amount_records_are_not_waterings() {
        let mut log = WaterLog::new();
        log.extend(&[rec(7, "v2", 4.0), rec(12, "v2", 0.0)]);
        assert_eq!(log.last_watering(&["v2"]), Some(ts(7)));
        log.extend(&[rec(13, "v2", 0.0)]);
        assert_eq!(log.last_watering(&["v2"]), Some(ts(7)));
        assert_eq!(log.records().len(), 3);
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("none.csv");
        assert!(matches!(WaterLog::load(&p), Err(StoreError::NotFound(_))));
        assert!(WaterLog::load_or_default(&p).unwrap().records().is_empty());
    }
}
