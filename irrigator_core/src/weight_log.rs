//! Time series of scale readings, grouped by the cycle that took them.
//!
//! File layout: a JSON object keyed by cycle start, each value mapping scale
//! keys to `[weight, sample_timestamp]`. Writing merges into the file on
//! disk instead of replacing it.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::NaiveDateTime;
use irrigator_config::ScaleKey;

use crate::atomic::write_json_atomic;
use crate::error::StoreError;

const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

pub fn format_ts(ts: NaiveDateTime) -> String {
    ts.format(TS_FORMAT).to_string()
}

pub fn parse_ts(s: &str) -> Option<NaiveDateTime> {
    s.parse().ok()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightSample {
    pub key: ScaleKey,
    pub weight: f64,
    pub timestamp: NaiveDateTime,
}

type Run = BTreeMap<ScaleKey, (f64, NaiveDateTime)>;
type DiskLog = BTreeMap<String, BTreeMap<String, (f64, String)>>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WeightLog {
    runs: BTreeMap<NaiveDateTime, Run>,
}

impl WeightLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the log. A missing file is `StoreError::NotFound`.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let text = fs::read_to_string(path).map_err(|e| StoreError::io(path, e))?;
        let disk: DiskLog = serde_json::from_str(&text).map_err(|e| StoreError::parse(path, e))?;
        let bad_ts = |s: &str| StoreError::parse(path, format!("bad timestamp {s:?}"));

        let mut log = Self::new();
        for (start, samples) in disk {
            let start_ts = parse_ts(&start).ok_or_else(|| bad_ts(&start))?;
            let run = log.runs.entry(start_ts).or_default();
            for (key, (weight, ts)) in samples {
                let key: ScaleKey = key
                    .parse()
                    .map_err(|e: eyre::Report| StoreError::parse(path, e))?;
                let ts = parse_ts(&ts).ok_or_else(|| bad_ts(&ts))?;
                run.insert(key, (weight, ts));
            }
        }
        Ok(log)
    }

    /// Like `load`, but a missing file is an empty log.
    pub fn load_or_default(path: &Path) -> Result<Self, StoreError> {
        match Self::load(path) {
            Err(StoreError::NotFound(_)) => Ok(Self::new()),
            other => other,
        }
    }

    pub fn record(&mut self, run_start: NaiveDateTime, sample: WeightSample) {
        self.runs
            .entry(run_start)
            .or_default()
            .insert(sample.key, (sample.weight, sample.timestamp));
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    /// Samples taken during the cycle that started at `run_start`.
    pub fn run(&self, run_start: NaiveDateTime) -> Vec<WeightSample> {
        self.runs
            .get(&run_start)
            .map(|r| {
                r.iter()
                    .map(|(k, (w, ts))| WeightSample {
                        key: *k,
                        weight: *w,
                        timestamp: *ts,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every reading of `key`, oldest first.
    pub fn series(&self, key: ScaleKey) -> Vec<(NaiveDateTime, f64)> {
        let mut out: Vec<_> = self
            .runs
            .values()
            .filter_map(|r| r.get(&key).map(|(w, ts)| (*ts, *w)))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Fold `other` in; entries in `other` win on collision.
    pub fn merge(&mut self, other: &WeightLog) {
        for (start, run) in &other.runs {
            self.runs
                .entry(*start)
                .or_default()
                .extend(run.iter().map(|(k, v)| (*k, *v)));
        }
    }

    /// Merge this log into the file at `path` and write it back atomically.
    pub fn merge_into_file(&self, path: &Path) -> Result<(), StoreError> {
        let mut on_disk = Self::load_or_default(path)?;
        on_disk.merge(self);

        let disk: DiskLog = on_disk
            .runs
            .iter()
            .map(|(start, run)| {
                let samples = run
                    .iter()
                    .map(|(k, (w, ts))| (k.to_string(), (*w, format_ts(*ts))))
                    .collect();
                (format_ts(*start), samples)
            })
            .collect();
        write_json_atomic(path, &disk)?;
        tracing::debug!(path = %path.display(), runs = on_disk.run_count(), "weight log written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_milli_opt(h, m, 0, 250)
            .unwrap()
    }

    fn sample(key: &str, weight: f64, at: NaiveDateTime) -> WeightSample {
        WeightSample {
            key: key.parse().unwrap(),
            weight,
            timestamp: at,
        }
    }

    #[test]
    fn series_is_ordered_by_sample_time() {
        let mut log = WeightLog::new();
        log.record(ts(12, 0), sample("0x70-0", 90.0, ts(12, 1)));
        log.record(ts(8, 0), sample("0x70-0", 100.0, ts(8, 1)));
        log.record(ts(8, 0), sample("0x70-1", 5.0, ts(8, 2)));
        let s = log.series("0x70-0".parse().unwrap());
        assert_eq!(s, vec![(ts(8, 1), 100.0), (ts(12, 1), 90.0)]);
        assert_eq!(log.run(ts(8, 0)).len(), 2);
    }

    #[test]
    fn merge_into_file_keeps_earlier_runs() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("weight_data.json");

        let mut first = WeightLog::new();
        first.record(ts(8, 0), sample("0x70-0", 100.0, ts(8, 1)));
        first.merge_into_file(&p).unwrap();

        let mut second = WeightLog::new();
        second.record(ts(12, 0), sample("0x70-0", 90.0, ts(12, 1)));
        second.merge_into_file(&p).unwrap();

        let back = WeightLog::load(&p).unwrap();
        assert_eq!(back.run_count(), 2);
        assert_eq!(back.series("0x70-0".parse().unwrap()).len(), 2);
    }

    #[test]
    fn file_layout_uses_iso_keys_and_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("w.json");
        let mut log = WeightLog::new();
        log.record(ts(8, 0), sample("0x70-3", 1.5, ts(8, 1)));
        log.merge_into_file(&p).unwrap();
        let v: serde_json::Value = serde_json::from_str(&fs::read_to_string(&p).unwrap()).unwrap();
        let entry = &v["2024-05-01T08:00:00.250"]["0x70-3"];
        assert_eq!(entry[0], 1.5);
        assert_eq!(entry[1], "2024-05-01T08:01:00.250");
    }

    #[test]
    fn missing_and_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("w.json");
        assert!(matches!(WeightLog::load(&p), Err(StoreError::NotFound(_))));
        assert!(WeightLog::load_or_default(&p).unwrap().is_empty());
        fs::write(&p, r#"{"yesterday": {}}"#).unwrap();
        assert!(matches!(WeightLog::load(&p), Err(StoreError::Parse { .. })));
    }
}
