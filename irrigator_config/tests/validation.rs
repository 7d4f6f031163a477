use std::fs;

use irrigator_config::{Config, MassUnit, VolumeUnit, WateringKey, load_path, load_toml};
use rstest::rstest;
use tempfile::tempdir;

const BASE: &str = r#"
[experiment]
output_dir = "data"
watering_key = "group"

[units]
mass = "kg"
volume = "l"

[hardware]
master_valve_gpio = 24

[valves.v1]
gpio = 13
mux = "0x70"
channels = [0, 1]
flow_rate = 2.0
dose_coefficient = 1.5

[valves.v2]
gpio = 19
mux = "0x71"
channels = [3]
group = "v1"
"#;

fn base() -> Config {
    load_toml(BASE).expect("parse base TOML")
}

#[test]
fn accepts_base_config_and_fills_defaults() {
    let cfg = base();
    cfg.validate().expect("valid config should pass");
    assert_eq!(cfg.experiment.watering_key, WateringKey::Group);
    assert_eq!(cfg.experiment.calibration_file, "cal_file.json");
    assert_eq!(cfg.units.mass, MassUnit::Kg);
    assert_eq!(cfg.units.volume, VolumeUnit::L);
    assert_eq!(cfg.sampling.read_samples, 5);
    assert!((cfg.valves["v2"].flow_rate - irrigator_config::DEFAULT_FLOW_RATE).abs() < 1e-12);
    assert_eq!(cfg.group_of("v2"), "v1");
    assert_eq!(cfg.group_of("v1"), "v1");
    assert_eq!(cfg.all_scale_keys().unwrap().len(), 3);
    assert_eq!(cfg.mux_addresses().unwrap().len(), 2);
}

#[rstest]
#[case("flow_rate = 2.0", "flow_rate = 0.0", "flow_rate must be > 0")]
#[case("flow_rate = 2.0", "flow_rate = -1.0", "flow_rate must be > 0")]
#[case("dose_coefficient = 1.5", "dose_coefficient = -0.1", "dose_coefficient must be >= 0")]
#[case("mux = \"0x70\"", "mux = \"0xZZ\"", "valves.v1.mux")]
#[case("channels = [0, 1]", "channels = [0, 8]", "out of range")]
#[case("channels = [0, 1]", "channels = [1, 1]", "duplicates")]
#[case("channels = [0, 1]", "channels = []", "at least one channel")]
#[case("group = \"v1\"", "group = \"nope\"", "unknown valve")]
#[case("gpio = 19", "gpio = 13", "already used")]
#[case("gpio = 13", "gpio = 24", "already used")]
fn rejects_invalid_valves(#[case] from: &str, #[case] to: &str, #[case] needle: &str) {
    let text = BASE.replacen(from, to, 1);
    let cfg = load_toml(&text).expect("parse TOML");
    let err = cfg.validate().expect_err("should be rejected");
    assert!(
        format!("{err}").contains(needle),
        "expected {needle:?} in {err}"
    );
}

#[test]
fn rejects_chained_groups() {
    let text = format!(
        "{BASE}\n[valves.v3]\ngpio = 26\nmux = \"0x71\"\nchannels = [4]\ngroup = \"v2\"\n"
    );
    let err = load_toml(&text).unwrap().validate().unwrap_err();
    assert!(format!("{err}").contains("itself grouped under \"v1\""), "{err}");

    let text = BASE.replacen("dose_coefficient = 1.5", "dose_coefficient = 1.5\ngroup = \"v1\"", 1);
    load_toml(&text).unwrap().validate().expect("a valve may name its own group");
}

#[test]
fn rejects_flow_unit_mismatch() {
    let text = BASE.replacen(
        "flow_rate = 2.0",
        "flow_rate = 2.0\nflow_volume_unit = \"ml\"",
        1,
    );
    let err = load_toml(&text).unwrap().validate().unwrap_err();
    assert!(format!("{err}").contains("does not match units.volume"));
}

#[test]
fn rejects_missing_valves() {
    let err = load_toml("[valves]\n").unwrap().validate().unwrap_err();
    assert!(format!("{err}").contains("at least one"));
}

#[rstest]
#[case("[sampling]\nread_samples = 0\n", "read_samples")]
#[case("[sampling]\nweight_decimals = 9\n", "weight_decimals")]
#[case("[actuation]\nmax_workers = 0\n", "max_workers")]
#[case("[actuation]\nmax_open_ms = 0\n", "max_open_ms")]
#[case("[logging]\nrotation = \"weekly\"\n", "logging.rotation")]
fn rejects_invalid_sections(#[case] section: &str, #[case] needle: &str) {
    let text = format!("{section}{BASE}");
    let err = load_toml(&text).unwrap().validate().unwrap_err();
    assert!(format!("{err}").contains(needle), "{err}");
}

#[test]
fn load_path_reads_json_by_extension() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("treatment.json");
    fs::write(
        &path,
        r#"{
            "valves": {
                "a": { "gpio": 5, "mux": "0x70", "channels": [2], "flow_rate": 1.0 }
            }
        }"#,
    )
    .unwrap();
    let cfg = load_path(&path).expect("json config");
    assert_eq!(cfg.valves["a"].channels, vec![2]);
}

#[test]
fn load_path_reports_missing_file() {
    let dir = tempdir().unwrap();
    let err = load_path(&dir.path().join("absent.toml")).unwrap_err();
    assert!(format!("{err}").contains("read config"));
}

#[test]
fn shipped_sample_config_is_valid() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../etc/irrigator.toml");
    let cfg = load_path(&path).expect("etc/irrigator.toml should validate");
    assert_eq!(cfg.group_of("v3"), "v2");
    assert_eq!(cfg.all_scale_keys().unwrap().len(), 10);
}
