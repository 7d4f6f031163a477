use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use irrigator_config::{MuxAddress, ScaleKey};
use irrigator_core::{BusHandle, Calibration, LoadCell, weight_loss};
use irrigator_hardware::{SimBus, SimCell};
use proptest::prelude::*;

fn base() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    // A cell calibrated with the true zero and gain reads back its load,
    // whatever the sample count.
    #[test]
    fn calibrated_read_recovers_load(
        zero in -100_000i32..100_000,
        gain in 100.0f64..500_000.0,
        load in 0.0f64..2_000.0,
        samples in 1usize..8,
    ) {
        let sim = SimBus::new();
        sim.add_cell(0x70, 3, SimCell { zero_counts: zero, counts_per_unit: gain, load, present: true });
        let mut bus = BusHandle::open(
            sim.mux(),
            sim.amplifier(),
            [MuxAddress::new(0x70).unwrap()],
            Duration::from_millis(1),
        );
        let key: ScaleKey = "0x70-3".parse().unwrap();
        let mut cell = LoadCell::new(key);
        prop_assert!(cell.connect(&mut bus));
        cell.set_calibration(Calibration::new(zero, gain));
        let w = cell.read_weight(&mut bus, samples, 3).unwrap();
        // One count of ADC quantisation plus the 3-decimal rounding.
        prop_assert!((w - load).abs() <= 1.0 / gain + 0.0005 + 1e-9);
        prop_assert_eq!(sim.reads(), samples as u64);
        prop_assert_eq!(sim.control(0x70), Some(0));
    }

    // A noisy window reads as the mean of every converted sample.
    #[test]
    fn read_is_the_mean_of_converted_samples(
        zero in -10_000i32..10_000,
        gain in 100.0f64..10_000.0,
        raws in proptest::collection::vec(-1_000_000i32..1_000_000, 1..8),
    ) {
        let sim = SimBus::new();
        sim.add_cell(0x70, 0, SimCell::default());
        sim.script_raw(0x70, 0, raws.iter().copied());
        let mut bus = BusHandle::open(
            sim.mux(),
            sim.amplifier(),
            [MuxAddress::new(0x70).unwrap()],
            Duration::from_millis(1),
        );
        let mut cell = LoadCell::new("0x70-0".parse().unwrap());
        prop_assert!(cell.connect(&mut bus));
        cell.set_calibration(Calibration::new(zero, gain));
        let w = cell.read_weight(&mut bus, raws.len(), 3).unwrap();
        let expected = raws
            .iter()
            .map(|r| (f64::from(*r) - f64::from(zero)) / gain)
            .sum::<f64>()
            / raws.len() as f64;
        prop_assert!((w - expected).abs() <= 0.0005 + 1e-6);
    }

    // Loss never depends on readings taken before the last watering.
    #[test]
    fn loss_ignores_pre_watering_history(
        before in proptest::collection::vec(0.0f64..500.0, 0..6),
        after in proptest::collection::vec(0.0f64..500.0, 1..6),
    ) {
        let mut series = Vec::new();
        let mut t = base();
        for w in &before {
            series.push((t, *w));
            t += TimeDelta::minutes(1);
        }
        let watered = t;
        for w in &after {
            series.push((t, *w));
            t += TimeDelta::minutes(1);
        }
        let loss = weight_loss(&series, Some(watered)).unwrap();
        prop_assert_eq!(loss, after[0] - after[after.len() - 1]);
    }
}
