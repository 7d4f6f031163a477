#![no_main]
use irrigator_config::{ScaleKey, ScaleSelection, ValveSelection};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    if let Ok(ScaleSelection::Only(keys)) = data.parse::<ScaleSelection>() {
        for key in keys {
            // Display must round-trip through FromStr.
            let again: ScaleKey = key.to_string().parse().expect("display round-trips");
            assert_eq!(again, key);
        }
    }
    let _ = data.parse::<ValveSelection>();
});
