#![no_main]
use libfuzzer_sys::fuzz_target;

// Arbitrary experiment files must parse or be rejected, never panic, in
// either format; whatever parses must survive validation and the scale
// enumeration the controller does at startup.
fuzz_target!(|data: &str| {
    let parsed = [
        irrigator_config::load_toml(data).ok(),
        irrigator_config::load_json(data).ok(),
    ];
    for cfg in parsed.into_iter().flatten() {
        if cfg.validate().is_ok() {
            let _ = cfg.all_scale_keys();
            for name in cfg.valves.keys() {
                let _ = cfg.group_of(name);
            }
        }
    }
});
