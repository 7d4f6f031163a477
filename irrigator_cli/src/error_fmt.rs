//! Human-readable error descriptions, structured JSON errors and exit codes.

use irrigator_core::{BusError, IrrigationError, StoreError};

/// Typed cause found anywhere in the report's chain.
enum Cause<'a> {
    Irrigation(&'a IrrigationError),
    Bus(&'a BusError),
    Store(&'a StoreError),
    Other,
}

fn cause(err: &eyre::Report) -> Cause<'_> {
    for e in err.chain() {
        if let Some(ie) = e.downcast_ref::<IrrigationError>() {
            return Cause::Irrigation(ie);
        }
        if let Some(be) = e.downcast_ref::<BusError>() {
            return Cause::Bus(be);
        }
        if let Some(se) = e.downcast_ref::<StoreError>() {
            return Cause::Store(se);
        }
    }
    Cause::Other
}

fn bus_text(be: &BusError) -> String {
    match be {
        BusError::Mux { addr, .. } => format!(
            "What happened: The I2C multiplexer at {addr} did not answer.\nLikely causes: Loose SDA/SCL wiring, no power to the mux, or a wrong address in the config.\nHow to fix: Check the mux wiring and `i2cdetect`, then verify valves.<name>.mux."
        ),
        BusError::NotConnected(key) => format!(
            "What happened: No load-cell amplifier answered on scale {key}.\nLikely causes: Amplifier unplugged from that mux channel or the channel is miswired.\nHow to fix: Reseat the amplifier on {key} or remove that channel from the config."
        ),
        BusError::Timeout(key) => format!(
            "What happened: Scale {key} read timed out.\nLikely causes: Amplifier not powered, noisy bus, or timeout too low.\nHow to fix: Verify power and wiring, and consider increasing hardware.sensor_read_timeout_ms in the config."
        ),
        BusError::Amplifier { key, reason } => format!(
            "What happened: The amplifier on scale {key} failed ({reason}).\nLikely causes: Bus noise or a faulty amplifier board.\nHow to fix: Run `irrigator self-check` and replace the board if it keeps failing."
        ),
    }
}

/// Map an `eyre::Report` to a human-readable explanation with likely causes and fix hints.
pub fn humanize(err: &eyre::Report) -> String {
    match cause(err) {
        Cause::Irrigation(IrrigationError::InvalidConfig(msg)) => format!(
            "What happened: Invalid configuration ({msg}).\nLikely causes: Missing or out-of-range values in the experiment file.\nHow to fix: Edit the config file, then rerun."
        ),
        Cause::Irrigation(IrrigationError::Bus(be)) | Cause::Bus(be) => bus_text(be),
        Cause::Irrigation(IrrigationError::CalibrationMissing(key)) => format!(
            "What happened: Scale {key} has no calibration.\nLikely causes: The calibration file was deleted or the scale is new.\nHow to fix: Run `irrigator calibrate --scales {key}`."
        ),
        Cause::Irrigation(IrrigationError::Valve { valve, reason }) => format!(
            "What happened: Valve {valve} could not be switched ({reason}).\nLikely causes: GPIO permissions or a relay wiring fault.\nHow to fix: Check the valve's gpio in the config and that the process may access /dev/gpiomem."
        ),
        Cause::Irrigation(IrrigationError::Io(msg)) => format!(
            "What happened: A file could not be read or written ({msg}).\nLikely causes: Missing directory or insufficient permissions.\nHow to fix: Check experiment.output_dir and file permissions."
        ),
        Cause::Store(StoreError::NotFound(path)) => format!(
            "What happened: {} does not exist.\nLikely causes: Wrong path passed on the command line or in the config.\nHow to fix: Fix the path, or run `irrigator calibrate` to create a calibration file.",
            path.display()
        ),
        Cause::Store(se) => format!(
            "What happened: {se}.\nLikely causes: The file was edited by hand or written by a different tool.\nHow to fix: Repair or move the file aside and rerun."
        ),
        Cause::Irrigation(ie) => format!(
            "What happened: {ie}.\nLikely causes: See logs.\nHow to fix: Re-run with --log-level=debug or set RUST_LOG for more detail."
        ),
        Cause::Other => {
            let msg = err.to_string();
            let mut cause = String::new();
            if let Some(src) = err.source() {
                cause = format!(" Cause: {src}");
            }
            format!(
                "Something went wrong.{cause}\nHow to fix: Re-run with --log-level=debug for details. Original: {msg}"
            )
        }
    }
}

/// Stable exit codes: 2 invalid config, 3 file errors, 4 bus errors, 1 otherwise.
pub fn exit_code_for_error(err: &eyre::Report) -> i32 {
    match cause(err) {
        Cause::Irrigation(IrrigationError::InvalidConfig(_)) => 2,
        Cause::Irrigation(IrrigationError::Io(_)) | Cause::Store(_) => 3,
        Cause::Irrigation(IrrigationError::Bus(_)) | Cause::Bus(_) => 4,
        _ => 1,
    }
}

fn reason_name(err: &eyre::Report) -> &'static str {
    match cause(err) {
        Cause::Irrigation(ie) => match ie {
            IrrigationError::Bus(_) => "Bus",
            IrrigationError::CalibrationMissing(_) => "CalibrationMissing",
            IrrigationError::InvalidConfig(_) => "InvalidConfig",
            IrrigationError::Io(_) => "Io",
            IrrigationError::Valve { .. } => "Valve",
            IrrigationError::State(_) => "State",
        },
        Cause::Bus(_) => "Bus",
        Cause::Store(_) => "Io",
        Cause::Other => "Error",
    }
}

/// Structured JSON for errors when --json is enabled.
pub fn format_error_json(err: &eyre::Report) -> String {
    serde_json::json!({
        "reason": reason_name(err),
        "exit_code": exit_code_for_error(err),
        "message": humanize(err),
    })
    .to_string()
}
