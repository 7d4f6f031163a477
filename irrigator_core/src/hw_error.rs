//! Maps `Box<dyn Error>` from trait boundaries to typed `BusError`s.
//!
//! The traits in `irrigator_traits` box their errors so any driver fits;
//! this module turns them back into the scoped bus errors the controller
//! isolates on, with an optional feature-gated path for
//! `irrigator_hardware::HwError` downcasting.

use irrigator_config::{MuxAddress, ScaleKey};

use crate::error::BusError;

/// Map a mux driver error. Any failure talking to the switch is a mux fault.
pub fn map_mux_error(addr: MuxAddress, e: &(dyn std::error::Error + 'static)) -> BusError {
    BusError::Mux {
        addr,
        reason: e.to_string(),
    }
}

/// Map an amplifier driver error for the scale on `key`.
///
/// Attempts to downcast known hardware error types first, then falls back
/// to string-based heuristics.
pub fn map_amp_error(key: ScaleKey, e: &(dyn std::error::Error + 'static)) -> BusError {
    #[cfg(feature = "hardware-errors")]
    {
        use irrigator_hardware::error::HwError;
        if let Some(hw) = e.downcast_ref::<HwError>() {
            return match hw {
                HwError::Timeout => BusError::Timeout(key),
                HwError::NoAck { .. } => BusError::NotConnected(key),
                other => BusError::Amplifier {
                    key,
                    reason: other.to_string(),
                },
            };
        }
    }

    let s = e.to_string();
    if s.to_lowercase().contains("timeout") {
        BusError::Timeout(key)
    } else {
        BusError::Amplifier { key, reason: s }
    }
}
