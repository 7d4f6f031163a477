//! Hardware seams shared by the irrigation stack.
//!
//! Everything that touches the I2C bus or a GPIO line goes through one of the
//! traits below. Errors cross the boundary boxed so drivers can use their own
//! error types; `irrigator_core::hw_error` maps them back to typed errors.

pub mod clock;

pub use clock::{Clock, MonotonicClock};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Register-level access to a TCA9548A-style I2C switch.
///
/// The device has a single control byte; bit `n` set means downstream
/// channel `n` is connected to the upstream bus.
pub trait MuxDriver {
    fn read_control(&mut self, addr: u8) -> Result<u8, BoxError>;
    fn write_control(&mut self, addr: u8, mask: u8) -> Result<(), BoxError>;
}

/// The load-cell amplifier reachable on whichever mux channel is enabled.
///
/// All amplifiers share one bus address, so a single driver instance talks to
/// each of them in turn.
pub trait Amplifier {
    /// Initialise the chip on the active channel. `Ok(false)` means nothing
    /// acknowledged at the amplifier address.
    fn begin(&mut self) -> Result<bool, BoxError>;

    /// One raw conversion result in signed ADC counts.
    fn read_raw(&mut self, timeout: std::time::Duration) -> Result<i32, BoxError>;
}

/// A GPIO-driven solenoid valve.
pub trait Valve {
    fn open(&mut self) -> Result<(), BoxError>;
    fn close(&mut self) -> Result<(), BoxError>;
}

impl<T: Valve + ?Sized> Valve for Box<T> {
    fn open(&mut self) -> Result<(), BoxError> {
        (**self).open()
    }
    fn close(&mut self) -> Result<(), BoxError> {
        (**self).close()
    }
}
