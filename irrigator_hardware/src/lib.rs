//! Drivers for the irrigation rig.
//!
//! - `sim`: always available; an in-process bus, amplifiers and valves.
//! - `hardware` feature: Raspberry Pi drivers over `rppal` for the TCA9548A
//!   I2C mux, the NAU7802 load-cell amplifier and GPIO solenoids.

pub mod error;
pub mod sim;
pub mod util;

#[cfg(feature = "hardware")]
pub mod i2c;
#[cfg(feature = "hardware")]
pub mod nau7802;
#[cfg(feature = "hardware")]
pub mod solenoid;
#[cfg(feature = "hardware")]
pub mod tca9548a;

pub use sim::{SimAmplifier, SimBus, SimCell, SimMux, SimValve, ValveJournal};

#[cfg(feature = "hardware")]
pub use {
    i2c::SharedI2c, nau7802::Nau7802, solenoid::Solenoid, tca9548a::Tca9548a,
};
