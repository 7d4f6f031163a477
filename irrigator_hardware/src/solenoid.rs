use irrigator_traits::{BoxError, Valve};
use rppal::gpio::{Gpio, OutputPin};

use crate::error::{HwError, Result};

/// Solenoid valve on a BCM-numbered GPIO line; high means open.
pub struct Solenoid {
    pin: OutputPin,
}

impl Solenoid {
    pub fn new(gpio: &Gpio, bcm_pin: u8) -> Result<Self> {
        let mut pin = gpio
            .get(bcm_pin)
            .map_err(|e| HwError::Gpio(format!("pin {bcm_pin}: {e}")))?
            .into_output();
        pin.set_low();
        Ok(Self { pin })
    }
}

impl Valve for Solenoid {
    fn open(&mut self) -> std::result::Result<(), BoxError> {
        self.pin.set_high();
        Ok(())
    }

    fn close(&mut self) -> std::result::Result<(), BoxError> {
        self.pin.set_low();
        Ok(())
    }
}

/// Claim one solenoid per BCM pin, all closed, in the order given.
pub fn claim(pins: &[u8]) -> Result<Vec<Solenoid>> {
    let gpio = Gpio::new().map_err(|e| HwError::Gpio(e.to_string()))?;
    pins.iter().map(|&p| Solenoid::new(&gpio, p)).collect()
}
