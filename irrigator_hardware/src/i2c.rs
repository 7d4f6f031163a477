use std::sync::{Arc, Mutex, MutexGuard};

use rppal::i2c::I2c;

use crate::error::{HwError, Result};

/// One physical I2C bus shared by the mux driver and the amplifier driver.
///
/// Both halves address different slaves, so every access re-selects the
/// slave address while holding the lock.
#[derive(Clone)]
pub struct SharedI2c {
    inner: Arc<Mutex<I2c>>,
}

impl SharedI2c {
    pub fn open(bus: u8) -> Result<Self> {
        let i2c = I2c::with_bus(bus).map_err(|e| HwError::I2c(format!("open i2c-{bus}: {e}")))?;
        Ok(Self {
            inner: Arc::new(Mutex::new(i2c)),
        })
    }

    /// Lock the bus and select `addr` as the slave for the guard's lifetime.
    pub fn select(&self, addr: u8) -> Result<MutexGuard<'_, I2c>> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| HwError::I2c("i2c bus lock poisoned".into()))?;
        guard
            .set_slave_address(u16::from(addr))
            .map_err(|e| HwError::I2c(e.to_string()))?;
        Ok(guard)
    }
}
