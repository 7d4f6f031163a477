use irrigator_traits::{BoxError, MuxDriver};
use tracing::trace;

use crate::error::HwError;
use crate::i2c::SharedI2c;

/// TCA9548A 8-channel I2C switch. The whole device is one control byte.
pub struct Tca9548a {
    i2c: SharedI2c,
}

impl Tca9548a {
    pub fn new(i2c: SharedI2c) -> Self {
        Self { i2c }
    }
}

impl MuxDriver for Tca9548a {
    fn read_control(&mut self, addr: u8) -> Result<u8, BoxError> {
        let mut bus = self.i2c.select(addr)?;
        let mut buf = [0u8; 1];
        bus.read(&mut buf).map_err(|_| HwError::NoAck { addr })?;
        trace!(mux = addr, control = buf[0], "tca9548a read");
        Ok(buf[0])
    }

    fn write_control(&mut self, addr: u8, mask: u8) -> Result<(), BoxError> {
        let mut bus = self.i2c.select(addr)?;
        bus.write(&[mask]).map_err(|_| HwError::NoAck { addr })?;
        trace!(mux = addr, control = mask, "tca9548a write");
        Ok(())
    }
}
