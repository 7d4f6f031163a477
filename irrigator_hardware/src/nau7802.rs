use std::time::Duration;

use irrigator_traits::{Amplifier, BoxError};
use tracing::{debug, trace};

use crate::error::{HwError, Result};
use crate::i2c::SharedI2c;
use crate::util::{sign_extend_24, wait_until_with_timeout};

/// Fixed bus address of every NAU7802.
pub const NAU7802_ADDR: u8 = 0x2A;

mod reg {
    pub const PU_CTRL: u8 = 0x00;
    pub const CTRL1: u8 = 0x01;
    pub const CTRL2: u8 = 0x02;
    pub const ADCO_B2: u8 = 0x12;
    pub const ADC: u8 = 0x15;
    pub const PGA_PWR: u8 = 0x1C;
}

mod pu_ctrl {
    pub const RR: u8 = 0;
    pub const PUD: u8 = 1;
    pub const PUA: u8 = 2;
    pub const PUR: u8 = 3;
    pub const CR: u8 = 5;
    pub const AVDDS: u8 = 7;
}

const LDO_3V3: u8 = 0b100;
const GAIN_128: u8 = 0b111;
const SPS_80: u8 = 0b011;
const CTRL2_CALS: u8 = 2;
const CTRL2_CAL_ERR: u8 = 3;
const PGA_PWR_CAP_EN: u8 = 7;

const POLL: Duration = Duration::from_micros(500);

/// NAU7802 24-bit load-cell amplifier, reached through whichever mux
/// channel is currently enabled.
pub struct Nau7802 {
    i2c: SharedI2c,
}

impl Nau7802 {
    pub fn new(i2c: SharedI2c) -> Self {
        Self { i2c }
    }

    fn read_reg(&self, r: u8) -> Result<u8> {
        let bus = self.i2c.select(NAU7802_ADDR)?;
        bus.smbus_read_byte(r)
            .map_err(|_| HwError::NoAck { addr: NAU7802_ADDR })
    }

    fn write_reg(&self, r: u8, value: u8) -> Result<()> {
        let bus = self.i2c.select(NAU7802_ADDR)?;
        bus.smbus_write_byte(r, value)
            .map_err(|e| HwError::I2c(e.to_string()))
    }

    fn set_bit(&self, r: u8, bit: u8, on: bool) -> Result<()> {
        let v = self.read_reg(r)?;
        let v = if on { v | (1 << bit) } else { v & !(1 << bit) };
        self.write_reg(r, v)
    }

    fn bit(&self, r: u8, bit: u8) -> Result<bool> {
        Ok(self.read_reg(r)? & (1 << bit) != 0)
    }

    fn update_field(&self, r: u8, mask: u8, value: u8) -> Result<()> {
        let v = self.read_reg(r)?;
        self.write_reg(r, (v & !mask) | (value & mask))
    }

    fn power_up(&self) -> Result<()> {
        self.set_bit(reg::PU_CTRL, pu_ctrl::RR, true)?;
        std::thread::sleep(Duration::from_millis(1));
        self.set_bit(reg::PU_CTRL, pu_ctrl::RR, false)?;
        self.set_bit(reg::PU_CTRL, pu_ctrl::PUD, true)?;
        self.set_bit(reg::PU_CTRL, pu_ctrl::PUA, true)?;
        wait_until_with_timeout(
            || self.bit(reg::PU_CTRL, pu_ctrl::PUR),
            Duration::from_millis(200),
            POLL,
        )
    }

    fn configure(&self) -> Result<()> {
        self.update_field(reg::CTRL1, 0b0011_1000, LDO_3V3 << 3)?;
        self.set_bit(reg::PU_CTRL, pu_ctrl::AVDDS, true)?;
        self.update_field(reg::CTRL1, 0b0000_0111, GAIN_128)?;
        self.update_field(reg::CTRL2, 0b0111_0000, SPS_80 << 4)?;
        // Turn off CLK_CHP; required for stable readings.
        self.update_field(reg::ADC, 0b0011_0000, 0b0011_0000)?;
        self.set_bit(reg::PGA_PWR, PGA_PWR_CAP_EN, true)
    }

    fn calibrate_afe(&self) -> Result<()> {
        self.set_bit(reg::CTRL2, CTRL2_CALS, true)?;
        wait_until_with_timeout(
            || Ok(!self.bit(reg::CTRL2, CTRL2_CALS)?),
            Duration::from_secs(1),
            Duration::from_millis(1),
        )?;
        if self.bit(reg::CTRL2, CTRL2_CAL_ERR)? {
            return Err(HwError::CalibrationFailed);
        }
        Ok(())
    }
}

impl Amplifier for Nau7802 {
    fn begin(&mut self) -> std::result::Result<bool, BoxError> {
        if self.read_reg(reg::PU_CTRL).is_err() {
            return Ok(false);
        }
        self.power_up()?;
        self.configure()?;
        self.calibrate_afe()?;
        debug!("nau7802 initialised");
        Ok(true)
    }

    fn read_raw(&mut self, timeout: Duration) -> std::result::Result<i32, BoxError> {
        wait_until_with_timeout(|| self.bit(reg::PU_CTRL, pu_ctrl::CR), timeout, POLL)?;
        let bus = self.i2c.select(NAU7802_ADDR)?;
        let mut buf = [0u8; 3];
        bus.write_read(&[reg::ADCO_B2], &mut buf)
            .map_err(|e| HwError::I2c(e.to_string()))?;
        let raw = sign_extend_24(buf[0], buf[1], buf[2]);
        trace!(raw, "nau7802 raw read");
        Ok(raw)
    }
}
