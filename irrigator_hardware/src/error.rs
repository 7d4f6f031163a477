use thiserror::Error;

#[derive(Debug, Error)]
pub enum HwError {
    #[error("i2c error: {0}")]
    I2c(String),
    #[error("gpio error: {0}")]
    Gpio(String),
    #[error("no acknowledge from device at 0x{addr:02x}")]
    NoAck { addr: u8 },
    #[error("several mux channels active at once ({active} channels)")]
    BusContention { active: usize },
    #[error("amplifier conversion timeout")]
    Timeout,
    #[error("amplifier calibration failed")]
    CalibrationFailed,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HwError>;
