use std::path::PathBuf;

use irrigator_config::{MuxAddress, ScaleKey};
use thiserror::Error;

/// A device on the I2C bus misbehaved. Always scoped to one mux or scale so
/// the controller can skip it and carry on with the rest.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("mux {addr} did not acknowledge: {reason}")]
    Mux { addr: MuxAddress, reason: String },
    #[error("amplifier on {key} failed: {reason}")]
    Amplifier { key: ScaleKey, reason: String },
    #[error("no amplifier answered on {0}")]
    NotConnected(ScaleKey),
    #[error("amplifier on {0} timed out")]
    Timeout(ScaleKey),
}

impl BusError {
    /// The mux this error should be charged to, if the mux itself failed.
    pub fn failed_mux(&self) -> Option<MuxAddress> {
        match self {
            Self::Mux { addr, .. } => Some(*addr),
            _ => None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum IrrigationError {
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
    #[error("no calibration stored for scale {0}")]
    CalibrationMissing(ScaleKey),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("valve {valve}: {reason}")]
    Valve { valve: String, reason: String },
    #[error("invalid state: {0}")]
    State(String),
}

/// Failures of the calibration file and the two logs.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed {}: {reason}", path.display())]
    Parse { path: PathBuf, reason: String },
}

impl StoreError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound(path.to_path_buf())
        } else {
            Self::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }

    pub(crate) fn parse(path: &std::path::Path, reason: impl std::fmt::Display) -> Self {
        Self::Parse {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }
}

impl From<StoreError> for IrrigationError {
    fn from(e: StoreError) -> Self {
        IrrigationError::Io(e.to_string())
    }
}

pub type Result<T> = eyre::Result<T>;
pub use eyre::Report;
