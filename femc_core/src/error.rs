//! Unified error handling for the front-end control substrate.
//!
//! Every fallible operation in this crate and in the device crates built on
//! top of it returns [`FemcResult`]. Transport-level failures carry the bus
//! status that produced them so callers can distinguish a timed-out node from
//! a payload that failed to decode.

use thiserror::Error;

use crate::bus::BusStatus;
use crate::codec::CodecError;

/// Main error type for front-end control operations.
#[derive(Debug, Error)]
pub enum FemcError {
    /// The bus transport reported a failure for a transaction.
    #[error("bus transport error: {0}")]
    Transport(BusStatus),

    /// A monitor payload could not be decoded.
    #[error("unpack error: {0}")]
    Codec(#[from] CodecError),

    /// The device has not been initialized with bus coordinates.
    #[error("device not connected: {0}")]
    NotConnected(String),

    /// Device-level errors (lifecycle, hardware refusal, bad readings).
    #[error("device '{device}' error: {message}")]
    Device { device: String, message: String },

    /// Invalid input/argument errors.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A single-instance control process is already running.
    #[error("operation already in progress: {0}")]
    Busy(String),

    /// A control process was cancelled through its stop flag.
    #[error("operation aborted: {0}")]
    Aborted(String),

    /// Wall-clock timeout expired before the operation completed.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// I/O related errors (control-process log files).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias for Results using FemcError.
pub type FemcResult<T> = std::result::Result<T, FemcError>;

// Helper constructors
impl FemcError {
    /// Create a device error with device name and message.
    pub fn device<S: Into<String>, T: Into<String>>(device: S, message: T) -> Self {
        FemcError::Device {
            device: device.into(),
            message: message.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        FemcError::InvalidInput(msg.into())
    }

    /// Create an aborted error.
    pub fn aborted<S: Into<String>>(msg: S) -> Self {
        FemcError::Aborted(msg.into())
    }

    /// Create a timeout error.
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        FemcError::Timeout(msg.into())
    }

    /// True when the error came from the bus transport layer.
    pub fn is_transport(&self) -> bool {
        matches!(self, FemcError::Transport(_))
    }
}
