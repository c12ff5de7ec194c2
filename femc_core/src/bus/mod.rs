//! Bus transport abstraction.
//!
//! The physical bus is asynchronous: a request is submitted with a
//! completion channel and the transport fires it exactly once with the
//! reply. The transport serializes concurrent requests itself; this layer
//! takes no bus-wide lock. [`crate::device::DeviceCore`] turns the
//! primitive into blocking typed reads and writes.

pub mod sim;

use std::fmt;
use std::sync::OnceLock;
use std::time::Instant;

use crossbeam_channel::Sender;
use serde::Serialize;

use crate::codec::Payload;
use crate::rca::Rca;

/// Monotonic transaction timestamp in 100 ns ticks.
pub type Timestamp = u64;

/// Current monotonic timestamp, 100 ns ticks since process start.
pub fn now_ticks() -> Timestamp {
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    (start.elapsed().as_nanos() / 100) as u64
}

/// In-band hardware status codes carried in the trailing payload byte.
pub const HW_NO_ERROR: i8 = 0;
pub const HW_UPDATE_WARNING: i8 = -4;
pub const HW_RETRY_WARNING: i8 = -6;

/// Outcome of a single bus transaction.
///
/// `NoError` and the two hardware warnings are "ignorable": the data is
/// usable (or retryable) and they never feed the device error budget.
/// Everything from `Timeout` down is a transport error that aborts the
/// current operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BusStatus {
    NoError,
    /// Firmware flagged the point as not freshly updated; data still usable.
    HardwareUpdateWarning,
    /// Firmware asks for the request to be repeated.
    HardwareRetryWarning,
    /// Any other in-band hardware error code.
    HardwareError(i8),
    Timeout,
    BadChannel,
    BadDevice,
    InitFailed,
    ReadError,
    WriteError,
    NotConnected,
}

impl BusStatus {
    /// Statuses that never increment the device error counter.
    pub fn is_ignorable(self) -> bool {
        matches!(
            self,
            BusStatus::NoError
                | BusStatus::HardwareUpdateWarning
                | BusStatus::HardwareRetryWarning
        )
    }

    /// Transport-level failures: abort the current operation, no retry.
    pub fn is_transport_error(self) -> bool {
        matches!(
            self,
            BusStatus::Timeout
                | BusStatus::BadChannel
                | BusStatus::BadDevice
                | BusStatus::InitFailed
                | BusStatus::ReadError
                | BusStatus::WriteError
                | BusStatus::NotConnected
        )
    }

    /// Map the trailing in-band status byte to a status.
    pub fn from_hw_byte(code: i8) -> Self {
        match code {
            HW_NO_ERROR => BusStatus::NoError,
            HW_UPDATE_WARNING => BusStatus::HardwareUpdateWarning,
            HW_RETRY_WARNING => BusStatus::HardwareRetryWarning,
            other => BusStatus::HardwareError(other),
        }
    }
}

impl fmt::Display for BusStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusStatus::HardwareError(code) => write!(f, "HardwareError({})", code),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Direction of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransactionMode {
    Monitor,
    Command,
}

/// A single bus request. Created per call, consumed once, never retained.
pub struct BusRequest {
    /// Bus channel the target module lives on.
    pub channel: u32,
    /// Node address of the target module.
    pub node: u32,
    pub rca: Rca,
    pub mode: TransactionMode,
    pub payload: Payload,
    /// Fired exactly once by the transport with the reply.
    pub completion: Sender<BusReply>,
}

/// Reply delivered through the completion channel.
#[derive(Debug, Clone)]
pub struct BusReply {
    pub payload: Payload,
    pub timestamp: Timestamp,
    pub status: BusStatus,
}

/// The asynchronous bus primitive. Implementations must fire the
/// completion channel exactly once per request and are trusted to
/// serialize concurrent requests safely.
pub trait BusInterface: Send + Sync {
    fn submit(&self, request: BusRequest);
}
