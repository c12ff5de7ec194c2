//! # femc_core
//!
//! Transaction substrate for a cryogenic millimeter-wave receiver's
//! front-end monitor and control bus. Every hardware module (cold
//! cartridges, LO synthesizers, cryostat, compressor, IF switch, power
//! distribution, thermal interlock, LO reference transmission) is a node on
//! a shared asynchronous command/response bus addressed by 24-bit RCAs.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **rca**: address values and the fixed-priority subsystem classifier
//! - **codec**: typed encode/decode of 0-8 byte bus payloads
//! - **bus**: the async transport abstraction plus a scripted simulator
//! - **device**: synchronous monitor/command wrappers (retry, averaging,
//!   error budget, pause) and the per-device background polling thread
//! - **registry**: round-robin (storage, poll-fn) lists drained one entry
//!   per polling tick
//! - **translog**: lock-light circular transaction log with a background
//!   drain thread
//! - **events**: status/progress feedback for long-running control
//!   processes
//!
//! Device control state machines live in the `femc_devices` crate.

pub mod bus;
pub mod codec;
pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod rca;
pub mod registry;
pub mod translog;

pub use bus::{now_ticks, BusInterface, BusReply, BusRequest, BusStatus, Timestamp, TransactionMode};
pub use codec::{unpack, CodecError, Esn, Payload, Reading, Revision, WireString, WireType};
pub use config::{FemcConfig, ReportingLevel};
pub use device::{
    start_monitor, DeviceCore, DeviceState, MonitorDevice, MonitorPoint, Monitored,
    DEFAULT_MONITOR_RETRIES, POLL_QUANTUM,
};
pub use error::{FemcError, FemcResult};
pub use events::{ChannelSink, ControlEvent, EventSink, LogSink, NullSink};
pub use rca::{Rca, RcaClass, RcaDecode};
pub use registry::MonitorRegistry;
pub use translog::{TransKind, TransLogEntry, TransactionLogger, LOG_CAPACITY};
