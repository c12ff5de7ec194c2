//! Process-wide configuration.
//!
//! One `FemcConfig` is built at startup and handed `Arc`-shared to every
//! device; nothing in this crate reads ambient global state.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How chatty the transaction logger is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum ReportingLevel {
    /// Errors and warnings only.
    Quiet,
    #[default]
    Normal,
    /// Every transaction.
    Verbose,
}

/// Process-wide settings shared by all devices.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FemcConfig {
    /// Emit the per-device CSV monitor line each outer interval.
    pub log_monitors: bool,
    /// Add noise to simulated analog monitor points.
    pub randomize_analog: bool,
    pub reporting_level: ReportingLevel,
    /// Non-ignorable statuses tolerated before a device auto-pauses.
    pub error_ceiling: u32,
    /// Upper bound on the completion-channel wait; the transport is
    /// expected to time out well before this.
    pub monitor_timeout_ms: u64,
}

impl Default for FemcConfig {
    fn default() -> Self {
        FemcConfig {
            log_monitors: false,
            randomize_analog: false,
            reporting_level: ReportingLevel::Normal,
            error_ceiling: 10,
            monitor_timeout_ms: 2000,
        }
    }
}

impl FemcConfig {
    pub fn monitor_timeout(&self) -> Duration {
        Duration::from_millis(self.monitor_timeout_ms)
    }
}
