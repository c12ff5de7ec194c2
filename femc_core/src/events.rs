//! Feedback channel for long-running control processes.
//!
//! Heating, pump-down and IV sweeps never throw across their worker-thread
//! boundary; they report through an [`EventSink`] as a stream of
//! status messages (ok/error tag + text) and numeric progress (0-100).

use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::Serialize;

/// Receives control-process feedback. Implementations must be cheap; they
/// are called from inside control loops.
pub trait EventSink: Send + Sync {
    fn status(&self, ok: bool, text: &str);
    fn progress(&self, percent: u8);
}

/// Discards all feedback.
pub struct NullSink;

impl EventSink for NullSink {
    fn status(&self, _ok: bool, _text: &str) {}
    fn progress(&self, _percent: u8) {}
}

/// One feedback event, as carried by [`ChannelSink`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ControlEvent {
    Status { ok: bool, text: String },
    Progress(u8),
}

/// Forwards feedback over a crossbeam channel; the test suites and any
/// telemetry frontend consume the receiver.
pub struct ChannelSink {
    tx: Sender<ControlEvent>,
}

impl ChannelSink {
    pub fn new() -> (Arc<Self>, Receiver<ControlEvent>) {
        let (tx, rx) = unbounded();
        (Arc::new(ChannelSink { tx }), rx)
    }
}

impl EventSink for ChannelSink {
    fn status(&self, ok: bool, text: &str) {
        let _ = self.tx.send(ControlEvent::Status {
            ok,
            text: text.to_string(),
        });
    }

    fn progress(&self, percent: u8) {
        let _ = self.tx.send(ControlEvent::Progress(percent));
    }
}

/// Routes feedback into the `log` facade.
pub struct LogSink {
    pub process: &'static str,
}

impl EventSink for LogSink {
    fn status(&self, ok: bool, text: &str) {
        if ok {
            log::info!("[{}] {}", self.process, text);
        } else {
            log::error!("[{}] {}", self.process, text);
        }
    }

    fn progress(&self, percent: u8) {
        log::debug!("[{}] progress {}%", self.process, percent);
    }
}
