//! Lock-light transaction logging.
//!
//! Hot transaction paths must never block on log I/O. Producers drop
//! entries into a bounded circular buffer under a mutex that guards index
//! bookkeeping only; one background thread drains contiguous runs, formats
//! them (with the address classifier's cartridge summary) and emits them
//! through the `log` facade.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::bus::{BusStatus, Timestamp};
use crate::rca::Rca;

/// Circular buffer capacity.
pub const LOG_CAPACITY: usize = 4000;

/// Stop acknowledgement wait: 250 x 100 ms.
const STOP_WAIT_SLICES: u32 = 250;
const STOP_WAIT_SLICE: Duration = Duration::from_millis(100);

/// Idle sleep between drain passes.
const DRAIN_IDLE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransKind {
    Monitor,
    Command,
    /// Free-form device event text.
    Event,
    /// One per-device CSV monitor line.
    Csv,
}

/// One logged transaction. Produced by any device task, consumed exactly
/// once by the drain thread.
#[derive(Debug, Clone)]
pub struct TransLogEntry {
    pub timestamp: Timestamp,
    pub kind: TransKind,
    pub text: String,
    pub rca: Option<Rca>,
    pub status: BusStatus,
    pub int_value: i64,
    pub float_value: f64,
}

impl TransLogEntry {
    pub fn event(text: impl Into<String>) -> Self {
        TransLogEntry {
            timestamp: crate::bus::now_ticks(),
            kind: TransKind::Event,
            text: text.into(),
            rca: None,
            status: BusStatus::NoError,
            int_value: 0,
            float_value: 0.0,
        }
    }

    fn format(&self) -> String {
        let stamp = chrono::Local::now().format("%H:%M:%S%.3f");
        let mut line = format!("{} {:?}", stamp, self.kind);
        if let Some(rca) = self.rca {
            let decode = rca.decode();
            line.push_str(&format!(" {} {}", rca, decode.class.tag()));
            if let Some(cart) = rca.cartridge() {
                line.push_str(&format!(" cart={}", cart));
            }
        }
        line.push_str(&format!(
            " status={} i={} f={:.6}",
            self.status, self.int_value, self.float_value
        ));
        if !self.text.is_empty() {
            line.push(' ');
            line.push_str(&self.text);
        }
        line
    }
}

/// Bounded circular queue plus background drain.
pub struct TransactionLogger {
    slots: Vec<Mutex<Option<TransLogEntry>>>,
    /// Index bookkeeping only; entry payloads go through the slot locks.
    next_insert: Mutex<usize>,
    drain_cursor: Mutex<usize>,
    stop: AtomicBool,
    stopped_ack: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TransactionLogger {
    pub fn new() -> Arc<Self> {
        let mut slots = Vec::with_capacity(LOG_CAPACITY);
        slots.resize_with(LOG_CAPACITY, || Mutex::new(None));
        Arc::new(TransactionLogger {
            slots,
            next_insert: Mutex::new(0),
            drain_cursor: Mutex::new(0),
            stop: AtomicBool::new(false),
            stopped_ack: AtomicBool::new(false),
            thread: Mutex::new(None),
        })
    }

    /// Queue an entry. Never blocks on I/O; a still-occupied target slot
    /// means the buffer is full and the entry is dropped with a warning.
    pub fn insert(&self, entry: TransLogEntry) {
        let idx = {
            let mut next = self.next_insert.lock();
            let idx = *next;
            *next = (idx + 1) % LOG_CAPACITY;
            idx
        };
        let mut slot = self.slots[idx].lock();
        if slot.is_some() {
            log::warn!("transaction log buffer full, dropping entry at slot {}", idx);
            return;
        }
        *slot = Some(entry);
    }

    /// Spawn the drain thread. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.thread.lock();
        if guard.is_some() {
            return;
        }
        self.stop.store(false, Ordering::SeqCst);
        self.stopped_ack.store(false, Ordering::SeqCst);
        let logger = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("translog-drain".into())
            .spawn(move || logger.drain_loop())
            .expect("failed to spawn transaction log drain thread");
        *guard = Some(handle);
    }

    /// Signal stop and wait (bounded) for the drain thread to acknowledge.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        for _ in 0..STOP_WAIT_SLICES {
            if self.stopped_ack.load(Ordering::SeqCst) {
                break;
            }
            thread::sleep(STOP_WAIT_SLICE);
        }
        if !self.stopped_ack.load(Ordering::SeqCst) {
            log::warn!("transaction log drain thread did not stop in time");
        }
        if let Some(handle) = self.thread.lock().take() {
            if self.stopped_ack.load(Ordering::SeqCst) {
                let _ = handle.join();
            }
        }
    }

    fn drain_loop(&self) {
        loop {
            if self.stop.load(Ordering::SeqCst) {
                // Flush whatever is queued before acknowledging.
                self.drain_once();
                self.stopped_ack.store(true, Ordering::SeqCst);
                break;
            }
            if self.drain_once() == 0 {
                // Idle: sleep in slices so shutdown stays responsive.
                for _ in 0..20 {
                    if self.stop.load(Ordering::SeqCst) {
                        break;
                    }
                    thread::sleep(DRAIN_IDLE / 20);
                }
            }
        }
    }

    /// Drain the contiguous run starting at the cursor, stopping early at
    /// the first empty slot. Handles insert/drain interleaving near
    /// wraparound: an empty slot simply ends this pass.
    pub fn drain_once(&self) -> usize {
        let mut cursor = self.drain_cursor.lock();
        let mut drained = 0;
        for _ in 0..LOG_CAPACITY {
            let entry = {
                let mut slot = self.slots[*cursor].lock();
                match slot.take() {
                    Some(entry) => entry,
                    None => break,
                }
            };
            self.emit(&entry);
            *cursor = (*cursor + 1) % LOG_CAPACITY;
            drained += 1;
        }
        drained
    }

    fn emit(&self, entry: &TransLogEntry) {
        let line = entry.format();
        if entry.status.is_ignorable() {
            log::info!("{}", line);
        } else {
            log::warn!("{}", line);
        }
    }

    /// Number of occupied slots (test support).
    pub fn queued(&self) -> usize {
        self.slots.iter().filter(|s| s.lock().is_some()).count()
    }
}
