//! Device lifecycle and the synchronous transaction core.
//!
//! Every physical module on the bus is represented by one device struct
//! embedding a [`DeviceCore`]. The core turns the asynchronous bus
//! primitive into blocking typed reads/writes (with retry, averaging and an
//! error budget) and owns the device's single background polling thread.
//!
//! Devices are move-only and shared as `Arc`: the polling thread holds one
//! clone of the handle, callers hold others. Monitor-state fields live in
//! [`MonitorPoint`]s written only by the polling thread; snapshot reads
//! across several points may observe torn state, an accepted
//! soft-real-time trade-off.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::bounded;
use parking_lot::{Mutex, RwLock};

use crate::bus::{now_ticks, BusInterface, BusRequest, BusStatus, Timestamp, TransactionMode};
use crate::codec::{unpack, Esn, Payload, WireType};
use crate::config::{FemcConfig, ReportingLevel};
use crate::error::{FemcError, FemcResult};
use crate::rca::Rca;
use crate::translog::{TransKind, TransLogEntry, TransactionLogger};

/// Fixed sleep between polling-loop iterations, regardless of work duration.
pub const POLL_QUANTUM: Duration = Duration::from_millis(5);

/// Default retry budget for [`DeviceCore::sync_monitor_with_retry`].
pub const DEFAULT_MONITOR_RETRIES: u32 = 12;

/// Stop acknowledgement wait: 250 x 100 ms.
const STOP_WAIT_SLICES: u32 = 250;
const STOP_WAIT_SLICE: Duration = Duration::from_millis(100);

/// Device lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Stopped,
    Running,
    Paused,
}

impl DeviceState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => DeviceState::Running,
            2 => DeviceState::Paused,
            _ => DeviceState::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            DeviceState::Stopped => 0,
            DeviceState::Running => 1,
            DeviceState::Paused => 2,
        }
    }
}

/// A monitored value together with the status of the read that produced it.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct Monitored<T> {
    pub value: T,
    pub status: BusStatus,
}

impl<T: Default> Default for Monitored<T> {
    fn default() -> Self {
        Monitored {
            value: T::default(),
            status: BusStatus::NotConnected,
        }
    }
}

/// Last-polled storage slot for one monitor point.
///
/// Single writer (the device's polling thread), many readers. A failed read
/// is absorbed locally: the point keeps its previous value and status.
pub struct MonitorPoint<T> {
    inner: Arc<RwLock<Monitored<T>>>,
}

impl<T: Clone + Default> MonitorPoint<T> {
    pub fn new() -> Self {
        MonitorPoint {
            inner: Arc::new(RwLock::new(Monitored::default())),
        }
    }

    pub fn get(&self) -> Monitored<T> {
        self.inner.read().clone()
    }

    pub fn set(&self, value: T, status: BusStatus) {
        *self.inner.write() = Monitored { value, status };
    }

    /// Store a successful read; a failed one leaves the cached state alone.
    pub fn store(&self, result: FemcResult<Monitored<T>>) {
        if let Ok(m) = result {
            *self.inner.write() = m;
        }
    }
}

impl<T: Clone + Default> Default for MonitorPoint<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for MonitorPoint<T> {
    fn clone(&self) -> Self {
        MonitorPoint {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// A device that can be polled in the background.
pub trait MonitorDevice: Send + Sync + 'static {
    fn core(&self) -> &DeviceCore;

    /// One polling tick. Called every 5 ms while the device is running.
    fn monitor_action(&self, timestamp: Timestamp);
}

#[derive(Clone)]
struct Coords {
    bus: Arc<dyn BusInterface>,
    channel: u32,
    node: u32,
}

/// Shared transaction substrate embedded in every device type.
///
/// Transactions are strictly sequential per device: every sync call blocks
/// the calling thread on the request's completion channel, so at most one
/// transaction of this device is in flight at any time per calling thread,
/// and the transport serializes across threads.
pub struct DeviceCore {
    name: String,
    coords: RwLock<Option<Coords>>,
    esn: RwLock<Esn>,
    state: AtomicU8,
    stop: AtomicBool,
    paused: AtomicBool,
    stopped_ack: AtomicBool,
    errors: AtomicU32,
    /// Bumped on every thread spawn; a polling thread whose epoch no longer
    /// matches has been superseded and must exit without touching the
    /// lifecycle flags.
    epoch: AtomicU32,
    config: Arc<FemcConfig>,
    logger: RwLock<Option<Arc<TransactionLogger>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceCore {
    pub fn new(name: impl Into<String>, config: Arc<FemcConfig>) -> Self {
        DeviceCore {
            name: name.into(),
            coords: RwLock::new(None),
            esn: RwLock::new(Esn::default()),
            state: AtomicU8::new(DeviceState::Stopped.as_u8()),
            stop: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            stopped_ack: AtomicBool::new(false),
            errors: AtomicU32::new(0),
            epoch: AtomicU32::new(0),
            config,
            logger: RwLock::new(None),
            thread: Mutex::new(None),
        }
    }

    /// Attach the device to the bus. Must happen before any transaction.
    pub fn initialize(&self, bus: Arc<dyn BusInterface>, channel: u32, node: u32) {
        *self.coords.write() = Some(Coords { bus, channel, node });
    }

    pub fn attach_logger(&self, logger: Arc<TransactionLogger>) {
        *self.logger.write() = Some(logger);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &FemcConfig {
        &self.config
    }

    pub fn state(&self) -> DeviceState {
        DeviceState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: DeviceState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    pub fn set_esn(&self, esn: Esn) {
        *self.esn.write() = esn;
    }

    pub fn esn(&self) -> Esn {
        *self.esn.read()
    }

    pub fn error_count(&self) -> u32 {
        self.errors.load(Ordering::SeqCst)
    }

    pub fn reset_errors(&self) {
        self.errors.store(0, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn coords(&self) -> FemcResult<Coords> {
        self.coords
            .read()
            .clone()
            .ok_or_else(|| FemcError::NotConnected(self.name.clone()))
    }

    /// Record one non-ignorable status. Past the ceiling the device
    /// auto-pauses; the counter keeps climbing until the next reset.
    fn bump_error(&self, reason: &str) {
        let count = self.errors.fetch_add(1, Ordering::SeqCst) + 1;
        if count > self.config.error_ceiling && !self.is_paused() {
            log::warn!(
                "device '{}' exceeded error ceiling ({} > {}), auto-pausing: {}",
                self.name,
                count,
                self.config.error_ceiling,
                reason
            );
            self.pause_monitor(true, "error ceiling exceeded");
        }
    }

    /// Toggle monitoring without destroying the polling thread. Un-pausing
    /// resets the error counter.
    pub fn pause_monitor(&self, pause: bool, reason: &str) {
        self.paused.store(pause, Ordering::SeqCst);
        if pause {
            if self.state() == DeviceState::Running {
                self.set_state(DeviceState::Paused);
            }
            log::info!("device '{}' monitoring paused: {}", self.name, reason);
        } else {
            self.reset_errors();
            if self.state() == DeviceState::Paused {
                self.set_state(DeviceState::Running);
            }
            log::info!("device '{}' monitoring resumed: {}", self.name, reason);
        }
    }

    /// Signal the polling thread to stop and wait (bounded, 25 s) for its
    /// acknowledgement. A thread that still has not acknowledged is
    /// abandoned with a warning; the device is usable for sync calls either
    /// way.
    pub fn stop_monitor(&self) {
        if self.thread.lock().is_none() {
            self.set_state(DeviceState::Stopped);
            return;
        }
        self.stop.store(true, Ordering::SeqCst);
        for _ in 0..STOP_WAIT_SLICES {
            if self.stopped_ack.load(Ordering::SeqCst) {
                break;
            }
            thread::sleep(STOP_WAIT_SLICE);
        }
        if !self.stopped_ack.load(Ordering::SeqCst) {
            log::warn!(
                "device '{}' polling thread did not acknowledge stop; abandoning it",
                self.name
            );
            self.abandon_polling_thread();
            return;
        }
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }

    /// Detach an unresponsive polling thread: drop its handle so the next
    /// [`start_monitor`] spawns a replacement. The epoch bump at that spawn
    /// makes the stale thread exit if it ever wakes up.
    fn abandon_polling_thread(&self) {
        self.thread.lock().take();
        self.set_state(DeviceState::Stopped);
    }

    /// Issue a monitor request and block on its completion.
    ///
    /// Transport failure increments the error counter and returns
    /// immediately; no retry happens at this level. Ignorable statuses
    /// (NoError and the two hardware warnings) never touch the counter.
    pub fn sync_monitor<T: WireType>(&self, rca: Rca) -> FemcResult<Monitored<T>> {
        let coords = self.coords()?;
        let (tx, rx) = bounded(1);
        coords.bus.submit(BusRequest {
            channel: coords.channel,
            node: coords.node,
            rca: rca.as_monitor(),
            mode: TransactionMode::Monitor,
            payload: Payload::empty(),
            completion: tx,
        });
        let reply = match rx.recv_timeout(self.config.monitor_timeout()) {
            Ok(reply) => reply,
            Err(_) => {
                self.bump_error("monitor completion never fired");
                self.log_transaction(TransKind::Monitor, rca, BusStatus::Timeout, 0, 0.0);
                return Err(FemcError::Transport(BusStatus::Timeout));
            }
        };
        if reply.status.is_transport_error() {
            self.bump_error("monitor transport error");
            self.log_transaction(TransKind::Monitor, rca, reply.status, 0, 0.0);
            return Err(FemcError::Transport(reply.status));
        }
        let reading = match unpack::<T>(&reply.payload) {
            Ok(reading) => reading,
            Err(e) => {
                self.bump_error("monitor unpack error");
                self.log_transaction(TransKind::Monitor, rca, BusStatus::ReadError, 0, 0.0);
                return Err(e.into());
            }
        };
        let status = match reply.status {
            BusStatus::NoError => BusStatus::from_hw_byte(reading.hw_status),
            other => other,
        };
        if !status.is_ignorable() {
            self.bump_error("monitor hardware error");
        }
        self.log_transaction(
            TransKind::Monitor,
            rca,
            status,
            reading.hw_status as i64,
            0.0,
        );
        Ok(Monitored {
            value: reading.value,
            status,
        })
    }

    /// [`Self::sync_monitor`] in a loop: aborts immediately on a transport
    /// error; a HardwareRetryWarning spends one unit of `retries` budget
    /// and repeats; any other outcome ends the loop.
    pub fn sync_monitor_with_retry<T: WireType>(
        &self,
        rca: Rca,
        retries: u32,
    ) -> FemcResult<Monitored<T>> {
        let mut budget = retries.max(1);
        loop {
            let monitored = self.sync_monitor::<T>(rca)?;
            if monitored.status == BusStatus::HardwareRetryWarning {
                budget -= 1;
                if budget == 0 {
                    return Ok(monitored);
                }
                continue;
            }
            return Ok(monitored);
        }
    }

    /// Average of `samples` sequential float reads. The first failed read
    /// returns early with its error; every value read before it, warnings
    /// included, had already gone into the running sum.
    pub fn sync_monitor_average(&self, rca: Rca, samples: u32) -> FemcResult<f32> {
        if samples == 0 {
            return Err(FemcError::invalid_input("average over zero samples"));
        }
        let mut sum = 0.0f32;
        for _ in 0..samples {
            sum += self.sync_monitor::<f32>(rca)?.value;
        }
        Ok(sum / samples as f32)
    }

    /// Encode and send a command, await its acknowledgement, then perform
    /// the mandatory monitor round trip to the same address. The readback
    /// value is discarded here; the round trip is the write handshake.
    pub fn sync_command<T: WireType>(&self, rca: Rca, value: &T) -> FemcResult<()> {
        let coords = self.coords()?;
        let payload = value.encode();
        let (tx, rx) = bounded(1);
        coords.bus.submit(BusRequest {
            channel: coords.channel,
            node: coords.node,
            rca: rca.as_command(),
            mode: TransactionMode::Command,
            payload,
            completion: tx,
        });
        let reply = match rx.recv_timeout(self.config.monitor_timeout()) {
            Ok(reply) => reply,
            Err(_) => {
                self.bump_error("command completion never fired");
                self.log_transaction(TransKind::Command, rca, BusStatus::Timeout, 0, 0.0);
                return Err(FemcError::Transport(BusStatus::Timeout));
            }
        };
        if reply.status.is_transport_error() {
            self.bump_error("command transport error");
            self.log_transaction(TransKind::Command, rca, reply.status, 0, 0.0);
            return Err(FemcError::Transport(reply.status));
        }
        if !reply.status.is_ignorable() {
            self.bump_error("command hardware error");
        }
        self.log_transaction(TransKind::Command, rca, reply.status, 0, 0.0);
        // Write-then-read-back handshake; the value is thrown away.
        let _ = self.sync_monitor::<Payload>(rca.as_monitor())?;
        Ok(())
    }

    /// Queue a free-form event line on the transaction logger.
    pub fn log_event(&self, text: impl Into<String>) {
        if let Some(logger) = self.logger.read().as_ref() {
            logger.insert(TransLogEntry::event(format!(
                "[{}] {}",
                self.name,
                text.into()
            )));
        }
    }

    /// Queue a CSV monitor line (one per outer interval when enabled).
    pub fn log_csv(&self, line: String) {
        if let Some(logger) = self.logger.read().as_ref() {
            logger.insert(TransLogEntry {
                timestamp: now_ticks(),
                kind: TransKind::Csv,
                text: line,
                rca: None,
                status: BusStatus::NoError,
                int_value: 0,
                float_value: 0.0,
            });
        }
    }

    fn log_transaction(
        &self,
        kind: TransKind,
        rca: Rca,
        status: BusStatus,
        int_value: i64,
        float_value: f64,
    ) {
        let verbose = self.config.reporting_level == ReportingLevel::Verbose;
        if status.is_ignorable() && !verbose {
            return;
        }
        if let Some(logger) = self.logger.read().as_ref() {
            logger.insert(TransLogEntry {
                timestamp: now_ticks(),
                kind,
                text: String::new(),
                rca: Some(rca),
                status,
                int_value,
                float_value,
            });
        }
    }
}

/// Stopped/Paused -> Running. Spawns the polling thread if absent and
/// resets the error counter.
pub fn start_monitor<D: MonitorDevice>(device: &Arc<D>) -> FemcResult<()> {
    let core = device.core();
    if core.state() == DeviceState::Running {
        return Ok(());
    }
    core.reset_errors();
    core.paused.store(false, Ordering::SeqCst);
    core.set_state(DeviceState::Running);
    let mut guard = core.thread.lock();
    if guard.is_none() {
        core.stop.store(false, Ordering::SeqCst);
        core.stopped_ack.store(false, Ordering::SeqCst);
        let epoch = core.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let dev = Arc::clone(device);
        let handle = thread::Builder::new()
            .name(format!("mon-{}", core.name()))
            .spawn(move || polling_loop(dev, epoch))?;
        *guard = Some(handle);
    }
    Ok(())
}

/// One polling thread per device: exit (with acknowledgement) when stopped,
/// skip work while paused, otherwise run the device's `monitor_action`,
/// then sleep the fixed 5 ms quantum.
fn polling_loop<D: MonitorDevice>(device: Arc<D>, epoch: u32) {
    log::debug!("polling thread for '{}' running", device.core().name());
    loop {
        let core = device.core();
        if core.epoch.load(Ordering::SeqCst) != epoch {
            // Superseded after an abandoned stop: a newer thread owns the
            // lifecycle flags now.
            break;
        }
        if core.stop.load(Ordering::SeqCst) {
            core.set_state(DeviceState::Stopped);
            core.stopped_ack.store(true, Ordering::SeqCst);
            break;
        }
        if !core.paused.load(Ordering::SeqCst) {
            device.monitor_action(now_ticks());
        }
        thread::sleep(POLL_QUANTUM);
    }
    log::debug!("polling thread for '{}' exited", device.core().name());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::sim::SimulatedBus;
    use crate::codec::WireType;
    use std::sync::atomic::AtomicUsize;

    fn rigged_core(bus: &Arc<SimulatedBus>) -> DeviceCore {
        let core = DeviceCore::new("test", Arc::new(FemcConfig::default()));
        core.initialize(Arc::clone(bus) as Arc<dyn BusInterface>, 0, 0x13);
        core
    }

    #[test]
    fn sync_monitor_decodes_and_keeps_counter_clean() {
        let bus = Arc::new(SimulatedBus::new());
        let rca = Rca::new(0x3008);
        bus.set_monitor(rca, 4.25f32);
        let core = rigged_core(&bus);
        let m = core.sync_monitor::<f32>(rca).unwrap();
        assert_eq!(m.value, 4.25);
        assert_eq!(m.status, BusStatus::NoError);
        assert_eq!(core.error_count(), 0);
    }

    #[test]
    fn ignorable_statuses_do_not_feed_the_budget() {
        let bus = Arc::new(SimulatedBus::new());
        let rca = Rca::new(0x3008);
        let mut warn = 1.0f32.encode();
        warn.push(crate::bus::HW_UPDATE_WARNING as u8);
        bus.set_monitor_payload(rca, warn, BusStatus::NoError);
        let core = rigged_core(&bus);
        let m = core.sync_monitor::<f32>(rca).unwrap();
        assert_eq!(m.status, BusStatus::HardwareUpdateWarning);
        assert_eq!(core.error_count(), 0);
    }

    #[test]
    fn transport_error_increments_and_returns_immediately() {
        let bus = Arc::new(SimulatedBus::new());
        let rca = Rca::new(0x3008);
        // No scripted point: the sim answers Timeout.
        let core = rigged_core(&bus);
        let err = core.sync_monitor::<f32>(rca).unwrap_err();
        assert!(matches!(err, FemcError::Transport(BusStatus::Timeout)));
        assert_eq!(core.error_count(), 1);
        assert_eq!(bus.monitor_count(), 1);
    }

    #[test]
    fn retry_spends_budget_on_retry_warnings_only() {
        let bus = Arc::new(SimulatedBus::new());
        let rca = Rca::new(0x3008);
        let mut retry = 1.0f32.encode();
        retry.push(crate::bus::HW_RETRY_WARNING as u8);
        bus.set_monitor_payload(rca, retry, BusStatus::NoError);
        let core = rigged_core(&bus);
        let m = core
            .sync_monitor_with_retry::<f32>(rca, DEFAULT_MONITOR_RETRIES)
            .unwrap();
        // Budget exhausted without success: the warning surfaces.
        assert_eq!(m.status, BusStatus::HardwareRetryWarning);
        assert_eq!(bus.monitor_count(), DEFAULT_MONITOR_RETRIES as u64);
    }

    #[test]
    fn retry_stops_at_first_non_retry_status() {
        let bus = Arc::new(SimulatedBus::new());
        let rca = Rca::new(0x3008);
        let mut retry = 1.0f32.encode();
        retry.push(crate::bus::HW_RETRY_WARNING as u8);
        bus.script_monitor(
            rca,
            vec![
                (retry, BusStatus::NoError),
                (retry, BusStatus::NoError),
                (2.0f32.encode(), BusStatus::NoError),
            ],
        );
        let core = rigged_core(&bus);
        let m = core.sync_monitor_with_retry::<f32>(rca, 12).unwrap();
        assert_eq!(m.value, 2.0);
        assert_eq!(m.status, BusStatus::NoError);
        assert_eq!(bus.monitor_count(), 3);
    }

    #[test]
    fn retry_aborts_on_transport_error() {
        let bus = Arc::new(SimulatedBus::new());
        let rca = Rca::new(0x3008);
        let mut retry = 1.0f32.encode();
        retry.push(crate::bus::HW_RETRY_WARNING as u8);
        bus.script_monitor(
            rca,
            vec![
                (retry, BusStatus::NoError),
                (Payload::empty(), BusStatus::ReadError),
            ],
        );
        let core = rigged_core(&bus);
        let err = core.sync_monitor_with_retry::<f32>(rca, 12).unwrap_err();
        assert!(matches!(err, FemcError::Transport(BusStatus::ReadError)));
        assert_eq!(bus.monitor_count(), 2);
    }

    #[test]
    fn average_of_scripted_readings() {
        let bus = Arc::new(SimulatedBus::new());
        let rca = Rca::new(0x3010);
        bus.script_monitor_f32(rca, &[1.0, 2.0, 3.0, 6.0]);
        let core = rigged_core(&bus);
        assert_eq!(core.sync_monitor_average(rca, 4).unwrap(), 3.0);
    }

    #[test]
    fn average_returns_early_on_error() {
        let bus = Arc::new(SimulatedBus::new());
        let rca = Rca::new(0x3010);
        bus.script_monitor(
            rca,
            vec![
                (1.0f32.encode(), BusStatus::NoError),
                (2.0f32.encode(), BusStatus::NoError),
                (Payload::empty(), BusStatus::Timeout),
            ],
        );
        let core = rigged_core(&bus);
        let err = core.sync_monitor_average(rca, 5).unwrap_err();
        assert!(matches!(err, FemcError::Transport(BusStatus::Timeout)));
        assert_eq!(bus.monitor_count(), 3);
    }

    #[test]
    fn command_performs_mandatory_readback() {
        let bus = Arc::new(SimulatedBus::new());
        let rca = Rca::new(0x3008);
        let core = rigged_core(&bus);
        core.sync_command(rca, &1.5f32).unwrap();
        assert_eq!(bus.commands_for(rca), vec![1.5f32.encode()]);
        // One command plus exactly one readback monitor.
        assert_eq!(bus.monitor_count(), 1);
    }

    #[test]
    fn error_budget_auto_pauses_past_ceiling() {
        let bus = Arc::new(SimulatedBus::new());
        let rca = Rca::new(0x3008);
        let config = Arc::new(FemcConfig {
            error_ceiling: 3,
            ..FemcConfig::default()
        });
        let core = DeviceCore::new("budget", config);
        core.initialize(Arc::clone(&bus) as Arc<dyn BusInterface>, 0, 0x13);
        for _ in 0..3 {
            let _ = core.sync_monitor::<f32>(rca);
            assert!(!core.is_paused());
        }
        let _ = core.sync_monitor::<f32>(rca);
        assert!(core.is_paused());
        assert_eq!(core.error_count(), 4);
        // Un-pausing resets the budget.
        core.pause_monitor(false, "operator resume");
        assert_eq!(core.error_count(), 0);
    }

    struct TickCounter {
        core: DeviceCore,
        ticks: AtomicUsize,
    }

    impl MonitorDevice for TickCounter {
        fn core(&self) -> &DeviceCore {
            &self.core
        }

        fn monitor_action(&self, _timestamp: Timestamp) {
            self.ticks.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn polling_lifecycle_start_pause_stop() {
        let bus = Arc::new(SimulatedBus::new());
        let device = Arc::new(TickCounter {
            core: rigged_core(&bus),
            ticks: AtomicUsize::new(0),
        });
        start_monitor(&device).unwrap();
        assert_eq!(device.core().state(), DeviceState::Running);
        thread::sleep(Duration::from_millis(60));
        let ticked = device.ticks.load(Ordering::SeqCst);
        assert!(ticked > 0, "polling thread never ticked");

        device.core().pause_monitor(true, "test pause");
        assert_eq!(device.core().state(), DeviceState::Paused);
        thread::sleep(Duration::from_millis(30));
        let paused_at = device.ticks.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(40));
        assert_eq!(device.ticks.load(Ordering::SeqCst), paused_at);

        // Resuming does not respawn the thread, just unpauses it.
        start_monitor(&device).unwrap();
        thread::sleep(Duration::from_millis(40));
        assert!(device.ticks.load(Ordering::SeqCst) > paused_at);

        device.core().stop_monitor();
        assert_eq!(device.core().state(), DeviceState::Stopped);
    }

    struct WedgedOnce {
        core: DeviceCore,
        release: crossbeam_channel::Receiver<()>,
        ticks: AtomicUsize,
    }

    impl MonitorDevice for WedgedOnce {
        fn core(&self) -> &DeviceCore {
            &self.core
        }

        fn monitor_action(&self, _timestamp: Timestamp) {
            // The very first tick blocks until the test releases it,
            // standing in for a device wedged inside a bus transaction.
            if self.ticks.fetch_add(1, Ordering::SeqCst) == 0 {
                let _ = self.release.recv();
            }
        }
    }

    #[test]
    fn restart_after_abandoned_stop_spawns_a_fresh_thread() {
        let bus = Arc::new(SimulatedBus::new());
        let (release_tx, release_rx) = bounded::<()>(1);
        let device = Arc::new(WedgedOnce {
            core: rigged_core(&bus),
            release: release_rx,
            ticks: AtomicUsize::new(0),
        });
        start_monitor(&device).unwrap();
        for _ in 0..1000 {
            if device.ticks.load(Ordering::SeqCst) > 0 {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        assert!(device.ticks.load(Ordering::SeqCst) > 0);

        // What stop_monitor does once its bounded wait expires without an
        // acknowledgement.
        device.core().stop.store(true, Ordering::SeqCst);
        device.core().abandon_polling_thread();
        assert_eq!(device.core().state(), DeviceState::Stopped);

        // Restarting must spawn a replacement that actually polls.
        start_monitor(&device).unwrap();
        assert_eq!(device.core().state(), DeviceState::Running);
        let before = device.ticks.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        assert!(
            device.ticks.load(Ordering::SeqCst) > before,
            "replacement thread never polled"
        );

        // The wedged thread wakes, finds itself superseded and exits
        // without flipping the state back.
        release_tx.send(()).unwrap();
        thread::sleep(Duration::from_millis(40));
        assert_eq!(device.core().state(), DeviceState::Running);

        device.core().stop_monitor();
        assert_eq!(device.core().state(), DeviceState::Stopped);
    }
}
