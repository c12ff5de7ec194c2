//! Cryostat monitoring and the pump-down sequence.
//!
//! The cryostat module exposes thirteen temperature sensors, two vacuum
//! gauges, the gate and solenoid valves and the turbo/backing pump
//! switches. Pump-down waits for the cold stages to drop below a switch
//! temperature, then closes the valves and spins the pumps down in order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use femc_core::bus::Timestamp;
use femc_core::device::{DeviceCore, MonitorDevice, MonitorPoint, Monitored};
use femc_core::error::{FemcError, FemcResult};
use femc_core::events::EventSink;
use femc_core::rca::Rca;
use femc_core::registry::MonitorRegistry;
use femc_core::FemcConfig;

/// Cheap-point outer interval.
const OUTER_INTERVAL: Duration = Duration::from_millis(50);

pub const TEMP_SENSORS: usize = 13;

/// Sensor indices of the 4 K and 15 K cold stages watched by pump-down.
const STAGE_4K_SENSOR: u16 = 0;
const STAGE_15K_SENSOR: u16 = 5;

// Cryostat RCA offsets within the 0xC000 block.
const TEMP_OFFSET: u16 = 0x000; // sensor i at +4i
const PRESSURE_OFFSET: u16 = 0x040; // gauge i at +4i
const GATE_VALVE_STATE: u16 = 0x060;
const SOLENOID_VALVE_STATE: u16 = 0x064;
const BACKING_PUMP_ENABLE: u16 = 0x070;
const TURBO_PUMP_ENABLE: u16 = 0x074;
const SUPPLY_CURRENT_230V: u16 = 0x080;

/// Valve state wire values.
const VALVE_CLOSED: u8 = 0;
#[cfg(test)]
const VALVE_OPEN: u8 = 1;

/// Pump-down parameters. The `tick` is the fixed 1 s wait/poll granularity;
/// bench rigs shrink it.
#[derive(Debug, Clone)]
pub struct PumpdownParams {
    /// Both cold stages must drop below this (K) before the valves close.
    pub switch_temp: f32,
    /// Wait between temperature checks, and the post-turbo settling wait.
    pub cycle: Duration,
    /// Overall bound on the temperature wait.
    pub timeout: Duration,
    pub tick: Duration,
}

impl Default for PumpdownParams {
    fn default() -> Self {
        PumpdownParams {
            switch_temp: 17.0,
            cycle: Duration::from_secs(60),
            timeout: Duration::from_secs(6 * 3600),
            tick: Duration::from_secs(1),
        }
    }
}

/// Last-polled cryostat state.
#[derive(Debug, Clone, Serialize)]
pub struct CryostatSnapshot {
    pub temps: Vec<Monitored<f32>>,
    pub pressures: [Monitored<f32>; 2],
    pub gate_valve: Monitored<u8>,
    pub solenoid_valve: Monitored<u8>,
    pub backing_pump: Monitored<u8>,
    pub turbo_pump: Monitored<u8>,
    pub supply_current: Monitored<f32>,
}

struct PollState {
    last_outer: Option<Instant>,
    phase: u8,
    csv_header_done: bool,
}

pub struct Cryostat {
    core: DeviceCore,
    temps: Vec<MonitorPoint<f32>>,
    pressures: [MonitorPoint<f32>; 2],
    gate_valve: MonitorPoint<u8>,
    solenoid_valve: MonitorPoint<u8>,
    backing_pump: MonitorPoint<u8>,
    turbo_pump: MonitorPoint<u8>,
    supply_current: MonitorPoint<f32>,
    registry: Mutex<MonitorRegistry>,
    poll: Mutex<PollState>,
    pumpdown_busy: AtomicBool,
}

impl Cryostat {
    pub fn new(config: Arc<FemcConfig>) -> Arc<Self> {
        let cryo = Arc::new(Cryostat {
            core: DeviceCore::new("cryostat", config),
            temps: (0..TEMP_SENSORS).map(|_| MonitorPoint::new()).collect(),
            pressures: Default::default(),
            gate_valve: MonitorPoint::new(),
            solenoid_valve: MonitorPoint::new(),
            backing_pump: MonitorPoint::new(),
            turbo_pump: MonitorPoint::new(),
            supply_current: MonitorPoint::new(),
            registry: Mutex::new(MonitorRegistry::new()),
            poll: Mutex::new(PollState {
                last_outer: None,
                phase: 0,
                csv_header_done: false,
            }),
            pumpdown_busy: AtomicBool::new(false),
        });
        cryo.build_registry();
        cryo
    }

    pub fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn rca_temp(sensor: u16) -> Rca {
        Rca::cryostat(TEMP_OFFSET + sensor * 4)
    }

    fn rca_pressure(gauge: u16) -> Rca {
        Rca::cryostat(PRESSURE_OFFSET + gauge * 4)
    }

    fn build_registry(self: &Arc<Self>) {
        let mut reg = self.registry.lock();
        for sensor in 0..TEMP_SENSORS as u16 {
            let dev = Arc::downgrade(self);
            let point = self.temps[sensor as usize].clone();
            reg.add(move |_| {
                if let Some(dev) = dev.upgrade() {
                    point.store(dev.core.sync_monitor::<f32>(Self::rca_temp(sensor)));
                }
            });
        }
        for gauge in 0..2u16 {
            let dev = Arc::downgrade(self);
            let point = self.pressures[gauge as usize].clone();
            reg.add(move |_| {
                if let Some(dev) = dev.upgrade() {
                    point.store(dev.core.sync_monitor::<f32>(Self::rca_pressure(gauge)));
                }
            });
        }
        let dev = Arc::downgrade(self);
        let point = self.supply_current.clone();
        reg.add(move |_| {
            if let Some(dev) = dev.upgrade() {
                point.store(
                    dev.core
                        .sync_monitor::<f32>(Rca::cryostat(SUPPLY_CURRENT_230V)),
                );
            }
        });
    }

    /// Valve and pump switch states, one per outer interval.
    fn run_outer_phase(&self, phase: u8) -> u8 {
        match phase {
            0 => self
                .gate_valve
                .store(self.core.sync_monitor::<u8>(Rca::cryostat(GATE_VALVE_STATE))),
            1 => self.solenoid_valve.store(
                self.core
                    .sync_monitor::<u8>(Rca::cryostat(SOLENOID_VALVE_STATE)),
            ),
            2 => self.backing_pump.store(
                self.core
                    .sync_monitor::<u8>(Rca::cryostat(BACKING_PUMP_ENABLE)),
            ),
            _ => self
                .turbo_pump
                .store(self.core.sync_monitor::<u8>(Rca::cryostat(TURBO_PUMP_ENABLE))),
        }
        (phase + 1) % 4
    }

    fn csv_header(&self) -> String {
        let mut cols: Vec<String> = (0..TEMP_SENSORS).map(|i| format!("T{}", i)).collect();
        cols.push("P0".into());
        cols.push("P1".into());
        cols.push("I230V".into());
        cols.join(",")
    }

    fn csv_line(&self) -> String {
        let mut cols: Vec<String> = self
            .temps
            .iter()
            .map(|t| format!("{:.3}", t.get().value))
            .collect();
        for p in &self.pressures {
            cols.push(format!("{:.3e}", p.get().value));
        }
        cols.push(format!("{:.3}", self.supply_current.get().value));
        cols.join(",")
    }

    pub fn temp(&self, sensor: usize) -> Monitored<f32> {
        self.temps[sensor].get()
    }

    pub fn snapshot(&self) -> CryostatSnapshot {
        CryostatSnapshot {
            temps: self.temps.iter().map(|t| t.get()).collect(),
            pressures: [self.pressures[0].get(), self.pressures[1].get()],
            gate_valve: self.gate_valve.get(),
            solenoid_valve: self.solenoid_valve.get(),
            backing_pump: self.backing_pump.get(),
            turbo_pump: self.turbo_pump.get(),
            supply_current: self.supply_current.get(),
        }
    }

    // Pump-down --------------------------------------------------------------

    /// Run the pump-down sequence to completion on the calling thread.
    ///
    /// Refuses to start unless the backing pump reads enabled. Waits (up to
    /// `timeout`, in `cycle` slices) for both watched cold stages to drop
    /// below `switch_temp`, then: closes the gate valve (up to 20 state
    /// polls; a valve that never confirms degrades the run, leaving the
    /// backing pump up), closes the solenoid valve (up to 10 polls; failure
    /// here fails the whole run), stops the turbo pump, waits one more
    /// cycle, and finally stops the backing pump unless degraded.
    pub fn run_pumpdown(
        &self,
        params: &PumpdownParams,
        stop: &AtomicBool,
        sink: &dyn EventSink,
    ) -> FemcResult<()> {
        if self.pumpdown_busy.swap(true, Ordering::SeqCst) {
            return Err(FemcError::Busy("pump-down".into()));
        }
        let result = self.pumpdown_inner(params, stop, sink);
        self.pumpdown_busy.store(false, Ordering::SeqCst);
        match &result {
            Ok(()) => {
                sink.status(true, "pump-down complete");
                sink.progress(100);
            }
            Err(e) => sink.status(false, &format!("pump-down failed: {}", e)),
        }
        sink.progress(0);
        result
    }

    /// Spawn [`Self::run_pumpdown`] on a worker thread.
    pub fn start_pumpdown(
        self: &Arc<Self>,
        params: PumpdownParams,
        stop: Arc<AtomicBool>,
        sink: Arc<dyn EventSink>,
    ) -> std::io::Result<thread::JoinHandle<FemcResult<()>>> {
        let cryo = Arc::clone(self);
        thread::Builder::new()
            .name("pumpdown".into())
            .spawn(move || cryo.run_pumpdown(&params, &stop, sink.as_ref()))
    }

    fn pumpdown_inner(
        &self,
        params: &PumpdownParams,
        stop: &AtomicBool,
        sink: &dyn EventSink,
    ) -> FemcResult<()> {
        let backing = self
            .core
            .sync_monitor::<u8>(Rca::cryostat(BACKING_PUMP_ENABLE))?;
        if backing.value != 1 {
            return Err(FemcError::device(
                self.core.name(),
                "backing pump is not running; refusing to pump down",
            ));
        }

        self.core.log_event(format!(
            "pump-down started, switch temperature {} K",
            params.switch_temp
        ));

        // Phase 1: wait for the cold stages.
        let start = Instant::now();
        loop {
            let t4k = self
                .core
                .sync_monitor::<f32>(Self::rca_temp(STAGE_4K_SENSOR))?
                .value;
            let t15k = self
                .core
                .sync_monitor::<f32>(Self::rca_temp(STAGE_15K_SENSOR))?
                .value;
            if t4k < params.switch_temp && t15k < params.switch_temp {
                self.core.log_event(format!(
                    "cold stages at {:.2} K / {:.2} K, switching over",
                    t4k, t15k
                ));
                break;
            }
            if start.elapsed() > params.timeout {
                return Err(FemcError::timeout("cold stages never reached switch temperature"));
            }
            self.sleep_cycle(params.cycle, params.tick, stop, "pump-down")?;
        }

        // Phase 2: close the gate valve. A valve that never confirms closed
        // degrades the run: everything else proceeds, but the backing pump
        // stays up so the cryostat is not left blind behind an open gate.
        self.core
            .sync_command(Rca::cryostat(GATE_VALVE_STATE), &VALVE_CLOSED)?;
        let mut degraded = false;
        if !self.await_valve(Rca::cryostat(GATE_VALVE_STATE), 20, params.tick)? {
            sink.status(false, "gate valve did not confirm closed; continuing degraded");
            self.core.log_event("gate valve did not confirm closed");
            degraded = true;
        }

        // Phase 3: the solenoid valve must confirm.
        self.core
            .sync_command(Rca::cryostat(SOLENOID_VALVE_STATE), &VALVE_CLOSED)?;
        if !self.await_valve(Rca::cryostat(SOLENOID_VALVE_STATE), 10, params.tick)? {
            return Err(FemcError::device(
                self.core.name(),
                "solenoid valve did not confirm closed",
            ));
        }

        // Phase 4: pumps, outermost first.
        self.core
            .sync_command(Rca::cryostat(TURBO_PUMP_ENABLE), &0u8)?;
        sink.progress(50);
        self.sleep_cycle(params.cycle, params.tick, stop, "pump-down")?;
        if !degraded {
            self.core
                .sync_command(Rca::cryostat(BACKING_PUMP_ENABLE), &0u8)?;
        }
        Ok(())
    }

    /// Poll a valve state until it reads closed, at most `polls` reads one
    /// tick apart. `Ok(false)` means it never confirmed.
    fn await_valve(&self, rca: Rca, polls: u32, tick: Duration) -> FemcResult<bool> {
        for i in 0..polls {
            let state = self.core.sync_monitor::<u8>(rca)?;
            if state.value == VALVE_CLOSED {
                return Ok(true);
            }
            if i + 1 < polls {
                thread::sleep(tick);
            }
        }
        Ok(false)
    }

    /// Sleep one cycle in tick slices, watching the stop flag.
    fn sleep_cycle(
        &self,
        cycle: Duration,
        tick: Duration,
        stop: &AtomicBool,
        what: &str,
    ) -> FemcResult<()> {
        let mut remaining = cycle;
        while !remaining.is_zero() {
            if stop.load(Ordering::SeqCst) {
                return Err(FemcError::aborted(what));
            }
            let slice = remaining.min(tick.max(Duration::from_millis(1)));
            thread::sleep(slice);
            remaining = remaining.saturating_sub(slice);
        }
        if stop.load(Ordering::SeqCst) {
            return Err(FemcError::aborted(what));
        }
        Ok(())
    }
}

impl MonitorDevice for Cryostat {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn monitor_action(&self, timestamp: Timestamp) {
        self.registry.lock().execute_next_mon(timestamp);

        let mut poll = self.poll.lock();
        let due = poll
            .last_outer
            .map_or(true, |t| t.elapsed() >= OUTER_INTERVAL);
        if !due {
            return;
        }
        poll.last_outer = Some(Instant::now());
        let phase = poll.phase;
        poll.phase = self.run_outer_phase(phase);
        if self.core.config().log_monitors {
            if !poll.csv_header_done {
                poll.csv_header_done = true;
                self.core.log_csv(self.csv_header());
            }
            self.core.log_csv(self.csv_line());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use femc_core::bus::sim::SimulatedBus;
    use femc_core::bus::BusInterface;
    use femc_core::codec::WireType;
    use femc_core::events::{ChannelSink, ControlEvent, NullSink};

    fn rigged() -> (Arc<Cryostat>, Arc<SimulatedBus>) {
        let bus = Arc::new(SimulatedBus::new());
        let cryo = Cryostat::new(Arc::new(FemcConfig::default()));
        cryo.core()
            .initialize(Arc::clone(&bus) as Arc<dyn BusInterface>, 0, 0x13);
        (cryo, bus)
    }

    fn fast_params(switch_temp: f32) -> PumpdownParams {
        PumpdownParams {
            switch_temp,
            cycle: Duration::from_millis(5),
            timeout: Duration::from_millis(200),
            tick: Duration::from_millis(1),
        }
    }

    /// Cold stages already below the switch point; valves confirm at once.
    fn wire_happy_path(bus: &SimulatedBus) {
        bus.set_monitor(Rca::cryostat(BACKING_PUMP_ENABLE), 1u8);
        bus.set_monitor_f32(Cryostat::rca_temp(STAGE_4K_SENSOR), 3.8);
        bus.set_monitor_f32(Cryostat::rca_temp(STAGE_15K_SENSOR), 14.2);
        bus.set_monitor(Rca::cryostat(GATE_VALVE_STATE), VALVE_CLOSED);
        bus.set_monitor(Rca::cryostat(SOLENOID_VALVE_STATE), VALVE_CLOSED);
    }

    #[test]
    fn refuses_without_backing_pump() {
        let (cryo, bus) = rigged();
        bus.set_monitor(Rca::cryostat(BACKING_PUMP_ENABLE), 0u8);
        let err = cryo
            .run_pumpdown(&fast_params(17.0), &AtomicBool::new(false), &NullSink)
            .unwrap_err();
        assert!(matches!(err, FemcError::Device { .. }));
        // Nothing was commanded.
        assert!(bus.commands().is_empty());
    }

    #[test]
    fn full_sequence_closes_valves_and_stops_pumps() {
        let (cryo, bus) = rigged();
        wire_happy_path(&bus);
        let (sink, rx) = ChannelSink::new();
        cryo.run_pumpdown(&fast_params(17.0), &AtomicBool::new(false), sink.as_ref())
            .unwrap();

        assert_eq!(
            bus.commands_for(Rca::cryostat(GATE_VALVE_STATE)),
            vec![VALVE_CLOSED.encode()]
        );
        assert_eq!(
            bus.commands_for(Rca::cryostat(SOLENOID_VALVE_STATE)),
            vec![VALVE_CLOSED.encode()]
        );
        assert_eq!(
            bus.commands_for(Rca::cryostat(TURBO_PUMP_ENABLE)),
            vec![0u8.encode()]
        );
        assert_eq!(
            bus.commands_for(Rca::cryostat(BACKING_PUMP_ENABLE)),
            vec![0u8.encode()]
        );
        let events: Vec<ControlEvent> = rx.try_iter().collect();
        assert!(events.contains(&ControlEvent::Progress(50)));
        assert!(events.contains(&ControlEvent::Progress(100)));
        assert_eq!(*events.last().unwrap(), ControlEvent::Progress(0));
    }

    #[test]
    fn waits_for_cold_stages() {
        let (cryo, bus) = rigged();
        wire_happy_path(&bus);
        // 4 K stage warm for two checks, then cold.
        bus.script_monitor_f32(
            Cryostat::rca_temp(STAGE_4K_SENSOR),
            &[80.0, 40.0, 3.9],
        );
        cryo.run_pumpdown(&fast_params(17.0), &AtomicBool::new(false), &NullSink)
            .unwrap();
        assert_eq!(
            bus.commands_for(Rca::cryostat(BACKING_PUMP_ENABLE)),
            vec![0u8.encode()]
        );
    }

    #[test]
    fn times_out_when_stages_stay_warm() {
        let (cryo, bus) = rigged();
        wire_happy_path(&bus);
        bus.set_monitor_f32(Cryostat::rca_temp(STAGE_4K_SENSOR), 80.0);
        let err = cryo
            .run_pumpdown(&fast_params(17.0), &AtomicBool::new(false), &NullSink)
            .unwrap_err();
        assert!(matches!(err, FemcError::Timeout(_)));
        // The switchover never happened.
        assert!(bus
            .commands_for(Rca::cryostat(GATE_VALVE_STATE))
            .is_empty());
    }

    #[test]
    fn stuck_gate_valve_degrades_but_finishes() {
        let (cryo, bus) = rigged();
        wire_happy_path(&bus);
        // The gate valve keeps reporting open; command echo is overridden
        // by the scripted state.
        bus.set_monitor(Rca::cryostat(GATE_VALVE_STATE), VALVE_OPEN);
        let (sink, rx) = ChannelSink::new();
        cryo.run_pumpdown(&fast_params(17.0), &AtomicBool::new(false), sink.as_ref())
            .unwrap();
        // Degraded: turbo stopped, backing pump left running.
        assert_eq!(
            bus.commands_for(Rca::cryostat(TURBO_PUMP_ENABLE)),
            vec![0u8.encode()]
        );
        assert!(bus
            .commands_for(Rca::cryostat(BACKING_PUMP_ENABLE))
            .is_empty());
        let degraded_reported = rx
            .try_iter()
            .any(|e| matches!(e, ControlEvent::Status { ok: false, .. }));
        assert!(degraded_reported);
    }

    #[test]
    fn stuck_solenoid_valve_fails_the_run() {
        let (cryo, bus) = rigged();
        wire_happy_path(&bus);
        bus.set_monitor(Rca::cryostat(SOLENOID_VALVE_STATE), VALVE_OPEN);
        let err = cryo
            .run_pumpdown(&fast_params(17.0), &AtomicBool::new(false), &NullSink)
            .unwrap_err();
        assert!(matches!(err, FemcError::Device { .. }));
        // The turbo pump was never touched.
        assert!(bus
            .commands_for(Rca::cryostat(TURBO_PUMP_ENABLE))
            .is_empty());
    }

    #[test]
    fn stop_flag_aborts_the_wait() {
        let (cryo, bus) = rigged();
        wire_happy_path(&bus);
        bus.set_monitor_f32(Cryostat::rca_temp(STAGE_4K_SENSOR), 80.0);
        let stop = AtomicBool::new(true);
        let err = cryo
            .run_pumpdown(&fast_params(17.0), &stop, &NullSink)
            .unwrap_err();
        assert!(matches!(err, FemcError::Aborted(_)));
    }

    #[test]
    fn busy_guard_rejects_second_run() {
        let (cryo, bus) = rigged();
        wire_happy_path(&bus);
        bus.set_monitor_f32(Cryostat::rca_temp(STAGE_4K_SENSOR), 80.0);
        let stop = Arc::new(AtomicBool::new(false));
        let (sink, _rx) = ChannelSink::new();
        let mut params = fast_params(17.0);
        params.timeout = Duration::from_secs(10);
        let handle = cryo
            .start_pumpdown(params, Arc::clone(&stop), sink)
            .unwrap();
        thread::sleep(Duration::from_millis(20));
        let second = cryo.run_pumpdown(&fast_params(17.0), &stop, &NullSink);
        assert!(matches!(second, Err(FemcError::Busy(_))));
        stop.store(true, Ordering::SeqCst);
        let _ = handle.join().unwrap();
    }

    #[test]
    fn registry_polls_every_sensor() {
        let (cryo, bus) = rigged();
        for sensor in 0..TEMP_SENSORS as u16 {
            bus.set_monitor_f32(Cryostat::rca_temp(sensor), 4.0 + sensor as f32);
        }
        for _ in 0..20 {
            cryo.registry.lock().execute_next_mon(0);
        }
        let snap = cryo.snapshot();
        for (i, t) in snap.temps.iter().enumerate() {
            assert!((t.value - (4.0 + i as f32)).abs() < 1e-5, "sensor {}", i);
        }
    }
}
