//! IF switch: per-channel attenuators and the temperature servo.
//!
//! The IF switch routes the four cartridge IF outputs to the backend and
//! carries a 0-15 dB step attenuator per channel plus a temperature servo
//! on each assembly. Monitoring is slow (2 s outer interval); nothing here
//! changes fast.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use femc_core::bus::Timestamp;
use femc_core::device::{DeviceCore, MonitorDevice, MonitorPoint, Monitored};
use femc_core::error::{FemcError, FemcResult};
use femc_core::rca::Rca;
use femc_core::registry::MonitorRegistry;
use femc_core::FemcConfig;

const OUTER_INTERVAL: Duration = Duration::from_millis(2000);

pub const CHANNELS: usize = 4;

// IF switch RCA offsets within the 0xB000 block.
const ATTENUATION_BASE: u16 = 0x000; // channel i at +0x10*i
const TEMP_SERVO_ENABLE: u16 = 0x040;
const ASSEMBLY_TEMP_BASE: u16 = 0x050; // assembly i at +4i
const OBSERVING_BAND: u16 = 0x080;

const MAX_ATTENUATION: u8 = 15;

#[derive(Debug, Clone, Serialize)]
pub struct IfSwitchSnapshot {
    pub attenuation: [Monitored<u8>; CHANNELS],
    pub assembly_temp: [Monitored<f32>; CHANNELS],
    pub temp_servo: Monitored<u8>,
    pub observing_band: Monitored<u8>,
}

struct PollState {
    last_outer: Option<Instant>,
    phase: u8,
    csv_header_done: bool,
}

pub struct IfSwitch {
    core: DeviceCore,
    attenuation: [MonitorPoint<u8>; CHANNELS],
    assembly_temp: [MonitorPoint<f32>; CHANNELS],
    temp_servo: MonitorPoint<u8>,
    observing_band: MonitorPoint<u8>,
    registry: Mutex<MonitorRegistry>,
    poll: Mutex<PollState>,
}

impl IfSwitch {
    pub fn new(config: Arc<FemcConfig>) -> Arc<Self> {
        let sw = Arc::new(IfSwitch {
            core: DeviceCore::new("ifswitch", config),
            attenuation: Default::default(),
            assembly_temp: Default::default(),
            temp_servo: MonitorPoint::new(),
            observing_band: MonitorPoint::new(),
            registry: Mutex::new(MonitorRegistry::new()),
            poll: Mutex::new(PollState {
                last_outer: None,
                phase: 0,
                csv_header_done: false,
            }),
        });
        sw.build_registry();
        sw
    }

    pub fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn rca_attenuation(channel: usize) -> Rca {
        Rca::if_switch(ATTENUATION_BASE + channel as u16 * 0x10)
    }

    fn rca_assembly_temp(channel: usize) -> Rca {
        Rca::if_switch(ASSEMBLY_TEMP_BASE + channel as u16 * 4)
    }

    fn build_registry(self: &Arc<Self>) {
        let mut reg = self.registry.lock();
        for channel in 0..CHANNELS {
            let dev = Arc::downgrade(self);
            let point = self.assembly_temp[channel].clone();
            reg.add(move |_| {
                if let Some(dev) = dev.upgrade() {
                    point.store(dev.core.sync_monitor::<f32>(Self::rca_assembly_temp(channel)));
                }
            });
        }
    }

    fn run_outer_phase(&self, phase: u8) -> u8 {
        match phase {
            0 => {
                for channel in 0..CHANNELS {
                    self.attenuation[channel]
                        .store(self.core.sync_monitor::<u8>(Self::rca_attenuation(channel)));
                }
            }
            1 => self.temp_servo.store(
                self.core
                    .sync_monitor::<u8>(Rca::if_switch(TEMP_SERVO_ENABLE)),
            ),
            _ => self.observing_band.store(
                self.core
                    .sync_monitor::<u8>(Rca::if_switch(OBSERVING_BAND)),
            ),
        }
        (phase + 1) % 3
    }

    fn csv_header(&self) -> String {
        let mut cols: Vec<String> = (0..CHANNELS).map(|i| format!("att{}", i)).collect();
        cols.extend((0..CHANNELS).map(|i| format!("Tasm{}", i)));
        cols.join(",")
    }

    fn csv_line(&self) -> String {
        let mut cols: Vec<String> = self
            .attenuation
            .iter()
            .map(|a| a.get().value.to_string())
            .collect();
        cols.extend(
            self.assembly_temp
                .iter()
                .map(|t| format!("{:.3}", t.get().value)),
        );
        cols.join(",")
    }

    /// Set one channel's step attenuator (0-15 dB).
    pub fn set_attenuation(&self, channel: usize, db: u8) -> FemcResult<()> {
        if channel >= CHANNELS {
            return Err(FemcError::invalid_input(format!(
                "IF switch channel {} out of range",
                channel
            )));
        }
        if db > MAX_ATTENUATION {
            return Err(FemcError::invalid_input(format!(
                "attenuation {} dB above the {} dB ceiling",
                db, MAX_ATTENUATION
            )));
        }
        self.core.sync_command(Self::rca_attenuation(channel), &db)
    }

    /// Route a band's cartridge to the backend.
    pub fn set_observing_band(&self, band: u8) -> FemcResult<()> {
        if !(1..=10).contains(&band) {
            return Err(FemcError::invalid_input(format!("band {} out of range", band)));
        }
        self.core
            .sync_command(Rca::if_switch(OBSERVING_BAND), &band)
    }

    pub fn set_temp_servo(&self, enable: bool) -> FemcResult<()> {
        self.core
            .sync_command(Rca::if_switch(TEMP_SERVO_ENABLE), &(enable as u8))
    }

    pub fn snapshot(&self) -> IfSwitchSnapshot {
        IfSwitchSnapshot {
            attenuation: std::array::from_fn(|i| self.attenuation[i].get()),
            assembly_temp: std::array::from_fn(|i| self.assembly_temp[i].get()),
            temp_servo: self.temp_servo.get(),
            observing_band: self.observing_band.get(),
        }
    }
}

impl MonitorDevice for IfSwitch {
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
