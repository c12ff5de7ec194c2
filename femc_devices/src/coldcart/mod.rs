//! Cold cartridge bias controller.
//!
//! One instance per receiver band (1-10). The four SIS mixer channels
//! (polarization 0/1 x sideband 1/2) are indexed by [`MixerChannel`];
//! per-channel settings, calibration offsets and monitor points live in
//! 4-element arrays.
//!
//! Background polling drains one registry entry (the analog points) per
//! 5 ms tick and services the cheap boolean points through a phase counter
//! once per 15 ms outer interval.

mod heating;
mod iv;

pub use heating::{HeatingParams, HeatingScope};
pub use iv::{IvCurveParams, IvPoint};

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use femc_core::bus::Timestamp;
use femc_core::device::{DeviceCore, MonitorDevice, MonitorPoint, Monitored};
use femc_core::error::{FemcError, FemcResult};
use femc_core::rca::Rca;
use femc_core::registry::MonitorRegistry;
use femc_core::FemcConfig;

/// Analog monitoring outer interval.
const ANALOG_INTERVAL: Duration = Duration::from_millis(15);

/// SIS voltage sweep step for bands above 6.
const SIS_SWEEP_STEP: f32 = 0.05;

/// Magnet current ramp step used when a control process parks the magnets.
const MAGNET_SWEEP_STEP: f32 = 0.1;

// Bias sub-block RCA offsets (12-bit, LO bit clear). Channels are laid out
// as pol * 0x400 + (sb-1) * 0x80.
const POL_STRIDE: u16 = 0x400;
const SB_STRIDE: u16 = 0x080;
const SIS_VOLTAGE: u16 = 0x008;
const SIS_CURRENT: u16 = 0x010;
const SIS_MAGNET_ENABLE: u16 = 0x028;
const SIS_MAGNET_CURRENT: u16 = 0x030;
const LNA_ENABLE: u16 = 0x058;
// Per-polarization points, independent of sideband.
const HEATER_ENABLE: u16 = 0x180;
const HEATER_CURRENT: u16 = 0x1A0;
// Temperature-sensor sub-block: sensor i at 0x880 + 4i.
const TEMP_BASE: u16 = 0x880;
/// Cartridge temperature sensors wired to the pol0/pol1 mixer blocks.
const MIXER_TEMP_SENSOR: [u16; 2] = [2, 5];

/// One SIS mixer channel: polarization x sideband.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MixerChannel {
    Pol0Sb1,
    Pol0Sb2,
    Pol1Sb1,
    Pol1Sb2,
}

impl MixerChannel {
    pub const ALL: [MixerChannel; 4] = [
        MixerChannel::Pol0Sb1,
        MixerChannel::Pol0Sb2,
        MixerChannel::Pol1Sb1,
        MixerChannel::Pol1Sb2,
    ];

    /// Normalize external (pol, sb) arguments: pol is 0/1, sb is 1/2.
    pub fn from_pol_sb(pol: u8, sb: u8) -> FemcResult<Self> {
        match (pol, sb) {
            (0, 1) => Ok(MixerChannel::Pol0Sb1),
            (0, 2) => Ok(MixerChannel::Pol0Sb2),
            (1, 1) => Ok(MixerChannel::Pol1Sb1),
            (1, 2) => Ok(MixerChannel::Pol1Sb2),
            _ => Err(FemcError::invalid_input(format!(
                "no mixer channel pol={} sb={}",
                pol, sb
            ))),
        }
    }

    pub fn index(self) -> usize {
        match self {
            MixerChannel::Pol0Sb1 => 0,
            MixerChannel::Pol0Sb2 => 1,
            MixerChannel::Pol1Sb1 => 2,
            MixerChannel::Pol1Sb2 => 3,
        }
    }

    pub fn pol(self) -> u8 {
        (self.index() / 2) as u8
    }

    pub fn sb(self) -> u8 {
        (self.index() % 2) as u8 + 1
    }

    fn offset(self) -> u16 {
        self.pol() as u16 * POL_STRIDE + (self.sb() as u16 - 1) * SB_STRIDE
    }
}

/// Last commanded bias settings and calibration offsets.
#[derive(Debug, Clone, Default)]
pub(crate) struct BiasSettings {
    pub sis_voltage: [f32; 4],
    pub magnet_current: [f32; 4],
    pub magnet_enabled: [bool; 4],
    pub lna_enabled: [bool; 4],
    /// measured - nominal per channel; subtracted from every voltage command.
    pub voltage_offset: [f32; 4],
}

#[derive(Default)]
struct Monitors {
    sis_voltage: [MonitorPoint<f32>; 4],
    sis_current: [MonitorPoint<f32>; 4],
    magnet_current: [MonitorPoint<f32>; 4],
    lna_enable: [MonitorPoint<u8>; 4],
    heater_enable: [MonitorPoint<u8>; 2],
    heater_current: [MonitorPoint<f32>; 2],
    mixer_temp: [MonitorPoint<f32>; 2],
}

struct PollState {
    last_outer: Option<Instant>,
    phase: u8,
    csv_header_done: bool,
}

/// All last-polled values, for telemetry.
#[derive(Debug, Clone, Serialize)]
pub struct ColdCartSnapshot {
    pub band: u8,
    pub sis_voltage: [Monitored<f32>; 4],
    pub sis_current: [Monitored<f32>; 4],
    pub magnet_current: [Monitored<f32>; 4],
    pub lna_enable: [Monitored<u8>; 4],
    pub heater_enable: [Monitored<u8>; 2],
    pub heater_current: [Monitored<f32>; 2],
    pub mixer_temp: [Monitored<f32>; 2],
}

/// Cold cartridge bias controller for one band.
pub struct ColdCartridge {
    core: DeviceCore,
    band: u8,
    /// Cartridge slot index, 0-based.
    cartridge: u8,
    settings: RwLock<BiasSettings>,
    mon: Monitors,
    registry: Mutex<MonitorRegistry>,
    poll: Mutex<PollState>,
    pub(crate) heating_busy: AtomicBool,
    pub(crate) iv_busy: AtomicBool,
}

impl ColdCartridge {
    /// Bands run 1-10; anything else is a construction-time error.
    pub fn new(band: u8, config: Arc<FemcConfig>) -> Arc<Self> {
        assert!((1..=10).contains(&band), "cold cartridge band {}", band);
        let cart = Arc::new(ColdCartridge {
            core: DeviceCore::new(format!("coldcart{}", band), config),
            band,
            cartridge: band - 1,
            settings: RwLock::new(BiasSettings::default()),
            mon: Monitors::default(),
            registry: Mutex::new(MonitorRegistry::new()),
            poll: Mutex::new(PollState {
                last_outer: None,
                phase: 0,
                csv_header_done: false,
            }),
            heating_busy: AtomicBool::new(false),
            iv_busy: AtomicBool::new(false),
        });
        cart.build_registry();
        cart
    }

    pub fn core(&self) -> &DeviceCore {
        &self.core
    }

    pub fn band(&self) -> u8 {
        self.band
    }

    /// Whether this band carries SIS mixers at all (bands 1-2 are HEMT-only).
    pub fn has_sis(&self) -> bool {
        self.band >= 3
    }

    // RCA map --------------------------------------------------------------

    pub fn rca_sis_voltage(&self, ch: MixerChannel) -> Rca {
        Rca::cartridge_bias(self.cartridge, ch.offset() + SIS_VOLTAGE)
    }

    pub fn rca_sis_current(&self, ch: MixerChannel) -> Rca {
        Rca::cartridge_bias(self.cartridge, ch.offset() + SIS_CURRENT)
    }

    pub fn rca_magnet_enable(&self, ch: MixerChannel) -> Rca {
        Rca::cartridge_bias(self.cartridge, ch.offset() + SIS_MAGNET_ENABLE)
    }

    pub fn rca_magnet_current(&self, ch: MixerChannel) -> Rca {
        Rca::cartridge_bias(self.cartridge, ch.offset() + SIS_MAGNET_CURRENT)
    }

    pub fn rca_lna_enable(&self, ch: MixerChannel) -> Rca {
        Rca::cartridge_bias(self.cartridge, ch.offset() + LNA_ENABLE)
    }

    pub fn rca_heater_enable(&self, pol: u8) -> Rca {
        Rca::cartridge_bias(self.cartridge, pol as u16 * POL_STRIDE + HEATER_ENABLE)
    }

    pub fn rca_heater_current(&self, pol: u8) -> Rca {
        Rca::cartridge_bias(self.cartridge, pol as u16 * POL_STRIDE + HEATER_CURRENT)
    }

    pub fn rca_mixer_temp(&self, pol: u8) -> Rca {
        Rca::cartridge_bias(self.cartridge, TEMP_BASE + MIXER_TEMP_SENSOR[pol as usize] * 4)
    }

    // Registry / polling ----------------------------------------------------

    fn build_registry(self: &Arc<Self>) {
        let mut reg = self.registry.lock();
        for ch in MixerChannel::ALL {
            let dev = Arc::downgrade(self);
            let point = self.mon.sis_voltage[ch.index()].clone();
            reg.add(move |_| {
                if let Some(dev) = dev.upgrade() {
                    point.store(dev.core.sync_monitor::<f32>(dev.rca_sis_voltage(ch)));
                }
            });
            let dev = Arc::downgrade(self);
            let point = self.mon.sis_current[ch.index()].clone();
            reg.add(move |_| {
                if let Some(dev) = dev.upgrade() {
                    point.store(dev.core.sync_monitor::<f32>(dev.rca_sis_current(ch)));
                }
            });
            let dev = Arc::downgrade(self);
            let point = self.mon.magnet_current[ch.index()].clone();
            reg.add(move |_| {
                if let Some(dev) = dev.upgrade() {
                    point.store(dev.core.sync_monitor::<f32>(dev.rca_magnet_current(ch)));
                }
            });
        }
        for pol in 0..2u8 {
            let dev = Arc::downgrade(self);
            let point = self.mon.heater_current[pol as usize].clone();
            reg.add(move |_| {
                if let Some(dev) = dev.upgrade() {
                    point.store(dev.core.sync_monitor::<f32>(dev.rca_heater_current(pol)));
                }
            });
            let dev = Arc::downgrade(self);
            let point = self.mon.mixer_temp[pol as usize].clone();
            reg.add(move |_| {
                if let Some(dev) = dev.upgrade() {
                    point.store(dev.core.sync_monitor::<f32>(dev.rca_mixer_temp(pol)));
                }
            });
        }
    }

    /// Prioritize a fresh read of one channel's SIS voltage: serviced on the
    /// very next polling tick, once.
    pub fn refresh_sis_voltage_soon(self: &Arc<Self>, ch: MixerChannel) {
        let dev = Arc::downgrade(self);
        let point = self.mon.sis_voltage[ch.index()].clone();
        self.registry.lock().insert_temporary(move |_| {
            if let Some(dev) = dev.upgrade() {
                point.store(dev.core.sync_monitor::<f32>(dev.rca_sis_voltage(ch)));
            }
        });
    }

    /// Ordered phase list for the cheap boolean points, serviced once per
    /// outer interval. Phase 1 deliberately falls through into phase 2: the
    /// two heater-enable readbacks always refresh on the same tick.
    const PHASE_FALLTHROUGH: [bool; 3] = [false, true, false];

    fn run_outer_phase(&self, start: u8) -> u8 {
        let mut phase = start as usize % 3;
        loop {
            match phase {
                0 => {
                    for ch in MixerChannel::ALL {
                        self.mon.lna_enable[ch.index()]
                            .store(self.core.sync_monitor::<u8>(self.rca_lna_enable(ch)));
                    }
                }
                1 => {
                    self.mon.heater_enable[0]
                        .store(self.core.sync_monitor::<u8>(self.rca_heater_enable(0)));
                }
                _ => {
                    self.mon.heater_enable[1]
                        .store(self.core.sync_monitor::<u8>(self.rca_heater_enable(1)));
                }
            }
            if Self::PHASE_FALLTHROUGH[phase] {
                phase += 1;
                continue;
            }
            break;
        }
        ((phase + 1) % 3) as u8
    }

    fn csv_header(&self) -> String {
        let mut cols = vec!["band".to_string()];
        for ch in MixerChannel::ALL {
            cols.push(format!("Vj{}{}", ch.pol(), ch.sb()));
            cols.push(format!("Ij{}{}", ch.pol(), ch.sb()));
            cols.push(format!("Imag{}{}", ch.pol(), ch.sb()));
        }
        cols.push("Iheat0".into());
        cols.push("Iheat1".into());
        cols.push("Tmix0".into());
        cols.push("Tmix1".into());
        cols.join(",")
    }

    fn csv_line(&self) -> String {
        let mut cols = vec![self.band.to_string()];
        for ch in MixerChannel::ALL {
            cols.push(format!("{:.4}", self.mon.sis_voltage[ch.index()].get().value));
            cols.push(format!("{:.4}", self.mon.sis_current[ch.index()].get().value));
            cols.push(format!(
                "{:.4}",
                self.mon.magnet_current[ch.index()].get().value
            ));
        }
        for pol in 0..2 {
            cols.push(format!("{:.4}", self.mon.heater_current[pol].get().value));
        }
        for pol in 0..2 {
            cols.push(format!("{:.4}", self.mon.mixer_temp[pol].get().value));
        }
        cols.join(",")
    }

    // Monitor accessors ------------------------------------------------------

    pub fn sis_voltage(&self, ch: MixerChannel) -> Monitored<f32> {
        self.mon.sis_voltage[ch.index()].get()
    }

    pub fn sis_current(&self, ch: MixerChannel) -> Monitored<f32> {
        self.mon.sis_current[ch.index()].get()
    }

    pub fn mixer_temp(&self, pol: u8) -> Monitored<f32> {
        self.mon.mixer_temp[pol as usize].get()
    }

    pub fn snapshot(&self) -> ColdCartSnapshot {
        ColdCartSnapshot {
            band: self.band,
            sis_voltage: std::array::from_fn(|i| self.mon.sis_voltage[i].get()),
            sis_current: std::array::from_fn(|i| self.mon.sis_current[i].get()),
            magnet_current: std::array::from_fn(|i| self.mon.magnet_current[i].get()),
            lna_enable: std::array::from_fn(|i| self.mon.lna_enable[i].get()),
            heater_enable: std::array::from_fn(|i| self.mon.heater_enable[i].get()),
            heater_current: std::array::from_fn(|i| self.mon.heater_current[i].get()),
            mixer_temp: std::array::from_fn(|i| self.mon.mixer_temp[i].get()),
        }
    }

    // Bias commands ----------------------------------------------------------

    /// Command one channel's SIS voltage, applying the calibration offset
    /// transparently. `value` is the logical setting; the offset never shows
    /// up in the recorded settings.
    pub(crate) fn command_sis_voltage(&self, ch: MixerChannel, value: f32) -> FemcResult<()> {
        let offset = self.settings.read().voltage_offset[ch.index()];
        self.core
            .sync_command(self.rca_sis_voltage(ch), &(value - offset))?;
        self.settings.write().sis_voltage[ch.index()] = value;
        Ok(())
    }

    pub(crate) fn command_magnet_current(&self, ch: MixerChannel, value: f32) -> FemcResult<()> {
        self.core
            .sync_command(self.rca_magnet_current(ch), &value)?;
        self.settings.write().magnet_current[ch.index()] = value;
        Ok(())
    }

    pub(crate) fn command_magnet_enable(&self, ch: MixerChannel, enable: bool) -> FemcResult<()> {
        self.core
            .sync_command(self.rca_magnet_enable(ch), &(enable as u8))?;
        self.settings.write().magnet_enabled[ch.index()] = enable;
        Ok(())
    }

    pub fn set_lna_enable(&self, pol: u8, sb: u8, enable: bool) -> FemcResult<()> {
        let ch = MixerChannel::from_pol_sb(pol, sb)?;
        self.core
            .sync_command(self.rca_lna_enable(ch), &(enable as u8))?;
        self.settings.write().lna_enabled[ch.index()] = enable;
        Ok(())
    }

    /// Set one channel's SIS junction voltage.
    ///
    /// With `sweep` set and band > 6 the setting ramps from the current
    /// value toward `target` in fixed 0.05 steps (no settling delay beyond
    /// transaction latency) before the exact final value is issued. Bands
    /// 1-6 ignore `sweep` and jump directly.
    pub fn set_sis_voltage(&self, pol: u8, sb: u8, target: f32, sweep: bool) -> FemcResult<()> {
        let ch = MixerChannel::from_pol_sb(pol, sb)?;
        self.set_sis_voltage_ch(ch, target, sweep)
    }

    pub(crate) fn set_sis_voltage_ch(
        &self,
        ch: MixerChannel,
        target: f32,
        sweep: bool,
    ) -> FemcResult<()> {
        if sweep && self.band > 6 {
            let start = self.settings.read().sis_voltage[ch.index()];
            let mut v = start;
            if target > start {
                loop {
                    v += SIS_SWEEP_STEP;
                    if v >= target {
                        break;
                    }
                    self.command_sis_voltage(ch, v)?;
                }
            } else if target < start {
                loop {
                    v -= SIS_SWEEP_STEP;
                    if v <= target {
                        break;
                    }
                    self.command_sis_voltage(ch, v)?;
                }
            }
        }
        self.command_sis_voltage(ch, target)
    }

    /// Park one channel's magnet: ramp the current to zero in fixed steps,
    /// then drop the enable flag. Returns the flag state found beforehand.
    pub(crate) fn park_magnet(&self, ch: MixerChannel) -> FemcResult<bool> {
        let (was_enabled, start) = {
            let s = self.settings.read();
            (s.magnet_enabled[ch.index()], s.magnet_current[ch.index()])
        };
        if !was_enabled {
            return Ok(false);
        }
        let mut i = start;
        while i.abs() > MAGNET_SWEEP_STEP {
            i -= MAGNET_SWEEP_STEP * i.signum();
            self.command_magnet_current(ch, i)?;
        }
        self.command_magnet_current(ch, 0.0)?;
        self.command_magnet_enable(ch, false)?;
        Ok(true)
    }

    /// Measure the bias readback offset of one channel: drive a band-indexed
    /// nominal test voltage, read back a 100-sample average, store
    /// `measured - nominal` as the channel's calibration offset (applied
    /// transparently to every later voltage command), and restore the prior
    /// setting with the same sweep policy. Returns the new offset.
    pub fn measure_sis_voltage_error(&self, pol: u8, sb: u8) -> FemcResult<f32> {
        let ch = MixerChannel::from_pol_sb(pol, sb)?;
        if !self.has_sis() {
            return Err(FemcError::device(
                self.core.name(),
                "band has no SIS mixers",
            ));
        }
        let nominal = match self.band {
            3 => 10.0,
            4 => 4.8,
            5 => 2.5,
            6 => 9.0,
            7 | 8 => 2.2,
            9 => 2.3,
            10 => 2.1,
            _ => 2.2,
        };
        // Sweeping is only safe (and only required) on the high bands.
        let sweep = self.band >= 7;
        let prior = self.settings.read().sis_voltage[ch.index()];
        // Measure against an uncalibrated drive.
        self.settings.write().voltage_offset[ch.index()] = 0.0;
        self.set_sis_voltage_ch(ch, nominal, sweep)?;
        std::thread::sleep(Duration::from_millis(10));
        let measured = self
            .core
            .sync_monitor_average(self.rca_sis_voltage(ch), 100)?;
        let offset = measured - nominal;
        self.settings.write().voltage_offset[ch.index()] = offset;
        self.set_sis_voltage_ch(ch, prior, sweep)?;
        log::info!(
            "{}: SIS voltage offset pol{} sb{} = {:.4}",
            self.core.name(),
            ch.pol(),
            ch.sb(),
            offset
        );
        Ok(offset)
    }
}

impl MonitorDevice for ColdCartridge {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn monitor_action(&self, timestamp: Timestamp) {
        self.registry.lock().execute_next_mon(timestamp);

        let mut poll = self.poll.lock();
        let due = poll
            .last_outer
            .map_or(true, |t| t.elapsed() >= ANALOG_INTERVAL);
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
