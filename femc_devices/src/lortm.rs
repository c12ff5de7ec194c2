//! LO Reference Test Module (LORTM): phase-lock tuning planner and device.
//!
//! The LORTM synthesizes the first-LO phase-lock reference by beating a
//! slave laser against a fixed master reference laser. Tuning is pure
//! arithmetic: reduce the requested sky LO frequencies to the lockable
//! band, derive the beat note, then find a reference-synthesizer
//! multiplier M whose lock window contains it and program the slave
//! laser. All frequencies are in GHz unless noted.

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

/// Headline points (system state, lock state) refresh interval.
const HEADLINE_INTERVAL: Duration = Duration::from_millis(5000);

/// Slow points (laser temperatures) refresh interval.
const SECONDARY_INTERVAL: Duration = Duration::from_millis(30_000);

/// Master reference laser frequency (GHz), fixed by the hardware.
pub const REF_LASER_FREQ: f64 = 194_000.0;

/// The phase-lock loop's fixed IF offset (GHz) between the beat note and
/// the reference synthesizer chain.
const BEAT_OFFSET: f64 = 0.125;

/// Cold multiplication factor between the WCA output and the sky LO,
/// indexed by band 1-10.
const COLD_MULT: [u32; 10] = [1, 2, 3, 3, 6, 6, 9, 9, 9, 9];

/// Reduced LO frequencies below this (GHz) are out of the lockable band
/// and treated as unused.
const REDUCED_FLOOR: f64 = 24.0;

/// Reduced LO frequencies are clamped here (GHz).
const REDUCED_CEIL: f64 = 150.0;

/// Reference synthesizer multiplier candidates, tried in order.
const MULTIPLIERS: [u32; 3] = [2, 5, 7];

// LORTM node-local RCA map (the LORTM is its own node on the bus; its
// addresses do not follow the front-end block layout).
const SYSTEM_STATE: u16 = 0x001;
const PHASE_LOCK_STATE: u16 = 0x002;
const SLAVE_LASER_FREQUENCY: u16 = 0x022;
const LASER_TEMP_BASE: u16 = 0x030; // laser i at +4i

fn lortm_rca(offset: u16) -> Rca {
    Rca::new(offset as u32)
}

/// Beat-note lock window per multiplier.
fn window_fits(m: u32, beat: f64) -> bool {
    match m {
        2 => beat <= 39.0,
        5 => (64.5..100.0).contains(&beat),
        _ => (100.0..=150.0).contains(&beat),
    }
}

/// A complete tuning solution. Frequencies in GHz, the slave laser setting
/// in integer MHz as the hardware takes it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LortmTuning {
    pub band: u8,
    /// Reduced LO frequencies ordered lower/upper sideband; a zero means
    /// that sideband is unused.
    pub freq_lsb: f64,
    pub freq_usb: f64,
    /// Reference synthesizer targets.
    pub freq_ref1: f64,
    pub freq_ref2: f64,
    /// Chosen reference-synthesizer multiplier.
    pub multiplier: u32,
    /// Beat note between the slave and master lasers.
    pub beat_note: f64,
    /// Slave laser frequency command value (MHz).
    pub slave_laser_mhz: u32,
}

/// Plan a LORTM tuning. Pure arithmetic, no bus traffic.
///
/// Both LO frequencies (either may be zero/unused) are divided by the
/// band's cold multiplication factor; a reduced frequency below 24 GHz is
/// zeroed, one above 150 GHz is clamped to 150. The nonzero results are
/// ordered into (LSB, USB) and the FLOOG offset is added to each nonzero
/// one (positive when `selector` is 0, negative when 1). Then:
///
/// - `ref2 = (USB - LSB) / (2 * cold)` when the USB is in use, else 0
/// - `beat = LSB + ref2`
/// - slave laser = master reference - beat, in integer MHz
/// - the first M in {2, 5, 7} whose lock window (<= 39 / [64.5, 100) /
///   [100, 150]) contains the beat note wins, with
///   `ref1 = (beat + 0.125) / M`. No window fitting, or both reduced
///   frequencies zeroed, means the tuning is unachievable.
pub fn plan_tuning(
    band: u8,
    freq_lo1: f64,
    freq_lo2: f64,
    floog: f64,
    selector: u8,
) -> FemcResult<LortmTuning> {
    if !(1..=10).contains(&band) {
        return Err(FemcError::invalid_input(format!("band {} out of range", band)));
    }
    if freq_lo1 < 0.0 || freq_lo2 < 0.0 {
        return Err(FemcError::invalid_input("LO frequencies must be non-negative"));
    }
    if selector > 1 {
        return Err(FemcError::invalid_input(format!(
            "sideband-lock selector {} (want 0 or 1)",
            selector
        )));
    }
    let cold = COLD_MULT[band as usize - 1] as f64;
    let reduce = |lo: f64| -> f64 {
        let r = lo / cold;
        if r < REDUCED_FLOOR {
            0.0
        } else if r > REDUCED_CEIL {
            log::warn!(
                "band {} LO {} GHz reduces to {:.3} GHz, clamping to {}",
                band,
                lo,
                r,
                REDUCED_CEIL
            );
            REDUCED_CEIL
        } else {
            r
        }
    };
    let r1 = reduce(freq_lo1);
    let r2 = reduce(freq_lo2);
    if r1 == 0.0 && r2 == 0.0 {
        log::error!(
            "band {} LOs {} / {} GHz both reduce below the {} GHz floor",
            band,
            freq_lo1,
            freq_lo2,
            REDUCED_FLOOR
        );
        return Err(FemcError::invalid_input(format!(
            "band {} LOs {} / {} GHz are both outside the lockable range",
            band, freq_lo1, freq_lo2
        )));
    }

    // Order into sidebands and apply the FLOOG offset to each in-use one.
    let (mut freq_lsb, mut freq_usb) = if r1 > 0.0 && r2 > 0.0 {
        (r1.min(r2), r1.max(r2))
    } else {
        (r1.max(r2), 0.0)
    };
    let signed_floog = if selector == 0 { floog } else { -floog };
    freq_lsb += signed_floog;
    if freq_usb > 0.0 {
        freq_usb += signed_floog;
    }

    let freq_ref2 = if freq_usb == 0.0 {
        0.0
    } else {
        (freq_usb - freq_lsb) / (2.0 * cold)
    };
    let beat_note = freq_lsb + freq_ref2;
    let slave_laser_mhz = ((REF_LASER_FREQ - beat_note) * 1000.0).round() as u32;

    for m in MULTIPLIERS {
        if window_fits(m, beat_note) {
            return Ok(LortmTuning {
                band,
                freq_lsb,
                freq_usb,
                freq_ref1: (beat_note + BEAT_OFFSET) / m as f64,
                freq_ref2,
                multiplier: m,
                beat_note,
                slave_laser_mhz,
            });
        }
    }
    Err(FemcError::invalid_input(format!(
        "no multiplier window fits band {} beat note {:.6} GHz",
        band, beat_note
    )))
}

struct PollState {
    last_headline: Option<Instant>,
    last_secondary: Option<Instant>,
}

/// Last-polled LORTM state.
#[derive(Debug, Clone, Serialize)]
pub struct LortmSnapshot {
    pub system_state: Monitored<u8>,
    pub phase_lock_state: Monitored<u8>,
    pub laser_temps: [Monitored<f32>; 4],
    pub tuning: LortmTuning,
}

pub struct Lortm {
    core: DeviceCore,
    system_state: MonitorPoint<u8>,
    phase_lock_state: MonitorPoint<u8>,
    laser_temps: [MonitorPoint<f32>; 4],
    tuning: RwLock<LortmTuning>,
    registry: Mutex<MonitorRegistry>,
    poll: Mutex<PollState>,
}

impl Lortm {
    pub fn new(config: Arc<FemcConfig>) -> Arc<Self> {
        let lortm = Arc::new(Lortm {
            core: DeviceCore::new("lortm", config),
            system_state: MonitorPoint::new(),
            phase_lock_state: MonitorPoint::new(),
            laser_temps: Default::default(),
            tuning: RwLock::new(LortmTuning::default()),
            registry: Mutex::new(MonitorRegistry::new()),
            poll: Mutex::new(PollState {
                last_headline: None,
                last_secondary: None,
            }),
        });
        lortm.build_registry();
        lortm
    }

    pub fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn build_registry(self: &Arc<Self>) {
        let mut reg = self.registry.lock();
        for laser in 0..4u16 {
            let dev = Arc::downgrade(self);
            let point = self.laser_temps[laser as usize].clone();
            reg.add(move |_| {
                if let Some(dev) = dev.upgrade() {
                    point.store(
                        dev.core
                            .sync_monitor::<f32>(lortm_rca(LASER_TEMP_BASE + laser * 4)),
                    );
                }
            });
        }
    }

    /// Plan and program a tuning. A failed plan clears the stored tuning so
    /// stale frequencies never linger; a successful one is stored and the
    /// slave laser is commanded.
    pub fn tune(
        &self,
        band: u8,
        freq_lo1: f64,
        freq_lo2: f64,
        floog: f64,
        selector: u8,
    ) -> FemcResult<LortmTuning> {
        let planned = match plan_tuning(band, freq_lo1, freq_lo2, floog, selector) {
            Ok(t) => t,
            Err(e) => {
                *self.tuning.write() = LortmTuning::default();
                return Err(e);
            }
        };
        self.core
            .sync_command(lortm_rca(SLAVE_LASER_FREQUENCY), &planned.slave_laser_mhz)?;
        *self.tuning.write() = planned;
        self.core.log_event(format!(
            "tuned band {}: M={} beat {:.6} GHz, slave laser {} MHz",
            planned.band, planned.multiplier, planned.beat_note, planned.slave_laser_mhz
        ));
        Ok(planned)
    }

    pub fn tuning(&self) -> LortmTuning {
        *self.tuning.read()
    }

    pub fn snapshot(&self) -> LortmSnapshot {
        LortmSnapshot {
            system_state: self.system_state.get(),
            phase_lock_state: self.phase_lock_state.get(),
            laser_temps: std::array::from_fn(|i| self.laser_temps[i].get()),
            tuning: self.tuning(),
        }
    }
}

impl MonitorDevice for Lortm {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn monitor_action(&self, timestamp: Timestamp) {
        let mut poll = self.poll.lock();
        let headline_due = poll
            .last_headline
            .map_or(true, |t| t.elapsed() >= HEADLINE_INTERVAL);
        if headline_due {
            poll.last_headline = Some(Instant::now());
            self.system_state
                .store(self.core.sync_monitor::<u8>(lortm_rca(SYSTEM_STATE)));
            self.phase_lock_state
                .store(self.core.sync_monitor::<u8>(lortm_rca(PHASE_LOCK_STATE)));
        }
        let secondary_due = poll
            .last_secondary
            .map_or(true, |t| t.elapsed() >= SECONDARY_INTERVAL);
        if secondary_due {
            // One temperature per due tick; the registry spreads the rest
            // across later intervals.
            if !self.registry.lock().execute_next_mon(timestamp) {
                return;
            }
            poll.last_secondary = Some(Instant::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use femc_core::bus::sim::SimulatedBus;
    use femc_core::bus::BusInterface;
    use femc_core::codec::WireType;

    #[test]
    fn single_lo_plan_reproduces_the_arithmetic() {
        // Band 6: cold multiplier 6. 200 / 6 = 33.3333 GHz, + 0.03 FLOOG
        // (selector 0 adds), no second LO.
        let t = plan_tuning(6, 200.0, 0.0, 0.03, 0).unwrap();
        assert!((t.freq_lsb - (200.0 / 6.0 + 0.03)).abs() < 1e-9);
        assert_eq!(t.freq_usb, 0.0);
        assert_eq!(t.freq_ref2, 0.0);
        assert!((t.beat_note - t.freq_lsb).abs() < 1e-12);
        // 33.36 GHz fits the M=2 window (<= 39).
        assert_eq!(t.multiplier, 2);
        assert!((t.freq_ref1 - (t.beat_note + 0.125) / 2.0).abs() < 1e-12);
        // 194 THz master minus the beat note, rounded to integer MHz.
        assert_eq!(t.slave_laser_mhz, 193_966_637);
    }

    #[test]
    fn dual_lo_plan_orders_sidebands_and_derives_ref2() {
        // Band 6, both LOs in use, given upper first: 230 / 6 = 38.333,
        // 200 / 6 = 33.333, selector 1 subtracts the FLOOG from both.
        let t = plan_tuning(6, 230.0, 200.0, 0.0315, 1).unwrap();
        assert!((t.freq_lsb - (200.0 / 6.0 - 0.0315)).abs() < 1e-9);
        assert!((t.freq_usb - (230.0 / 6.0 - 0.0315)).abs() < 1e-9);
        // ref2 = (USB - LSB) / (2 * cold); the FLOOG cancels in the spread.
        assert!((t.freq_ref2 - (30.0 / 6.0) / 12.0).abs() < 1e-9);
        assert!((t.beat_note - (t.freq_lsb + t.freq_ref2)).abs() < 1e-12);
        assert_eq!(t.multiplier, 2);
    }

    #[test]
    fn multiplier_windows_select_in_order() {
        // Beat 75 GHz misses M=2 (<= 39) and lands in M=5's [64.5, 100).
        let t = plan_tuning(2, 150.0, 0.0, 0.0, 0).unwrap();
        assert_eq!(t.beat_note, 75.0);
        assert_eq!(t.multiplier, 5);
        assert!((t.freq_ref1 - 75.125 / 5.0).abs() < 1e-12);

        // Beat 120 GHz lands in M=7's [100, 150].
        let t = plan_tuning(1, 120.0, 0.0, 0.0, 0).unwrap();
        assert_eq!(t.multiplier, 7);

        // The clamp pins an over-range reduction to 150, the inclusive
        // upper edge of the M=7 window.
        let t = plan_tuning(1, 160.0, 0.0, 0.0, 0).unwrap();
        assert_eq!(t.beat_note, 150.0);
        assert_eq!(t.multiplier, 7);
        assert_eq!(t.slave_laser_mhz, 193_850_000);
    }

    #[test]
    fn unreachable_tunings_are_rejected() {
        // Beat 50 GHz falls in the gap between the M=2 and M=5 windows.
        assert!(plan_tuning(1, 50.0, 0.0, 0.0, 0).is_err());
        // Both reductions below the 24 GHz floor.
        assert!(plan_tuning(1, 15.0, 0.0, 0.0, 0).is_err());
        assert!(plan_tuning(6, 100.0, 120.0, 0.0, 0).is_err());
        // Argument validation.
        assert!(plan_tuning(0, 120.0, 0.0, 0.0, 0).is_err());
        assert!(plan_tuning(11, 120.0, 0.0, 0.0, 0).is_err());
        assert!(plan_tuning(1, -1.0, 0.0, 0.0, 0).is_err());
        assert!(plan_tuning(1, 120.0, 0.0, 0.0, 2).is_err());
    }

    #[test]
    fn floor_drops_one_lo_but_keeps_the_other() {
        // Band 1: 15 GHz is below the floor and drops out; 120 GHz
        // survives alone as the LSB.
        let t = plan_tuning(1, 15.0, 120.0, 0.0, 0).unwrap();
        assert_eq!(t.freq_lsb, 120.0);
        assert_eq!(t.freq_usb, 0.0);
        assert_eq!(t.freq_ref2, 0.0);
        assert_eq!(t.multiplier, 7);
    }

    #[test]
    fn tune_programs_the_slave_laser_and_stores_the_plan() {
        let bus = Arc::new(SimulatedBus::new());
        let lortm = Lortm::new(Arc::new(FemcConfig::default()));
        lortm
            .core()
            .initialize(Arc::clone(&bus) as Arc<dyn BusInterface>, 0, 0x22);

        let t = lortm.tune(6, 200.0, 0.0, 0.0, 0).unwrap();
        assert_eq!(
            bus.commands_for(lortm_rca(SLAVE_LASER_FREQUENCY)),
            vec![t.slave_laser_mhz.encode()]
        );
        assert_eq!(lortm.tuning(), t);

        // A failed plan clears the stored tuning.
        assert!(lortm.tune(1, 50.0, 0.0, 0.0, 0).is_err());
        assert_eq!(lortm.tuning(), LortmTuning::default());
    }
}
