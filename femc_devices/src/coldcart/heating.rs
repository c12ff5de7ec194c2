//! SIS mixer deflux heating.
//!
//! Heats the selected mixer blocks to drive trapped magnetic flux out of
//! the junctions, then waits for them to cool back down. The cartridge
//! heaters have a hardware self-timeout, so the loop watches the heater
//! current and re-triggers whenever a heater trips itself off.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use femc_core::error::{FemcError, FemcResult};
use femc_core::events::EventSink;

use super::{ColdCartridge, MixerChannel};

/// Main loop tick.
const HEATING_TICK: Duration = Duration::from_millis(20);

/// Cooldown poll tick and bound (5 minutes).
const COOLDOWN_TICK: Duration = Duration::from_secs(1);
const COOLDOWN_MAX_TICKS: u32 = 300;

/// Baseline and logging sample counts.
const BASELINE_SAMPLES: u32 = 10;
const LOG_CURRENT_SAMPLES: u32 = 8;

/// A heater is considered ON while its current sits this far above the
/// heater-off baseline.
const HEATER_ON_DELTA: f32 = 1.0;

/// Cooled down means back within this margin of the pre-heating mixer
/// temperature.
const COOLDOWN_DELTA: f32 = 0.20;

/// Below this target the mixers never report "reached": the process heats
/// for the full timeout instead.
const TARGET_FLOOR: f32 = 4.0;

/// Band 9 mixers tolerate only a short pulse.
const BAND9_MAX_TIMEOUT: Duration = Duration::from_secs(3);

/// Which polarization's heaters to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeatingScope {
    Pol0,
    Pol1,
    Both,
}

impl HeatingScope {
    /// Normalize the external convention: 0, 1, or -1 for both.
    pub fn from_raw(pol: i32) -> FemcResult<Self> {
        match pol {
            0 => Ok(HeatingScope::Pol0),
            1 => Ok(HeatingScope::Pol1),
            -1 => Ok(HeatingScope::Both),
            _ => Err(FemcError::invalid_input(format!(
                "heating polarization {} (want 0, 1 or -1)",
                pol
            ))),
        }
    }

    fn selected(self) -> [bool; 2] {
        match self {
            HeatingScope::Pol0 => [true, false],
            HeatingScope::Pol1 => [false, true],
            HeatingScope::Both => [true, true],
        }
    }
}

/// Parameters for [`ColdCartridge::run_mixer_heating`].
#[derive(Debug, Clone)]
pub struct HeatingParams {
    pub scope: HeatingScope,
    /// Mixer target temperature (K), 0..=20. Targets below the 4.0 K floor
    /// mean "heat for the full timeout".
    pub target_temp: f32,
    /// Heating timeout, 0..=120 s. Clamped to 3 s on band 9.
    pub timeout: Duration,
    /// Optional TSV capture of the heating run.
    pub log_path: Option<PathBuf>,
}

struct HeatingLog {
    out: BufWriter<File>,
}

impl HeatingLog {
    fn create(path: &Path) -> FemcResult<Self> {
        let mut out = BufWriter::new(File::create(path)?);
        writeln!(
            out,
            "time\theaterI0\theaterI1\tmixerT0\tmixerT1\tIj01\tIj02\tIj11\tIj12"
        )?;
        Ok(HeatingLog { out })
    }

    fn row(
        &mut self,
        elapsed: Duration,
        currents: [f32; 2],
        temps: [f32; 2],
        junction: [f32; 4],
    ) -> FemcResult<()> {
        writeln!(
            self.out,
            "{:.3}\t{:.4}\t{:.4}\t{:.4}\t{:.4}\t{:.4}\t{:.4}\t{:.4}\t{:.4}",
            elapsed.as_secs_f64(),
            currents[0],
            currents[1],
            temps[0],
            temps[1],
            junction[0],
            junction[1],
            junction[2],
            junction[3],
        )?;
        Ok(())
    }
}

/// Outcome of the heating loop proper, before cleanup and cooldown.
struct HeatingRun {
    aborted: bool,
    off_threshold: [f32; 2],
}

impl ColdCartridge {
    /// Run the deflux heating process to completion on the calling thread.
    ///
    /// Sequence: park the selected polarizations' magnets (ramp to zero,
    /// drop the enable flag), measure heater-off baselines, enable the
    /// heaters, hold the mixers at/above `target_temp` until every selected
    /// one reached it or the timeout expired (re-triggering heaters that
    /// trip their hardware self-timeout), switch the heaters off, wait for
    /// cooldown back near the baseline temperature, and finally restore the
    /// magnet enable flags found at the start. The magnet current is NOT
    /// re-driven; re-energizing is the operator's call after defluxing.
    /// The heater-off and magnet-flag restore run on every exit path,
    /// failed runs included.
    pub fn run_mixer_heating(
        &self,
        params: &HeatingParams,
        stop: &AtomicBool,
        sink: &dyn EventSink,
    ) -> FemcResult<()> {
        if !self.has_sis() {
            return Err(FemcError::device(
                self.core.name(),
                "band has no SIS mixers to deflux",
            ));
        }
        if !(0.0..=20.0).contains(&params.target_temp) {
            return Err(FemcError::invalid_input(format!(
                "heating target {} K outside 0..=20",
                params.target_temp
            )));
        }
        if params.timeout > Duration::from_secs(120) {
            return Err(FemcError::invalid_input(format!(
                "heating timeout {:?} outside 0..=120 s",
                params.timeout
            )));
        }
        if self.heating_busy.swap(true, Ordering::SeqCst) {
            return Err(FemcError::Busy("mixer heating".into()));
        }
        let result = self.heating_inner(params, stop, sink);
        self.heating_busy.store(false, Ordering::SeqCst);
        match &result {
            Ok(()) => sink.status(true, "mixer heating complete"),
            Err(e) => sink.status(false, &format!("mixer heating failed: {}", e)),
        }
        sink.progress(0);
        result
    }

    /// Spawn [`Self::run_mixer_heating`] on a worker thread. The busy guard
    /// inside the run rejects a second concurrent start.
    pub fn start_mixer_heating(
        self: &Arc<Self>,
        params: HeatingParams,
        stop: Arc<AtomicBool>,
        sink: Arc<dyn EventSink>,
    ) -> std::io::Result<thread::JoinHandle<FemcResult<()>>> {
        let cart = Arc::clone(self);
        thread::Builder::new()
            .name(format!("heat-{}", self.core.name()))
            .spawn(move || cart.run_mixer_heating(&params, &stop, sink.as_ref()))
    }

    fn heating_inner(
        &self,
        params: &HeatingParams,
        stop: &AtomicBool,
        sink: &dyn EventSink,
    ) -> FemcResult<()> {
        let selected = params.scope.selected();
        let timeout = if self.band == 9 {
            params.timeout.min(BAND9_MAX_TIMEOUT)
        } else {
            params.timeout
        };

        // Magnets must be off while heating; remember which were enabled.
        let mut magnet_was_enabled = [false; 4];
        for ch in MixerChannel::ALL {
            if selected[ch.pol() as usize] {
                magnet_was_enabled[ch.index()] = self.park_magnet(ch)?;
            }
        }

        let run = self.heating_run(params, timeout, selected, stop);

        // Heaters off on every exit path, failed runs included, before
        // anything else happens. A failed off-command is logged and the
        // remaining cleanup still runs.
        let mut cleanup_err: Option<FemcError> = None;
        for pol in 0..2u8 {
            if selected[pol as usize] {
                if let Err(e) = self.core.sync_command(self.rca_heater_enable(pol), &0u8) {
                    log::error!(
                        "{}: heater {} off command failed: {}",
                        self.core.name(),
                        pol,
                        e
                    );
                    cleanup_err.get_or_insert(e);
                }
            }
        }

        let cooldown = match &run {
            Ok(r) if !r.aborted => {
                sink.progress(50);
                self.cooldown_wait(selected, r.off_threshold, stop)
            }
            _ => Ok(()),
        };

        // Restore the enable flags found at the start even when the run
        // failed; leave the current at zero.
        for ch in MixerChannel::ALL {
            if magnet_was_enabled[ch.index()] {
                if let Err(e) = self.command_magnet_enable(ch, true) {
                    log::error!(
                        "{}: magnet flag restore pol{} sb{} failed: {}",
                        self.core.name(),
                        ch.pol(),
                        ch.sb(),
                        e
                    );
                    cleanup_err.get_or_insert(e);
                }
            }
        }

        let run = run?;
        cooldown?;
        if let Some(e) = cleanup_err {
            return Err(e);
        }
        if run.aborted {
            Err(FemcError::aborted("mixer heating"))
        } else {
            Ok(())
        }
    }

    /// Baselines, heater enable and the 20 ms hold loop. Only the selected
    /// polarizations' sensors are touched; errors propagate to the caller,
    /// which owns the cleanup.
    fn heating_run(
        &self,
        params: &HeatingParams,
        timeout: Duration,
        selected: [bool; 2],
        stop: &AtomicBool,
    ) -> FemcResult<HeatingRun> {
        // Heater-off baselines per selected polarization.
        let mut on_threshold = [f32::MAX; 2];
        let mut off_threshold = [f32::MIN; 2];
        for pol in 0..2u8 {
            if !selected[pol as usize] {
                continue;
            }
            self.core.sync_command(self.rca_heater_enable(pol), &0u8)?;
            let base_current = self
                .core
                .sync_monitor_average(self.rca_heater_current(pol), BASELINE_SAMPLES)?;
            let base_temp = self
                .core
                .sync_monitor_average(self.rca_mixer_temp(pol), BASELINE_SAMPLES)?;
            on_threshold[pol as usize] = base_current + HEATER_ON_DELTA;
            off_threshold[pol as usize] = base_temp + COOLDOWN_DELTA;
        }

        let mut log = match &params.log_path {
            Some(path) => Some(HeatingLog::create(path)?),
            None => None,
        };

        for pol in 0..2u8 {
            if selected[pol as usize] {
                self.core.sync_command(self.rca_heater_enable(pol), &1u8)?;
            }
        }
        self.core.log_event(format!(
            "mixer heating started, target {} K, timeout {:?}",
            params.target_temp, timeout
        ));

        let start = Instant::now();
        loop {
            if stop.load(Ordering::SeqCst) {
                return Ok(HeatingRun {
                    aborted: true,
                    off_threshold,
                });
            }
            if start.elapsed() > timeout {
                self.core.log_event("mixer heating timeout reached");
                break;
            }

            let mut temps = [0.0f32; 2];
            let mut currents = [0.0f32; 2];
            for pol in 0..2u8 {
                if !selected[pol as usize] {
                    continue;
                }
                temps[pol as usize] = self
                    .core
                    .sync_monitor::<f32>(self.rca_mixer_temp(pol))?
                    .value;
                currents[pol as usize] = self
                    .core
                    .sync_monitor::<f32>(self.rca_heater_current(pol))?
                    .value;
            }

            let reached = |pol: usize| {
                !selected[pol]
                    || (params.target_temp >= TARGET_FLOOR && temps[pol] >= params.target_temp)
            };
            if reached(0) && reached(1) {
                break;
            }

            // A heater that tripped its hardware self-timeout reads back
            // at the off-level current; cycle the selected heaters to
            // re-trigger it.
            let tripped = (0..2).any(|pol| selected[pol] && currents[pol] < on_threshold[pol]);
            if tripped {
                for pol in 0..2u8 {
                    if selected[pol as usize] {
                        self.core.sync_command(self.rca_heater_enable(pol), &0u8)?;
                        self.core.sync_command(self.rca_heater_enable(pol), &1u8)?;
                    }
                }
            }

            if let Some(log) = log.as_mut() {
                let mut junction = [0.0f32; 4];
                for ch in MixerChannel::ALL {
                    junction[ch.index()] = self
                        .core
                        .sync_monitor_average(self.rca_sis_current(ch), LOG_CURRENT_SAMPLES)?;
                }
                log.row(start.elapsed(), currents, temps, junction)?;
            }

            thread::sleep(HEATING_TICK);
        }
        Ok(HeatingRun {
            aborted: false,
            off_threshold,
        })
    }

    /// Wait (1 s tick, bounded) until every selected mixer is back below
    /// its pre-heating temperature threshold.
    fn cooldown_wait(
        &self,
        selected: [bool; 2],
        off_threshold: [f32; 2],
        stop: &AtomicBool,
    ) -> FemcResult<()> {
        for _ in 0..COOLDOWN_MAX_TICKS {
            if stop.load(Ordering::SeqCst) {
                return Err(FemcError::aborted("mixer heating"));
            }
            let mut cooled = true;
            for pol in 0..2u8 {
                if !selected[pol as usize] {
                    continue;
                }
                let temp = self
                    .core
                    .sync_monitor::<f32>(self.rca_mixer_temp(pol))?
                    .value;
                if temp >= off_threshold[pol as usize] {
                    cooled = false;
                }
            }
            if cooled {
                break;
            }
            thread::sleep(COOLDOWN_TICK);
        }
        Ok(())
    }
}
