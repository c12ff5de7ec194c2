//! SIS junction I-V curve measurement.
//!
//! The curve sweeps the junction voltage across a caller-supplied window,
//! first up then back down, so hysteresis around the gap voltage shows in
//! the data. Each point is a short settled average; the prior bias setting
//! is restored when the sweep finishes or is cancelled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;

use femc_core::error::{FemcError, FemcResult};
use femc_core::events::EventSink;

use super::{ColdCartridge, MixerChannel};

/// Settling delay after each voltage step.
const POINT_SETTLE: Duration = Duration::from_millis(1);

/// Samples averaged per point.
const POINT_SAMPLES: u32 = 3;

/// One measured curve point. The commanded set voltage is kept alongside
/// the readbacks so offset and hysteresis are visible.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct IvPoint {
    /// Commanded junction voltage (mV).
    pub set_voltage: f32,
    /// Measured junction voltage (mV).
    pub voltage: f32,
    /// Measured junction current (uA).
    pub current: f32,
}

/// Sweep window for [`ColdCartridge::measure_iv_curve`].
#[derive(Debug, Clone, Copy)]
pub struct IvCurveParams {
    pub pol: u8,
    pub sb: u8,
    /// Lower edge of the window (mV).
    pub from: f32,
    /// Upper edge of the window (mV).
    pub to: f32,
    /// Step between points (mV), positive.
    pub step: f32,
}

impl IvCurveParams {
    fn validate(&self) -> FemcResult<()> {
        if !self.to.is_finite() || !self.from.is_finite() || !self.step.is_finite() {
            return Err(FemcError::invalid_input("I-V window is not finite"));
        }
        if self.to <= self.from {
            return Err(FemcError::invalid_input(format!(
                "I-V window is empty: {} .. {}",
                self.from, self.to
            )));
        }
        if self.step <= 0.0 || self.step > self.to - self.from {
            return Err(FemcError::invalid_input(format!(
                "I-V step {} does not fit window {} .. {}",
                self.step, self.from, self.to
            )));
        }
        Ok(())
    }

    /// Grid points from the lower edge in `step` increments, inclusive of
    /// the upper edge when it lands on the grid.
    fn points(&self) -> Vec<f32> {
        let n = ((self.to - self.from) / self.step).floor() as usize;
        (0..=n).map(|i| self.from + i as f32 * self.step).collect()
    }
}

impl ColdCartridge {
    /// Measure an I-V curve: ramp to the window's lower edge, sweep up
    /// point by point, then sweep back down over the same grid. Each point
    /// is commanded directly (no ramp), settled 1 ms, then junction voltage
    /// and current are read as 3-sample averages; current is scaled from mA
    /// to uA. Progress runs 0-50% over the up sweep and 50-100% over the
    /// down sweep. Cancellable at every point via `stop`; the prior bias
    /// setting is restored on every exit path.
    pub fn measure_iv_curve(
        &self,
        params: IvCurveParams,
        stop: &AtomicBool,
        sink: &dyn EventSink,
    ) -> FemcResult<Vec<IvPoint>> {
        let ch = MixerChannel::from_pol_sb(params.pol, params.sb)?;
        if !self.has_sis() {
            return Err(FemcError::device(
                self.core.name(),
                "band has no SIS mixers",
            ));
        }
        params.validate()?;
        if self.iv_busy.swap(true, Ordering::SeqCst) {
            return Err(FemcError::Busy("I-V curve".into()));
        }
        let result = self.iv_curve_inner(ch, &params, stop, sink);
        self.iv_busy.store(false, Ordering::SeqCst);
        result
    }

    fn iv_curve_inner(
        &self,
        ch: MixerChannel,
        params: &IvCurveParams,
        stop: &AtomicBool,
        sink: &dyn EventSink,
    ) -> FemcResult<Vec<IvPoint>> {
        let prior = self.settings.read().sis_voltage[ch.index()];
        let grid = params.points();
        let total = grid.len();
        let mut curve = Vec::with_capacity(total * 2);

        // Ramp to the window edge, then walk the grid directly.
        self.set_sis_voltage_ch(ch, params.from, true)?;

        let mut run = |points: &mut dyn Iterator<Item = (usize, f32)>,
                       progress_base: u8|
         -> FemcResult<()> {
            for (i, v) in points {
                if stop.load(Ordering::SeqCst) {
                    return Err(FemcError::aborted("I-V curve"));
                }
                self.command_sis_voltage(ch, v)?;
                std::thread::sleep(POINT_SETTLE);
                let voltage = self
                    .core
                    .sync_monitor_average(self.rca_sis_voltage(ch), POINT_SAMPLES)?;
                let current = self
                    .core
                    .sync_monitor_average(self.rca_sis_current(ch), POINT_SAMPLES)?
                    * 1000.0;
                curve.push(IvPoint {
                    set_voltage: v,
                    voltage,
                    current,
                });
                sink.progress(progress_base + (((i + 1) * 50) / total) as u8);
            }
            Ok(())
        };

        let swept = run(&mut grid.iter().copied().enumerate(), 0).and_then(|_| {
            run(
                &mut grid.iter().copied().enumerate().rev().map(|(i, v)| (total - 1 - i, v)),
                50,
            )
        });

        // Restore the prior bias whether the sweep finished or not.
        let restored = self.set_sis_voltage_ch(ch, prior, true);
        match swept {
            Ok(()) => {
                restored?;
                sink.status(true, "I-V curve complete");
                sink.progress(0);
                Ok(curve)
            }
            Err(e) => {
                let _ = restored;
                sink.status(false, &format!("I-V curve failed: {}", e));
                sink.progress(0);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use femc_core::bus::sim::SimulatedBus;
    use femc_core::bus::BusInterface;
    use femc_core::codec::WireType;
    use femc_core::events::NullSink;
    use femc_core::FemcConfig;
    use std::sync::Arc;

    fn rigged(band: u8) -> (Arc<ColdCartridge>, Arc<SimulatedBus>) {
        let bus = Arc::new(SimulatedBus::new());
        let cart = ColdCartridge::new(band, Arc::new(FemcConfig::default()));
        cart.core()
            .initialize(Arc::clone(&bus) as Arc<dyn BusInterface>, 0, 0x13);
        (cart, bus)
    }

    fn window(from: f32, to: f32, step: f32) -> IvCurveParams {
        IvCurveParams {
            pol: 0,
            sb: 1,
            from,
            to,
            step,
        }
    }

    #[test]
    fn sweeps_up_then_down_with_scaled_current() {
        let (cart, bus) = rigged(6);
        let ch = MixerChannel::Pol0Sb1;
        bus.set_monitor_f32(cart.rca_sis_voltage(ch), 2.0);
        bus.set_monitor_f32(cart.rca_sis_current(ch), 0.035);

        let curve = cart
            .measure_iv_curve(window(0.0, 4.0, 1.0), &AtomicBool::new(false), &NullSink)
            .unwrap();
        // 5 grid points, visited twice.
        assert_eq!(curve.len(), 10);
        let sets: Vec<f32> = curve.iter().map(|p| p.set_voltage).collect();
        assert_eq!(
            sets,
            vec![0.0, 1.0, 2.0, 3.0, 4.0, 4.0, 3.0, 2.0, 1.0, 0.0]
        );
        // mA readback surfaces as uA.
        assert!((curve[0].current - 35.0).abs() < 1e-3);
        // Bias restored to the prior setting (0.0 before the run).
        let cmds = bus.commands_for(cart.rca_sis_voltage(ch));
        let last = cmds.last().unwrap();
        assert_eq!(*last, 0.0f32.encode());
    }

    #[test]
    fn rejects_bad_windows() {
        let (cart, _bus) = rigged(6);
        let stop = AtomicBool::new(false);
        assert!(cart
            .measure_iv_curve(window(2.0, 2.0, 0.5), &stop, &NullSink)
            .is_err());
        assert!(cart
            .measure_iv_curve(window(0.0, 1.0, 0.0), &stop, &NullSink)
            .is_err());
        assert!(cart
            .measure_iv_curve(window(0.0, 1.0, 5.0), &stop, &NullSink)
            .is_err());
    }

    #[test]
    fn rejects_bands_without_sis() {
        let (cart, _bus) = rigged(2);
        let err = cart
            .measure_iv_curve(window(0.0, 1.0, 0.5), &AtomicBool::new(false), &NullSink)
            .unwrap_err();
        assert!(matches!(err, FemcError::Device { .. }));
    }

    #[test]
    fn stop_flag_aborts_and_restores_bias() {
        let (cart, bus) = rigged(6);
        let ch = MixerChannel::Pol0Sb1;
        bus.set_monitor_f32(cart.rca_sis_voltage(ch), 2.0);
        bus.set_monitor_f32(cart.rca_sis_current(ch), 0.035);

        // Pre-set the flag: the very first point aborts.
        let stop = AtomicBool::new(true);
        let err = cart
            .measure_iv_curve(window(0.0, 4.0, 1.0), &stop, &NullSink)
            .unwrap_err();
        assert!(matches!(err, FemcError::Aborted(_)));
        // The restore command still went out.
        let cmds = bus.commands_for(cart.rca_sis_voltage(ch));
        assert_eq!(*cmds.last().unwrap(), 0.0f32.encode());
    }
}
