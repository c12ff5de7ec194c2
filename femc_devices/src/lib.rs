//! # femc_devices
//!
//! Device drivers and closed-loop control processes for the front-end,
//! built on the `femc_core` transaction substrate:
//!
//! - **coldcart**: per-band cold cartridge bias (SIS voltage sweeps,
//!   readback-offset calibration, I-V curves, deflux mixer heating)
//! - **cryostat**: temperature/vacuum monitoring and the pump-down
//!   sequence
//! - **lortm**: LO reference phase-lock planning and slave-laser tuning
//! - **ifswitch**: IF routing, step attenuators and the temperature servo
//!
//! Every device embeds a `DeviceCore`, exposes its last-polled state as a
//! serializable snapshot, and runs long control processes on worker
//! threads guarded against concurrent starts.

pub mod coldcart;
pub mod cryostat;
pub mod ifswitch;
pub mod lortm;

pub use coldcart::{
    ColdCartSnapshot, ColdCartridge, HeatingParams, HeatingScope, IvCurveParams, IvPoint,
    MixerChannel,
};
pub use cryostat::{Cryostat, CryostatSnapshot, PumpdownParams};
pub use ifswitch::{IfSwitch, IfSwitchSnapshot};
pub use lortm::{plan_tuning, Lortm, LortmSnapshot, LortmTuning, REF_LASER_FREQ};
