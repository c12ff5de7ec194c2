//! Full-stack scenario: a simulated front end with a cold cartridge, the
//! IF switch and the LORTM, polled in the background while an observation
//! is set up.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use femc_core::bus::sim::SimulatedBus;
use femc_core::{start_monitor, BusInterface, BusStatus, FemcConfig, TransactionLogger};
use femc_devices::{ColdCartridge, IfSwitch, Lortm, MixerChannel};

fn wire_cartridge(bus: &SimulatedBus, cart: &ColdCartridge) {
    // A quiet, healthy band-6 cartridge at 4 K.
    for ch in MixerChannel::ALL {
        bus.set_monitor_f32(cart.rca_sis_voltage(ch), 2.2);
        bus.set_monitor_f32(cart.rca_sis_current(ch), 0.032);
        bus.set_monitor_f32(cart.rca_magnet_current(ch), 0.0);
        bus.set_monitor(cart.rca_lna_enable(ch), 1u8);
    }
    for pol in 0..2u8 {
        bus.set_monitor(cart.rca_heater_enable(pol), 0u8);
        bus.set_monitor_f32(cart.rca_heater_current(pol), 0.6);
        bus.set_monitor_f32(cart.rca_mixer_temp(pol), 4.2);
    }
}

#[test]
fn observation_setup_end_to_end() {
    let _ = env_logger::builder().is_test(true).try_init();

    let bus = Arc::new(SimulatedBus::with_jitter(true));
    let config = Arc::new(FemcConfig {
        randomize_analog: true,
        ..FemcConfig::default()
    });
    let logger = TransactionLogger::new();
    logger.start();

    // Band 6 cartridge, polled in the background.
    let cart = ColdCartridge::new(6, Arc::clone(&config));
    cart.core()
        .initialize(Arc::clone(&bus) as Arc<dyn BusInterface>, 0, 0x13);
    cart.core().attach_logger(Arc::clone(&logger));
    wire_cartridge(&bus, &cart);
    start_monitor(&cart).unwrap();

    // Route the band through the IF switch.
    let ifswitch = IfSwitch::new(Arc::clone(&config));
    ifswitch
        .core()
        .initialize(Arc::clone(&bus) as Arc<dyn BusInterface>, 0, 0x13);
    ifswitch.core().attach_logger(Arc::clone(&logger));
    ifswitch.set_observing_band(6).unwrap();
    ifswitch.set_attenuation(0, 7).unwrap();

    // Plan and program the LO reference.
    let lortm = Lortm::new(Arc::clone(&config));
    lortm
        .core()
        .initialize(Arc::clone(&bus) as Arc<dyn BusInterface>, 0, 0x22);
    lortm.core().attach_logger(Arc::clone(&logger));
    let tuning = lortm.tune(6, 200.0, 0.0, 0.0, 0).unwrap();
    assert_eq!(tuning.multiplier, 2);
    assert_eq!(lortm.tuning(), tuning);

    // Bias the mixers while polling runs.
    cart.set_sis_voltage(0, 1, 2.1, false).unwrap();
    cart.set_sis_voltage(0, 2, 2.1, false).unwrap();

    // Let the poller cover a few full registry cycles.
    thread::sleep(Duration::from_millis(150));

    let snap = cart.snapshot();
    let ch = MixerChannel::Pol0Sb1;
    assert_eq!(snap.sis_voltage[ch.index()].status, BusStatus::NoError);
    // Jittered analog readback stays within 1% of the wired 2.2 mV.
    assert!(
        (snap.sis_voltage[ch.index()].value - 2.2).abs() < 0.022,
        "polled {}",
        snap.sis_voltage[ch.index()].value
    );
    assert!((snap.sis_current[ch.index()].value - 0.032).abs() < 0.001);

    // Snapshots are plain serializable telemetry.
    let json = serde_json::to_value(&snap).unwrap();
    assert_eq!(json["band"], 6);
    assert!(json["sis_voltage"].as_array().unwrap().len() == 4);

    // Orderly shutdown: polling stops, the logger flushes.
    cart.core().stop_monitor();
    logger.stop();
    assert_eq!(logger.queued(), 0);
}
