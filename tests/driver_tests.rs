use ndirbus::datum::{RawDatum, RecorderDatum};
use ndirbus::sim::{SimBus, SimRail, SIM_IDENT, SIM_TAG};
use ndirbus::*;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

type SimNdir = SpiNdir<SimBus, SimRail>;

fn setup(dialect: Dialect) -> (TempDir, ManualClock, SimDevice, SimNdir) {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::new();
    let device = SimDevice::new(dialect, Arc::new(clock.clone()));
    let ndir = device.driver(BusLock::new(dir.path()), "ndir-driver-test");
    (dir, clock, device, ndir)
}

fn powered(dialect: Dialect) -> (TempDir, ManualClock, SimDevice, SimNdir) {
    let fixture = setup(dialect);
    fixture.3.power_on().unwrap();
    fixture
}

fn unsupported(result: Result<()>) -> bool {
    matches!(
        result,
        Err(NdirError::Configuration(ConfigurationError::Unsupported { .. }))
    )
}

#[test]
fn test_power_on_waits_boot_delay_once() {
    let (_dir, clock, device, ndir) = setup(Dialect::X1);
    assert!(!ndir.is_powered().unwrap());

    ndir.power_on().unwrap();
    ndir.power_on().unwrap();

    assert!(device.is_powered());
    assert!(ndir.is_powered().unwrap());
    assert_eq!(clock.count_sleeps(Duration::from_millis(3_500)), 1);

    ndir.power_off().unwrap();
    ndir.power_off().unwrap();
    assert!(!device.is_powered());
}

#[test]
fn test_boot_delay_per_dialect() {
    let (_dir, clock, _device, ndir) = setup(Dialect::V1);
    ndir.power_on().unwrap();
    assert_eq!(clock.count_sleeps(Duration::from_millis(2_500)), 1);
    assert_eq!(clock.count_sleeps(Duration::from_millis(3_500)), 0);
}

#[test]
fn test_status_document() {
    let (_dir, clock, _device, ndir) = powered(Dialect::X1);
    clock.advance(Duration::from_secs(3_600));

    let status = ndir.status().unwrap();
    assert!(!status.watchdog_reset);
    assert_eq!(status.power_in, Some(11.9));
    assert!(status.uptime.seconds >= 3_603);

    let json = serde_json::to_value(status).unwrap();
    assert_eq!(json["w-rst"], false);
    assert_eq!(json["pwr-in"], 11.9);
    assert!(json["up"]["period"].as_str().unwrap().starts_with("00-01:00:0"));
}

#[test]
fn test_version_strips_padding() {
    let (_dir, _clock, _device, ndir) = powered(Dialect::T1f1);

    let version = ndir.version().unwrap();
    assert_eq!(version.id.as_str(), SIM_IDENT);
    assert_eq!(version.tag.as_str(), SIM_TAG);
}

#[test]
fn test_gas_and_voltage_samples() {
    let (_dir, _clock, device, ndir) = powered(Dialect::X1);

    let gas = ndir.get_sample_gas().unwrap();
    assert_eq!(gas.cnc, Some(412.0));
    assert_eq!(gas.cnc_igl, Some(409.5));
    assert_eq!(gas.temp, Some(23.4));

    device.set_voltage([0.5, f32::NAN, 1.25]);
    let voltage = ndir.get_sample_voltage().unwrap();
    assert_eq!(voltage.pile_ref, Some(0.5));
    assert_eq!(voltage.pile_act, None);
    assert_eq!(voltage.therm, Some(1.25));

    let json = serde_json::to_value(voltage).unwrap();
    assert!(json["pile-act-ampl"].is_null());
    assert_eq!(json["therm-avg"], 1.25);
}

#[test]
fn test_raw_offsets_and_inputs() {
    let (_dir, _clock, device, ndir) = powered(Dialect::X1);
    let config = device.config();

    assert_eq!(ndir.get_sample_raw().unwrap(), RawDatum::from(config.raw));
    assert_eq!(ndir.measure_raw().unwrap(), RawDatum::from(config.raw));

    let offsets = ndir.get_sample_offsets().unwrap();
    assert_eq!(offsets.min_ref_offset, config.offsets[0]);
    assert_eq!(offsets.max_act_offset, config.offsets[3]);

    assert_eq!(ndir.input_raw().unwrap(), config.input_raw);
    assert_eq!(ndir.input_voltage().unwrap(), Some(config.input_voltage));

    let measured = ndir.measure_voltage().unwrap();
    assert_eq!(measured.pile_ref, Some(config.voltage[0]));
}

#[test]
fn test_pressure_command_per_dialect() {
    let (_dir, _clock, device, ndir) = powered(Dialect::T1f1);
    assert_eq!(ndir.get_sample_pressure().unwrap().p_a, Some(101.3));
    assert_eq!(device.last_transaction().unwrap().cmd, "sb");

    let (_dir, _clock, device, ndir) = powered(Dialect::X1);
    assert_eq!(ndir.get_sample_pressure().unwrap().p_a, Some(101.3));
    assert_eq!(device.last_transaction().unwrap().cmd, "sp");
}

#[test]
fn test_triggered_sampling_interval_from_calibration() {
    let (_dir, _clock, device, ndir) = powered(Dialect::T1f1);

    // lamp period 1000 ms + sample end 990 ms + 10 ms
    assert_eq!(ndir.sample_interval().unwrap(), Duration::from_millis(2_000));

    ndir.sample().unwrap();
    assert_eq!(device.stats().triggers, 1);
    assert_eq!(device.last_transaction().unwrap().cmd, "sp");
}

#[test]
fn test_continuous_sampling_needs_no_trigger() {
    let (_dir, _clock, device, ndir) = powered(Dialect::X1);
    let before = device.stats().transactions;

    assert_eq!(ndir.sample_interval().unwrap(), Duration::from_secs(1));
    ndir.sample().unwrap();

    assert_eq!(device.stats().transactions, before);
    assert_eq!(device.stats().triggers, 0);
}

#[test]
fn test_capabilities_missing_on_t1f1() {
    let (_dir, _clock, device, ndir) = powered(Dialect::T1f1);
    let before = device.stats().transactions;

    assert!(unsupported(ndir.lamp_level(4.0)));
    assert!(unsupported(ndir.sample_mode(true)));
    assert_eq!(device.stats().transactions, before);
}

#[test]
fn test_lamp_and_sampler_mode() {
    let (_dir, clock, device, ndir) = powered(Dialect::X1);

    ndir.lamp_level(4.25).unwrap();
    assert_eq!(device.lamp_level(), Some(4.25));

    ndir.sample_mode(true).unwrap();
    assert!(device.single_shot());
    assert_eq!(clock.count_sleeps(Duration::from_millis(2_000)), 1);

    ndir.lamp_run(false).unwrap();
    assert!(!device.lamp_on());
}

#[test]
fn test_recorder_command_based_timing() {
    let (_dir, clock, _device, ndir) = powered(Dialect::X1);

    let records = ndir.record_raw(100, 10, 5).unwrap();
    assert_eq!(records.len(), 5);
    assert_eq!(
        records[2],
        RecorderDatum {
            rec: 20,
            pile_ref: 2_712,
            pile_act: 2_285,
        }
    );

    // rs execution 1.1 s + deferral + interval x count
    assert_eq!(clock.count_sleeps(Duration::from_millis(1_250)), 1);
}

#[test]
fn test_recorder_lamp_period_timing() {
    let (_dir, clock, _device, ndir) = powered(Dialect::T1f1);

    let records = ndir.record_raw(50, 20, 3).unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records[0].rec, 0);

    // lamp period 1000 ms + deferral + interval x count
    assert_eq!(clock.count_sleeps(Duration::from_millis(1_110)), 1);
}

#[test]
fn test_reset_opens_quarantine() {
    let (_dir, clock, device, ndir) = powered(Dialect::X1);
    assert!(!ndir.in_quarantine());
    assert!(ndir.quarantine().is_none());

    let quarantine = ndir.reset().unwrap();
    assert_eq!(quarantine.remaining(clock.now()), Duration::from_secs(8));
    assert!(ndir.in_quarantine());
    assert_eq!(device.stats().resets, 1);
    // the reset flag is cleared as part of the reset
    assert!(!device.watchdog_reset());
    assert_eq!(clock.count_sleeps(Duration::from_millis(2_500)), 1);

    clock.advance(Duration::from_secs(8));
    assert!(!ndir.in_quarantine());
    assert_eq!(ndir.quarantine(), Some(quarantine));
}

#[test]
fn test_watchdog_clear() {
    let (_dir, _clock, device, ndir) = powered(Dialect::V1);

    ndir.transactor().execute("wr", None, None, None).unwrap();
    assert!(device.watchdog_reset());
    assert!(ndir.status().unwrap().watchdog_reset);

    ndir.watchdog_clear().unwrap();
    assert!(!ndir.status().unwrap().watchdog_reset);
}

#[test]
fn test_driver_behind_trait_object() {
    let (_dir, _clock, _device, ndir) = powered(Dialect::V1);
    let ndir: Arc<dyn Ndir> = Arc::new(ndir);

    assert_eq!(ndir.dialect(), Dialect::V1);
    ndir.measure_calibrate().unwrap();
    assert!(ndir.get_sample_gas().is_ok());
}
