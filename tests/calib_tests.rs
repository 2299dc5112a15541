use ndirbus::calib::{range_block, BLOCK_COMMON, INDEX_IS_SET};
use ndirbus::sim::{SimBus, SimRail};
use ndirbus::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

type SimNdir = SpiNdir<SimBus, SimRail>;

fn powered(dialect: Dialect) -> (TempDir, ManualClock, SimDevice, SimNdir) {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::new();
    let device = SimDevice::new(dialect, Arc::new(clock.clone()));
    let ndir = device.driver(BusLock::new(dir.path()), "ndir-calib-test");
    ndir.power_on().unwrap();
    (dir, clock, device, ndir)
}

fn custom_calib() -> NdirCalib {
    NdirCalib {
        ndir_serial: 12_700_042,
        lamp_period: 1_200,
        sample_end: 1_100,
        lamp_voltage: None,
        range_iaq: None,
        range_safety: Some(RangeCalib {
            zero: Some(0.9),
            span: Some(0.31),
            t_cal: Some(21.5),
            ..RangeCalib::default()
        }),
        ..NdirCalib::default()
    }
}

#[test]
fn test_retrieve_factory_calibration() {
    let (_dir, _clock, _device, ndir) = powered(Dialect::X1);

    let calib = ndir.retrieve_calib().unwrap();
    assert_eq!(calib, NdirCalib::default());
    assert!(calib.range_iaq.is_some());
    assert!(calib.range_safety.is_none());
}

#[test]
fn test_store_then_retrieve_round_trip() {
    let (_dir, _clock, device, ndir) = powered(Dialect::X1);
    let calib = custom_calib();

    ndir.store_calib(&calib).unwrap().discard();
    let retrieved = ndir.retrieve_calib().unwrap();

    assert_eq!(retrieved, calib);
    assert_eq!(retrieved.range_safety.unwrap().linear_b, None);
    assert_eq!(device.eeprom_cell(range_block(0), INDEX_IS_SET), Some(vec![0, 0]));
    assert_eq!(device.eeprom_cell(range_block(1), INDEX_IS_SET), Some(vec![1, 0]));
}

#[test]
fn test_store_writes_every_field_with_execution_wait() {
    let (_dir, clock, device, ndir) = powered(Dialect::X1);

    ndir.store_calib(&NdirCalib::default()).unwrap().discard();

    // 7 common fields, iaq flag + 9 coefficients, 4 unset flags
    assert_eq!(device.stats().eeprom_writes, 21);
    assert_eq!(clock.count_sleeps(Duration::from_millis(10)), 21);
    assert_eq!(device.stats().reloads, 0);
}

#[test]
fn test_store_then_reload() {
    let (_dir, clock, device, ndir) = powered(Dialect::X1);

    let pending = ndir.store_calib(&custom_calib()).unwrap();
    pending.reload(&ndir).unwrap();

    assert_eq!(device.stats().reloads, 1);
    assert_eq!(clock.count_sleeps(Duration::from_millis(2_200)), 1);
}

#[test]
fn test_absent_float_is_stored_erased() {
    let (_dir, _clock, device, ndir) = powered(Dialect::X1);

    ndir.store_calib(&custom_calib()).unwrap().discard();
    assert_eq!(device.eeprom_cell(BLOCK_COMMON, 3), Some(vec![0xff; 4]));
}

#[test]
fn test_erased_eeprom_reads_absent_floats() {
    let (_dir, _clock, device, ndir) = powered(Dialect::X1);
    device.erase_eeprom();

    let calib = ndir.retrieve_calib().unwrap();
    assert_eq!(calib.lamp_voltage, None);
    assert_eq!(calib.ndir_serial, u32::MAX);
    assert_eq!(calib.lamp_period, u16::MAX);
}

#[test]
fn test_calibration_changes_sample_interval() {
    let (_dir, _clock, device, ndir) = powered(Dialect::T1f1);

    device.load_eeprom(&custom_calib());
    assert_eq!(ndir.sample_interval().unwrap(), Duration::from_millis(2_310));
}

#[test]
fn test_set_common_fields() {
    let mut calib = NdirCalib::default();

    calib.set("lamp-period", &json!(1500)).unwrap();
    calib.set("lamp-voltage", &json!(null)).unwrap();
    calib.set("board-serial", &json!(42)).unwrap();

    assert_eq!(calib.lamp_period, 1500);
    assert_eq!(calib.lamp_voltage, None);
    assert_eq!(calib.board_serial, 42);
}

#[test]
fn test_set_range_paths() {
    let mut calib = NdirCalib::default();

    calib.set("range-iaq.zero", &json!(0.75)).unwrap();
    let iaq = calib.range_iaq.unwrap();
    assert_eq!(iaq.zero, Some(0.75));
    assert_eq!(iaq.span, NdirCalib::default().range_iaq.unwrap().span);

    calib.set("range-combustion", &json!({})).unwrap();
    calib.set("range-combustion.zero", &json!(0.5)).unwrap();
    let combustion = calib.range_combustion.unwrap();
    assert_eq!(combustion.zero, Some(0.5));
    assert_eq!(combustion.span, None);

    calib.set("range-iaq", &json!(null)).unwrap();
    assert!(calib.range_iaq.is_none());

    calib.set("range-custom", &json!({"zero": 1.0, "t-cal": 25.0})).unwrap();
    let custom = calib.range_custom.unwrap();
    assert_eq!(custom.zero, Some(1.0));
    assert_eq!(custom.t_cal, Some(25.0));
    assert_eq!(custom.beta_a, None);
}

#[test]
fn test_set_rejects_bad_paths_and_values() {
    let mut calib = NdirCalib::default();

    assert!(matches!(
        calib.set("lamp-brightness", &json!(1)),
        Err(ConfigurationError::UnknownField(_))
    ));
    assert!(matches!(
        calib.set("range-iaq.gamma", &json!(1)),
        Err(ConfigurationError::UnknownField(_))
    ));
    // a coefficient under an unset range does not exist
    assert!(matches!(
        calib.set("range-safety.zero", &json!(0.9)),
        Err(ConfigurationError::UnknownField(_))
    ));
    assert!(matches!(
        calib.set("lamp-period.low", &json!(1)),
        Err(ConfigurationError::UnknownField(_))
    ));
    assert!(matches!(
        calib.set("lamp-period", &json!(70_000)),
        Err(ConfigurationError::InvalidValue { .. })
    ));
    assert!(matches!(
        calib.set("lamp-period", &json!("long")),
        Err(ConfigurationError::InvalidValue { .. })
    ));
    assert!(matches!(
        calib.set("range-safety", &json!(3)),
        Err(ConfigurationError::InvalidValue { .. })
    ));

    assert_eq!(calib, NdirCalib::default());
}

#[test]
fn test_calibration_json_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("calib.json");

    let calib = custom_calib();
    calib.save(&path).unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    let document: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(document["lamp-period"], 1200);
    assert!(document["range-iaq"].is_null());
    assert!(document["lamp-voltage"].is_null());

    assert_eq!(NdirCalib::load(&path).unwrap(), calib);
}
