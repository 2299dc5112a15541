use ndirbus::*;
use std::io;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_conf_defaults() {
    let conf = NdirConf::default();

    assert_eq!(conf.dialect().unwrap(), Dialect::X1);
    assert_eq!(conf.tally, 1);
    assert!(!conf.raw);
    assert_eq!(conf.lock_name(), "ndir-spi0.1");
    assert_eq!(conf.monitor_lock_name(), "ndir-spi0.1-monitor");
    assert_eq!(conf.monitor_settings(), MonitorSettings { tally: 1, raw: false });
}

#[test]
fn test_conf_partial_document() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ndir.json");
    std::fs::write(&path, r#"{"model": "T1F1", "tally": 10, "spi-device": 0, "lock-dir": "/tmp/ndir"}"#).unwrap();

    let conf = NdirConf::load_or_default(Some(path.as_path())).unwrap();
    assert_eq!(conf.dialect().unwrap(), Dialect::T1f1);
    assert_eq!(conf.tally, 10);
    assert_eq!(conf.spi_bus, 0);
    assert_eq!(conf.lock_name(), "ndir-spi0.0");
    assert_eq!(conf.bus_lock().dir(), std::path::Path::new("/tmp/ndir"));
    assert!(conf.power_active_high);
}

#[test]
fn test_conf_save_and_missing_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ndir.json");

    assert_eq!(NdirConf::load_or_default(Some(path.as_path())).unwrap(), NdirConf::default());
    assert_eq!(NdirConf::load_or_default(None).unwrap(), NdirConf::default());

    let conf = NdirConf {
        model: "v1".to_string(),
        raw: true,
        shared_path: Some(dir.path().join("ndir.shm")),
        ..NdirConf::default()
    };
    conf.save(&path).unwrap();

    let loaded = NdirConf::load(&path).unwrap();
    assert_eq!(loaded, conf);
    assert_eq!(loaded.shared_path(), dir.path().join("ndir.shm"));
}

#[test]
fn test_unknown_model() {
    let conf = NdirConf {
        model: "z9".to_string(),
        ..NdirConf::default()
    };

    assert!(matches!(
        conf.dialect(),
        Err(NdirError::Configuration(ConfigurationError::UnknownModel(ref m))) if m == "z9"
    ));
    assert!("X1".parse::<Dialect>().is_ok());
    assert_eq!(Dialect::V1.to_string(), "v1");
}

#[test]
fn test_uptime_period_format() {
    assert_eq!(Uptime::new(0).to_string(), "00-00:00:00.000");
    assert_eq!(Uptime::new(90_061).to_string(), "01-01:01:01.000");
    assert_eq!(Uptime::new(3_599).to_string(), "00-00:59:59.000");

    let parsed: Uptime = "02-03:04:05.000".parse().unwrap();
    assert_eq!(parsed.seconds, 2 * 86_400 + 3 * 3_600 + 4 * 60 + 5);
    assert!("03:04:05".parse::<Uptime>().is_err());
    assert!("99999-00:00:00.000".parse::<Uptime>().is_err());

    let json = serde_json::to_value(Uptime::new(61)).unwrap();
    assert_eq!(json, serde_json::json!({"period": "00-00:01:01.000"}));
    assert_eq!(serde_json::from_value::<Uptime>(json).unwrap(), Uptime::new(61));
}

#[test]
fn test_error_classification() {
    let busy = NdirError::Protocol(ProtocolError {
        problem: Problem::Busy,
        status: 0x03,
        command: "sg".to_string(),
        param_group_1: Vec::new(),
        param_group_2: Vec::new(),
    });
    assert!(busy.is_retryable());
    assert!(!busy.is_contention());
    assert!(!busy.is_teardown_tolerable());

    let timeout = NdirError::LockTimeout {
        name: "ndir-spi0.1".to_string(),
        timeout: Duration::from_secs(1),
    };
    assert!(timeout.is_contention());
    assert!(timeout.is_teardown_tolerable());

    let gone = NdirError::Io(io::Error::new(io::ErrorKind::NotFound, "no spidev"));
    assert!(gone.is_disconnect());
    assert!(!gone.is_retryable());

    let denied = NdirError::Io(io::Error::new(io::ErrorKind::PermissionDenied, "gpio"));
    assert!(!denied.is_teardown_tolerable());

    let config = NdirError::Configuration(ConfigurationError::UnknownCommand("zz".to_string()));
    assert!(!config.is_retryable());
}

#[test]
fn test_error_diagnostics() {
    let nack = NdirError::Protocol(ProtocolError {
        problem: Problem::Nack,
        status: 0x02,
        command: "cw".to_string(),
        param_group_1: vec![0, 4],
        param_group_2: vec![0xb0, 0x04],
    });
    let diagnostic = nack.to_diagnostic();
    assert_eq!(diagnostic["protocol-error"]["problem"], "nack");
    assert_eq!(diagnostic["protocol-error"]["cmd"], "cw");
    assert_eq!(diagnostic["protocol-error"]["status"], 2);
    assert!(nack.to_string().starts_with("NACK received"));

    let transport = NdirError::Transport {
        command: "sv".to_string(),
        expected: 12,
        received: 4,
    };
    assert_eq!(transport.to_diagnostic()["transport-error"]["received"], 4);

    let timeout = NdirError::LockTimeout {
        name: "bus".to_string(),
        timeout: Duration::from_millis(1500),
    };
    assert_eq!(timeout.to_diagnostic()["lock-timeout"]["timeout"], 1.5);
}
