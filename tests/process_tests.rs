//! Cross-process behaviour, driven through the `ndirbus` binary with a
//! simulated sensor.

use ndirbus::sim::SimConfig;
use ndirbus::*;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const NDIRBUS: &str = env!("CARGO_BIN_EXE_ndirbus");

struct Setup {
    _dir: TempDir,
    conf: NdirConf,
    conf_path: PathBuf,
}

fn setup() -> Setup {
    let dir = TempDir::new().unwrap();
    let conf = NdirConf {
        lock_dir: Some(dir.path().join("locks")),
        shared_path: Some(dir.path().join("monitor.shm")),
        ..NdirConf::default()
    };
    let conf_path = dir.path().join("ndir.json");
    conf.save(&conf_path).unwrap();

    Setup {
        _dir: dir,
        conf,
        conf_path,
    }
}

fn ndirbus(conf_path: &Path, args: &[&str]) -> Command {
    let mut command = Command::new(NDIRBUS);
    command.arg("--simulate").arg("--conf").arg(conf_path).args(args);
    command.stdin(Stdio::null()).stderr(Stdio::null());
    command
}

fn wait_for<F: FnMut() -> bool>(mut condition: F) {
    let deadline = Instant::now() + Duration::from_secs(15);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(5));
    }
}

fn lock_holder(setup: &Setup) -> Option<u32> {
    let path = setup
        .conf
        .bus_lock()
        .dir()
        .join(format!("{}.lock", setup.conf.lock_name()));
    std::fs::read_to_string(path)
        .ok()?
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}

#[cfg(unix)]
fn interrupt(child: &Child) {
    let status = Command::new("kill")
        .arg("-INT")
        .arg(child.id().to_string())
        .status()
        .unwrap();
    assert!(status.success());
}

#[test]
fn test_lock_excludes_another_process() {
    let s = setup();
    let lock = s.conf.bus_lock();

    // the recorder holds the bus for its whole recording, about 3.1 s
    let child = ndirbus(&s.conf_path, &["recorder", "0", "1000", "2"])
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();
    wait_for(|| lock_holder(&s) == Some(child.id()));

    let error = lock.acquire(&s.conf.lock_name(), Duration::from_millis(200)).unwrap_err();
    assert!(matches!(error, NdirError::LockTimeout { .. }));

    let output = child.wait_with_output().unwrap();
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).lines().count(), 2);

    assert!(!lock.is_held(&s.conf.lock_name()));
    assert!(lock.acquire(&s.conf.lock_name(), Duration::from_millis(200)).is_ok());
}

#[cfg(unix)]
#[test]
fn test_interrupted_command_releases_bus() {
    let s = setup();
    let lock = s.conf.bus_lock();

    let mut child = ndirbus(&s.conf_path, &["recorder", "0", "500", "2"])
        .stdout(Stdio::null())
        .spawn()
        .unwrap();
    wait_for(|| lock_holder(&s) == Some(child.id()));

    // the recording in flight completes and its session closes
    interrupt(&child);
    let status = child.wait().unwrap();

    assert!(status.success());
    assert!(!lock.is_held(&s.conf.lock_name()));
}

#[test]
fn test_monitor_with_worker_process() {
    let s = setup();
    let device = SimDevice::new(Dialect::X1, Arc::new(ManualClock::new()));
    let ndir: Arc<dyn Ndir> = Arc::new(device.driver(s.conf.bus_lock(), s.conf.lock_name()));
    let shared = Arc::new(
        SharedRegion::open(s.conf.shared_path(), s.conf.bus_lock(), s.conf.monitor_lock_name()).unwrap(),
    );

    let worker = ndirbus(&s.conf_path, &["monitor-worker"]);
    let mut monitor = Monitor::new(
        Arc::clone(&ndir),
        Arc::clone(&shared),
        s.conf.monitor_settings(),
        Launch::Process(worker),
    );

    monitor.start().unwrap();
    assert!(device.is_powered());
    wait_for(|| shared.read().unwrap().is_some());

    let started = Instant::now();
    monitor.stop().unwrap();
    // the worker left on the stop request, well inside the kill grace period
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!monitor.is_running());
    assert!(!device.is_powered());

    let gas = SimConfig::default().gas;
    let sample = monitor.sample().unwrap().unwrap();
    assert_eq!(sample.values(), [Some(gas[0]), Some(gas[1]), Some(gas[2])]);
}

#[cfg(unix)]
#[test]
fn test_monitor_kills_unresponsive_worker() {
    let s = setup();
    let device = SimDevice::new(Dialect::X1, Arc::new(ManualClock::new()));
    let ndir: Arc<dyn Ndir> = Arc::new(device.driver(s.conf.bus_lock(), s.conf.lock_name()));
    let shared = Arc::new(
        SharedRegion::open(s.conf.shared_path(), s.conf.bus_lock(), s.conf.monitor_lock_name()).unwrap(),
    );

    let mut sleeper = Command::new("sleep");
    sleeper.arg("60");
    let mut monitor = Monitor::new(ndir, shared, s.conf.monitor_settings(), Launch::Process(sleeper));

    monitor.start().unwrap();
    let started = Instant::now();
    monitor.stop().unwrap();

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(5));
    assert!(elapsed < Duration::from_secs(60));
    assert!(!device.is_powered());
}

#[cfg(unix)]
#[test]
fn test_worker_stops_on_interrupt() {
    let s = setup();
    let shared =
        SharedRegion::open(s.conf.shared_path(), s.conf.bus_lock(), s.conf.monitor_lock_name()).unwrap();

    let mut child = ndirbus(&s.conf_path, &["monitor-worker"])
        .stdout(Stdio::null())
        .spawn()
        .unwrap();
    wait_for(|| shared.read().unwrap().is_some());

    interrupt(&child);
    let status = child.wait().unwrap();

    assert!(status.success());
    assert!(!shared.stop_requested());
    assert!(!s.conf.bus_lock().is_held(&s.conf.lock_name()));
    assert!(!s.conf.bus_lock().is_held(&s.conf.monitor_lock_name()));
}
