use ndirbus::lock::{LONG_TIMEOUT, SHORT_TIMEOUT};
use ndirbus::sim::{SimBus, SimRail};
use ndirbus::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant, SystemTime};
use tempfile::TempDir;

#[test]
fn test_lock_budgets() {
    assert_eq!(LockBudget::Short.timeout(), SHORT_TIMEOUT);
    assert_eq!(LockBudget::Long.timeout(), LONG_TIMEOUT);
    assert_eq!(SHORT_TIMEOUT, Duration::from_secs(1));
    assert_eq!(LONG_TIMEOUT, Duration::from_secs(4));
}

#[test]
fn test_lock_excludes_second_holder() {
    let dir = TempDir::new().unwrap();
    let lock = BusLock::new(dir.path());

    let guard = lock.acquire("spi0.1", SHORT_TIMEOUT).unwrap();
    assert_eq!(guard.name(), "spi0.1");
    assert!(lock.is_held("spi0.1"));

    let started = Instant::now();
    let error = lock.acquire("spi0.1", Duration::from_millis(50)).unwrap_err();
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert!(error.is_contention());
    assert!(error.is_retryable());
    assert!(matches!(error, NdirError::LockTimeout { ref name, .. } if name == "spi0.1"));

    // names are independent
    assert!(lock.acquire("spi0.0", Duration::from_millis(50)).is_ok());

    drop(guard);
    assert!(!lock.is_held("spi0.1"));
    assert!(lock.acquire("spi0.1", Duration::from_millis(50)).is_ok());
}

#[test]
fn test_lock_handed_over_between_threads() {
    let dir = TempDir::new().unwrap();
    let lock = BusLock::new(dir.path());
    let barrier = Arc::new(Barrier::new(2));

    let guard = lock.acquire("bus", SHORT_TIMEOUT).unwrap();

    let waiter = {
        let lock = lock.clone();
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            lock.acquire("bus", Duration::from_secs(5)).map(|g| g.name().to_string())
        })
    };

    barrier.wait();
    thread::sleep(Duration::from_millis(50));
    drop(guard);

    assert_eq!(waiter.join().unwrap().unwrap(), "bus");
}

#[test]
fn test_release_only_by_holding_process() {
    let dir = TempDir::new().unwrap();
    let lock = BusLock::new(dir.path());

    let guard = lock.acquire("bus", SHORT_TIMEOUT).unwrap();
    std::mem::forget(guard);
    assert!(lock.is_held("bus"));

    lock.release("bus");
    assert!(!lock.is_held("bus"));

    // nothing to release
    lock.release("bus");
}

#[cfg(target_os = "linux")]
#[test]
fn test_abandoned_lock_is_reclaimed() {
    let dir = TempDir::new().unwrap();
    let lock = BusLock::new(dir.path());

    // pid above the kernel's pid_max
    std::fs::write(dir.path().join("bus.lock"), "999999999 1").unwrap();
    assert!(lock.is_held("bus"));

    let guard = lock.acquire("bus", Duration::from_millis(100)).unwrap();
    assert_eq!(guard.name(), "bus");
}

#[cfg(target_os = "linux")]
#[test]
fn test_reclaim_waits_for_reclaim_in_progress() {
    let dir = TempDir::new().unwrap();
    let lock = BusLock::new(dir.path());

    std::fs::write(dir.path().join("bus.lock"), "999999999 1").unwrap();
    std::fs::write(dir.path().join("bus.lock.reclaim"), "").unwrap();

    // another process is reclaiming: leave the lock file to it
    let error = lock.acquire("bus", Duration::from_millis(50)).unwrap_err();
    assert!(error.is_contention());
    assert!(dir.path().join("bus.lock").exists());
}

#[cfg(target_os = "linux")]
#[test]
fn test_stuck_reclaim_marker_is_cleared() {
    let dir = TempDir::new().unwrap();
    let lock = BusLock::new(dir.path());

    std::fs::write(dir.path().join("bus.lock"), "999999999 1").unwrap();
    let marker = std::fs::File::create(dir.path().join("bus.lock.reclaim")).unwrap();
    marker
        .set_modified(SystemTime::now() - Duration::from_secs(60))
        .unwrap();
    drop(marker);

    let guard = lock.acquire("bus", Duration::from_millis(500)).unwrap();
    assert_eq!(guard.name(), "bus");
    assert!(!dir.path().join("bus.lock.reclaim").exists());
}

#[cfg(target_os = "linux")]
#[test]
fn test_racing_reclaimers_never_overlap() {
    const HOLDERS: usize = 8;

    for _ in 0..20 {
        let dir = TempDir::new().unwrap();
        let lock = BusLock::new(dir.path());
        std::fs::write(dir.path().join("bus.lock"), "999999999 1").unwrap();

        let barrier = Arc::new(Barrier::new(HOLDERS));
        let inside = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));

        let holders: Vec<_> = (0..HOLDERS)
            .map(|_| {
                let (lock, barrier) = (lock.clone(), Arc::clone(&barrier));
                let (inside, overlaps) = (Arc::clone(&inside), Arc::clone(&overlaps));
                thread::spawn(move || {
                    barrier.wait();
                    let _guard = lock.acquire("bus", Duration::from_secs(5)).unwrap();
                    if inside.fetch_add(1, Ordering::SeqCst) > 0 {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    thread::sleep(Duration::from_millis(2));
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for holder in holders {
            holder.join().unwrap();
        }
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert!(!lock.is_held("bus"));
    }
}

#[test]
fn test_driver_times_out_while_bus_is_held() {
    let dir = TempDir::new().unwrap();
    let lock = BusLock::new(dir.path());
    let device = SimDevice::new(Dialect::X1, Arc::new(ManualClock::new()));
    let ndir: SpiNdir<SimBus, SimRail> = device.driver(lock.clone(), "ndir-spi0.1");
    ndir.power_on().unwrap();

    let guard = lock.acquire("ndir-spi0.1", SHORT_TIMEOUT).unwrap();
    let before = device.stats().transactions;

    let error = ndir.get_sample_gas().unwrap_err();
    assert!(matches!(error, NdirError::LockTimeout { .. }));
    assert_eq!(device.stats().transactions, before);

    drop(guard);
    assert!(ndir.get_sample_gas().is_ok());
}
