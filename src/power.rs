//! Power rail control, boot delay and forced reset with quarantine.

use crate::bus::SpiBus;
use crate::error::Result;
use crate::lock::LockBudget;
use crate::transactor::Transactor;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const SYSFS_GPIO_BASE: &str = "/sys/class/gpio";

/// The load switch feeding the sensor. `set(true)` means "powered",
/// whatever the line polarity.
pub trait PowerRail: Send {
    fn is_on(&self) -> io::Result<bool>;
    fn set(&mut self, on: bool) -> io::Result<()>;
}

/// GPIO-driven load switch via the sysfs interface.
#[derive(Debug, Clone)]
pub struct SysfsRail {
    base: PathBuf,
    gpio: u32,
    active_high: bool,
}

impl SysfsRail {
    pub fn new(gpio: u32, active_high: bool) -> Self {
        Self::with_base(SYSFS_GPIO_BASE, gpio, active_high)
    }

    pub fn with_base(base: impl Into<PathBuf>, gpio: u32, active_high: bool) -> Self {
        Self {
            base: base.into(),
            gpio,
            active_high,
        }
    }

    fn pin_dir(&self) -> PathBuf {
        self.base.join(format!("gpio{}", self.gpio))
    }

    fn export(&self) -> io::Result<()> {
        let pin = self.pin_dir();
        if !pin.exists() {
            fs::write(self.base.join("export"), self.gpio.to_string())?;
            debug!(gpio = self.gpio, "exported");
        }

        let direction = pin.join("direction");
        if fs::read_to_string(&direction).map(|d| d.trim() != "out").unwrap_or(true) {
            fs::write(&direction, "out")?;
        }
        Ok(())
    }

    fn level(path: &Path) -> io::Result<bool> {
        Ok(fs::read_to_string(path)?.trim() == "1")
    }
}

impl PowerRail for SysfsRail {
    fn is_on(&self) -> io::Result<bool> {
        let value = self.pin_dir().join("value");
        if !value.exists() {
            return Ok(false);
        }
        Ok(Self::level(&value)? == self.active_high)
    }

    fn set(&mut self, on: bool) -> io::Result<()> {
        self.export()?;
        let level = if on == self.active_high { "1" } else { "0" };
        fs::write(self.pin_dir().join("value"), level)
    }
}

/// Readings taken before `until` (clock time) are unreliable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[must_use]
pub struct Quarantine {
    pub until: Duration,
}

impl Quarantine {
    pub fn is_active(&self, now: Duration) -> bool {
        now < self.until
    }

    pub fn remaining(&self, now: Duration) -> Duration {
        self.until.saturating_sub(now)
    }
}

/// The last reset's quarantine, kept next to the bus lock so that every
/// process driving the same device sees it.
fn quarantine_path<B: SpiBus>(transactor: &Transactor<B>) -> PathBuf {
    transactor
        .lock()
        .dir()
        .join(format!("{}.quarantine", transactor.lock_name()))
}

fn write_quarantine(path: &Path, quarantine: &Quarantine) -> Result<()> {
    let staging = path.with_extension(format!("quarantine.{}", std::process::id()));
    fs::write(&staging, serde_json::to_vec(quarantine)?)?;
    fs::rename(&staging, path)?;
    Ok(())
}

fn read_quarantine(path: &Path) -> Option<Quarantine> {
    let text = match fs::read(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), "quarantine unreadable: {}", e);
            return None;
        }
    };

    match serde_json::from_slice(&text) {
        Ok(quarantine) => Some(quarantine),
        Err(e) => {
            warn!(path = %path.display(), "quarantine corrupt: {}", e);
            None
        }
    }
}

pub struct PowerSequencer<R: PowerRail> {
    rail: Mutex<R>,
    boot_delay: Duration,
    quarantine_window: Duration,
}

impl<R: PowerRail> PowerSequencer<R> {
    pub fn new(rail: R, boot_delay: Duration, quarantine_window: Duration) -> Self {
        Self {
            rail: Mutex::new(rail),
            boot_delay,
            quarantine_window,
        }
    }

    pub fn is_powered(&self) -> Result<bool> {
        Ok(self.rail.lock().unwrap_or_else(|e| e.into_inner()).is_on()?)
    }

    /// Asserts the rail and waits the boot delay. No-op if already powered.
    pub fn power_on<B: SpiBus>(&self, transactor: &Transactor<B>) -> Result<()> {
        let _session = transactor.session(LockBudget::Long)?;
        let mut rail = self.rail.lock().unwrap_or_else(|e| e.into_inner());

        if rail.is_on()? {
            return Ok(());
        }

        rail.set(true)?;
        info!(boot_delay = ?self.boot_delay, "power on");
        transactor.clock().sleep(self.boot_delay);
        Ok(())
    }

    pub fn power_off<B: SpiBus>(&self, transactor: &Transactor<B>) -> Result<()> {
        let _session = transactor.session(LockBudget::Long)?;
        let mut rail = self.rail.lock().unwrap_or_else(|e| e.into_inner());

        if !rail.is_on()? {
            return Ok(());
        }

        rail.set(false)?;
        info!("power off");
        Ok(())
    }

    /// Forces a watchdog reset, clears the flag, and opens the quarantine
    /// window. The window is recorded in the lock directory while the bus
    /// lock is still held.
    pub fn reset<B: SpiBus>(&self, transactor: &Transactor<B>) -> Result<Quarantine> {
        let session = transactor.session(LockBudget::Long)?;

        session.execute_and_wait("wr", None, None)?;
        session.execute("wc", None, None, None)?;

        let quarantine = Quarantine {
            until: transactor.clock().now() + self.quarantine_window,
        };
        write_quarantine(&quarantine_path(transactor), &quarantine)?;

        info!(window = ?self.quarantine_window, "reset");
        Ok(quarantine)
    }

    /// The most recent reset's quarantine, whichever process issued it.
    pub fn quarantine<B: SpiBus>(&self, transactor: &Transactor<B>) -> Option<Quarantine> {
        read_quarantine(&quarantine_path(transactor))
    }

    pub fn in_quarantine<B: SpiBus>(&self, transactor: &Transactor<B>) -> bool {
        let now = transactor.clock().now();
        self.quarantine(transactor).map_or(false, |q| q.is_active(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sysfs() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let pin = dir.path().join("gpio66");
        fs::create_dir(&pin).unwrap();
        (dir, pin)
    }

    #[test]
    fn test_sysfs_rail_active_high() {
        let (dir, pin) = sysfs();
        let mut rail = SysfsRail::with_base(dir.path(), 66, true);

        assert!(!rail.is_on().unwrap());
        rail.set(true).unwrap();

        assert_eq!(fs::read_to_string(pin.join("direction")).unwrap(), "out");
        assert_eq!(fs::read_to_string(pin.join("value")).unwrap(), "1");
        assert!(rail.is_on().unwrap());

        rail.set(false).unwrap();
        assert!(!rail.is_on().unwrap());
    }

    #[test]
    fn test_sysfs_rail_active_low() {
        let (dir, pin) = sysfs();
        let mut rail = SysfsRail::with_base(dir.path(), 66, false);

        rail.set(true).unwrap();
        assert_eq!(fs::read_to_string(pin.join("value")).unwrap(), "0");
        assert!(rail.is_on().unwrap());
    }

    #[test]
    fn test_sysfs_rail_exports_missing_pin() {
        let dir = TempDir::new().unwrap();
        let mut rail = SysfsRail::with_base(dir.path(), 7, true);

        // export is written, but no kernel creates the pin directory here
        assert!(rail.set(true).is_err());
        assert_eq!(fs::read_to_string(dir.path().join("export")).unwrap(), "7");
    }

    #[test]
    fn test_quarantine_window() {
        let quarantine = Quarantine {
            until: Duration::from_secs(10),
        };

        assert!(quarantine.is_active(Duration::from_secs(2)));
        assert_eq!(quarantine.remaining(Duration::from_secs(2)), Duration::from_secs(8));
        assert!(!quarantine.is_active(Duration::from_secs(10)));
        assert_eq!(quarantine.remaining(Duration::from_secs(12)), Duration::ZERO);
    }

    #[test]
    fn test_quarantine_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ndir-spi0.1.quarantine");
        assert_eq!(read_quarantine(&path), None);

        let quarantine = Quarantine {
            until: Duration::from_millis(1_700_000_008_250),
        };
        write_quarantine(&path, &quarantine).unwrap();
        assert_eq!(read_quarantine(&path), Some(quarantine));
        // no staging file left behind
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);

        fs::write(&path, "garbage").unwrap();
        assert_eq!(read_quarantine(&path), None);
    }
}
