use crate::bus::SpidevBus;
use crate::clock::{Clock, SystemClock};
use crate::dialect::Dialect;
use crate::driver::SpiNdir;
use crate::error::Result;
use crate::lock::{default_lock_dir, BusLock};
use crate::monitor::MonitorSettings;
use crate::power::SysfsRail;
use crate::shared::default_region_path;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const DEFAULT_MODEL: &str = "x1";
const DEFAULT_TALLY: usize = 1;
const DEFAULT_SPI_BUS: u8 = 0;
const DEFAULT_SPI_DEVICE: u8 = 1;
const DEFAULT_POWER_GPIO: u32 = 66;

/// Host configuration for one sensor.
///
/// ```json
/// {"model": "t1f1", "tally": 10, "raw": false}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct NdirConf {
    pub model: String,
    /// Rolling average window for the monitor.
    pub tally: usize,
    /// Monitor thermopile voltages rather than gas concentration.
    pub raw: bool,
    pub spi_bus: u8,
    pub spi_device: u8,
    pub power_gpio: u32,
    pub power_active_high: bool,
    pub lock_dir: Option<PathBuf>,
    pub shared_path: Option<PathBuf>,
}

impl Default for NdirConf {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            tally: DEFAULT_TALLY,
            raw: false,
            spi_bus: DEFAULT_SPI_BUS,
            spi_device: DEFAULT_SPI_DEVICE,
            power_gpio: DEFAULT_POWER_GPIO,
            power_active_high: true,
            lock_dir: None,
            shared_path: None,
        }
    }
}

impl NdirConf {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// The file at `path` if it exists, otherwise defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) if p.exists() => Self::load(p),
            _ => Ok(Self::default()),
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn dialect(&self) -> Result<Dialect> {
        Ok(self.model.parse()?)
    }

    /// Bus lock name, one per SPI device.
    pub fn lock_name(&self) -> String {
        format!("ndir-spi{}.{}", self.spi_bus, self.spi_device)
    }

    /// Lock guarding the shared monitor region.
    pub fn monitor_lock_name(&self) -> String {
        format!("{}-monitor", self.lock_name())
    }

    pub fn bus_lock(&self) -> BusLock {
        BusLock::new(self.lock_dir.clone().unwrap_or_else(default_lock_dir))
    }

    pub fn shared_path(&self) -> PathBuf {
        self.shared_path
            .clone()
            .unwrap_or_else(|| default_region_path(&self.monitor_lock_name()))
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            tally: self.tally,
            raw: self.raw,
        }
    }

    /// Driver for the configured hardware.
    pub fn build(&self) -> Result<SpiNdir<SpidevBus, SysfsRail>> {
        self.build_with_clock(Arc::new(SystemClock::new()))
    }

    pub fn build_with_clock(&self, clock: Arc<dyn Clock>) -> Result<SpiNdir<SpidevBus, SysfsRail>> {
        Ok(SpiNdir::new(
            self.dialect()?,
            SpidevBus::new(self.spi_bus, self.spi_device),
            SysfsRail::new(self.power_gpio, self.power_active_high),
            self.bus_lock(),
            self.lock_name(),
            clock,
        ))
    }
}
