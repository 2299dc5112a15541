//! # NDIR Bus Driver
//!
//! Host-side driver for an NDIR CO2 sensor coprocessor reachable over SPI.
//! The device speaks a small vocabulary of 2-byte commands with a strict
//! ACK/NACK/BUSY status protocol, keeps its calibration in EEPROM, and is
//! power-cycled through a GPIO load switch.
//!
//! ## Features
//!
//! - **Transaction engine**: framing, timing and status interpretation for every command
//! - **Protocol dialects**: t1f1, x1 and v1 firmware behind one [`Ndir`] capability trait
//! - **Calibration**: typed EEPROM fields with store, retrieve and reload
//! - **Power sequencing**: idempotent power on/off, forced reset with quarantine
//! - **Monitor**: background sampling with a rolling average shared across processes
//! - **Simulator**: an in-memory device with fault injection for tests
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ndirbus::{Ndir, NdirConf};
//!
//! let conf = NdirConf::load_or_default(None)?;
//! let ndir = conf.build()?;
//!
//! ndir.power_on()?;
//! println!("{:?}", ndir.get_sample_gas()?);
//! ndir.power_off()?;
//! # Ok::<(), ndirbus::NdirError>(())
//! ```
//!
//! ## Architecture
//!
//! - [`command`] - immutable command tables
//! - [`codec`] - little-endian wire encodings
//! - [`bus`] - the SPI transport seam
//! - [`lock`] - named cross-process bus lock
//! - [`transactor`] - one command against the bus
//! - [`dialect`] - per-firmware protocol configuration
//! - [`calib`] - calibration EEPROM
//! - [`power`] - power rail, boot delay and reset
//! - [`driver`] - the [`Ndir`] trait and [`SpiNdir`]
//! - [`monitor`], [`shared`], [`average`] - background sampling
//! - [`sim`] - simulated device

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod average;
pub mod bus;
pub mod calib;
pub mod clock;
pub mod codec;
pub mod command;
pub mod conf;
pub mod datum;
pub mod dialect;
pub mod driver;
pub mod error;
pub mod lock;
pub mod monitor;
pub mod power;
pub mod shared;
pub mod sim;
pub mod transactor;

// Re-export main public types for convenience
pub use calib::{NdirCalib, PendingReload, RangeCalib};
pub use clock::{Clock, ManualClock, SystemClock};
pub use command::{Command, CommandTable};
pub use conf::NdirConf;
pub use datum::{GasDatum, Sample, Status, Uptime, Version, VoltageDatum};
pub use dialect::Dialect;
pub use driver::{Ndir, SpiNdir};
pub use error::{ConfigurationError, NdirError, Problem, ProtocolError, Result};
pub use lock::{BusLock, LockBudget};
pub use monitor::{Launch, Monitor, MonitorSettings};
pub use power::Quarantine;
pub use shared::SharedRegion;
pub use sim::{SimDevice, SimFault};
pub use transactor::{Payload, Transactor};
