//! Protocol revisions across hardware generations.
//!
//! Each dialect fixes its command table, which status sentinels mean "no
//! reply", whether BUSY exists at all, its boot delay and how a sample is
//! produced. The driver is one implementation parameterised by a
//! [`DialectSpec`].

use crate::command::{Command, CommandTable};
use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

pub const STATUS_ACK: u8 = 0x01;
pub const STATUS_NACK: u8 = 0x02;
pub const STATUS_BUSY: u8 = 0x03;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusCodes {
    pub ack: u8,
    pub nack: u8,
    /// `None` where the firmware never reports BUSY.
    pub busy: Option<u8>,
    pub none: &'static [u8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sampling {
    /// The device samples on its own schedule; reading `sg` returns the latest.
    Continuous { interval: Duration },
    /// Each sample is triggered by `trigger`; the interval is computed from
    /// the lamp period and sampling window held in EEPROM.
    Triggered { trigger: &'static str },
}

/// How long the recorder runs after `rs`, in milliseconds of parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderTiming {
    /// `rs` fixed execution time plus deferral and interval x count.
    CommandBased,
    /// Lamp period from EEPROM plus deferral and interval x count.
    LampPeriodBased,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub lamp_level: bool,
    pub sampler_mode: bool,
}

#[derive(Debug)]
pub struct DialectSpec {
    pub name: &'static str,
    pub commands: &'static [Command],
    pub codes: StatusCodes,
    pub boot_delay: Duration,
    /// Settle delay between parameter groups and before payload reads.
    pub settle_delay: Duration,
    /// Wait after BUSY before the device will accept the next command.
    pub recovery_delay: Duration,
    /// Window after a reset during which readings are unreliable.
    pub reset_quarantine: Duration,
    pub sampling: Sampling,
    pub pressure_command: &'static str,
    pub recorder: RecorderTiming,
    pub capabilities: Capabilities,
}

const NONE_BOTH: &[u8] = &[0x00, 0xff];
const NONE_ZERO: &[u8] = &[0x00];

const T1F1_COMMANDS: &[Command] = &[
    Command::fixed(b"vi", 1_000, 0, 40),     // version ident
    Command::fixed(b"vt", 1_000, 0, 11),     // version tag
    Command::fixed(b"up", 1_000, 0, 4),      // uptime
    Command::fixed(b"ws", 1_000, 0, 1),      // watchdog status
    Command::fixed(b"wc", 1_000, 0, 0),      // watchdog clear
    Command::fixed(b"wr", 1_000, 2_500, 0),  // watchdog reset
    Command::per_call(b"cr", 2_000, 0),      // calib read
    Command::fixed(b"cw", 4_000, 10, 0),     // calib write
    Command::fixed(b"cl", 10_000, 2_200, 0), // calib load
    Command::fixed(b"lr", 1_000, 0, 0),      // lamp run
    Command::fixed(b"ir", 1_000, 0, 2),      // input raw
    Command::fixed(b"iv", 1_000, 0, 4),      // input voltage
    Command::fixed(b"mc", 1_000, 1_000, 0),  // measure calibrate
    Command::fixed(b"mr", 1_000, 0, 6),      // measure raw
    Command::fixed(b"mv", 1_000, 0, 12),     // measure voltage
    Command::variable(b"rs", 1_000, "lamp-period + deferral + interval * count", 0),
    Command::per_call(b"rp", 1_000, 0),      // recorder play
    Command::variable(b"sp", 1_000, "lamp-period + sample-end + 10 ms", 0),
    Command::fixed(b"sr", 1_000, 0, 6),      // sampler raw
    Command::fixed(b"sv", 1_000, 0, 12),     // sampler voltage
    Command::fixed(b"sg", 10_000, 0, 12),    // sampler gas
    Command::fixed(b"so", 1_000, 0, 8),      // sampler offsets
    Command::fixed(b"sb", 1_000, 0, 4),      // sampler barometric pressure
];

const X1_COMMANDS: &[Command] = &[
    Command::fixed(b"vi", 1_000, 0, 40),
    Command::fixed(b"vt", 1_000, 0, 11),
    Command::fixed(b"up", 1_000, 0, 4),
    Command::fixed(b"ws", 1_000, 0, 1),
    Command::fixed(b"wc", 1_000, 0, 0),
    Command::fixed(b"wr", 1_000, 2_500, 0),
    Command::per_call(b"cr", 2_000, 0),
    Command::fixed(b"cw", 4_000, 10, 0),
    Command::fixed(b"cl", 10_000, 2_200, 0),
    Command::fixed(b"lr", 1_000, 0, 0),
    Command::fixed(b"ll", 1_000, 0, 0),      // lamp level
    Command::fixed(b"ir", 1_000, 0, 2),
    Command::fixed(b"iv", 1_000, 0, 4),
    Command::fixed(b"mc", 1_000, 1_000, 0),
    Command::fixed(b"mr", 1_000, 0, 6),
    Command::fixed(b"mv", 1_000, 0, 12),
    Command::fixed(b"rs", 1_000, 1_100, 0),  // plus deferral + interval * count
    Command::per_call(b"rp", 1_000, 0),
    Command::fixed(b"sm", 1_000, 2_000, 0),  // sampler mode
    Command::fixed(b"sr", 1_000, 0, 6),
    Command::fixed(b"sv", 1_000, 0, 12),
    Command::fixed(b"sg", 10_000, 0, 12),
    Command::fixed(b"so", 1_000, 0, 8),
    Command::fixed(b"sp", 1_000, 0, 4),      // sampler barometric pressure
];

const V1_COMMANDS: &[Command] = &[
    Command::fixed(b"vi", 1_000, 0, 40),
    Command::fixed(b"vt", 1_000, 0, 11),
    Command::fixed(b"up", 1_000, 0, 4),
    Command::fixed(b"ws", 1_000, 0, 1),
    Command::fixed(b"wc", 1_000, 0, 0),
    Command::fixed(b"wr", 1_000, 2_500, 0),
    Command::per_call(b"cr", 1_000, 0),
    Command::fixed(b"cw", 2_000, 10, 0),
    Command::fixed(b"cl", 10_000, 2_200, 0),
    Command::fixed(b"lr", 1_000, 0, 0),
    Command::fixed(b"ll", 1_000, 0, 0),
    Command::fixed(b"ir", 1_000, 0, 2),
    Command::fixed(b"iv", 1_000, 0, 4),
    Command::fixed(b"mc", 1_000, 1_000, 0),
    Command::fixed(b"mr", 1_000, 0, 6),
    Command::fixed(b"mv", 1_000, 0, 12),
    Command::fixed(b"rs", 1_000, 1_100, 0),
    Command::per_call(b"rp", 1_000, 0),
    Command::fixed(b"sm", 1_000, 2_200, 0),
    Command::fixed(b"sr", 1_000, 0, 6),
    Command::fixed(b"sv", 1_000, 0, 12),
    Command::fixed(b"sg", 10_000, 0, 12),
    Command::fixed(b"so", 1_000, 0, 8),
    Command::fixed(b"sp", 1_000, 0, 4),
];

static T1F1: DialectSpec = DialectSpec {
    name: "t1f1",
    commands: T1F1_COMMANDS,
    codes: StatusCodes { ack: STATUS_ACK, nack: STATUS_NACK, busy: None, none: NONE_BOTH },
    boot_delay: Duration::from_millis(3_500),
    settle_delay: Duration::from_millis(1),
    recovery_delay: Duration::from_secs(1),
    reset_quarantine: Duration::from_secs(8),
    sampling: Sampling::Triggered { trigger: "sp" },
    pressure_command: "sb",
    recorder: RecorderTiming::LampPeriodBased,
    capabilities: Capabilities { lamp_level: false, sampler_mode: false },
};

static X1: DialectSpec = DialectSpec {
    name: "x1",
    commands: X1_COMMANDS,
    codes: StatusCodes { ack: STATUS_ACK, nack: STATUS_NACK, busy: Some(STATUS_BUSY), none: NONE_BOTH },
    boot_delay: Duration::from_millis(3_500),
    settle_delay: Duration::from_millis(1),
    recovery_delay: Duration::from_secs(1),
    reset_quarantine: Duration::from_secs(8),
    sampling: Sampling::Continuous { interval: Duration::from_secs(1) },
    pressure_command: "sp",
    recorder: RecorderTiming::CommandBased,
    capabilities: Capabilities { lamp_level: true, sampler_mode: true },
};

// first-generation firmware only ever reported 0x00 for "no reply"
static V1: DialectSpec = DialectSpec {
    name: "v1",
    commands: V1_COMMANDS,
    codes: StatusCodes { ack: STATUS_ACK, nack: STATUS_NACK, busy: Some(STATUS_BUSY), none: NONE_ZERO },
    boot_delay: Duration::from_millis(2_500),
    settle_delay: Duration::from_millis(1),
    recovery_delay: Duration::from_secs(1),
    reset_quarantine: Duration::from_secs(8),
    sampling: Sampling::Continuous { interval: Duration::from_secs(1) },
    pressure_command: "sp",
    recorder: RecorderTiming::CommandBased,
    capabilities: Capabilities { lamp_level: true, sampler_mode: true },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    T1f1,
    X1,
    V1,
}

impl Dialect {
    pub const ALL: [Dialect; 3] = [Dialect::T1f1, Dialect::X1, Dialect::V1];

    pub fn spec(self) -> &'static DialectSpec {
        match self {
            Dialect::T1f1 => &T1F1,
            Dialect::X1 => &X1,
            Dialect::V1 => &V1,
        }
    }

    pub fn name(self) -> &'static str {
        self.spec().name
    }

    /// The command table, built on first use and shared thereafter.
    pub fn table(self) -> Arc<CommandTable> {
        static TABLES: [OnceLock<Arc<CommandTable>>; 3] = [OnceLock::new(), OnceLock::new(), OnceLock::new()];

        let slot = match self {
            Dialect::T1f1 => &TABLES[0],
            Dialect::X1 => &TABLES[1],
            Dialect::V1 => &TABLES[2],
        };
        Arc::clone(slot.get_or_init(|| Arc::new(CommandTable::new(self.spec().commands))))
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Dialect {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Dialect::ALL
            .into_iter()
            .find(|d| d.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| ConfigurationError::UnknownModel(s.to_string()))
    }
}
