//! Typed readings and documents produced by the driver.

use crate::error::ConfigurationError;
use arrayvec::ArrayString;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

pub const VERSION_IDENT_LEN: usize = 40;
pub const VERSION_TAG_LEN: usize = 11;

fn rounded(value: Option<f32>, places: i32) -> Option<f64> {
    let scale = 10f64.powi(places);
    value.map(|v| (v as f64 * scale).round() / scale)
}

fn round_1<S: Serializer>(value: &Option<f32>, s: S) -> Result<S::Ok, S::Error> {
    rounded(*value, 1).serialize(s)
}

fn round_4<S: Serializer>(value: &Option<f32>, s: S) -> Result<S::Ok, S::Error> {
    rounded(*value, 4).serialize(s)
}

fn round_6<S: Serializer>(value: &Option<f32>, s: S) -> Result<S::Ok, S::Error> {
    rounded(*value, 6).serialize(s)
}

/// ISO 8601 with milliseconds.
pub fn format_rec(rec: &DateTime<Utc>) -> String {
    rec.to_rfc3339_opts(SecondsFormat::Millis, false)
}

fn serialize_rec<S: Serializer>(rec: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format_rec(rec))
}

pub fn rec_from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or_default()
}

/// Gas concentration reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GasDatum {
    #[serde(serialize_with = "serialize_rec")]
    pub rec: DateTime<Utc>,
    #[serde(serialize_with = "round_1")]
    pub cnc: Option<f32>,
    #[serde(serialize_with = "round_1")]
    pub cnc_igl: Option<f32>,
    #[serde(serialize_with = "round_1")]
    pub temp: Option<f32>,
}

impl GasDatum {
    pub fn new(rec: DateTime<Utc>, values: [Option<f32>; 3]) -> Self {
        Self {
            rec,
            cnc: values[0],
            cnc_igl: values[1],
            temp: values[2],
        }
    }
}

/// Thermopile amplitudes from the sampler.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoltageDatum {
    #[serde(serialize_with = "serialize_rec")]
    pub rec: DateTime<Utc>,
    #[serde(rename = "pile-ref-ampl", serialize_with = "round_6")]
    pub pile_ref: Option<f32>,
    #[serde(rename = "pile-act-ampl", serialize_with = "round_6")]
    pub pile_act: Option<f32>,
    #[serde(rename = "therm-avg", serialize_with = "round_6")]
    pub therm: Option<f32>,
}

impl VoltageDatum {
    pub fn new(rec: DateTime<Utc>, values: [Option<f32>; 3]) -> Self {
        Self {
            rec,
            pile_ref: values[0],
            pile_act: values[1],
            therm: values[2],
        }
    }
}

/// Instantaneous channel voltages from the measure commands.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MeasureDatum {
    #[serde(serialize_with = "serialize_rec")]
    pub rec: DateTime<Utc>,
    #[serde(serialize_with = "round_4")]
    pub pile_ref: Option<f32>,
    #[serde(serialize_with = "round_4")]
    pub pile_act: Option<f32>,
    #[serde(serialize_with = "round_4")]
    pub therm: Option<f32>,
}

/// ADC counts, from `sr` or `mr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RawDatum {
    pub pile_ref: u16,
    pub pile_act: u16,
    pub therm: u16,
}

impl From<[u16; 3]> for RawDatum {
    fn from(values: [u16; 3]) -> Self {
        Self {
            pile_ref: values[0],
            pile_act: values[1],
            therm: values[2],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OffsetDatum {
    pub min_ref_offset: u16,
    pub min_act_offset: u16,
    pub max_ref_offset: u16,
    pub max_act_offset: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PressureDatum {
    #[serde(serialize_with = "serialize_rec")]
    pub rec: DateTime<Utc>,
    #[serde(rename = "pA", serialize_with = "round_1")]
    pub p_a: Option<f32>,
}

/// One recorder record: milliseconds since the recording started and the
/// two thermopile readings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RecorderDatum {
    pub rec: u16,
    pub pile_ref: i32,
    pub pile_act: i32,
}

pub const RECORDER_RECORD_LEN: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub id: ArrayString<VERSION_IDENT_LEN>,
    pub tag: ArrayString<VERSION_TAG_LEN>,
}

impl Version {
    /// Truncates at a character boundary if the device sends more than fits.
    pub fn new(id: &str, tag: &str) -> Self {
        Self {
            id: truncated(id),
            tag: truncated(tag),
        }
    }
}

fn truncated<const N: usize>(s: &str) -> ArrayString<N> {
    let mut out = ArrayString::new();
    for c in s.chars() {
        if out.try_push(c).is_err() {
            break;
        }
    }
    out
}

/// Published by the monitor: gas concentrations, or thermopile voltages in
/// raw mode.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Sample {
    Gas(GasDatum),
    Voltage(VoltageDatum),
}

impl Sample {
    pub fn rec(&self) -> DateTime<Utc> {
        match self {
            Sample::Gas(d) => d.rec,
            Sample::Voltage(d) => d.rec,
        }
    }

    pub fn values(&self) -> [Option<f32>; 3] {
        match self {
            Sample::Gas(d) => [d.cnc, d.cnc_igl, d.temp],
            Sample::Voltage(d) => [d.pile_ref, d.pile_act, d.therm],
        }
    }
}

/// Device uptime, whole seconds. Serialises as `{"period": "DD-HH:MM:SS.mmm"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Uptime {
    pub seconds: u32,
}

impl Uptime {
    pub fn new(seconds: u32) -> Self {
        Self { seconds }
    }
}

impl fmt::Display for Uptime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.seconds;
        write!(
            f,
            "{:02}-{:02}:{:02}:{:02}.000",
            s / 86_400,
            (s % 86_400) / 3_600,
            (s % 3_600) / 60,
            s % 60
        )
    }
}

impl FromStr for Uptime {
    type Err = ConfigurationError;

    fn from_str(period: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigurationError::InvalidValue {
            path: "up.period".to_string(),
            value: period.to_string(),
        };

        let (days, clock) = period.split_once('-').ok_or_else(invalid)?;
        let mut fields = clock.splitn(3, ':');
        let hours = fields.next().ok_or_else(invalid)?;
        let minutes = fields.next().ok_or_else(invalid)?;
        let seconds = fields.next().ok_or_else(invalid)?;
        let seconds = seconds.split('.').next().ok_or_else(invalid)?;

        let parse = |s: &str| s.trim().parse::<u64>().map_err(|_| invalid());
        let total = parse(days)? * 86_400 + parse(hours)? * 3_600 + parse(minutes)? * 60 + parse(seconds)?;

        u32::try_from(total).map(Uptime::new).map_err(|_| invalid())
    }
}

#[derive(Serialize, Deserialize)]
struct UptimeDocument {
    period: String,
}

impl Serialize for Uptime {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        UptimeDocument {
            period: self.to_string(),
        }
        .serialize(s)
    }
}

impl<'de> Deserialize<'de> for Uptime {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let doc = UptimeDocument::deserialize(d)?;
        doc.period.parse().map_err(serde::de::Error::custom)
    }
}

/// Device health document.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// Restarted because of a watchdog timeout (or a forced reset).
    #[serde(rename = "w-rst")]
    pub watchdog_reset: bool,
    #[serde(rename = "pwr-in", serialize_with = "round_1")]
    pub power_in: Option<f32>,
    #[serde(rename = "up")]
    pub uptime: Uptime,
}
