//! Calibration EEPROM: typed fields addressed by (block, index).
//!
//! Block 0 holds the common fields. Blocks 1..=5 each hold one measurement
//! range: an `is_set` flag at index 0, then nine float coefficients. The
//! device EEPROM is the source of truth; [`NdirCalib`] is a host-side
//! snapshot of it, and the JSON file form is a template for `store`.
//!
//! Writes are not transactional on the device. If a `store` fails part way
//! the EEPROM holds a mix of old and new values; `retrieve` again before
//! trusting it.

use crate::bus::SpiBus;
use crate::codec::{encode_opt_f32, encode_u16, encode_u32, Decoder};
use crate::driver::Ndir;
use crate::error::{ConfigurationError, Result};
use crate::transactor::Session;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

pub const BLOCK_COMMON: u8 = 0;

pub const INDEX_IS_SET: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    U16,
    U32,
    F32,
}

impl FieldKind {
    pub fn width(self) -> usize {
        match self {
            FieldKind::U16 => 2,
            FieldKind::U32 | FieldKind::F32 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    U16(u16),
    U32(u32),
    /// `None` is the erased cell.
    F32(Option<f32>),
}

impl FieldValue {
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::U16(_) => FieldKind::U16,
            FieldValue::U32(_) => FieldKind::U32,
            FieldValue::F32(_) => FieldKind::F32,
        }
    }

    pub fn encode(&self) -> heapless::Vec<u8, 4> {
        let mut out = heapless::Vec::new();
        // widths are at most 4, so this never overflows
        let _ = match self {
            FieldValue::U16(v) => out.extend_from_slice(&encode_u16(*v)),
            FieldValue::U32(v) => out.extend_from_slice(&encode_u32(*v)),
            FieldValue::F32(v) => out.extend_from_slice(&encode_opt_f32(*v)),
        };
        out
    }

    pub fn decode(kind: FieldKind, bytes: &[u8]) -> Result<Self> {
        let mut decoder = Decoder::new(bytes);
        Ok(match kind {
            FieldKind::U16 => FieldValue::U16(decoder.u16()?),
            FieldKind::U32 => FieldValue::U32(decoder.u32()?),
            FieldKind::F32 => FieldValue::F32(decoder.f32()?),
        })
    }

    fn as_u16(self) -> u16 {
        match self {
            FieldValue::U16(v) => v,
            _ => 0,
        }
    }

    fn as_u32(self) -> u32 {
        match self {
            FieldValue::U32(v) => v,
            _ => 0,
        }
    }

    fn as_f32(self) -> Option<f32> {
        match self {
            FieldValue::F32(v) => v,
            _ => None,
        }
    }
}

/// One EEPROM cell within its block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDesc {
    pub name: &'static str,
    pub index: u8,
    pub kind: FieldKind,
}

impl FieldDesc {
    const fn new(name: &'static str, index: u8, kind: FieldKind) -> Self {
        Self { name, index, kind }
    }
}

pub const COMMON_FIELDS: [FieldDesc; 7] = [
    FieldDesc::new("ndir-serial", 0, FieldKind::U32),
    FieldDesc::new("board-serial", 1, FieldKind::U32),
    FieldDesc::new("selected-range", 2, FieldKind::U16),
    FieldDesc::new("lamp-voltage", 3, FieldKind::F32),
    FieldDesc::new("lamp-period", 4, FieldKind::U16),
    FieldDesc::new("sample-start", 5, FieldKind::U16),
    FieldDesc::new("sample-end", 6, FieldKind::U16),
];

pub const RANGE_FIELDS: [FieldDesc; 9] = [
    FieldDesc::new("zero", 1, FieldKind::F32),
    FieldDesc::new("span", 2, FieldKind::F32),
    FieldDesc::new("linear-b", 3, FieldKind::F32),
    FieldDesc::new("linear-c", 4, FieldKind::F32),
    FieldDesc::new("alpha-low", 5, FieldKind::F32),
    FieldDesc::new("alpha-high", 6, FieldKind::F32),
    FieldDesc::new("beta-a", 7, FieldKind::F32),
    FieldDesc::new("beta-o", 8, FieldKind::F32),
    FieldDesc::new("t-cal", 9, FieldKind::F32),
];

/// Range slot names in block order; slot `i` lives in block `i + 1`.
pub const RANGES: [&str; 5] = [
    "range-iaq",
    "range-safety",
    "range-combustion",
    "range-industrial",
    "range-custom",
];

pub fn range_block(slot: usize) -> u8 {
    slot as u8 + 1
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RangeCalib {
    pub zero: Option<f32>,
    pub span: Option<f32>,
    pub linear_b: Option<f32>,
    pub linear_c: Option<f32>,
    pub alpha_low: Option<f32>,
    pub alpha_high: Option<f32>,
    pub beta_a: Option<f32>,
    pub beta_o: Option<f32>,
    pub t_cal: Option<f32>,
}

impl RangeCalib {
    fn slot(&mut self, index: u8) -> Option<&mut Option<f32>> {
        Some(match index {
            1 => &mut self.zero,
            2 => &mut self.span,
            3 => &mut self.linear_b,
            4 => &mut self.linear_c,
            5 => &mut self.alpha_low,
            6 => &mut self.alpha_high,
            7 => &mut self.beta_a,
            8 => &mut self.beta_o,
            9 => &mut self.t_cal,
            _ => return None,
        })
    }

    pub fn get(&self, index: u8) -> Option<f32> {
        match index {
            1 => self.zero,
            2 => self.span,
            3 => self.linear_b,
            4 => self.linear_c,
            5 => self.alpha_low,
            6 => self.alpha_high,
            7 => self.beta_a,
            8 => self.beta_o,
            9 => self.t_cal,
            _ => None,
        }
    }

    pub fn set(&mut self, index: u8, value: Option<f32>) {
        if let Some(slot) = self.slot(index) {
            *slot = value;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NdirCalib {
    pub ndir_serial: u32,
    pub board_serial: u32,
    pub selected_range: u16,
    pub lamp_voltage: Option<f32>,
    pub lamp_period: u16,
    pub sample_start: u16,
    pub sample_end: u16,

    pub range_iaq: Option<RangeCalib>,
    pub range_safety: Option<RangeCalib>,
    pub range_combustion: Option<RangeCalib>,
    pub range_industrial: Option<RangeCalib>,
    pub range_custom: Option<RangeCalib>,
}

impl Default for NdirCalib {
    /// Factory template for the indoor air quality range.
    fn default() -> Self {
        Self {
            ndir_serial: 12_700_000,
            board_serial: 1_000_000,
            selected_range: 1,
            lamp_voltage: Some(4.5),
            lamp_period: 1000,
            sample_start: 400,
            sample_end: 990,
            range_iaq: Some(RangeCalib {
                zero: Some(1.1765),
                span: Some(0.2203),
                linear_b: Some(0.000325),
                linear_c: Some(0.9363),
                alpha_low: Some(0.00042),
                alpha_high: Some(0.00042),
                beta_a: Some(1e-05),
                beta_o: Some(1e-05),
                t_cal: Some(40.5),
            }),
            range_safety: None,
            range_combustion: None,
            range_industrial: None,
            range_custom: None,
        }
    }
}

impl NdirCalib {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn common(&self, index: u8) -> Option<FieldValue> {
        Some(match index {
            0 => FieldValue::U32(self.ndir_serial),
            1 => FieldValue::U32(self.board_serial),
            2 => FieldValue::U16(self.selected_range),
            3 => FieldValue::F32(self.lamp_voltage),
            4 => FieldValue::U16(self.lamp_period),
            5 => FieldValue::U16(self.sample_start),
            6 => FieldValue::U16(self.sample_end),
            _ => return None,
        })
    }

    fn set_common(&mut self, index: u8, value: FieldValue) {
        match index {
            0 => self.ndir_serial = value.as_u32(),
            1 => self.board_serial = value.as_u32(),
            2 => self.selected_range = value.as_u16(),
            3 => self.lamp_voltage = value.as_f32(),
            4 => self.lamp_period = value.as_u16(),
            5 => self.sample_start = value.as_u16(),
            6 => self.sample_end = value.as_u16(),
            _ => {}
        }
    }

    pub fn range(&self, slot: usize) -> Option<&RangeCalib> {
        match slot {
            0 => self.range_iaq.as_ref(),
            1 => self.range_safety.as_ref(),
            2 => self.range_combustion.as_ref(),
            3 => self.range_industrial.as_ref(),
            4 => self.range_custom.as_ref(),
            _ => None,
        }
    }

    pub fn range_mut(&mut self, slot: usize) -> Option<&mut Option<RangeCalib>> {
        Some(match slot {
            0 => &mut self.range_iaq,
            1 => &mut self.range_safety,
            2 => &mut self.range_combustion,
            3 => &mut self.range_industrial,
            4 => &mut self.range_custom,
            _ => return None,
        })
    }

    /// Sets one field by path: a common field name, a range name (object or
    /// `null`), or `range-name.coefficient`. A coefficient path on an unset
    /// range is unknown; set the range as an object first.
    pub fn set(&mut self, path: &str, value: &Value) -> std::result::Result<(), ConfigurationError> {
        let invalid = || ConfigurationError::InvalidValue {
            path: path.to_string(),
            value: value.to_string(),
        };
        let unknown = || ConfigurationError::UnknownField(path.to_string());

        let (head, tail) = match path.split_once('.') {
            Some((head, tail)) => (head, Some(tail)),
            None => (path, None),
        };

        if let Some(slot) = RANGES.iter().position(|r| *r == head) {
            let range = self.range_mut(slot).ok_or_else(unknown)?;

            return match tail {
                None => {
                    *range = serde_json::from_value(value.clone()).map_err(|_| invalid())?;
                    Ok(())
                }
                Some(name) => {
                    let desc = RANGE_FIELDS.iter().find(|f| f.name == name).ok_or_else(unknown)?;
                    let coefficient = parse_f32(value).ok_or_else(invalid)?;
                    let range = range.as_mut().ok_or_else(unknown)?;
                    range.set(desc.index, coefficient);
                    Ok(())
                }
            };
        }

        if tail.is_some() {
            return Err(unknown());
        }

        let desc = COMMON_FIELDS.iter().find(|f| f.name == head).ok_or_else(unknown)?;
        let parsed = match desc.kind {
            FieldKind::U16 => value
                .as_u64()
                .and_then(|v| u16::try_from(v).ok())
                .map(FieldValue::U16),
            FieldKind::U32 => value
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .map(FieldValue::U32),
            FieldKind::F32 => parse_f32(value).map(FieldValue::F32),
        }
        .ok_or_else(invalid)?;

        self.set_common(desc.index, parsed);
        Ok(())
    }
}

// Some(None) for null, None when the value is not a float at all
fn parse_f32(value: &Value) -> Option<Option<f32>> {
    match value {
        Value::Null => Some(None),
        v => v.as_f64().map(|f| Some(f as f32)),
    }
}

fn read_field<B: SpiBus>(session: &Session<'_, B>, block: u8, desc: &FieldDesc) -> Result<FieldValue> {
    let width = desc.kind.width();
    let payload = session.execute("cr", Some(&[block, desc.index]), None, Some(width))?;
    FieldValue::decode(desc.kind, payload.as_bytes())
}

fn write_field<B: SpiBus>(session: &Session<'_, B>, block: u8, index: u8, value: FieldValue) -> Result<()> {
    debug!(block, index, ?value, "calib write");
    session.execute_and_wait("cw", Some(&[block, index]), Some(value.encode().as_slice()))?;
    Ok(())
}

/// Writes every common field, then each range slot: `is_set = 0` for an
/// absent range, otherwise `is_set = 1` followed by its coefficients.
pub fn store<B: SpiBus>(session: &Session<'_, B>, calib: &NdirCalib) -> Result<()> {
    for desc in &COMMON_FIELDS {
        if let Some(value) = calib.common(desc.index) {
            write_field(session, BLOCK_COMMON, desc.index, value)?;
        }
    }

    for slot in 0..RANGES.len() {
        let block = range_block(slot);
        match calib.range(slot) {
            None => write_field(session, block, INDEX_IS_SET, FieldValue::U16(0))?,
            Some(range) => {
                write_field(session, block, INDEX_IS_SET, FieldValue::U16(1))?;
                for desc in &RANGE_FIELDS {
                    write_field(session, block, desc.index, FieldValue::F32(range.get(desc.index)))?;
                }
            }
        }
    }

    info!("calibration stored");
    Ok(())
}

/// Reads the common fields, then each range whose `is_set` flag is non-zero.
pub fn retrieve<B: SpiBus>(session: &Session<'_, B>) -> Result<NdirCalib> {
    let mut calib = NdirCalib {
        range_iaq: None,
        range_safety: None,
        range_combustion: None,
        range_industrial: None,
        range_custom: None,
        ..NdirCalib::default()
    };

    for desc in &COMMON_FIELDS {
        let value = read_field(session, BLOCK_COMMON, desc)?;
        calib.set_common(desc.index, value);
    }

    let is_set = FieldDesc::new("is-set", INDEX_IS_SET, FieldKind::U16);

    for slot in 0..RANGES.len() {
        let block = range_block(slot);
        if read_field(session, block, &is_set)?.as_u16() == 0 {
            continue;
        }

        let mut range = RangeCalib::default();
        for desc in &RANGE_FIELDS {
            range.set(desc.index, read_field(session, block, desc)?.as_f32());
        }
        if let Some(target) = calib.range_mut(slot) {
            *target = Some(range);
        }
    }

    Ok(calib)
}

/// Returned by a successful store. The device keeps using its previous
/// calibration until it is told to reload from EEPROM.
#[must_use = "the device keeps its old calibration until reload() is called"]
#[derive(Debug)]
pub struct PendingReload {
    _private: (),
}

impl PendingReload {
    pub(crate) fn new() -> Self {
        Self { _private: () }
    }

    pub fn reload(self, ndir: &dyn Ndir) -> Result<()> {
        ndir.reload_calib()
    }

    /// Leaves the new values in EEPROM only, e.g. to reload after a reset.
    pub fn discard(self) {}
}
