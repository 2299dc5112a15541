//! In-memory sensor that speaks the bus protocol.
//!
//! A [`SimDevice`] owns the device state; its [`SimBus`] and [`SimRail`]
//! handles plug into [`SpiNdir`] in place of spidev and the GPIO rail. The
//! device interprets everything written during a session when the first
//! byte is read back, answers with a status byte and payload, and keeps an
//! EEPROM, a watchdog flag and an uptime counter. Faults can be queued to
//! force NACK/BUSY/NONE replies or to unplug the bus.
//!
//! Reading more payload than the device produced, or leaving payload
//! unread, desynchronises it: the next transaction answers NONE.

use crate::bus::SpiBus;
use crate::calib::{range_block, FieldKind, FieldValue, NdirCalib, BLOCK_COMMON, COMMON_FIELDS, INDEX_IS_SET, RANGES, RANGE_FIELDS};
use crate::clock::Clock;
use crate::codec::{encode_f32, encode_u16, encode_u32};
use crate::command::{CommandTable, ReturnCount};
use crate::datum::{RECORDER_RECORD_LEN, VERSION_IDENT_LEN, VERSION_TAG_LEN};
use crate::dialect::{Dialect, Sampling, STATUS_ACK, STATUS_BUSY, STATUS_NACK};
use crate::driver::SpiNdir;
use crate::lock::BusLock;
use crate::power::PowerRail;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

const MAX_LOG: usize = 1024;

/// Status byte of a device that has lost frame sync, or is unpowered.
pub const STATUS_NONE: u8 = 0x00;

pub const SIM_IDENT: &str = "SCS NDIR simulator";
pub const SIM_TAG: &str = "001.000.000";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SimFault {
    /// The next transaction answers with this status byte and no payload.
    Status(u8),
    /// The next `n` transactions answer BUSY.
    Busy(usize),
    /// Opening the bus fails until [`SimDevice::replug`].
    Unplug,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SimConfig {
    pub gas: [f32; 3],
    pub voltage: [f32; 3],
    pub raw: [u16; 3],
    pub offsets: [u16; 4],
    pub pressure: f32,
    pub input_voltage: f32,
    pub input_raw: u16,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            gas: [412.0, 409.5, 23.4],
            voltage: [0.3312, 0.2795, 1.6521],
            raw: [2_710, 2_287, 13_520],
            offsets: [1_200, 1_180, 3_050, 3_020],
            pressure: 101.3,
            input_voltage: 11.9,
            input_raw: 3_710,
        }
    }
}

/// Counters since the device was created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimStats {
    pub transactions: u32,
    pub acks: u32,
    pub nacks: u32,
    pub busy: u32,
    pub nones: u32,
    pub short_reads: u32,
    pub desyncs: u32,
    pub eeprom_writes: u32,
    pub reloads: u32,
    pub resets: u32,
    pub triggers: u32,
}

/// What the bus saw during one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionRecord {
    pub cmd: String,
    pub params: Vec<u8>,
    pub status: u8,
    /// Payload bytes the device had ready after the status byte.
    pub available: usize,
    /// `read` calls after the status byte.
    pub payload_reads: usize,
    pub bytes_read: usize,
}

#[derive(Debug, Default)]
struct Exchange {
    written: Vec<u8>,
    response: Option<Vec<u8>>,
    position: usize,
    reads: usize,
}

struct SimState {
    dialect: Dialect,
    table: Arc<CommandTable>,
    clock: Arc<dyn Clock>,
    config: SimConfig,

    powered: bool,
    unplugged: bool,
    booted_at: Duration,
    watchdog_reset: bool,
    desynced: bool,
    lamp_on: bool,
    lamp_level: Option<f32>,
    single_shot: bool,
    recorder_count: u16,

    eeprom: HashMap<(u8, u8), Vec<u8>>,
    faults: VecDeque<SimFault>,
    busy_remaining: usize,

    exchange: Option<Exchange>,
    stats: SimStats,
    log: VecDeque<TransactionRecord>,
}

impl SimState {
    fn uptime(&self) -> u32 {
        self.clock.now().saturating_sub(self.booted_at).as_secs() as u32
    }

    fn field_width(block: u8, index: u8) -> usize {
        if block == BLOCK_COMMON {
            COMMON_FIELDS
                .iter()
                .find(|f| f.index == index)
                .map_or(4, |f| f.kind.width())
        } else if index == INDEX_IS_SET {
            FieldKind::U16.width()
        } else {
            FieldKind::F32.width()
        }
    }

    fn next_forced_status(&mut self) -> Option<u8> {
        if self.busy_remaining > 0 {
            self.busy_remaining -= 1;
            return Some(STATUS_BUSY);
        }

        match self.faults.pop_front()? {
            SimFault::Status(status) => Some(status),
            SimFault::Busy(n) if n > 0 => {
                self.busy_remaining = n - 1;
                Some(STATUS_BUSY)
            }
            SimFault::Busy(_) => None,
            SimFault::Unplug => {
                self.unplugged = true;
                Some(STATUS_NONE)
            }
        }
    }

    /// Interprets a complete frame and returns status byte plus payload.
    fn respond(&mut self, written: &[u8]) -> Vec<u8> {
        self.stats.transactions += 1;

        if !self.powered {
            self.stats.nones += 1;
            return vec![STATUS_NONE];
        }

        if self.desynced {
            self.desynced = false;
            self.stats.nones += 1;
            return vec![STATUS_NONE];
        }

        if let Some(status) = self.next_forced_status() {
            match status {
                STATUS_BUSY => self.stats.busy += 1,
                STATUS_NACK => self.stats.nacks += 1,
                _ => self.stats.nones += 1,
            }
            return vec![status];
        }

        if written.len() < 2 {
            self.stats.nones += 1;
            return vec![STATUS_NONE];
        }

        let name = String::from_utf8_lossy(&written[0..2]).to_string();
        let params = &written[2..];

        match self.execute(&name, params) {
            Some(payload) => {
                self.stats.acks += 1;
                let mut response = Vec::with_capacity(payload.len() + 1);
                response.push(STATUS_ACK);
                response.extend_from_slice(&payload);
                response
            }
            None => {
                self.stats.nacks += 1;
                vec![STATUS_NACK]
            }
        }
    }

    /// `None` for anything the firmware would NACK.
    fn execute(&mut self, name: &str, params: &[u8]) -> Option<Vec<u8>> {
        let command = *self.table.find(name).ok()?;

        let floats = |values: &[f32]| values.iter().flat_map(|v| encode_f32(*v)).collect::<Vec<u8>>();
        let words = |values: &[u16]| values.iter().flat_map(|v| encode_u16(*v)).collect::<Vec<u8>>();

        let payload = match name {
            "vi" => padded(SIM_IDENT, VERSION_IDENT_LEN),
            "vt" => padded(SIM_TAG, VERSION_TAG_LEN),
            "up" => encode_u32(self.uptime()).to_vec(),
            "ws" => vec![self.watchdog_reset as u8],
            "wc" => {
                self.watchdog_reset = false;
                Vec::new()
            }
            "wr" => {
                self.watchdog_reset = true;
                self.booted_at = self.clock.now();
                self.stats.resets += 1;
                Vec::new()
            }
            "cr" => {
                let (block, index) = (*params.first()?, *params.get(1)?);
                let width = Self::field_width(block, index);
                let mut value = self.eeprom.get(&(block, index)).cloned().unwrap_or_default();
                value.resize(width, 0xff);
                value
            }
            "cw" => {
                let (block, index) = (*params.first()?, *params.get(1)?);
                let value = params.get(2..)?;
                if value.len() != Self::field_width(block, index) {
                    return None;
                }
                self.eeprom.insert((block, index), value.to_vec());
                self.stats.eeprom_writes += 1;
                Vec::new()
            }
            "cl" => {
                self.stats.reloads += 1;
                Vec::new()
            }
            "lr" => {
                self.lamp_on = *params.first()? != 0;
                Vec::new()
            }
            "ll" => {
                let bytes: [u8; 4] = params.get(0..4)?.try_into().ok()?;
                self.lamp_level = Some(f32::from_le_bytes(bytes));
                Vec::new()
            }
            "ir" => encode_u16(self.config.input_raw).to_vec(),
            "iv" => encode_f32(self.config.input_voltage).to_vec(),
            "mc" => Vec::new(),
            "mr" => words(&self.config.raw),
            "mv" => floats(&self.config.voltage),
            "rs" => {
                let count = params.get(4..6)?;
                self.recorder_count = u16::from_le_bytes([count[0], count[1]]);
                Vec::new()
            }
            "rp" => {
                let mut out = Vec::with_capacity(self.recorder_count as usize * RECORDER_RECORD_LEN);
                for i in 0..self.recorder_count {
                    out.extend_from_slice(&encode_u16(i.wrapping_mul(10)));
                    out.extend_from_slice(&(self.config.raw[0] as i32 + i as i32).to_le_bytes());
                    out.extend_from_slice(&(self.config.raw[1] as i32 - i as i32).to_le_bytes());
                }
                out
            }
            "sm" => {
                self.single_shot = *params.first()? != 0;
                Vec::new()
            }
            "sr" => words(&self.config.raw),
            "sv" => floats(&self.config.voltage),
            "sg" => floats(&self.config.gas),
            "so" => words(&self.config.offsets),
            _ if self.is_trigger(name) => {
                self.stats.triggers += 1;
                Vec::new()
            }
            "sp" | "sb" => encode_f32(self.config.pressure).to_vec(),
            _ => match command.return_count() {
                ReturnCount::Fixed(n) => vec![0; n],
                ReturnCount::PerCall => Vec::new(),
            },
        };

        Some(payload)
    }

    fn is_trigger(&self, name: &str) -> bool {
        matches!(self.dialect.spec().sampling, Sampling::Triggered { trigger } if trigger == name)
    }

    fn record(&mut self, exchange: Exchange) {
        let response = exchange.response.unwrap_or_default();
        let cmd = String::from_utf8_lossy(exchange.written.get(0..2).unwrap_or(&[])).to_string();
        let status = response.first().copied().unwrap_or(STATUS_NONE);
        let available = response.len().saturating_sub(1);
        let bytes_read = exchange.position.saturating_sub(1);

        if response.len() > exchange.position {
            // payload left unread: the device is still clocking it out
            self.desynced = true;
            self.stats.desyncs += 1;
        }

        if self.log.len() >= MAX_LOG {
            self.log.pop_front();
        }
        self.log.push_back(TransactionRecord {
            cmd,
            params: exchange.written.get(2..).unwrap_or(&[]).to_vec(),
            status,
            available,
            payload_reads: exchange.reads.saturating_sub(1),
            bytes_read,
        });
    }
}

fn padded(text: &str, len: usize) -> Vec<u8> {
    let mut bytes = text.as_bytes().to_vec();
    bytes.resize(len, b' ');
    bytes
}

/// The simulated sensor. Cheap to clone; clones share one device.
#[derive(Clone)]
pub struct SimDevice {
    state: Arc<Mutex<SimState>>,
}

impl SimDevice {
    /// Unpowered device with the factory calibration in EEPROM.
    pub fn new(dialect: Dialect, clock: Arc<dyn Clock>) -> Self {
        Self::new_with_config(dialect, clock, SimConfig::default())
    }

    pub fn new_with_config(dialect: Dialect, clock: Arc<dyn Clock>, config: SimConfig) -> Self {
        let booted_at = clock.now();
        let device = Self {
            state: Arc::new(Mutex::new(SimState {
                dialect,
                table: dialect.table(),
                clock,
                config,
                powered: false,
                unplugged: false,
                booted_at,
                watchdog_reset: false,
                desynced: false,
                lamp_on: false,
                lamp_level: None,
                single_shot: false,
                recorder_count: 0,
                eeprom: HashMap::new(),
                faults: VecDeque::new(),
                busy_remaining: 0,
                exchange: None,
                stats: SimStats::default(),
                log: VecDeque::new(),
            })),
        };
        device.load_eeprom(&NdirCalib::default());
        device
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn bus(&self) -> SimBus {
        SimBus {
            state: Arc::clone(&self.state),
        }
    }

    pub fn rail(&self) -> SimRail {
        SimRail {
            state: Arc::clone(&self.state),
        }
    }

    /// A driver wired to this device.
    pub fn driver(&self, lock: BusLock, lock_name: impl Into<String>) -> SpiNdir<SimBus, SimRail> {
        let (dialect, clock) = {
            let state = self.state();
            (state.dialect, Arc::clone(&state.clock))
        };
        SpiNdir::new(dialect, self.bus(), self.rail(), lock, lock_name, clock)
    }

    pub fn inject(&self, fault: SimFault) {
        debug!(?fault, "sim fault queued");
        self.state().faults.push_back(fault);
    }

    pub fn unplug(&self) {
        self.state().unplugged = true;
    }

    pub fn replug(&self) {
        self.state().unplugged = false;
    }

    pub fn set_gas(&self, gas: [f32; 3]) {
        self.state().config.gas = gas;
    }

    pub fn set_voltage(&self, voltage: [f32; 3]) {
        self.state().config.voltage = voltage;
    }

    pub fn config(&self) -> SimConfig {
        self.state().config
    }

    pub fn is_powered(&self) -> bool {
        self.state().powered
    }

    pub fn lamp_on(&self) -> bool {
        self.state().lamp_on
    }

    pub fn lamp_level(&self) -> Option<f32> {
        self.state().lamp_level
    }

    pub fn single_shot(&self) -> bool {
        self.state().single_shot
    }

    pub fn watchdog_reset(&self) -> bool {
        self.state().watchdog_reset
    }

    pub fn stats(&self) -> SimStats {
        self.state().stats.clone()
    }

    pub fn log(&self) -> Vec<TransactionRecord> {
        self.state().log.iter().cloned().collect()
    }

    pub fn last_transaction(&self) -> Option<TransactionRecord> {
        self.state().log.back().cloned()
    }

    pub fn clear_log(&self) {
        self.state().log.clear();
    }

    /// Raw EEPROM cell, as last written.
    pub fn eeprom_cell(&self, block: u8, index: u8) -> Option<Vec<u8>> {
        self.state().eeprom.get(&(block, index)).cloned()
    }

    /// Every cell reads back as erased.
    pub fn erase_eeprom(&self) {
        self.state().eeprom.clear();
    }

    /// Writes `calib` straight into EEPROM, bypassing the bus.
    pub fn load_eeprom(&self, calib: &NdirCalib) {
        let mut state = self.state();

        for desc in &COMMON_FIELDS {
            if let Some(value) = calib.common(desc.index) {
                state.eeprom.insert((BLOCK_COMMON, desc.index), value.encode().to_vec());
            }
        }

        for slot in 0..RANGES.len() {
            let block = range_block(slot);
            let range = calib.range(slot);
            let is_set = FieldValue::U16(range.is_some() as u16);
            state.eeprom.insert((block, INDEX_IS_SET), is_set.encode().to_vec());

            if let Some(range) = range {
                for desc in &RANGE_FIELDS {
                    let value = FieldValue::F32(range.get(desc.index));
                    state.eeprom.insert((block, desc.index), value.encode().to_vec());
                }
            }
        }
    }
}

pub struct SimBus {
    state: Arc<Mutex<SimState>>,
}

impl SimBus {
    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "simulated bus unplugged")
}

impl SpiBus for SimBus {
    fn open(&mut self) -> io::Result<()> {
        let mut state = self.state();
        if state.unplugged {
            return Err(not_connected());
        }
        state.exchange = Some(Exchange::default());
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.state();
        if let Some(exchange) = state.exchange.take() {
            state.record(exchange);
        }
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut state = self.state();
        let exchange = state.exchange.as_mut().ok_or_else(not_connected)?;
        exchange.written.extend_from_slice(bytes);
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state();
        let mut exchange = state.exchange.take().ok_or_else(not_connected)?;

        if exchange.response.is_none() {
            let response = state.respond(&exchange.written);
            exchange.response = Some(response);
        }

        let response = exchange.response.as_deref().unwrap_or(&[]);
        let available = response.len().saturating_sub(exchange.position);
        let n = available.min(buf.len());
        buf[..n].copy_from_slice(&response[exchange.position..exchange.position + n]);

        exchange.position += n;
        exchange.reads += 1;

        if n < buf.len() {
            state.stats.short_reads += 1;
            // the host clocked past the end of the frame
            if !state.desynced {
                state.desynced = true;
                state.stats.desyncs += 1;
            }
        }

        state.exchange = Some(exchange);
        Ok(n)
    }
}

pub struct SimRail {
    state: Arc<Mutex<SimState>>,
}

impl PowerRail for SimRail {
    fn is_on(&self) -> io::Result<bool> {
        Ok(self.state.lock().unwrap_or_else(|e| e.into_inner()).powered)
    }

    fn set(&mut self, on: bool) -> io::Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if on && !state.powered {
            state.booted_at = state.clock.now();
            state.watchdog_reset = false;
            state.desynced = false;
        }
        state.powered = on;
        Ok(())
    }
}
