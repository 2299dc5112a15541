//! Cross-process snapshot of the monitor's rolling average.
//!
//! A small file-backed mapping shared by the sampling worker (the only
//! writer) and any number of readers. Publication is double-buffered: the
//! writer fills the inactive slot, then flips the active index, both under
//! the named monitor lock. A writer killed part way through leaves the
//! previous snapshot active.
//!
//! ```text
//! header  0..4   magic "NDIR"
//!         4      active slot (0xff: nothing published)
//!         5      stop requested
//!         8..12  publication sequence
//! slot    0      kind (1 gas, 2 voltage)
//!         2..4   readings in the window
//!         4..12  rec, ms since the epoch
//!         12..24 three f32 values, NaN for absent
//!         24..28 sequence
//! ```

use crate::codec::{decode_f32, encode_opt_f32};
use crate::datum::{rec_from_millis, GasDatum, Sample, VoltageDatum};
use crate::error::Result;
use crate::lock::{BusLock, LockBudget};
use chrono::{DateTime, Utc};
use memmap2::{MmapMut, MmapOptions};
use static_assertions::const_assert_eq;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

const MAGIC: [u8; 4] = *b"NDIR";

const HEADER_LEN: usize = 16;
const SLOT_LEN: usize = 32;
const SLOTS: usize = 2;

pub const REGION_LEN: usize = HEADER_LEN + SLOTS * SLOT_LEN;

const_assert_eq!(REGION_LEN, 80);

const ACTIVE: usize = 4;
const STOP: usize = 5;
const SEQUENCE: usize = 8;

const NO_SLOT: u8 = 0xff;

const KIND_GAS: u8 = 1;
const KIND_VOLTAGE: u8 = 2;

/// Default region file for a device lock name.
pub fn default_region_path(name: &str) -> PathBuf {
    let dev_shm = Path::new("/dev/shm");
    if dev_shm.is_dir() {
        dev_shm.join(format!("{}.shm", name))
    } else {
        std::env::temp_dir().join(format!("{}.shm", name))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleKind {
    Gas,
    Voltage,
}

/// One published rolling-average value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Snapshot {
    pub kind: SampleKind,
    pub count: u16,
    pub rec: DateTime<Utc>,
    pub values: [Option<f32>; 3],
    pub sequence: u32,
}

impl Snapshot {
    pub fn sample(&self) -> Sample {
        match self.kind {
            SampleKind::Gas => Sample::Gas(GasDatum::new(self.rec, self.values)),
            SampleKind::Voltage => Sample::Voltage(VoltageDatum::new(self.rec, self.values)),
        }
    }

    fn write(&self, slot: &mut [u8]) {
        slot.fill(0);
        slot[0] = match self.kind {
            SampleKind::Gas => KIND_GAS,
            SampleKind::Voltage => KIND_VOLTAGE,
        };
        slot[2..4].copy_from_slice(&self.count.to_le_bytes());
        slot[4..12].copy_from_slice(&self.rec.timestamp_millis().to_le_bytes());
        for (i, value) in self.values.iter().enumerate() {
            let at = 12 + i * 4;
            slot[at..at + 4].copy_from_slice(&encode_opt_f32(*value));
        }
        slot[24..28].copy_from_slice(&self.sequence.to_le_bytes());
    }

    fn read(slot: &[u8]) -> Option<Self> {
        let kind = match slot[0] {
            KIND_GAS => SampleKind::Gas,
            KIND_VOLTAGE => SampleKind::Voltage,
            _ => return None,
        };

        let word = |at: usize| [slot[at], slot[at + 1], slot[at + 2], slot[at + 3]];
        let mut millis = [0u8; 8];
        millis.copy_from_slice(&slot[4..12]);

        Some(Self {
            kind,
            count: u16::from_le_bytes([slot[2], slot[3]]),
            rec: rec_from_millis(i64::from_le_bytes(millis)),
            values: [decode_f32(word(12)), decode_f32(word(16)), decode_f32(word(20))],
            sequence: u32::from_le_bytes(word(24)),
        })
    }
}

pub struct SharedRegion {
    path: PathBuf,
    map: Mutex<MmapMut>,
    lock: BusLock,
    lock_name: String,
}

impl SharedRegion {
    /// Maps `path`, creating and initialising it if needed. `lock_name`
    /// guards publication and reads.
    pub fn open(path: impl Into<PathBuf>, lock: BusLock, lock_name: impl Into<String>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        if file.metadata()?.len() < REGION_LEN as u64 {
            file.set_len(REGION_LEN as u64)?;
        }

        // SAFETY: the file is private to ndirbus processes, and every access
        // goes through the in-process mutex and the named lock.
        let mut map = unsafe { MmapOptions::new().len(REGION_LEN).map_mut(&file)? };

        if map[0..4] != MAGIC {
            map.fill(0);
            map[0..4].copy_from_slice(&MAGIC);
            map[ACTIVE] = NO_SLOT;
            map.flush()?;
            debug!(path = %path.display(), "shared region initialised");
        }

        Ok(Self {
            path,
            map: Mutex::new(map),
            lock,
            lock_name: lock_name.into(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn map(&self) -> std::sync::MutexGuard<'_, MmapMut> {
        self.map.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Writes the inactive slot, then makes it active. Returns the sequence
    /// number assigned.
    pub fn publish(&self, kind: SampleKind, count: u16, rec: DateTime<Utc>, values: [Option<f32>; 3]) -> Result<u32> {
        let _guard = self.lock.acquire(&self.lock_name, LockBudget::Short.timeout())?;
        let mut map = self.map();

        let sequence = u32::from_le_bytes([map[SEQUENCE], map[SEQUENCE + 1], map[SEQUENCE + 2], map[SEQUENCE + 3]])
            .wrapping_add(1);
        let target = match map[ACTIVE] {
            0 => 1,
            _ => 0,
        };

        let start = HEADER_LEN + target * SLOT_LEN;
        Snapshot {
            kind,
            count,
            rec,
            values,
            sequence,
        }
        .write(&mut map[start..start + SLOT_LEN]);

        map[SEQUENCE..SEQUENCE + 4].copy_from_slice(&sequence.to_le_bytes());
        map[ACTIVE] = target as u8;

        Ok(sequence)
    }

    /// The last published snapshot, if any.
    pub fn read(&self) -> Result<Option<Snapshot>> {
        let _guard = self.lock.acquire(&self.lock_name, LockBudget::Short.timeout())?;
        let map = self.map();

        let active = map[ACTIVE] as usize;
        if active >= SLOTS {
            return Ok(None);
        }

        let start = HEADER_LEN + active * SLOT_LEN;
        Ok(Snapshot::read(&map[start..start + SLOT_LEN]))
    }

    pub fn request_stop(&self) {
        self.map()[STOP] = 1;
    }

    pub fn stop_requested(&self) -> bool {
        self.map()[STOP] != 0
    }

    /// Clears the stop flag ahead of a new worker. The last published
    /// snapshot stays readable.
    pub fn reset_control(&self) {
        self.map()[STOP] = 0;
    }

    pub fn flush(&self) -> Result<()> {
        Ok(self.map().flush()?)
    }
}
