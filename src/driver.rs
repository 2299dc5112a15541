//! The sensor's capability set and its SPI implementation.

use crate::bus::SpiBus;
use crate::calib::{self, NdirCalib, PendingReload, BLOCK_COMMON};
use crate::clock::Clock;
use crate::codec::{decode_ascii, encode_f32, encode_u16};
use crate::command::Command;
use crate::datum::{
    GasDatum, MeasureDatum, OffsetDatum, PressureDatum, RawDatum, RecorderDatum, Status, Uptime, Version,
    VoltageDatum, RECORDER_RECORD_LEN,
};
use crate::dialect::{Dialect, DialectSpec, RecorderTiming, Sampling};
use crate::error::{ConfigurationError, Result};
use crate::lock::{BusLock, LockBudget};
use crate::power::{PowerRail, PowerSequencer, Quarantine};
use crate::transactor::{Payload, Session, Transactor};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const INDEX_LAMP_PERIOD: u8 = 4;
const INDEX_SAMPLE_END: u8 = 6;

/// Everything a host can ask of the sensor, whatever its protocol revision.
///
/// Methods that touch the bus take the named bus lock for their duration and
/// fail with `LockTimeout` if another process holds it too long.
pub trait Ndir: Send + Sync {
    fn dialect(&self) -> Dialect;
    fn clock(&self) -> Arc<dyn Clock>;

    // power
    fn power_on(&self) -> Result<()>;
    fn power_off(&self) -> Result<()>;
    fn is_powered(&self) -> Result<bool>;
    fn reset(&self) -> Result<Quarantine>;
    fn quarantine(&self) -> Option<Quarantine>;
    fn in_quarantine(&self) -> bool;
    fn status(&self) -> Result<Status>;
    fn version(&self) -> Result<Version>;
    fn watchdog_clear(&self) -> Result<()>;

    // sampling
    /// Starts a sample where the dialect needs one triggered; otherwise a no-op.
    fn sample(&self) -> Result<()>;
    /// Time from `sample()` until the result can be read.
    fn sample_interval(&self) -> Result<Duration>;
    fn sample_mode(&self, single_shot: bool) -> Result<()>;
    fn get_sample_gas(&self) -> Result<GasDatum>;
    fn get_sample_voltage(&self) -> Result<VoltageDatum>;
    fn get_sample_raw(&self) -> Result<RawDatum>;
    fn get_sample_offsets(&self) -> Result<OffsetDatum>;
    fn get_sample_pressure(&self) -> Result<PressureDatum>;

    // calibration
    fn store_calib(&self, calib: &NdirCalib) -> Result<PendingReload>;
    fn retrieve_calib(&self) -> Result<NdirCalib>;
    fn reload_calib(&self) -> Result<()>;

    // lamp
    fn lamp_run(&self, on: bool) -> Result<()>;
    fn lamp_level(&self, voltage: f32) -> Result<()>;

    // measure, record, input
    fn measure_calibrate(&self) -> Result<()>;
    fn measure_raw(&self) -> Result<RawDatum>;
    fn measure_voltage(&self) -> Result<MeasureDatum>;
    fn record_raw(&self, deferral: u16, interval: u16, count: u16) -> Result<Vec<RecorderDatum>>;
    fn input_raw(&self) -> Result<u16>;
    fn input_voltage(&self) -> Result<Option<f32>>;

    /// Transacts an arbitrary command, e.g. with a deliberately wrong return
    /// count to provoke a transport failure.
    fn cmd(&self, name: &str, response_time: Duration, execution_time: Duration, return_count: usize)
        -> Result<Payload>;
}

pub struct SpiNdir<B: SpiBus, R: PowerRail> {
    dialect: Dialect,
    transactor: Transactor<B>,
    power: PowerSequencer<R>,
}

impl<B: SpiBus, R: PowerRail> SpiNdir<B, R> {
    pub fn new(
        dialect: Dialect,
        bus: B,
        rail: R,
        lock: BusLock,
        lock_name: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let spec = dialect.spec();
        let transactor = Transactor::new(
            bus,
            dialect.table(),
            lock,
            lock_name,
            spec.codes,
            spec.settle_delay,
            spec.recovery_delay,
            clock,
        );
        let power = PowerSequencer::new(rail, spec.boot_delay, spec.reset_quarantine);

        Self {
            dialect,
            transactor,
            power,
        }
    }

    pub fn transactor(&self) -> &Transactor<B> {
        &self.transactor
    }

    fn spec(&self) -> &'static DialectSpec {
        self.dialect.spec()
    }

    fn session(&self, budget: LockBudget) -> Result<Session<'_, B>> {
        self.transactor.session(budget)
    }

    fn read(&self, name: &str) -> Result<Payload> {
        self.transactor.execute(name, None, None, None)
    }

    fn unsupported(&self, capability: &'static str) -> ConfigurationError {
        ConfigurationError::Unsupported {
            model: self.spec().name,
            capability,
        }
    }
}

fn read_common_u16<B: SpiBus>(session: &Session<'_, B>, index: u8) -> Result<u16> {
    let payload = session.execute("cr", Some(&[BLOCK_COMMON, index]), None, Some(2))?;
    Ok(payload.decoder().u16()?)
}

impl<B: SpiBus, R: PowerRail> Ndir for SpiNdir<B, R> {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(self.transactor.clock())
    }

    fn power_on(&self) -> Result<()> {
        self.power.power_on(&self.transactor)
    }

    fn power_off(&self) -> Result<()> {
        self.power.power_off(&self.transactor)
    }

    fn is_powered(&self) -> Result<bool> {
        self.power.is_powered()
    }

    fn reset(&self) -> Result<Quarantine> {
        self.power.reset(&self.transactor)
    }

    fn quarantine(&self) -> Option<Quarantine> {
        self.power.quarantine(&self.transactor)
    }

    fn in_quarantine(&self) -> bool {
        self.power.in_quarantine(&self.transactor)
    }

    fn status(&self) -> Result<Status> {
        let session = self.session(LockBudget::Long)?;

        let watchdog_reset = match session.execute("ws", None, None, None)? {
            Payload::Byte(b) => b != 0,
            other => other.as_bytes().iter().any(|b| *b != 0),
        };
        let power_in = session.execute("iv", None, None, None)?.decoder().f32()?;
        let seconds = session.execute("up", None, None, None)?.decoder().u32()?;

        Ok(Status {
            watchdog_reset,
            power_in,
            uptime: Uptime::new(seconds),
        })
    }

    fn version(&self) -> Result<Version> {
        let session = self.session(LockBudget::Short)?;

        let id = session.execute("vi", None, None, None)?;
        let tag = session.execute("vt", None, None, None)?;

        Ok(Version::new(&decode_ascii(id.as_bytes()), &decode_ascii(tag.as_bytes())))
    }

    fn watchdog_clear(&self) -> Result<()> {
        self.read("wc").map(|_| ())
    }

    fn sample(&self) -> Result<()> {
        match self.spec().sampling {
            Sampling::Continuous { .. } => Ok(()),
            Sampling::Triggered { trigger } => {
                debug!(cmd = trigger, "sample trigger");
                self.read(trigger).map(|_| ())
            }
        }
    }

    fn sample_interval(&self) -> Result<Duration> {
        match self.spec().sampling {
            Sampling::Continuous { interval } => Ok(interval),
            Sampling::Triggered { .. } => {
                let session = self.session(LockBudget::Short)?;
                let lamp_period = read_common_u16(&session, INDEX_LAMP_PERIOD)? as u64;
                let sample_end = read_common_u16(&session, INDEX_SAMPLE_END)? as u64;

                Ok(Duration::from_millis(lamp_period + sample_end + 10))
            }
        }
    }

    fn sample_mode(&self, single_shot: bool) -> Result<()> {
        if !self.spec().capabilities.sampler_mode {
            return Err(self.unsupported("sampler mode").into());
        }

        let session = self.session(LockBudget::Long)?;
        session.execute_and_wait("sm", Some(&[single_shot as u8]), None)?;
        Ok(())
    }

    fn get_sample_gas(&self) -> Result<GasDatum> {
        let values = self.read("sg")?.decoder().f32x3()?;
        Ok(GasDatum::new(Utc::now(), values))
    }

    fn get_sample_voltage(&self) -> Result<VoltageDatum> {
        let values = self.read("sv")?.decoder().f32x3()?;
        Ok(VoltageDatum::new(Utc::now(), values))
    }

    fn get_sample_raw(&self) -> Result<RawDatum> {
        Ok(self.read("sr")?.decoder().u16x3()?.into())
    }

    fn get_sample_offsets(&self) -> Result<OffsetDatum> {
        let payload = self.read("so")?;
        let mut decoder = payload.decoder();

        Ok(OffsetDatum {
            min_ref_offset: decoder.u16()?,
            min_act_offset: decoder.u16()?,
            max_ref_offset: decoder.u16()?,
            max_act_offset: decoder.u16()?,
        })
    }

    fn get_sample_pressure(&self) -> Result<PressureDatum> {
        let p_a = self.read(self.spec().pressure_command)?.decoder().f32()?;
        Ok(PressureDatum { rec: Utc::now(), p_a })
    }

    fn store_calib(&self, calib: &NdirCalib) -> Result<PendingReload> {
        let session = self.session(LockBudget::Long)?;
        calib::store(&session, calib)?;
        Ok(PendingReload::new())
    }

    fn retrieve_calib(&self) -> Result<NdirCalib> {
        let session = self.session(LockBudget::Long)?;
        calib::retrieve(&session)
    }

    fn reload_calib(&self) -> Result<()> {
        let session = self.session(LockBudget::Long)?;
        session.execute_and_wait("cl", None, None)?;
        Ok(())
    }

    fn lamp_run(&self, on: bool) -> Result<()> {
        self.transactor.execute("lr", Some(&[on as u8]), None, None).map(|_| ())
    }

    fn lamp_level(&self, voltage: f32) -> Result<()> {
        if !self.spec().capabilities.lamp_level {
            return Err(self.unsupported("lamp level").into());
        }

        self.transactor
            .execute("ll", Some(&encode_f32(voltage)), None, None)
            .map(|_| ())
    }

    fn measure_calibrate(&self) -> Result<()> {
        let session = self.session(LockBudget::Long)?;
        session.execute_and_wait("mc", None, None)?;
        Ok(())
    }

    fn measure_raw(&self) -> Result<RawDatum> {
        Ok(self.read("mr")?.decoder().u16x3()?.into())
    }

    fn measure_voltage(&self) -> Result<MeasureDatum> {
        let values = self.read("mv")?.decoder().f32x3()?;

        Ok(MeasureDatum {
            rec: Utc::now(),
            pile_ref: values[0],
            pile_act: values[1],
            therm: values[2],
        })
    }

    fn record_raw(&self, deferral: u16, interval: u16, count: u16) -> Result<Vec<RecorderDatum>> {
        let session = self.session(LockBudget::Long)?;

        let mut params = [0u8; 6];
        params[0..2].copy_from_slice(&encode_u16(deferral));
        params[2..4].copy_from_slice(&encode_u16(interval));
        params[4..6].copy_from_slice(&encode_u16(count));

        session.execute("rs", Some(&params), None, None)?;

        let recording = deferral as u64 + interval as u64 * count as u64;
        let wait = match self.spec().recorder {
            RecorderTiming::CommandBased => {
                session.command("rs")?.fixed_execution_time() + Duration::from_millis(recording)
            }
            RecorderTiming::LampPeriodBased => {
                let lamp_period = read_common_u16(&session, INDEX_LAMP_PERIOD)? as u64;
                Duration::from_millis(lamp_period + recording)
            }
        };
        debug!(?wait, count, "recording");
        session.wait(wait);

        let return_count = count as usize * RECORDER_RECORD_LEN;
        let payload = session.execute("rp", None, None, Some(return_count))?;
        let mut decoder = payload.decoder();

        let mut records = Vec::with_capacity(count as usize);
        for _ in 0..count {
            records.push(RecorderDatum {
                rec: decoder.u16()?,
                pile_ref: decoder.i32()?,
                pile_act: decoder.i32()?,
            });
        }
        Ok(records)
    }

    fn input_raw(&self) -> Result<u16> {
        Ok(self.read("ir")?.decoder().u16()?)
    }

    fn input_voltage(&self) -> Result<Option<f32>> {
        Ok(self.read("iv")?.decoder().f32()?)
    }

    fn cmd(
        &self,
        name: &str,
        response_time: Duration,
        execution_time: Duration,
        return_count: usize,
    ) -> Result<Payload> {
        let command = Command::custom(name, response_time, execution_time, return_count)?;

        let session = self.session(LockBudget::Long)?;
        let payload = session.transact(&command, None, None, None)?;
        session.wait(execution_time);
        Ok(payload)
    }
}
