//! Background sampling with a rolling average shared across processes.
//!
//! The worker triggers a sample, waits the sample interval without holding
//! the bus lock, reads the result and publishes the window mean to the
//! [`SharedRegion`]. Readings taken inside a reset quarantine are dropped.
//! Any process that maps the same region can read the latest snapshot.

use crate::average::RollingAverage;
use crate::datum::Sample;
use crate::driver::Ndir;
use crate::error::{NdirError, Result};
use crate::shared::{SampleKind, SharedRegion, Snapshot};
use std::process::{Child, Command as ProcessCommand};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Longest single sleep between stop checks.
const STOP_POLL: Duration = Duration::from_millis(100);
/// Time a worker process gets to exit on its own before it is killed.
const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorSettings {
    pub tally: usize,
    /// Average thermopile voltages instead of gas concentrations.
    pub raw: bool,
}

/// Where the sampling loop runs.
#[derive(Debug)]
pub enum Launch {
    /// A thread of this process.
    Thread,
    /// A child process, expected to call [`run_sampler`] on the same region.
    Process(ProcessCommand),
}

enum Worker {
    Thread {
        handle: JoinHandle<()>,
        stop: Arc<AtomicBool>,
    },
    Process(Child),
}

pub struct Monitor {
    ndir: Arc<dyn Ndir>,
    shared: Arc<SharedRegion>,
    settings: MonitorSettings,
    launch: Launch,
    worker: Option<Worker>,
}

impl Monitor {
    pub fn new(ndir: Arc<dyn Ndir>, shared: Arc<SharedRegion>, settings: MonitorSettings, launch: Launch) -> Self {
        Self {
            ndir,
            shared,
            settings,
            launch,
            worker: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Powers the sensor and launches the worker with an empty window.
    /// Does nothing if already running.
    pub fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }

        RollingAverage::new(self.settings.tally)?;

        self.ndir.power_on()?;
        self.shared.reset_control();

        let worker = match &mut self.launch {
            Launch::Thread => {
                let stop = Arc::new(AtomicBool::new(false));
                let ndir = Arc::clone(&self.ndir);
                let shared = Arc::clone(&self.shared);
                let settings = self.settings;
                let flag = Arc::clone(&stop);

                let handle = thread::Builder::new()
                    .name("ndir-monitor".to_string())
                    .spawn(move || {
                        if let Err(e) = run_sampler(ndir.as_ref(), &shared, settings, &flag) {
                            error!("sampler stopped: {}", e);
                        }
                    })?;

                Worker::Thread { handle, stop }
            }
            Launch::Process(command) => Worker::Process(command.spawn()?),
        };

        info!(tally = self.settings.tally, raw = self.settings.raw, "monitor started");
        self.worker = Some(worker);
        Ok(())
    }

    /// Stops the worker and powers the sensor down. Safe to call repeatedly.
    /// Lock contention or a vanished bus during teardown is logged, not
    /// returned. The sensor is powered down even if the worker process could
    /// not be reaped; that failure is returned afterwards.
    pub fn stop(&mut self) -> Result<()> {
        self.shared.request_stop();

        let reaped = match self.worker.take() {
            Some(Worker::Thread { handle, stop }) => {
                stop.store(true, Ordering::SeqCst);
                if handle.join().is_err() {
                    warn!("sampler thread panicked");
                }
                Ok(())
            }
            Some(Worker::Process(child)) => stop_child(child),
            None => Ok(()),
        };
        if let Err(e) = &reaped {
            error!("worker process not reaped: {}", e);
        }

        match self.ndir.power_off() {
            Ok(()) => {}
            Err(e) if e.is_teardown_tolerable() => warn!("power off during stop: {}", e),
            Err(e) => return Err(e),
        }

        info!("monitor stopped");
        reaped
    }

    /// The last published average, which survives `stop()`.
    pub fn snapshot(&self) -> Result<Option<Snapshot>> {
        self.shared.read()
    }

    pub fn sample(&self) -> Result<Option<Sample>> {
        Ok(self.snapshot()?.map(|s| s.sample()))
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        if self.worker.is_some() {
            if let Err(e) = self.stop() {
                warn!("monitor teardown: {}", e);
            }
        }
    }
}

/// Waits up to the grace period for the worker to leave on its own, then
/// kills it.
fn stop_child(mut child: Child) -> Result<()> {
    let deadline = Instant::now() + STOP_GRACE;

    loop {
        if let Some(status) = child.try_wait()? {
            debug!(%status, "worker exited");
            return Ok(());
        }
        if Instant::now() >= deadline {
            break;
        }
        thread::sleep(Duration::from_millis(20));
    }

    warn!(pid = child.id(), "worker ignored stop request, killing");
    child.kill()?;
    child.wait()?;
    Ok(())
}

fn stopping(shared: &SharedRegion, stop: &AtomicBool) -> bool {
    stop.load(Ordering::SeqCst) || shared.stop_requested()
}

/// Sleeps `duration` on the driver clock in short slices. Returns false if a
/// stop was requested meanwhile.
fn wait_interval(ndir: &dyn Ndir, shared: &SharedRegion, stop: &AtomicBool, duration: Duration) -> bool {
    let clock = ndir.clock();
    let mut remaining = duration;

    while !remaining.is_zero() {
        if stopping(shared, stop) {
            return false;
        }
        let slice = remaining.min(STOP_POLL);
        clock.sleep(slice);
        remaining -= slice;
    }
    !stopping(shared, stop)
}

/// The sampling loop. Runs until `stop` is set, a stop is requested through
/// the shared region, or the bus goes away.
pub fn run_sampler(ndir: &dyn Ndir, shared: &SharedRegion, settings: MonitorSettings, stop: &AtomicBool) -> Result<()> {
    let mut average = RollingAverage::new(settings.tally)?;
    let kind = if settings.raw {
        SampleKind::Voltage
    } else {
        SampleKind::Gas
    };

    let interval = ndir.sample_interval()?;
    debug!(?interval, ?kind, "sampler running");

    while !stopping(shared, stop) {
        match tick(ndir, shared, stop, kind, interval, &mut average) {
            Ok(()) => {}
            Err(e) if e.is_disconnect() => {
                warn!("bus gone, sampler exiting: {}", e);
                break;
            }
            Err(e @ (NdirError::LockTimeout { .. } | NdirError::Protocol(_) | NdirError::Transport { .. })) => {
                warn!("sample skipped: {}", e);
                if !wait_interval(ndir, shared, stop, interval) {
                    break;
                }
            }
            Err(e) => return Err(e),
        }
    }

    debug!("sampler finished");
    Ok(())
}

fn tick(
    ndir: &dyn Ndir,
    shared: &SharedRegion,
    stop: &AtomicBool,
    kind: SampleKind,
    interval: Duration,
    average: &mut RollingAverage,
) -> Result<()> {
    ndir.sample()?;

    if !wait_interval(ndir, shared, stop, interval) {
        return Ok(());
    }

    let (rec, values) = match kind {
        SampleKind::Gas => {
            let datum = ndir.get_sample_gas()?;
            (datum.rec, [datum.cnc, datum.cnc_igl, datum.temp])
        }
        SampleKind::Voltage => {
            let datum = ndir.get_sample_voltage()?;
            (datum.rec, [datum.pile_ref, datum.pile_act, datum.therm])
        }
    };

    if ndir.in_quarantine() {
        debug!("discarding sample taken in reset quarantine");
        return Ok(());
    }

    average.push(values);
    let count = average.len() as u16;
    shared.publish(kind, count, rec, average.mean())?;
    Ok(())
}
