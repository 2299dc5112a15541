//! One command against the bus: frame, wait, interpret the status byte, read
//! the payload.
//!
//! Every transaction runs inside a [`Session`], which holds the named bus
//! lock. One-shot callers use [`Transactor::execute`]; multi-step operations
//! (reset, calibration, status) open a session with the long budget and run
//! several commands under it.

use crate::bus::{BusSession, SpiBus};
use crate::clock::Clock;
use crate::codec::Decoder;
use crate::command::{Command, CommandTable};
use crate::dialect::StatusCodes;
use crate::error::{NdirError, Problem, ProtocolError, Result};
use crate::lock::{BusLock, LockBudget, LockGuard};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Successful transaction result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Return count 0: nothing is read after the status byte.
    Void,
    Byte(u8),
    Bytes(Vec<u8>),
}

impl Payload {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Void => &[],
            Payload::Byte(b) => std::slice::from_ref(b),
            Payload::Bytes(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn decoder(&self) -> Decoder<'_> {
        Decoder::new(self.as_bytes())
    }
}

pub struct Transactor<B: SpiBus> {
    bus: Mutex<B>,
    table: Arc<CommandTable>,
    lock: BusLock,
    lock_name: String,
    codes: StatusCodes,
    settle_delay: Duration,
    recovery_delay: Duration,
    clock: Arc<dyn Clock>,
}

impl<B: SpiBus> Transactor<B> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: B,
        table: Arc<CommandTable>,
        lock: BusLock,
        lock_name: impl Into<String>,
        codes: StatusCodes,
        settle_delay: Duration,
        recovery_delay: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            bus: Mutex::new(bus),
            table,
            lock,
            lock_name: lock_name.into(),
            codes,
            settle_delay,
            recovery_delay,
            clock,
        }
    }

    pub fn table(&self) -> &CommandTable {
        &self.table
    }

    pub fn lock(&self) -> &BusLock {
        &self.lock
    }

    pub fn lock_name(&self) -> &str {
        &self.lock_name
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn recovery_delay(&self) -> Duration {
        self.recovery_delay
    }

    /// Acquires the bus lock for a sequence of commands.
    pub fn session(&self, budget: LockBudget) -> Result<Session<'_, B>> {
        let guard = self.lock.acquire(&self.lock_name, budget.timeout())?;
        Ok(Session {
            transactor: self,
            _guard: guard,
        })
    }

    /// One command under its own short-budget session.
    pub fn execute(
        &self,
        name: &str,
        param_group_1: Option<&[u8]>,
        param_group_2: Option<&[u8]>,
        return_count: Option<usize>,
    ) -> Result<Payload> {
        let command = *self.table.find(name)?;
        self.session(LockBudget::Short)?
            .transact(&command, param_group_1, param_group_2, return_count)
    }

    /// As [`execute`](Self::execute), retrying BUSY up to `attempts` times
    /// after the recovery delay. Every other failure is returned at once.
    pub fn execute_retrying(
        &self,
        name: &str,
        param_group_1: Option<&[u8]>,
        param_group_2: Option<&[u8]>,
        return_count: Option<usize>,
        attempts: usize,
    ) -> Result<Payload> {
        let mut attempt = 1;
        loop {
            match self.execute(name, param_group_1, param_group_2, return_count) {
                Err(NdirError::Protocol(e)) if e.is_retryable() && attempt < attempts => {
                    debug!(cmd = name, attempt, "device busy, retrying");
                    self.clock.sleep(self.recovery_delay);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn classify(&self, status: u8) -> Option<Problem> {
        if status == self.codes.ack {
            None
        } else if self.codes.none.contains(&status) {
            Some(Problem::None)
        } else if status == self.codes.nack {
            Some(Problem::Nack)
        } else if Some(status) == self.codes.busy {
            Some(Problem::Busy)
        } else {
            Some(Problem::Unexpected)
        }
    }

    fn transact(
        &self,
        command: &Command,
        param_group_1: Option<&[u8]>,
        param_group_2: Option<&[u8]>,
        return_count: Option<usize>,
    ) -> Result<Payload> {
        let return_count = command.effective_return_count(return_count)?;

        let mut bus = self.bus.lock().unwrap_or_else(|e| e.into_inner());
        let mut session = BusSession::open(&mut *bus)?;

        session.write(&command.name_bytes())?;

        for group in [param_group_1, param_group_2].into_iter().flatten() {
            self.clock.sleep(self.settle_delay);
            session.write(group)?;
        }

        self.clock.sleep(command.response_time());

        let mut status = [0u8; 1];
        if session.read(&mut status)? < 1 {
            return Err(NdirError::Transport {
                command: command.name().to_string(),
                expected: 1,
                received: 0,
            });
        }
        let status = status[0];

        if let Some(problem) = self.classify(status) {
            let error = ProtocolError {
                problem,
                status,
                command: command.name().to_string(),
                param_group_1: param_group_1.map(<[u8]>::to_vec).unwrap_or_default(),
                param_group_2: param_group_2.map(<[u8]>::to_vec).unwrap_or_default(),
            };
            warn!(cmd = command.name(), status, "{}", problem);
            return Err(error.into());
        }

        if return_count < 1 {
            debug!(cmd = command.name(), "ack");
            return Ok(Payload::Void);
        }

        self.clock.sleep(self.settle_delay);

        let mut payload = vec![0u8; return_count];
        let received = session.read(&mut payload)?;
        if received < return_count {
            warn!(cmd = command.name(), expected = return_count, received, "short payload");
            return Err(NdirError::Transport {
                command: command.name().to_string(),
                expected: return_count,
                received,
            });
        }

        debug!(cmd = command.name(), bytes = return_count, "ack");
        Ok(if return_count == 1 {
            Payload::Byte(payload[0])
        } else {
            Payload::Bytes(payload)
        })
    }
}

/// Holds the bus lock until dropped. Each `execute` opens and closes its own
/// bus session.
pub struct Session<'a, B: SpiBus> {
    transactor: &'a Transactor<B>,
    _guard: LockGuard,
}

impl<'a, B: SpiBus> Session<'a, B> {
    pub fn execute(
        &self,
        name: &str,
        param_group_1: Option<&[u8]>,
        param_group_2: Option<&[u8]>,
        return_count: Option<usize>,
    ) -> Result<Payload> {
        let command = *self.transactor.table.find(name)?;
        self.transact(&command, param_group_1, param_group_2, return_count)
    }

    /// Executes `name`, then waits its fixed execution time with the lock held.
    pub fn execute_and_wait(
        &self,
        name: &str,
        param_group_1: Option<&[u8]>,
        param_group_2: Option<&[u8]>,
    ) -> Result<Payload> {
        let command = *self.transactor.table.find(name)?;
        let payload = self.transact(&command, param_group_1, param_group_2, None)?;
        self.wait(command.fixed_execution_time());
        Ok(payload)
    }

    /// Runs a command that need not be in the table.
    pub fn transact(
        &self,
        command: &Command,
        param_group_1: Option<&[u8]>,
        param_group_2: Option<&[u8]>,
        return_count: Option<usize>,
    ) -> Result<Payload> {
        self.transactor
            .transact(command, param_group_1, param_group_2, return_count)
    }

    pub fn wait(&self, duration: Duration) {
        self.transactor.clock.sleep(duration);
    }

    pub fn command(&self, name: &str) -> Result<Command> {
        Ok(*self.transactor.table.find(name)?)
    }
}
