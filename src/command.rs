use crate::error::ConfigurationError;
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Time the device needs after the status byte before the next transaction
/// is safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionTime {
    Fixed(#[serde(serialize_with = "serialize_secs")] Duration),
    /// Depends on runtime parameters; the caller computes and sleeps it.
    /// The string names the formula inputs.
    Variable(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReturnCount {
    Fixed(usize),
    /// The caller must supply the count on every invocation.
    PerCall,
}

/// One entry of the command vocabulary. Immutable once built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Command {
    #[serde(serialize_with = "serialize_name")]
    name: [u8; 2],
    #[serde(serialize_with = "serialize_secs")]
    response_time: Duration,
    execution_time: ExecutionTime,
    return_count: ReturnCount,
}

impl Command {
    pub const fn fixed(
        name: &[u8; 2],
        response_us: u64,
        execution_ms: u64,
        return_count: usize,
    ) -> Self {
        Self {
            name: *name,
            response_time: Duration::from_micros(response_us),
            execution_time: ExecutionTime::Fixed(Duration::from_millis(execution_ms)),
            return_count: ReturnCount::Fixed(return_count),
        }
    }

    pub const fn per_call(name: &[u8; 2], response_us: u64, execution_ms: u64) -> Self {
        Self {
            name: *name,
            response_time: Duration::from_micros(response_us),
            execution_time: ExecutionTime::Fixed(Duration::from_millis(execution_ms)),
            return_count: ReturnCount::PerCall,
        }
    }

    pub const fn variable(
        name: &[u8; 2],
        response_us: u64,
        inputs: &'static str,
        return_count: usize,
    ) -> Self {
        Self {
            name: *name,
            response_time: Duration::from_micros(response_us),
            execution_time: ExecutionTime::Variable(inputs),
            return_count: ReturnCount::Fixed(return_count),
        }
    }

    /// Ad hoc command outside any table, e.g. for probing unknown codes.
    pub fn custom(
        name: &str,
        response_time: Duration,
        execution_time: Duration,
        return_count: usize,
    ) -> Result<Self, ConfigurationError> {
        let code = name_code(name).ok_or_else(|| ConfigurationError::UnknownCommand(name.to_string()))?;

        Ok(Self {
            name: code,
            response_time,
            execution_time: ExecutionTime::Fixed(execution_time),
            return_count: ReturnCount::Fixed(return_count),
        })
    }

    pub fn name(&self) -> &str {
        // constructors only admit ASCII
        std::str::from_utf8(&self.name).unwrap_or("??")
    }

    pub fn name_bytes(&self) -> [u8; 2] {
        self.name
    }

    pub fn response_time(&self) -> Duration {
        self.response_time
    }

    pub fn execution_time(&self) -> ExecutionTime {
        self.execution_time
    }

    /// The fixed execution time, or zero for variable commands whose
    /// duration the caller has to compute.
    pub fn fixed_execution_time(&self) -> Duration {
        match self.execution_time {
            ExecutionTime::Fixed(d) => d,
            ExecutionTime::Variable(_) => Duration::ZERO,
        }
    }

    pub fn return_count(&self) -> ReturnCount {
        self.return_count
    }

    /// Return count for one invocation. An override always wins; a per-call
    /// command without one is a configuration error.
    pub fn effective_return_count(&self, overridden: Option<usize>) -> Result<usize, ConfigurationError> {
        match (self.return_count, overridden) {
            (_, Some(n)) => Ok(n),
            (ReturnCount::Fixed(n), None) => Ok(n),
            (ReturnCount::PerCall, None) => Err(ConfigurationError::MissingReturnCount(self.name().to_string())),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Command:{{name:{}, response_time:{:?}, execution_time:{:?}, return_count:{:?}}}",
            self.name(),
            self.response_time,
            self.execution_time,
            self.return_count
        )
    }
}

fn name_code(name: &str) -> Option<[u8; 2]> {
    let bytes = name.as_bytes();
    if bytes.len() == 2 && bytes.iter().all(|b| b.is_ascii_graphic()) {
        Some([bytes[0], bytes[1]])
    } else {
        None
    }
}

fn serialize_name<S: Serializer>(name: &[u8; 2], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(std::str::from_utf8(name).unwrap_or("??"))
}

fn serialize_secs<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

/// Immutable registry for one dialect, built once and shared by reference.
#[derive(Debug, Clone)]
pub struct CommandTable {
    commands: HashMap<[u8; 2], Command>,
}

impl CommandTable {
    pub fn new(commands: &[Command]) -> Self {
        Self {
            commands: commands.iter().map(|c| (c.name, *c)).collect(),
        }
    }

    pub fn find(&self, name: &str) -> Result<&Command, ConfigurationError> {
        name_code(name)
            .and_then(|code| self.commands.get(&code))
            .ok_or_else(|| ConfigurationError::UnknownCommand(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.find(name).is_ok()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Commands in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Command> {
        let mut commands: Vec<&Command> = self.commands.values().collect();
        commands.sort_by_key(|c| c.name);
        commands.into_iter()
    }
}
