use serde::Serialize;
use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// What went wrong with a single status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Problem {
    /// No reply: the status byte was one of the dialect's NONE sentinels.
    None,
    Nack,
    /// Device busy. The only problem worth retrying after the recovery delay.
    Busy,
    /// A status byte that is none of the recognised codes.
    Unexpected,
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Problem::None => write!(f, "None received"),
            Problem::Nack => write!(f, "NACK received"),
            Problem::Busy => write!(f, "BUSY received"),
            Problem::Unexpected => write!(f, "unexpected status received"),
        }
    }
}

/// Abnormal device response to one command. Carries everything needed to
/// diagnose the failed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("{problem}: status 0x{status:02x}, cmd {command}, params {param_group_1:?} {param_group_2:?}")]
pub struct ProtocolError {
    pub problem: Problem,
    pub status: u8,
    #[serde(rename = "cmd")]
    pub command: String,
    #[serde(with = "serde_bytes")]
    pub param_group_1: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub param_group_2: Vec<u8>,
}

impl ProtocolError {
    pub fn is_retryable(&self) -> bool {
        self.problem == Problem::Busy
    }
}

/// Rejected before anything reaches the bus. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("unrecognised command name: {0}")]
    UnknownCommand(String),
    #[error("command {0} needs a per-call return count")]
    MissingReturnCount(String),
    #[error("unknown model: {0}")]
    UnknownModel(String),
    #[error("unknown calibration field: {0}")]
    UnknownField(String),
    #[error("invalid value for {path}: {value}")]
    InvalidValue { path: String, value: String },
    #[error("{capability} is not supported by the {model} dialect")]
    Unsupported { model: &'static str, capability: &'static str },
    #[error("tally {0} is outside 1..={1}")]
    InvalidTally(usize, usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("decode underflow: needed {needed} bytes at offset {offset}, {available} available")]
pub struct CodecError {
    pub offset: usize,
    pub needed: usize,
    pub available: usize,
}

#[derive(Debug, Error)]
pub enum NdirError {
    /// Bus contention, not a device fault. Retry later.
    #[error("lock timeout: {name} not acquired within {timeout:?}")]
    LockTimeout { name: String, timeout: Duration },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The bus delivered fewer payload bytes than the command claimed.
    #[error("transport failure on {command}: expected {expected} bytes, received {received}")]
    Transport {
        command: String,
        expected: usize,
        received: usize,
    },

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("bus I/O: {0}")]
    Io(#[from] io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl NdirError {
    pub fn is_contention(&self) -> bool {
        matches!(self, NdirError::LockTimeout { .. })
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            NdirError::LockTimeout { .. } => true,
            NdirError::Protocol(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Errors that mean the bus or its peer went away underneath us.
    pub fn is_disconnect(&self) -> bool {
        match self {
            NdirError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotFound
            ),
            _ => false,
        }
    }

    /// Failures a teardown path may swallow: contention or a vanished bus.
    pub fn is_teardown_tolerable(&self) -> bool {
        self.is_contention() || self.is_disconnect()
    }

    /// Structured diagnostic for the command-line boundary.
    pub fn to_diagnostic(&self) -> serde_json::Value {
        match self {
            NdirError::Protocol(e) => serde_json::json!({ "protocol-error": e }),
            NdirError::LockTimeout { name, timeout } => serde_json::json!({
                "lock-timeout": { "name": name, "timeout": timeout.as_secs_f64() }
            }),
            NdirError::Transport { command, expected, received } => serde_json::json!({
                "transport-error": { "cmd": command, "expected": expected, "received": received }
            }),
            NdirError::Configuration(e) => serde_json::json!({ "configuration-error": e.to_string() }),
            other => serde_json::json!({ "error": other.to_string() }),
        }
    }
}

pub type Result<T> = std::result::Result<T, NdirError>;
