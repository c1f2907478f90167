use std::fmt;
use std::io;
use thiserror::Error;

/// Process exit code for a clean run.
pub const EXIT_OK: u8 = 0;
/// Process exit code for an invalid configuration.
pub const EXIT_CONFIG: u8 = 2;
/// Process exit code for a bind/connect failure.
pub const EXIT_CONNECT: u8 = 3;
/// Process exit code for an abnormal termination (I/O failure, partial or cancelled run).
pub const EXIT_ABNORMAL: u8 = 4;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connect(#[from] ConnectError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid state: {0}")]
    State(String),
}

impl Error {
    /// Maps the error onto the process exit code reported by the binary.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Config(_) | Error::Parse(_) => EXIT_CONFIG,
            Error::Connect(_) => EXIT_CONNECT,
            Error::Io(_) | Error::Protocol(_) | Error::Json(_) | Error::State(_) => EXIT_ABNORMAL,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Why a bind or connect attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectErrorKind {
    Refused,
    Timeout,
    AddrInUse,
    Unreachable,
    Other,
}

impl ConnectErrorKind {
    /// Classifies an I/O error raised by `bind`/`connect`.
    pub fn classify(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => ConnectErrorKind::Refused,
            io::ErrorKind::TimedOut => ConnectErrorKind::Timeout,
            io::ErrorKind::AddrInUse => ConnectErrorKind::AddrInUse,
            io::ErrorKind::AddrNotAvailable => ConnectErrorKind::Unreachable,
            _ => match err.raw_os_error() {
                // ENETUNREACH / EHOSTUNREACH
                Some(101) | Some(113) => ConnectErrorKind::Unreachable,
                _ => ConnectErrorKind::Other,
            },
        }
    }
}

impl fmt::Display for ConnectErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectErrorKind::Refused => "connection refused",
            ConnectErrorKind::Timeout => "timed out",
            ConnectErrorKind::AddrInUse => "address in use",
            ConnectErrorKind::Unreachable => "unreachable",
            ConnectErrorKind::Other => "failed",
        };
        f.write_str(s)
    }
}

/// A bind or connect failure, with the address that was tried.
#[derive(Error, Debug)]
#[error("{addr}: {kind} ({source})")]
pub struct ConnectError {
    pub kind: ConnectErrorKind,
    pub addr: String,
    #[source]
    pub source: io::Error,
}

impl ConnectError {
    pub fn new(addr: impl Into<String>, source: io::Error) -> Self {
        Self {
            kind: ConnectErrorKind::classify(&source),
            addr: addr.into(),
            source,
        }
    }

    pub fn timeout(addr: impl Into<String>) -> Self {
        Self {
            kind: ConnectErrorKind::Timeout,
            addr: addr.into(),
            source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
        }
    }
}
