use std::fmt::Display;
use std::num::ParseIntError;
use std::string::FromUtf8Error;
use std::{fmt, io};

#[derive(Debug)]
pub enum ReplError {
    //////////////////////
    // Startup
    //////////////////////
    /// Bad configuration, rejected before any work starts
    ConfigError(String),

    //////////////////////
    // Source (MySQL)
    //////////////////////
    /// Connection-level source error. Recoverable: sleep and reconnect.
    TransientSource(String),
    /// The source reported a corrupted binlog index. The event log directory
    /// must be wiped and the process restarted from the stream end.
    CorruptedIndex(String),

    //////////////////////
    // Target (ClickHouse)
    //////////////////////
    /// Operational target error, retried with back-off before surfacing
    TransientTarget(String),

    //////////////////////
    // Translator
    //////////////////////
    /// Statement or type text the translator cannot understand
    ParseError(String),
    /// A source column type with no mapping rule
    UnknownType(String),

    /// Unrecoverable error. The owning process exits; the supervisor respawns it.
    Fatal(String),

    /// SIGINT/SIGTERM observed, unwinding for a clean exit
    ShutdownRequested,

    //////////////////////
    // IO / codecs
    //////////////////////
    IoError(io::Error),
    FromUtf8Error(FromUtf8Error),
    ParseIntError(ParseIntError),
    JsonError(serde_json::Error),
    YamlError(serde_yaml::Error),
    BincodeError(bincode::Error),
    String(String),
}

impl ReplError {
    /// Transient errors are retried locally instead of killing the process.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ReplError::TransientSource(_) | ReplError::TransientTarget(_)
        )
    }
}

impl Display for ReplError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> fmt::Result {
        match self {
            ReplError::ConfigError(s)
            | ReplError::TransientSource(s)
            | ReplError::CorruptedIndex(s)
            | ReplError::TransientTarget(s)
            | ReplError::ParseError(s)
            | ReplError::UnknownType(s)
            | ReplError::Fatal(s)
            | ReplError::String(s) => {
                write!(f, "{}", s)
            }
            ReplError::ShutdownRequested => {
                write!(f, "shutdown requested")
            }
            ReplError::IoError(err) => write!(f, "{}", err),
            ReplError::FromUtf8Error(err) => write!(f, "{}", err),
            ReplError::ParseIntError(err) => write!(f, "{}", err),
            ReplError::JsonError(err) => write!(f, "{}", err),
            ReplError::YamlError(err) => write!(f, "{}", err),
            ReplError::BincodeError(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for ReplError {}

impl From<io::Error> for ReplError {
    fn from(error: io::Error) -> Self {
        ReplError::IoError(error)
    }
}

impl From<FromUtf8Error> for ReplError {
    fn from(error: FromUtf8Error) -> Self {
        ReplError::FromUtf8Error(error)
    }
}

impl From<ParseIntError> for ReplError {
    fn from(error: ParseIntError) -> Self {
        ReplError::ParseIntError(error)
    }
}

impl From<serde_json::Error> for ReplError {
    fn from(error: serde_json::Error) -> Self {
        ReplError::JsonError(error)
    }
}

impl From<serde_yaml::Error> for ReplError {
    fn from(error: serde_yaml::Error) -> Self {
        ReplError::YamlError(error)
    }
}

impl From<bincode::Error> for ReplError {
    fn from(error: bincode::Error) -> Self {
        ReplError::BincodeError(error)
    }
}

impl From<mysql_async::Error> for ReplError {
    fn from(error: mysql_async::Error) -> Self {
        // Error 1236 is raised when the requested position is not present in
        // the binlog index anymore (purged or corrupted index file).
        if let mysql_async::Error::Server(ref server_err) = error {
            if server_err.code == 1236 {
                return ReplError::CorruptedIndex(server_err.message.clone());
            }
        }
        ReplError::TransientSource(error.to_string())
    }
}

impl From<reqwest::Error> for ReplError {
    fn from(error: reqwest::Error) -> Self {
        ReplError::TransientTarget(error.to_string())
    }
}
