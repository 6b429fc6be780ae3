//! Error taxonomy for the session engine.
//!
//! Session-fatal errors (`Spawn`, `Read`) propagate to the registry, which
//! tears the session down. Component-local errors (`MalformedSideChannel`,
//! `ConnectionTimeout`, `TerminationTimeoutExceeded`) are logged where they
//! happen and never reach a caller.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::registry::SessionId;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The shell could not be started. Reported to the caller, never retried.
    #[error("failed to spawn {shell:?}: {reason}")]
    Spawn { shell: String, reason: String },

    /// fd-level failure on the PTY master (not a timeout).
    #[error("PTY read failed: {0}")]
    Read(#[source] io::Error),

    /// Private OSC envelope with an unknown command or no `=` separator.
    #[error("malformed side-channel payload {payload:?}")]
    MalformedSideChannel { payload: String },

    #[error("connection missed pong for {0:?}")]
    ConnectionTimeout(Duration),

    #[error("process {pid} ignored SIGTERM for {deadline:?}")]
    TerminationTimeoutExceeded { pid: i32, deadline: Duration },

    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    #[error("session {0} is shutting down")]
    SessionClosed(SessionId),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("registry is not running")]
    RegistryClosed,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl EngineError {
    pub(crate) fn spawn(shell: &str, reason: impl ToString) -> Self {
        EngineError::Spawn {
            shell: shell.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Errors that end the session rather than a single connection.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, EngineError::Spawn { .. } | EngineError::Read(_))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {field} {message}")]
    Invalid { field: &'static str, message: String },
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_and_read_are_session_fatal() {
        assert!(EngineError::spawn("/bin/nope", "not found").is_session_fatal());
        assert!(EngineError::Read(io::Error::from(io::ErrorKind::BrokenPipe)).is_session_fatal());
        assert!(!EngineError::ConnectionTimeout(Duration::from_secs(60)).is_session_fatal());
        assert!(!EngineError::Protocol("bad frame".into()).is_session_fatal());
    }

    #[test]
    fn spawn_error_names_the_shell() {
        let err = EngineError::spawn("fish", "not found in PATH");
        assert_eq!(err.to_string(), "failed to spawn \"fish\": not found in PATH");
    }
}
