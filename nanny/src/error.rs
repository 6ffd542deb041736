//! Error and result types for the supervisor.
//!
//! Structured errors are reserved for the few paths that can actually fail
//! upward: initialization (sockets, log paths, daemonizing) and the public
//! registration API. Event-loop callbacks have no caller to report to; they
//! log, adjust state, and return.

use thiserror::Error;

/// Result type alias for supervisor operations.
pub type NannyResult<T> = Result<T, NannyError>;

/// Error types for supervisor operations.
#[derive(Error, Debug)]
pub enum NannyError {
    /// Low-level I/O failure (pipe, fd, file).
    #[error("I/O failure during {op}: {reason}")]
    Io { op: String, reason: String },

    /// Process spawn failure.
    #[error("Failed to spawn '{cmd}': {reason}")]
    Spawn { cmd: String, reason: String },

    /// Malformed periodic task specification.
    #[error("Invalid periodic spec '{spec}': {reason}")]
    ParseSpec { spec: String, reason: String },

    /// Network setup or transmission failure.
    #[error("Network operation failed: {op}: {reason}")]
    Net { op: String, reason: String },

    /// Invalid supervisor configuration or usage.
    #[error("Configuration error: {reason}")]
    Config { reason: String },
}

impl NannyError {
    /// Creates a new I/O error.
    pub fn io(op: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Io {
            op: op.into(),
            reason: reason.to_string(),
        }
    }

    /// Creates a new spawn error.
    pub fn spawn(cmd: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Spawn {
            cmd: cmd.into(),
            reason: reason.to_string(),
        }
    }

    /// Creates a new periodic-spec parse error.
    pub fn parse_spec(spec: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ParseSpec {
            spec: spec.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new network error.
    pub fn net(op: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Net {
            op: op.into(),
            reason: reason.to_string(),
        }
    }

    /// Creates a new configuration error.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Returns the error category for logging.
    pub fn category(&self) -> &'static str {
        match self {
            NannyError::Io { .. } => "io",
            NannyError::Spawn { .. } => "spawn",
            NannyError::ParseSpec { .. } => "parse",
            NannyError::Net { .. } => "net",
            NannyError::Config { .. } => "config",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_constructors() {
        let io = NannyError::io("pipe", "too many open files");
        assert_eq!(io.category(), "io");
        assert!(io.to_string().contains("pipe"));

        let spawn = NannyError::spawn("/bin/false", "fork failed");
        assert_eq!(spawn.category(), "spawn");
        assert!(spawn.to_string().contains("/bin/false"));
    }

    #[test]
    fn test_parse_spec_display() {
        let err = NannyError::parse_spec("8x cmd", "expected time unit 'd', 'h', 'm', or 's'");
        let msg = err.to_string();
        assert!(msg.contains("8x cmd"));
        assert!(msg.contains("time unit"));
    }
}
