//! Error types for the speed test engine.
//!
//! Every failure a run can end with is a [`SpeedTestError`]. Its kind
//! decides the status the run ends in and the exit code of the CLI.

use crate::status::Status;
use std::error::Error;
use std::fmt;

/// Exit codes for the application.
pub mod exit_codes {
    /// Successful execution.
    pub const SUCCESS: i32 = 0;
    /// Network error (connection failed, timeout, etc.).
    pub const NETWORK_ERROR: i32 = 1;
    /// Configuration error (invalid arguments, unreachable config).
    pub const CONFIG_ERROR: i32 = 3;
    /// The test was aborted by the user.
    pub const ABORTED: i32 = 130;
    /// Unknown/unexpected error.
    pub const UNKNOWN_ERROR: i32 = 99;
}

/// Categories of errors that can occur during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network or transfer failure.
    Transport,
    /// The peer sent something the protocol does not allow.
    Protocol,
    /// User-initiated cancellation.
    Aborted,
    /// A test was started while another one was running.
    AlreadyRunning(Status),
    /// The configuration could not be fetched.
    ConfigLoad,
    /// Invalid configuration or overrides.
    Config,
}

impl ErrorKind {
    /// Get the exit code for this error kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::Transport => exit_codes::NETWORK_ERROR,
            ErrorKind::Protocol => exit_codes::NETWORK_ERROR,
            ErrorKind::Aborted => exit_codes::ABORTED,
            ErrorKind::AlreadyRunning(_) => exit_codes::UNKNOWN_ERROR,
            ErrorKind::ConfigLoad => exit_codes::CONFIG_ERROR,
            ErrorKind::Config => exit_codes::CONFIG_ERROR,
        }
    }

    /// Get a user-friendly description of this error kind.
    pub fn description(&self) -> &'static str {
        match self {
            ErrorKind::Transport => "Transport error",
            ErrorKind::Protocol => "Protocol error",
            ErrorKind::Aborted => "Aborted",
            ErrorKind::AlreadyRunning(_) => "Test already running",
            ErrorKind::ConfigLoad => "Configuration load error",
            ErrorKind::Config => "Configuration error",
        }
    }

    /// The status a run ends in when it fails with this kind.
    pub fn status(&self) -> Status {
        match self {
            ErrorKind::Aborted => Status::Aborted,
            ErrorKind::AlreadyRunning(status) => *status,
            _ => Status::Failed,
        }
    }
}

/// A user-friendly error type for speed test operations.
#[derive(Debug)]
pub struct SpeedTestError {
    /// The kind of error.
    pub kind: ErrorKind,
    /// User-friendly error message.
    pub message: String,
    /// Optional suggestion for how to resolve the error.
    pub suggestion: Option<String>,
    /// The underlying error, if any.
    pub source: Option<Box<dyn Error + Send + Sync>>,
}

impl SpeedTestError {
    /// Create a new SpeedTestError.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), suggestion: None, source: None }
    }

    /// Add a suggestion for how to resolve the error.
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Add the underlying error source.
    pub fn with_source(
        mut self,
        source: impl Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Get the exit code for this error.
    pub fn exit_code(&self) -> i32 {
        self.kind.exit_code()
    }

    /// The status the run ends in because of this error.
    pub fn status(&self) -> Status {
        self.kind.status()
    }

    /// Create a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, message).with_suggestion(
            "Check that the speed test server is reachable and try again.",
        )
    }

    /// Create a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, message)
    }

    /// Create an abort error.
    pub fn aborted() -> Self {
        Self::new(ErrorKind::Aborted, "The test was aborted")
    }

    /// Create the error returned when a test is already in progress.
    pub fn already_running(status: Status) -> Self {
        Self::new(
            ErrorKind::AlreadyRunning(status),
            "Stop the current test before starting another one.",
        )
    }

    /// Create a configuration load error.
    pub fn config_load(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConfigLoad, message).with_suggestion(
            "Make sure the server URL is correct and serves config.json.",
        )
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }
}

impl fmt::Display for SpeedTestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.description(), self.message)?;

        if let Some(ref suggestion) = self.suggestion {
            write!(f, "\n  Suggestion: {}", suggestion)?;
        }

        Ok(())
    }
}

impl Error for SpeedTestError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as &(dyn Error + 'static))
    }
}

/// Format an error for user display.
///
/// Includes the message and, when available, the suggestion.
pub fn format_error_for_display(error: &SpeedTestError) -> String {
    let mut output = format!("Error: {}", error.message);

    if let Some(ref suggestion) = error.suggestion {
        output.push_str(&format!("\n\nSuggestion: {}", suggestion));
    }

    output
}
