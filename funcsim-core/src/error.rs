//! Invocation error types and formatting

use serde::Serialize;
use thiserror::Error;

/// Classification of invocation failures
///
/// Callers branch on the kind rather than on the shape of the underlying
/// failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Mutually exclusive handler-selection options supplied together
    Configuration,
    /// Handler library or export not found
    Load,
    /// Malformed client context or malformed HTTP body
    Parse,
    /// Invocation exceeded its time budget before completing
    Timeout,
    /// Handler returned an error, its future rejected, or it panicked
    Handler,
    /// Missing or incorrect content-type header, missing `event` field
    Transport,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configuration => "ConfigurationError",
            Self::Load => "LoadError",
            Self::Parse => "ParseError",
            Self::Timeout => "TimeoutError",
            Self::Handler => "HandlerError",
            Self::Transport => "TransportError",
        }
    }

    /// Status used by the watch-mode HTTP surface.
    ///
    /// The watch contract pins every failure to 500; one response shape per
    /// outcome keeps clients trivial.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Configuration
            | Self::Load
            | Self::Parse
            | Self::Timeout
            | Self::Handler
            | Self::Transport => 500,
        }
    }
}

/// Error surfaced by the invocation engine
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Failed to load handler: {0}")]
    Load(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Task timed out after {0} ms")]
    Timeout(u64),

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl InvokeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Load(_) => ErrorKind::Load,
            Self::Parse(_) => ErrorKind::Parse,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Handler(_) => ErrorKind::Handler,
            Self::Transport(_) => ErrorKind::Transport,
        }
    }

    /// Format as the watch-mode JSON error body
    pub fn to_json(&self) -> String {
        #[derive(Serialize)]
        struct JsonError<'a> {
            error: &'a str,
        }

        let message = self.to_string();
        let body = JsonError { error: &message };

        serde_json::to_string(&body)
            .unwrap_or_else(|_| format!(r#"{{"error":"{}"}}"#, self.kind().as_str()))
    }
}
