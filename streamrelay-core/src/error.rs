use std::fmt;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Config Error - {0}")]
    Config(String),

    #[error("Source Error - {0}")]
    Source(String),

    #[error("Target Error - {0}")]
    Target(String),

    #[error("Failure Target Error - {0}")]
    FailureTarget(String),

    #[error("Transformer Error - {0}")]
    Transformer(String),

    #[error("Engine Error - {0}")]
    Engine(String),

    #[error("Observer Error - {0}")]
    Observer(String),

    #[error("Stats Receiver Error - {0}")]
    StatsReceiver(String),

    #[error("metrics Error - {0}")]
    Metrics(String),

    #[error("Forwarder Error - {0}")]
    Forwarder(String),

    /// The failure target rejected rows for the very reasons it exists to absorb. Retrying would
    /// loop forever, so the process has to stop.
    #[error("Fatal Error - {0}")]
    Fatal(String),

    #[error("IO Error - {0}")]
    Io(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Config(err.to_string())
    }
}

/// Where a per-message error was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transformation,
    Target,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Transformation => write!(f, "transformation"),
            ErrorKind::Target => write!(f, "target"),
        }
    }
}

/// An error attached to a single [crate::message::Message]. It never aborts a batch; the message
/// carrying it is routed to the failure target instead.
///
/// `safe_message` is what ends up in logs and reports. `detail` is the raw cause and may quote
/// payload content, so it only travels inside failure rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageError {
    kind: ErrorKind,
    code: String,
    safe_message: String,
    detail: String,
}

const CODE_TYPE_ERROR: &str = "TypeError";
const CODE_SYNTAX_ERROR: &str = "SyntaxError";
const CODE_REFERENCE_ERROR: &str = "ReferenceError";
const CODE_DEADLINE_EXCEEDED: &str = "DeadlineExceeded";
const CODE_GENERIC_ERROR: &str = "GenericError";

impl MessageError {
    /// Builds a transformation error, deriving the reporting code from the raw detail.
    pub fn transformation(safe_message: impl Into<String>, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        let code = [CODE_TYPE_ERROR, CODE_SYNTAX_ERROR, CODE_REFERENCE_ERROR]
            .into_iter()
            .find(|code| detail.contains(code))
            .unwrap_or(CODE_GENERIC_ERROR);
        Self {
            kind: ErrorKind::Transformation,
            code: code.to_string(),
            safe_message: safe_message.into(),
            detail,
        }
    }

    pub fn deadline_exceeded(safe_message: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transformation,
            code: CODE_DEADLINE_EXCEEDED.to_string(),
            safe_message: safe_message.into(),
            detail: detail.into(),
        }
    }

    pub fn target(
        code: impl Into<String>,
        safe_message: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            kind: ErrorKind::Target,
            code: code.into(),
            safe_message: safe_message.into(),
            detail: detail.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn safe_message(&self) -> &str {
        &self.safe_message
    }

    pub fn detail(&self) -> &str {
        &self.detail
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        self.code == CODE_DEADLINE_EXCEEDED
    }
}

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error [{}]: {}", self.kind, self.code, self.safe_message)
    }
}

impl std::error::Error for MessageError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_derived_from_detail() {
        let err = MessageError::transformation(
            "error running JavaScript function [main]",
            "TypeError: cannot read property 'x' of undefined",
        );
        assert_eq!(err.code(), "TypeError");
        assert_eq!(err.kind(), ErrorKind::Transformation);

        let err = MessageError::transformation("boom", "something odd happened");
        assert_eq!(err.code(), "GenericError");
    }

    #[test]
    fn test_display_hides_detail() {
        let err = MessageError::transformation("error running Lua function", "secret-payload");
        let rendered = err.to_string();
        assert!(rendered.contains("error running Lua function"));
        assert!(!rendered.contains("secret-payload"));
    }

    #[test]
    fn test_deadline_exceeded() {
        let err = MessageError::deadline_exceeded("runtime deadline exceeded", "interrupted");
        assert!(err.is_deadline_exceeded());
        assert_eq!(err.code(), "DeadlineExceeded");
    }
}
