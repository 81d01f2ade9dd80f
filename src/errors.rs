use thiserror::Error;
use tokio::task::JoinError;

/// The error taxonomy surfaced by the core.
///
/// Each FUSE callsite maps a variant to an errno through
/// [Error::as_raw_os_error]. Protocol violations must never be cached; the
/// fetch paths uphold that by returning before any write-through.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum Error {
    /// HTTP 5xx, connection failures, rate-limit waits. Not retried
    /// automatically inside the fetch engine.
    #[error("transient remote error: {0}")]
    Transient(String),

    /// A 200 response served from a different URL than requested after a
    /// redirect; almost always a login page.
    #[error("authentication intercept: got {got}, want {want}")]
    Auth { got: String, want: String },

    /// Missing XSS prefix, unparseable JSON, unexpected tree entry types.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Unparseable manifest or configuration input.
    #[error("parse error: {0}")]
    Parse(String),

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("not found: {0}")]
    NotFound(String),

    /// Local I/O failures (cache writes, git object reads, subprocesses).
    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    pub fn as_raw_os_error(&self) -> i32 {
        match self {
            Error::Transient(_) | Error::Auth { .. } | Error::Protocol(_) | Error::Storage(_) => {
                libc::EIO
            }
            Error::Parse(_) => libc::EINVAL,
            Error::Unsupported(_) => libc::ENOTSUP,
            Error::NotFound(_) => libc::ENOENT,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        if value.kind() == std::io::ErrorKind::NotFound {
            Error::NotFound(value.to_string())
        } else {
            Error::Storage(value.to_string())
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(value: Error) -> Self {
        std::io::Error::from_raw_os_error(value.as_raw_os_error())
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Transient(value.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Protocol(value.to_string())
    }
}

impl From<git2::Error> for Error {
    fn from(value: git2::Error) -> Self {
        Error::Storage(value.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(value: url::ParseError) -> Self {
        Error::Parse(value.to_string())
    }
}

impl From<xml::reader::Error> for Error {
    fn from(value: xml::reader::Error) -> Self {
        Error::Parse(value.to_string())
    }
}

impl From<xml::writer::Error> for Error {
    fn from(value: xml::writer::Error) -> Self {
        Error::Parse(value.to_string())
    }
}

impl From<crate::digests::Error> for Error {
    fn from(value: crate::digests::Error) -> Self {
        Error::Parse(value.to_string())
    }
}

impl From<JoinError> for Error {
    fn from(value: JoinError) -> Self {
        Error::Storage(value.to_string())
    }
}
