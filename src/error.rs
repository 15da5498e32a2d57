// src/error.rs

//! Error types for the repository server
//!
//! The first group of variants is the fixed vocabulary returned to callers.
//! The rest are internal conditions; [`Error::fault`] decides how each one
//! crosses the call boundary.

use serde::Serialize;
use std::io;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("insufficient permission")]
    InsufficientPermission,

    #[error("trove {name}{} not found", version_suffix(.version))]
    ArtifactMissing {
        name: String,
        version: Option<String>,
    },

    #[error("file contents not found: {0}")]
    ContentNotFound(String),

    #[error("file stream not found: {0}")]
    StreamNotFound(String),

    #[error("repository locked: retry budget exhausted")]
    RepositoryLocked,

    #[error("protocol version {requested} not supported (supported: {min}..={max})")]
    InvalidProtocolVersion { requested: u32, min: u32, max: u32 },

    #[error("commit failed: {reason}")]
    CommitFailed {
        reason: String,
        #[source]
        cause: Option<Box<Error>>,
    },

    #[error("incompatible signing key: {0}")]
    IncompatibleKey(String),

    #[error("trove already signed by key {0}")]
    AlreadySigned(String),

    #[error("invalid trove name pattern: {0}")]
    InvalidPattern(String),

    #[error("method not supported: {0}")]
    MethodNotSupported(String),

    #[error("repository is read-only")]
    ReadOnly,

    #[error("repository closed: {0}")]
    RepositoryClosed(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Storage lock conflict; the only class retried by the call loop
    #[error("lock conflict: {0}")]
    LockConflict(String),

    #[error("database error: {0}")]
    Database(rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("configuration error: {0}")]
    Config(String),
}

fn version_suffix(version: &Option<String>) -> String {
    version.as_deref().map(|v| format!("={v}")).unwrap_or_default()
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                Error::LockConflict(err.to_string())
            }
            _ => Error::Database(err),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<ciborium::ser::Error<io::Error>> for Error {
    fn from(err: ciborium::ser::Error<io::Error>) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<ciborium::de::Error<io::Error>> for Error {
    fn from(err: ciborium::de::Error<io::Error>) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<crate::hash::HashError> for Error {
    fn from(err: crate::hash::HashError) -> Self {
        Error::InvalidRequest(err.to_string())
    }
}

impl From<crate::label::LabelParseError> for Error {
    fn from(err: crate::label::LabelParseError) -> Self {
        Error::ParseError(err.to_string())
    }
}

/// Tagged error as returned to a caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fault {
    pub kind: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl Error {
    /// Whether the call loop should retry the whole call
    pub fn is_lock_conflict(&self) -> bool {
        matches!(self, Error::LockConflict(_))
    }

    /// Wire tag for this error
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InsufficientPermission => "InsufficientPermission",
            Error::ArtifactMissing { .. } => "TroveMissing",
            Error::ContentNotFound(_) => "FileContentsNotFound",
            Error::StreamNotFound(_) => "FileStreamNotFound",
            Error::RepositoryLocked | Error::LockConflict(_) => "RepositoryLocked",
            Error::InvalidProtocolVersion { .. } => "InvalidClientVersion",
            Error::CommitFailed { .. } => "CommitError",
            Error::IncompatibleKey(_) => "IncompatibleKey",
            Error::AlreadySigned(_) => "AlreadySignedError",
            Error::InvalidPattern(_) => "InvalidRegex",
            Error::MethodNotSupported(_) => "MethodNotSupported",
            Error::ReadOnly => "ReadOnlyRepositoryError",
            Error::RepositoryClosed(_) => "RepositoryClosed",
            Error::InvalidRequest(_) | Error::ParseError(_) => "InvalidRequest",
            Error::Database(_) | Error::Io(_) | Error::Serialization(_) | Error::Config(_) => {
                "InternalServerError"
            }
        }
    }

    /// Whether this is an expected business outcome rather than a server fault
    pub fn is_classified(&self) -> bool {
        self.kind() != "InternalServerError"
    }

    /// Translate into the tagged form returned to callers
    pub fn fault(&self) -> Fault {
        let detail = match self {
            Error::ArtifactMissing { name, version } => Some(serde_json::json!({
                "name": name,
                "version": version,
            })),
            Error::InvalidProtocolVersion { requested, min, max } => Some(serde_json::json!({
                "requested": requested,
                "min": min,
                "max": max,
            })),
            Error::CommitFailed {
                cause: Some(cause), ..
            } => Some(serde_json::json!({ "cause": cause.kind() })),
            _ => None,
        };

        Fault {
            kind: self.kind(),
            message: self.to_string(),
            detail,
        }
    }

    /// Shorthand for a missing trove
    pub fn missing(name: impl Into<String>, version: Option<String>) -> Self {
        Error::ArtifactMissing {
            name: name.into(),
            version,
        }
    }

    /// Shorthand for a commit failure without a nested cause
    pub fn commit_failed(reason: impl Into<String>) -> Self {
        Error::CommitFailed {
            reason: reason.into(),
            cause: None,
        }
    }
}
