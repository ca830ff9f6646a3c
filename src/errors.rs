// service-backup/src/errors.rs
use std::error::Error as StdError;
use std::io;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

type BoxError = Box<dyn StdError + Send + Sync>;

/// Coarse classification of a [`BackupError`], used for status mapping and
/// for recording the cause of a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Busy,
    Unsupported,
    Execution,
    Timeout,
    Storage,
}

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("An operation is already in progress for service {0}")]
    Busy(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Execution failed: {message}")]
    Execution {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Operation timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("Storage operation failed: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<BoxError>,
    },
}

impl BackupError {
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            source: None,
        }
    }

    pub fn execution_with<E>(message: impl Into<String>, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::Execution {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    pub fn storage_with<E>(message: impl Into<String>, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::Storage {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// A read from a backup stream failed while a backend was consuming it.
    ///
    /// The bytes come from an executor, so the failure belongs to the
    /// execution rather than to the storage backend.
    pub fn stream(source: io::Error) -> Self {
        Self::execution_with(format!("reading backup stream failed: {source}"), source)
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Busy(_) => ErrorKind::Busy,
            Self::Unsupported(_) => ErrorKind::Unsupported,
            Self::Execution { .. } => ErrorKind::Execution,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Storage { .. } => ErrorKind::Storage,
        }
    }

    /// HTTP status the request layer answers with for this error.
    pub fn http_status(&self) -> u16 {
        match self.kind() {
            ErrorKind::Validation | ErrorKind::Unsupported => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Busy => 409,
            ErrorKind::Timeout => 504,
            ErrorKind::Execution | ErrorKind::Storage => 500,
        }
    }

    /// Whether retrying the same request later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Busy | ErrorKind::Timeout | ErrorKind::Storage
        )
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
