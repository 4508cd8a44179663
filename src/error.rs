//! Error taxonomy for the repackaging engine.
//!
//! Every stage returns [`PackError`]. Validation errors are produced before
//! anything is written; the remaining variants carry whatever diagnostics the
//! failing stage collected (tool output, remediation steps, offending path).

use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type used throughout the library.
pub type Result<T> = std::result::Result<T, PackError>;

/// Errors that abort a packaging operation.
#[derive(Error, Debug)]
pub enum PackError {
    /// Output format could not be resolved to a known container kind
    #[error("unsupported output format '{0}' (expected one of: zip, 7z, iso, img, cab, pdf, vhd, vhdx)")]
    UnsupportedFormat(String),

    /// Input file/directory or backdoor source is missing or empty
    #[error("input not found: {} ({reason})", path.display())]
    InputNotFound { path: PathBuf, reason: String },

    /// Two entries would occupy the same name inside the container
    #[error("conflicting entry name '{name}': '{first}' and '{second}' map to the same container path")]
    ConflictingEntryName {
        name: String,
        first: String,
        second: String,
    },

    /// Option not supported by the format, or missing host privilege
    #[error("unsupported option: {0}")]
    UnsupportedOption(String),

    /// External tool exited non-zero, timed out or is missing
    #[error("{tool} failed: {message}")]
    ExternalToolFailure {
        tool: String,
        message: String,
        output: String,
    },

    /// Virtual disk did not show up where it was expected
    #[error("virtual disk mount mismatch on {letter}: {message}")]
    MountMismatch { letter: char, message: String },

    /// Virtual disk is still mounted after the detach step
    #[error("virtual disk is still mounted on {letter}: after detach\n{remediation}")]
    DetachFailure { letter: char, remediation: String },

    /// Container codec rejected the data
    #[error("{format} container error: {message}")]
    Container {
        format: &'static str,
        message: String,
    },

    /// Filesystem error at a specific path
    #[error("I/O error at '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Flat, serializable classification of [`PackError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnsupportedFormat,
    InputNotFound,
    ConflictingEntryName,
    UnsupportedOption,
    ExternalToolFailure,
    MountMismatch,
    DetachFailure,
    Container,
    Io,
}

impl PackError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            Self::InputNotFound { .. } => ErrorKind::InputNotFound,
            Self::ConflictingEntryName { .. } => ErrorKind::ConflictingEntryName,
            Self::UnsupportedOption(_) => ErrorKind::UnsupportedOption,
            Self::ExternalToolFailure { .. } => ErrorKind::ExternalToolFailure,
            Self::MountMismatch { .. } => ErrorKind::MountMismatch,
            Self::DetachFailure { .. } => ErrorKind::DetachFailure,
            Self::Container { .. } => ErrorKind::Container,
            Self::Io { .. } => ErrorKind::Io,
        }
    }

    pub fn input_not_found(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InputNotFound {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::UnsupportedOption(msg.into())
    }

    /// Wrap a codec error from one of the container crates.
    pub fn container(format: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Container {
            format,
            message: err.to_string(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Attach the offending path to an `io::Result`.
pub(crate) trait IoResultExt<T> {
    fn at(self, path: &Path) -> Result<T>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn at(self, path: &Path) -> Result<T> {
        self.map_err(|source| PackError::io(path, source))
    }
}
