//! Error taxonomy shared by the whole engine.

use crate::bigint::Bigint;
use std::io;
use thiserror::Error;

/// Message shown when an isolated catalogue is supplied where data is required.
pub const MSG_REF_NOT_EXPLOITABLE: &str = "Archive of reference given is not exploitable";
/// Message shown by `summary` for an isolated catalogue.
pub const MSG_ISOLATED_CONTENTS: &str =
    "This archive only contains the contents of another archive, it can only be used as reference for a differential backup or as rescue in case of corruption of the original archive's content";
/// Message shown on CRC mismatch in a delta signature block.
pub const MSG_DELTA_SIG_CRC: &str =
    "CRC error met while reading delta signature: data corruption.";
/// Message shown when operating on a logically closed archive.
pub const MSG_NOT_EXPLOITABLE: &str =
    "This archive is not exploitable, check documentation for more";

/// Discriminates OS-level failures that callers react to differently.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IoKind {
    /// Target already exists.
    Exist,
    /// Target is missing.
    Absent,
    /// Permission denied.
    Access,
    /// Filesystem is read-only.
    ReadOnlyFs,
    /// Any other OS failure.
    Other,
}

impl IoKind {
    /// Maps an `io::Error` to its discriminant.
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::AlreadyExists => Self::Exist,
            io::ErrorKind::NotFound => Self::Absent,
            io::ErrorKind::PermissionDenied => Self::Access,
            io::ErrorKind::ReadOnlyFilesystem => Self::ReadOnlyFs,
            _ => Self::Other,
        }
    }
}

/// Errors raised by archive operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid argument or invalid object state.
    #[error("misuse: {0}")]
    Misuse(String),
    /// Data outside of expected bounds, malformed header.
    #[error("out of range: {0}")]
    Range(String),
    /// Allocation failure.
    #[error("memory exhaustion: {0}")]
    Memory(String),
    /// The user answered "no" to a question.
    #[error("aborted per user request: {0}")]
    UserAbort(String),
    /// Detected corruption.
    #[error("data corruption: {0}")]
    Data(String),
    /// Requested combination of options is not supported.
    #[error("unsupported feature: {0}")]
    Feature(String),
    /// OS-level failure.
    #[error("system error: {message}")]
    System {
        kind: IoKind,
        message: String,
    },
    /// A hook command returned an error.
    #[error("user command line error: {0}")]
    Script(String),
    /// Cooperative cancellation.
    #[error("thread cancellation requested")]
    Cancelled {
        immediate: bool,
        flag: bool,
        attribute: Option<Bigint>,
    },
    /// Impossible control flow.
    #[error("internal error, please report: {0}")]
    Bug(String),
}

impl Error {
    pub fn misuse(msg: impl Into<String>) -> Self {
        Self::Misuse(msg.into())
    }

    pub fn range(msg: impl Into<String>) -> Self {
        Self::Range(msg.into())
    }

    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    pub fn feature(msg: impl Into<String>) -> Self {
        Self::Feature(msg.into())
    }

    pub fn bug(msg: impl Into<String>) -> Self {
        Self::Bug(msg.into())
    }

    /// Tells whether the error is a cancellation.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Tells whether the error is recoverable at entry granularity.
    ///
    /// Per-entry data and system errors are counted and the operation
    /// proceeds; every other kind aborts it.
    pub fn is_per_entry(&self) -> bool {
        matches!(self, Self::Data(_) | Self::System { .. })
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::System {
            kind: IoKind::from_io(&err),
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_kind_mapping() {
        let err = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert_eq!(IoKind::from_io(&err), IoKind::Absent);
        let err = io::Error::new(io::ErrorKind::AlreadyExists, "there");
        assert_eq!(IoKind::from_io(&err), IoKind::Exist);
    }

    #[test]
    fn per_entry_classification() {
        assert!(Error::data("crc").is_per_entry());
        assert!(!Error::feature("nope").is_per_entry());
        assert!(Error::Cancelled {
            immediate: true,
            flag: false,
            attribute: None
        }
        .is_cancellation());
    }
}
