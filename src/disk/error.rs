//! Disk-local error types, nested under `disk::error` as the teacher's
//! `disk/io.rs` originally had it. These convert into the crate-wide
//! `Error::Storage` at the `Torrent` boundary.

use std::fmt;

/// Failure to allocate a new torrent's on-disk layout.
#[derive(Debug)]
pub(crate) enum NewTorrentError {
    /// The download path already exists.
    AlreadyExists,
    Io(std::io::Error),
}

impl fmt::Display for NewTorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyExists => write!(f, "download path already exists"),
            Self::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for NewTorrentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::AlreadyExists => None,
        }
    }
}

impl From<NewTorrentError> for crate::error::Error {
    fn from(e: NewTorrentError) -> Self {
        match e {
            NewTorrentError::AlreadyExists => {
                crate::error::Error::Storage(crate::error::StorageError::Io(
                    std::io::Error::new(std::io::ErrorKind::AlreadyExists, e.to_string()),
                ))
            }
            NewTorrentError::Io(e) => {
                crate::error::Error::Storage(crate::error::StorageError::Io(e))
            }
        }
    }
}

/// Failure writing a piece's blocks to their files.
#[derive(Debug)]
pub(crate) enum WriteError {
    InvalidPieceIndex,
    Io(std::io::Error),
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPieceIndex => write!(f, "invalid piece index"),
            Self::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for WriteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::InvalidPieceIndex => None,
        }
    }
}

impl From<WriteError> for crate::error::Error {
    fn from(e: WriteError) -> Self {
        match e {
            WriteError::InvalidPieceIndex => {
                crate::error::Error::Storage(crate::error::StorageError::InvalidPieceIndex)
            }
            WriteError::Io(e) => crate::error::Error::Storage(crate::error::StorageError::Io(e)),
        }
    }
}

/// Local alias so `disk` submodules can write `Result<T>` for the
/// crate-wide error type, or `Result<T, WriteError>`/`Result<T,
/// NewTorrentError>` when they need the narrower disk-local variant.
pub(crate) type Result<T, E = crate::error::Error> = std::result::Result<T, E>;
