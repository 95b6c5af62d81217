//! Storage-specific error kinds.
//!
//! These carry more granular information than [`crate::error::Error`]
//! because a caller reacting to a storage failure (revert a piece, fail a
//! recheck, refuse a torrent) needs to know which of several similar-looking
//! failures occurred.

use std::{fmt, io};

pub(crate) type Result<T, E = WriteError> = std::result::Result<T, E>;

/// Failure to allocate a new torrent's on-disk layout.
#[derive(Debug)]
pub(crate) enum NewTorrentError {
    /// A torrent with this id was already registered.
    AlreadyExists,
    Io(io::Error),
}

impl fmt::Display for NewTorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyExists => write!(f, "torrent already allocated"),
            Self::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for NewTorrentError {}

impl From<io::Error> for NewTorrentError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Failure writing a piece's blocks to disk.
#[derive(Debug)]
pub(crate) enum WriteError {
    InvalidPieceIndex,
    Io(io::Error),
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPieceIndex => write!(f, "piece index out of range"),
            Self::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for WriteError {}

impl From<io::Error> for WriteError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Failure reading a piece back from disk, e.g. for a recheck.
#[derive(Debug)]
pub(crate) enum ReadError {
    InvalidPieceIndex,
    Io(io::Error),
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPieceIndex => write!(f, "piece index out of range"),
            Self::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for ReadError {}

impl From<io::Error> for ReadError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for WriteError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::Io(io::Error::new(io::ErrorKind::BrokenPipe, "alert channel closed"))
    }
}
