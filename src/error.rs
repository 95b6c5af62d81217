//! The errors that may occur throughout the engine.
//!
//! Each error kind is fatal to whatever owns the failing operation (the peer
//! session, the disk task, a single torrent) but never fatal to its sibling
//! components: a bad peer kills its own session, a bad piece kills its own
//! verification attempt, a storage failure marks its own torrent errored.

use std::{fmt, io};

use crate::disk::WriteError;

/// The result type used throughout the engine.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The top-level error type, covering protocol framing, handshake, and
/// assignment failures. Storage-specific errors live in
/// [`crate::disk::error`] since they carry their own, more granular kinds.
#[derive(Debug)]
pub enum Error {
    /// A frame's length prefix or payload contradicted what its message id
    /// requires (e.g. a `Have` with a payload that isn't 4 bytes).
    BadPayloadSize,
    /// A frame carried a message id not in the id table (0-8).
    InvalidMessageId(u8),
    /// A frame was truncated before a complete length-prefixed message could
    /// be read.
    ShortFrame,
    /// The handshake's `pstrlen`/`pstr` fields did not match the literal
    /// "BitTorrent protocol" string.
    ProtocolMismatch,
    /// The handshake was shorter than the fixed 68-byte handshake frame.
    ShortHandshake,
    /// The peer's advertised info hash did not match ours.
    InvalidPeerInfoHash,
    /// Peer sent a bitfield message outside of the availability-exchange
    /// state (i.e. not directly after the handshake).
    BitfieldNotAfterHandshake,
    /// We only support downloading from a seed; the remote peer's bitfield
    /// did not advertise all pieces.
    PeerNotSeed,
    /// An operation referenced a piece index that doesn't exist in the
    /// torrent.
    InvalidPieceIndex,
    /// An operation referenced a torrent id unknown to the disk task or
    /// engine.
    InvalidTorrentId,
    /// The metainfo's bencoded bytes failed to decode, or the `info`
    /// dictionary failed to re-encode for hashing.
    Metainfo(serde_bencode::Error),
    /// The metainfo parsed, but its `info` dictionary is structurally
    /// invalid: a piece hash table not a multiple of 20 bytes, or a
    /// dictionary describing neither a single file nor a file list (or
    /// both).
    InvalidMetainfo(String),
    /// Underlying I/O failure (socket or file).
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadPayloadSize => write!(f, "message payload size invalid for its id"),
            Self::InvalidMessageId(id) => write!(f, "invalid message id: {}", id),
            Self::ShortFrame => write!(f, "frame truncated before completion"),
            Self::ProtocolMismatch => write!(f, "handshake protocol string mismatch"),
            Self::ShortHandshake => write!(f, "handshake truncated before completion"),
            Self::InvalidPeerInfoHash => write!(f, "peer's info hash doesn't match ours"),
            Self::BitfieldNotAfterHandshake => {
                write!(f, "peer sent bitfield outside of availability exchange")
            }
            Self::PeerNotSeed => write!(f, "peer is not a seed"),
            Self::InvalidPieceIndex => write!(f, "piece index out of range"),
            Self::InvalidTorrentId => write!(f, "torrent id not registered"),
            Self::Metainfo(e) => write!(f, "metainfo decode error: {}", e),
            Self::InvalidMetainfo(msg) => write!(f, "invalid metainfo: {}", msg),
            Self::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Metainfo(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_bencode::Error> for Error {
    fn from(e: serde_bencode::Error) -> Self {
        Self::Metainfo(e)
    }
}

impl From<WriteError> for Error {
    fn from(e: WriteError) -> Self {
        match e {
            WriteError::InvalidPieceIndex => Self::InvalidPieceIndex,
            WriteError::Io(e) => Self::Io(e),
        }
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::Io(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "channel receiver dropped",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_converts_and_displays() {
        let io_err = io::Error::new(io::ErrorKind::Other, "boom");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(err.to_string(), "io error: boom");
    }
}
