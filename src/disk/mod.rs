//! The storage assembler: buffers downloaded blocks per piece, verifies
//! SHA-1 on completion, and scatters the verified bytes across the one or
//! many files a torrent maps to. Also serves piece rereads for rechecking.
//!
//! Owns all file handles and per-piece write buffers exclusively; the rest
//! of the engine only ever talks to it through the bounded [`Command`]/
//! unbounded [`Alert`] channel pair, per the single-owner discipline the
//! whole engine follows.

mod error;
mod io;
mod iovecs;

use tokio::sync::mpsc;

pub(crate) use error::{NewTorrentError, ReadError, WriteError};
pub(crate) use io::Disk;

use crate::{storage_info::StorageInfo, BlockInfo, PieceIndex, Sha1Hash, TorrentId};

/// Commands the rest of the engine sends to the disk task. Bounded, per the
/// channel policy: the caller should prefer `try_send` and drop with a
/// logged warning rather than block on a slow disk.
pub(crate) type CommandSender = mpsc::Sender<Command>;
pub(crate) type CommandReceiver = mpsc::Receiver<Command>;

#[derive(Debug)]
pub(crate) enum Command {
    /// Registers a new torrent, allocating and pre-creating its files.
    NewTorrent {
        id: TorrentId,
        info: StorageInfo,
        piece_hashes: Vec<u8>,
    },
    /// Buffers a downloaded block, writing its piece to disk once complete
    /// and verified.
    WriteBlock {
        id: TorrentId,
        info: BlockInfo,
        data: Vec<u8>,
    },
    /// Rereads a piece from disk and compares it against the expected
    /// hash, used for torrent rechecking.
    ReadPiece {
        id: TorrentId,
        piece_index: PieceIndex,
    },
    /// Reads a single block's worth of bytes back from disk, used to serve
    /// a REQUEST from an unchoked peer.
    ReadBlock {
        id: TorrentId,
        block: BlockInfo,
    },
    Shutdown,
}

/// Alerts the disk task sends back to the engine. Unbounded: the producer
/// count is bounded by the number of torrents, not by external input.
pub(crate) type AlertSender = mpsc::UnboundedSender<Alert>;
pub(crate) type AlertReceiver = mpsc::UnboundedReceiver<Alert>;

#[derive(Debug)]
pub(crate) enum Alert {
    /// The result of allocating a new torrent's on-disk layout.
    TorrentAllocation(std::result::Result<TorrentAllocation, NewTorrentError>),
}

/// Returned to the engine on successful torrent allocation: the torrent's
/// id (echoed back so the engine can correlate it) and the per-torrent
/// alert channel the disk task will use from here on.
#[derive(Debug)]
pub(crate) struct TorrentAllocation {
    pub id: TorrentId,
    pub alert_port: TorrentAlertReceiver,
}

/// What the engine's allocation dispatcher hands back to the torrent task
/// that is waiting to learn whether its storage came up.
pub(crate) type NewTorrentResult = std::result::Result<TorrentAllocation, NewTorrentError>;

/// Per-torrent alerts, reported on a dedicated channel so a busy torrent
/// can't delay alerts for every other torrent sharing the engine-wide one.
pub(crate) type TorrentAlertSender = mpsc::UnboundedSender<TorrentAlert>;
pub(crate) type TorrentAlertReceiver = mpsc::UnboundedReceiver<TorrentAlert>;

#[derive(Debug)]
pub(crate) enum TorrentAlert {
    /// The result of flushing a completed piece's blocks to disk (or, on
    /// hash mismatch, of declining to). `piece_index` is always present,
    /// even on hash mismatch, so the scheduler can revert the right piece
    /// without having to infer it from an empty block list.
    BatchWrite {
        piece_index: PieceIndex,
        result: std::result::Result<BatchWrite, WriteError>,
    },
    /// The result of rereading a piece from disk for a recheck.
    PieceRead {
        piece_index: PieceIndex,
        result: std::result::Result<bool, ReadError>,
    },
    /// The result of reading a single block back from disk to serve a
    /// peer's REQUEST.
    BlockRead {
        block: BlockInfo,
        result: std::result::Result<Vec<u8>, ReadError>,
    },
}

/// Reports which blocks of a just-completed piece were written to disk, and
/// whether the piece's hash matched.
#[derive(Debug)]
pub(crate) struct BatchWrite {
    pub blocks: Vec<BlockInfo>,
    pub is_piece_valid: bool,
}

/// Depth of the engine-wide command queue into the disk task.
const DISK_COMMAND_QUEUE_DEPTH: usize = 256;

/// Spawns the disk task, returning the command sender and the engine-wide
/// alert receiver the caller should poll alongside its other event
/// sources.
pub(crate) fn spawn() -> crate::error::Result<(CommandSender, AlertReceiver)> {
    let (mut disk, cmd_chan, alert_port) = Disk::new()?;
    tokio::task::spawn(async move {
        if let Err(e) = disk.start().await {
            log::error!("Disk task exited with error: {}", e);
        }
    });
    Ok((cmd_chan, alert_port))
}
