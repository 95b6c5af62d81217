use {
    nix::sys::uio::{preadv, pwritev},
    sha1::{Digest, Sha1},
    std::{
        collections::{BTreeMap, HashMap},
        fs::{self, File, OpenOptions},
        ops::Range,
        os::unix::io::AsRawFd,
        sync::{Arc, Mutex},
    },
    tokio::{
        sync::{mpsc, RwLock},
        task,
    },
};

use {
    super::{
        error::*,
        iovecs::{IoVec, IoVecs},
        Alert, AlertReceiver, AlertSender, BatchWrite, Command,
        CommandReceiver, CommandSender, TorrentAlert, TorrentAlertReceiver,
        TorrentAlertSender, TorrentAllocation, DISK_COMMAND_QUEUE_DEPTH,
    },
    crate::{
        block_count,
        error::Error,
        storage_info::{FsStructure, StorageInfo},
        BlockInfo, FileIndex, FileInfo, PieceIndex, Sha1Hash, TorrentId,
    },
};

/// The entity responsible for saving downloaded file blocks to disk,
/// verifying whether downloaded pieces are valid, and serving piece
/// rereads for rechecking.
pub(crate) struct Disk {
    /// Each torrent in engine has a corresponding entry in this hashmap, which
    /// includes various metadata about torrent and the torrent specific alert
    /// channel.
    torrents: HashMap<TorrentId, RwLock<Torrent>>,
    /// Port on which disk IO commands are received.
    cmd_port: CommandReceiver,
    /// Channel on which `Disk` sends alerts to the torrent engine.
    alert_chan: AlertSender,
}

impl Disk {
    /// Creates a new `Disk` instance and returns a command sender and an alert
    /// receiver.
    pub(super) fn new() -> crate::error::Result<(Self, CommandSender, AlertReceiver)> {
        let (alert_chan, alert_port) = mpsc::unbounded_channel();
        let (cmd_chan, cmd_port) = mpsc::channel(DISK_COMMAND_QUEUE_DEPTH);
        Ok((
            Self {
                torrents: HashMap::new(),
                cmd_port,
                alert_chan,
            },
            cmd_chan,
            alert_port,
        ))
    }

    /// Starts the disk event loop which is run until shutdown or an
    /// unrecoverable error occurs (e.g. mpsc channel failure).
    pub(super) async fn start(&mut self) -> crate::error::Result<()> {
        log::info!("Starting disk IO event loop");
        while let Some(cmd) = self.cmd_port.recv().await {
            log::debug!("Disk received command");
            match cmd {
                Command::NewTorrent {
                    id,
                    info,
                    piece_hashes,
                } => {
                    if self.torrents.contains_key(&id) {
                        log::warn!("Torrent {} already allocated", id);
                        self.alert_chan.send(Alert::TorrentAllocation(Err(
                            NewTorrentError::AlreadyExists,
                        )))?;
                        continue;
                    }

                    // NOTE: Do _NOT_ return on failure, we don't want to kill
                    // the disk task due to potential disk IO errors: we just
                    // want to log it and notify engine of it.
                    let torrent_res = Torrent::new(info, piece_hashes);
                    match torrent_res {
                        Ok((torrent, alert_port)) => {
                            log::info!("Torrent {} successfully allocated", id);
                            self.torrents.insert(id, RwLock::new(torrent));
                            self.alert_chan.send(Alert::TorrentAllocation(
                                Ok(TorrentAllocation { id, alert_port }),
                            ))?;
                        }
                        Err(e) => {
                            log::warn!(
                                "Torrent {} allocation failure: {}",
                                id,
                                e
                            );
                            self.alert_chan
                                .send(Alert::TorrentAllocation(Err(e)))?;
                        }
                    }
                }
                Command::WriteBlock { id, info, data } => {
                    self.write_block(id, info, data).await?;
                }
                Command::ReadPiece { id, piece_index } => {
                    self.read_piece(id, piece_index).await?;
                }
                Command::ReadBlock { id, block } => {
                    self.read_block(id, block).await?;
                }
                Command::Shutdown => {
                    log::info!("Shutting down disk event loop");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Queues a block for writing and fails if the torrent id is invalid.
    ///
    /// If the block could not be written due to IO failure, the torrent is
    /// notified of it.
    async fn write_block(
        &self,
        id: TorrentId,
        info: BlockInfo,
        data: Vec<u8>,
    ) -> crate::error::Result<()> {
        log::trace!("Saving torrent {} block {:?} to disk", id, info);

        let torrent = self.torrents.get(&id).ok_or_else(|| {
            log::warn!("Torrent {} not found", id);
            Error::InvalidTorrentId
        })?;
        torrent.write().await.write_block(info, data).await.map_err(Error::from)
    }

    /// Rereads a piece from disk and compares it against its expected hash,
    /// reporting the outcome to the torrent's own alert channel. Used for
    /// rechecking a torrent's on-disk contents against its metainfo.
    async fn read_piece(&self, id: TorrentId, piece_index: PieceIndex) -> crate::error::Result<()> {
        log::trace!("Rereading torrent {} piece {} from disk", id, piece_index);

        let torrent = self.torrents.get(&id).ok_or_else(|| {
            log::warn!("Torrent {} not found", id);
            Error::InvalidTorrentId
        })?;
        torrent.read().await.read_piece(piece_index).await.map_err(Error::from)
    }

    /// Rereads a single block from disk, used to serve an unchoked peer's
    /// REQUEST.
    async fn read_block(&self, id: TorrentId, block: BlockInfo) -> crate::error::Result<()> {
        log::trace!("Rereading torrent {} block {:?} from disk", id, block);

        let torrent = self.torrents.get(&id).ok_or_else(|| {
            log::warn!("Torrent {} not found", id);
            Error::InvalidTorrentId
        })?;
        torrent.read().await.read_block(block).await.map_err(Error::from)
    }
}

/// Torrent information related to disk IO.
///
/// Contains the in-progress pieces (i.e. the write buffer), metadata about
/// torrent's download and piece sizes, etc.
struct Torrent {
    /// All information concerning this torrent's storage.
    info: StorageInfo,
    /// The channel used to alert a torrent that a block has been written to
    /// disk and/or a piece was completed.
    alert_chan: TorrentAlertSender,
    /// The in-progress piece downloads and disk writes. This is the torrent's
    /// disk write buffer. Each piece is mapped to its index for faster lookups.
    pieces: HashMap<PieceIndex, Piece>,
    /// Handles of all files in torrent, opened in advance during torrent
    /// creation.
    ///
    /// Each writer thread will get exclusive access to the file handle it
    /// needs, referring to it directly in the vector (hence the arc).
    files: Arc<Vec<Mutex<TorrentFile>>>,
    /// The concatenation of all expected piece hashes.
    piece_hashes: Vec<u8>,
    /// Disk IO statistics.
    stats: Stats,
}

impl Torrent {
    /// Creates the file system structure of the torrent and opens the file
    /// handles.
    ///
    /// For a single file, there is a path validity check and then the file is
    /// opened. For multi-file torrents, if there are any subdirectories in the
    /// torrent archive, they are created and all files are opened.
    fn new(
        info: StorageInfo,
        piece_hashes: Vec<u8>,
    ) -> Result<(Self, TorrentAlertReceiver), NewTorrentError> {
        if !info.download_dir.exists() {
            fs::create_dir_all(&info.download_dir).map_err(NewTorrentError::Io)?;
        }

        // Helper function for opening a file. Reusing an existing file (and
        // its bytes) on disk is expected: this is how a download resumes.
        // `create(true)` plus `set_len` below brings a missing file up to
        // the expected length without touching one that already has it.
        let open_file = |info: FileInfo| {
            let handle = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&info.path)
                .map_err(|e| {
                    log::warn!("Failed to open file {:?}", &info.path);
                    NewTorrentError::Io(e)
                })?;
            handle.set_len(info.len).map_err(|e| {
                log::warn!("Failed to preallocate file {:?}", &info.path);
                NewTorrentError::Io(e)
            })?;
            Ok(Mutex::new(TorrentFile { info, handle }))
        };

        let files = match &info.structure {
            FsStructure::File(file) => {
                log::debug!(
                    "Torrent is single {} bytes long file {:?}",
                    file.len,
                    file.path
                );
                let mut file = file.clone();
                file.path = info.download_dir.join(&file.path);
                if let Some(parent) = file.path.parent() {
                    if !parent.exists() {
                        fs::create_dir_all(parent)
                            .map_err(NewTorrentError::Io)?;
                    }
                }
                vec![open_file(file)?]
            }
            FsStructure::Archive { files } => {
                debug_assert!(!files.is_empty());
                log::debug!("Torrent is multi file: {:?}", files);
                log::debug!("Setting up directory structure");
                let mut torrent_files = Vec::with_capacity(files.len());
                for file in files.iter() {
                    let path = info.download_dir.join(&file.path);

                    if let Some(subdir) = path.parent() {
                        if !subdir.exists() {
                            log::info!("Creating torrent subdir {:?}", subdir);
                            fs::create_dir_all(&subdir).map_err(|e| {
                                log::warn!(
                                    "Failed to create subdir {:?}",
                                    subdir
                                );
                                NewTorrentError::Io(e)
                            })?;
                        }
                    }

                    let file = FileInfo {
                        path,
                        torrent_offset: file.torrent_offset,
                        len: file.len,
                    };
                    torrent_files.push(open_file(file)?);
                }
                torrent_files
            }
        };

        let (alert_chan, alert_port) = mpsc::unbounded_channel();

        Ok((
            Self {
                info,
                alert_chan,
                pieces: HashMap::new(),
                files: Arc::new(files),
                piece_hashes,
                stats: Stats::default(),
            },
            alert_port,
        ))
    }

    async fn write_block(
        &mut self,
        info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        log::trace!("Saving block {:?} to disk", info);

        let piece_index = info.piece_index;
        if !self.pieces.contains_key(&piece_index) {
            if let Err(e) = self.start_new_piece(info) {
                self.alert_chan.send(TorrentAlert::BatchWrite {
                    piece_index,
                    result: Err(e),
                })?;
                // return with ok as the disk task itself shouldn't be aborted
                // due to invalid input
                return Ok(());
            }
        }
        let piece = self
            .pieces
            .get_mut(&piece_index)
            .expect("Newly inserted piece not present");

        piece.enqueue_block(info.offset, data);

        // if the piece has all its blocks, it means we can hash it and save it
        // to disk and clear its write buffer
        if piece.is_complete() {
            let piece = self.pieces.remove(&piece_index).unwrap();
            let piece_len = self.info.piece_len;
            let files = Arc::clone(&self.files);

            // don't block the reactor with the potentially expensive hashing
            // and sync file writing
            let write_result = task::spawn_blocking(move || {
                let is_piece_valid = piece.matches_hash();

                let (write_count, blocks) = if is_piece_valid {
                    log::info!("Piece {} is valid", piece_index);
                    let piece_torrent_offset = piece_index as u64 * piece_len as u64;
                    let write_count = piece.write(piece_torrent_offset, &*files)?;

                    let blocks = piece
                        .blocks
                        .iter()
                        .map(|(offset, block)| BlockInfo {
                            piece_index,
                            offset: *offset,
                            len: block.len() as u32,
                        })
                        .collect();

                    (Some(write_count), blocks)
                } else {
                    log::warn!("Piece {} is NOT valid", piece_index);
                    (None, Vec::new())
                };

                Ok((is_piece_valid, write_count, blocks))
            })
            .await
            .expect("disk IO write task panicked");

            match write_result {
                Ok((is_piece_valid, write_count, blocks)) => {
                    if let Some(write_count) = write_count {
                        self.stats.write_count += write_count as u64;
                    }

                    self.alert_chan.send(TorrentAlert::BatchWrite {
                        piece_index,
                        result: Ok(BatchWrite { blocks, is_piece_valid }),
                    })?;
                }
                Err(e) => {
                    log::warn!("Disk write error: {}", e);
                    self.stats.write_failure_count += 1;
                    self.alert_chan.send(TorrentAlert::BatchWrite {
                        piece_index,
                        result: Err(e),
                    })?;
                }
            }
        }

        Ok(())
    }

    /// Rereads a single block's bytes from disk across the files it
    /// overlaps with, used to serve an unchoked peer's REQUEST.
    async fn read_block(&self, block: BlockInfo) -> Result<()> {
        let result = self.read_block_bytes(block).await;
        self.alert_chan.send(TorrentAlert::BlockRead { block, result })?;
        Ok(())
    }

    async fn read_block_bytes(
        &self,
        block: BlockInfo,
    ) -> std::result::Result<Vec<u8>, ReadError> {
        let torrent_offset =
            block.piece_index as u64 * self.info.piece_len as u64 + block.offset as u64;
        let byte_range = torrent_offset..torrent_offset + block.len as u64;
        let file_range = self.info.structure.files_intersecting_bytes(byte_range);
        if file_range.is_empty() {
            return Err(ReadError::InvalidPieceIndex);
        }

        let files = Arc::clone(&self.files);
        let len = block.len as usize;
        task::spawn_blocking(move || {
            let files = &files[file_range];
            let mut buf = vec![0u8; len];
            read_piece_bytes(torrent_offset, &mut buf, files)?;
            Ok(buf)
        })
        .await
        .expect("disk IO read task panicked")
    }

    /// Rereads a piece from disk across the files it overlaps with,
    /// hashes it, and reports whether it matches the expected hash.
    async fn read_piece(&self, piece_index: PieceIndex) -> Result<()> {
        let expected_hash = self
            .piece_hash(piece_index)
            .ok_or(WriteError::InvalidPieceIndex);
        let expected_hash = match expected_hash {
            Ok(hash) => hash,
            Err(_) => {
                self.alert_chan.send(TorrentAlert::PieceRead {
                    piece_index,
                    result: Err(ReadError::InvalidPieceIndex),
                })?;
                return Ok(());
            }
        };

        let len = match self.info.piece_len(piece_index) {
            Ok(len) => len,
            Err(_) => {
                self.alert_chan.send(TorrentAlert::PieceRead {
                    piece_index,
                    result: Err(ReadError::InvalidPieceIndex),
                })?;
                return Ok(());
            }
        };
        let file_range = match self.info.files_intersecting_piece(piece_index) {
            Ok(range) => range,
            Err(_) => {
                self.alert_chan.send(TorrentAlert::PieceRead {
                    piece_index,
                    result: Err(ReadError::InvalidPieceIndex),
                })?;
                return Ok(());
            }
        };

        let piece_torrent_offset = piece_index as u64 * self.info.piece_len as u64;
        let files = Arc::clone(&self.files);
        let read_result = task::spawn_blocking(move || {
            let files = &files[file_range];
            let mut buf = vec![0u8; len as usize];
            read_piece_bytes(piece_torrent_offset, &mut buf, files)?;
            let mut hasher = Sha1::new();
            hasher.input(&buf);
            let digest = hasher.result();
            Ok::<bool, ReadError>(digest.as_slice() == expected_hash)
        })
        .await
        .expect("disk IO read task panicked");

        self.alert_chan.send(TorrentAlert::PieceRead {
            piece_index,
            result: read_result,
        })?;
        Ok(())
    }

    fn piece_hash(&self, index: PieceIndex) -> Option<Sha1Hash> {
        let start = index.checked_mul(20)?;
        let end = start.checked_add(20)?;
        let slice = self.piece_hashes.get(start..end)?;
        let mut hash = [0; 20];
        hash.copy_from_slice(slice);
        Some(hash)
    }

    /// Starts a new in-progress piece, creating metadata for it in self.
    ///
    /// This involves getting the expected hash of the piece, its length, and
    /// calculating the files that it intersects.
    fn start_new_piece(&mut self, info: BlockInfo) -> Result<(), WriteError> {
        log::trace!("Creating piece {} write buffer", info.piece_index);

        let expected_hash = self
            .piece_hash(info.piece_index)
            .ok_or(WriteError::InvalidPieceIndex)?;
        log::debug!(
            "Piece {} expected hash {}",
            info.piece_index,
            hex::encode(&expected_hash)
        );

        let len = self
            .info
            .piece_len(info.piece_index)
            .map_err(|_| WriteError::InvalidPieceIndex)?;
        log::debug!("Piece {} is {} bytes long", info.piece_index, len);

        let files = self
            .info
            .files_intersecting_piece(info.piece_index)
            .map_err(|_| WriteError::InvalidPieceIndex)?;
        log::debug!("Piece {} intersects files: {:?}", info.piece_index, files);

        let piece = Piece {
            expected_hash,
            len,
            blocks: BTreeMap::new(),
            files,
        };
        self.pieces.insert(info.piece_index, piece);

        Ok(())
    }
}

/// Reads `buf.len()` bytes starting at `torrent_offset` scattered across
/// `files`, mirroring the scatter-write logic in [`Piece::write`].
fn read_piece_bytes(
    torrent_offset: u64,
    buf: &mut [u8],
    files: &[Mutex<TorrentFile>],
) -> Result<(), ReadError> {
    debug_assert!(!files.is_empty());
    let mut read_torrent_offset = torrent_offset;
    let mut remaining = buf;

    for file in files.iter() {
        let file = file.lock().unwrap();
        let slice = file.info.get_slice(read_torrent_offset, remaining.len() as u64);
        let want = slice.len as usize;
        debug_assert!(want <= remaining.len());

        let (head, tail) = remaining.split_at_mut(want);
        let mut total_read = 0;
        while total_read < head.len() {
            let iovec = IoVec::from_mut_slice(&mut head[total_read..]);
            let read_count = preadv(
                file.handle.as_raw_fd(),
                &mut [iovec],
                (slice.offset + total_read as u64) as i64,
            )
            .map_err(|e| {
                log::warn!("File {:?} read error: {}", file.info.path, e);
                ReadError::Io(std::io::Error::last_os_error())
            })?;
            if read_count == 0 {
                return Err(ReadError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "short read while rechecking piece",
                )));
            }
            total_read += read_count;
        }

        read_torrent_offset += want as u64;
        remaining = tail;
    }

    debug_assert!(remaining.is_empty());
    Ok(())
}

struct TorrentFile {
    info: FileInfo,
    handle: File,
}

impl TorrentFile {
    /// Writes `iovecs` at `offset`, repeating the vectored write until every
    /// buffer has been confirmed written (`pwritev` is not guaranteed to
    /// drain the whole buffer list in one syscall).
    fn write_vectored_at<'a>(
        &self,
        iovecs: &mut IoVecs<'a>,
        offset: u64,
    ) -> Result<usize, WriteError> {
        let mut total_write_count = 0;
        while !iovecs.is_empty() {
            let bufs = iovecs.buffers();
            let write_count = pwritev(
                self.handle.as_raw_fd(),
                &bufs,
                (offset + total_write_count as u64) as i64,
            )
            .map_err(|e| {
                log::warn!("File {:?} write error: {}", self.info.path, e);
                WriteError::Io(std::io::Error::last_os_error())
            })?;
            iovecs.advance(write_count);
            total_write_count += write_count;
        }
        Ok(total_write_count)
    }
}

#[derive(Default)]
struct Stats {
    /// The number of bytes successfully written to disk.
    write_count: u64,
    /// The number of times we failed to write to disk.
    write_failure_count: usize,
}

/// An in-progress piece download that keeps in memory the so far downloaded
/// blocks and the expected hash of the piece.
struct Piece {
    /// The expected hash of the whole piece.
    expected_hash: Sha1Hash,
    /// The length of the piece, in bytes.
    len: u32,
    /// The so far downloaded blocks, keyed by offset within piece. A
    /// `BTreeMap` keeps them ordered by offset, which matters when hashing
    /// and writing them back to back.
    blocks: BTreeMap<u32, Vec<u8>>,
    /// The files that this piece overlaps with: a left-inclusive range of
    /// file indices into `Torrent::files`.
    files: Range<FileIndex>,
}

impl Piece {
    /// Places block into piece's write buffer if it doesn't exist yet.
    /// Duplicates (from endgame mode) are dropped.
    fn enqueue_block(&mut self, offset: u32, data: Vec<u8>) {
        if self.blocks.contains_key(&offset) {
            log::warn!("Duplicate piece block at offset {}", offset);
        } else {
            self.blocks.insert(offset, data);
        }
    }

    /// Returns true if the piece has all its blocks in its write buffer.
    fn is_complete(&self) -> bool {
        self.blocks.len() == block_count(self.len)
    }

    /// Calculates the piece's hash using all its blocks and returns if it
    /// matches the expected hash.
    ///
    /// This is a long running function and should be executed on a thread
    /// pool and not the executor.
    fn matches_hash(&self) -> bool {
        debug_assert_eq!(self.blocks.len(), block_count(self.len));
        let mut hasher = Sha1::new();
        for block in self.blocks.values() {
            hasher.input(&block);
        }
        let hash = hasher.result();
        log::debug!("Piece hash: {:x}", hash);
        hash.as_slice() == self.expected_hash
    }

    /// Writes the piece's blocks to the files the piece overlaps with.
    ///
    /// This performs sync IO and is thus potentially blocking and should be
    /// executed on a thread pool and not the executor.
    fn write(
        &self,
        piece_torrent_offset: u64,
        files: &[Mutex<TorrentFile>],
    ) -> Result<usize, WriteError> {
        let mut total_write_count = 0;

        let blocks: Vec<_> =
            self.blocks.values().map(|b| IoVec::from_slice(&b)).collect();
        let mut write_torrent_offset = piece_torrent_offset;

        let files = &files[self.files.clone()];
        debug_assert!(!files.is_empty());

        if files.len() == 1 {
            let file = files.first().unwrap().lock().unwrap();
            let slice = file.info.get_slice(write_torrent_offset, self.len as u64);
            let mut iovecs = IoVecs::unbounded(&blocks);
            total_write_count += file.write_vectored_at(&mut iovecs, slice.offset)?;
        } else {
            let mut tail: Option<Vec<&[u8]>> = None;
            for file in files.iter() {
                let file = file.lock().unwrap();
                let slice = file.info.get_slice(write_torrent_offset, self.len as u64);
                debug_assert!(slice.len > 0);

                let mut iovecs = match tail.take() {
                    Some(t) => IoVecs::from_tail(t, Some(slice.len as usize)),
                    None => IoVecs::bounded(&blocks, slice.len as usize),
                };

                let write_count = file.write_vectored_at(&mut iovecs, slice.offset)?;

                tail = Some(iovecs.into_tail());
                write_torrent_offset += write_count as u64;
                total_write_count += write_count;
            }
        }

        Ok(total_write_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn piece_completion_tracks_block_count() {
        let piece = Piece {
            expected_hash: [0; 20],
            len: crate::BLOCK_LEN * 2,
            blocks: BTreeMap::new(),
            files: 0..1,
        };
        assert!(!piece.is_complete());
    }
}
