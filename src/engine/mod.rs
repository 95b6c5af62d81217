//! The top-level handle applications embed: owns the disk task and the set
//! of running torrents, and is the only thing outside this crate that ever
//! sees a [`TorrentId`].

mod error;

use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use tokio::sync::{mpsc, oneshot};

use crate::{
    conf::{EngineConf, TorrentConf},
    disk,
    metainfo::Metainfo,
    storage_info::StorageInfo,
    torrent::{self, PeerSource, Torrent},
    TorrentId, TorrentStats,
};

pub use error::EngineError;

pub type Result<T> = std::result::Result<T, EngineError>;

/// A running torrent's command sender, as tracked by the engine.
struct TorrentEntry {
    cmd_tx: torrent::CommandSender,
}

/// Dispatches [`disk::Alert::TorrentAllocation`] results back to the torrent
/// task awaiting them.
///
/// The disk task processes `Command`s strictly in the order received and
/// reports allocation results on one shared, unordered alert channel with no
/// `TorrentId` on the error path (see `disk::Alert`), so the only way to
/// correlate a result with its request is by arrival order: the disk task
/// never reorders `NewTorrent` commands relative to each other, so a FIFO
/// queue of waiters, pushed to on every `add` and popped on every
/// `TorrentAllocation` alert, always pairs the right waiter with the right
/// result.
type PendingAllocations = Arc<Mutex<VecDeque<oneshot::Sender<disk::NewTorrentResult>>>>;

/// The torrent engine: owns the disk task and every running torrent.
pub struct Engine {
    client_id: crate::PeerId,
    disk_tx: disk::CommandSender,
    pending_allocations: PendingAllocations,
    torrents: Mutex<HashMap<TorrentId, TorrentEntry>>,
    next_id: std::sync::atomic::AtomicU32,
}

impl Engine {
    /// Spawns the disk task and the allocation-dispatch task, returning a
    /// handle ready to take `add` calls.
    pub fn new(conf: EngineConf) -> crate::error::Result<Self> {
        let (disk_tx, mut disk_alerts) = disk::spawn()?;
        let pending_allocations: PendingAllocations = Arc::new(Mutex::new(VecDeque::new()));

        let dispatch_pending = pending_allocations.clone();
        tokio::spawn(async move {
            while let Some(alert) = disk_alerts.recv().await {
                match alert {
                    disk::Alert::TorrentAllocation(result) => {
                        let waiter = dispatch_pending.lock().unwrap().pop_front();
                        match waiter {
                            Some(tx) => {
                                let _ = tx.send(result);
                            }
                            None => {
                                log::error!(
                                    "Received torrent allocation result with no waiter queued"
                                );
                            }
                        }
                    }
                }
            }
            log::info!("Disk alert channel closed, allocation dispatcher exiting");
        });

        Ok(Self {
            client_id: conf.client_id,
            disk_tx,
            pending_allocations,
            torrents: Mutex::new(HashMap::new()),
            next_id: std::sync::atomic::AtomicU32::new(0),
        })
    }

    /// Registers a new torrent, allocates its storage on disk, and starts
    /// its scheduler. Returns a handle to the running torrent immediately;
    /// allocation completes asynchronously (the torrent itself will log and
    /// shut down if allocation fails).
    pub async fn add(
        &self,
        metainfo: Metainfo,
        conf: TorrentConf,
        peer_source: Option<Arc<dyn PeerSource>>,
    ) -> Result<TorrentHandle> {
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let storage_info = StorageInfo::new(&metainfo, conf.download_dir.clone());

        let (alloc_tx, alloc_rx) = oneshot::channel();
        self.pending_allocations.lock().unwrap().push_back(alloc_tx);

        self.disk_tx
            .clone()
            .send(disk::Command::NewTorrent {
                id,
                info: storage_info.clone(),
                piece_hashes: metainfo.piece_hashes.clone(),
            })
            .await
            .map_err(|_| EngineError::DiskTaskGone)?;

        let (torrent, cmd_tx) = Torrent::new(
            id,
            &metainfo,
            storage_info,
            conf,
            self.client_id,
            self.disk_tx.clone(),
            alloc_rx,
            peer_source,
        );
        tokio::spawn(torrent.start());

        self.torrents.lock().unwrap().insert(id, TorrentEntry { cmd_tx: cmd_tx.clone() });

        Ok(TorrentHandle { id, cmd_tx })
    }

    fn cmd_tx(&self, id: TorrentId) -> Result<torrent::CommandSender> {
        self.torrents
            .lock()
            .unwrap()
            .get(&id)
            .map(|e| e.cmd_tx.clone())
            .ok_or(EngineError::InvalidTorrentId)
    }

    /// Shuts down and forgets a torrent.
    pub async fn remove(&self, id: TorrentId) -> Result<()> {
        let cmd_tx = self.cmd_tx(id)?;
        let _ = cmd_tx.send(torrent::Command::Shutdown).await;
        self.torrents.lock().unwrap().remove(&id);
        Ok(())
    }

    /// Returns a point-in-time stats snapshot for a torrent.
    pub async fn stats(&self, id: TorrentId) -> Result<TorrentStats> {
        let cmd_tx = self.cmd_tx(id)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        cmd_tx
            .send(torrent::Command::Stats(reply_tx))
            .await
            .map_err(|_| EngineError::TorrentGone)?;
        reply_rx.await.map_err(|_| EngineError::TorrentGone)
    }

    /// Atomically replaces a torrent's configuration.
    pub async fn update_config(&self, id: TorrentId, conf: TorrentConf) -> Result<()> {
        let cmd_tx = self.cmd_tx(id)?;
        cmd_tx
            .send(torrent::Command::UpdateConfig(conf))
            .await
            .map_err(|_| EngineError::TorrentGone)
    }

    /// Hands a batch of freshly discovered peer addresses to a torrent.
    pub async fn add_peers(&self, id: TorrentId, addrs: Vec<SocketAddr>) -> Result<()> {
        let cmd_tx = self.cmd_tx(id)?;
        cmd_tx
            .send(torrent::Command::AddPeers(addrs))
            .await
            .map_err(|_| EngineError::TorrentGone)
    }
}

/// A lightweight, cloneable reference to a single running torrent.
#[derive(Clone)]
pub struct TorrentHandle {
    id: TorrentId,
    cmd_tx: torrent::CommandSender,
}

impl TorrentHandle {
    pub fn id(&self) -> TorrentId {
        self.id
    }

    pub async fn add_peers(&self, addrs: Vec<SocketAddr>) -> Result<()> {
        self.cmd_tx
            .send(torrent::Command::AddPeers(addrs))
            .await
            .map_err(|_| EngineError::TorrentGone)
    }

    pub async fn update_config(&self, conf: TorrentConf) -> Result<()> {
        self.cmd_tx
            .send(torrent::Command::UpdateConfig(conf))
            .await
            .map_err(|_| EngineError::TorrentGone)
    }

    pub async fn stats(&self) -> Result<TorrentStats> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(torrent::Command::Stats(reply_tx))
            .await
            .map_err(|_| EngineError::TorrentGone)?;
        reply_rx.await.map_err(|_| EngineError::TorrentGone)
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.cmd_tx
            .send(torrent::Command::Shutdown)
            .await
            .map_err(|_| EngineError::TorrentGone)
    }
}
