//! The scheduler: the central per-torrent event loop. Owns the piece/block
//! manager and a snapshot of every connected peer, decides what to request
//! from whom under the configured strategy, runs the choke policy, and
//! routes completed blocks to storage.
//!
//! Mirrors the single-owner discipline the rest of the engine follows: this
//! is the only task that ever mutates [`crate::piece_picker::PiecePicker`],
//! so it holds it directly with no lock. Peer sessions and the disk task are
//! reached only through their command/event channels.

pub mod stats;

use std::{
    cmp::Ordering,
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

use futures::{select, FutureExt};
use rand::Rng;
use tokio::{
    sync::{mpsc, oneshot, Semaphore},
    time,
};

use crate::{
    bitfield::BitfieldExt,
    conf::{DownloadStrategy, TorrentConf},
    disk,
    metainfo::Metainfo,
    peer,
    piece_picker::PiecePicker,
    storage_info::StorageInfo,
    Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash, TorrentId,
};
use stats::{PeerStats, TorrentStats};

/// A hook into the tracker/DHT collaborator that supplies fresh peer
/// addresses when a torrent's connected-peer count drops below its
/// low-water mark. Kept as a trait object so the core carries no
/// compile-time dependency on a concrete tracker or DHT implementation.
pub trait PeerSource: Send + Sync {
    /// Requests roughly `count` additional peer addresses for `id`. The
    /// implementor reports them back through [`TorrentHandle::add_peers`]
    /// (or the `Engine`-level equivalent) on its own schedule; this call
    /// does not block or return a value.
    fn request_peers(&self, id: TorrentId, count: usize);
}

/// Baseline round-trip estimate used in the per-peer window calculation,
/// until/unless a future revision tracks adaptive SRTT/RTO per peer (see
/// `DESIGN.md`).
const BASELINE_RTT: Duration = Duration::from_secs(1);

/// Cadence of the assignment top-up tick.
const ASSIGN_TICK: Duration = Duration::from_millis(200);

/// Cadence of the idle-peer reap / refill-request sweep.
const MAINTENANCE_TICK: Duration = Duration::from_secs(5);

pub(crate) type CommandSender = mpsc::Sender<Command>;
type CommandReceiver = mpsc::Receiver<Command>;

/// Depth of a torrent's own command queue (from the engine).
const TORRENT_COMMAND_QUEUE_DEPTH: usize = 16;

/// Work items the engine sends to a running torrent.
#[derive(Debug)]
pub(crate) enum Command {
    /// Admit and dial a batch of freshly discovered peer addresses.
    AddPeers(Vec<SocketAddr>),
    /// Atomically replace this torrent's configuration.
    UpdateConfig(TorrentConf),
    /// Request a stats snapshot.
    Stats(oneshot::Sender<TorrentStats>),
    Shutdown,
}

enum CommandOutcome {
    Continue,
    ConfigChanged,
    Shutdown,
}

/// What the scheduler remembers about a single connected peer. Refreshed
/// entirely from that peer's session events; the scheduler never reaches
/// back into the session itself.
struct PeerHandle {
    cmd_tx: peer::CommandSender,
    status: peer::Status,
    bitfield: Bitfield,
    inflight: HashSet<(PieceIndex, u32)>,
    down_rate: f64,
    up_rate: f64,
    downloaded: u64,
    uploaded: u64,
    last_activity: Instant,
}

/// The scheduler for a single torrent.
pub(crate) struct Torrent {
    id: TorrentId,
    info_hash: Sha1Hash,
    client_id: PeerId,
    storage_info: StorageInfo,
    conf: Arc<RwLock<Arc<TorrentConf>>>,
    picker: PiecePicker,
    peers: HashMap<SocketAddr, PeerHandle>,
    /// Blocks we've asked the disk task to read back for an in-flight
    /// REQUEST, keyed by who asked, so we can route the eventual
    /// `TorrentAlert::BlockRead` to the right peer(s) and drop it cleanly
    /// on a racing CANCEL.
    pending_serves: HashSet<(SocketAddr, PieceIndex, u32)>,
    optimistic_unchoke: Option<SocketAddr>,
    disk_tx: disk::CommandSender,
    alert_port: Option<disk::TorrentAlertReceiver>,
    alloc_rx: Option<oneshot::Receiver<disk::NewTorrentResult>>,
    event_tx: peer::EventSender,
    event_port: peer::EventReceiver,
    cmd_port: CommandReceiver,
    peer_source: Option<Arc<dyn PeerSource>>,
    /// Bounds concurrent outbound connection attempts; sized from
    /// `TorrentConf::max_concurrent_dials` at construction time.
    dial_semaphore: Arc<Semaphore>,
    downloaded: u64,
    uploaded: u64,
}

impl Torrent {
    /// Builds a torrent scheduler. The returned command sender is what the
    /// engine keeps to talk to it; `alloc_rx` resolves once the disk task
    /// has allocated (or failed to allocate) this torrent's storage.
    pub(crate) fn new(
        id: TorrentId,
        metainfo: &Metainfo,
        storage_info: StorageInfo,
        conf: TorrentConf,
        client_id: PeerId,
        disk_tx: disk::CommandSender,
        alloc_rx: oneshot::Receiver<disk::NewTorrentResult>,
        peer_source: Option<Arc<dyn PeerSource>>,
    ) -> (Self, CommandSender) {
        let piece_lens: Vec<u32> = (0..storage_info.piece_count)
            .map(|i| storage_info.piece_len(i).expect("index within piece_count"))
            .collect();
        let piece_hashes: Vec<[u8; 20]> = (0..metainfo.piece_count())
            .map(|i| metainfo.piece_hash(i).expect("index within piece_count"))
            .collect();
        let picker = PiecePicker::new(
            &piece_lens,
            &piece_hashes,
            conf.max_connected_peer_count,
            conf.endgame_threshold,
            conf.max_duplicate_requests_per_piece,
        );

        let (event_tx, event_port) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_port) = mpsc::channel(TORRENT_COMMAND_QUEUE_DEPTH);
        let dial_semaphore = Arc::new(Semaphore::new(conf.max_concurrent_dials));

        let torrent = Self {
            id,
            info_hash: metainfo.info_hash,
            client_id,
            storage_info,
            conf: Arc::new(RwLock::new(Arc::new(conf))),
            picker,
            peers: HashMap::new(),
            pending_serves: HashSet::new(),
            optimistic_unchoke: None,
            disk_tx,
            alert_port: None,
            alloc_rx: Some(alloc_rx),
            event_tx,
            event_port,
            cmd_port,
            peer_source,
            dial_semaphore,
            downloaded: 0,
            uploaded: 0,
        };
        (torrent, cmd_tx)
    }

    fn conf(&self) -> Arc<TorrentConf> {
        self.conf.read().unwrap().clone()
    }

    /// Runs the torrent to completion: waits for storage allocation, then
    /// drives the main event loop until shut down or fatally errored.
    pub(crate) async fn start(mut self) {
        log::info!("Torrent {} starting", self.id);
        self.run().await;
        log::info!("Torrent {} stopped", self.id);
    }

    async fn run(&mut self) {
        let conf = self.conf();
        let mut assign_tick = time::interval(ASSIGN_TICK);
        let mut timeout_tick = time::interval(timeout_sweep_period(&conf));
        let mut rechoke_tick = time::interval(conf.rechoke_interval);
        let mut optimistic_tick = time::interval(conf.optimistic_unchoke_interval);
        let mut maintenance_tick = time::interval(MAINTENANCE_TICK);

        loop {
            let cmd_fut = self.cmd_port.recv().fuse();
            let event_fut = self.event_port.recv().fuse();
            let alert_fut = next_alert(&mut self.alert_port).fuse();
            let alloc_fut = next_alloc(&mut self.alloc_rx).fuse();
            let assign_fut = assign_tick.tick().fuse();
            let timeout_fut = timeout_tick.tick().fuse();
            let rechoke_fut = rechoke_tick.tick().fuse();
            let optimistic_fut = optimistic_tick.tick().fuse();
            let maintenance_fut = maintenance_tick.tick().fuse();
            futures::pin_mut!(
                cmd_fut,
                event_fut,
                alert_fut,
                alloc_fut,
                assign_fut,
                timeout_fut,
                rechoke_fut,
                optimistic_fut,
                maintenance_fut
            );

            select! {
                cmd = cmd_fut => {
                    match cmd {
                        Some(cmd) => match self.handle_command(cmd) {
                            CommandOutcome::Shutdown => {
                                log::info!("Torrent {} received shutdown command", self.id);
                                return;
                            }
                            CommandOutcome::ConfigChanged => {
                                let conf = self.conf();
                                rechoke_tick = time::interval(conf.rechoke_interval);
                                optimistic_tick = time::interval(conf.optimistic_unchoke_interval);
                                timeout_tick = time::interval(timeout_sweep_period(&conf));
                            }
                            CommandOutcome::Continue => {}
                        },
                        None => {
                            log::info!("Torrent {} command channel closed", self.id);
                            return;
                        }
                    }
                }
                event = event_fut => {
                    match event {
                        Some(event) => self.handle_event(event),
                        None => {
                            log::warn!("Torrent {} event channel closed unexpectedly", self.id);
                            return;
                        }
                    }
                }
                alert = alert_fut => {
                    if let Some(alert) = alert {
                        self.handle_alert(alert);
                    }
                }
                alloc = alloc_fut => {
                    if let Some(result) = alloc {
                        self.alloc_rx = None;
                        match result {
                            Ok(Ok(allocation)) => {
                                log::info!("Torrent {} storage allocated", self.id);
                                self.alert_port = Some(allocation.alert_port);
                            }
                            Ok(Err(e)) => {
                                log::error!(
                                    "Torrent {} failed to allocate storage: {}",
                                    self.id,
                                    e
                                );
                                return;
                            }
                            Err(_) => {
                                log::error!(
                                    "Torrent {} disk task gone before allocating storage",
                                    self.id
                                );
                                return;
                            }
                        }
                    }
                }
                _ = assign_fut => self.assign_work(),
                _ = timeout_fut => self.sweep_timeouts(),
                _ = rechoke_fut => self.rechoke(),
                _ = optimistic_fut => self.pick_optimistic_unchoke(),
                _ = maintenance_fut => self.run_maintenance(),
            }
        }
    }

    // -- command handling ------------------------------------------------

    fn handle_command(&mut self, cmd: Command) -> CommandOutcome {
        match cmd {
            Command::AddPeers(addrs) => {
                for addr in addrs {
                    self.admit_peer(addr);
                }
                CommandOutcome::Continue
            }
            Command::UpdateConfig(new_conf) => {
                let strategy_changed = self.conf().download_strategy != new_conf.download_strategy;
                let becomes_sequential = new_conf.download_strategy == DownloadStrategy::Sequential;
                *self.conf.write().unwrap() = Arc::new(new_conf);
                if strategy_changed && becomes_sequential {
                    self.picker.reset_sequential_cursor();
                }
                CommandOutcome::ConfigChanged
            }
            Command::Stats(reply) => {
                let _ = reply.send(self.build_stats());
                CommandOutcome::Continue
            }
            Command::Shutdown => CommandOutcome::Shutdown,
        }
    }

    fn build_stats(&self) -> TorrentStats {
        let piece_states: Vec<stats::PieceState> =
            self.picker.piece_statuses().into_iter().map(Into::into).collect();
        let done = piece_states.iter().filter(|s| **s == stats::PieceState::Done).count();

        let mut peers = Vec::with_capacity(self.peers.len());
        let mut download_rate = 0.0;
        let mut upload_rate = 0.0;
        let mut seeder_count = 0;
        let mut leecher_count = 0;
        let piece_count = self.picker.piece_count();
        for (addr, peer) in &self.peers {
            download_rate += peer.down_rate;
            upload_rate += peer.up_rate;
            if peer.bitfield.count() >= piece_count {
                seeder_count += 1;
            } else {
                leecher_count += 1;
            }
            peers.push(PeerStats {
                addr: *addr,
                am_choking: peer.status.am_choking,
                am_interested: peer.status.am_interested,
                peer_choking: peer.status.peer_choking,
                peer_interested: peer.status.peer_interested,
                download_rate: peer.down_rate,
                upload_rate: peer.up_rate,
                downloaded: peer.downloaded,
                uploaded: peer.uploaded,
                pending_request_count: peer.inflight.len(),
            });
        }

        TorrentStats {
            info_hash: self.info_hash,
            piece_count,
            progress_percent: TorrentStats::progress_percent(done, piece_count),
            downloaded: self.downloaded,
            uploaded: self.uploaded,
            download_rate,
            upload_rate,
            connected_peer_count: self.peers.len(),
            seeder_count,
            leecher_count,
            is_endgame: self.picker.is_endgame(),
            piece_states,
            peers,
        }
    }

    // -- swarm admission --------------------------------------------------

    fn admit_peer(&mut self, addr: SocketAddr) {
        let conf = self.conf();
        if self.peers.contains_key(&addr) {
            log::debug!("Torrent {} already connected to peer {}", self.id, addr);
            return;
        }
        if self.peers.len() >= conf.max_connected_peer_count {
            log::debug!("Torrent {} at peer capacity, dropping {}", self.id, addr);
            return;
        }
        let (session, cmd_tx) = peer::PeerSession::outbound(
            addr,
            self.client_id,
            self.info_hash,
            conf,
            self.event_tx.clone(),
            self.dial_semaphore.clone(),
        );
        self.peers.insert(
            addr,
            PeerHandle {
                cmd_tx,
                status: peer::Status::default(),
                bitfield: Bitfield::repeat(false, self.picker.piece_count()),
                inflight: HashSet::new(),
                down_rate: 0.0,
                up_rate: 0.0,
                downloaded: 0,
                uploaded: 0,
                last_activity: Instant::now(),
            },
        );
        tokio::spawn(session.start());
    }

    fn run_maintenance(&mut self) {
        let conf = self.conf();
        let now = Instant::now();
        let idle: Vec<SocketAddr> = self
            .peers
            .iter()
            .filter(|(_, p)| now.duration_since(p.last_activity) > conf.peer_inactivity_timeout)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in idle {
            log::info!("Torrent {} reaping idle peer {}", self.id, addr);
            if let Some(peer) = self.peers.get(&addr) {
                send_cmd(&peer.cmd_tx, &addr, peer::Command::Shutdown);
            }
        }
        if self.peers.len() < conf.min_requested_peer_count {
            if let Some(source) = &self.peer_source {
                let needed = conf.min_requested_peer_count - self.peers.len();
                source.request_peers(self.id, needed);
            }
        }
    }

    // -- peer events --------------------------------------------------------

    fn touch(&mut self, addr: SocketAddr) {
        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.last_activity = Instant::now();
        }
    }

    fn handle_event(&mut self, event: peer::Event) {
        use peer::Event;
        match event {
            Event::Connected { addr, peer_id } => {
                self.touch(addr);
                log::info!(
                    "Torrent {} connected to peer {} ({})",
                    self.id,
                    addr,
                    hex::encode(peer_id)
                );
                if self.picker.have().count() > 0 {
                    if let Some(peer) = self.peers.get(&addr) {
                        send_cmd(
                            &peer.cmd_tx,
                            &addr,
                            peer::Command::Bitfield(self.picker.have().clone()),
                        );
                    }
                }
            }
            Event::Bitfield { addr, bitfield } => {
                self.touch(addr);
                self.picker.on_peer_bitfield(&bitfield);
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.bitfield = bitfield;
                }
                self.update_interest(addr);
            }
            Event::Have { addr, piece_index } => {
                self.touch(addr);
                self.picker.on_peer_have(piece_index);
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.bitfield.set_piece(piece_index);
                }
                self.update_interest(addr);
            }
            Event::Choke { addr } => {
                self.touch(addr);
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.status.peer_choking = true;
                }
            }
            Event::Unchoke { addr } => {
                self.touch(addr);
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.status.peer_choking = false;
                }
                self.top_up_peer(addr);
            }
            Event::Interested { addr } => {
                self.touch(addr);
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.status.peer_interested = true;
                }
            }
            Event::NotInterested { addr } => {
                self.touch(addr);
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.status.peer_interested = false;
                }
            }
            Event::Block { addr, block, data } => {
                self.touch(addr);
                self.downloaded += data.len() as u64;
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.downloaded += data.len() as u64;
                    peer.inflight.remove(&(block.piece_index, block.offset));
                }
                let redundant = self.picker.mark_block_complete(addr, block.piece_index, block.offset);
                for other in redundant {
                    if let Some(peer) = self.peers.get_mut(&other) {
                        peer.inflight.remove(&(block.piece_index, block.offset));
                        send_cmd(&peer.cmd_tx, &other, peer::Command::Cancel(block));
                    }
                }
                send_disk_cmd(
                    &self.disk_tx,
                    disk::Command::WriteBlock { id: self.id, info: block, data },
                );
                for piece in self.picker.pieces_ready_for_verify() {
                    log::debug!("Torrent {} piece {} ready for verification", self.id, piece);
                }
            }
            Event::Request { addr, block } => {
                self.touch(addr);
                self.handle_request(addr, block);
            }
            Event::Cancel { addr, block } => {
                self.touch(addr);
                self.pending_serves.remove(&(addr, block.piece_index, block.offset));
            }
            Event::RateUpdate { addr, down_rate, up_rate } => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.down_rate = down_rate;
                    peer.up_rate = up_rate;
                }
            }
            Event::Gone { addr, cause } => {
                if let Some(peer) = self.peers.remove(&addr) {
                    self.picker.on_peer_gone(&peer.bitfield);
                    for (piece, offset) in peer.inflight {
                        self.picker.unassign_block(addr, piece, offset);
                    }
                    self.pending_serves.retain(|(a, _, _)| *a != addr);
                    if self.optimistic_unchoke == Some(addr) {
                        self.optimistic_unchoke = None;
                    }
                    log::info!("Torrent {} peer {} gone: {:?}", self.id, addr, cause);
                }
            }
        }
    }

    fn handle_request(&mut self, addr: SocketAddr, block: BlockInfo) {
        let peer = match self.peers.get(&addr) {
            Some(p) => p,
            None => return,
        };
        if peer.status.am_choking {
            log::trace!("Torrent {} ignoring request from choked peer {}", self.id, addr);
            return;
        }
        if !self.picker.have().has(block.piece_index) {
            log::trace!(
                "Torrent {} ignoring request for piece {} we don't have",
                self.id,
                block.piece_index
            );
            return;
        }
        if send_disk_cmd(&self.disk_tx, disk::Command::ReadBlock { id: self.id, block }) {
            self.pending_serves.insert((addr, block.piece_index, block.offset));
        }
    }

    fn update_interest(&mut self, addr: SocketAddr) {
        let wants = {
            let peer = match self.peers.get(&addr) {
                Some(p) => p,
                None => return,
            };
            let have = self.picker.have();
            (0..peer.bitfield.len().min(have.len())).any(|i| peer.bitfield.has(i) && !have.has(i))
        };
        let peer = match self.peers.get_mut(&addr) {
            Some(p) => p,
            None => return,
        };
        if wants && !peer.status.am_interested {
            peer.status.am_interested = true;
            send_cmd(&peer.cmd_tx, &addr, peer::Command::Interested);
        } else if !wants && peer.status.am_interested {
            peer.status.am_interested = false;
            send_cmd(&peer.cmd_tx, &addr, peer::Command::NotInterested);
        }
    }

    // -- disk alerts ------------------------------------------------------

    fn handle_alert(&mut self, alert: disk::TorrentAlert) {
        use disk::TorrentAlert;
        match alert {
            TorrentAlert::BatchWrite { piece_index, result } => match result {
                Ok(batch) => {
                    self.picker.mark_piece_verified(piece_index, batch.is_piece_valid);
                    if batch.is_piece_valid {
                        log::info!("Torrent {} piece {} verified", self.id, piece_index);
                        self.broadcast_have(piece_index);
                        if self.picker.is_complete() {
                            log::info!("Torrent {} download complete", self.id);
                        }
                    } else {
                        log::warn!(
                            "Torrent {} piece {} failed hash check, reverted",
                            self.id,
                            piece_index
                        );
                    }
                }
                Err(e) => {
                    log::error!(
                        "Torrent {} piece {} write failed: {}",
                        self.id,
                        piece_index,
                        e
                    );
                    self.picker.mark_piece_verified(piece_index, false);
                }
            },
            TorrentAlert::PieceRead { piece_index, result } => match result {
                Ok(ok) => self.picker.mark_piece_verified(piece_index, ok),
                Err(e) => log::error!(
                    "Torrent {} recheck of piece {} failed: {}",
                    self.id,
                    piece_index,
                    e
                ),
            },
            TorrentAlert::BlockRead { block, result } => match result {
                Ok(data) => {
                    let addrs: Vec<SocketAddr> = self
                        .pending_serves
                        .iter()
                        .filter(|(_, piece, offset)| {
                            *piece == block.piece_index && *offset == block.offset
                        })
                        .map(|(addr, _, _)| *addr)
                        .collect();
                    for addr in addrs {
                        self.pending_serves.remove(&(addr, block.piece_index, block.offset));
                        if let Some(peer) = self.peers.get_mut(&addr) {
                            peer.uploaded += data.len() as u64;
                            self.uploaded += data.len() as u64;
                            send_cmd(
                                &peer.cmd_tx,
                                &addr,
                                peer::Command::Piece {
                                    piece_index: block.piece_index,
                                    offset: block.offset,
                                    data: data.clone(),
                                },
                            );
                        }
                    }
                }
                Err(e) => log::warn!(
                    "Torrent {} failed to read block {:?} for serving: {}",
                    self.id,
                    block,
                    e
                ),
            },
        }
    }

    fn broadcast_have(&mut self, piece_index: PieceIndex) {
        for (addr, peer) in self.peers.iter_mut() {
            if !peer.bitfield.has(piece_index) {
                send_cmd(&peer.cmd_tx, addr, peer::Command::Have(piece_index));
            }
        }
    }

    // -- work assignment ----------------------------------------------------

    fn assign_work(&mut self) {
        let addrs: Vec<SocketAddr> = self
            .peers
            .iter()
            .filter(|(_, p)| !p.status.peer_choking)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in addrs {
            self.top_up_peer(addr);
        }
    }

    fn window(&self, peer: &PeerHandle, conf: &TorrentConf) -> usize {
        let rate = peer.down_rate.max(0.0);
        let want = (rate * BASELINE_RTT.as_secs_f64() * conf.request_queue_time.as_secs_f64()
            / crate::BLOCK_LEN as f64)
            .ceil() as usize;
        want.clamp(conf.min_inflight_requests_per_peer, conf.max_inflight_requests_per_peer)
    }

    fn top_up_peer(&mut self, addr: SocketAddr) {
        let conf = self.conf();
        let (bitfield, capacity) = match self.peers.get(&addr) {
            Some(peer) if !peer.status.peer_choking => {
                let target = self.window(peer, &conf);
                let current = peer.inflight.len();
                if current >= target {
                    return;
                }
                (peer.bitfield.clone(), target - current)
            }
            _ => return,
        };

        let assigned = if self.picker.is_endgame() {
            self.picker.assign_endgame_blocks(addr, &bitfield, capacity, conf.endgame_duplicates_per_block)
        } else {
            let mut out = self.picker.assign_in_progress_blocks(addr, &bitfield, capacity);
            if out.len() < capacity {
                let remaining = capacity - out.len();
                let more = match conf.download_strategy {
                    DownloadStrategy::RarestFirst => {
                        let order = self.picker.rarest_first_order(&bitfield);
                        self.picker.assign_blocks_from_list(addr, &order, remaining)
                    }
                    DownloadStrategy::Sequential => {
                        self.picker.assign_sequential_blocks(addr, &bitfield, remaining)
                    }
                    DownloadStrategy::Random => {
                        self.picker.assign_random_blocks(addr, &bitfield, remaining)
                    }
                };
                out.extend(more);
            }
            out
        };

        if assigned.is_empty() {
            return;
        }
        if let Some(peer) = self.peers.get_mut(&addr) {
            for block in &assigned {
                peer.inflight.insert((block.piece_index, block.offset));
            }
            for block in assigned {
                send_cmd(&peer.cmd_tx, &addr, peer::Command::Request(block));
            }
        }
    }

    fn sweep_timeouts(&mut self) {
        let conf = self.conf();
        let expired = self.picker.expired_assignments(conf.request_timeout);
        if expired.is_empty() {
            return;
        }
        for (addr, block) in expired {
            self.picker.unassign_block(addr, block.piece_index, block.offset);
            if let Some(peer) = self.peers.get_mut(&addr) {
                peer.inflight.remove(&(block.piece_index, block.offset));
            }
            log::debug!(
                "Torrent {} timed out request for piece {} block {} from {}",
                self.id,
                block.piece_index,
                block.offset,
                addr
            );
        }
        self.assign_work();
    }

    // -- choke policy ---------------------------------------------------

    fn rechoke(&mut self) {
        let conf = self.conf();
        let is_seed = self.picker.is_complete();
        let mut candidates: Vec<SocketAddr> = self
            .peers
            .iter()
            .filter(|(_, p)| p.status.peer_interested)
            .map(|(addr, _)| *addr)
            .collect();
        candidates.sort_by(|a, b| {
            let ra = self.peers.get(a).map(|p| if is_seed { p.up_rate } else { p.down_rate }).unwrap_or(0.0);
            let rb = self.peers.get(b).map(|p| if is_seed { p.up_rate } else { p.down_rate }).unwrap_or(0.0);
            rb.partial_cmp(&ra).unwrap_or(Ordering::Equal)
        });
        let mut keep: HashSet<SocketAddr> = candidates.into_iter().take(conf.upload_slots).collect();
        if let Some(opt) = self.optimistic_unchoke {
            if self.peers.contains_key(&opt) {
                keep.insert(opt);
            }
        }

        let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
        for addr in addrs {
            let should_unchoke = keep.contains(&addr);
            if let Some(peer) = self.peers.get_mut(&addr) {
                if should_unchoke && peer.status.am_choking {
                    peer.status.am_choking = false;
                    send_cmd(&peer.cmd_tx, &addr, peer::Command::Unchoke);
                } else if !should_unchoke && !peer.status.am_choking {
                    peer.status.am_choking = true;
                    send_cmd(&peer.cmd_tx, &addr, peer::Command::Choke);
                }
            }
        }
    }

    fn pick_optimistic_unchoke(&mut self) {
        let candidates: Vec<SocketAddr> = self
            .peers
            .iter()
            .filter(|(addr, p)| {
                p.status.peer_interested && p.status.am_choking && Some(**addr) != self.optimistic_unchoke
            })
            .map(|(addr, _)| *addr)
            .collect();
        if candidates.is_empty() {
            return;
        }
        let pick = candidates[rand::thread_rng().gen_range(0..candidates.len())];
        self.optimistic_unchoke = Some(pick);
        if let Some(peer) = self.peers.get_mut(&pick) {
            peer.status.am_choking = false;
            send_cmd(&peer.cmd_tx, &pick, peer::Command::Unchoke);
        }
    }
}

fn timeout_sweep_period(conf: &TorrentConf) -> Duration {
    (conf.request_timeout / 4).max(Duration::from_secs(1))
}

fn send_cmd(cmd_tx: &peer::CommandSender, addr: &SocketAddr, cmd: peer::Command) {
    if let Err(e) = cmd_tx.try_send(cmd) {
        log::warn!("Dropping command to peer {}: {}", addr, e);
    }
}

fn send_disk_cmd(disk_tx: &disk::CommandSender, cmd: disk::Command) -> bool {
    match disk_tx.try_send(cmd) {
        Ok(()) => true,
        Err(e) => {
            log::warn!("Dropping disk command: {}", e);
            false
        }
    }
}

/// Polls the per-torrent disk alert channel, or never resolves if it
/// hasn't been allocated yet.
async fn next_alert(port: &mut Option<disk::TorrentAlertReceiver>) -> Option<disk::TorrentAlert> {
    match port {
        Some(p) => p.recv().await,
        None => futures::future::pending().await,
    }
}

/// Polls the one-shot storage allocation result without consuming it, so a
/// `select!` branch that loses the race can safely retry on the next loop
/// iteration. Resolves to `None` forever once the caller clears `rx`.
async fn next_alloc(
    rx: &mut Option<oneshot::Receiver<disk::NewTorrentResult>>,
) -> Option<std::result::Result<disk::NewTorrentResult, oneshot::error::RecvError>> {
    match rx {
        Some(r) => Some(r.await),
        None => futures::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_sweep_period_has_a_floor() {
        let mut conf = TorrentConf::new("/tmp");
        conf.request_timeout = Duration::from_millis(100);
        assert_eq!(timeout_sweep_period(&conf), Duration::from_secs(1));
    }

    #[test]
    fn timeout_sweep_period_scales_with_request_timeout() {
        let mut conf = TorrentConf::new("/tmp");
        conf.request_timeout = Duration::from_secs(40);
        assert_eq!(timeout_sweep_period(&conf), Duration::from_secs(10));
    }
}
