//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

use crate::PeerId;

/// The default client id.
pub const CLIENT_ID: &PeerId = b"pw-0000000000000000";

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user. It uses the default client id, [`CLIENT_ID`].
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf {
                client_id: *CLIENT_ID,
            },
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,
}

/// The piece-picking strategy a torrent uses to decide which piece to
/// download next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DownloadStrategy {
    /// Always pick the least-available piece among those a peer has that we
    /// don't, to maximize swarm-wide availability of rare pieces.
    RarestFirst,
    /// Download pieces strictly in index order. Mostly useful for streaming
    /// use cases.
    Sequential,
    /// Pick uniformly at random among the pieces a peer has that we don't.
    Random,
}

impl Default for DownloadStrategy {
    fn default() -> Self {
        Self::RarestFirst
    }
}

/// How the piece/block manager decides to enter endgame mode.
///
/// The source project's notes disagreed on whether this should be an
/// absolute block count or a percentage of the torrent's total block count;
/// rather than silently picking one, both forms are exposed (see
/// `DESIGN.md` for which one the engine defaults to).
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum EndgameThreshold {
    /// Enter endgame once at most this many blocks remain to be downloaded.
    Blocks(usize),
    /// Enter endgame once at most this fraction (0.0-1.0) of the torrent's
    /// total blocks remain to be downloaded.
    Percent(f32),
}

impl Default for EndgameThreshold {
    fn default() -> Self {
        // a small absolute count is cheap to reason about and doesn't
        // misbehave for tiny torrents the way a percentage can
        Self::Blocks(20)
    }
}

/// Configuration for a torrent.
///
/// The engine will have a default instance of this applied to all torrents by
/// default, but individual torrents may override this configuration.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which a torrent's files are placed upon download and
    /// from which they are seeded.
    pub download_dir: PathBuf,

    /// The minimum number of peers we want to keep in torrent at all times.
    pub min_requested_peer_count: usize,

    /// The max number of connected peers the torrent should have.
    pub max_connected_peer_count: usize,

    /// The max number of outbound connection attempts (dial + handshake) the
    /// swarm's dialer runs at once. Bounds the connection-attempt burst
    /// independently of `max_connected_peer_count`, so a large batch of
    /// freshly discovered addresses doesn't open hundreds of sockets in the
    /// same instant.
    pub max_concurrent_dials: usize,

    /// If the tracker doesn't provide a minimum announce interval, we default
    /// to announcing every 30 seconds.
    pub announce_interval: Duration,

    /// After this many attempts, the torrent stops announcing to a tracker.
    pub tracker_error_threshold: usize,

    /// Bounded dial timeout for outbound peer connections.
    pub dial_timeout: Duration,
    /// Deadline applied to each peer socket read.
    pub read_timeout: Duration,
    /// Deadline applied to each peer socket write.
    pub write_timeout: Duration,
    /// A peer session that has been silent for longer than this is reaped by
    /// the swarm's maintenance sweep.
    pub peer_inactivity_timeout: Duration,
    /// Cadence at which a peer session writer sends a keep-alive if the
    /// outbox has otherwise been idle.
    pub peer_heartbeat_interval: Duration,
    /// Depth of a peer session's outbound command queue.
    pub peer_outbox_backlog: usize,

    /// Number of peers unchoked purely based on upload/download rate, not
    /// counting the optimistic unchoke slot.
    pub upload_slots: usize,
    /// Cadence of the regular (non-optimistic) rechoke pass.
    pub rechoke_interval: Duration,
    /// Cadence of the optimistic unchoke pass.
    pub optimistic_unchoke_interval: Duration,

    /// The piece-picking strategy to use.
    pub download_strategy: DownloadStrategy,
    /// Hard floor on the per-peer in-flight request window.
    pub min_inflight_requests_per_peer: usize,
    /// Hard ceiling on the per-peer in-flight request window.
    pub max_inflight_requests_per_peer: usize,
    /// The time budget (in seconds-equivalent `Duration`) the window
    /// calculation assumes a request can be queued for, used as the `Qt` term
    /// in `W = clamp(ceil(rate * RTT * Qt / block_len), [min, max])`.
    pub request_queue_time: Duration,
    /// How long a block may stay INFLIGHT before it is unassigned and
    /// re-enqueued by the timeout sweep.
    pub request_timeout: Duration,

    /// When to enter endgame mode.
    pub endgame_threshold: EndgameThreshold,
    /// How many simultaneous owners a block may have once in endgame mode.
    pub endgame_duplicates_per_block: usize,
    /// A global cap on the number of outstanding duplicate requests across
    /// all peers for any single piece, enforced regardless of per-block
    /// duplicate limits. Zero disables the cap.
    pub max_duplicate_requests_per_piece: usize,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            // We always request at least 10 peers as anything less is a waste
            // of network round trip and it allows us to buffer up a bit more
            // than needed.
            min_requested_peer_count: 10,
            // This value is mostly picked for performance while keeping in mind
            // not to overwhelm the host.
            max_connected_peer_count: 50,
            max_concurrent_dials: 8,
            announce_interval: Duration::from_secs(60 * 60),
            tracker_error_threshold: 15,

            dial_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            peer_inactivity_timeout: Duration::from_secs(120),
            peer_heartbeat_interval: Duration::from_secs(90),
            peer_outbox_backlog: 128,

            upload_slots: 4,
            rechoke_interval: Duration::from_secs(10),
            optimistic_unchoke_interval: Duration::from_secs(30),

            download_strategy: DownloadStrategy::default(),
            min_inflight_requests_per_peer: 4,
            max_inflight_requests_per_peer: 500,
            request_queue_time: Duration::from_secs(3),
            request_timeout: Duration::from_secs(20),

            endgame_threshold: EndgameThreshold::default(),
            endgame_duplicates_per_block: 2,
            max_duplicate_requests_per_piece: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_download_strategy_is_rarest_first() {
        assert_eq!(DownloadStrategy::default(), DownloadStrategy::RarestFirst);
    }

    #[test]
    fn conf_new_uses_default_client_id() {
        let conf = Conf::new("/tmp/downloads");
        assert_eq!(conf.engine.client_id, *CLIENT_ID);
    }
}
