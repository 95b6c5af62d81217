//! The read-only snapshot [`Engine::stats`](crate::Engine::stats) hands back
//! to an embedding application: progress, aggregate and per-peer rates,
//! swarm composition, and the piece state vector.

use std::net::SocketAddr;

use crate::{piece_picker::PieceStatus, Sha1Hash};

/// The lifecycle of a single piece, as reported to the outside world.
///
/// Mirrors [`crate::piece_picker::PieceStatus`] rather than re-exporting it
/// directly, so the piece/block manager's internal type can evolve without
/// widening the public API.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PieceState {
    Want,
    Inflight,
    Done,
}

impl From<PieceStatus> for PieceState {
    fn from(status: PieceStatus) -> Self {
        match status {
            PieceStatus::Want => Self::Want,
            PieceStatus::Inflight => Self::Inflight,
            PieceStatus::Done => Self::Done,
        }
    }
}

/// A snapshot of a single peer connection's observable state, as mirrored
/// by the scheduler from that session's events (the scheduler never reaches
/// into the session itself to produce this).
#[derive(Clone, Debug)]
pub struct PeerStats {
    pub addr: SocketAddr,
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    pub download_rate: f64,
    pub upload_rate: f64,
    pub downloaded: u64,
    pub uploaded: u64,
    pub pending_request_count: usize,
}

/// A point-in-time snapshot of a torrent's progress and swarm state.
#[derive(Clone, Debug)]
pub struct TorrentStats {
    pub info_hash: Sha1Hash,
    pub piece_count: usize,
    /// Percentage of pieces verified, in `[0.0, 100.0]`.
    pub progress_percent: f32,
    pub downloaded: u64,
    pub uploaded: u64,
    /// Sum of every connected peer's download rate.
    pub download_rate: f64,
    /// Sum of every connected peer's upload rate.
    pub upload_rate: f64,
    pub connected_peer_count: usize,
    /// Peers that advertise a complete bitfield (they have everything we
    /// could want).
    pub seeder_count: usize,
    /// Connected peers that are not full seeds.
    pub leecher_count: usize,
    pub is_endgame: bool,
    pub piece_states: Vec<PieceState>,
    pub peers: Vec<PeerStats>,
}

impl TorrentStats {
    pub(crate) fn progress_percent(done: usize, total: usize) -> f32 {
        if total == 0 {
            100.0
        } else {
            (done as f32 / total as f32) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_percent_is_zero_for_empty_torrent() {
        // a torrent with no pieces is nonsensical but must not divide by zero
        assert_eq!(TorrentStats::progress_percent(0, 0), 100.0);
    }

    #[test]
    fn progress_percent_scales_linearly() {
        assert_eq!(TorrentStats::progress_percent(1, 4), 25.0);
        assert_eq!(TorrentStats::progress_percent(4, 4), 100.0);
    }

    #[test]
    fn piece_state_conversion_preserves_variant() {
        assert_eq!(PieceState::from(PieceStatus::Want), PieceState::Want);
        assert_eq!(PieceState::from(PieceStatus::Inflight), PieceState::Inflight);
        assert_eq!(PieceState::from(PieceStatus::Done), PieceState::Done);
    }
}
