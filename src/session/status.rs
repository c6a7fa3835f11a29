//! Status snapshots
//!
//! A [`TorrentStatus`] is built on the engine task from the transfer's
//! counters, its filter and its download queue, then handed to the caller as
//! an owned value. The piece bitmap is shared with the engine rather than
//! copied; the engine copies on write, so a snapshot never changes.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::storage::{DownloadQueue, PieceFilter};

/// Lifecycle state of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TorrentState {
    /// Waiting for its turn to check existing files
    QueuedForChecking,
    /// Hashing existing files
    CheckingFiles,
    /// Checked, waiting for the first tracker response
    ConnectingToTracker,
    /// Fetching the info dictionary from peers
    DownloadingMetadata,
    /// Downloading wanted pieces
    Downloading,
    /// Every wanted piece is present, some pieces are filtered
    Finished,
    /// Every piece is present
    Seeding,
}

impl TorrentState {
    /// Whether the transfer is past checking and metadata
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TorrentState::ConnectingToTracker
                | TorrentState::Downloading
                | TorrentState::Finished
                | TorrentState::Seeding
        )
    }
}

impl std::fmt::Display for TorrentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TorrentState::QueuedForChecking => "queued for checking",
            TorrentState::CheckingFiles => "checking files",
            TorrentState::ConnectingToTracker => "connecting to tracker",
            TorrentState::DownloadingMetadata => "downloading metadata",
            TorrentState::Downloading => "downloading",
            TorrentState::Finished => "finished",
            TorrentState::Seeding => "seeding",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of a transfer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TorrentStatus {
    pub state: TorrentState,
    pub paused: bool,
    /// Checking progress while checking, otherwise wanted bytes done / wanted bytes
    pub progress: f32,
    /// Why the transfer stopped, if it did on its own
    pub error: Option<String>,
    /// Time until the next announce
    pub next_announce: Duration,
    /// Announce interval in effect
    pub announce_interval: Duration,
    /// Tracker currently announced to, empty if none yet
    pub current_tracker: String,

    /// Bytes downloaded this session, payload plus protocol
    pub total_download: u64,
    /// Bytes uploaded this session, payload plus protocol
    pub total_upload: u64,
    /// Payload bytes downloaded over the transfer's lifetime
    pub total_payload_download: u64,
    /// Payload bytes uploaded over the transfer's lifetime
    pub total_payload_upload: u64,
    /// Bytes of pieces that failed their hash check
    pub total_failed_bytes: u64,

    pub download_rate: f32,
    pub upload_rate: f32,
    pub download_payload_rate: f32,
    pub upload_payload_rate: f32,

    pub num_peers: usize,
    pub num_seeds: usize,
    /// Seeds according to the tracker, -1 if it did not say
    pub num_complete: i32,
    /// Leechers according to the tracker, -1 if it did not say
    pub num_incomplete: i32,

    /// Completed pieces
    #[serde(skip)]
    pub pieces: Arc<Vec<bool>>,
    /// Number of completed pieces
    pub num_pieces: usize,
    /// Bytes present, filtered pieces included
    pub total_done: u64,
    /// Bytes present in wanted pieces
    pub total_wanted_done: u64,
    /// Size of the wanted pieces
    pub total_wanted: u64,
    /// Copies of the rarest wanted piece among peers, plus the fraction of
    /// wanted pieces with more copies than that
    pub distributed_copies: f32,
    /// Block size in bytes
    pub block_size: u32,
}

/// Byte accounting derived from completion, filter and queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ByteTotals {
    pub total_done: u64,
    pub total_wanted_done: u64,
    pub total_wanted: u64,
}

impl ByteTotals {
    /// Fraction of wanted bytes present; nothing wanted counts as done
    pub fn progress(&self) -> f32 {
        if self.total_wanted == 0 {
            return 1.0;
        }
        (self.total_wanted_done as f64 / self.total_wanted as f64) as f32
    }
}

/// Count present bytes: whole completed pieces plus finished blocks of queued ones
pub fn byte_totals(have: &[bool], filter: &PieceFilter, queue: &DownloadQueue) -> ByteTotals {
    let layout = queue.layout();
    let mut totals = ByteTotals::default();
    for piece in 0..layout.piece_count() {
        let size = layout.piece_size(piece as u32);
        let done = if have.get(piece).copied().unwrap_or(false) {
            size
        } else {
            queue.finished_bytes(piece as u32)
        };
        totals.total_done += done;
        if filter.is_wanted(piece) {
            totals.total_wanted += size;
            totals.total_wanted_done += done;
        }
    }
    totals
}

/// Distributed copies over the wanted pieces
///
/// `availability[i]` is the number of peers holding piece `i`. The integer
/// part is the lowest count among wanted pieces, the fraction is the share of
/// wanted pieces above it. Zero with no wanted pieces or no peers.
pub fn distributed_copies(availability: &[u32], filter: &PieceFilter, num_peers: usize) -> f32 {
    if num_peers == 0 {
        return 0.0;
    }
    let wanted: Vec<u32> = availability
        .iter()
        .enumerate()
        .filter(|(piece, _)| filter.is_wanted(*piece))
        .map(|(_, &count)| count)
        .collect();
    let Some(&min) = wanted.iter().min() else {
        return 0.0;
    };
    let above = wanted.iter().filter(|&&count| count > min).count();
    min as f32 + above as f32 / wanted.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::BlockLayout;
    use std::net::SocketAddr;

    /// 4 pieces of 32 bytes, 16-byte blocks
    fn queue() -> DownloadQueue {
        DownloadQueue::new(BlockLayout::new(16, 32, 128))
    }

    fn filter() -> PieceFilter {
        PieceFilter::new(4, vec![0..4])
    }

    #[test]
    fn test_distributed_copies_example() {
        let copies = distributed_copies(&[3, 3, 2, 4], &filter(), 4);
        assert!((copies - 2.75).abs() < f32::EPSILON);
    }

    #[test]
    fn test_distributed_copies_ignores_filtered_pieces() {
        let mut filter = filter();
        filter.set_piece(2, false).unwrap();
        // wanted counts [3, 3, 4]: min 3, one piece above
        let copies = distributed_copies(&[3, 3, 2, 4], &filter, 4);
        assert!((copies - (3.0 + 1.0 / 3.0)).abs() < 1e-6);
    }

    #[test]
    fn test_distributed_copies_zero_cases() {
        let mut filter = filter();
        assert_eq!(distributed_copies(&[1, 1, 1, 1], &filter, 0), 0.0);
        filter.set_pieces(&[false; 4]).unwrap();
        assert_eq!(distributed_copies(&[1, 1, 1, 1], &filter, 2), 0.0);
        assert_eq!(distributed_copies(&[], &PieceFilter::default(), 2), 0.0);
    }

    #[test]
    fn test_byte_totals_counts_partial_pieces() {
        let mut queue = queue();
        let peer: SocketAddr = "10.0.0.1:1".parse().unwrap();
        queue.begin_request(1, 0, peer).unwrap();
        queue.mark_finished(1, 0).unwrap();

        let totals = byte_totals(&[true, false, false, false], &filter(), &queue);
        assert_eq!(totals.total_done, 48);
        assert_eq!(totals.total_wanted_done, 48);
        assert_eq!(totals.total_wanted, 128);
        assert!((totals.progress() - 0.375).abs() < f32::EPSILON);
    }

    #[test]
    fn test_filter_toggle_keeps_total_done() {
        let queue = queue();
        let have = [true, true, false, false];
        let mut filter = filter();
        let before = byte_totals(&have, &filter, &queue);

        filter.set_piece(0, false).unwrap();
        let filtered = byte_totals(&have, &filter, &queue);
        assert_eq!(filtered.total_done, before.total_done);
        assert_eq!(filtered.total_wanted, 96);
        assert_eq!(filtered.total_wanted_done, 32);

        filter.set_piece(0, true).unwrap();
        assert_eq!(byte_totals(&have, &filter, &queue), before);
    }

    #[test]
    fn test_byte_totals_invariants_hold() {
        let mut queue = queue();
        let peer: SocketAddr = "10.0.0.1:1".parse().unwrap();
        queue.begin_request(3, 1, peer).unwrap();
        queue.mark_finished(3, 1).unwrap();
        let mut filter = filter();
        filter.set_pieces(&[true, false, true, false]).unwrap();

        for have in [[false; 4], [true, true, false, false], [true; 4]] {
            let totals = byte_totals(&have, &filter, &queue);
            assert!(totals.total_wanted_done <= totals.total_wanted);
            assert!(totals.total_wanted_done <= totals.total_done);
        }
    }

    #[test]
    fn test_nothing_wanted_is_complete() {
        let totals = ByteTotals::default();
        assert_eq!(totals.progress(), 1.0);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(TorrentState::CheckingFiles.to_string(), "checking files");
        assert!(TorrentState::Seeding.is_active());
        assert!(!TorrentState::DownloadingMetadata.is_active());
    }
}
