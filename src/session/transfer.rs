//! Per-transfer state owned by the engine
//!
//! Nothing outside the engine task holds a reference to a [`Transfer`];
//! handles only ever see copies produced by its query methods.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::{SessionConfig, TransferLimits};
use crate::peer::PeerRegistry;
use crate::session::command::TransferKey;
use crate::session::stats::TransferStats;
use crate::session::status::{byte_totals, distributed_copies, TorrentState, TorrentStatus};
use crate::session::{AddTransferParams, TransferSource};
use crate::storage::{BlockLayout, DownloadQueue, PieceFilter, PieceState, ResumeData, SharedStorage, StorageConstructor};
use crate::torrent::{InfoHash, TorrentInfo};
use crate::tracker::{AnnounceEntry, AnnounceEvent, AnnounceRequest, TrackerState};

/// One transfer in the engine's table
pub struct Transfer {
    pub(crate) info_hash: InfoHash,
    pub(crate) generation: u64,
    pub(crate) name: String,
    pub(crate) info: Option<Arc<TorrentInfo>>,
    pub(crate) state: TorrentState,
    pub(crate) paused: bool,
    pub(crate) error: Option<String>,
    pub(crate) save_path: PathBuf,
    storage_constructor: StorageConstructor,
    pub(crate) storage: Option<SharedStorage>,
    /// Completed pieces; copied on write so snapshots stay fixed
    pub(crate) have: Arc<Vec<bool>>,
    pub(crate) filter: PieceFilter,
    pub(crate) queue: DownloadQueue,
    pub(crate) peers: PeerRegistry,
    pub(crate) trackers: TrackerState,
    pub(crate) limits: TransferLimits,
    pub(crate) interface: Option<String>,
    pub(crate) stats: TransferStats,
    /// Payload totals carried over from resume data
    uploaded_before: u64,
    downloaded_before: u64,
    pub(crate) total_failed_bytes: u64,
    /// Pieces handed to storage for hashing
    pub(crate) hashing: HashSet<u32>,
    pub(crate) check_progress: f32,
    /// Resume data whose piece claims wait for metadata or checking
    pub(crate) pending_resume: Option<ResumeData>,
    block_size: u32,
}

impl Transfer {
    /// Build a transfer from add parameters and optional decoded resume data
    pub(crate) fn new(
        generation: u64,
        params: AddTransferParams,
        resume: Option<ResumeData>,
        config: &SessionConfig,
        now: Instant,
    ) -> Self {
        let info_hash = params.info_hash();
        let (name, info, trackers) = match params.source {
            TransferSource::Torrent(info) => {
                let trackers = AnnounceEntry::from_tiers(&info.announce_tiers);
                (info.name.clone(), Some(info), trackers)
            }
            TransferSource::Magnet(magnet) => (magnet.name(), None, magnet.announce_entries()),
        };

        let mut transfer = Self {
            info_hash,
            generation,
            name,
            info: None,
            state: TorrentState::DownloadingMetadata,
            paused: params.paused,
            error: None,
            save_path: params.save_path,
            storage_constructor: params.storage,
            storage: None,
            have: Arc::new(Vec::new()),
            filter: PieceFilter::default(),
            queue: DownloadQueue::default(),
            peers: PeerRegistry::default(),
            trackers: TrackerState::new(
                trackers,
                config.default_announce_interval,
                config.tracker_retry_interval,
                now,
            ),
            limits: TransferLimits::default(),
            interface: None,
            stats: TransferStats::default(),
            uploaded_before: 0,
            downloaded_before: 0,
            total_failed_bytes: 0,
            hashing: HashSet::new(),
            check_progress: 0.0,
            pending_resume: None,
            block_size: config.block_size,
        };

        if let Some(resume) = resume {
            transfer.apply_resume_settings(&resume, now);
            transfer.pending_resume = Some(resume);
        }
        if let Some(info) = info {
            transfer.set_metadata(info);
        }
        transfer
    }

    /// Handle key of this transfer
    pub(crate) fn key(&self) -> TransferKey {
        (self.info_hash, self.generation)
    }

    /// (pieces, files), both zero until metadata is known
    pub(crate) fn layout(&self) -> (usize, usize) {
        self.info
            .as_ref()
            .map_or((0, 0), |info| (info.piece_count(), info.file_count()))
    }

    /// Install metadata and everything sized by it; the transfer then waits for checking
    pub(crate) fn set_metadata(&mut self, info: Arc<TorrentInfo>) {
        let num_pieces = info.piece_count();
        self.name = info.name.clone();
        self.filter = PieceFilter::for_torrent(&info);
        self.queue = DownloadQueue::new(BlockLayout::new(self.block_size, info.piece_length, info.total_size()));
        self.peers.set_num_pieces(num_pieces);
        self.have = Arc::new(vec![false; num_pieces]);
        if self.trackers.entries().is_empty() && !info.announce_tiers.is_empty() {
            self.trackers
                .replace(AnnounceEntry::from_tiers(&info.announce_tiers), Instant::now());
        }
        self.storage = Some(Arc::new(tokio::sync::Mutex::new((self.storage_constructor)(
            info.clone(),
            self.save_path.clone(),
        ))));

        if let Some(resume) = self.pending_resume.take() {
            match resume.check_layout(num_pieces, info.file_count()) {
                Ok(()) => {
                    self.apply_resume_filters(&resume);
                    self.pending_resume = Some(resume);
                }
                Err(e) => warn!("Discarding resume data for {}: {}", self.info_hash, e),
            }
        }

        self.info = Some(info);
        self.state = TorrentState::QueuedForChecking;
        self.check_progress = 0.0;
        info!("Metadata ready for {} ({} pieces)", self.name, num_pieces);
    }

    fn apply_resume_settings(&mut self, resume: &ResumeData, now: Instant) {
        self.limits = resume.limits;
        if !resume.trackers.is_empty() {
            self.trackers.replace(resume.trackers.clone(), now);
        }
        self.paused = self.paused || resume.paused;
        self.uploaded_before = resume.total_uploaded;
        self.downloaded_before = resume.total_downloaded;
    }

    fn apply_resume_filters(&mut self, resume: &ResumeData) {
        if !resume.file_filter.is_empty() {
            let wanted: Vec<bool> = resume.file_filter.iter().map(|&f| !f).collect();
            if let Err(e) = self.filter.set_files(&wanted) {
                warn!("Ignoring resumed file filter: {}", e);
            }
        }
        let wanted: Vec<bool> = resume.filtered_pieces().iter().map(|&f| !f).collect();
        if let Err(e) = self.filter.set_pieces(&wanted) {
            warn!("Ignoring resumed piece filter: {}", e);
        }
    }

    /// Pieces resume data claims are complete, for the checker to trust
    pub(crate) fn resume_claims(&self) -> Option<Vec<bool>> {
        self.pending_resume.as_ref().map(ResumeData::have_pieces)
    }

    /// Checking finished: install the verified pieces and any partial pieces from resume data
    pub(crate) fn checked(&mut self, have: Vec<bool>) {
        let verified = have.iter().filter(|&&h| h).count();
        self.have = Arc::new(have);
        self.queue.clear();
        if let Some(resume) = self.pending_resume.take() {
            for PieceState { index, blocks } in &resume.unfinished {
                if self.have.get(*index as usize).copied().unwrap_or(true) {
                    continue;
                }
                if let Err(e) = self.queue.restore_finished(*index, blocks) {
                    debug!("Dropping resumed blocks of piece {}: {}", index, e);
                }
            }
        }
        self.check_progress = 1.0;
        self.state = if self.trackers.entries().is_empty() {
            TorrentState::Downloading
        } else {
            TorrentState::ConnectingToTracker
        };
        self.refresh_state();
        info!(
            "Checked {}: {}/{} pieces present",
            self.name,
            verified,
            self.have.len()
        );
    }

    /// Mark a piece complete
    pub(crate) fn piece_passed(&mut self, piece: u32) {
        if let Some(slot) = Arc::make_mut(&mut self.have).get_mut(piece as usize) {
            *slot = true;
        }
        self.queue.piece_verified(piece);
    }

    /// Recompute the state after progress changes; returns the new state if it changed
    pub(crate) fn refresh_state(&mut self) -> Option<TorrentState> {
        if !self.state.is_active() {
            return None;
        }
        let next = if self.is_seed() {
            TorrentState::Seeding
        } else if self.is_finished() {
            TorrentState::Finished
        } else if self.state == TorrentState::ConnectingToTracker {
            TorrentState::ConnectingToTracker
        } else {
            TorrentState::Downloading
        };
        if next == self.state {
            return None;
        }
        debug!("{} is now {}", self.name, next);
        self.state = next;
        Some(next)
    }

    /// Whether every piece is present
    pub(crate) fn is_seed(&self) -> bool {
        self.info.is_some() && !self.have.is_empty() && self.have.iter().all(|&h| h)
    }

    /// Whether every wanted piece is present
    pub(crate) fn is_finished(&self) -> bool {
        self.info.is_some()
            && self
                .have
                .iter()
                .enumerate()
                .all(|(piece, &h)| h || !self.filter.is_wanted(piece))
    }

    /// (uploaded, downloaded, left) as reported to trackers
    pub(crate) fn announce_totals(&self) -> (u64, u64, u64) {
        let totals = byte_totals(&self.have, &self.filter, &self.queue);
        let left = match &self.info {
            Some(_) => totals.total_wanted - totals.total_wanted_done,
            None => 0,
        };
        (self.total_payload_upload(), self.total_payload_download(), left)
    }

    /// Build the next announce, if the transfer has trackers
    pub(crate) fn announce(&mut self, event: AnnounceEvent, now: Instant) -> Option<AnnounceRequest> {
        let totals = self.announce_totals();
        self.trackers.next_request(self.info_hash, event, totals, now)
    }

    fn total_payload_upload(&self) -> u64 {
        self.uploaded_before + self.stats.upload_payload.total()
    }

    fn total_payload_download(&self) -> u64 {
        self.downloaded_before + self.stats.download_payload.total()
    }

    /// Snapshot of the transfer
    pub(crate) fn status(&self, now: Instant) -> TorrentStatus {
        let totals = byte_totals(&self.have, &self.filter, &self.queue);
        let progress = match self.state {
            TorrentState::QueuedForChecking | TorrentState::CheckingFiles => self.check_progress,
            TorrentState::DownloadingMetadata => 0.0,
            _ => totals.progress(),
        };
        let num_peers = self.peers.num_peers();

        TorrentStatus {
            state: self.state,
            paused: self.paused,
            progress,
            error: self.error.clone(),
            next_announce: self.trackers.next_announce_in(now),
            announce_interval: self.trackers.interval(),
            current_tracker: self.trackers.current_tracker(),
            total_download: self.stats.total_download(),
            total_upload: self.stats.total_upload(),
            total_payload_download: self.total_payload_download(),
            total_payload_upload: self.total_payload_upload(),
            total_failed_bytes: self.total_failed_bytes,
            download_rate: self.stats.download_rate(),
            upload_rate: self.stats.upload_rate(),
            download_payload_rate: self.stats.download_payload.rate(),
            upload_payload_rate: self.stats.upload_payload.rate(),
            num_peers,
            num_seeds: self.peers.num_seeds(),
            num_complete: self.trackers.num_complete(),
            num_incomplete: self.trackers.num_incomplete(),
            pieces: Arc::clone(&self.have),
            num_pieces: self.have.iter().filter(|&&h| h).count(),
            total_done: totals.total_done,
            total_wanted_done: totals.total_wanted_done,
            total_wanted: totals.total_wanted,
            distributed_copies: distributed_copies(&self.peers.availability(), &self.filter, num_peers),
            block_size: match self.info {
                Some(_) => self.queue.layout().block_size(),
                None => self.block_size,
            },
        }
    }

    /// Persistable progress, taken from memory only
    pub(crate) fn resume_data(&self) -> ResumeData {
        let mut resume = ResumeData::new(self.info_hash, self.have.len(), self.save_path.clone());
        resume.set_have(&self.have);
        resume.set_piece_filter(&self.filter.filtered_pieces());
        resume.file_filter = self.filter.filtered_files();
        resume.unfinished = self
            .queue
            .iter()
            .filter(|entry| entry.finished_count() > 0)
            .map(|entry| PieceState {
                index: entry.piece_index,
                blocks: entry.finished_blocks.clone(),
            })
            .collect();
        resume.trackers = self.trackers.entries().to_vec();
        resume.limits = self.limits;
        resume.paused = self.paused;
        resume.total_uploaded = self.total_payload_upload();
        resume.total_downloaded = self.total_payload_download();
        resume
    }
}
