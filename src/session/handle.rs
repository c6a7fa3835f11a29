//! Handle to a transfer in a running session
//!
//! A handle holds no transfer state. Mutations are validated, queued to the
//! engine and return at once; the engine applies them on its next turn.
//! Queries run a closure on the engine task and copy the answer out.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::config::TransferLimits;
use crate::error::{Result, TorrentError};
use crate::peer::PeerInfo;
use crate::session::command::{self, Command, TransferChange, TransferKey};
use crate::session::status::TorrentStatus;
use crate::session::transfer::Transfer;
use crate::session::{EngineShared, Liveness};
use crate::storage::{PartialPieceInfo, ResumeData};
use crate::torrent::{InfoHash, TorrentInfo};
use crate::tracker::AnnounceEntry;

/// Capability to operate on one transfer
///
/// Handles compare, order and hash by info hash alone. A default handle is
/// permanently invalid; any handle becomes invalid once its transfer is
/// removed or the session stops, and every operation then fails with
/// [`TorrentError::InvalidHandle`].
#[derive(Debug, Clone, Default)]
pub struct TorrentHandle {
    shared: Weak<EngineShared>,
    info_hash: InfoHash,
    generation: u64,
}

impl TorrentHandle {
    pub(crate) fn new(shared: Weak<EngineShared>, info_hash: InfoHash, generation: u64) -> Self {
        Self {
            shared,
            info_hash,
            generation,
        }
    }

    pub(crate) fn key(&self) -> TransferKey {
        (self.info_hash, self.generation)
    }

    /// Whether the transfer is still in a running session
    pub fn is_valid(&self) -> bool {
        self.engine().is_ok()
    }

    fn engine(&self) -> Result<(Arc<EngineShared>, Liveness)> {
        let shared = self.shared.upgrade().ok_or(TorrentError::InvalidHandle)?;
        let live = shared
            .registry
            .lookup(self.key())
            .ok_or(TorrentError::InvalidHandle)?;
        Ok((shared, live))
    }

    fn update(&self, shared: &EngineShared, change: TransferChange) -> Result<()> {
        command::send(
            &shared.commands,
            Command::Update {
                key: self.key(),
                change,
            },
        )
    }

    /// Run `f` against the transfer on the engine task
    async fn query<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Transfer) -> T + Send + 'static,
    {
        let rx = {
            let (shared, _) = self.engine()?;
            let (tx, rx) = oneshot::channel();
            let visit = Box::new(move |transfer: &Transfer| {
                let _ = tx.send(f(transfer));
            });
            command::send(
                &shared.commands,
                Command::Inspect {
                    key: self.key(),
                    visit,
                },
            )?;
            rx
        };
        // The engine drops the visit unrun if the transfer went away meanwhile
        rx.await.map_err(|_| TorrentError::InvalidHandle)
    }

    // ----- identity -----

    /// Info hash of the transfer
    pub fn info_hash(&self) -> Result<InfoHash> {
        self.engine()?;
        Ok(self.info_hash)
    }

    // ----- queries -----

    /// Snapshot of the transfer's state and counters
    pub async fn status(&self) -> Result<TorrentStatus> {
        self.query(|t| t.status(Instant::now())).await
    }

    /// Connected peers, ordered by address
    pub async fn get_peer_info(&self) -> Result<Vec<PeerInfo>> {
        self.query(|t| t.peers.peer_info()).await
    }

    /// Pieces with requested or finished blocks that are not verified yet
    pub async fn get_download_queue(&self) -> Result<Vec<PartialPieceInfo>> {
        self.query(|t| t.queue.snapshot()).await
    }

    pub async fn trackers(&self) -> Result<Vec<AnnounceEntry>> {
        self.query(|t| t.trackers.entries().to_vec()).await
    }

    /// Raw info dictionary, once known
    pub async fn metadata(&self) -> Result<Option<Vec<u8>>> {
        self.query(|t| t.info.as_ref().map(|info| info.metadata.clone())).await
    }

    /// Parsed metadata, once known
    pub async fn torrent_info(&self) -> Result<Option<Arc<TorrentInfo>>> {
        self.query(|t| t.info.clone()).await
    }

    pub async fn has_metadata(&self) -> Result<bool> {
        self.query(|t| t.info.is_some()).await
    }

    /// Whether every piece is present
    pub async fn is_seed(&self) -> Result<bool> {
        self.query(Transfer::is_seed).await
    }

    pub async fn is_paused(&self) -> Result<bool> {
        self.query(|t| t.paused).await
    }

    pub async fn name(&self) -> Result<String> {
        self.query(|t| t.name.clone()).await
    }

    pub async fn save_path(&self) -> Result<PathBuf> {
        self.query(|t| t.save_path.clone()).await
    }

    /// One flag per piece, true where the piece is filtered out
    pub async fn filtered_pieces(&self) -> Result<Vec<bool>> {
        self.query(|t| t.filter.filtered_pieces()).await
    }

    pub async fn is_piece_filtered(&self, index: usize) -> Result<bool> {
        self.query(move |t| t.filter.is_piece_filtered(index)).await?
    }

    /// One flag per file, true where the file is filtered out
    pub async fn filtered_files(&self) -> Result<Vec<bool>> {
        self.query(|t| t.filter.filtered_files()).await
    }

    pub async fn limits(&self) -> Result<TransferLimits> {
        self.query(|t| t.limits).await
    }

    /// Progress and settings to persist, taken from memory
    pub async fn write_resume_data(&self) -> Result<ResumeData> {
        self.query(Transfer::resume_data).await
    }

    // ----- mutations -----

    /// Stop the transfer: drop its peers and tell trackers
    pub fn pause(&self) -> Result<()> {
        let (shared, _) = self.engine()?;
        self.update(&shared, TransferChange::Pause)
    }

    pub fn resume(&self) -> Result<()> {
        let (shared, _) = self.engine()?;
        self.update(&shared, TransferChange::Resume)
    }

    /// Filter a piece out (`true`) or back in (`false`)
    pub fn filter_piece(&self, index: usize, filter: bool) -> Result<()> {
        let (shared, live) = self.engine()?;
        if index >= live.num_pieces {
            return Err(TorrentError::invalid_argument_with_field(
                format!("piece index {} out of range ({} pieces)", index, live.num_pieces),
                "piece_index",
            ));
        }
        self.update(&shared, TransferChange::FilterPiece { index, filtered: filter })
    }

    /// Set every piece's filter flag; `filter[i]` true filters piece `i` out
    pub fn filter_pieces(&self, filter: Vec<bool>) -> Result<()> {
        let (shared, live) = self.engine()?;
        if filter.len() != live.num_pieces {
            return Err(TorrentError::invalid_argument_with_field(
                format!("expected {} piece flags, got {}", live.num_pieces, filter.len()),
                "pieces",
            ));
        }
        self.update(&shared, TransferChange::FilterPieces(filter))
    }

    /// Filter a file out (`true`) or back in (`false`)
    pub fn filter_file(&self, index: usize, filter: bool) -> Result<()> {
        let (shared, live) = self.engine()?;
        if index >= live.num_files {
            return Err(TorrentError::invalid_argument_with_field(
                format!("file index {} out of range ({} files)", index, live.num_files),
                "file_index",
            ));
        }
        self.update(&shared, TransferChange::FilterFile { index, filtered: filter })
    }

    /// Set every file's filter flag; `filter[i]` true filters file `i` out
    pub fn filter_files(&self, filter: Vec<bool>) -> Result<()> {
        let (shared, live) = self.engine()?;
        if filter.len() != live.num_files {
            return Err(TorrentError::invalid_argument_with_field(
                format!("expected {} file flags, got {}", live.num_files, filter.len()),
                "files",
            ));
        }
        self.update(&shared, TransferChange::FilterFiles(filter))
    }

    /// Swap the tracker list
    pub fn replace_trackers(&self, trackers: Vec<AnnounceEntry>) -> Result<()> {
        let (shared, _) = self.engine()?;
        if let Some(entry) = trackers.iter().find(|e| url::Url::parse(&e.url).is_err()) {
            return Err(TorrentError::invalid_argument_with_field(
                format!("invalid tracker URL: {}", entry.url),
                "trackers",
            ));
        }
        self.update(&shared, TransferChange::ReplaceTrackers(trackers))
    }

    /// Bytes per second; 0 or -1 for unlimited
    pub fn set_upload_limit(&self, limit: i64) -> Result<()> {
        let (shared, _) = self.engine()?;
        let limit = TransferLimits::check_rate(limit, "upload_limit")?;
        self.update(&shared, TransferChange::UploadLimit(limit))
    }

    /// Bytes per second; 0 or -1 for unlimited
    pub fn set_download_limit(&self, limit: i64) -> Result<()> {
        let (shared, _) = self.engine()?;
        let limit = TransferLimits::check_rate(limit, "download_limit")?;
        self.update(&shared, TransferChange::DownloadLimit(limit))
    }

    /// -1 for unlimited, otherwise at least 2
    pub fn set_max_uploads(&self, limit: i32) -> Result<()> {
        let (shared, _) = self.engine()?;
        let limit = TransferLimits::check_slots(limit, "max_uploads")?;
        self.update(&shared, TransferChange::MaxUploads(limit))
    }

    /// -1 for unlimited, otherwise at least 2
    pub fn set_max_connections(&self, limit: i32) -> Result<()> {
        let (shared, _) = self.engine()?;
        let limit = TransferLimits::check_slots(limit, "max_connections")?;
        self.update(&shared, TransferChange::MaxConnections(limit))
    }

    /// Share ratio; 0 for unlimited, otherwise at least 1
    pub fn set_ratio(&self, ratio: f32) -> Result<()> {
        let (shared, _) = self.engine()?;
        let ratio = TransferLimits::check_ratio(ratio)?;
        self.update(&shared, TransferChange::Ratio(ratio))
    }

    /// Bind outgoing connections to a network interface or address
    pub fn use_interface(&self, interface: &str) -> Result<()> {
        let (shared, _) = self.engine()?;
        if interface.trim().is_empty() {
            return Err(TorrentError::invalid_argument_with_field("interface must not be empty", "interface"));
        }
        self.update(&shared, TransferChange::UseInterface(interface.to_string()))
    }

    /// Credentials sent with every announce
    pub fn set_tracker_login(&self, username: &str, password: &str) -> Result<()> {
        let (shared, _) = self.engine()?;
        self.update(
            &shared,
            TransferChange::TrackerLogin {
                username: username.to_string(),
                password: password.to_string(),
            },
        )
    }

    /// Announce now
    pub fn force_reannounce(&self) -> Result<()> {
        let (shared, _) = self.engine()?;
        self.update(&shared, TransferChange::ForceReannounce(None))
    }

    /// Announce after `delay`, overriding the tracker's interval; replaces any earlier override
    pub fn force_reannounce_in(&self, delay: Duration) -> Result<()> {
        let (shared, _) = self.engine()?;
        self.update(&shared, TransferChange::ForceReannounce(Some(delay)))
    }

    pub fn connect_peer(&self, addr: SocketAddr) -> Result<()> {
        let (shared, _) = self.engine()?;
        self.update(&shared, TransferChange::ConnectPeer(addr))
    }

    /// Send a chat message to a connected peer
    pub async fn send_chat_message(&self, addr: SocketAddr, message: &str) -> Result<()> {
        if !self.query(move |t| t.peers.contains(&addr)).await? {
            return Err(TorrentError::invalid_argument_with_field(
                format!("peer {} is not connected", addr),
                "addr",
            ));
        }
        let (shared, _) = self.engine()?;
        self.update(
            &shared,
            TransferChange::ChatMessage {
                addr,
                message: message.to_string(),
            },
        )
    }

    /// Move the transfer's files
    ///
    /// On failure the files and [`TorrentHandle::save_path`] stay where they were.
    pub async fn move_storage(&self, path: impl AsRef<Path>) -> Result<()> {
        let rx = {
            let (shared, _) = self.engine()?;
            let (responder, rx) = oneshot::channel();
            command::send(
                &shared.commands,
                Command::MoveStorage {
                    key: self.key(),
                    path: path.as_ref().to_path_buf(),
                    responder,
                },
            )?;
            rx
        };
        rx.await.map_err(|_| TorrentError::InvalidHandle)?
    }
}

impl PartialEq for TorrentHandle {
    fn eq(&self, other: &Self) -> bool {
        self.info_hash == other.info_hash
    }
}

impl Eq for TorrentHandle {}

impl PartialOrd for TorrentHandle {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TorrentHandle {
    fn cmp(&self, other: &Self) -> Ordering {
        self.info_hash.cmp(&other.info_hash)
    }
}

impl Hash for TorrentHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.info_hash.hash(state);
    }
}
