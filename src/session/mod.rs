//! Transfer session
//!
//! A [`Session`] owns the engine task and its transfer table. Callers get
//! [`TorrentHandle`]s back; a handle names a transfer by info hash and the
//! generation it was added under, and every operation on it first checks
//! that the session is still running and still holds that generation.

pub mod command;
mod engine;
mod handle;
pub mod stats;
pub mod status;
mod transfer;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::config::SessionConfig;
use crate::error::{Result, TorrentError};
use crate::storage::{FileStorage, ResumeData, StorageConstructor};
use crate::torrent::{InfoHash, MagnetInfo, MagnetParser, TorrentInfo};

pub use command::{EventSender, Outgoing, OutgoingReceiver, TransferEvent};
pub use handle::TorrentHandle;
pub use stats::Direction;
pub use status::{TorrentState, TorrentStatus};

use command::{Command, TransferKey};

/// What a handle needs to know about a live transfer without asking the engine
#[derive(Debug, Clone, Copy)]
pub(crate) struct Liveness {
    pub generation: u64,
    pub num_pieces: usize,
    pub num_files: usize,
}

/// Live transfers, written by the engine and read by handles
#[derive(Debug)]
pub(crate) struct Registry {
    transfers: RwLock<HashMap<InfoHash, Liveness>>,
    next_generation: AtomicU64,
    shut_down: AtomicBool,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            transfers: RwLock::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
        }
    }
}

impl Registry {
    /// Piece and file counts of a live transfer
    pub(crate) fn lookup(&self, key: TransferKey) -> Option<Liveness> {
        if self.is_shut_down() {
            return None;
        }
        self.transfers
            .read()
            .get(&key.0)
            .copied()
            .filter(|live| live.generation == key.1)
    }

    /// Register a transfer and return its generation; None if the info hash is taken
    pub(crate) fn insert(&self, info_hash: InfoHash, num_pieces: usize, num_files: usize) -> Option<u64> {
        let mut transfers = self.transfers.write();
        if transfers.contains_key(&info_hash) {
            return None;
        }
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        transfers.insert(
            info_hash,
            Liveness {
                generation,
                num_pieces,
                num_files,
            },
        );
        Some(generation)
    }

    /// Metadata arrived for a transfer
    pub(crate) fn set_layout(&self, key: TransferKey, num_pieces: usize, num_files: usize) {
        if let Some(live) = self.transfers.write().get_mut(&key.0) {
            if live.generation == key.1 {
                live.num_pieces = num_pieces;
                live.num_files = num_files;
            }
        }
    }

    pub(crate) fn remove(&self, key: TransferKey) -> bool {
        let mut transfers = self.transfers.write();
        match transfers.get(&key.0) {
            Some(live) if live.generation == key.1 => {
                transfers.remove(&key.0);
                true
            }
            _ => false,
        }
    }

    /// Keys of every live transfer, ordered by info hash
    pub(crate) fn keys(&self) -> Vec<TransferKey> {
        if self.is_shut_down() {
            return Vec::new();
        }
        let mut keys: Vec<TransferKey> = self
            .transfers
            .read()
            .iter()
            .map(|(info_hash, live)| (*info_hash, live.generation))
            .collect();
        keys.sort();
        keys
    }

    pub(crate) fn shut_down(&self) {
        self.shut_down.store(true, Ordering::Release);
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

/// Held strongly by the session and weakly by handles
#[derive(Debug)]
pub(crate) struct EngineShared {
    pub registry: Arc<Registry>,
    pub commands: mpsc::UnboundedSender<Command>,
}

/// Where a transfer's metadata comes from
#[derive(Debug, Clone)]
pub enum TransferSource {
    /// Parsed `.torrent` metadata
    Torrent(Arc<TorrentInfo>),
    /// Info hash only; metadata is fetched from peers
    Magnet(MagnetInfo),
}

/// Everything needed to add a transfer
#[derive(Clone)]
pub struct AddTransferParams {
    pub source: TransferSource,
    pub save_path: PathBuf,
    /// Builds the storage backend once metadata is known
    pub storage: StorageConstructor,
    /// Serialized resume data from a previous run
    pub resume_data: Option<Vec<u8>>,
    /// Add the transfer paused
    pub paused: bool,
}

impl AddTransferParams {
    /// Add from parsed metadata, stored on local disk
    pub fn from_torrent(info: Arc<TorrentInfo>, save_path: PathBuf) -> Self {
        Self {
            source: TransferSource::Torrent(info),
            save_path,
            storage: FileStorage::constructor(),
            resume_data: None,
            paused: false,
        }
    }

    /// Add from a parsed magnet link, stored on local disk
    pub fn from_magnet(magnet: MagnetInfo, save_path: PathBuf) -> Self {
        Self {
            source: TransferSource::Magnet(magnet),
            save_path,
            storage: FileStorage::constructor(),
            resume_data: None,
            paused: false,
        }
    }

    pub fn with_resume(mut self, data: Vec<u8>) -> Self {
        self.resume_data = Some(data);
        self
    }

    pub fn with_storage(mut self, storage: StorageConstructor) -> Self {
        self.storage = storage;
        self
    }

    pub fn paused(mut self, paused: bool) -> Self {
        self.paused = paused;
        self
    }

    /// Info hash of the transfer these parameters describe
    pub fn info_hash(&self) -> InfoHash {
        match &self.source {
            TransferSource::Torrent(info) => info.info_hash,
            TransferSource::Magnet(magnet) => magnet.info_hash,
        }
    }
}

impl std::fmt::Debug for AddTransferParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddTransferParams")
            .field("info_hash", &self.info_hash())
            .field("save_path", &self.save_path)
            .field("resume_data", &self.resume_data.as_ref().map(Vec::len))
            .field("paused", &self.paused)
            .finish()
    }
}

/// Owner of the engine task
///
/// Clones share the same engine. The engine stops once every clone is
/// dropped or [`Session::shutdown`] is called; handles never keep it alive.
#[derive(Clone)]
pub struct Session {
    shared: Arc<EngineShared>,
    events: EventSender,
}

impl Session {
    /// Start an engine on the current tokio runtime
    ///
    /// Returns the session and the receiver of the engine's requests to the
    /// connection, tracker and storage layers.
    pub fn spawn(config: SessionConfig) -> Result<(Self, OutgoingReceiver)> {
        config.validate()?;
        let registry = Arc::new(Registry::default());
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();

        engine::spawn_engine(config, Arc::clone(&registry), commands_rx, events_rx, outgoing_tx);
        info!("Session started");

        let session = Self {
            shared: Arc::new(EngineShared {
                registry,
                commands: commands_tx,
            }),
            events: events_tx,
        };
        Ok((session, outgoing_rx))
    }

    /// Add a transfer
    ///
    /// # Errors
    /// - `DuplicateTransfer` if the info hash is already in the session
    /// - `ResumeMismatch` if resume data names another torrent or another layout
    /// - `ParseError` if resume data cannot be decoded
    pub async fn add_transfer(&self, params: AddTransferParams) -> Result<TorrentHandle> {
        let info_hash = params.info_hash();
        let resume = match &params.resume_data {
            Some(data) => {
                let resume = ResumeData::decode(data, &info_hash)?;
                if let TransferSource::Torrent(info) = &params.source {
                    resume.check_layout(info.piece_count(), info.file_count())?;
                }
                Some(resume)
            }
            None => None,
        };

        let (responder, rx) = oneshot::channel();
        command::send(
            &self.shared.commands,
            Command::AddTransfer {
                params: Box::new(params),
                resume,
                responder,
            },
        )?;
        let generation = rx.await.map_err(|_| TorrentError::InvalidHandle)??;
        debug!("Transfer {} added as generation {}", info_hash, generation);
        Ok(TorrentHandle::new(Arc::downgrade(&self.shared), info_hash, generation))
    }

    /// Add a transfer from a magnet link
    ///
    /// # Errors
    /// `InvalidArgument` if the link cannot be parsed, otherwise as [`Session::add_transfer`].
    pub async fn add_magnet(
        &self,
        uri: &str,
        save_path: PathBuf,
        storage: StorageConstructor,
    ) -> Result<TorrentHandle> {
        let magnet = MagnetParser::parse(uri)
            .map_err(|e| TorrentError::invalid_argument_with_field(format!("{:#}", e), "magnet"))?;
        self.add_transfer(AddTransferParams::from_magnet(magnet, save_path).with_storage(storage))
            .await
    }

    /// Handle to the live transfer with this info hash
    pub fn find_transfer(&self, info_hash: &InfoHash) -> Option<TorrentHandle> {
        self.shared
            .registry
            .keys()
            .into_iter()
            .find(|(hash, _)| hash == info_hash)
            .map(|(hash, generation)| TorrentHandle::new(Arc::downgrade(&self.shared), hash, generation))
    }

    /// Handles to every live transfer, ordered by info hash
    pub fn transfers(&self) -> Vec<TorrentHandle> {
        self.shared
            .registry
            .keys()
            .into_iter()
            .map(|(hash, generation)| TorrentHandle::new(Arc::downgrade(&self.shared), hash, generation))
            .collect()
    }

    /// Remove a transfer; its handles become invalid
    ///
    /// Data on disk is left alone.
    pub async fn remove_transfer(&self, handle: &TorrentHandle) -> Result<()> {
        let key = handle.key();
        if self.shared.registry.lookup(key).is_none() {
            return Err(TorrentError::InvalidHandle);
        }
        let (responder, rx) = oneshot::channel();
        command::send(&self.shared.commands, Command::RemoveTransfer { key, responder })?;
        rx.await.map_err(|_| TorrentError::InvalidHandle)?
    }

    /// Sender for the connection, tracker and metadata layers to report through
    pub fn events(&self) -> EventSender {
        self.events.clone()
    }

    /// Stop the engine; every handle becomes invalid
    pub async fn shutdown(&self) -> Result<()> {
        let (responder, rx) = oneshot::channel();
        command::send(&self.shared.commands, Command::Shutdown { responder })?;
        rx.await.map_err(|_| TorrentError::InvalidHandle)?;
        info!("Session stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_generations() {
        let registry = Registry::default();
        let hash = InfoHash::new([1; 20]);

        let first = registry.insert(hash, 4, 1).unwrap();
        assert!(registry.insert(hash, 4, 1).is_none());
        assert_eq!(registry.lookup((hash, first)).unwrap().num_pieces, 4);

        assert!(registry.remove((hash, first)));
        let second = registry.insert(hash, 4, 1).unwrap();
        assert_ne!(first, second);
        assert!(registry.lookup((hash, first)).is_none());
        assert!(!registry.remove((hash, first)));
    }

    #[test]
    fn test_registry_shut_down_hides_everything() {
        let registry = Registry::default();
        let hash = InfoHash::new([2; 20]);
        let generation = registry.insert(hash, 0, 0).unwrap();
        registry.set_layout((hash, generation), 8, 2);
        assert_eq!(registry.lookup((hash, generation)).unwrap().num_files, 2);

        registry.shut_down();
        assert!(registry.lookup((hash, generation)).is_none());
        assert!(registry.keys().is_empty());
    }

    #[test]
    fn test_spawn_rejects_bad_config() {
        let config = SessionConfig {
            block_size: 0,
            ..SessionConfig::default()
        };
        assert!(matches!(
            Session::spawn(config),
            Err(TorrentError::ConfigError { .. })
        ));
    }
}
