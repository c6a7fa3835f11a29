//! Storage backend abstraction for torrent data
//!
//! The session never touches disk itself. Everything it needs from storage
//! goes through [`StorageBackend`], which it drives from spawned tasks so the
//! engine loop never waits on I/O.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::torrent::TorrentInfo;

/// Abstract storage backend for torrent data
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Create every file at its final length
    async fn allocate(&mut self) -> Result<()>;

    /// Number of bytes of `piece` present in storage
    async fn bytes_present(&self, piece: u32) -> Result<u64>;

    /// Hash the stored piece and compare it with the metadata
    async fn verify_hash(&self, piece: u32) -> Result<bool>;

    /// Move all files under `new_path`
    ///
    /// Either every file moves or none does; on error the previous location
    /// stays in use.
    async fn move_to(&mut self, new_path: &Path) -> Result<()>;

    /// Location of a file, by index in the torrent
    fn path_of(&self, file: usize) -> Option<PathBuf>;

    /// Directory the torrent lives in
    fn save_path(&self) -> &Path;
}

/// Storage shared between the engine and the tasks it spawns
pub type SharedStorage = Arc<tokio::sync::Mutex<Box<dyn StorageBackend>>>;

/// Builds storage for a transfer once its metadata is known
pub type StorageConstructor = Arc<dyn Fn(Arc<TorrentInfo>, PathBuf) -> Box<dyn StorageBackend> + Send + Sync>;
