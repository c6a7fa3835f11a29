//! Resume data module
//!
//! Persisted progress of a transfer: which pieces are complete, partially
//! received pieces, filters, trackers, limits and location. Decoding checks
//! the payload's info hash against the transfer it is applied to.

use std::path::{Path, PathBuf};

use anyhow::Result as AnyResult;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info};

use crate::config::TransferLimits;
use crate::error::{Result, TorrentError};
use crate::storage::bitfield;
use crate::torrent::InfoHash;
use crate::tracker::AnnounceEntry;

/// Resume data for a torrent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeData {
    /// Transfer this progress belongs to
    pub info_hash: InfoHash,
    /// Number of pieces the bitfields describe
    pub num_pieces: usize,
    /// Completed pieces (packed bitfield)
    pub pieces: Vec<u8>,
    /// Filtered pieces (packed bitfield, set = not wanted)
    pub piece_filter: Vec<u8>,
    /// Filtered files, `true` = not wanted
    #[serde(default)]
    pub file_filter: Vec<bool>,
    /// Partially received pieces
    #[serde(default)]
    pub unfinished: Vec<PieceState>,
    /// Tracker list in announce order
    #[serde(default)]
    pub trackers: Vec<AnnounceEntry>,
    /// Rate, slot and ratio caps
    #[serde(default)]
    pub limits: TransferLimits,
    /// Directory the transfer's files live in
    pub save_path: PathBuf,
    /// Whether the transfer was paused
    #[serde(default)]
    pub paused: bool,
    /// Payload bytes uploaded over the transfer's lifetime
    #[serde(default)]
    pub total_uploaded: u64,
    /// Payload bytes downloaded over the transfer's lifetime
    #[serde(default)]
    pub total_downloaded: u64,
}

/// Finished blocks of a piece that is not yet complete
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceState {
    /// Piece index
    pub index: u32,
    /// Which blocks are downloaded
    pub blocks: Vec<bool>,
}

impl PieceState {
    /// Get the number of downloaded blocks
    pub fn downloaded_blocks(&self) -> usize {
        self.blocks.iter().filter(|&&b| b).count()
    }
}

impl ResumeData {
    /// Resume data with nothing downloaded and nothing filtered
    pub fn new(info_hash: InfoHash, num_pieces: usize, save_path: PathBuf) -> Self {
        Self {
            info_hash,
            num_pieces,
            pieces: bitfield::pack(&vec![false; num_pieces]),
            piece_filter: bitfield::pack(&vec![false; num_pieces]),
            file_filter: Vec::new(),
            unfinished: Vec::new(),
            trackers: Vec::new(),
            limits: TransferLimits::default(),
            save_path,
            paused: false,
            total_uploaded: 0,
            total_downloaded: 0,
        }
    }

    /// Store the completed-piece mask
    pub fn set_have(&mut self, have: &[bool]) {
        self.pieces = bitfield::pack(have);
    }

    /// Completed-piece mask
    pub fn have_pieces(&self) -> Vec<bool> {
        bitfield::unpack(&self.pieces, self.num_pieces)
    }

    /// Store the filtered-piece mask
    pub fn set_piece_filter(&mut self, filtered: &[bool]) {
        self.piece_filter = bitfield::pack(filtered);
    }

    /// Filtered-piece mask
    pub fn filtered_pieces(&self) -> Vec<bool> {
        bitfield::unpack(&self.piece_filter, self.num_pieces)
    }

    /// Get the number of downloaded pieces
    pub fn downloaded_count(&self) -> usize {
        self.have_pieces().iter().filter(|&&h| h).count()
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize progress meant for the transfer named `expected`
    pub fn decode(data: &[u8], expected: &InfoHash) -> Result<Self> {
        let resume: Self = serde_json::from_slice(data)?;
        if resume.info_hash != *expected {
            return Err(TorrentError::resume_mismatch(format!(
                "resume data is for {}, not {}",
                resume.info_hash, expected
            )));
        }
        Ok(resume)
    }

    /// Check the payload against the transfer's piece and file counts
    pub fn check_layout(&self, num_pieces: usize, num_files: usize) -> Result<()> {
        if self.num_pieces != num_pieces {
            return Err(TorrentError::resume_mismatch(format!(
                "resume data has {} pieces, torrent has {}",
                self.num_pieces, num_pieces
            )));
        }
        let bitfield_len = num_pieces.div_ceil(8);
        if self.pieces.len() != bitfield_len
            || self.piece_filter.len() != bitfield_len
            || bitfield::has_spare_bits(&self.pieces, num_pieces)
            || bitfield::has_spare_bits(&self.piece_filter, num_pieces)
        {
            return Err(TorrentError::resume_mismatch("malformed piece bitfield"));
        }
        if !self.file_filter.is_empty() && self.file_filter.len() != num_files {
            return Err(TorrentError::resume_mismatch(format!(
                "resume data has {} file flags, torrent has {} files",
                self.file_filter.len(),
                num_files
            )));
        }
        if let Some(piece) = self.unfinished.iter().find(|p| p.index as usize >= num_pieces) {
            return Err(TorrentError::resume_mismatch(format!(
                "unfinished piece {} out of range",
                piece.index
            )));
        }
        self.limits.validate()
    }

    /// Save to file
    pub async fn save(&self, path: &Path) -> AnyResult<()> {
        let data = self.to_bytes()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, data).await?;
        Ok(())
    }

    /// Load from file, if present
    pub async fn load(path: &Path, expected: &InfoHash) -> AnyResult<Option<Self>> {
        if !fs::try_exists(path).await? {
            return Ok(None);
        }
        let data = fs::read(path).await?;
        Ok(Some(Self::decode(&data, expected)?))
    }
}

/// Resume data manager
///
/// Keeps one `<info hash>.resume` file per transfer in a directory.
pub struct ResumeManager {
    resume_dir: PathBuf,
}

impl ResumeManager {
    /// Create a new resume manager
    pub fn new(resume_dir: PathBuf) -> Self {
        Self { resume_dir }
    }

    /// Get the resume file path for a torrent
    fn resume_file_path(&self, info_hash: &InfoHash) -> PathBuf {
        self.resume_dir.join(format!("{}.resume", info_hash))
    }

    /// Save resume data for a torrent
    pub async fn save_resume_data(&self, resume_data: &ResumeData) -> AnyResult<()> {
        let resume_path = self.resume_file_path(&resume_data.info_hash);
        resume_data.save(&resume_path).await?;
        info!(
            "Saved resume data for {} ({}/{} pieces)",
            resume_data.info_hash,
            resume_data.downloaded_count(),
            resume_data.num_pieces
        );
        Ok(())
    }

    /// Load resume data for a torrent
    pub async fn load_resume_data(&self, info_hash: &InfoHash) -> AnyResult<Option<ResumeData>> {
        let resume_path = self.resume_file_path(info_hash);
        let loaded = ResumeData::load(&resume_path, info_hash).await?;
        if loaded.is_some() {
            debug!("Loaded resume data from {}", resume_path.display());
        }
        Ok(loaded)
    }

    /// Delete resume data for a torrent
    pub async fn delete_resume_data(&self, info_hash: &InfoHash) -> AnyResult<()> {
        let resume_path = self.resume_file_path(info_hash);
        if fs::try_exists(&resume_path).await? {
            fs::remove_file(&resume_path).await?;
        }
        Ok(())
    }

    /// Check if resume data exists for a torrent
    pub async fn has_resume_data(&self, info_hash: &InfoHash) -> bool {
        fs::try_exists(self.resume_file_path(info_hash)).await.unwrap_or(false)
    }

    /// Info hashes of every resume file in the directory
    pub async fn list_resume_files(&self) -> AnyResult<Vec<InfoHash>> {
        let mut info_hashes = Vec::new();

        if !fs::try_exists(&self.resume_dir).await? {
            return Ok(info_hashes);
        }

        let mut entries = fs::read_dir(&self.resume_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "resume") {
                if let Some(info_hash) = path.file_stem().and_then(|s| s.to_str()).and_then(|s| s.parse().ok()) {
                    info_hashes.push(info_hash);
                }
            }
        }

        Ok(info_hashes)
    }
}

impl Default for ResumeManager {
    fn default() -> Self {
        Self::new(PathBuf::from(".resume"))
    }
}
