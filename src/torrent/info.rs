//! Torrent information structures
//!
//! Parsed metadata for a transfer, plus the piece/file geometry derived from it.

use std::ops::Range;

use anyhow::Result;

use crate::torrent::InfoHash;

/// Represents a file in a torrent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    /// File path components (e.g., ["folder", "subfolder", "file.txt"])
    pub path: Vec<String>,
    /// File size in bytes
    pub length: u64,
}

/// Parsed torrent metadata
#[derive(Debug, Clone)]
pub struct TorrentInfo {
    /// SHA1 hash of info dictionary
    pub info_hash: InfoHash,
    /// Torrent name
    pub name: String,
    /// Size of each piece in bytes
    pub piece_length: u64,
    /// List of piece hashes (each is a 20-byte SHA1 hash)
    pub pieces: Vec<[u8; 20]>,
    /// Files in torrent order; a single-file torrent has exactly one entry
    pub files: Vec<TorrentFile>,
    /// Whether the info dictionary used the multi-file layout
    pub multi_file: bool,
    /// Tracker tiers, in announce order
    pub announce_tiers: Vec<Vec<String>>,
    /// The exact bencoded info dictionary; hashing it yields `info_hash`
    pub metadata: Vec<u8>,
}

impl TorrentInfo {
    /// Calculate total size of all files in torrent
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.length).sum()
    }

    /// Get number of pieces in torrent
    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Get number of files in torrent
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Parse piece hashes from concatenated bytes in torrent file
    pub fn parse_piece_hashes(pieces_bytes: &[u8]) -> Result<Vec<[u8; 20]>> {
        if pieces_bytes.len() % 20 != 0 {
            return Err(anyhow::anyhow!(
                "Pieces field length must be a multiple of 20, got {}",
                pieces_bytes.len()
            ));
        }

        let mut pieces = Vec::with_capacity(pieces_bytes.len() / 20);
        for chunk in pieces_bytes.chunks_exact(20) {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(chunk);
            pieces.push(hash);
        }

        Ok(pieces)
    }

    /// Get piece hash for a specific piece index
    pub fn piece_hash(&self, index: usize) -> Option<[u8; 20]> {
        self.pieces.get(index).copied()
    }

    /// Get byte range for a specific piece
    pub fn piece_range(&self, index: usize) -> Option<(u64, u64)> {
        if index >= self.pieces.len() {
            return None;
        }

        let start = (index as u64) * self.piece_length;
        let total = self.total_size();
        let end = std::cmp::min(start + self.piece_length, total);

        Some((start, end))
    }

    /// Size of a piece in bytes; the last piece may be short
    pub fn piece_size(&self, index: usize) -> u64 {
        self.piece_range(index).map_or(0, |(start, end)| end - start)
    }

    /// Byte offset of each file within the torrent's concatenated content
    pub fn file_offsets(&self) -> Vec<u64> {
        let mut offset = 0;
        self.files
            .iter()
            .map(|f| {
                let start = offset;
                offset += f.length;
                start
            })
            .collect()
    }

    /// Pieces overlapping each file; empty for zero-length files
    pub fn file_piece_spans(&self) -> Vec<Range<usize>> {
        if self.piece_length == 0 {
            return vec![0..0; self.files.len()];
        }
        self.file_offsets()
            .into_iter()
            .zip(&self.files)
            .map(|(offset, file)| {
                if file.length == 0 {
                    return 0..0;
                }
                let first = (offset / self.piece_length) as usize;
                let last = ((offset + file.length - 1) / self.piece_length) as usize;
                first..last + 1
            })
            .collect()
    }
}
