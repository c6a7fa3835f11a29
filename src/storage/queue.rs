//! Block download queue
//!
//! Per-piece accounting of which blocks were requested, from whom, how often,
//! and which have arrived. An entry exists from the first request of a piece
//! until the piece is verified or every outstanding request is abandoned.
//! Choosing the next block is the piece picker's job; this module only records
//! what happened.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::error::{Result, TorrentError};

/// Default request granularity (16 KiB)
pub const DEFAULT_BLOCK_SIZE: u32 = 16 * 1024;

/// Geometry of blocks within pieces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockLayout {
    block_size: u32,
    piece_length: u64,
    total_size: u64,
}

impl BlockLayout {
    /// Layout for a torrent; the block size is clamped to the piece length
    pub fn new(block_size: u32, piece_length: u64, total_size: u64) -> Self {
        let block_size = if piece_length > 0 {
            (block_size.max(1) as u64).min(piece_length) as u32
        } else {
            block_size.max(1)
        };
        Self {
            block_size,
            piece_length,
            total_size,
        }
    }

    /// Block size in bytes
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Number of pieces
    pub fn piece_count(&self) -> usize {
        if self.piece_length == 0 {
            return 0;
        }
        self.total_size.div_ceil(self.piece_length) as usize
    }

    /// Size of a piece in bytes; the last piece may be short
    pub fn piece_size(&self, piece: u32) -> u64 {
        if piece as usize >= self.piece_count() {
            return 0;
        }
        let start = piece as u64 * self.piece_length;
        self.piece_length.min(self.total_size - start)
    }

    /// Number of blocks a piece is split into
    pub fn blocks_in_piece(&self, piece: u32) -> u32 {
        self.piece_size(piece).div_ceil(self.block_size as u64) as u32
    }

    /// Size of one block; the last block of a piece may be short
    pub fn block_len(&self, piece: u32, block: u32) -> u32 {
        let piece_size = self.piece_size(piece);
        let start = block as u64 * self.block_size as u64;
        if start >= piece_size {
            return 0;
        }
        (self.block_size as u64).min(piece_size - start) as u32
    }
}

/// Result of recording a block request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// First request for this block
    First,
    /// The block had been requested before and was not yet received
    Retry,
    /// The block had already arrived; it stays finished
    AlreadyFinished,
}

/// State of one piece in the download queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartialPieceInfo {
    /// Piece index
    pub piece_index: u32,
    /// Number of blocks the piece is divided into
    pub blocks_in_piece: u32,
    /// Blocks requested from some peer
    pub requested_blocks: Vec<bool>,
    /// Blocks received; always a subset of `requested_blocks`
    pub finished_blocks: Vec<bool>,
    /// Peer that last requested or supplied each block
    pub peer: Vec<Option<SocketAddr>>,
    /// Times each block has been re-requested
    pub num_downloads: Vec<u32>,
}

impl PartialPieceInfo {
    /// Fresh entry with nothing requested
    pub fn new(piece_index: u32, blocks_in_piece: u32) -> Self {
        let n = blocks_in_piece as usize;
        Self {
            piece_index,
            blocks_in_piece,
            requested_blocks: vec![false; n],
            finished_blocks: vec![false; n],
            peer: vec![None; n],
            num_downloads: vec![0; n],
        }
    }

    /// Number of finished blocks
    pub fn finished_count(&self) -> usize {
        self.finished_blocks.iter().filter(|&&f| f).count()
    }

    /// Number of requested blocks, finished or not
    pub fn requested_count(&self) -> usize {
        self.requested_blocks.iter().filter(|&&r| r).count()
    }

    /// Whether every block has arrived
    pub fn is_complete(&self) -> bool {
        self.finished_blocks.iter().all(|&f| f)
    }
}

/// Queue of partially downloaded pieces, keyed by piece index
#[derive(Debug, Clone, Default)]
pub struct DownloadQueue {
    layout: BlockLayout,
    pieces: BTreeMap<u32, PartialPieceInfo>,
}

impl DownloadQueue {
    /// Empty queue for the given layout
    pub fn new(layout: BlockLayout) -> Self {
        Self {
            layout,
            pieces: BTreeMap::new(),
        }
    }

    /// Block geometry in use
    pub fn layout(&self) -> &BlockLayout {
        &self.layout
    }

    /// Record that `block` of `piece` was requested from `peer`
    pub fn begin_request(&mut self, piece: u32, block: u32, peer: SocketAddr) -> Result<RequestOutcome> {
        self.check_block(piece, block)?;
        let blocks = self.layout.blocks_in_piece(piece);
        let entry = self
            .pieces
            .entry(piece)
            .or_insert_with(|| PartialPieceInfo::new(piece, blocks));
        let b = block as usize;

        if entry.finished_blocks[b] {
            entry.num_downloads[b] += 1;
            debug!("Block {}:{} requested again after it arrived", piece, block);
            return Ok(RequestOutcome::AlreadyFinished);
        }

        let outcome = if entry.peer[b].is_some() {
            entry.num_downloads[b] += 1;
            RequestOutcome::Retry
        } else {
            RequestOutcome::First
        };
        entry.requested_blocks[b] = true;
        entry.peer[b] = Some(peer);
        trace!("Block {}:{} requested from {} ({:?})", piece, block, peer, outcome);
        Ok(outcome)
    }

    /// Record that a requested block arrived; returns whether it was newly finished
    pub fn mark_finished(&mut self, piece: u32, block: u32) -> Result<bool> {
        self.check_block(piece, block)?;
        let b = block as usize;
        let entry = self
            .pieces
            .get_mut(&piece)
            .filter(|entry| entry.requested_blocks[b])
            .ok_or_else(|| {
                TorrentError::invalid_argument_with_field(
                    format!("block {}:{} was never requested", piece, block),
                    "block",
                )
            })?;

        if entry.finished_blocks[b] {
            return Ok(false);
        }
        entry.finished_blocks[b] = true;
        trace!("Block {}:{} finished ({}/{})", piece, block, entry.finished_count(), entry.blocks_in_piece);
        Ok(true)
    }

    /// Withdraw the unfinished requests `peer` holds in `piece`
    ///
    /// Returns the number of blocks released. An entry left with no requested
    /// blocks is dropped.
    pub fn abandon(&mut self, piece: u32, peer: SocketAddr) -> usize {
        let Some(entry) = self.pieces.get_mut(&piece) else {
            return 0;
        };
        let released = release_blocks(entry, peer);
        if entry.requested_count() == 0 {
            self.pieces.remove(&piece);
        }
        if released > 0 {
            debug!("Released {} blocks of piece {} held by {}", released, piece, peer);
        }
        released
    }

    /// Withdraw every unfinished request held by `peer`
    pub fn abandon_peer(&mut self, peer: SocketAddr) -> usize {
        let mut released = 0;
        for entry in self.pieces.values_mut() {
            released += release_blocks(entry, peer);
        }
        self.pieces.retain(|_, entry| entry.requested_count() > 0);
        if released > 0 {
            debug!("Released {} blocks held by disconnected peer {}", released, peer);
        }
        released
    }

    /// Whether every block of `piece` has arrived
    pub fn piece_complete(&self, piece: u32) -> bool {
        self.pieces.get(&piece).is_some_and(PartialPieceInfo::is_complete)
    }

    /// The piece failed its hash check; all of its blocks must be fetched again
    ///
    /// Peers and request counters are kept so repeat requests show as retries.
    pub fn hash_failed(&mut self, piece: u32) {
        if let Some(entry) = self.pieces.get_mut(&piece) {
            warn!("Piece {} failed hash check, re-queueing {} blocks", piece, entry.blocks_in_piece);
            entry.finished_blocks.fill(false);
            entry.requested_blocks.fill(false);
        }
    }

    /// The piece passed its hash check and leaves the queue
    pub fn piece_verified(&mut self, piece: u32) -> Option<PartialPieceInfo> {
        self.pieces.remove(&piece)
    }

    /// Seed an entry with blocks known to be on disk, e.g. from resume data
    pub fn restore_finished(&mut self, piece: u32, finished: &[bool]) -> Result<()> {
        let blocks = self.layout.blocks_in_piece(piece);
        if blocks == 0 || finished.len() != blocks as usize {
            return Err(TorrentError::invalid_argument_with_field(
                format!("piece {} has {} blocks, got {} flags", piece, blocks, finished.len()),
                "finished_blocks",
            ));
        }
        if !finished.iter().any(|&f| f) {
            return Ok(());
        }
        let mut entry = PartialPieceInfo::new(piece, blocks);
        entry.finished_blocks.copy_from_slice(finished);
        entry.requested_blocks.copy_from_slice(finished);
        self.pieces.insert(piece, entry);
        Ok(())
    }

    /// Entry for a piece, if queued
    pub fn get(&self, piece: u32) -> Option<&PartialPieceInfo> {
        self.pieces.get(&piece)
    }

    /// Bytes of `piece` already received
    pub fn finished_bytes(&self, piece: u32) -> u64 {
        self.pieces.get(&piece).map_or(0, |entry| {
            (0..entry.blocks_in_piece)
                .filter(|&b| entry.finished_blocks[b as usize])
                .map(|b| self.layout.block_len(piece, b) as u64)
                .sum()
        })
    }

    /// Queued pieces in index order
    pub fn iter(&self) -> impl Iterator<Item = &PartialPieceInfo> {
        self.pieces.values()
    }

    /// Copy of every entry, in piece order
    pub fn snapshot(&self) -> Vec<PartialPieceInfo> {
        self.pieces.values().cloned().collect()
    }

    /// Number of queued pieces
    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.pieces.clear();
    }

    fn check_block(&self, piece: u32, block: u32) -> Result<()> {
        if piece as usize >= self.layout.piece_count() {
            return Err(TorrentError::invalid_argument_with_field(
                format!("piece index {} out of range", piece),
                "piece_index",
            ));
        }
        if block >= self.layout.blocks_in_piece(piece) {
            return Err(TorrentError::invalid_argument_with_field(
                format!("block index {} out of range for piece {}", block, piece),
                "block",
            ));
        }
        Ok(())
    }
}

fn release_blocks(entry: &mut PartialPieceInfo, peer: SocketAddr) -> usize {
    let mut released = 0;
    for b in 0..entry.blocks_in_piece as usize {
        if entry.requested_blocks[b] && !entry.finished_blocks[b] && entry.peer[b] == Some(peer) {
            entry.requested_blocks[b] = false;
            released += 1;
        }
    }
    released
}
