//! Selective download
//!
//! Tracks which pieces and files the user wants. A filtered piece is never
//! requested again, but bytes already downloaded for it are kept; filtering
//! only changes scheduling and the "wanted" accounting in status snapshots.

use std::ops::Range;

use tracing::debug;

use crate::error::{Result, TorrentError};
use crate::torrent::TorrentInfo;

/// Per-piece and per-file wanted flags for one transfer
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PieceFilter {
    /// `true` means the piece is filtered (not wanted)
    filtered: Vec<bool>,
    /// `true` means the file is filtered (not wanted)
    filtered_files: Vec<bool>,
    /// Pieces overlapping each file
    file_spans: Vec<Range<usize>>,
}

impl PieceFilter {
    /// Everything wanted
    pub fn new(piece_count: usize, file_spans: Vec<Range<usize>>) -> Self {
        Self {
            filtered: vec![false; piece_count],
            filtered_files: vec![false; file_spans.len()],
            file_spans,
        }
    }

    /// Everything wanted, with file spans taken from the torrent's layout
    pub fn for_torrent(info: &TorrentInfo) -> Self {
        Self::new(info.piece_count(), info.file_piece_spans())
    }

    /// Number of pieces covered by the filter
    pub fn piece_count(&self) -> usize {
        self.filtered.len()
    }

    /// Number of files covered by the filter
    pub fn file_count(&self) -> usize {
        self.filtered_files.len()
    }

    /// Mark a piece wanted or not; returns whether the flag changed
    pub fn set_piece(&mut self, index: usize, wanted: bool) -> Result<bool> {
        let slot = self
            .filtered
            .get_mut(index)
            .ok_or_else(|| piece_out_of_range(index))?;
        let changed = *slot == wanted;
        *slot = !wanted;
        Ok(changed)
    }

    /// Apply a full wanted mask, one flag per piece; returns how many flags changed
    pub fn set_pieces(&mut self, wanted: &[bool]) -> Result<usize> {
        if wanted.len() != self.filtered.len() {
            return Err(TorrentError::invalid_argument_with_field(
                format!("expected {} piece flags, got {}", self.filtered.len(), wanted.len()),
                "pieces",
            ));
        }
        let mut changed = 0;
        for (slot, &want) in self.filtered.iter_mut().zip(wanted) {
            if *slot == want {
                changed += 1;
            }
            *slot = !want;
        }
        Ok(changed)
    }

    /// Mark a file wanted or not and recompute the pieces it overlaps
    pub fn set_file(&mut self, index: usize, wanted: bool) -> Result<()> {
        let slot = self
            .filtered_files
            .get_mut(index)
            .ok_or_else(|| file_out_of_range(index))?;
        *slot = !wanted;
        let span = self.file_spans[index].clone();
        debug!("File {} {} ({} pieces)", index, if wanted { "wanted" } else { "filtered" }, span.len());
        for piece in span {
            self.filtered[piece] = self.all_overlapping_files_filtered(piece);
        }
        Ok(())
    }

    /// Apply a full wanted mask, one flag per file
    pub fn set_files(&mut self, wanted: &[bool]) -> Result<()> {
        if wanted.len() != self.filtered_files.len() {
            return Err(TorrentError::invalid_argument_with_field(
                format!("expected {} file flags, got {}", self.filtered_files.len(), wanted.len()),
                "files",
            ));
        }
        for (slot, &want) in self.filtered_files.iter_mut().zip(wanted) {
            *slot = !want;
        }
        for piece in 0..self.filtered.len() {
            if self.file_spans.iter().any(|span| span.contains(&piece)) {
                self.filtered[piece] = self.all_overlapping_files_filtered(piece);
            }
        }
        Ok(())
    }

    /// Whether a piece is filtered
    pub fn is_piece_filtered(&self, index: usize) -> Result<bool> {
        self.filtered
            .get(index)
            .copied()
            .ok_or_else(|| piece_out_of_range(index))
    }

    /// Whether a piece is wanted; out-of-range pieces are not
    pub fn is_wanted(&self, index: usize) -> bool {
        self.filtered.get(index).is_some_and(|&f| !f)
    }

    /// Full piece filter mask, `true` meaning filtered
    pub fn filtered_pieces(&self) -> Vec<bool> {
        self.filtered.clone()
    }

    /// Full file filter mask, `true` meaning filtered
    pub fn filtered_files(&self) -> Vec<bool> {
        self.filtered_files.clone()
    }

    /// Number of wanted pieces
    pub fn wanted_count(&self) -> usize {
        self.filtered.iter().filter(|&&f| !f).count()
    }

    // A piece shared by several files stays wanted while any of them is wanted
    fn all_overlapping_files_filtered(&self, piece: usize) -> bool {
        self.file_spans
            .iter()
            .zip(&self.filtered_files)
            .filter(|(span, _)| span.contains(&piece))
            .all(|(_, &filtered)| filtered)
    }
}

fn piece_out_of_range(index: usize) -> TorrentError {
    TorrentError::invalid_argument_with_field(format!("piece index {} out of range", index), "piece_index")
}

fn file_out_of_range(index: usize) -> TorrentError {
    TorrentError::invalid_argument_with_field(format!("file index {} out of range", index), "file_index")
}
