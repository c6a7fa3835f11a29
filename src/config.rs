//! Session and per-transfer configuration
//!
//! `SessionConfig` tunes the engine loop; `TransferLimits` carries the
//! bandwidth and connection caps a caller sets on one transfer.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TorrentError};
use crate::storage::queue::DEFAULT_BLOCK_SIZE;

/// Value meaning "no limit" for rates and slot counts
pub const UNLIMITED: i64 = -1;

/// Engine-wide settings
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Request granularity in bytes; clamped to the piece length per transfer
    pub block_size: u32,
    /// Period of the engine's housekeeping tick (rates, announces, checking)
    pub tick_interval: Duration,
    /// Announce interval used until a tracker reports its own
    pub default_announce_interval: Duration,
    /// Delay before retrying after a tracker error
    pub tracker_retry_interval: Duration,
    /// Pieces hashed between checking progress reports
    pub check_progress_step: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            tick_interval: Duration::from_secs(1),
            default_announce_interval: Duration::from_secs(1800),
            tracker_retry_interval: Duration::from_secs(60),
            check_progress_step: 16,
        }
    }
}

impl SessionConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(TorrentError::config_error_with_field("block size must be positive", "block_size"));
        }
        if self.tick_interval.is_zero() {
            return Err(TorrentError::config_error_with_field("tick interval must be positive", "tick_interval"));
        }
        if self.default_announce_interval.is_zero() {
            return Err(TorrentError::config_error_with_field(
                "announce interval must be positive",
                "default_announce_interval",
            ));
        }
        if self.check_progress_step == 0 {
            return Err(TorrentError::config_error_with_field(
                "check progress step must be at least 1",
                "check_progress_step",
            ));
        }
        Ok(())
    }
}

/// Bandwidth, slot and ratio caps of one transfer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransferLimits {
    /// Upload rate cap in bytes/s, -1 for unlimited
    pub upload_limit: i64,
    /// Download rate cap in bytes/s, -1 for unlimited
    pub download_limit: i64,
    /// Unchoke slots, -1 for unlimited
    pub max_uploads: i32,
    /// Connection cap, -1 for unlimited
    pub max_connections: i32,
    /// Upload/download ratio to maintain, 0 for unlimited
    pub ratio: f32,
}

impl Default for TransferLimits {
    fn default() -> Self {
        Self {
            upload_limit: UNLIMITED,
            download_limit: UNLIMITED,
            max_uploads: UNLIMITED as i32,
            max_connections: UNLIMITED as i32,
            ratio: 0.0,
        }
    }
}

impl TransferLimits {
    /// Normalise a rate cap: 0 and -1 both mean unlimited
    pub fn check_rate(limit: i64, field: &str) -> Result<i64> {
        match limit {
            UNLIMITED | 0 => Ok(UNLIMITED),
            l if l > 0 => Ok(l),
            l => Err(TorrentError::invalid_argument_with_field(
                format!("rate limit must be -1 or non-negative, got {}", l),
                field,
            )),
        }
    }

    /// A slot count is -1 (unlimited) or at least 2
    pub fn check_slots(limit: i32, field: &str) -> Result<i32> {
        if limit == -1 || limit >= 2 {
            Ok(limit)
        } else {
            Err(TorrentError::invalid_argument_with_field(
                format!("must be -1 or at least 2, got {}", limit),
                field,
            ))
        }
    }

    /// A ratio is 0 (unlimited) or at least 1
    pub fn check_ratio(ratio: f32) -> Result<f32> {
        if ratio == 0.0 || ratio >= 1.0 {
            Ok(ratio)
        } else {
            Err(TorrentError::invalid_argument_with_field(
                format!("ratio must be 0 or at least 1, got {}", ratio),
                "ratio",
            ))
        }
    }

    /// Validate every field, e.g. after loading resume data
    pub fn validate(&self) -> Result<()> {
        Self::check_rate(self.upload_limit, "upload_limit")?;
        Self::check_rate(self.download_limit, "download_limit")?;
        Self::check_slots(self.max_uploads, "max_uploads")?;
        Self::check_slots(self.max_connections, "max_connections")?;
        Self::check_ratio(self.ratio)?;
        Ok(())
    }
}
