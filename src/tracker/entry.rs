//! Announce entries

use std::time::Instant;

use serde::{Deserialize, Serialize};

/// One tracker URL and its announce bookkeeping
///
/// Only `url` and `tier` persist; the rest is runtime state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnounceEntry {
    /// Tracker announce URL
    pub url: String,
    /// Tier; lower tiers are tried first
    pub tier: u32,
    /// Consecutive failures since the last success
    #[serde(skip)]
    pub fails: u32,
    /// When the last announce to this tracker succeeded
    #[serde(skip)]
    pub last_success: Option<Instant>,
    /// When the last announce to this tracker failed
    #[serde(skip)]
    pub last_failure: Option<Instant>,
    /// Last error or warning message from the tracker
    #[serde(skip)]
    pub message: Option<String>,
}

impl AnnounceEntry {
    /// Entry with no announce history
    pub fn new(url: impl Into<String>, tier: u32) -> Self {
        Self {
            url: url.into(),
            tier,
            fails: 0,
            last_success: None,
            last_failure: None,
            message: None,
        }
    }

    /// Entries for a torrent's tracker tiers, in announce order
    pub fn from_tiers(tiers: &[Vec<String>]) -> Vec<Self> {
        tiers
            .iter()
            .enumerate()
            .flat_map(|(tier, urls)| urls.iter().map(move |url| Self::new(url.clone(), tier as u32)))
            .collect()
    }

    /// Whether the last announce attempt to this tracker succeeded
    pub fn is_working(&self) -> bool {
        match (self.last_success, self.last_failure) {
            (Some(success), Some(failure)) => success > failure,
            (Some(_), None) => true,
            _ => false,
        }
    }
}
