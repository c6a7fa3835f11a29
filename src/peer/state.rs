//! Peer state module
//!
//! What the engine knows about each connected peer.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::session::stats::{Direction, TransferStats};

/// Where the peer was discovered from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PeerSource {
    Tracker,
    DHT,
    PEX,
    Incoming,
    Manual,
}

/// A connected peer as tracked by the engine
#[derive(Debug, Clone)]
pub struct Peer {
    /// Peer address
    pub addr: SocketAddr,
    /// Peer identifier
    pub peer_id: Option<[u8; 20]>,
    /// How we learned about the peer
    pub source: PeerSource,
    /// Pieces the peer has
    pub pieces: Vec<bool>,
    /// Traffic with this peer
    pub stats: TransferStats,
}

impl Peer {
    /// Create a new peer that has nothing yet
    pub fn new(addr: SocketAddr, source: PeerSource, num_pieces: usize) -> Self {
        Self {
            addr,
            peer_id: None,
            source,
            pieces: vec![false; num_pieces],
            stats: TransferStats::default(),
        }
    }

    /// Check if peer has specific piece
    pub fn has_piece(&self, piece_index: usize) -> bool {
        self.pieces.get(piece_index).copied().unwrap_or(false)
    }

    /// Whether the peer has every piece
    pub fn is_seed(&self) -> bool {
        !self.pieces.is_empty() && self.pieces.iter().all(|&p| p)
    }

    /// Count traffic with this peer
    pub fn record(&mut self, direction: Direction, payload: u64, protocol: u64) {
        self.stats.record(direction, payload, protocol);
    }

    /// Close the current rate sample
    pub fn tick(&mut self, elapsed: Duration) {
        self.stats.tick(elapsed);
    }

    /// Snapshot for callers
    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            addr: self.addr,
            peer_id: self.peer_id,
            source: self.source,
            seed: self.is_seed(),
            pieces: self.pieces.clone(),
            down_speed: self.stats.download_rate(),
            up_speed: self.stats.upload_rate(),
            payload_down_speed: self.stats.download_payload.rate(),
            payload_up_speed: self.stats.upload_payload.rate(),
            total_download: self.stats.download_payload.total(),
            total_upload: self.stats.upload_payload.total(),
        }
    }
}

/// Information about a peer, copied out of the engine
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    pub peer_id: Option<[u8; 20]>,
    pub source: PeerSource,
    /// Whether the peer has every piece
    pub seed: bool,
    /// Pieces the peer has
    pub pieces: Vec<bool>,
    /// Download rate including protocol overhead
    pub down_speed: f32,
    /// Upload rate including protocol overhead
    pub up_speed: f32,
    pub payload_down_speed: f32,
    pub payload_up_speed: f32,
    /// Payload bytes downloaded from the peer
    pub total_download: u64,
    /// Payload bytes uploaded to the peer
    pub total_upload: u64,
}

impl PeerInfo {
    /// Get the peer ID as a hex string
    pub fn peer_id_hex(&self) -> Option<String> {
        self.peer_id.map(hex::encode)
    }
}
