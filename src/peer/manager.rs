//! Peer registry
//!
//! The engine's table of connected peers, fed by the connection layer's
//! events. Connections themselves live outside the engine.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use tracing::{debug, trace};

use crate::error::{Result, TorrentError};
use crate::peer::{Peer, PeerInfo, PeerSource};
use crate::session::stats::Direction;
use crate::storage::bitfield;

/// Connected peers of one transfer
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    peers: HashMap<SocketAddr, Peer>,
    num_pieces: usize,
}

impl PeerRegistry {
    /// Create a registry for a torrent with `num_pieces` pieces
    pub fn new(num_pieces: usize) -> Self {
        Self {
            peers: HashMap::new(),
            num_pieces,
        }
    }

    /// Metadata arrived; size every peer's piece set
    pub fn set_num_pieces(&mut self, num_pieces: usize) {
        self.num_pieces = num_pieces;
        for peer in self.peers.values_mut() {
            peer.pieces.resize(num_pieces, false);
        }
    }

    /// Add a connected peer; returns false if it was already known
    pub fn connected(&mut self, addr: SocketAddr, source: PeerSource, peer_id: Option<[u8; 20]>) -> bool {
        if self.peers.contains_key(&addr) {
            trace!("Peer {} already connected, skipping", addr);
            return false;
        }
        let mut peer = Peer::new(addr, source, self.num_pieces);
        peer.peer_id = peer_id;
        self.peers.insert(addr, peer);
        debug!("Peer connected: {} (total: {})", addr, self.peers.len());
        true
    }

    /// Drop a disconnected peer
    pub fn disconnected(&mut self, addr: SocketAddr) -> Option<Peer> {
        let removed = self.peers.remove(&addr);
        if removed.is_some() {
            debug!("Peer disconnected: {} (remaining: {})", addr, self.peers.len());
        }
        removed
    }

    /// Replace a peer's piece set from its packed bitfield
    pub fn set_bitfield(&mut self, addr: SocketAddr, packed: &[u8]) -> Result<()> {
        let num_pieces = self.num_pieces;
        if packed.len() != num_pieces.div_ceil(8) || bitfield::has_spare_bits(packed, num_pieces) {
            return Err(TorrentError::invalid_argument_with_field(
                format!("bitfield of {} bytes does not fit {} pieces", packed.len(), num_pieces),
                "bitfield",
            ));
        }
        let peer = self.peer_mut(addr)?;
        peer.pieces = bitfield::unpack(packed, num_pieces);
        trace!("Peer {} has {} pieces", addr, peer.pieces.iter().filter(|&&p| p).count());
        Ok(())
    }

    /// Record that a peer announced a new piece
    pub fn have(&mut self, addr: SocketAddr, piece: usize) -> Result<()> {
        let peer = self.peer_mut(addr)?;
        let slot = peer.pieces.get_mut(piece).ok_or_else(|| {
            TorrentError::invalid_argument_with_field(format!("piece index {} out of range", piece), "piece_index")
        })?;
        *slot = true;
        Ok(())
    }

    /// Count traffic with a peer; unknown peers are ignored
    pub fn record(&mut self, addr: SocketAddr, direction: Direction, payload: u64, protocol: u64) {
        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.record(direction, payload, protocol);
        }
    }

    /// Close the current rate sample of every peer
    pub fn tick(&mut self, elapsed: Duration) {
        for peer in self.peers.values_mut() {
            peer.tick(elapsed);
        }
    }

    /// Whether a peer is connected
    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.peers.contains_key(addr)
    }

    /// Number of connected peers
    pub fn num_peers(&self) -> usize {
        self.peers.len()
    }

    /// Number of connected peers that have every piece
    pub fn num_seeds(&self) -> usize {
        self.peers.values().filter(|p| p.is_seed()).count()
    }

    /// For each piece, how many connected peers have it
    pub fn availability(&self) -> Vec<u32> {
        let mut counts = vec![0u32; self.num_pieces];
        for peer in self.peers.values() {
            for (count, &has) in counts.iter_mut().zip(&peer.pieces) {
                if has {
                    *count += 1;
                }
            }
        }
        counts
    }

    /// Snapshot of every peer, ordered by address
    pub fn peer_info(&self) -> Vec<PeerInfo> {
        let mut info: Vec<PeerInfo> = self.peers.values().map(Peer::info).collect();
        info.sort_by_key(|p| p.addr);
        info
    }

    /// Drop every peer, e.g. when the transfer pauses
    pub fn clear(&mut self) -> Vec<SocketAddr> {
        self.peers.drain().map(|(addr, _)| addr).collect()
    }

    fn peer_mut(&mut self, addr: SocketAddr) -> Result<&mut Peer> {
        self.peers.get_mut(&addr).ok_or_else(|| {
            TorrentError::invalid_argument_with_field(format!("peer {} is not connected", addr), "peer")
        })
    }
}
