//! Peer management module
//!
//! Engine-side view of connected peers.

pub mod manager;
pub mod state;

// Re-export main types
pub use manager::PeerRegistry;
pub use state::{Peer, PeerInfo, PeerSource};
