//! Torrent metadata module
//!
//! Identity of a transfer, parsed metadata and the parsers that produce it.

pub mod info;
pub mod info_hash;
pub mod magnet;
pub mod parser;

pub use info::{TorrentFile, TorrentInfo};
pub use info_hash::InfoHash;
pub use magnet::{MagnetInfo, MagnetParser};
pub use parser::TorrentParser;
