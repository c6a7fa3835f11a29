//! torrent-session
//!
//! Control plane for BitTorrent transfers: a session engine that owns every
//! transfer, handles that operate on them, per-block download accounting,
//! piece and file filters, status snapshots and resume data.

pub mod cli;
pub mod config;
pub mod error;
pub mod peer;
pub mod session;
pub mod storage;
pub mod torrent;
pub mod tracker;

pub use error::TorrentError;

pub use config::{SessionConfig, TransferLimits};
pub use peer::{PeerInfo, PeerSource};
pub use session::{
    AddTransferParams, Direction, EventSender, Outgoing, OutgoingReceiver, Session, TorrentHandle, TorrentState,
    TorrentStatus, TransferEvent, TransferSource,
};
pub use storage::{
    DownloadQueue, FileStorage, PartialPieceInfo, PieceFilter, ResumeData, ResumeManager, StorageBackend,
    StorageConstructor,
};
pub use torrent::{InfoHash, MagnetInfo, MagnetParser, TorrentInfo, TorrentParser};
pub use tracker::{AnnounceEntry, AnnounceEvent, AnnounceRequest};
pub use cli::{CliArgs, Config, ProgressDisplay};
