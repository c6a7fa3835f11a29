//! Messages in and out of the engine
//!
//! Handles talk to the engine with [`Command`]s; the connection, tracker and
//! metadata layers feed it [`TransferEvent`]s and receive [`Outgoing`]
//! requests. Work the engine spawns reports back as [`Internal`] messages.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::config::TransferLimits;
use crate::error::{Result, TorrentError};
use crate::peer::PeerSource;
use crate::session::stats::Direction;
use crate::session::status::TorrentState;
use crate::session::transfer::Transfer;
use crate::session::AddTransferParams;
use crate::storage::ResumeData;
use crate::torrent::InfoHash;
use crate::tracker::{AnnounceEntry, AnnounceRequest};

/// A transfer as named by a handle: info hash plus the generation it was added under
pub(crate) type TransferKey = (InfoHash, u64);

/// Read-only visit of a transfer, run on the engine task
pub(crate) type Visit = Box<dyn FnOnce(&Transfer) + Send>;

/// Requests from the session and its handles
pub(crate) enum Command {
    AddTransfer {
        params: Box<AddTransferParams>,
        resume: Option<ResumeData>,
        responder: oneshot::Sender<Result<u64>>,
    },
    RemoveTransfer {
        key: TransferKey,
        responder: oneshot::Sender<Result<()>>,
    },
    /// Dropped unrun when the transfer is gone, which the caller sees as a closed channel
    Inspect {
        key: TransferKey,
        visit: Visit,
    },
    Update {
        key: TransferKey,
        change: TransferChange,
    },
    MoveStorage {
        key: TransferKey,
        path: PathBuf,
        responder: oneshot::Sender<Result<()>>,
    },
    Shutdown {
        responder: oneshot::Sender<()>,
    },
}

/// Mutations queued by handle methods, already validated by the handle
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TransferChange {
    Pause,
    Resume,
    FilterPiece { index: usize, filtered: bool },
    FilterPieces(Vec<bool>),
    FilterFile { index: usize, filtered: bool },
    FilterFiles(Vec<bool>),
    ReplaceTrackers(Vec<AnnounceEntry>),
    UploadLimit(i64),
    DownloadLimit(i64),
    MaxUploads(i32),
    MaxConnections(i32),
    Ratio(f32),
    UseInterface(String),
    TrackerLogin { username: String, password: String },
    ForceReannounce(Option<Duration>),
    ConnectPeer(SocketAddr),
    ChatMessage { addr: SocketAddr, message: String },
}

/// Results of work the engine spawned
pub(crate) enum Internal {
    CheckProgress {
        key: TransferKey,
        progress: f32,
    },
    CheckDone {
        key: TransferKey,
        result: std::result::Result<Vec<bool>, String>,
    },
    PieceHashed {
        key: TransferKey,
        piece: u32,
        result: std::result::Result<bool, String>,
    },
    StorageMoved {
        key: TransferKey,
        path: PathBuf,
        result: Result<()>,
        responder: oneshot::Sender<Result<()>>,
    },
}

/// What the connection, tracker and metadata layers report about a transfer
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    PeerConnected {
        info_hash: InfoHash,
        addr: SocketAddr,
        source: PeerSource,
        peer_id: Option<[u8; 20]>,
    },
    /// Packed bitfield, most significant bit first
    PeerBitfield {
        info_hash: InfoHash,
        addr: SocketAddr,
        bitfield: Vec<u8>,
    },
    PeerHave {
        info_hash: InfoHash,
        addr: SocketAddr,
        piece: u32,
    },
    PeerDisconnected {
        info_hash: InfoHash,
        addr: SocketAddr,
    },
    BlockRequested {
        info_hash: InfoHash,
        addr: SocketAddr,
        piece: u32,
        block: u32,
    },
    /// The block's data has been written to storage
    BlockReceived {
        info_hash: InfoHash,
        piece: u32,
        block: u32,
    },
    BytesTransferred {
        info_hash: InfoHash,
        addr: Option<SocketAddr>,
        direction: Direction,
        payload: u64,
        protocol: u64,
    },
    TrackerReply {
        info_hash: InfoHash,
        url: String,
        interval: Option<Duration>,
        complete: Option<i32>,
        incomplete: Option<i32>,
        peers: Vec<SocketAddr>,
    },
    TrackerError {
        info_hash: InfoHash,
        url: String,
        message: String,
    },
    /// Raw info dictionary fetched from peers
    MetadataReceived {
        info_hash: InfoHash,
        metadata: Vec<u8>,
    },
}

impl TransferEvent {
    /// Transfer the event belongs to
    pub fn info_hash(&self) -> InfoHash {
        match self {
            TransferEvent::PeerConnected { info_hash, .. }
            | TransferEvent::PeerBitfield { info_hash, .. }
            | TransferEvent::PeerHave { info_hash, .. }
            | TransferEvent::PeerDisconnected { info_hash, .. }
            | TransferEvent::BlockRequested { info_hash, .. }
            | TransferEvent::BlockReceived { info_hash, .. }
            | TransferEvent::BytesTransferred { info_hash, .. }
            | TransferEvent::TrackerReply { info_hash, .. }
            | TransferEvent::TrackerError { info_hash, .. }
            | TransferEvent::MetadataReceived { info_hash, .. } => *info_hash,
        }
    }
}

/// Requests and notifications for the layers around the engine
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    /// Open a connection to a peer
    ConnectPeer { info_hash: InfoHash, addr: SocketAddr },
    /// Send a chat message over an open peer connection
    ChatMessage {
        info_hash: InfoHash,
        addr: SocketAddr,
        message: String,
    },
    /// Bind outgoing connections to a network interface
    BindInterface { info_hash: InfoHash, interface: String },
    /// Send an announce
    Announce(AnnounceRequest),
    /// Enforce new rate and connection caps
    ApplyLimits { info_hash: InfoHash, limits: TransferLimits },
    /// Close every connection of the transfer
    Paused { info_hash: InfoHash },
    /// Connections may be opened again
    Resumed { info_hash: InfoHash },
    /// The transfer entered a new lifecycle state
    StateChanged { info_hash: InfoHash, state: TorrentState },
    /// A piece passed its hash check
    PieceFinished { info_hash: InfoHash, piece: u32 },
    /// A piece failed its hash check and will be downloaded again
    HashFailed { info_hash: InfoHash, piece: u32 },
    /// The transfer left the session
    Removed { info_hash: InfoHash },
}

/// Sender for collaborator events
pub type EventSender = mpsc::UnboundedSender<TransferEvent>;

/// Receiver of the engine's outgoing requests
pub type OutgoingReceiver = mpsc::UnboundedReceiver<Outgoing>;

/// A closed command channel means the engine is gone
pub(crate) fn send(commands: &mpsc::UnboundedSender<Command>, command: Command) -> Result<()> {
    commands.send(command).map_err(|_| TorrentError::InvalidHandle)
}
