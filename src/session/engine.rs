//! Engine task
//!
//! The engine is the only owner of transfer state. It processes handle
//! commands, collaborator events and the results of work it spawned, one at a
//! time, so no transfer is ever touched from two places at once.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use crate::config::SessionConfig;
use crate::error::{Result, TorrentError};
use crate::session::command::{Command, Internal, Outgoing, TransferChange, TransferEvent, TransferKey};
use crate::session::status::TorrentState;
use crate::session::transfer::Transfer;
use crate::session::{AddTransferParams, Registry, TransferSource};
use crate::storage::{RequestOutcome, ResumeData, SharedStorage};
use crate::torrent::{InfoHash, TorrentInfo, TorrentParser};
use crate::tracker::AnnounceEvent;

struct Engine {
    config: SessionConfig,
    registry: Arc<Registry>,
    transfers: HashMap<InfoHash, Transfer>,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    internal: mpsc::UnboundedSender<Internal>,
    /// Transfers waiting to check their files, in add order
    checking_queue: VecDeque<TransferKey>,
    /// Transfer whose files are being checked
    checking: Option<TransferKey>,
    last_tick: Instant,
}

/// Spawn the engine task
pub(crate) fn spawn_engine(
    config: SessionConfig,
    registry: Arc<Registry>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedReceiver<TransferEvent>,
    outgoing: mpsc::UnboundedSender<Outgoing>,
) {
    let (internal_tx, internal_rx) = mpsc::unbounded_channel();
    let engine = Engine {
        config,
        registry,
        transfers: HashMap::new(),
        outgoing,
        internal: internal_tx,
        checking_queue: VecDeque::new(),
        checking: None,
        last_tick: Instant::now(),
    };
    tokio::spawn(run_engine_loop(engine, commands, events, internal_rx));
}

/// Runs until the session is dropped or shut down
async fn run_engine_loop(
    mut engine: Engine,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut events: mpsc::UnboundedReceiver<TransferEvent>,
    mut internal: mpsc::UnboundedReceiver<Internal>,
) {
    debug!("Engine task started");
    let mut ticker = tokio::time::interval(engine.config.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    debug!("Session dropped");
                    break;
                };
                if !engine.handle_command(command) {
                    break;
                }
            }
            Some(event) = events.recv() => engine.handle_event(event),
            Some(message) = internal.recv() => engine.handle_internal(message),
            _ = ticker.tick() => engine.tick(Instant::now()),
        }
    }

    engine.registry.shut_down();
    debug!("Engine task stopped");
}

/// The transfer a key names, if that generation is still live
fn lookup(transfers: &mut HashMap<InfoHash, Transfer>, key: TransferKey) -> Option<&mut Transfer> {
    transfers.get_mut(&key.0).filter(|t| t.generation == key.1)
}

fn emit(outgoing: &mpsc::UnboundedSender<Outgoing>, message: Outgoing) {
    if outgoing.send(message).is_err() {
        trace!("Outgoing receiver dropped");
    }
}

fn announce(outgoing: &mpsc::UnboundedSender<Outgoing>, transfer: &mut Transfer, event: AnnounceEvent, now: Instant) {
    if let Some(request) = transfer.announce(event, now) {
        debug!("Announcing {:?} for {} to {}", request.event, transfer.name, request.url);
        emit(outgoing, Outgoing::Announce(request));
    }
}

impl Engine {
    /// Returns false when the loop should stop
    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::AddTransfer {
                params,
                resume,
                responder,
            } => {
                let _ = responder.send(self.add_transfer(*params, resume));
            }
            Command::RemoveTransfer { key, responder } => {
                let _ = responder.send(self.remove_transfer(key));
            }
            Command::Inspect { key, visit } => match self.transfers.get(&key.0) {
                Some(transfer) if transfer.generation == key.1 => visit(transfer),
                _ => trace!("Inspect of stale transfer {}", key.0),
            },
            Command::Update { key, change } => self.apply_change(key, change),
            Command::MoveStorage { key, path, responder } => self.move_storage(key, path, responder),
            Command::Shutdown { responder } => {
                info!("Engine shutting down with {} transfers", self.transfers.len());
                self.registry.shut_down();
                let _ = responder.send(());
                return false;
            }
        }
        true
    }

    fn add_transfer(&mut self, params: AddTransferParams, resume: Option<ResumeData>) -> Result<u64> {
        let info_hash = params.info_hash();
        if self.transfers.contains_key(&info_hash) {
            return Err(TorrentError::DuplicateTransfer { info_hash });
        }
        let (num_pieces, num_files) = match &params.source {
            TransferSource::Torrent(info) => (info.piece_count(), info.file_count()),
            TransferSource::Magnet(_) => (0, 0),
        };
        let generation = self
            .registry
            .insert(info_hash, num_pieces, num_files)
            .ok_or(TorrentError::DuplicateTransfer { info_hash })?;

        let transfer = Transfer::new(generation, params, resume, &self.config, Instant::now());
        info!("Added transfer {} ({}), {}", transfer.name, info_hash, transfer.state);
        if transfer.state == TorrentState::QueuedForChecking {
            self.checking_queue.push_back(transfer.key());
        }
        emit(
            &self.outgoing,
            Outgoing::StateChanged {
                info_hash,
                state: transfer.state,
            },
        );
        self.transfers.insert(info_hash, transfer);
        self.start_next_check();
        Ok(generation)
    }

    fn remove_transfer(&mut self, key: TransferKey) -> Result<()> {
        let Some(transfer) = lookup(&mut self.transfers, key) else {
            return Err(TorrentError::InvalidHandle);
        };
        if !transfer.paused && transfer.state.is_active() {
            announce(&self.outgoing, transfer, AnnounceEvent::Stopped, Instant::now());
        }
        let name = transfer.name.clone();

        self.registry.remove(key);
        self.transfers.remove(&key.0);
        self.checking_queue.retain(|queued| *queued != key);
        if self.checking == Some(key) {
            self.checking = None;
        }
        emit(&self.outgoing, Outgoing::Removed { info_hash: key.0 });
        info!("Removed transfer {} ({})", name, key.0);
        self.start_next_check();
        Ok(())
    }

    fn apply_change(&mut self, key: TransferKey, change: TransferChange) {
        let now = Instant::now();
        let Some(transfer) = lookup(&mut self.transfers, key) else {
            trace!("Dropping change for stale transfer {}", key.0);
            return;
        };
        let info_hash = key.0;

        match change {
            TransferChange::Pause => {
                if transfer.paused {
                    return;
                }
                transfer.paused = true;
                for addr in transfer.peers.clear() {
                    transfer.queue.abandon_peer(addr);
                }
                transfer.stats.clear_rates();
                emit(&self.outgoing, Outgoing::Paused { info_hash });
                if transfer.state.is_active() {
                    announce(&self.outgoing, transfer, AnnounceEvent::Stopped, now);
                }
                info!("Paused {}", transfer.name);
            }
            TransferChange::Resume => {
                if !transfer.paused {
                    return;
                }
                transfer.paused = false;
                transfer.error = None;
                emit(&self.outgoing, Outgoing::Resumed { info_hash });
                if transfer.state.is_active() {
                    transfer.trackers.force_reannounce(None, now);
                }
                let requeue = transfer.state == TorrentState::QueuedForChecking
                    && self.checking != Some(key)
                    && !self.checking_queue.contains(&key);
                info!("Resumed {}", transfer.name);
                if requeue {
                    self.checking_queue.push_back(key);
                    self.start_next_check();
                }
            }
            TransferChange::FilterPiece { index, filtered } => {
                if let Err(e) = transfer.filter.set_piece(index, !filtered) {
                    warn!("Piece filter not applied: {}", e);
                }
                Self::filter_changed(&self.outgoing, transfer);
            }
            TransferChange::FilterPieces(filtered) => {
                let wanted: Vec<bool> = filtered.iter().map(|&f| !f).collect();
                if let Err(e) = transfer.filter.set_pieces(&wanted) {
                    warn!("Piece filter not applied: {}", e);
                }
                Self::filter_changed(&self.outgoing, transfer);
            }
            TransferChange::FilterFile { index, filtered } => {
                if let Err(e) = transfer.filter.set_file(index, !filtered) {
                    warn!("File filter not applied: {}", e);
                }
                Self::filter_changed(&self.outgoing, transfer);
            }
            TransferChange::FilterFiles(filtered) => {
                let wanted: Vec<bool> = filtered.iter().map(|&f| !f).collect();
                if let Err(e) = transfer.filter.set_files(&wanted) {
                    warn!("File filter not applied: {}", e);
                }
                Self::filter_changed(&self.outgoing, transfer);
            }
            TransferChange::ReplaceTrackers(entries) => {
                info!("{}: {} trackers", transfer.name, entries.len());
                transfer.trackers.replace(entries, now);
            }
            TransferChange::UploadLimit(limit) => {
                transfer.limits.upload_limit = limit;
                Self::limits_changed(&self.outgoing, transfer);
            }
            TransferChange::DownloadLimit(limit) => {
                transfer.limits.download_limit = limit;
                Self::limits_changed(&self.outgoing, transfer);
            }
            TransferChange::MaxUploads(limit) => {
                transfer.limits.max_uploads = limit;
                Self::limits_changed(&self.outgoing, transfer);
            }
            TransferChange::MaxConnections(limit) => {
                transfer.limits.max_connections = limit;
                Self::limits_changed(&self.outgoing, transfer);
            }
            TransferChange::Ratio(ratio) => {
                transfer.limits.ratio = ratio;
                Self::limits_changed(&self.outgoing, transfer);
            }
            TransferChange::UseInterface(interface) => {
                transfer.interface = Some(interface.clone());
                emit(&self.outgoing, Outgoing::BindInterface { info_hash, interface });
            }
            TransferChange::TrackerLogin { username, password } => {
                transfer.trackers.set_login(username, password);
            }
            TransferChange::ForceReannounce(delay) => {
                transfer.trackers.force_reannounce(delay, now);
            }
            TransferChange::ConnectPeer(addr) => {
                if transfer.paused {
                    debug!("Not connecting to {} while {} is paused", addr, transfer.name);
                    return;
                }
                emit(&self.outgoing, Outgoing::ConnectPeer { info_hash, addr });
            }
            TransferChange::ChatMessage { addr, message } => {
                // the peer may have left since the handle checked
                if !transfer.peers.contains(&addr) {
                    debug!("Dropping chat message to disconnected peer {}", addr);
                    return;
                }
                emit(
                    &self.outgoing,
                    Outgoing::ChatMessage {
                        info_hash,
                        addr,
                        message,
                    },
                );
            }
        }
    }

    fn filter_changed(outgoing: &mpsc::UnboundedSender<Outgoing>, transfer: &mut Transfer) {
        if let Some(state) = transfer.refresh_state() {
            emit(
                outgoing,
                Outgoing::StateChanged {
                    info_hash: transfer.info_hash,
                    state,
                },
            );
        }
    }

    fn limits_changed(outgoing: &mpsc::UnboundedSender<Outgoing>, transfer: &Transfer) {
        emit(
            outgoing,
            Outgoing::ApplyLimits {
                info_hash: transfer.info_hash,
                limits: transfer.limits,
            },
        );
    }

    fn move_storage(
        &mut self,
        key: TransferKey,
        path: PathBuf,
        responder: tokio::sync::oneshot::Sender<Result<()>>,
    ) {
        let Some(transfer) = lookup(&mut self.transfers, key) else {
            let _ = responder.send(Err(TorrentError::InvalidHandle));
            return;
        };
        let Some(storage) = transfer.storage.clone() else {
            // Nothing on disk yet
            info!("{}: save path is now {}", transfer.name, path.display());
            transfer.save_path = path;
            let _ = responder.send(Ok(()));
            return;
        };

        let internal = self.internal.clone();
        tokio::spawn(async move {
            let result = storage.lock().await.move_to(&path).await.map_err(|e| match e.downcast::<TorrentError>() {
                Ok(err @ TorrentError::StorageMoveFailed { .. }) => err,
                Ok(err) => TorrentError::storage_move_failed("could not move storage", path.display().to_string(), err.to_string()),
                Err(e) => TorrentError::storage_move_failed("could not move storage", path.display().to_string(), format!("{:#}", e)),
            });
            let _ = internal.send(Internal::StorageMoved {
                key,
                path,
                result,
                responder,
            });
        });
    }

    fn handle_event(&mut self, event: TransferEvent) {
        let info_hash = event.info_hash();
        let Some(transfer) = self.transfers.get_mut(&info_hash) else {
            trace!("Event for unknown transfer {}", info_hash);
            return;
        };
        let key = transfer.key();
        let now = Instant::now();

        match event {
            TransferEvent::PeerConnected {
                addr, source, peer_id, ..
            } => {
                if transfer.paused {
                    debug!("Ignoring peer {} of paused {}", addr, transfer.name);
                    return;
                }
                transfer.peers.connected(addr, source, peer_id);
            }
            TransferEvent::PeerBitfield { addr, bitfield, .. } => {
                if let Err(e) = transfer.peers.set_bitfield(addr, &bitfield) {
                    debug!("Bad bitfield from {}: {}", addr, e);
                }
            }
            TransferEvent::PeerHave { addr, piece, .. } => {
                if let Err(e) = transfer.peers.have(addr, piece as usize) {
                    debug!("Bad have from {}: {}", addr, e);
                }
            }
            TransferEvent::PeerDisconnected { addr, .. } => {
                transfer.peers.disconnected(addr);
                let abandoned = transfer.queue.abandon_peer(addr);
                if abandoned > 0 {
                    debug!("Abandoned {} requests to {}", abandoned, addr);
                }
            }
            TransferEvent::BlockRequested {
                addr, piece, block, ..
            } => match transfer.queue.begin_request(piece, block, addr) {
                Ok(RequestOutcome::First) => {}
                Ok(outcome) => trace!("Block {}:{} requested again from {} ({:?})", piece, block, addr, outcome),
                Err(e) => debug!("Request from {} not recorded: {}", addr, e),
            },
            TransferEvent::BlockReceived { piece, block, .. } => {
                if let Err(e) = transfer.queue.mark_finished(piece, block) {
                    debug!("Block {}:{} not recorded: {}", piece, block, e);
                    return;
                }
                if transfer.queue.piece_complete(piece) && transfer.hashing.insert(piece) {
                    if let Some(storage) = transfer.storage.clone() {
                        spawn_hash(&self.internal, key, storage, piece);
                    }
                }
            }
            TransferEvent::BytesTransferred {
                addr,
                direction,
                payload,
                protocol,
                ..
            } => {
                transfer.stats.record(direction, payload, protocol);
                if let Some(addr) = addr {
                    transfer.peers.record(addr, direction, payload, protocol);
                }
            }
            TransferEvent::TrackerReply {
                url,
                interval,
                complete,
                incomplete,
                peers,
                ..
            } => {
                transfer.trackers.on_reply(&url, interval, complete, incomplete, now);
                if transfer.state == TorrentState::ConnectingToTracker {
                    transfer.state = TorrentState::Downloading;
                    transfer.refresh_state();
                    emit(
                        &self.outgoing,
                        Outgoing::StateChanged {
                            info_hash,
                            state: transfer.state,
                        },
                    );
                }
                if transfer.paused {
                    return;
                }
                for addr in peers {
                    if !transfer.peers.contains(&addr) {
                        emit(&self.outgoing, Outgoing::ConnectPeer { info_hash, addr });
                    }
                }
            }
            TransferEvent::TrackerError { url, message, .. } => {
                transfer.trackers.on_error(&url, message, now);
            }
            TransferEvent::MetadataReceived { metadata, .. } => {
                if transfer.info.is_some() {
                    trace!("Metadata for {} already known", info_hash);
                    return;
                }
                let info = match parse_metadata(&info_hash, &metadata) {
                    Ok(info) => info,
                    Err(e) => {
                        warn!("Rejected metadata for {}: {}", info_hash, e);
                        return;
                    }
                };
                transfer.set_metadata(Arc::new(info));
                let (num_pieces, num_files) = transfer.layout();
                self.registry.set_layout(key, num_pieces, num_files);
                emit(
                    &self.outgoing,
                    Outgoing::StateChanged {
                        info_hash,
                        state: transfer.state,
                    },
                );
                self.checking_queue.push_back(key);
                self.start_next_check();
            }
        }
    }

    fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::CheckProgress { key, progress } => {
                if let Some(transfer) = lookup(&mut self.transfers, key) {
                    transfer.check_progress = progress;
                }
            }
            Internal::CheckDone { key, result } => {
                if self.checking == Some(key) {
                    self.checking = None;
                }
                if let Some(transfer) = lookup(&mut self.transfers, key) {
                    match result {
                        Ok(have) => transfer.checked(have),
                        Err(message) => {
                            error!("Checking {} failed: {}", transfer.name, message);
                            transfer.error = Some(message);
                            transfer.paused = true;
                            transfer.state = TorrentState::QueuedForChecking;
                            emit(&self.outgoing, Outgoing::Paused { info_hash: key.0 });
                        }
                    }
                    emit(
                        &self.outgoing,
                        Outgoing::StateChanged {
                            info_hash: key.0,
                            state: transfer.state,
                        },
                    );
                }
                self.start_next_check();
            }
            Internal::PieceHashed { key, piece, result } => {
                let Some(transfer) = lookup(&mut self.transfers, key) else {
                    return;
                };
                transfer.hashing.remove(&piece);
                match result {
                    Ok(true) => {
                        transfer.piece_passed(piece);
                        trace!("{}: piece {} verified", transfer.name, piece);
                        emit(&self.outgoing, Outgoing::PieceFinished { info_hash: key.0, piece });
                        if let Some(state) = transfer.refresh_state() {
                            emit(&self.outgoing, Outgoing::StateChanged { info_hash: key.0, state });
                            if matches!(state, TorrentState::Finished | TorrentState::Seeding) && !transfer.paused {
                                info!("{} is {}", transfer.name, state);
                                announce(&self.outgoing, transfer, AnnounceEvent::Completed, Instant::now());
                            }
                        }
                    }
                    Ok(false) => {
                        transfer.queue.hash_failed(piece);
                        transfer.total_failed_bytes += transfer.queue.layout().piece_size(piece);
                        warn!("{}: piece {} failed its hash check", transfer.name, piece);
                        emit(&self.outgoing, Outgoing::HashFailed { info_hash: key.0, piece });
                    }
                    Err(message) => {
                        transfer.queue.hash_failed(piece);
                        warn!("{}: could not hash piece {}: {}", transfer.name, piece, message);
                    }
                }
            }
            Internal::StorageMoved {
                key,
                path,
                result,
                responder,
            } => {
                let result = match lookup(&mut self.transfers, key) {
                    Some(transfer) => {
                        if result.is_ok() {
                            info!("{}: storage moved to {}", transfer.name, path.display());
                            transfer.save_path = path;
                        }
                        result
                    }
                    None => Err(TorrentError::InvalidHandle),
                };
                let _ = responder.send(result);
            }
        }
    }

    fn tick(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_tick);
        self.last_tick = now;

        for transfer in self.transfers.values_mut() {
            transfer.stats.tick(elapsed);
            transfer.peers.tick(elapsed);
            if !transfer.paused && transfer.state.is_active() && transfer.trackers.is_due(now) {
                announce(&self.outgoing, transfer, AnnounceEvent::None, now);
            }
        }
        self.start_next_check();
    }

    /// Start checking the next queued transfer unless a check is running
    fn start_next_check(&mut self) {
        if self.checking.is_some() {
            return;
        }
        while let Some(key) = self.checking_queue.pop_front() {
            let Some(transfer) = lookup(&mut self.transfers, key) else {
                continue;
            };
            if transfer.state != TorrentState::QueuedForChecking || transfer.error.is_some() {
                continue;
            }
            let (Some(info), Some(storage)) = (transfer.info.clone(), transfer.storage.clone()) else {
                continue;
            };
            transfer.state = TorrentState::CheckingFiles;
            transfer.check_progress = 0.0;
            let claims = transfer.resume_claims();
            info!(
                "Checking {} ({})",
                transfer.name,
                if claims.is_some() { "trusting resume data" } else { "full hash check" }
            );
            emit(
                &self.outgoing,
                Outgoing::StateChanged {
                    info_hash: key.0,
                    state: TorrentState::CheckingFiles,
                },
            );

            self.checking = Some(key);
            let internal = self.internal.clone();
            let step = self.config.check_progress_step;
            tokio::spawn(async move {
                let result = check_files(key, &info, &storage, claims.as_deref(), step, &internal)
                    .await
                    .map_err(|e| format!("{:#}", e));
                let _ = internal.send(Internal::CheckDone { key, result });
            });
            return;
        }
    }
}

/// Parse metadata fetched from peers, rejecting bytes that do not hash to the transfer's info hash
fn parse_metadata(info_hash: &InfoHash, metadata: &[u8]) -> anyhow::Result<TorrentInfo> {
    let actual = InfoHash::of_info_dict(metadata);
    if actual != *info_hash {
        anyhow::bail!("metadata hashes to {}", actual);
    }
    TorrentParser::parse_info_dict(metadata)
}

fn spawn_hash(internal: &mpsc::UnboundedSender<Internal>, key: TransferKey, storage: SharedStorage, piece: u32) {
    let internal = internal.clone();
    tokio::spawn(async move {
        let result = storage
            .lock()
            .await
            .verify_hash(piece)
            .await
            .map_err(|e| format!("{:#}", e));
        let _ = internal.send(Internal::PieceHashed { key, piece, result });
    });
}

/// Find which pieces are already on disk, then allocate the rest
///
/// A piece counts only if all of its bytes are present. With resume data the
/// claimed pieces are trusted, otherwise every present piece is hashed.
async fn check_files(
    key: TransferKey,
    info: &TorrentInfo,
    storage: &SharedStorage,
    claims: Option<&[bool]>,
    step: usize,
    internal: &mpsc::UnboundedSender<Internal>,
) -> anyhow::Result<Vec<bool>> {
    let mut storage = storage.lock().await;
    let count = info.piece_count();
    let mut have = vec![false; count];

    for piece in 0..count {
        let present = storage.bytes_present(piece as u32).await?;
        if present >= info.piece_size(piece) {
            have[piece] = match claims {
                Some(claims) => claims.get(piece).copied().unwrap_or(false),
                None => storage.verify_hash(piece as u32).await?,
            };
        }
        if (piece + 1) % step == 0 {
            let _ = internal.send(Internal::CheckProgress {
                key,
                progress: (piece + 1) as f32 / count as f32,
            });
        }
    }

    storage.allocate().await?;
    Ok(have)
}
