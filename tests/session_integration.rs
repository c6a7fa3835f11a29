//! End-to-end tests of a session over local-disk storage

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sha1::{Digest, Sha1};
use tempfile::TempDir;
use torrent_session::storage::ResumeData;
use torrent_session::torrent::TorrentFile;
use torrent_session::{
    AddTransferParams, AnnounceEntry, AnnounceEvent, FileStorage, InfoHash, Outgoing, OutgoingReceiver, PeerSource,
    Session, SessionConfig, TorrentError, TorrentHandle, TorrentInfo, TorrentState, TorrentStatus, TransferEvent,
};

const PIECE_LENGTH: u64 = 32;

/// 96 bytes in two files (40 + 56), three 32-byte pieces, 16-byte blocks
fn payload() -> Vec<u8> {
    (0..96u8).map(|b| b.wrapping_mul(7).wrapping_add(3)).collect()
}

fn torrent(tag: u8) -> Arc<TorrentInfo> {
    let data = payload();
    let pieces = data
        .chunks(PIECE_LENGTH as usize)
        .map(|chunk| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(&Sha1::digest(chunk));
            hash
        })
        .collect();
    Arc::new(TorrentInfo {
        info_hash: InfoHash::new([tag; 20]),
        name: "payload".to_string(),
        piece_length: PIECE_LENGTH,
        pieces,
        files: vec![
            TorrentFile {
                path: vec!["a.bin".to_string()],
                length: 40,
            },
            TorrentFile {
                path: vec!["b.bin".to_string()],
                length: 56,
            },
        ],
        multi_file: true,
        announce_tiers: Vec::new(),
        metadata: Vec::new(),
    })
}

/// Write the first `len` bytes of the payload where local storage expects them
fn write_payload(save_path: &Path, len: usize) {
    let data = payload();
    let dir = save_path.join("payload");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("a.bin"), &data[..len.min(40)]).unwrap();
    if len > 40 {
        std::fs::write(dir.join("b.bin"), &data[40..len]).unwrap();
    }
}

fn config() -> SessionConfig {
    SessionConfig {
        block_size: 16,
        ..SessionConfig::default()
    }
}

async fn add(session: &Session, tag: u8, save_path: PathBuf) -> TorrentHandle {
    session
        .add_transfer(AddTransferParams::from_torrent(torrent(tag), save_path))
        .await
        .unwrap()
}

/// Poll until the status satisfies `done`
async fn wait_for(handle: &TorrentHandle, done: impl Fn(&TorrentStatus) -> bool) -> TorrentStatus {
    for _ in 0..500 {
        let status = handle.status().await.unwrap();
        if done(&status) {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("status never reached the expected state: {:?}", handle.status().await);
}

/// Next outgoing message accepted by `pick`, skipping the rest
async fn next_outgoing<T>(outgoing: &mut OutgoingReceiver, pick: impl Fn(Outgoing) -> Option<T>) -> T {
    let wait = async {
        loop {
            let message = outgoing.recv().await.expect("engine stopped");
            if let Some(found) = pick(message) {
                return found;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("expected outgoing message never arrived")
}

fn checked(status: &TorrentStatus) -> bool {
    status.state.is_active()
}

#[tokio::test]
async fn test_check_finds_present_pieces() {
    let dir = TempDir::new().unwrap();
    // b.bin stops inside piece 2
    write_payload(dir.path(), 80);
    let (session, _outgoing) = Session::spawn(config()).unwrap();
    let handle = add(&session, 1, dir.path().to_path_buf()).await;

    let status = wait_for(&handle, checked).await;
    assert_eq!(status.state, TorrentState::Downloading);
    assert_eq!(*status.pieces, vec![true, true, false]);
    assert_eq!(status.num_pieces, 2);
    assert_eq!(status.total_done, 64);
    assert_eq!(status.total_wanted, 96);
    assert!((status.progress - 64.0 / 96.0).abs() < 1e-6);
    assert_eq!(status.block_size, 16);
    assert_eq!(status.num_complete, -1);
    assert!(!handle.is_seed().await.unwrap());
}

#[tokio::test]
async fn test_complete_data_seeds() {
    let dir = TempDir::new().unwrap();
    write_payload(dir.path(), 96);
    let (session, _outgoing) = Session::spawn(config()).unwrap();
    let handle = add(&session, 2, dir.path().to_path_buf()).await;

    let status = wait_for(&handle, checked).await;
    assert_eq!(status.state, TorrentState::Seeding);
    assert!((status.progress - 1.0).abs() < f32::EPSILON);
    assert!(handle.is_seed().await.unwrap());
    assert!(handle.has_metadata().await.unwrap());
}

#[tokio::test]
async fn test_corrupt_piece_is_not_trusted() {
    let dir = TempDir::new().unwrap();
    write_payload(dir.path(), 96);
    let mut data = std::fs::read(dir.path().join("payload/a.bin")).unwrap();
    data[0] ^= 0xff;
    std::fs::write(dir.path().join("payload/a.bin"), data).unwrap();

    let (session, _outgoing) = Session::spawn(config()).unwrap();
    let handle = add(&session, 3, dir.path().to_path_buf()).await;
    let status = wait_for(&handle, checked).await;
    assert_eq!(*status.pieces, vec![false, true, true]);
}

#[tokio::test]
async fn test_filters_change_wanted_accounting_only() {
    let dir = TempDir::new().unwrap();
    write_payload(dir.path(), 80);
    let (session, _outgoing) = Session::spawn(config()).unwrap();
    let handle = add(&session, 4, dir.path().to_path_buf()).await;
    let before = wait_for(&handle, checked).await;

    // Piece 2 lies entirely in b.bin; piece 1 is shared with a.bin
    handle.filter_file(1, true).unwrap();
    let status = wait_for(&handle, |s| s.state == TorrentState::Finished).await;
    assert_eq!(handle.filtered_pieces().await.unwrap(), vec![false, false, true]);
    assert_eq!(handle.filtered_files().await.unwrap(), vec![false, true]);
    assert_eq!(status.total_done, before.total_done);
    assert_eq!(status.total_wanted, 64);
    assert_eq!(status.total_wanted_done, 64);

    handle.filter_piece(0, true).unwrap();
    assert!(handle.is_piece_filtered(0).await.unwrap());
    handle.filter_pieces(vec![false, false, false]).unwrap();
    let status = wait_for(&handle, |s| s.state == TorrentState::Downloading).await;
    assert_eq!(status.total_done, before.total_done);
    assert_eq!(status.total_wanted, 96);
}

#[tokio::test]
async fn test_ratio_domain() {
    let dir = TempDir::new().unwrap();
    let (session, _outgoing) = Session::spawn(config()).unwrap();
    let handle = add(&session, 5, dir.path().to_path_buf()).await;

    assert!(matches!(handle.set_ratio(0.5), Err(TorrentError::InvalidArgument { .. })));
    assert!(handle.set_ratio(0.0).is_ok());
    assert!(handle.set_ratio(2.5).is_ok());
    assert_eq!(handle.limits().await.unwrap().ratio, 2.5);
}

#[tokio::test]
async fn test_move_storage() {
    let dir = TempDir::new().unwrap();
    let original = dir.path().join("original");
    write_payload(&original, 96);
    let (session, _outgoing) = Session::spawn(config()).unwrap();
    let handle = add(&session, 6, original.clone()).await;
    wait_for(&handle, checked).await;

    // A regular file where a directory is needed
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"x").unwrap();
    let result = handle.move_storage(blocker.join("inside")).await;
    assert!(matches!(result, Err(TorrentError::StorageMoveFailed { .. })));
    assert_eq!(handle.save_path().await.unwrap(), original);
    assert!(original.join("payload/a.bin").exists());

    let target = dir.path().join("moved");
    handle.move_storage(&target).await.unwrap();
    assert_eq!(handle.save_path().await.unwrap(), target);
    assert_eq!(std::fs::read(target.join("payload/b.bin")).unwrap(), payload()[40..].to_vec());
    assert!(!original.join("payload/b.bin").exists());
}

#[tokio::test]
async fn test_removed_handle_is_invalid_everywhere() {
    let dir = TempDir::new().unwrap();
    let (session, _outgoing) = Session::spawn(config()).unwrap();
    let handle = add(&session, 7, dir.path().to_path_buf()).await;
    let copy = handle.clone();
    session.remove_transfer(&handle).await.unwrap();

    let invalid = Err(TorrentError::InvalidHandle);
    let addr: SocketAddr = "10.0.0.1:6881".parse().unwrap();
    assert!(!copy.is_valid());
    assert_eq!(copy.info_hash().map(|_| ()), invalid.clone());
    assert_eq!(copy.status().await.map(|_| ()), invalid.clone());
    assert_eq!(copy.get_peer_info().await.map(|_| ()), invalid.clone());
    assert_eq!(copy.get_download_queue().await.map(|_| ()), invalid.clone());
    assert_eq!(copy.trackers().await.map(|_| ()), invalid.clone());
    assert_eq!(copy.metadata().await.map(|_| ()), invalid.clone());
    assert_eq!(copy.torrent_info().await.map(|_| ()), invalid.clone());
    assert_eq!(copy.is_seed().await.map(|_| ()), invalid.clone());
    assert_eq!(copy.is_paused().await.map(|_| ()), invalid.clone());
    assert_eq!(copy.has_metadata().await.map(|_| ()), invalid.clone());
    assert_eq!(copy.save_path().await.map(|_| ()), invalid.clone());
    assert_eq!(copy.filtered_pieces().await.map(|_| ()), invalid.clone());
    assert_eq!(copy.is_piece_filtered(0).await.map(|_| ()), invalid.clone());
    assert_eq!(copy.filtered_files().await.map(|_| ()), invalid.clone());
    assert_eq!(copy.write_resume_data().await.map(|_| ()), invalid.clone());
    assert_eq!(copy.pause(), invalid.clone());
    assert_eq!(copy.resume(), invalid.clone());
    assert_eq!(copy.filter_piece(0, true), invalid.clone());
    assert_eq!(copy.filter_pieces(vec![true; 3]), invalid.clone());
    assert_eq!(copy.filter_file(0, true), invalid.clone());
    assert_eq!(copy.filter_files(vec![true; 2]), invalid.clone());
    assert_eq!(copy.replace_trackers(Vec::new()), invalid.clone());
    assert_eq!(copy.set_upload_limit(100), invalid.clone());
    assert_eq!(copy.set_download_limit(100), invalid.clone());
    assert_eq!(copy.set_max_uploads(4), invalid.clone());
    assert_eq!(copy.set_max_connections(4), invalid.clone());
    assert_eq!(copy.set_ratio(2.0), invalid.clone());
    assert_eq!(copy.use_interface("eth0"), invalid.clone());
    assert_eq!(copy.set_tracker_login("user", "pass"), invalid.clone());
    assert_eq!(copy.force_reannounce(), invalid.clone());
    assert_eq!(copy.force_reannounce_in(Duration::from_secs(5)), invalid.clone());
    assert_eq!(copy.connect_peer(addr), invalid.clone());
    assert_eq!(copy.send_chat_message(addr, "hi").await, invalid.clone());
    assert_eq!(copy.move_storage(dir.path().join("elsewhere")).await, invalid.clone());
    assert_eq!(session.remove_transfer(&copy).await, invalid);

    // A new transfer under the same info hash does not revive old handles
    let fresh = add(&session, 7, dir.path().to_path_buf()).await;
    assert!(fresh.is_valid());
    assert!(!copy.is_valid());
    assert_eq!(fresh, copy);
}

#[tokio::test]
async fn test_removal_fails_query_in_flight() {
    let dir = TempDir::new().unwrap();
    let (session, _outgoing) = Session::spawn(config()).unwrap();
    let handle = add(&session, 16, dir.path().to_path_buf()).await;

    // Both commands are queued before the engine runs; the removal goes first
    let (removed, status) = tokio::join!(session.remove_transfer(&handle), handle.status());
    removed.unwrap();
    assert_eq!(status.map(|_| ()), Err(TorrentError::InvalidHandle));
    assert!(!handle.is_valid());
}

#[tokio::test]
async fn test_removal_fails_move_in_flight() {
    let dir = TempDir::new().unwrap();
    let original = dir.path().join("original");
    write_payload(&original, 96);
    let (session, _outgoing) = Session::spawn(config()).unwrap();
    let handle = add(&session, 17, original).await;
    wait_for(&handle, checked).await;

    let target = dir.path().join("moved");
    let (moved, removed) = tokio::join!(handle.move_storage(&target), session.remove_transfer(&handle));
    removed.unwrap();
    assert_eq!(moved, Err(TorrentError::InvalidHandle));
    assert!(session.transfers().is_empty());
}

#[tokio::test]
async fn test_duplicate_transfer() {
    let dir = TempDir::new().unwrap();
    let (session, _outgoing) = Session::spawn(config()).unwrap();
    let handle = add(&session, 8, dir.path().to_path_buf()).await;

    let result = session
        .add_transfer(AddTransferParams::from_torrent(torrent(8), dir.path().to_path_buf()))
        .await;
    assert!(matches!(result, Err(TorrentError::DuplicateTransfer { .. })));
    assert_eq!(session.find_transfer(&InfoHash::new([8; 20])), Some(handle.clone()));
    assert_eq!(session.transfers(), vec![handle]);
}

#[tokio::test]
async fn test_resume_round_trip() {
    let dir = TempDir::new().unwrap();
    write_payload(dir.path(), 80);
    let (session, _outgoing) = Session::spawn(config()).unwrap();
    let handle = add(&session, 9, dir.path().to_path_buf()).await;
    wait_for(&handle, checked).await;

    handle.filter_piece(0, true).unwrap();
    handle.set_upload_limit(5000).unwrap();
    handle
        .replace_trackers(vec![AnnounceEntry::new("http://tracker.example/announce", 0)])
        .unwrap();
    let original = handle.status().await.unwrap();
    let filtered = handle.filtered_pieces().await.unwrap();
    let resume = handle.write_resume_data().await.unwrap();
    assert_eq!(resume.have_pieces(), vec![true, true, false]);
    let bytes = resume.to_bytes().unwrap();
    session.remove_transfer(&handle).await.unwrap();

    let handle = session
        .add_transfer(AddTransferParams::from_torrent(torrent(9), dir.path().to_path_buf()).with_resume(bytes))
        .await
        .unwrap();
    let status = wait_for(&handle, checked).await;
    assert_eq!(status.pieces, original.pieces);
    assert_eq!(handle.filtered_pieces().await.unwrap(), filtered);
    assert_eq!(handle.filtered_files().await.unwrap(), vec![false, false]);
    assert_eq!(handle.limits().await.unwrap().upload_limit, 5000);
    assert_eq!(handle.trackers().await.unwrap()[0].url, "http://tracker.example/announce");
}

#[tokio::test]
async fn test_resume_for_another_torrent_is_rejected() {
    let dir = TempDir::new().unwrap();
    let (session, _outgoing) = Session::spawn(config()).unwrap();
    let foreign = ResumeData::new(InfoHash::new([99; 20]), 3, dir.path().to_path_buf());

    let result = session
        .add_transfer(
            AddTransferParams::from_torrent(torrent(10), dir.path().to_path_buf())
                .with_resume(foreign.to_bytes().unwrap()),
        )
        .await;
    assert!(matches!(result, Err(TorrentError::ResumeMismatch { .. })));

    let wrong_layout = ResumeData::new(InfoHash::new([10; 20]), 7, dir.path().to_path_buf());
    let result = session
        .add_transfer(
            AddTransferParams::from_torrent(torrent(10), dir.path().to_path_buf())
                .with_resume(wrong_layout.to_bytes().unwrap()),
        )
        .await;
    assert!(matches!(result, Err(TorrentError::ResumeMismatch { .. })));
    assert!(session.transfers().is_empty());
}

#[tokio::test]
async fn test_downloaded_piece_is_verified() {
    let dir = TempDir::new().unwrap();
    write_payload(dir.path(), 80);
    let (session, _outgoing) = Session::spawn(config()).unwrap();
    let handle = add(&session, 11, dir.path().to_path_buf()).await;
    let info_hash = InfoHash::new([11; 20]);
    wait_for(&handle, checked).await;

    let events = session.events();
    let peer: SocketAddr = "10.0.0.2:6881".parse().unwrap();
    events
        .send(TransferEvent::PeerConnected {
            info_hash,
            addr: peer,
            source: PeerSource::Tracker,
            peer_id: Some([1; 20]),
        })
        .unwrap();
    events
        .send(TransferEvent::PeerBitfield {
            info_hash,
            addr: peer,
            bitfield: vec![0b1110_0000],
        })
        .unwrap();
    let status = wait_for(&handle, |s| s.num_seeds == 1).await;
    assert_eq!(status.num_peers, 1);
    assert!((status.distributed_copies - 1.0).abs() < f32::EPSILON);

    // The missing half of piece 2 arrives as two blocks
    let data = payload();
    let path = dir.path().join("payload/b.bin");
    let mut b = std::fs::read(&path).unwrap();
    b.resize(56, 0);
    b[24..].copy_from_slice(&data[64..]);
    std::fs::write(&path, b).unwrap();

    for block in 0..2 {
        events
            .send(TransferEvent::BlockRequested {
                info_hash,
                addr: peer,
                piece: 2,
                block,
            })
            .unwrap();
    }
    events
        .send(TransferEvent::BlockReceived {
            info_hash,
            piece: 2,
            block: 0,
        })
        .unwrap();
    let status = wait_for(&handle, |s| s.total_done == 80).await;
    assert_eq!(status.state, TorrentState::Downloading);
    let queue = handle.get_download_queue().await.unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].finished_blocks, vec![true, false]);
    assert_eq!(queue[0].requested_blocks, vec![true, true]);
    assert_eq!(queue[0].peer[0], Some(peer));

    events
        .send(TransferEvent::BlockReceived {
            info_hash,
            piece: 2,
            block: 1,
        })
        .unwrap();
    let status = wait_for(&handle, |s| s.state == TorrentState::Seeding).await;
    assert_eq!(*status.pieces, vec![true, true, true]);
    assert_eq!(status.total_failed_bytes, 0);
    assert!(handle.get_download_queue().await.unwrap().is_empty());

    let peers = handle.get_peer_info().await.unwrap();
    assert_eq!(peers.len(), 1);
    assert!(peers[0].seed);
}

#[tokio::test]
async fn test_pause_and_resume() {
    let dir = TempDir::new().unwrap();
    let (session, _outgoing) = Session::spawn(config()).unwrap();
    let handle = session
        .add_transfer(AddTransferParams::from_torrent(torrent(12), dir.path().to_path_buf()).paused(true))
        .await
        .unwrap();
    assert!(handle.is_paused().await.unwrap());

    handle.resume().unwrap();
    let status = wait_for(&handle, |s| !s.paused).await;
    assert!(status.error.is_none());
    handle.pause().unwrap();
    assert!(wait_for(&handle, |s| s.paused).await.paused);
}

#[tokio::test]
async fn test_shutdown_invalidates_session_and_handles() {
    let dir = TempDir::new().unwrap();
    let (session, _outgoing) = Session::spawn(config()).unwrap();
    let handle = add(&session, 13, dir.path().to_path_buf()).await;

    session.shutdown().await.unwrap();
    assert!(!handle.is_valid());
    assert!(session.transfers().is_empty());
    assert_eq!(handle.pause(), Err(TorrentError::InvalidHandle));
    assert!(matches!(
        session
            .add_transfer(AddTransferParams::from_torrent(torrent(14), dir.path().to_path_buf()))
            .await,
        Err(TorrentError::InvalidHandle)
    ));
}

#[tokio::test]
async fn test_collaborator_requests() {
    let dir = TempDir::new().unwrap();
    write_payload(dir.path(), 96);
    let config = SessionConfig {
        tick_interval: Duration::from_millis(20),
        ..config()
    };
    let (session, mut outgoing) = Session::spawn(config).unwrap();
    let mut info = (*torrent(15)).clone();
    info.announce_tiers = vec![vec!["http://tracker.example/announce".to_string()]];
    let handle = session
        .add_transfer(AddTransferParams::from_torrent(Arc::new(info), dir.path().to_path_buf()).paused(true))
        .await
        .unwrap();
    let info_hash = handle.info_hash().unwrap();

    handle.set_tracker_login("user", "secret").unwrap();
    wait_for(&handle, checked).await;
    handle.resume().unwrap();

    let request = next_outgoing(&mut outgoing, |message| match message {
        Outgoing::Announce(request) => Some(request),
        _ => None,
    })
    .await;
    assert_eq!(request.info_hash, info_hash);
    assert_eq!(request.url, "http://tracker.example/announce");
    assert_eq!(request.event, AnnounceEvent::Started);
    assert_eq!(request.login, Some(("user".to_string(), "secret".to_string())));
    assert_eq!(request.left, 0);

    let peer: SocketAddr = "10.0.0.3:6881".parse().unwrap();
    handle.connect_peer(peer).unwrap();
    let addr = next_outgoing(&mut outgoing, |message| match message {
        Outgoing::ConnectPeer { addr, .. } => Some(addr),
        _ => None,
    })
    .await;
    assert_eq!(addr, peer);

    let result = handle.send_chat_message(peer, "hello").await;
    assert!(matches!(result, Err(TorrentError::InvalidArgument { .. })));
    session
        .events()
        .send(TransferEvent::PeerConnected {
            info_hash,
            addr: peer,
            source: PeerSource::Tracker,
            peer_id: None,
        })
        .unwrap();
    wait_for(&handle, |s| s.num_peers == 1).await;
    handle.send_chat_message(peer, "hello").await.unwrap();
    let chat = next_outgoing(&mut outgoing, |message| match message {
        Outgoing::ChatMessage { addr, message, .. } => Some((addr, message)),
        _ => None,
    })
    .await;
    assert_eq!(chat, (peer, "hello".to_string()));

    handle.force_reannounce_in(Duration::from_secs(3600)).unwrap();
    let status = wait_for(&handle, |s| s.next_announce > Duration::from_secs(3500)).await;
    assert_eq!(status.current_tracker, "http://tracker.example/announce");
}

#[tokio::test]
async fn test_add_magnet() {
    let dir = TempDir::new().unwrap();
    let (session, _outgoing) = Session::spawn(config()).unwrap();

    let result = session
        .add_magnet("magnet:?dn=nothing", dir.path().to_path_buf(), FileStorage::constructor())
        .await;
    assert!(matches!(result, Err(TorrentError::InvalidArgument { .. })));

    let hex = "dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c";
    let handle = session
        .add_magnet(
            &format!("magnet:?xt=urn:btih:{}&tr=http://tracker.example/announce", hex),
            dir.path().to_path_buf(),
            FileStorage::constructor(),
        )
        .await
        .unwrap();
    assert_eq!(handle.info_hash().unwrap().to_hex(), hex);
    assert_eq!(handle.name().await.unwrap(), hex);
    assert!(!handle.has_metadata().await.unwrap());
    assert_eq!(handle.metadata().await.unwrap(), None);
    let status = handle.status().await.unwrap();
    assert_eq!(status.state, TorrentState::DownloadingMetadata);
    assert_eq!(status.block_size, 16);
    assert_eq!(handle.trackers().await.unwrap().len(), 1);

    // Without metadata there is no piece or file to filter
    assert!(matches!(handle.filter_piece(0, true), Err(TorrentError::InvalidArgument { .. })));
    assert!(handle.write_resume_data().await.unwrap().have_pieces().is_empty());
}
