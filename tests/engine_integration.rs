//! Black-box tests against `Engine`'s public surface (spec.md §8 scenarios
//! that don't require a live peer connection, since `Torrent`/`peer` are
//! crate-private: session persistence, suspend/resume, user vs. derived
//! activity state, and the engine-level error paths). Wire-level scenarios
//! (block exchange, peer churn, hash-mismatch re-download, timeouts) are
//! covered by the unit tests alongside `torrent/mod.rs`, `scheduler.rs`, and
//! `active_piece.rs`, which have access to those internals.

use std::{
    path::PathBuf,
    sync::{atomic::{AtomicU64, Ordering}, Arc},
};

use pretty_assertions::assert_eq;
use sha1::{Digest, Sha1};

use swarmcore::{
    conf::Conf,
    engine::{ActivityState, Engine},
    error::Error,
    metainfo::{File, Info, Metainfo},
    session_store::{MemorySessionStore, SessionStore, TorrentOrigin, UserState},
    BLOCK_LEN,
};

static DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A fresh scratch directory per test, so concurrently-run tests don't race
/// over the same on-disk files.
fn scratch_dir() -> PathBuf {
    let n = DIR_COUNTER.fetch_add(1, Ordering::SeqCst);
    let dir = std::env::temp_dir().join(format!("swarmcore-engine-test-{}-{n}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn engine_over(store: Arc<dyn SessionStore>) -> Engine {
    Engine::new(Conf::new(scratch_dir()), store)
}

fn single_file_metainfo_bytes(piece_data: &[u8]) -> Vec<u8> {
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&Sha1::digest(piece_data));
    let metainfo = Metainfo {
        info: Info {
            name: "test.bin".to_owned(),
            pieces: serde_bytes::ByteBuf::from(hash.to_vec()),
            piece_length: piece_data.len() as u64,
            length: Some(piece_data.len() as u64),
            files: None,
            private: None,
        },
        announce: None,
        announce_list: None,
    };
    serde_bencode::to_bytes(&metainfo).unwrap()
}

fn archive_metainfo_bytes() -> Vec<u8> {
    let metainfo = Metainfo {
        info: Info {
            name: "archive".to_owned(),
            pieces: serde_bytes::ByteBuf::from(vec![0u8; 20]),
            piece_length: BLOCK_LEN as u64,
            length: None,
            files: Some(vec![
                File { path: vec!["a.bin".to_owned()], length: BLOCK_LEN as i64 },
            ]),
            private: None,
        },
        announce: None,
        announce_list: None,
    };
    serde_bencode::to_bytes(&metainfo).unwrap()
}

#[tokio::test]
async fn new_engine_begins_suspended_with_no_torrents() {
    let engine = engine_over(Arc::new(MemorySessionStore::new()));
    assert!(engine.is_suspended());
    assert!(engine.list_torrents().is_empty());
}

#[tokio::test]
async fn add_torrent_while_suspended_reports_stopped() {
    let engine = engine_over(Arc::new(MemorySessionStore::new()));
    let data = vec![1u8; BLOCK_LEN as usize];
    let id = engine
        .add_torrent(TorrentOrigin::Metainfo(single_file_metainfo_bytes(&data)))
        .await
        .unwrap();

    let summary = engine.torrent_summary(id).unwrap();
    assert_eq!(summary.activity_state, ActivityState::Stopped);
    assert_eq!(summary.total_size, data.len() as u64);
}

#[tokio::test]
async fn resume_moves_active_torrent_to_downloading() {
    let engine = engine_over(Arc::new(MemorySessionStore::new()));
    let data = vec![2u8; BLOCK_LEN as usize];
    let id = engine
        .add_torrent(TorrentOrigin::Metainfo(single_file_metainfo_bytes(&data)))
        .await
        .unwrap();

    engine.resume();
    assert_eq!(engine.activity_state(id).unwrap(), ActivityState::Downloading);

    engine.suspend();
    assert_eq!(engine.activity_state(id).unwrap(), ActivityState::Stopped);
}

#[tokio::test]
async fn user_stop_keeps_torrent_stopped_even_when_engine_resumes() {
    let engine = engine_over(Arc::new(MemorySessionStore::new()));
    let data = vec![3u8; BLOCK_LEN as usize];
    let id = engine
        .add_torrent(TorrentOrigin::Metainfo(single_file_metainfo_bytes(&data)))
        .await
        .unwrap();

    engine.user_stop(id).await.unwrap();
    engine.resume();
    assert_eq!(engine.activity_state(id).unwrap(), ActivityState::Stopped);

    engine.user_start(id).await.unwrap();
    assert_eq!(engine.activity_state(id).unwrap(), ActivityState::Downloading);
}

#[tokio::test]
async fn magnet_only_torrent_stays_downloading_metadata_once_resumed() {
    let engine = engine_over(Arc::new(MemorySessionStore::new()));
    let id = engine
        .add_torrent(TorrentOrigin::MagnetUri(
            "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567&dn=x".to_owned(),
        ))
        .await
        .unwrap();

    assert_eq!(engine.activity_state(id).unwrap(), ActivityState::Stopped);
    engine.resume();
    assert_eq!(
        engine.activity_state(id).unwrap(),
        ActivityState::DownloadingMetadata
    );
}

#[tokio::test]
async fn invalid_magnet_uri_is_rejected() {
    let engine = engine_over(Arc::new(MemorySessionStore::new()));
    let err = engine
        .add_torrent(TorrentOrigin::MagnetUri("magnet:?dn=no-hash-here".to_owned()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[tokio::test]
async fn invalid_metainfo_bytes_are_rejected() {
    let engine = engine_over(Arc::new(MemorySessionStore::new()));
    let err = engine
        .add_torrent(TorrentOrigin::Metainfo(vec![1, 2, 3]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[tokio::test]
async fn remove_torrent_forgets_it() {
    let engine = engine_over(Arc::new(MemorySessionStore::new()));
    let data = vec![4u8; BLOCK_LEN as usize];
    let id = engine
        .add_torrent(TorrentOrigin::Metainfo(single_file_metainfo_bytes(&data)))
        .await
        .unwrap();

    engine.remove_torrent(id).await.unwrap();
    assert!(engine.torrent_summary(id).is_none());
    assert!(engine.activity_state(id).is_none());
}

#[tokio::test]
async fn operations_on_unknown_torrent_id_error() {
    let engine = engine_over(Arc::new(MemorySessionStore::new()));
    assert!(matches!(
        engine.user_start(404).await.unwrap_err(),
        Error::Config(_)
    ));
    assert!(matches!(
        engine.user_stop(404).await.unwrap_err(),
        Error::Config(_)
    ));
    assert!(matches!(
        engine.remove_torrent(404).await.unwrap_err(),
        Error::Config(_)
    ));
    assert!(matches!(engine.recheck(404).unwrap_err(), Error::Config(_)));
    assert!(matches!(
        engine.add_peer(404, "127.0.0.1:6881".parse().unwrap()).unwrap_err(),
        Error::Config(_)
    ));
}

/// Simulates a process restart: a second `Engine` over the same session
/// store reconstructs the torrent and honors its persisted `user_state`
/// without the caller ever having to re-add it (spec.md §4.6/§9).
#[tokio::test]
async fn restore_session_reconstructs_torrents_without_starting_network() {
    let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
    let dir = scratch_dir();

    let id = {
        let engine = Engine::new(Conf::new(dir.clone()), Arc::clone(&store));
        let data = vec![5u8; BLOCK_LEN as usize];
        let id = engine
            .add_torrent(TorrentOrigin::Metainfo(single_file_metainfo_bytes(&data)))
            .await
            .unwrap();
        engine.resume();
        engine.user_stop(id).await.unwrap();
        id
    };

    let restarted = Engine::new(Conf::new(dir), Arc::clone(&store));
    let restored = restarted.restore_session().await.unwrap();
    assert_eq!(restored, 1);

    // Restore never starts the network on its own.
    assert!(restarted.is_suspended());
    assert_eq!(
        restarted.torrent_summary(id).unwrap().activity_state,
        ActivityState::Stopped
    );

    // The persisted `stopped` user_state survives the restart: resuming the
    // engine does not bring this torrent back to `downloading`.
    restarted.resume();
    assert_eq!(
        restarted.activity_state(id).unwrap(),
        ActivityState::Stopped
    );
}

#[tokio::test]
async fn restore_session_resumes_active_torrents_once_told_to() {
    let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
    let dir = scratch_dir();

    let id = {
        let engine = Engine::new(Conf::new(dir.clone()), Arc::clone(&store));
        let data = vec![6u8; BLOCK_LEN as usize];
        engine
            .add_torrent(TorrentOrigin::Metainfo(single_file_metainfo_bytes(&data)))
            .await
            .unwrap()
    };

    let restarted = Engine::new(Conf::new(dir), Arc::clone(&store));
    restarted.restore_session().await.unwrap();
    restarted.resume();

    assert_eq!(
        restarted.activity_state(id).unwrap(),
        ActivityState::Downloading
    );
}

#[tokio::test]
async fn sample_progress_emits_a_progress_event_per_running_torrent() {
    let engine = engine_over(Arc::new(MemorySessionStore::new()));
    let data = vec![7u8; BLOCK_LEN as usize];
    let id = engine
        .add_torrent(TorrentOrigin::Metainfo(single_file_metainfo_bytes(&data)))
        .await
        .unwrap();
    engine.resume();

    let mut events = engine.subscribe();
    engine.sample_progress();

    let event = events.recv().await.unwrap();
    match event {
        swarmcore::event::EngineEvent::Progress { id: got, total, .. } => {
            assert_eq!(got, id);
            assert_eq!(total, data.len() as u64);
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn archive_torrent_is_accepted_and_sums_file_lengths() {
    let engine = engine_over(Arc::new(MemorySessionStore::new()));
    let id = engine
        .add_torrent(TorrentOrigin::Metainfo(archive_metainfo_bytes()))
        .await
        .unwrap();

    let summary = engine.torrent_summary(id).unwrap();
    assert_eq!(summary.total_size, BLOCK_LEN as u64);
}

#[tokio::test]
async fn suspend_and_resume_are_idempotent() {
    let engine = engine_over(Arc::new(MemorySessionStore::new()));
    engine.suspend();
    engine.suspend();
    assert!(engine.is_suspended());

    engine.resume();
    engine.resume();
    assert!(!engine.is_suspended());
}
