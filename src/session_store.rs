//! The `SessionStore` capability: a namespaced key/value store the engine
//! persists torrent and session state through, plus a JSON-file-backed
//! implementation.
//!
//! Per the design note in §9 ("dynamic dispatch over `Hasher`/`Storage`/
//! `SessionStore`"), `SessionStore` is a trait behind `Arc<dyn SessionStore>`
//! so the engine can be handed an in-memory double in tests or a real
//! on-disk store in production, the same way `Storage` is split in
//! `disk/mod.rs`.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Mutex,
};

use async_trait::async_trait;
use tokio::task;

use crate::{
    error::{ConfigError, Error, Result, StorageError},
    TorrentId,
};

/// The persisted-layout version this build understands. Bumped whenever
/// [`TorrentPersistedState`]'s shape changes incompatibly.
const SESSION_VERSION: u32 = 1;

/// The key under which the full torrent list is stored.
const TORRENTS_KEY: &str = "torrents";

/// A namespaced key/value store for session persistence.
///
/// Implementations need not be transactional across calls; the engine only
/// ever persists one torrent's state at a time and reads the full set once
/// at startup.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// A torrent's user-facing run state, independent of its derived
/// `activity_state` (see the engine's `activity_state` derivation).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserState {
    Active,
    Stopped,
    Queued,
}

/// Where a torrent's metadata originally came from.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum TorrentOrigin {
    MagnetUri(String),
    Metainfo(#[serde(with = "serde_bytes")] Vec<u8>),
}

/// One torrent's persisted state (spec.md §3), versioned so a future
/// incompatible change can be detected rather than silently misread.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TorrentPersistedState {
    pub version: u32,
    pub info_hash: crate::Sha1Hash,
    pub origin: TorrentOrigin,
    pub added_at: u64,
    pub completed_at: Option<u64>,
    pub user_state: UserState,
    pub queue_position: Option<u32>,
    pub total_downloaded: u64,
    pub total_uploaded: u64,
    /// Hex-encoded [`crate::verified_bitfield::VerifiedBitfield`], i.e. the
    /// set of indices whose bit is set in `VerifiedBitfield`.
    pub completed_pieces_hex: String,
    pub piece_count: usize,
}

impl TorrentPersistedState {
    pub fn new(
        info_hash: crate::Sha1Hash,
        origin: TorrentOrigin,
        added_at: u64,
        piece_count: usize,
    ) -> Self {
        Self {
            version: SESSION_VERSION,
            info_hash,
            origin,
            added_at,
            completed_at: None,
            user_state: UserState::Queued,
            queue_position: None,
            total_downloaded: 0,
            total_uploaded: 0,
            completed_pieces_hex: crate::verified_bitfield::VerifiedBitfield::new(piece_count)
                .to_hex(),
            piece_count,
        }
    }

    fn torrent_key(info_hash: &crate::Sha1Hash) -> String {
        format!("torrent:{}", hex::encode(info_hash))
    }
}

/// The full list persisted at the `torrents` key: a version wrapper around
/// the per-torrent index entries (the torrent-keyed details live under
/// their own `torrent:<info_hash_hex>` key).
#[derive(Clone, Debug, Serialize, Deserialize)]
struct TorrentsIndex {
    version: u32,
    torrent_ids: HashMap<TorrentId, crate::Sha1Hash>,
}

impl TorrentsIndex {
    fn new() -> Self {
        Self {
            version: SESSION_VERSION,
            torrent_ids: HashMap::new(),
        }
    }
}

/// Reads the torrents index, rejecting an unsupported version rather than
/// silently discarding it.
pub(crate) async fn read_index(
    store: &dyn SessionStore,
) -> Result<HashMap<TorrentId, crate::Sha1Hash>> {
    match store.get(TORRENTS_KEY).await? {
        None => Ok(HashMap::new()),
        Some(bytes) => {
            let index: TorrentsIndex = serde_json::from_slice(&bytes).map_err(|e| {
                Error::Config(ConfigError::Bencode(format!("corrupt session index: {e}")))
            })?;
            if index.version != SESSION_VERSION {
                return Err(Error::Config(ConfigError::UnsupportedSessionVersion {
                    found: index.version,
                    supported: SESSION_VERSION,
                }));
            }
            Ok(index.torrent_ids)
        }
    }
}

/// Overwrites the torrents index with `torrent_ids`.
pub(crate) async fn write_index(
    store: &dyn SessionStore,
    torrent_ids: HashMap<TorrentId, crate::Sha1Hash>,
) -> Result<()> {
    let mut index = TorrentsIndex::new();
    index.torrent_ids = torrent_ids;
    let bytes = serde_json::to_vec(&index)
        .map_err(|e| Error::Config(ConfigError::Bencode(e.to_string())))?;
    store.set(TORRENTS_KEY, bytes).await
}

/// Reads one torrent's persisted state.
pub(crate) async fn read_torrent(
    store: &dyn SessionStore,
    info_hash: &crate::Sha1Hash,
) -> Result<Option<TorrentPersistedState>> {
    let key = TorrentPersistedState::torrent_key(info_hash);
    match store.get(&key).await? {
        None => Ok(None),
        Some(bytes) => {
            let state: TorrentPersistedState = serde_json::from_slice(&bytes).map_err(|e| {
                Error::Config(ConfigError::Bencode(format!(
                    "corrupt torrent state for {}: {e}",
                    hex::encode(info_hash)
                )))
            })?;
            if state.version != SESSION_VERSION {
                return Err(Error::Config(ConfigError::UnsupportedSessionVersion {
                    found: state.version,
                    supported: SESSION_VERSION,
                }));
            }
            Ok(Some(state))
        }
    }
}

/// Persists one torrent's state, also registering it in the torrents index
/// if not already present.
pub(crate) async fn write_torrent(
    store: &dyn SessionStore,
    torrent_id: TorrentId,
    state: &TorrentPersistedState,
) -> Result<()> {
    let key = TorrentPersistedState::torrent_key(&state.info_hash);
    let bytes = serde_json::to_vec(state)
        .map_err(|e| Error::Config(ConfigError::Bencode(e.to_string())))?;
    store.set(&key, bytes).await?;

    let mut torrent_ids = read_index(store).await?;
    torrent_ids.insert(torrent_id, state.info_hash);
    write_index(store, torrent_ids).await
}

/// Removes one torrent's persisted state and its index entry.
pub(crate) async fn remove_torrent(
    store: &dyn SessionStore,
    torrent_id: TorrentId,
    info_hash: &crate::Sha1Hash,
) -> Result<()> {
    let key = TorrentPersistedState::torrent_key(info_hash);
    store.delete(&key).await?;

    let mut torrent_ids = read_index(store).await?;
    torrent_ids.remove(&torrent_id);
    write_index(store, torrent_ids).await
}

/// A `SessionStore` backed by one JSON file per key in a directory, the
/// simplest implementation that satisfies the namespaced get/set/delete
/// contract without pulling in an embedded database dependency the teacher
/// never used.
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    /// Opens (creating if necessary) a session store rooted at `dir`.
    ///
    /// `set` writes to a `.tmp` sibling and renames it into place, so a
    /// crash mid-write never leaves a key holding a partial value.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::Storage(StorageError::Io(e)))?;
        Ok(Self { dir })
    }

    fn path_for(dir: &Path, key: &str) -> PathBuf {
        // Keys are either bare identifiers (`torrents`) or
        // `torrent:<hex>`; `:` is not valid in a Windows path component, so
        // it's swapped for `_` to keep the store portable. Collisions are
        // impossible since hex-encoded info hashes never contain `_`.
        dir.join(format!("{}.json", key.replace(':', "_")))
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = Self::path_for(&self.dir, key);
        task::spawn_blocking(move || match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Storage(StorageError::Io(e))),
        })
        .await
        .map_err(|e| Error::Storage(StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))))?
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let path = Self::path_for(&self.dir, key);
        task::spawn_blocking(move || {
            let tmp_path = path.with_extension("json.tmp");
            std::fs::write(&tmp_path, &value).map_err(|e| Error::Storage(StorageError::Io(e)))?;
            std::fs::rename(&tmp_path, &path).map_err(|e| Error::Storage(StorageError::Io(e)))?;
            Ok(())
        })
        .await
        .map_err(|e| Error::Storage(StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))))?
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = Self::path_for(&self.dir, key);
        task::spawn_blocking(move || match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(StorageError::Io(e))),
        })
        .await
        .map_err(|e| Error::Storage(StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))))?
    }
}

/// An in-memory `SessionStore`, for tests that shouldn't touch disk.
#[derive(Default)]
pub struct MemorySessionStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.lock().unwrap().insert(key.to_owned(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(info_hash: crate::Sha1Hash) -> TorrentPersistedState {
        TorrentPersistedState::new(info_hash, TorrentOrigin::MagnetUri("magnet:?xt=urn:btih:x".into()), 0, 4)
    }

    #[tokio::test]
    async fn test_memory_store_roundtrips_torrent_state() {
        let store = MemorySessionStore::new();
        let mut s = state([1; 20]);
        s.user_state = UserState::Active;
        write_torrent(&store, 7, &s).await.unwrap();

        let loaded = read_torrent(&store, &[1; 20]).await.unwrap().unwrap();
        assert_eq!(loaded.info_hash, s.info_hash);
        assert_eq!(loaded.user_state, UserState::Active);

        let index = read_index(&store).await.unwrap();
        assert_eq!(index.get(&7), Some(&[1; 20]));
    }

    #[tokio::test]
    async fn test_remove_torrent_clears_index_and_state() {
        let store = MemorySessionStore::new();
        let s = state([2; 20]);
        write_torrent(&store, 3, &s).await.unwrap();
        remove_torrent(&store, 3, &[2; 20]).await.unwrap();

        assert!(read_torrent(&store, &[2; 20]).await.unwrap().is_none());
        assert!(read_index(&store).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_version_is_rejected() {
        let store = MemorySessionStore::new();
        let mut s = state([3; 20]);
        s.version = SESSION_VERSION + 1;
        let key = TorrentPersistedState::torrent_key(&s.info_hash);
        let bytes = serde_json::to_vec(&s).unwrap();
        store.set(&key, bytes).await.unwrap();

        let err = read_torrent(&store, &[3; 20]).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Config(ConfigError::UnsupportedSessionVersion { .. })
        ));
    }

    #[tokio::test]
    async fn test_file_store_persists_across_instances() {
        let dir = std::env::temp_dir().join(format!(
            "swarmcore-session-test-{}",
            std::process::id()
        ));
        {
            let store = FileSessionStore::new(&dir).unwrap();
            write_torrent(&store, 1, &state([9; 20])).await.unwrap();
        }
        {
            let store = FileSessionStore::new(&dir).unwrap();
            let loaded = read_torrent(&store, &[9; 20]).await.unwrap();
            assert!(loaded.is_some());
        }
        std::fs::remove_dir_all(&dir).ok();
    }
}
