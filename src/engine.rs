//! `Engine`: the process-wide owner of every torrent (spec.md §4.6). Holds
//! the global suspend flag, the `SessionStore` handle, and one `TorrentHandle`
//! per registered torrent, deriving each torrent's read-only `activity_state`
//! on demand rather than storing it.
//!
//! Grounded on `dog4ik-media-server`'s top-level torrent-client registry
//! (`TorrentClient`'s `load_torrents`/`add_torrent`/per-torrent state map):
//! same shape of "a map from id to a handle, plus a persistence layer
//! reconciled against it at startup", generalized with this spec's explicit
//! suspend/resume gate that crate doesn't have.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use tokio::sync::broadcast;

use crate::{
    conf::Conf,
    disk::{self, DiskStorage},
    error::{ConfigError, Error, Result},
    event::{EngineEvent, EventBus, TorrentEvent},
    metainfo::Metainfo,
    session_store::{self, SessionStore, TorrentOrigin, TorrentPersistedState, UserState},
    storage_info::StorageInfo,
    torrent::{Torrent, TorrentHandle, TorrentStatus},
    verified_bitfield::VerifiedBitfield,
    Sha1Hash, TorrentId,
};

/// A torrent's derived, never-persisted run state (spec.md §4.6).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActivityState {
    /// Engine suspended, or `user_state` is `stopped`/`queued`.
    Stopped,
    /// The torrent's last operation (storage, recheck) failed.
    Error,
    /// `recheck()` is re-hashing every piece against its expected digest.
    Checking,
    /// No metainfo yet (a magnet-only torrent; metadata exchange over the
    /// extension protocol is out of scope, so this state never resolves on
    /// its own here).
    DownloadingMetadata,
    /// Every piece is verified.
    Seeding,
    Downloading,
}

/// A read-only snapshot of one torrent, safe to hand to a UI/CLI layer
/// without exposing the crate-internal `TorrentHandle`.
#[derive(Clone, Debug)]
pub struct TorrentSummary {
    pub id: TorrentId,
    pub info_hash: Sha1Hash,
    pub activity_state: ActivityState,
    pub total_downloaded: u64,
    pub total_uploaded: u64,
    pub total_size: u64,
    pub peer_count: usize,
}

/// One torrent's in-memory registration: its run handle (absent for a
/// magnet-only torrent awaiting metadata) plus the bits needed to derive
/// `activity_state` and sample transfer rates.
struct RegisteredTorrent {
    info_hash: Sha1Hash,
    handle: Option<TorrentHandle>,
    user_state: UserState,
    /// Previous `sample_progress` reading, used to compute a rolling rate.
    last_sample: Option<(Instant, u64, u64)>,
}

/// The process-wide torrent registry. Begins suspended; the host must call
/// `resume()` once it's ready to open sockets.
pub struct Engine {
    conf: Conf,
    session_store: Arc<dyn SessionStore>,
    torrents: Mutex<HashMap<TorrentId, RegisteredTorrent>>,
    suspended: Mutex<bool>,
    events: Arc<EventBus<EngineEvent>>,
}

impl Engine {
    /// Constructs an engine over `session_store`, suspended (per spec.md
    /// §4.6: "the engine begins life suspended"). Call `restore_session()`
    /// and then `resume()` to pick up where a prior run left off.
    pub fn new(conf: Conf, session_store: Arc<dyn SessionStore>) -> Self {
        Self {
            conf,
            session_store,
            torrents: Mutex::new(HashMap::new()),
            suspended: Mutex::new(true),
            events: Arc::new(EventBus::new()),
        }
    }

    /// Subscribes to events emitted upward to a UI/CLI (spec.md §6).
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn is_suspended(&self) -> bool {
        *self.suspended.lock().expect("suspend mutex poisoned")
    }

    /// Halts network activity for every torrent. Idempotent.
    pub fn suspend(&self) {
        let mut suspended = self.suspended.lock().expect("suspend mutex poisoned");
        if *suspended {
            return;
        }
        *suspended = true;
        for t in self.torrents.lock().expect("torrents mutex poisoned").values() {
            if let Some(handle) = &t.handle {
                handle.stop();
            }
        }
        log::info!("engine: suspended");
    }

    /// Starts network activity for every torrent whose `user_state` is
    /// `active`. Idempotent.
    pub fn resume(&self) {
        let mut suspended = self.suspended.lock().expect("suspend mutex poisoned");
        if !*suspended {
            return;
        }
        *suspended = false;
        for t in self.torrents.lock().expect("torrents mutex poisoned").values() {
            if t.user_state == UserState::Active {
                if let Some(handle) = &t.handle {
                    handle.start();
                }
            }
        }
        log::info!("engine: resumed");
    }

    /// Adds a torrent from either a magnet URI or full metainfo bytes,
    /// persists its origin with `user_state = active`, and starts its
    /// network unless the engine is currently suspended.
    ///
    /// A magnet-only torrent has no `TorrentHandle`: fetching metadata over
    /// the extension protocol is out of scope here (spec.md §1 non-goals),
    /// so it remains in `downloading_metadata` until the host adds it again
    /// with full metainfo.
    pub async fn add_torrent(&self, origin: TorrentOrigin) -> Result<TorrentId> {
        let added_at = now_unix();

        let (info_hash, catalog) = match &origin {
            TorrentOrigin::Metainfo(bytes) => {
                let metainfo = Metainfo::from_bytes(bytes)?;
                let info_hash = metainfo.create_info_hash()?;
                let catalog = StorageInfo::new(&metainfo, self.conf.torrent.download_dir.clone())?;
                (info_hash, Some(catalog))
            }
            TorrentOrigin::MagnetUri(uri) => (parse_magnet_info_hash(uri)?, None),
        };
        let piece_count = catalog.as_ref().map(|c| c.piece_count).unwrap_or(0);

        let id = self.next_torrent_id();
        let mut state = TorrentPersistedState::new(info_hash, origin, added_at, piece_count);
        state.user_state = UserState::Active;
        session_store::write_torrent(&*self.session_store, id, &state).await?;

        let running = !self.is_suspended();
        let handle = match catalog {
            Some(catalog) => Some(self.spawn_torrent(
                id,
                info_hash,
                catalog,
                VerifiedBitfield::new(piece_count),
                0,
                0,
                running,
            )?),
            None => None,
        };

        self.torrents.lock().expect("torrents mutex poisoned").insert(
            id,
            RegisteredTorrent {
                info_hash,
                handle,
                user_state: UserState::Active,
                last_sample: None,
            },
        );
        self.events.emit(EngineEvent::TorrentAdded { id, info_hash });
        Ok(id)
    }

    /// Reloads every persisted torrent, restoring `verified_bitfield` and
    /// cumulative transfer totals, but does **not** start any network
    /// activity — the caller must subsequently call `resume()`. Returns the
    /// number of torrents restored.
    pub async fn restore_session(&self) -> Result<usize> {
        let index = session_store::read_index(&*self.session_store).await?;
        let mut restored = 0;
        for (id, info_hash) in index {
            let Some(state) = session_store::read_torrent(&*self.session_store, &info_hash).await?
            else {
                continue;
            };

            let handle = match &state.origin {
                TorrentOrigin::Metainfo(bytes) => {
                    let metainfo = Metainfo::from_bytes(bytes)?;
                    let catalog =
                        StorageInfo::new(&metainfo, self.conf.torrent.download_dir.clone())?;
                    let verified = VerifiedBitfield::from_hex(
                        &state.completed_pieces_hex,
                        state.piece_count,
                    )
                    .map_err(|e| {
                        Error::Config(ConfigError::Bencode(format!(
                            "corrupt completed-pieces bitfield for {}: {e}",
                            hex::encode(info_hash)
                        )))
                    })?;
                    Some(self.spawn_torrent(
                        id,
                        info_hash,
                        catalog,
                        verified,
                        state.total_downloaded,
                        state.total_uploaded,
                        false,
                    )?)
                }
                TorrentOrigin::MagnetUri(_) => None,
            };

            self.torrents.lock().expect("torrents mutex poisoned").insert(
                id,
                RegisteredTorrent {
                    info_hash,
                    handle,
                    user_state: state.user_state,
                    last_sample: None,
                },
            );
            self.events.emit(EngineEvent::TorrentAdded { id, info_hash });
            restored += 1;
        }
        Ok(restored)
    }

    /// Sets `user_state = active` and, unless the engine is suspended,
    /// starts the torrent's network.
    pub async fn user_start(&self, id: TorrentId) -> Result<()> {
        let (info_hash, handle, should_start) = {
            let suspended = self.is_suspended();
            let mut torrents = self.torrents.lock().expect("torrents mutex poisoned");
            let t = torrents
                .get_mut(&id)
                .ok_or(Error::Config(ConfigError::UnknownTorrent(id)))?;
            t.user_state = UserState::Active;
            (t.info_hash, t.handle.clone(), !suspended)
        };
        if should_start {
            if let Some(handle) = &handle {
                handle.start();
            }
        }
        self.persist_user_state(id, info_hash, UserState::Active).await
    }

    /// Sets `user_state = stopped` and halts the torrent's network.
    pub async fn user_stop(&self, id: TorrentId) -> Result<()> {
        let (info_hash, handle) = {
            let mut torrents = self.torrents.lock().expect("torrents mutex poisoned");
            let t = torrents
                .get_mut(&id)
                .ok_or(Error::Config(ConfigError::UnknownTorrent(id)))?;
            t.user_state = UserState::Stopped;
            (t.info_hash, t.handle.clone())
        };
        if let Some(handle) = &handle {
            handle.stop();
        }
        self.persist_user_state(id, info_hash, UserState::Stopped).await
    }

    /// Re-reads and re-hashes every piece on disk against its expected
    /// digest, driving the `checking` activity state.
    pub fn recheck(&self, id: TorrentId) -> Result<()> {
        let torrents = self.torrents.lock().expect("torrents mutex poisoned");
        let t = torrents
            .get(&id)
            .ok_or(Error::Config(ConfigError::UnknownTorrent(id)))?;
        if let Some(handle) = &t.handle {
            handle.recheck();
        }
        Ok(())
    }

    /// Hands a discovered peer address to a torrent. A no-op for a
    /// magnet-only torrent with no `TorrentHandle` yet.
    pub fn add_peer(&self, id: TorrentId, addr: SocketAddr) -> Result<()> {
        let torrents = self.torrents.lock().expect("torrents mutex poisoned");
        let t = torrents
            .get(&id)
            .ok_or(Error::Config(ConfigError::UnknownTorrent(id)))?;
        if let Some(handle) = &t.handle {
            handle.add_peer(addr);
        }
        Ok(())
    }

    /// Stops and forgets a torrent, removing its persisted state.
    pub async fn remove_torrent(&self, id: TorrentId) -> Result<()> {
        let (info_hash, handle) = {
            let mut torrents = self.torrents.lock().expect("torrents mutex poisoned");
            let t = torrents
                .remove(&id)
                .ok_or(Error::Config(ConfigError::UnknownTorrent(id)))?;
            (t.info_hash, t.handle)
        };
        if let Some(handle) = &handle {
            handle.shutdown();
        }
        session_store::remove_torrent(&*self.session_store, id, &info_hash).await?;
        self.events.emit(EngineEvent::TorrentRemoved { id });
        Ok(())
    }

    pub fn activity_state(&self, id: TorrentId) -> Option<ActivityState> {
        let suspended = self.is_suspended();
        let torrents = self.torrents.lock().expect("torrents mutex poisoned");
        let t = torrents.get(&id)?;
        let status = t.handle.as_ref().map(|h| h.status());
        Some(derive_activity_state(suspended, t.user_state, status.as_ref()))
    }

    pub fn torrent_summary(&self, id: TorrentId) -> Option<TorrentSummary> {
        let suspended = self.is_suspended();
        let torrents = self.torrents.lock().expect("torrents mutex poisoned");
        let t = torrents.get(&id)?;
        Some(summarize(id, t, suspended))
    }

    pub fn list_torrents(&self) -> Vec<TorrentSummary> {
        let suspended = self.is_suspended();
        let torrents = self.torrents.lock().expect("torrents mutex poisoned");
        torrents
            .iter()
            .map(|(&id, t)| summarize(id, t, suspended))
            .collect()
    }

    /// Recomputes each torrent's transfer rate against its last sample and
    /// emits `EngineEvent::Progress`. Rates are "sampled externally" per
    /// spec.md §6: the host is expected to call this on its own rolling
    /// window (nominally every 4s), not a timer the engine drives itself.
    pub fn sample_progress(&self) {
        let now = Instant::now();
        let mut torrents = self.torrents.lock().expect("torrents mutex poisoned");
        for (&id, t) in torrents.iter_mut() {
            let Some(handle) = &t.handle else { continue };
            let status = handle.status();
            let (down_rate, up_rate) = match t.last_sample {
                Some((prev_time, prev_down, prev_up)) => {
                    let elapsed = now.duration_since(prev_time).as_secs_f64();
                    if elapsed > 0.0 {
                        (
                            status.total_downloaded.saturating_sub(prev_down) as f64 / elapsed,
                            status.total_uploaded.saturating_sub(prev_up) as f64 / elapsed,
                        )
                    } else {
                        (0.0, 0.0)
                    }
                }
                None => (0.0, 0.0),
            };
            t.last_sample = Some((now, status.total_downloaded, status.total_uploaded));
            self.events.emit(EngineEvent::Progress {
                id,
                downloaded: status.total_downloaded,
                total: status.total_size,
                down_rate,
                up_rate,
                peers: status.peer_count,
            });
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_torrent(
        &self,
        id: TorrentId,
        info_hash: Sha1Hash,
        catalog: StorageInfo,
        verified: VerifiedBitfield,
        total_downloaded: u64,
        total_uploaded: u64,
        running: bool,
    ) -> Result<TorrentHandle> {
        let hasher: Arc<dyn disk::hash::Hasher> = Arc::new(disk::hash::Sha1Hasher);
        let storage = Arc::new(DiskStorage::new(catalog.clone(), Arc::clone(&hasher))?);
        let torrent_events = Arc::new(EventBus::new());
        let handle = Torrent::spawn(
            id,
            info_hash,
            self.conf.engine.client_id,
            catalog,
            verified,
            storage,
            hasher,
            self.conf.torrent.clone(),
            Arc::clone(&torrent_events),
            total_downloaded,
            total_uploaded,
            running,
        );
        spawn_event_forwarder(id, torrent_events, Arc::clone(&self.events));
        Ok(handle)
    }

    async fn persist_user_state(
        &self,
        id: TorrentId,
        info_hash: Sha1Hash,
        user_state: UserState,
    ) -> Result<()> {
        if let Some(mut state) = session_store::read_torrent(&*self.session_store, &info_hash).await? {
            state.user_state = user_state;
            session_store::write_torrent(&*self.session_store, id, &state).await?;
        }
        Ok(())
    }

    fn next_torrent_id(&self) -> TorrentId {
        let torrents = self.torrents.lock().expect("torrents mutex poisoned");
        loop {
            let id = rand::random::<u32>();
            if id != 0 && !torrents.contains_key(&id) {
                return id;
            }
        }
    }
}

fn summarize(id: TorrentId, t: &RegisteredTorrent, suspended: bool) -> TorrentSummary {
    let status = t.handle.as_ref().map(|h| h.status());
    TorrentSummary {
        id,
        info_hash: t.info_hash,
        activity_state: derive_activity_state(suspended, t.user_state, status.as_ref()),
        total_downloaded: status.as_ref().map(|s| s.total_downloaded).unwrap_or(0),
        total_uploaded: status.as_ref().map(|s| s.total_uploaded).unwrap_or(0),
        total_size: status.as_ref().map(|s| s.total_size).unwrap_or(0),
        peer_count: status.as_ref().map(|s| s.peer_count).unwrap_or(0),
    }
}

/// The derivation table from spec.md §4.6, in precedence order.
fn derive_activity_state(
    suspended: bool,
    user_state: UserState,
    status: Option<&TorrentStatus>,
) -> ActivityState {
    if suspended || matches!(user_state, UserState::Stopped | UserState::Queued) {
        return ActivityState::Stopped;
    }
    let status = match status {
        Some(status) => status,
        None => return ActivityState::DownloadingMetadata,
    };
    if status.has_error {
        ActivityState::Error
    } else if status.is_checking {
        ActivityState::Checking
    } else if !status.has_metadata {
        ActivityState::DownloadingMetadata
    } else if status.is_complete {
        ActivityState::Seeding
    } else {
        ActivityState::Downloading
    }
}

/// Subscribes to one torrent's event bus and forwards the subset spec.md §6
/// lists as "events emitted upward" (`torrent-complete`, `torrent-error`);
/// piece/verified/peer churn stay torrent-internal detail.
fn spawn_event_forwarder(
    id: TorrentId,
    torrent_events: Arc<EventBus<TorrentEvent>>,
    engine_events: Arc<EventBus<EngineEvent>>,
) {
    let mut rx = torrent_events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(TorrentEvent::Complete) => {
                    engine_events.emit(EngineEvent::TorrentComplete { id });
                }
                Ok(TorrentEvent::Error { kind, .. }) => {
                    engine_events.emit(EngineEvent::TorrentError { id, kind });
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Extracts the 20 byte info hash from a magnet URI's `xt=urn:btih:`
/// parameter. Only the hex encoding is accepted; base32 `xt` values (also
/// permitted by BEP 9) are rejected rather than silently mishandled, since
/// this crate has no base32 dependency to decode them correctly.
fn parse_magnet_info_hash(uri: &str) -> Result<Sha1Hash> {
    let hex_hash = uri
        .split(['?', '&'])
        .find_map(|part| part.strip_prefix("xt=urn:btih:"))
        .ok_or_else(|| {
            Error::Config(ConfigError::InvalidMagnetUri(
                "missing xt=urn:btih: parameter".to_owned(),
            ))
        })?;
    let bytes = hex::decode(hex_hash)
        .map_err(|e| Error::Config(ConfigError::InvalidMagnetUri(format!("invalid hex: {e}"))))?;
    if bytes.len() != 20 {
        return Err(Error::Config(ConfigError::InvalidMagnetUri(
            "info hash must be 20 bytes".to_owned(),
        )));
    }
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&bytes);
    Ok(hash)
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
