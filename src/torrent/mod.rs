//! `Torrent`: one torrent's peer set, scheduling, and piece finalization
//! pipeline, run as its own `tokio::task`. Driven by a small command channel
//! (`TorrentCommand`/`TorrentHandle`), mirroring the teacher's `disk`/`peer`
//! split between owned state and a channel handle to a task, and the
//! `DownloadMessage`/`DownloadHandle` shape used for the analogous purpose in
//! `dog4ik-media-server`'s download task.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Instant,
};

use tokio::sync::mpsc;

use crate::{
    bitfield::BitField,
    conf::TorrentConf,
    disk::{self, Storage},
    event::{ErrorKind, EventBus, TorrentEvent},
    piece_manager::ActivePieceManager,
    scheduler,
    storage_info::StorageInfo,
    verified_bitfield::VerifiedBitfield,
    peer::{self, PeerConnection, PeerEvent},
    BlockInfo, PeerId, PieceIndex, Sha1Hash, TorrentId,
};

/// Commands accepted by a running `Torrent`, sent through its `TorrentHandle`.
pub(crate) enum TorrentCommand {
    /// A newly discovered peer address to connect out to.
    AddPeer(SocketAddr),
    /// Start (or resume) this torrent's network activity.
    Start,
    /// Halt this torrent's network activity and release in-progress pieces.
    Stop,
    /// Re-read and re-hash every piece from storage.
    Recheck,
    /// Stop the network and terminate the torrent's task.
    Shutdown,
}

/// A cheap-to-read snapshot of a torrent's state, shared with its
/// `TorrentHandle` so `Engine::activity_state` can be derived without an
/// async round-trip into the torrent's task.
#[derive(Clone, Debug)]
pub(crate) struct TorrentStatus {
    pub has_error: bool,
    pub is_checking: bool,
    pub has_metadata: bool,
    pub is_complete: bool,
    pub total_downloaded: u64,
    pub total_uploaded: u64,
    pub total_size: u64,
    pub peer_count: usize,
}

/// An external handle to a running `Torrent` task.
#[derive(Clone)]
pub(crate) struct TorrentHandle {
    commands: mpsc::UnboundedSender<TorrentCommand>,
    status: Arc<Mutex<TorrentStatus>>,
}

impl TorrentHandle {
    pub fn add_peer(&self, addr: SocketAddr) {
        let _ = self.commands.send(TorrentCommand::AddPeer(addr));
    }

    pub fn start(&self) {
        let _ = self.commands.send(TorrentCommand::Start);
    }

    pub fn stop(&self) {
        let _ = self.commands.send(TorrentCommand::Stop);
    }

    pub fn recheck(&self) {
        let _ = self.commands.send(TorrentCommand::Recheck);
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(TorrentCommand::Shutdown);
    }

    pub fn status(&self) -> TorrentStatus {
        self.status.lock().expect("status mutex poisoned").clone()
    }
}

/// A peer's command sender plus the subset of its state `Torrent` mirrors
/// locally, since the live `PeerInfo` lives inside the peer's own task.
struct PeerHandle {
    cmd: peer::CommandSender,
    bitfield: BitField,
    peer_choking: bool,
    am_interested: bool,
    requests_pending: usize,
}

impl PeerHandle {
    fn new(cmd: peer::CommandSender, piece_count: usize) -> Self {
        Self {
            cmd,
            bitfield: BitField::new(piece_count),
            peer_choking: true,
            am_interested: false,
            requests_pending: 0,
        }
    }
}

/// One torrent: peer set, active-piece bookkeeping, and the finalization
/// pipeline that turns a fully-downloaded piece into verified bytes on disk.
pub(crate) struct Torrent {
    id: TorrentId,
    info_hash: Sha1Hash,
    client_id: PeerId,
    catalog: StorageInfo,
    verified: VerifiedBitfield,
    manager: ActivePieceManager,
    /// Connections that have completed their TCP handshake and are tracked
    /// for scheduling.
    peers: HashMap<PeerId, PeerHandle>,
    /// Connections whose command sender is known but whose peer id isn't
    /// yet, because the handshake hasn't completed. Promoted to `peers` on
    /// `PeerEvent::Connected`.
    pending: HashMap<SocketAddr, peer::CommandSender>,
    peer_events_tx: peer::EventSender,
    peer_events_rx: mpsc::UnboundedReceiver<(PeerId, PeerEvent)>,
    storage: Arc<dyn Storage>,
    hasher: Arc<dyn disk::hash::Hasher>,
    conf: TorrentConf,
    events: Arc<EventBus<TorrentEvent>>,
    status: Arc<Mutex<TorrentStatus>>,
    running: bool,
    total_downloaded: u64,
    total_uploaded: u64,
}

impl Torrent {
    /// Constructs and spawns a `Torrent` task, returning a handle to it.
    /// `running` governs whether it immediately accepts peers: pass `false`
    /// for a torrent whose `user_state` isn't `active`, or whenever the
    /// engine is suspended; the caller subsequently calls `start()`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        id: TorrentId,
        info_hash: Sha1Hash,
        client_id: PeerId,
        catalog: StorageInfo,
        verified: VerifiedBitfield,
        storage: Arc<dyn Storage>,
        hasher: Arc<dyn disk::hash::Hasher>,
        conf: TorrentConf,
        events: Arc<EventBus<TorrentEvent>>,
        total_downloaded: u64,
        total_uploaded: u64,
        running: bool,
    ) -> TorrentHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (peer_events_tx, peer_events_rx) = mpsc::unbounded_channel();

        let status = Arc::new(Mutex::new(TorrentStatus {
            has_error: false,
            is_checking: false,
            has_metadata: true,
            is_complete: verified.is_complete(),
            total_downloaded,
            total_uploaded,
            total_size: catalog.download_len,
            peer_count: 0,
        }));

        let manager = ActivePieceManager::new(conf.active_piece);
        let torrent = Self {
            id,
            info_hash,
            client_id,
            catalog,
            verified,
            manager,
            peers: HashMap::new(),
            pending: HashMap::new(),
            peer_events_tx,
            peer_events_rx,
            storage,
            hasher,
            conf,
            events,
            status: Arc::clone(&status),
            running,
            total_downloaded,
            total_uploaded,
        };
        tokio::spawn(torrent.run(cmd_rx));

        TorrentHandle {
            commands: cmd_tx,
            status,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<TorrentCommand>) {
        let mut sweep = tokio::time::interval(self.conf.active_piece.cleanup_interval);
        loop {
            tokio::select! {
                cmd = commands.recv() => {
                    match cmd {
                        Some(TorrentCommand::AddPeer(addr)) => self.add_peer(addr),
                        Some(TorrentCommand::Start) => self.start(),
                        Some(TorrentCommand::Stop) => self.stop(),
                        Some(TorrentCommand::Recheck) => self.recheck().await,
                        Some(TorrentCommand::Shutdown) | None => {
                            self.stop();
                            return;
                        }
                    }
                }
                Some((peer_id, event)) = self.peer_events_rx.recv() => {
                    self.handle_peer_event(peer_id, event).await;
                }
                _ = sweep.tick() => {
                    self.run_timeout_sweep();
                }
            }
        }
    }

    fn start(&mut self) {
        if self.running {
            return;
        }
        self.running = true;
        log::info!("torrent {}: network started", self.id);
    }

    fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        for (_, handle) in self.peers.drain() {
            let _ = handle.cmd.send(peer::Command::Shutdown);
        }
        for (_, cmd) in self.pending.drain() {
            let _ = cmd.send(peer::Command::Shutdown);
        }
        self.manager.destroy();
        self.update_status();
        log::info!("torrent {}: network stopped", self.id);
    }

    fn add_peer(&mut self, addr: SocketAddr) {
        if !self.running {
            return;
        }
        if self.pending.contains_key(&addr) {
            return;
        }
        if self.peers.len() + self.pending.len() >= self.conf.max_connected_peer_count {
            return;
        }
        let (mut conn, cmd) = PeerConnection::outbound(
            addr,
            self.info_hash,
            self.client_id,
            self.catalog.piece_count,
            self.peer_events_tx.clone(),
        );
        self.pending.insert(addr, cmd);
        tokio::spawn(async move {
            let _ = conn.run().await;
        });
    }

    async fn recheck(&mut self) {
        self.set_checking(true);
        match self.storage.recheck_all().await {
            Ok(results) => {
                for (index, ok) in results {
                    if ok {
                        self.verified.set(index);
                    } else {
                        self.verified.unset(index);
                    }
                }
                self.update_interest_all();
                self.update_status();
            }
            Err(e) => {
                log::error!("torrent {}: recheck failed: {}", self.id, e);
                self.set_error(true);
                self.events.emit(TorrentEvent::Error {
                    kind: ErrorKind::from(&e),
                    detail: e.to_string(),
                });
            }
        }
        self.set_checking(false);
    }

    async fn handle_peer_event(&mut self, peer_id: PeerId, event: PeerEvent) {
        match event {
            PeerEvent::Connected { addr } => {
                if let Some(cmd) = self.pending.remove(&addr) {
                    let handle = PeerHandle::new(cmd, self.catalog.piece_count);
                    // We don't implement choking policy: unchoke immediately
                    // so we can serve whatever the peer requests (the spec's
                    // seeding/upload scope is "minimum needed to answer
                    // requests", not a choke algorithm).
                    let _ = handle.cmd.send(peer::Command::Unchoke);
                    self.peers.insert(peer_id, handle);
                    self.events.emit(TorrentEvent::PeerAdded { peer_id });
                    self.update_status();
                }
            }
            PeerEvent::BitfieldReceived(bitfield) => {
                if let Some(handle) = self.peers.get_mut(&peer_id) {
                    handle.bitfield = bitfield;
                }
                self.update_interest(peer_id);
                self.dispatch_scheduler_for(peer_id);
            }
            PeerEvent::HaveReceived { piece_index } => {
                if let Some(handle) = self.peers.get_mut(&peer_id) {
                    handle.bitfield.set(piece_index, true);
                }
                self.update_interest(peer_id);
                self.dispatch_scheduler_for(peer_id);
            }
            PeerEvent::Choked => {
                if let Some(handle) = self.peers.get_mut(&peer_id) {
                    handle.peer_choking = true;
                }
            }
            PeerEvent::Unchoked => {
                if let Some(handle) = self.peers.get_mut(&peer_id) {
                    handle.peer_choking = false;
                }
                self.dispatch_scheduler_for(peer_id);
            }
            PeerEvent::Interested | PeerEvent::NotInterested => {}
            PeerEvent::BlockReceived { block, data } => {
                self.on_block(peer_id, block, data).await;
            }
            PeerEvent::RequestReceived(block) => {
                self.serve_request(peer_id, block).await;
            }
            PeerEvent::CancelReceived(_) => {}
            PeerEvent::Closed { reason } => {
                self.on_peer_closed(peer_id, &reason);
            }
        }
    }

    async fn on_block(&mut self, peer_id: PeerId, block: BlockInfo, data: Vec<u8>) {
        if let Some(handle) = self.peers.get_mut(&peer_id) {
            handle.requests_pending = handle.requests_pending.saturating_sub(1);
        }

        let piece_len = match self.catalog.piece_len(block.piece_index) {
            Ok(len) => len,
            Err(_) => return,
        };
        let now = Instant::now();
        let block_index = block.index_in_piece();
        let have_all = {
            let ap = match self.manager.get_or_create(block.piece_index, piece_len, now) {
                Some(ap) => ap,
                None => return,
            };
            let first = ap.add_block(block_index, data, peer_id, now);
            if first {
                self.total_downloaded += block.len as u64;
            }
            first && ap.have_all_blocks()
        };

        if have_all {
            self.finalize_piece(block.piece_index).await;
        } else {
            self.update_status();
        }
    }

    /// Per spec.md §4.5's finalization protocol: assemble, hash, and either
    /// discard (hash mismatch) or persist (hash match) a fully-downloaded
    /// piece.
    async fn finalize_piece(&mut self, index: PieceIndex) {
        let data = match self.manager.get(index).map(|ap| ap.assemble()) {
            Some(Ok(data)) => data,
            _ => return,
        };

        let (data, actual) = Self::hash_piece(Arc::clone(&self.hasher), data).await;
        let expected = self.catalog.expected_hash(index).unwrap_or([0; 20]);

        if actual != expected {
            self.manager.remove(index);
            log::warn!("torrent {}: piece {} failed hash verification", self.id, index);
            self.events.emit(TorrentEvent::Error {
                kind: ErrorKind::HashMismatch,
                detail: format!("piece {} failed hash verification", index),
            });
            self.dispatch_scheduler_all();
            return;
        }

        match self.storage.write_piece(index, data).await {
            Ok(()) => {
                self.verified.set(index);
                self.manager.remove(index);
                self.events.emit(TorrentEvent::Verified { index });
                self.broadcast_have(index);
                self.update_status();
                if self.verified.is_complete() {
                    log::info!("torrent {}: download complete", self.id);
                    self.events.emit(TorrentEvent::Complete);
                }
                self.update_interest_all();
                self.dispatch_scheduler_all();
            }
            Err(e) => {
                log::error!("torrent {}: failed to write piece {}: {}", self.id, index, e);
                self.set_error(true);
                self.events.emit(TorrentEvent::Error {
                    kind: ErrorKind::from(&e),
                    detail: e.to_string(),
                });
            }
        }
    }

    /// Offloads the digest computation to a blocking worker via `hasher`,
    /// handing the buffer back so the caller doesn't need to clone it for
    /// the subsequent write.
    async fn hash_piece(
        hasher: Arc<dyn disk::hash::Hasher>,
        data: Vec<u8>,
    ) -> (Vec<u8>, Sha1Hash) {
        tokio::task::spawn_blocking(move || {
            let hash = hasher.sha1(&data);
            (data, hash)
        })
        .await
        .expect("hash worker panicked")
    }

    fn broadcast_have(&self, index: PieceIndex) {
        for handle in self.peers.values() {
            if !handle.bitfield.get(index) {
                let _ = handle.cmd.send(peer::Command::Have { piece_index: index });
            }
        }
    }

    async fn serve_request(&mut self, peer_id: PeerId, block: BlockInfo) {
        if !self.verified.has(block.piece_index) {
            return;
        }
        let data = match self.storage.read_piece(block.piece_index).await {
            Ok(data) => data,
            Err(e) => {
                self.events.emit(TorrentEvent::Error {
                    kind: ErrorKind::from(&e),
                    detail: e.to_string(),
                });
                return;
            }
        };
        let start = block.offset as usize;
        let end = start + block.len as usize;
        if end > data.len() {
            return;
        }
        if let Some(handle) = self.peers.get(&peer_id) {
            let _ = handle.cmd.send(peer::Command::Block {
                piece_index: block.piece_index,
                offset: block.offset,
                data: data[start..end].to_vec(),
            });
            self.total_uploaded += block.len as u64;
            self.update_status();
        }
    }

    /// Per spec.md §4.5's peer churn handling: drop the peer, clear its
    /// in-flight reservations, and let remaining peers pick up the slack.
    fn on_peer_closed(&mut self, peer_id: PeerId, reason: &str) {
        if self.peers.remove(&peer_id).is_none() {
            return;
        }
        log::info!("torrent {}: peer disconnected ({})", self.id, reason);
        self.manager.clear_requests_for_peer(peer_id);
        self.events.emit(TorrentEvent::PeerRemoved { peer_id });
        self.update_status();
        self.dispatch_scheduler_all();
    }

    fn run_timeout_sweep(&mut self) {
        if !self.running {
            return;
        }
        let cleared = self.manager.check_timeouts(Instant::now());
        if cleared > 0 {
            self.dispatch_scheduler_all();
        }
    }

    /// Recomputes interest in every connected peer (our own verified set
    /// changed: a piece got verified, or a recheck flipped several bits).
    fn update_interest_all(&mut self) {
        let peer_ids: Vec<PeerId> = self.peers.keys().copied().collect();
        for peer_id in peer_ids {
            self.update_interest(peer_id);
        }
    }

    /// Sends BEP 3 INTERESTED/NOT_INTERESTED to `peer_id` if its declared
    /// interest no longer matches whether it has any piece we're missing.
    /// Real peers commonly only unchoke declared-interested peers, so this
    /// must track availability, not just be sent once at connect time.
    fn update_interest(&mut self, peer_id: PeerId) {
        let Some(handle) = self.peers.get(&peer_id) else { return };
        let interested = (0..self.catalog.piece_count)
            .any(|index| handle.bitfield.get(index) && !self.verified.has(index));
        if interested == handle.am_interested {
            return;
        }
        if let Some(handle) = self.peers.get_mut(&peer_id) {
            handle.am_interested = interested;
            let cmd = if interested {
                peer::Command::Interested
            } else {
                peer::Command::NotInterested
            };
            let _ = handle.cmd.send(cmd);
        }
    }

    fn dispatch_scheduler_all(&mut self) {
        let peer_ids: Vec<PeerId> = self.peers.keys().copied().collect();
        for peer_id in peer_ids {
            self.dispatch_scheduler_for(peer_id);
        }
    }

    fn dispatch_scheduler_for(&mut self, peer_id: PeerId) {
        if !self.running {
            return;
        }
        let now = Instant::now();
        let endgame = scheduler::is_endgame(&self.catalog, &self.verified, &self.manager);
        let pipeline_depth = self.conf.pipeline_depth;

        let reqs = {
            let handle = match self.peers.get(&peer_id) {
                Some(handle) => handle,
                None => return,
            };
            let peer_state = scheduler::PeerSchedulingState {
                peer_id,
                bitfield: &handle.bitfield,
                peer_choking: handle.peer_choking,
                requests_pending: handle.requests_pending,
                pipeline_depth,
            };
            scheduler::schedule(
                peer_state,
                &self.catalog,
                &self.verified,
                &mut self.manager,
                endgame,
                now,
            )
        };

        if reqs.is_empty() {
            return;
        }
        if let Some(handle) = self.peers.get_mut(&peer_id) {
            for block in reqs {
                handle.requests_pending += 1;
                let _ = handle.cmd.send(peer::Command::Request(block));
            }
        }
    }

    fn update_status(&self) {
        let mut status = self.status.lock().expect("status mutex poisoned");
        status.is_complete = self.verified.is_complete();
        status.total_downloaded = self.total_downloaded;
        status.total_uploaded = self.total_uploaded;
        status.peer_count = self.peers.len();
    }

    fn set_checking(&self, value: bool) {
        self.status.lock().expect("status mutex poisoned").is_checking = value;
    }

    fn set_error(&self, value: bool) {
        self.status.lock().expect("status mutex poisoned").has_error = value;
    }
}
