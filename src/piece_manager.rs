//! The memory-bounded set of pieces currently being assembled.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use crate::{
    active_piece::ActivePiece, conf::ActivePieceConf, error::Error, PeerId, PieceIndex,
};

/// Bounded cache of [`ActivePiece`] keyed by piece index. Enforces the
/// active-piece count and buffered-byte ceilings and runs the periodic
/// stale/timeout sweep.
pub(crate) struct ActivePieceManager {
    conf: ActivePieceConf,
    pieces: HashMap<PieceIndex, ActivePiece>,
}

impl ActivePieceManager {
    pub fn new(conf: ActivePieceConf) -> Self {
        Self {
            conf,
            pieces: HashMap::new(),
        }
    }

    pub fn get(&self, index: PieceIndex) -> Option<&ActivePiece> {
        self.pieces.get(&index)
    }

    pub fn get_mut(&mut self, index: PieceIndex) -> Option<&mut ActivePiece> {
        self.pieces.get_mut(&index)
    }

    /// Returns the existing entry for `index`, or creates one of length
    /// `piece_length` if capacity allows. Runs a stale sweep first if the
    /// manager is at its piece-count limit.
    pub fn get_or_create(
        &mut self,
        index: PieceIndex,
        piece_length: u32,
        now: Instant,
    ) -> Option<&mut ActivePiece> {
        if self.pieces.contains_key(&index) {
            return self.pieces.get_mut(&index);
        }

        if self.pieces.len() >= self.conf.max_active_pieces {
            self.stale_sweep(now);
        }
        if self.pieces.len() >= self.conf.max_active_pieces {
            return None;
        }

        let expected_first_block = crate::block_len(piece_length, 0) as u64;
        if self.total_buffered_bytes() + expected_first_block > self.conf.max_buffered_bytes {
            return None;
        }

        self.pieces
            .insert(index, ActivePiece::new(index, piece_length, now));
        self.pieces.get_mut(&index)
    }

    /// Tries to reserve `index` as above but surfaces the capacity refusal
    /// as an [`Error::Capacity`] for callers that want to distinguish it
    /// from "piece already complete".
    pub fn try_get_or_create(
        &mut self,
        index: PieceIndex,
        piece_length: u32,
        now: Instant,
    ) -> Result<&mut ActivePiece, Error> {
        // Cannot directly return from the `Option` branch due to the borrow
        // checker, so re-check membership afterwards.
        let existed = self.pieces.contains_key(&index);
        if self.get_or_create(index, piece_length, now).is_none() {
            return Err(Error::Capacity);
        }
        let _ = existed;
        Ok(self.pieces.get_mut(&index).expect("just inserted or existing"))
    }

    /// Destroys the entry for `index`, releasing its buffered data.
    pub fn remove(&mut self, index: PieceIndex) {
        self.pieces.remove(&index);
    }

    /// Fans `clear_requests_for_peer` out to every active piece.
    pub fn clear_requests_for_peer(&mut self, peer_id: PeerId) -> usize {
        self.pieces
            .values_mut()
            .map(|ap| ap.clear_requests_for_peer(peer_id))
            .sum()
    }

    /// Runs the periodic timeout sweep across every active piece.
    pub fn check_timeouts(&mut self, now: Instant) -> usize {
        self.pieces
            .values_mut()
            .map(|ap| ap.check_timeouts(self.conf.request_timeout, now))
            .sum()
    }

    /// Removes pieces that have received no blocks and have been idle for
    /// at least `2 * request_timeout`. Called when `get_or_create` would
    /// otherwise refuse a new piece for want of a free slot.
    pub fn stale_sweep(&mut self, now: Instant) {
        let threshold = self.conf.request_timeout * 2;
        self.pieces.retain(|index, ap| {
            let stale = ap.received_block_count() == 0
                && now.saturating_duration_since(ap.last_activity()) >= threshold;
            if stale {
                log::debug!("Dropping stale active piece {} (no blocks received)", index);
            }
            !stale
        });
    }

    pub fn total_buffered_bytes(&self) -> u64 {
        self.pieces.values().map(|ap| ap.buffered_bytes()).sum()
    }

    pub fn active_indices(&self) -> impl Iterator<Item = PieceIndex> + '_ {
        self.pieces.keys().copied()
    }

    pub fn active_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn endgame_fanout(&self) -> usize {
        self.conf.endgame_fanout
    }

    pub fn request_timeout(&self) -> Duration {
        self.conf.request_timeout
    }

    /// Drops every active piece, releasing all buffered data. Used on
    /// torrent stop.
    pub fn destroy(&mut self) {
        self.pieces.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ActivePieceManager {
        ActivePieceManager::new(ActivePieceConf {
            request_timeout: Duration::from_secs(30),
            max_active_pieces: 2,
            max_buffered_bytes: 1024 * 1024,
            cleanup_interval: Duration::from_secs(10),
            endgame_fanout: 3,
        })
    }

    #[test]
    fn test_get_or_create_respects_piece_count_limit() {
        let mut mgr = manager();
        let now = Instant::now();
        assert!(mgr.get_or_create(0, crate::BLOCK_LEN, now).is_some());
        assert!(mgr.get_or_create(1, crate::BLOCK_LEN, now).is_some());
        assert!(mgr.get_or_create(2, crate::BLOCK_LEN, now).is_none());
        assert_eq!(mgr.active_count(), 2);
    }

    #[test]
    fn test_stale_sweep_frees_slot_for_new_piece() {
        let mut mgr = manager();
        let old = Instant::now();
        mgr.get_or_create(0, crate::BLOCK_LEN, old);
        mgr.get_or_create(1, crate::BLOCK_LEN, old);

        let later = old + Duration::from_secs(120);
        // Piece 2 should now be admitted because stale_sweep, triggered
        // internally by get_or_create, drops piece 0 and 1 (no blocks ever
        // received, idle past 2x request_timeout).
        assert!(mgr.get_or_create(2, crate::BLOCK_LEN, later).is_some());
        assert!(mgr.active_count() <= 2);
    }

    #[test]
    fn test_remove_and_clear_requests_for_peer() {
        let mut mgr = manager();
        let now = Instant::now();
        let peer = [1u8; 20];
        mgr.get_or_create(0, crate::BLOCK_LEN, now)
            .unwrap()
            .add_request(0, peer, now);
        assert_eq!(mgr.clear_requests_for_peer(peer), 1);
        mgr.remove(0);
        assert!(mgr.get(0).is_none());
    }

    #[test]
    fn test_capacity_refusal_reports_error() {
        let mut mgr = manager();
        let now = Instant::now();
        mgr.get_or_create(0, crate::BLOCK_LEN, now);
        mgr.get_or_create(1, crate::BLOCK_LEN, now);
        let err = mgr.try_get_or_create(2, crate::BLOCK_LEN, now);
        assert!(matches!(err, Err(Error::Capacity)));
    }
}
