//! A single piece under assembly: the bytes received so far and the
//! outstanding per-block requests used to avoid re-requesting blocks that
//! are already in flight.

use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use crate::{block_count, block_len, PeerId, PieceIndex};

/// The address of a block within its piece, ready to be turned into a wire
/// REQUEST.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct BlockAddress {
    pub block_index: usize,
    pub begin: u32,
    pub len: u32,
}

/// A single outstanding request for a block, to one peer.
#[derive(Clone, Copy, Debug)]
struct Request {
    peer_id: PeerId,
    issued_at: Instant,
}

/// A piece currently being downloaded: some blocks have arrived, others are
/// requested from one or more peers, others are neither.
pub(crate) struct ActivePiece {
    index: PieceIndex,
    piece_len: u32,
    blocks_needed: usize,
    /// Complete, received blocks, keyed by block index. Never holds a
    /// partial block.
    block_data: BTreeMap<usize, Vec<u8>>,
    /// Outstanding requests per block index. A block may have zero, one, or
    /// (in endgame) several entries, each to a distinct peer.
    block_requests: BTreeMap<usize, Vec<Request>>,
    last_activity: Instant,
}

impl ActivePiece {
    /// Constructs an empty active piece for piece `index` of length
    /// `piece_length`.
    pub fn new(index: PieceIndex, piece_length: u32, now: Instant) -> Self {
        Self {
            index,
            piece_len: piece_length,
            blocks_needed: block_count(piece_length),
            block_data: BTreeMap::new(),
            block_requests: BTreeMap::new(),
            last_activity: now,
        }
    }

    pub fn index(&self) -> PieceIndex {
        self.index
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// The total number of bytes received so far.
    pub fn buffered_bytes(&self) -> u64 {
        self.block_data.values().map(|b| b.len() as u64).sum()
    }

    /// True iff every block of this piece has arrived.
    pub fn have_all_blocks(&self) -> bool {
        self.block_data.len() == self.blocks_needed
    }

    pub fn received_block_count(&self) -> usize {
        self.block_data.len()
    }

    /// Records an outstanding request for `block_index` to `peer_id`.
    /// Idempotent: requesting the same block from the same peer twice
    /// doesn't create a duplicate entry (endgame admits distinct peers,
    /// never the same peer twice for one block).
    pub fn add_request(&mut self, block_index: usize, peer_id: PeerId, now: Instant) {
        let entries = self.block_requests.entry(block_index).or_default();
        if !entries.iter().any(|r| r.peer_id == peer_id) {
            entries.push(Request {
                peer_id,
                issued_at: now,
            });
        }
        self.last_activity = now;
    }

    /// Records a block's arrival. Returns `true` iff this was the first
    /// arrival for that block (a later duplicate arrival is a no-op).
    pub fn add_block(
        &mut self,
        block_index: usize,
        bytes: Vec<u8>,
        _peer_id: PeerId,
        now: Instant,
    ) -> bool {
        if self.block_data.contains_key(&block_index) {
            return false;
        }
        self.block_data.insert(block_index, bytes);
        self.block_requests.remove(&block_index);
        self.last_activity = now;
        true
    }

    /// Removes every outstanding request belonging to `peer_id`, across all
    /// blocks. Returns the number of entries cleared.
    pub fn clear_requests_for_peer(&mut self, peer_id: PeerId) -> usize {
        let mut cleared = 0;
        self.block_requests.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|r| r.peer_id != peer_id);
            cleared += before - entries.len();
            !entries.is_empty()
        });
        cleared
    }

    /// Removes requests older than `timeout`. Returns the number cleared.
    pub fn check_timeouts(&mut self, timeout: Duration, now: Instant) -> usize {
        let mut cleared = 0;
        self.block_requests.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|r| now.saturating_duration_since(r.issued_at) < timeout);
            cleared += before - entries.len();
            !entries.is_empty()
        });
        cleared
    }

    /// True iff `block_index` currently has at least one outstanding
    /// request. If `timeout` is given, only requests issued within the last
    /// `timeout` count.
    pub fn is_block_requested(
        &self,
        block_index: usize,
        timeout: Option<(Duration, Instant)>,
    ) -> bool {
        match self.block_requests.get(&block_index) {
            None => false,
            Some(entries) => match timeout {
                None => !entries.is_empty(),
                Some((timeout, now)) => entries
                    .iter()
                    .any(|r| now.saturating_duration_since(r.issued_at) < timeout),
            },
        }
    }

    /// Yields up to `max` block addresses to request next, in ascending
    /// block index order.
    ///
    /// Outside endgame, only blocks with neither data nor an outstanding
    /// request are returned. In endgame, once all such blocks are
    /// exhausted, already-requested blocks whose request list doesn't
    /// already include `asking_peer` are returned too, up to
    /// `endgame_fanout` total requests per block.
    pub fn needed_blocks(
        &self,
        max: usize,
        endgame: Option<EndgameParams>,
    ) -> Vec<BlockAddress> {
        if max == 0 || self.have_all_blocks() {
            return Vec::new();
        }

        let mut out = Vec::with_capacity(max);
        for block_index in 0..self.blocks_needed {
            if out.len() >= max {
                return out;
            }
            if self.block_data.contains_key(&block_index) {
                continue;
            }
            let is_requested = self
                .block_requests
                .get(&block_index)
                .map(|e| !e.is_empty())
                .unwrap_or(false);
            if !is_requested {
                out.push(self.block_address(block_index));
            }
        }

        if let Some(EndgameParams {
            asking_peer,
            fanout,
        }) = endgame
        {
            for block_index in 0..self.blocks_needed {
                if out.len() >= max {
                    break;
                }
                if self.block_data.contains_key(&block_index) {
                    continue;
                }
                let entries = match self.block_requests.get(&block_index) {
                    Some(e) => e,
                    None => continue,
                };
                if entries.is_empty() {
                    // already covered by the first pass
                    continue;
                }
                if entries.len() >= fanout {
                    continue;
                }
                if entries.iter().any(|r| r.peer_id == asking_peer) {
                    continue;
                }
                out.push(self.block_address(block_index));
            }
        }

        out
    }

    fn block_address(&self, block_index: usize) -> BlockAddress {
        let len = block_len(self.piece_len, block_index);
        BlockAddress {
            block_index,
            begin: block_index as u32 * crate::BLOCK_LEN,
            len,
        }
    }

    /// Concatenates all blocks in ascending order into the piece's full
    /// byte buffer. Requires `have_all_blocks()`.
    pub fn assemble(&self) -> Result<Vec<u8>, IncompletePiece> {
        if !self.have_all_blocks() {
            return Err(IncompletePiece);
        }
        let mut buf = Vec::with_capacity(self.piece_len as usize);
        for block in self.block_data.values() {
            buf.extend_from_slice(block);
        }
        Ok(buf)
    }
}

/// Parameters enabling the endgame re-issuance pass of `needed_blocks`.
#[derive(Clone, Copy, Debug)]
pub(crate) struct EndgameParams {
    pub asking_peer: PeerId,
    pub fanout: usize,
}

/// Returned by `assemble` when called before all blocks have arrived.
#[derive(Clone, Copy, Debug)]
pub(crate) struct IncompletePiece;

impl std::fmt::Display for IncompletePiece {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "piece is not yet fully downloaded")
    }
}

impl std::error::Error for IncompletePiece {}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER_A: PeerId = [b'a'; 20];
    const PEER_B: PeerId = [b'b'; 20];

    fn now() -> Instant {
        Instant::now()
    }

    #[test]
    fn test_add_block_first_arrival_clears_requests() {
        let mut ap = ActivePiece::new(0, crate::BLOCK_LEN * 2, now());
        ap.add_request(0, PEER_A, now());
        assert!(ap.is_block_requested(0, None));

        let first = ap.add_block(0, vec![0; crate::BLOCK_LEN as usize], PEER_A, now());
        assert!(first);
        assert!(!ap.is_block_requested(0, None));

        let second = ap.add_block(0, vec![1; crate::BLOCK_LEN as usize], PEER_B, now());
        assert!(!second, "duplicate arrival must not overwrite");
    }

    #[test]
    fn test_have_all_blocks_and_assemble() {
        let piece_len = crate::BLOCK_LEN * 2;
        let mut ap = ActivePiece::new(0, piece_len, now());
        assert!(!ap.have_all_blocks());
        assert!(ap.assemble().is_err());

        ap.add_block(0, vec![1; crate::BLOCK_LEN as usize], PEER_A, now());
        assert!(!ap.have_all_blocks());
        ap.add_block(1, vec![2; crate::BLOCK_LEN as usize], PEER_A, now());
        assert!(ap.have_all_blocks());

        let data = ap.assemble().unwrap();
        assert_eq!(data.len(), piece_len as usize);
        assert_eq!(&data[..crate::BLOCK_LEN as usize], &vec![1u8; crate::BLOCK_LEN as usize][..]);
    }

    #[test]
    fn test_clear_requests_for_peer() {
        let mut ap = ActivePiece::new(0, crate::BLOCK_LEN * 3, now());
        ap.add_request(0, PEER_A, now());
        ap.add_request(1, PEER_A, now());
        ap.add_request(1, PEER_B, now());

        let cleared = ap.clear_requests_for_peer(PEER_A);
        assert_eq!(cleared, 2);
        assert!(!ap.is_block_requested(0, None));
        assert!(ap.is_block_requested(1, None));
    }

    #[test]
    fn test_check_timeouts_clears_stale_requests() {
        let mut ap = ActivePiece::new(0, crate::BLOCK_LEN, now());
        let old = now() - Duration::from_secs(60);
        ap.add_request(0, PEER_A, old);
        let cleared = ap.check_timeouts(Duration::from_secs(30), now());
        assert_eq!(cleared, 1);
        assert!(!ap.is_block_requested(0, None));
    }

    #[test]
    fn test_needed_blocks_skips_data_and_requested() {
        let mut ap = ActivePiece::new(0, crate::BLOCK_LEN * 3, now());
        ap.add_block(0, vec![0; crate::BLOCK_LEN as usize], PEER_A, now());
        ap.add_request(1, PEER_A, now());

        let needed = ap.needed_blocks(10, None);
        assert_eq!(needed.len(), 1);
        assert_eq!(needed[0].block_index, 2);
    }

    #[test]
    fn test_needed_blocks_respects_max() {
        let ap = ActivePiece::new(0, crate::BLOCK_LEN * 4, now());
        let needed = ap.needed_blocks(2, None);
        assert_eq!(needed.len(), 2);
        assert_eq!(needed[0].block_index, 0);
        assert_eq!(needed[1].block_index, 1);
    }

    #[test]
    fn test_endgame_reissues_up_to_fanout() {
        let mut ap = ActivePiece::new(0, crate::BLOCK_LEN, now());
        ap.add_request(0, PEER_A, now());

        // Without endgame, the block is considered covered.
        assert!(ap.needed_blocks(10, None).is_empty());

        // With endgame, a distinct peer may pick it up too.
        let endgame = EndgameParams {
            asking_peer: PEER_B,
            fanout: 3,
        };
        let needed = ap.needed_blocks(10, Some(endgame));
        assert_eq!(needed.len(), 1);
        assert_eq!(needed[0].block_index, 0);

        // The same peer asking again must not see the block as needed.
        let endgame_same_peer = EndgameParams {
            asking_peer: PEER_A,
            fanout: 3,
        };
        assert!(ap.needed_blocks(10, Some(endgame_same_peer)).is_empty());
    }
}
