// needed by the `select!` macro reaching the default recursion limit
#![recursion_limit = "256"]

#[macro_use]
extern crate serde_derive;

mod active_piece;
pub mod bitfield;
pub mod conf;
mod disk;
pub mod engine;
pub mod error;
pub mod event;
pub mod iovecs;
pub mod metainfo;
mod peer;
mod piece_manager;
mod scheduler;
pub mod session_store;
mod storage_info;
mod torrent;
mod verified_bitfield;

pub use bitfield::BitField;
pub use storage_info::FileInfo;

/// The type of a piece's index.
///
/// On the wire all integers are sent as 4-byte big endian integers, but in the
/// source code we use `usize` to be consistent with other index types in Rust.
pub type PieceIndex = usize;

/// The type of a file's index.
pub type FileIndex = usize;

/// Each torrent gets a randomly assigned ID that is unique within the
/// process.
pub type TorrentId = u32;

/// The peer ID is an arbitrary 20 byte string.
///
/// Guidelines for choosing a peer ID: http://bittorrent.org/beps/bep_0020.html.
pub type PeerId = [u8; 20];

/// A SHA-1 hash digest, 20 bytes long.
pub type Sha1Hash = [u8; 20];

/// This is the only block length we're dealing with (except for possibly the
/// last block). It is the widely used and accepted 16 KiB.
pub const BLOCK_LEN: u32 = 0x4000;

/// The default request pipeline depth (maximum outstanding block requests to
/// a single peer at one time).
pub const DEFAULT_PIPELINE_DEPTH: usize = 200;

/// A block is a fixed size chunk of a piece, which in turn is a fixed size
/// chunk of a torrent. Downloading torrents happen at this block level
/// granularity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockInfo {
    /// The index of the piece of which this is a block.
    pub piece_index: PieceIndex,
    /// The zero-based byte offset into the piece.
    pub offset: u32,
    /// The block's length in bytes. Always 16 KiB (0x4000 bytes), except
    /// possibly for the last block of the last piece.
    pub len: u32,
}

impl BlockInfo {
    /// Returns the index of the block within its piece, assuming the default
    /// block length of 16 KiB.
    pub fn index_in_piece(&self) -> usize {
        // we need to use "lower than or equal" as this may be the last block in
        // which case it may be shorter than the default block length
        debug_assert!(self.len <= BLOCK_LEN);
        debug_assert!(self.len > 0);
        (self.offset / BLOCK_LEN) as usize
    }
}

/// Returns the length of the block at the index in piece.
///
/// If the piece is not a multiple of the default block length, the returned
/// value is smaller for the last block.
///
/// # Panics
///
/// Panics if the index multiplied by the default block length would exceed the
/// piece length.
pub fn block_len(piece_len: u32, index: usize) -> u32 {
    let index = index as u32;
    let block_offset = index * BLOCK_LEN;
    assert!(piece_len > block_offset);
    std::cmp::min(piece_len - block_offset, BLOCK_LEN)
}

/// Returns the number of blocks in a piece of the given length.
pub fn block_count(piece_len: u32) -> usize {
    // all but the last piece are a multiple of the block length, but the
    // last piece may be shorter so we need to account for this by rounding
    // up before dividing to get the number of blocks in piece
    (piece_len as usize + (BLOCK_LEN as usize - 1)) / BLOCK_LEN as usize
}
