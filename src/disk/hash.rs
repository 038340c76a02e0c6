//! The `Hasher` capability: computes a piece's SHA-1 digest.
//!
//! A trait behind `Arc<dyn Hasher>`, mirroring `Storage`/`SessionStore`, so
//! the engine can dispatch to a remote hashing daemon without `Torrent`'s
//! source changing (§9's "mix local and remote implementations" note). Kept
//! synchronous per the design note in §9 ("a logical function;
//! implementations may dispatch to a worker pool") — callers on an async
//! executor offload it via `spawn_blocking`, the same way the teacher's
//! `disk/io.rs` already offloads `Piece::matches_hash` instead of baking an
//! async interface into the hashing itself.

use sha1::{Digest, Sha1};

use crate::Sha1Hash;

/// Computes a piece's SHA-1 digest. A CPU-bound, potentially slow operation
/// for large pieces; callers on an async executor should run it via
/// `tokio::task::spawn_blocking` rather than calling it inline.
pub(crate) trait Hasher: Send + Sync {
    fn sha1(&self, data: &[u8]) -> Sha1Hash;
}

/// The default, local SHA-1 implementation.
pub(crate) struct Sha1Hasher;

impl Hasher for Sha1Hasher {
    fn sha1(&self, data: &[u8]) -> Sha1Hash {
        sha1(data)
    }
}

/// The actual digest computation, kept as a free function so both
/// [`Sha1Hasher`] and tests can use it without going through a trait object.
pub(crate) fn sha1(data: &[u8]) -> Sha1Hash {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}
