//! The `Storage` capability: writes verified piece bytes to disk, reads them
//! back for rechecking, and reports total bytes stored.
//!
//! Per the design note in §9 ("dynamic dispatch over `Hasher`/`Storage`/
//! `SessionStore`"), `Storage` is a trait held behind `Arc<dyn Storage>` so a
//! torrent can be handed a local or remote implementation interchangeably.
//! [`DiskStorage`] is the local, file-backed implementation, grounded on the
//! teacher's `disk/io.rs` `Disk`/`Torrent`/`TorrentFile` actor shape, but
//! with hashing split out into [`hash`] (a separate capability per spec) and
//! block-level buffering left to `ActivePiece` — `Storage` here only ever
//! sees whole, already-verified pieces.

pub(crate) mod error;
pub(crate) mod hash;
mod io;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task;

use crate::{
    error::{Error, Result, StorageError},
    storage_info::StorageInfo,
    PieceIndex,
};
use hash::Hasher;
use io::FileSet;

/// Writes verified piece bytes, reads them back for rechecking, and reports
/// total bytes stored.
#[async_trait]
pub(crate) trait Storage: Send + Sync {
    /// Writes `data` (the full, hash-verified bytes of piece `index`) to the
    /// files it spans. Durable on success.
    async fn write_piece(&self, index: PieceIndex, data: Vec<u8>) -> Result<()>;

    /// Reads piece `index`'s bytes back from disk, for rechecking.
    async fn read_piece(&self, index: PieceIndex) -> Result<Vec<u8>>;

    /// The sum of bytes currently allocated on disk for this torrent.
    async fn total_size(&self) -> Result<u64>;

    /// Reads and hashes every piece, reporting which ones verify against
    /// their expected digest. Drives the `checking` activity state.
    async fn recheck_all(&self) -> Result<Vec<(PieceIndex, bool)>>;
}

/// The local, file-backed `Storage` implementation.
pub(crate) struct DiskStorage {
    files: Arc<FileSet>,
    hasher: Arc<dyn Hasher>,
}

impl DiskStorage {
    /// Opens (creating if necessary) the on-disk file set described by
    /// `info`, using `hasher` to verify pieces during `recheck_all`.
    pub(crate) fn new(info: StorageInfo, hasher: Arc<dyn Hasher>) -> Result<Self> {
        let files = FileSet::new(info)?;
        Ok(Self {
            files: Arc::new(files),
            hasher,
        })
    }
}

#[async_trait]
impl Storage for DiskStorage {
    async fn write_piece(&self, index: PieceIndex, data: Vec<u8>) -> Result<()> {
        let files = std::sync::Arc::clone(&self.files);
        task::spawn_blocking(move || files.write_piece(index, &data))
            .await
            .map_err(|e| Error::Storage(StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))))??;
        Ok(())
    }

    async fn read_piece(&self, index: PieceIndex) -> Result<Vec<u8>> {
        let files = std::sync::Arc::clone(&self.files);
        task::spawn_blocking(move || files.read_piece(index))
            .await
            .map_err(|e| Error::Storage(StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))))?
            .map_err(Error::from)
    }

    async fn total_size(&self) -> Result<u64> {
        let files = std::sync::Arc::clone(&self.files);
        task::spawn_blocking(move || files.total_size())
            .await
            .map_err(|e| Error::Storage(StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))))?
            .map_err(Error::from)
    }

    async fn recheck_all(&self) -> Result<Vec<(PieceIndex, bool)>> {
        let files = Arc::clone(&self.files);
        let hasher = Arc::clone(&self.hasher);
        task::spawn_blocking(move || {
            let mut results = Vec::with_capacity(files.piece_count());
            for index in 0..files.piece_count() {
                let verified = match files.read_piece(index) {
                    Ok(data) => {
                        let actual = hasher.sha1(&data);
                        let expected = files.expected_hash(index).ok();
                        Some(actual) == expected
                    }
                    Err(_) => false,
                };
                results.push((index, verified));
            }
            results
        })
        .await
        .map_err(|e| Error::Storage(StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))))
    }
}
