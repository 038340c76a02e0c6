//! Blocking file IO for one torrent's on-disk layout: opening/creating the
//! file set, writing a verified piece's bytes across the files it spans, and
//! reading pieces back for rechecking.
//!
//! Everything in this module is synchronous and is only ever called from a
//! `spawn_blocking` task (see `disk::mod`); no `.await` appears below.

use std::{
    fs::{self, File, OpenOptions},
    os::unix::fs::FileExt,
    sync::Mutex,
};

use super::error::{NewTorrentError, Result, WriteError};
use crate::{
    iovecs::{IoVec, IoVecs},
    storage_info::{FsStructure, StorageInfo},
    FileInfo, PieceIndex,
};

/// One of torrent's files, along with its open handle.
struct TorrentFile {
    info: FileInfo,
    handle: File,
}

impl TorrentFile {
    /// Writes `iovecs` at `offset` in file, looping until the whole buffer
    /// has been confirmed written. `write_at` may perform a short write, so
    /// each round only advances `iovecs` by what was actually written.
    fn write_vectored_at(
        &self,
        iovecs: &mut IoVecs<'_>,
        offset: u64,
    ) -> Result<usize, WriteError> {
        let mut total_write_count: u64 = 0;
        while !iovecs.is_empty() {
            let bufs = iovecs.buffers();
            let buf = &bufs[0];
            let write_count = self
                .handle
                .write_at(buf, offset + total_write_count)
                .map_err(|e| {
                    log::warn!("File {:?} write error: {}", self.info.path, e);
                    WriteError::Io(e)
                })? as u64;
            iovecs.advance(write_count as usize);
            total_write_count += write_count;
        }
        Ok(total_write_count as usize)
    }

    /// Reads `len` bytes at `offset` in file into `buf`.
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<(), WriteError> {
        self.handle.read_exact_at(buf, offset).map_err(WriteError::Io)
    }
}

/// The open file set for one torrent, plus its immutable piece geometry.
pub(super) struct FileSet {
    info: StorageInfo,
    files: Vec<Mutex<TorrentFile>>,
}

impl FileSet {
    /// Creates the file system structure of the torrent and opens file
    /// handles, creating any missing subdirectories for archive torrents.
    pub(super) fn new(info: StorageInfo) -> Result<Self, NewTorrentError> {
        let open_file = |file_info: FileInfo| -> Result<Mutex<TorrentFile>, NewTorrentError> {
            if let Some(parent) = file_info.path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    log::info!("Creating torrent subdir {:?}", parent);
                    fs::create_dir_all(parent).map_err(NewTorrentError::Io)?;
                }
            }
            let handle = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&file_info.path)
                .map_err(|e| {
                    log::warn!("Failed to open file {:?}", file_info.path);
                    NewTorrentError::Io(e)
                })?;
            Ok(Mutex::new(TorrentFile {
                info: file_info,
                handle,
            }))
        };

        let files = match &info.structure {
            FsStructure::File(file) => {
                log::debug!(
                    "Torrent is single {} bytes long file {:?}",
                    file.len,
                    file.path
                );
                let file = FileInfo {
                    path: info.download_dir.join(&file.path),
                    torrent_offset: file.torrent_offset,
                    len: file.len,
                };
                vec![open_file(file)?]
            }
            FsStructure::Archive { files } => {
                log::debug!("Torrent is multi file: {:?}", files);
                let mut torrent_files = Vec::with_capacity(files.len());
                for file in files.iter() {
                    let file = FileInfo {
                        path: info.download_dir.join(&file.path),
                        torrent_offset: file.torrent_offset,
                        len: file.len,
                    };
                    torrent_files.push(open_file(file)?);
                }
                torrent_files
            }
        };

        Ok(Self { info, files })
    }

    /// Writes an already-verified piece's bytes to the files it spans.
    pub(super) fn write_piece(
        &self,
        index: PieceIndex,
        data: &[u8],
    ) -> Result<usize, WriteError> {
        let piece_len = self
            .info
            .piece_len(index)
            .map_err(|_| WriteError::InvalidPieceIndex)?;
        debug_assert_eq!(data.len(), piece_len as usize);

        let file_range = self
            .info
            .files_intersecting_piece(index)
            .map_err(|_| WriteError::InvalidPieceIndex)?;
        let files = &self.files[file_range];
        debug_assert!(!files.is_empty());

        let piece_torrent_offset = index as u64 * self.info.piece_len as u64;
        let mut total_write_count = 0;
        let mut write_torrent_offset = piece_torrent_offset;

        if files.len() == 1 {
            let file = files[0].lock().unwrap();
            let slice = file.info.get_slice(write_torrent_offset, data.len() as u64);
            let mut iovecs = IoVecs::unbounded(vec![IoVec::from_slice(data)]);
            total_write_count += file.write_vectored_at(&mut iovecs, slice.offset)?;
        } else {
            let mut bufs = vec![IoVec::from_slice(data)];
            for file in files.iter() {
                let file = file.lock().unwrap();
                let remaining = data.len() as u64 - (write_torrent_offset - piece_torrent_offset);
                let slice = file.info.get_slice(write_torrent_offset, remaining);
                debug_assert!(slice.len > 0);

                let mut iovecs = IoVecs::bounded(bufs, slice.len as usize);
                let write_count = file.write_vectored_at(&mut iovecs, slice.offset)?;
                bufs = iovecs.into_tail();

                write_torrent_offset += write_count as u64;
                total_write_count += write_count;
            }
            debug_assert!(bufs.is_empty());
        }

        Ok(total_write_count)
    }

    /// Reads a piece's bytes back from the files it spans, for rechecking.
    pub(super) fn read_piece(&self, index: PieceIndex) -> Result<Vec<u8>, WriteError> {
        let piece_len = self
            .info
            .piece_len(index)
            .map_err(|_| WriteError::InvalidPieceIndex)?;
        let file_range = self
            .info
            .files_intersecting_piece(index)
            .map_err(|_| WriteError::InvalidPieceIndex)?;
        let files = &self.files[file_range];
        debug_assert!(!files.is_empty());

        let piece_torrent_offset = index as u64 * self.info.piece_len as u64;
        let mut data = vec![0u8; piece_len as usize];
        let mut filled = 0usize;
        let mut read_torrent_offset = piece_torrent_offset;

        for file in files.iter() {
            let file = file.lock().unwrap();
            let remaining = data.len() as u64 - filled as u64;
            let slice = file.info.get_slice(read_torrent_offset, remaining);
            let len = slice.len as usize;
            file.read_exact_at(&mut data[filled..filled + len], slice.offset)?;
            filled += len;
            read_torrent_offset += len as u64;
        }
        debug_assert_eq!(filled, data.len());

        Ok(data)
    }

    /// Returns the sum of each file's actual on-disk length.
    pub(super) fn total_size(&self) -> Result<u64, WriteError> {
        let mut total = 0;
        for file in &self.files {
            let file = file.lock().unwrap();
            total += file.handle.metadata().map_err(WriteError::Io)?.len();
        }
        Ok(total)
    }

    pub(super) fn piece_count(&self) -> usize {
        self.info.piece_count
    }

    pub(super) fn expected_hash(&self, index: PieceIndex) -> Result<crate::Sha1Hash, WriteError> {
        self.info
            .expected_hash(index)
            .map_err(|_| WriteError::InvalidPieceIndex)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn single_file_info(dir: PathBuf, len: u64, piece_len: u32) -> StorageInfo {
        let piece_count = ((len + piece_len as u64 - 1) / piece_len as u64) as usize;
        let last_piece_len = (len - piece_len as u64 * (piece_count as u64 - 1)) as u32;
        StorageInfo {
            piece_count,
            piece_len,
            last_piece_len,
            download_len: len,
            download_dir: dir,
            structure: FsStructure::File(FileInfo {
                path: PathBuf::from("file.bin"),
                len,
                torrent_offset: 0,
            }),
            piece_hashes: vec![[0; 20]; piece_count],
        }
    }

    #[test]
    fn test_write_and_read_piece_roundtrip() {
        let dir = std::env::temp_dir().join(format!("swarmcore-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let info = single_file_info(dir.clone(), 32, 16);
        let set = FileSet::new(info).unwrap();

        let piece0 = vec![7u8; 16];
        set.write_piece(0, &piece0).unwrap();
        let read_back = set.read_piece(0).unwrap();
        assert_eq!(read_back, piece0);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_total_size_reflects_written_bytes() {
        let dir = std::env::temp_dir().join(format!("swarmcore-test2-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let info = single_file_info(dir.clone(), 32, 16);
        let set = FileSet::new(info).unwrap();
        set.write_piece(0, &vec![1u8; 16]).unwrap();
        set.write_piece(1, &vec![2u8; 16]).unwrap();
        assert_eq!(set.total_size().unwrap(), 32);
        fs::remove_dir_all(&dir).ok();
    }
}
