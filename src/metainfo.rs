//! Parsing of the `.torrent` metainfo file (BEP 3) into the in-memory shape
//! the rest of the crate consumes: a flat file list with torrent-relative
//! offsets plus the per-piece SHA-1 digests.

use std::path::PathBuf;

use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};

use crate::{
    error::{ConfigError, Error, Result},
    storage_info::{FileInfo, FsStructure},
    Sha1Hash,
};

/// A parsed `.torrent` file.
#[derive(Debug, Serialize, Deserialize)]
pub struct Metainfo {
    pub info: Info,
    #[serde(default)]
    pub announce: Option<String>,
    #[serde(default, rename = "announce-list")]
    pub announce_list: Option<Vec<Vec<String>>>,
}

impl Metainfo {
    /// Parses a metainfo file from its raw bencoded bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let metainfo: Self = serde_bencode::from_bytes(buf)
            .map_err(|e| Error::Config(ConfigError::Bencode(e.to_string())))?;
        Ok(metainfo)
    }

    /// Computes the info hash: the SHA-1 digest of the bencoded `info`
    /// dictionary. This uniquely identifies the torrent.
    pub fn create_info_hash(&self) -> Result<Sha1Hash> {
        let info = serde_bencode::to_bytes(&self.info)
            .map_err(|e| Error::Config(ConfigError::Bencode(e.to_string())))?;
        let digest = Sha1::digest(&info);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }

    /// The torrent's display name, used as the single file's name or as the
    /// archive's top-level download directory name.
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// The nominal piece length.
    pub fn piece_len(&self) -> u32 {
        self.info.piece_length as u32
    }

    /// The number of pieces, derived from the length of the concatenated
    /// piece hash string.
    pub fn piece_count(&self) -> usize {
        self.info.pieces.len() / 20
    }

    /// Splits the concatenated `pieces` byte string into individual 20 byte
    /// SHA-1 digests, in ascending piece order.
    pub fn piece_hashes(&self) -> Result<Vec<Sha1Hash>> {
        if self.info.pieces.is_empty() || self.info.pieces.len() % 20 != 0 {
            return Err(Error::Config(ConfigError::MissingPieceHashes));
        }
        Ok(self
            .info
            .pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect())
    }

    /// Builds the flattened file-system structure (single file or archive),
    /// assigning each file its torrent-relative byte offset.
    pub fn build_structure(&self) -> FsStructure {
        match &self.info.files {
            None => FsStructure::File(FileInfo {
                path: PathBuf::from(&self.info.name),
                len: self.info.length.unwrap_or(0) as u64,
                torrent_offset: 0,
            }),
            Some(files) => {
                let mut offset = 0;
                let files = files
                    .iter()
                    .map(|file| {
                        let len = file.length as u64;
                        let info = FileInfo {
                            path: file.path.iter().collect(),
                            len,
                            torrent_offset: offset,
                        };
                        offset += len;
                        info
                    })
                    .collect();
                FsStructure::Archive { files }
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(with = "serde_bytes")]
    pub pieces: ByteBuf,
    #[serde(rename = "piece length")]
    pub piece_length: u64,
    pub length: Option<u64>,
    pub files: Option<Vec<File>>,
    pub private: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct File {
    pub path: Vec<String>,
    pub length: i64,
}
