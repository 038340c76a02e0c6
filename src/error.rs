//! The crate-wide error taxonomy.
//!
//! Kinds, not exhaustive types: block-level errors are silent (stats-only)
//! and never reach this enum; peer-level errors close the connection;
//! piece-level errors reset the piece; torrent- and engine-level errors
//! propagate here and are surfaced via the event stream.

use std::fmt;

use crate::{PieceIndex, TorrentId};

/// The result type used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The crate-wide error type.
#[derive(Debug)]
pub enum Error {
    /// Connect/read/write failure. Per-peer; recovered by dropping the
    /// connection.
    Network(std::io::Error),
    /// Malformed wire data. Per-peer; the connection is dropped.
    Protocol(ProtocolError),
    /// Verification failure: the assembled piece's SHA-1 did not match the
    /// expected digest. Piece-level; the piece is reset and re-downloaded.
    HashMismatch { index: PieceIndex },
    /// Write/read/space failure. Torrent-level; `activity_state` becomes
    /// `error` until the user retries. In-memory state is preserved.
    Storage(StorageError),
    /// The active piece manager refused to admit a new piece (capacity
    /// exhausted). Transient; the scheduler retries on the next tick.
    Capacity,
    /// A block request expired. Recovered by clearing the reservation.
    Timeout,
    /// Invalid metainfo or a missing piece hash. Torrent-level, fatal.
    Config(ConfigError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network(e) => write!(f, "network error: {}", e),
            Self::Protocol(e) => write!(f, "protocol error: {}", e),
            Self::HashMismatch { index } => {
                write!(f, "piece {} failed hash verification", index)
            }
            Self::Storage(e) => write!(f, "storage error: {}", e),
            Self::Capacity => write!(f, "active piece manager at capacity"),
            Self::Timeout => write!(f, "request timed out"),
            Self::Config(e) => write!(f, "invalid configuration: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Network(e) => Some(e),
            Self::Protocol(e) => Some(e),
            Self::Storage(e) => Some(e),
            Self::Config(e) => Some(e),
            Self::HashMismatch { .. } | Self::Capacity | Self::Timeout => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Network(e)
    }
}

impl From<serde_bencode::Error> for Error {
    fn from(e: serde_bencode::Error) -> Self {
        Self::Config(ConfigError::Bencode(e.to_string()))
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl From<StorageError> for Error {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

/// Wire-level protocol violations.
#[derive(Debug)]
pub enum ProtocolError {
    /// The handshake's protocol string, reserved bytes, or length prefix
    /// didn't match BEP 3.
    InvalidHandshake,
    /// The handshake's info hash didn't match the torrent we're downloading.
    InvalidInfoHash,
    /// A message's declared length was absurd (used to reject memory
    /// exhaustion attempts).
    OversizePayload { len: u32 },
    /// A message could not be parsed per its id.
    InvalidMessage { id: u8 },
    /// Bitfield was sent outside of the availability-exchange phase.
    BitfieldNotAfterHandshake,
    /// The keep-alive timeout (120s) elapsed with no message from peer.
    KeepAliveTimeout,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidHandshake => write!(f, "invalid handshake"),
            Self::InvalidInfoHash => write!(f, "info hash mismatch"),
            Self::OversizePayload { len } => {
                write!(f, "oversize payload ({} bytes)", len)
            }
            Self::InvalidMessage { id } => {
                write!(f, "invalid message (id {})", id)
            }
            Self::BitfieldNotAfterHandshake => {
                write!(f, "bitfield received outside availability exchange")
            }
            Self::KeepAliveTimeout => write!(f, "keep-alive timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Storage (disk IO) failures.
#[derive(Debug)]
pub enum StorageError {
    Io(std::io::Error),
    InvalidPieceIndex,
    NoSpace,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "{}", e),
            Self::InvalidPieceIndex => write!(f, "invalid piece index"),
            Self::NoSpace => write!(f, "insufficient disk space"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::InvalidPieceIndex | Self::NoSpace => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Metainfo / session configuration failures.
#[derive(Debug)]
pub enum ConfigError {
    Bencode(String),
    MissingPieceHashes,
    /// The persisted session format's version field is newer (or
    /// incompatible) with what this build understands.
    UnsupportedSessionVersion { found: u32, supported: u32 },
    /// A magnet URI had no `xt=urn:btih:` parameter, or its info hash wasn't
    /// valid hex / 20 bytes.
    InvalidMagnetUri(String),
    /// An engine call referenced a `TorrentId` not in its registry.
    UnknownTorrent(TorrentId),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bencode(msg) => write!(f, "bencode error: {}", msg),
            Self::MissingPieceHashes => write!(f, "metainfo has no piece hashes"),
            Self::UnsupportedSessionVersion { found, supported } => write!(
                f,
                "persisted session version {} is not supported (expected {})",
                found, supported
            ),
            Self::InvalidMagnetUri(msg) => write!(f, "invalid magnet uri: {}", msg),
            Self::UnknownTorrent(id) => write!(f, "unknown torrent id {}", id),
        }
    }
}

impl std::error::Error for ConfigError {}
