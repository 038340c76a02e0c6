//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

use crate::PeerId;

/// The default swarmcore client id.
pub const SWARMCORE_CLIENT_ID: &PeerId = b"cbt-0000000000000000";

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user. It uses the default swarmcore client id,
    /// [`SWARMCORE_CLIENT_ID`].
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf {
                client_id: *SWARMCORE_CLIENT_ID,
            },
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,
}

/// Configuration for a torrent.
///
/// The engine will have a default instance of this applied to all torrents by
/// default, but individual torrents may override this configuration.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which a torrent's files are placed upon download and
    /// from which they are seeded.
    pub download_dir: PathBuf,

    /// The minimum number of peers we want to keep in torrent at all times.
    /// This will be configurable later.
    pub min_requested_peer_count: usize,

    /// The max number of connected peers the torrent should have. Also
    /// referred to as `max_peers` in the design docs.
    pub max_connected_peer_count: usize,

    /// The maximum number of outstanding block requests to a single peer at
    /// one time.
    pub pipeline_depth: usize,

    /// The policy limits for the per-torrent `ActivePieceManager`
    /// (memory-bounded set of in-progress pieces).
    pub active_piece: ActivePieceConf,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            // We always request at least 10 peers as anything less is a waste
            // of network round trip and it allows us to buffer up a bit more
            // than needed.
            min_requested_peer_count: 10,
            // This value is mostly picked for performance while keeping in mind
            // not to overwhelm the host.
            max_connected_peer_count: 100,
            // Roughly the bandwidth-delay product for a fast link; see
            // PeerConnection's pipeline bookkeeping.
            pipeline_depth: crate::DEFAULT_PIPELINE_DEPTH,
            active_piece: ActivePieceConf::default(),
        }
    }
}

/// Policy limits for the set of pieces currently being assembled in memory.
#[derive(Clone, Copy, Debug)]
pub struct ActivePieceConf {
    /// An outstanding block request older than this is considered lost and
    /// its reservation is cleared by the periodic sweep.
    pub request_timeout: Duration,

    /// Upper bound on the number of pieces simultaneously under assembly.
    pub max_active_pieces: usize,

    /// Upper bound on the total number of buffered bytes across all active
    /// pieces.
    pub max_buffered_bytes: u64,

    /// Period of the background timeout/stale-piece sweep.
    pub cleanup_interval: Duration,

    /// Maximum number of distinct peers that may concurrently be assigned
    /// the same block once the torrent enters endgame mode.
    pub endgame_fanout: usize,
}

impl Default for ActivePieceConf {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_active_pieces: 20,
            // 16 MiB.
            max_buffered_bytes: 16 * 1024 * 1024,
            cleanup_interval: Duration::from_secs(10),
            endgame_fanout: 3,
        }
    }
}
