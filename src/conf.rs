//! This module defines types used to configure the engine and its parts.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use crate::PeerId;

/// The default swarmbit client id prefix, in Azureus style.
pub const SWARMBIT_CLIENT_ID: &PeerId = b"-SB0100-000000000000";

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
    pub disk: DiskConf,
}

impl Conf {
    /// Returns the configuration with reasonable defaults, except for the
    /// download directory, as it is not sensible to guess that for the user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf {
                client_id: *SWARMBIT_CLIENT_ID,
                listen_addr: None,
            },
            torrent: TorrentConf::new(download_dir),
            disk: DiskConf::default(),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to other peers.
    pub client_id: PeerId,
    /// Where to accept inbound peer connections; `None` disables the
    /// listener.
    pub listen_addr: Option<SocketAddr>,
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

    /// The max number of connected peers the torrent should have.
    pub max_connected_peer_count: usize,

    /// The maximum number of block requests a session keeps outstanding
    /// towards a single peer, no matter what the bandwidth-delay product
    /// suggests.
    pub max_out_request_queue: usize,

    /// If no payload byte arrives for an outstanding request within this
    /// duration, the request is aborted and the peer is snubbed.
    pub request_timeout: Duration,

    /// The deadline from TCP connect to the completion of the post-handshake
    /// sequence.
    pub handshake_timeout: Duration,

    /// A session sends a keep-alive if it hasn't written anything for this
    /// long.
    pub keep_alive_interval: Duration,

    /// A peer silent for this long is disconnected.
    pub inactivity_timeout: Duration,

    /// When fewer than this many pieces are missing, the picker enters
    /// end-game mode and may request the same block from multiple peers.
    pub end_game_threshold: usize,

    /// The maximum number of peers a single block may be requested from in
    /// end-game mode.
    pub end_game_block_peer_bound: usize,

    /// How long a protocol-violating endpoint stays blacklisted.
    pub ban_duration: Duration,

    /// If set, all files are assumed present and correct on disk and pieces
    /// are only verified lazily, when first requested by a peer.
    pub seed_mode: bool,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            // This value is mostly picked for performance while keeping in
            // mind not to overwhelm the host.
            max_connected_peer_count: 50,
            max_out_request_queue: 500,
            request_timeout: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(10),
            keep_alive_interval: Duration::from_secs(90),
            inactivity_timeout: Duration::from_secs(120),
            end_game_threshold: 8,
            end_game_block_peer_bound: 3,
            ban_duration: Duration::from_secs(20 * 60),
            seed_mode: false,
        }
    }
}

/// Configuration of the disk task.
#[derive(Clone, Debug)]
pub struct DiskConf {
    /// Once this many blocks are queued for writing, `write_block` starts
    /// reporting backpressure and peer sessions stop issuing new requests.
    pub write_queue_high_watermark: usize,

    /// Once a congested write queue drains below this many blocks, observers
    /// are notified that requests may flow again.
    pub write_queue_low_watermark: usize,

    /// The number of blocks the read cache holds. Reads served from the cache
    /// don't touch the filesystem.
    pub read_cache_capacity: usize,
}

impl Default for DiskConf {
    fn default() -> Self {
        Self {
            // 64 MiB of in-flight writes before pushing back
            write_queue_high_watermark: 4096,
            write_queue_low_watermark: 1024,
            // 16 MiB of read cache
            read_cache_capacity: 1024,
        }
    }
}
