//! The alert queue: how the engine reports events to the host.
//!
//! Alerts are one flat tagged enum rather than a class hierarchy; each
//! variant belongs to a [`AlertCategory`], and the host picks which
//! categories it wants delivered with a category mask on the engine.

use std::net::{IpAddr, SocketAddr};

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::{error::PeerError, resume::ResumeData, PieceIndex, TorrentId};

pub(crate) type Sender = UnboundedSender<Alert>;
/// The host's half of the alert queue.
pub type Receiver = UnboundedReceiver<Alert>;

/// Alert categories, used to filter delivery. The flag values can be
/// or-ed together into a mask.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AlertCategory(pub u32);

impl AlertCategory {
    pub const ERROR: Self = Self(1);
    pub const PEER: Self = Self(1 << 1);
    pub const STORAGE: Self = Self(1 << 2);
    pub const PIECE_PROGRESS: Self = Self(1 << 3);
    pub const STATUS: Self = Self(1 << 4);
    pub const ALL: Self = Self(u32::MAX);

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl std::ops::BitOr for AlertCategory {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// An event the engine reports to the host.
#[derive(Debug)]
#[non_exhaustive]
pub enum Alert {
    /// A torrent was added and allocated.
    TorrentAdded { id: TorrentId },
    /// A torrent finished downloading everything it wanted.
    TorrentComplete { id: TorrentId },
    /// A torrent hit an unrecoverable error and was paused.
    TorrentError { id: TorrentId, error: String },
    /// A piece with `alert_when_available` completed and passed its hash.
    PieceFinished { id: TorrentId, index: PieceIndex },
    /// A piece failed verification and will be re-downloaded.
    PieceHashFailed { id: TorrentId, index: PieceIndex },
    /// A peer connection ended with an error.
    PeerError {
        id: TorrentId,
        addr: SocketAddr,
        error: PeerError,
    },
    /// A peer was banned for protocol violation or data corruption.
    PeerBanned { id: TorrentId, ip: IpAddr },
    /// A seed-mode torrent failed a lazy check and downgraded to normal
    /// downloading.
    SeedModeDowngraded { id: TorrentId, index: PieceIndex },
    /// The result of a file check sweep.
    FilesChecked { id: TorrentId, num_valid: usize },
    /// Requested resume data is ready.
    ResumeDataReady {
        id: TorrentId,
        resume_data: ResumeData,
    },
    /// Storage finished moving (or failed to).
    StorageMoved {
        id: TorrentId,
        result: Result<std::path::PathBuf, String>,
    },
    /// The torrent's files were deleted (or not).
    FilesDeleted {
        id: TorrentId,
        result: Result<(), String>,
    },
}

impl Alert {
    /// The category the alert belongs to, for delivery filtering.
    pub fn category(&self) -> AlertCategory {
        match self {
            Self::TorrentAdded { .. }
            | Self::TorrentComplete { .. }
            | Self::FilesChecked { .. }
            | Self::ResumeDataReady { .. } => AlertCategory::STATUS,
            Self::TorrentError { .. } => AlertCategory::ERROR,
            Self::PieceFinished { .. }
            | Self::PieceHashFailed { .. }
            | Self::SeedModeDowngraded { .. } => {
                AlertCategory::PIECE_PROGRESS
            }
            Self::PeerError { .. } | Self::PeerBanned { .. } => {
                AlertCategory::PEER
            }
            Self::StorageMoved { .. } | Self::FilesDeleted { .. } => {
                AlertCategory::STORAGE
            }
        }
    }

    /// A short static name of the alert kind.
    pub fn what(&self) -> &'static str {
        match self {
            Self::TorrentAdded { .. } => "torrent_added",
            Self::TorrentComplete { .. } => "torrent_complete",
            Self::TorrentError { .. } => "torrent_error",
            Self::PieceFinished { .. } => "piece_finished",
            Self::PieceHashFailed { .. } => "piece_hash_failed",
            Self::PeerError { .. } => "peer_error",
            Self::PeerBanned { .. } => "peer_banned",
            Self::SeedModeDowngraded { .. } => "seed_mode_downgraded",
            Self::FilesChecked { .. } => "files_checked",
            Self::ResumeDataReady { .. } => "resume_data_ready",
            Self::StorageMoved { .. } => "storage_moved",
            Self::FilesDeleted { .. } => "files_deleted",
        }
    }

    /// A human readable one-line description.
    pub fn message(&self) -> String {
        match self {
            Self::TorrentAdded { id } => format!("torrent {} added", id),
            Self::TorrentComplete { id } => {
                format!("torrent {} complete", id)
            }
            Self::TorrentError { id, error } => {
                format!("torrent {} error: {}", id, error)
            }
            Self::PieceFinished { id, index } => {
                format!("torrent {} piece {} finished", id, index)
            }
            Self::PieceHashFailed { id, index } => {
                format!("torrent {} piece {} failed its hash", id, index)
            }
            Self::PeerError { id, addr, error } => {
                format!("torrent {} peer {} error: {}", id, addr, error)
            }
            Self::PeerBanned { id, ip } => {
                format!("torrent {} banned peer {}", id, ip)
            }
            Self::SeedModeDowngraded { id, index } => format!(
                "torrent {} left seed mode after piece {} failed",
                id, index
            ),
            Self::FilesChecked { id, num_valid } => format!(
                "torrent {} checked: {} valid piece(s)",
                id, num_valid
            ),
            Self::ResumeDataReady { id, .. } => {
                format!("torrent {} resume data ready", id)
            }
            Self::StorageMoved { id, result } => match result {
                Ok(path) => format!(
                    "torrent {} storage moved to {}",
                    id,
                    path.display()
                ),
                Err(e) => {
                    format!("torrent {} storage move failed: {}", id, e)
                }
            },
            Self::FilesDeleted { id, result } => match result {
                Ok(()) => format!("torrent {} files deleted", id),
                Err(e) => {
                    format!("torrent {} file deletion failed: {}", id, e)
                }
            },
        }
    }
}
