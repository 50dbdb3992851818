//! The error taxonomy of the engine.
//!
//! Each failure domain gets its own enum; they all convert into the
//! crate-level [`Error`]. Parse failures are plain values, never panics, so
//! that malformed input from the network or from a .torrent file can't take
//! the process down.

use std::fmt;

use crate::{FileIndex, PieceIndex, TorrentId};

/// The crate-wide result type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The top level error type, aggregating all failure domains.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("torrent metainfo error: {0}")]
    Torrent(#[from] TorrentError),
    #[error("magnet URI error: {0}")]
    Magnet(#[from] MagnetError),
    #[error("peer error: {0}")]
    Peer(#[from] PeerError),
    #[error("disk error: {0}")]
    Disk(#[from] DiskError),
    #[error("resume data error: {0}")]
    Resume(#[from] ResumeError),
    #[error("bencode error: {0}")]
    Bencode(#[from] BencodeError),
    #[error("invalid torrent id {0}")]
    InvalidTorrentId(TorrentId),
    #[error("invalid piece index {0}")]
    InvalidPieceIndex(PieceIndex),
    #[error("engine is shutting down")]
    EngineShutdown,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// An internal channel was closed. This can only happen during shutdown.
    #[error("internal channel error")]
    Channel,
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::Channel
    }
}

/// Errors detected while parsing and validating torrent metainfo.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum TorrentError {
    #[error("torrent is missing the piece length field")]
    MissingPieceLength,
    #[error("torrent is missing the name field")]
    MissingName,
    #[error("torrent is missing the info dictionary")]
    MissingInfo,
    #[error("torrent file length is invalid")]
    InvalidLength,
    #[error("torrent name is invalid")]
    InvalidName,
    #[error("torrent piece hashes are invalid")]
    InvalidHashes,
    #[error("torrent piece layer does not match its file root")]
    InvalidPieceLayer,
    #[error("torrent v1 and v2 file layouts are inconsistent")]
    InconsistentFiles,
    #[error("torrent file failed to parse")]
    ParseFailed,
    #[error("torrent has too many pieces")]
    TooManyPieces,
    #[error("torrent has no files")]
    NoFiles,
    #[error("torrent pad file is invalid")]
    InvalidPadFile,
    #[error("torrent v2 file is missing its pieces root")]
    MissingPiecesRoot,
    #[error("torrent has too many colliding file names")]
    TooManyDuplicateFilenames,
    #[error("torrent piece length must be a power of two of at least 16 KiB")]
    InvalidPieceLength,
    #[error("torrent metadata is not yet available")]
    MetadataPending,
}

/// Errors parsing a magnet URI.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum MagnetError {
    #[error("not a magnet URI")]
    InvalidScheme,
    #[error("magnet URI has no valid exact topic (xt)")]
    MissingTopic,
    #[error("magnet URI exact topic is invalid")]
    InvalidTopic,
    #[error("magnet URI file selection (so) is invalid")]
    InvalidFileSelection,
    #[error("magnet URI peer address (x.pe) is invalid")]
    InvalidPeerAddress,
    #[error("magnet URI failed to parse: {0}")]
    Url(String),
}

/// The reasons a peer connection is torn down.
///
/// Protocol violations carry enough context for the engine to decide whether
/// to blacklist the remote endpoint.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum PeerError {
    #[error("peer handshake contained an invalid info hash")]
    InvalidInfoHash,
    #[error("peer handshake info hash matches no active torrent")]
    UnknownTorrent,
    #[error("connected to ourselves")]
    SelfConnection,
    #[error("peer sent a second bitfield")]
    DuplicateBitfield,
    #[error("peer sent have-all or have-none outside the bitfield window")]
    InvalidHaveAll,
    #[error("peer sent a reject for a request we never made")]
    InvalidReject,
    #[error("peer sent an invalid or malformed request")]
    InvalidRequest,
    #[error("peer sent a block we never requested")]
    InvalidPiece,
    #[error("peer sent an invalid cancel")]
    InvalidCancel,
    #[error("peer sent an invalid message")]
    InvalidMessage,
    #[error("peer is banned")]
    Banned,
    #[error("peer handshake timed out")]
    HandshakeTimeout,
    #[error("peer went silent past the inactivity limit")]
    InactivityTimeout,
    #[error("peer connection error: {0}")]
    Io(String),
}

impl From<std::io::Error> for PeerError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// The disk operation during which an IO error was hit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiskOp {
    FileOpen,
    FileRead,
    FileWrite,
    FileRename,
    FileRemove,
    DirCreate,
    Symlink,
}

impl fmt::Display for DiskOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::FileOpen => "file_open",
            Self::FileRead => "file_read",
            Self::FileWrite => "file_write",
            Self::FileRename => "file_rename",
            Self::FileRemove => "file_remove",
            Self::DirCreate => "dir_create",
            Self::Symlink => "symlink",
        };
        f.write_str(s)
    }
}

/// Errors produced by the disk task.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DiskError {
    #[error("no space left on device")]
    NoSpaceOnDevice,
    #[error("file not found")]
    FileNotFound,
    #[error("permission denied")]
    PermissionDenied,
    /// An unrecoverable error; the torrent is paused when this surfaces.
    #[error("fatal disk error during {op} on file {file_index:?}: {source}")]
    Fatal {
        op: DiskOp,
        file_index: Option<FileIndex>,
        source: std::io::Error,
    },
    #[error("torrent already allocated on disk")]
    AlreadyExists,
    #[error("invalid block {piece_index}:{offset}")]
    InvalidBlock { piece_index: PieceIndex, offset: u32 },
    #[error("invalid piece index {0}")]
    InvalidPieceIndex(PieceIndex),
    #[error("disk task channel closed")]
    Channel,
}

impl DiskError {
    /// Maps a raw IO error to the disk error taxonomy, attributing it to the
    /// operation and file it occurred on.
    pub(crate) fn from_io(
        e: std::io::Error,
        op: DiskOp,
        file_index: Option<FileIndex>,
    ) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::NotFound => Self::FileNotFound,
            ErrorKind::PermissionDenied => Self::PermissionDenied,
            _ if e.raw_os_error() == Some(nix::errno::Errno::ENOSPC as i32) => {
                Self::NoSpaceOnDevice
            }
            _ => Self::Fatal {
                op,
                file_index,
                source: e,
            },
        }
    }

    /// Whether the torrent should be paused over this error rather than
    /// retrying the piece.
    pub(crate) fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. } | Self::PermissionDenied)
    }
}

/// Errors hit while loading resume data.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ResumeError {
    #[error("resume data info hash does not match the torrent")]
    MismatchingInfoHash,
    #[error("file {0} on disk has a different size than the resume data")]
    MismatchingFileSize(FileIndex),
    #[error("file {0} on disk is newer than the resume data")]
    MismatchingFileTimestamp(FileIndex),
    #[error("resume data failed to parse")]
    ParseFailed,
}

/// Errors from the raw bencode scanner.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum BencodeError {
    #[error("expected a digit at offset {0}")]
    ExpectedDigit(usize),
    #[error("expected ':' at offset {0}")]
    ExpectedColon(usize),
    #[error("maximum nesting depth exceeded at offset {0}")]
    DepthExceeded(usize),
    #[error("integer overflow at offset {0}")]
    Overflow(usize),
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("trailing bytes after the root value")]
    TrailingBytes,
    #[error("unexpected token at offset {0}")]
    UnexpectedToken(usize),
}
