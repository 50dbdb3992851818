// needed by the `select!` macro reaching the default recursion limit
#![recursion_limit = "256"]

#[macro_use]
extern crate serde_derive;

pub mod alert;
mod bencode;
pub mod conf;
mod counter;
mod disk;
mod download;
pub mod engine;
pub mod error;
mod merkle;
pub mod metainfo;
mod peer;
mod piece_picker;
pub mod resume;
mod storage_info;
mod torrent;

use bitvec::prelude::{BitVec, Msb0};

pub use piece_picker::{
    Priority, PRIO_DEFAULT, PRIO_DONT_DOWNLOAD, PRIO_MAX, PRIO_TIME_CRITICAL,
};
pub use storage_info::{FileAttributes, FileInfo};

/// The type of a piece's index.
///
/// On the wire all integers are sent as 4-byte big endian integers, but in the
/// source code we use `usize` to be consistent with other index types in Rust.
pub type PieceIndex = usize;

/// The type of a file's index.
pub type FileIndex = usize;

/// Each torrent gets a randomly assigned ID that is unique within the
/// application.
pub type TorrentId = u32;

/// A dense handle identifying a peer within its torrent.
///
/// Peers, torrents, and the engine never hold owning pointers to each other;
/// a peer is referred to by this index and a stale key simply resolves to
/// nothing.
pub type PeerKey = u32;

/// The peer ID is an arbitrary 20 byte string.
///
/// Guidelines for choosing a peer ID: http://bittorrent.org/beps/bep_0020.html.
pub type PeerId = [u8; 20];

/// A SHA-1 hash digest, 20 bytes long. Used for v1 piece hashes and the v1
/// info hash.
pub type Sha1Hash = [u8; 20];

/// A SHA-256 hash digest, 32 bytes long. Used for v2 merkle nodes and the v2
/// info hash.
pub type Sha256Hash = [u8; 32];

/// The bitfield represents the piece availability of a peer.
///
/// It is a compact bool vector of most significant bits to least significants
/// bits, that is, where the first highest bit represents the first piece, the
/// second highest element the second piece, and so on (e.g. `0b1100_0001` would
/// mean that we have pieces 0, 1, and 7). A truthy boolean value of a piece's
/// position in this vector means that the peer has the piece, while a falsy
/// value means it doesn't have the piece.
pub type Bitfield = BitVec<Msb0, u8>;

/// The identity of a torrent: its v1 (SHA-1) and/or v2 (SHA-256) info hash.
///
/// At least one of the two is always present. Two info hashes are considered
/// the same torrent if they share at least one present digest; because of
/// that partial-match rule the type deliberately implements neither `Hash`
/// nor `Ord`.
#[derive(Clone, Copy, Debug, Default)]
pub struct InfoHash {
    pub v1: Option<Sha1Hash>,
    pub v2: Option<Sha256Hash>,
}

impl InfoHash {
    pub fn new_v1(v1: Sha1Hash) -> Self {
        Self {
            v1: Some(v1),
            v2: None,
        }
    }

    pub fn new_v2(v2: Sha256Hash) -> Self {
        Self {
            v1: None,
            v2: Some(v2),
        }
    }

    /// Returns true if neither digest is present. Such a value is invalid and
    /// only produced by `Default`, before a magnet or metainfo is parsed.
    pub fn is_empty(&self) -> bool {
        self.v1.is_none() && self.v2.is_none()
    }

    /// The 20 bytes that go in the wire handshake: the v1 hash, or the first
    /// 20 bytes of the v2 hash (the truncated hash, as per BEP 52).
    pub fn wire_hash(&self) -> Option<Sha1Hash> {
        if let Some(v1) = self.v1 {
            Some(v1)
        } else {
            self.v2.map(|v2| {
                let mut truncated = [0; 20];
                truncated.copy_from_slice(&v2[..20]);
                truncated
            })
        }
    }

    /// Returns true if the given wire-handshake hash identifies this torrent,
    /// matching either the v1 hash or the truncated v2 hash.
    pub fn matches_wire_hash(&self, hash: &Sha1Hash) -> bool {
        if self.v1.as_ref() == Some(hash) {
            return true;
        }
        if let Some(v2) = &self.v2 {
            return v2[..20] == hash[..];
        }
        false
    }
}

/// Equality on at least one shared present digest.
impl PartialEq for InfoHash {
    fn eq(&self, other: &Self) -> bool {
        match (&self.v1, &other.v1) {
            (Some(a), Some(b)) if a == b => return true,
            _ => {}
        }
        matches!((&self.v2, &other.v2), (Some(a), Some(b)) if a == b)
    }
}

impl std::fmt::Display for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if let Some(v1) = &self.v1 {
            write!(f, "{}", hex::encode(v1))?;
        }
        if let Some(v2) = &self.v2 {
            if self.v1.is_some() {
                write!(f, "/")?;
            }
            write!(f, "{}", hex::encode(v2))?;
        }
        Ok(())
    }
}

/// This is the only block length we're dealing with (except for possibly the
/// last block). It is the widely used and accepted 16 KiB.
pub(crate) const BLOCK_LEN: u32 = 0x4000;

/// A block is a fixed size chunk of a piece, which in turn is a fixed size
/// chunk of a torrent. Downloading torrents happen at this block level
/// granularity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct BlockInfo {
    /// The index of the piece of which this is a block.
    pub piece_index: PieceIndex,
    /// The zero-based byte offset into the piece.
    pub offset: u32,
    /// The block's length in bytes. Always 16 KiB (0x4000 bytes), except for
    /// the last block in the torrent.
    pub len: u32,
}

impl BlockInfo {
    /// Returns the index of the block within its piece, assuming the default
    /// block length of 16 KiB.
    pub fn index_in_piece(&self) -> usize {
        // we need to use "lower than or equal" as this may be the last block
        // in which case it may be shorter than the default block length
        debug_assert!(self.len <= BLOCK_LEN);
        debug_assert!(self.len > 0);
        (self.offset / BLOCK_LEN) as usize
    }
}

/// Returns the length of the block at the index in piece.
///
/// If the piece is not a multiple of the default block length, the returned
/// value is smaller.
///
/// # Panics
///
/// Panics if the index multiplied by the default block length would exceed the
/// piece length.
pub(crate) fn block_len(piece_len: u32, index: usize) -> u32 {
    let index = index as u32;
    let block_offset = index * BLOCK_LEN;
    assert!(piece_len > block_offset);
    std::cmp::min(piece_len - block_offset, BLOCK_LEN)
}

/// Returns the number of blocks in a piece of the given length.
pub(crate) fn block_count(piece_len: u32) -> usize {
    // all but the last piece are a multiple of the block length, but the
    // last piece may be shorter so we need to account for this by rounding
    // up before dividing to get the number of blocks in piece
    (piece_len as usize + (BLOCK_LEN as usize - 1)) / BLOCK_LEN as usize
}
