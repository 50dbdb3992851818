//! Resume data: a bencoded snapshot of a torrent's progress that lets a
//! restarted engine skip re-checking files.
//!
//! The dictionary holds the torrent's identity, the have bitfield, piece
//! and file priorities, known peer addresses, and, for v2 torrents, the
//! sparse merkle trees. File sizes and modification times are captured at
//! save time; divergence at load time forces a full re-check.

use std::{
    convert::TryInto,
    net::{IpAddr, SocketAddr},
    time::UNIX_EPOCH,
};

use serde_bytes::ByteBuf;

use crate::{
    error::ResumeError,
    storage_info::StorageInfo,
    Bitfield, FileIndex, InfoHash, Sha256Hash,
};

/// A torrent's saved progress.
#[derive(Debug)]
pub struct ResumeData {
    pub info_hash: InfoHash,
    /// The pieces we had, hash checked, at save time.
    pub pieces: Bitfield,
    pub piece_priorities: Vec<u8>,
    pub file_priorities: Vec<u8>,
    /// Peer addresses known at save time, for reconnecting.
    pub peers: Vec<SocketAddr>,
    /// The sparse merkle trees of v2 files: `(file index, (hashes, mask))`.
    pub(crate) trees: Vec<(FileIndex, (Vec<Sha256Hash>, Vec<bool>))>,
    /// `(size, mtime)` of each file at save time; pad files record zeros.
    pub file_sizes: Vec<(u64, i64)>,
}

/// The serde view of the bencoded dictionary. Fields are declared in
/// sorted key order, which is the order serde_bencode emits them in and
/// the order bencode wants.
#[derive(Debug, Serialize, Deserialize)]
struct RawResume {
    #[serde(rename = "file priorities")]
    file_priorities: ByteBuf,
    #[serde(rename = "file sizes", default)]
    file_sizes: Vec<(u64, i64)>,
    #[serde(
        rename = "info-hash",
        skip_serializing_if = "Option::is_none",
        default
    )]
    info_hash: Option<ByteBuf>,
    #[serde(
        rename = "info-hash2",
        skip_serializing_if = "Option::is_none",
        default
    )]
    info_hash2: Option<ByteBuf>,
    /// Compact 6-byte IPv4 `address:port` entries.
    #[serde(default)]
    peers: ByteBuf,
    /// Compact 18-byte IPv6 entries.
    #[serde(default)]
    peers6: ByteBuf,
    #[serde(rename = "piece priorities")]
    piece_priorities: ByteBuf,
    pieces: ByteBuf,
    #[serde(default)]
    trees: Vec<RawTree>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawTree {
    file: usize,
    hashes: ByteBuf,
    /// One byte per node; nonzero means the node's hash is present in
    /// `hashes`.
    mask: ByteBuf,
}

impl ResumeData {
    /// Captures a torrent's progress. File sizes and mtimes are read off
    /// disk at this point.
    pub(crate) fn new(
        info_hash: InfoHash,
        pieces: Bitfield,
        piece_priorities: Vec<u8>,
        file_priorities: Vec<u8>,
        peers: Vec<SocketAddr>,
        trees: Vec<(FileIndex, (Vec<Sha256Hash>, Vec<bool>))>,
        storage: &StorageInfo,
    ) -> Self {
        let file_sizes = storage
            .files
            .iter()
            .map(|file| {
                if file.attributes.pad {
                    return (0, 0);
                }
                let path = storage.download_dir.join(&file.path);
                match std::fs::metadata(&path) {
                    Ok(meta) => {
                        let mtime = meta
                            .modified()
                            .ok()
                            .and_then(|t| {
                                t.duration_since(UNIX_EPOCH).ok()
                            })
                            .map(|d| d.as_secs() as i64)
                            .unwrap_or(0);
                        (meta.len(), mtime)
                    }
                    Err(_) => (0, 0),
                }
            })
            .collect();

        Self {
            info_hash,
            pieces,
            piece_priorities,
            file_priorities,
            peers,
            trees,
            file_sizes,
        }
    }

    /// Serializes the resume data into its bencoded form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut peers = Vec::new();
        let mut peers6 = Vec::new();
        for addr in &self.peers {
            match addr.ip() {
                IpAddr::V4(ip) => {
                    peers.extend_from_slice(&ip.octets());
                    peers.extend_from_slice(&addr.port().to_be_bytes());
                }
                IpAddr::V6(ip) => {
                    peers6.extend_from_slice(&ip.octets());
                    peers6.extend_from_slice(&addr.port().to_be_bytes());
                }
            }
        }

        let trees = self
            .trees
            .iter()
            .map(|(file, (hashes, mask))| {
                let mut hash_bytes = Vec::with_capacity(hashes.len() * 32);
                for hash in hashes {
                    hash_bytes.extend_from_slice(hash);
                }
                RawTree {
                    file: *file,
                    hashes: ByteBuf::from(hash_bytes),
                    mask: ByteBuf::from(
                        mask.iter()
                            .map(|present| *present as u8)
                            .collect::<Vec<u8>>(),
                    ),
                }
            })
            .collect();

        let raw = RawResume {
            info_hash: self.info_hash.v1.map(|h| ByteBuf::from(h.to_vec())),
            info_hash2: self
                .info_hash
                .v2
                .map(|h| ByteBuf::from(h.to_vec())),
            pieces: ByteBuf::from(self.pieces.as_slice().to_vec()),
            piece_priorities: ByteBuf::from(self.piece_priorities.clone()),
            file_priorities: ByteBuf::from(self.file_priorities.clone()),
            peers: ByteBuf::from(peers),
            peers6: ByteBuf::from(peers6),
            trees,
            file_sizes: self.file_sizes.clone(),
        };
        serde_bencode::to_bytes(&raw).expect("resume data must serialize")
    }

    /// Parses resume data. The piece count is needed to size the have
    /// bitfield (its wire form is padded to whole bytes).
    pub fn from_bytes(
        buf: &[u8],
        piece_count: usize,
    ) -> Result<Self, ResumeError> {
        let raw: RawResume = serde_bencode::from_bytes(buf)
            .map_err(|_| ResumeError::ParseFailed)?;

        let info_hash = InfoHash {
            v1: match raw.info_hash {
                Some(bytes) if bytes.len() == 20 => {
                    let mut hash = [0; 20];
                    hash.copy_from_slice(&bytes);
                    Some(hash)
                }
                Some(_) => return Err(ResumeError::ParseFailed),
                None => None,
            },
            v2: match raw.info_hash2 {
                Some(bytes) if bytes.len() == 32 => {
                    let mut hash = [0; 32];
                    hash.copy_from_slice(&bytes);
                    Some(hash)
                }
                Some(_) => return Err(ResumeError::ParseFailed),
                None => None,
            },
        };
        if info_hash.is_empty() {
            return Err(ResumeError::ParseFailed);
        }

        let mut pieces = Bitfield::from_vec(raw.pieces.into_vec());
        if pieces.len() < piece_count {
            return Err(ResumeError::ParseFailed);
        }
        pieces.resize(piece_count, false);

        let mut peers = Vec::new();
        for chunk in raw.peers.chunks(6) {
            if chunk.len() != 6 {
                return Err(ResumeError::ParseFailed);
            }
            let ip: [u8; 4] = chunk[..4].try_into().expect("length checked");
            let port = u16::from_be_bytes(
                chunk[4..].try_into().expect("length checked"),
            );
            peers.push(SocketAddr::from((ip, port)));
        }
        for chunk in raw.peers6.chunks(18) {
            if chunk.len() != 18 {
                return Err(ResumeError::ParseFailed);
            }
            let ip: [u8; 16] =
                chunk[..16].try_into().expect("length checked");
            let port = u16::from_be_bytes(
                chunk[16..].try_into().expect("length checked"),
            );
            peers.push(SocketAddr::from((ip, port)));
        }

        let mut trees = Vec::with_capacity(raw.trees.len());
        for tree in raw.trees {
            if tree.hashes.len() % 32 != 0 {
                return Err(ResumeError::ParseFailed);
            }
            let hashes: Vec<Sha256Hash> = tree
                .hashes
                .chunks(32)
                .map(|chunk| {
                    let mut hash = [0; 32];
                    hash.copy_from_slice(chunk);
                    hash
                })
                .collect();
            let mask: Vec<bool> =
                tree.mask.iter().map(|b| *b != 0).collect();
            if mask.iter().filter(|b| **b).count() != hashes.len() {
                return Err(ResumeError::ParseFailed);
            }
            trees.push((tree.file, (hashes, mask)));
        }

        Ok(Self {
            info_hash,
            pieces,
            piece_priorities: raw.piece_priorities.into_vec(),
            file_priorities: raw.file_priorities.into_vec(),
            peers,
            trees,
            file_sizes: raw.file_sizes,
        })
    }

    /// Checks the resume data against a torrent and its files on disk.
    /// Any divergence means the saved progress can't be trusted and a full
    /// re-check is needed.
    pub(crate) fn validate(
        &self,
        info_hash: &InfoHash,
        storage: &StorageInfo,
        check_mtimes: bool,
    ) -> Result<(), ResumeError> {
        if self.info_hash != *info_hash {
            return Err(ResumeError::MismatchingInfoHash);
        }
        for (file_index, file) in storage.files.iter().enumerate() {
            if file.attributes.pad {
                continue;
            }
            let (saved_size, saved_mtime) = match self
                .file_sizes
                .get(file_index)
            {
                Some(entry) => *entry,
                None => continue,
            };
            if saved_size == 0 {
                // the file didn't exist at save time; nothing to diverge
                continue;
            }
            let path = storage.download_dir.join(&file.path);
            let meta = match std::fs::metadata(&path) {
                Ok(meta) => meta,
                Err(_) => {
                    return Err(ResumeError::MismatchingFileSize(
                        file_index,
                    ))
                }
            };
            if meta.len() != saved_size {
                return Err(ResumeError::MismatchingFileSize(file_index));
            }
            if check_mtimes && saved_mtime != 0 {
                let mtime = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0);
                if mtime != saved_mtime {
                    return Err(ResumeError::MismatchingFileTimestamp(
                        file_index,
                    ));
                }
            }
        }
        Ok(())
    }
}
