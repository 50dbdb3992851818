//! Parsing and validation of .torrent metainfo: BEP 3 (v1), BEP 52 (v2)
//! and hybrid torrents.
//!
//! The serde-friendly parts of the dictionary go through `serde_bencode`;
//! the raw `info` span (the info hashes are defined over the original
//! bytes) and the v2 `file tree` (arbitrary byte-string keys) go through
//! the hand-rolled scanner in `crate::bencode`.

pub mod magnet;
pub(crate) mod sanitize;

use std::{collections::HashMap, path::PathBuf};

use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};
use sha2::Sha256;

use crate::{
    bencode::{self, Value},
    error::TorrentError,
    merkle::MerkleTree,
    storage_info::{FileAttributes, FileInfo},
    InfoHash, Sha256Hash, BLOCK_LEN,
};
use sanitize::{disambiguate, sanitize_path_component, TargetOs};

/// An upper bound on the piece count, guarding against absurd metainfo
/// making us allocate unbounded picker and hash state.
const MAX_PIECE_COUNT: usize = 1 << 21;

/// How many times a colliding file name is disambiguated with a counter
/// before the torrent is rejected.
const MAX_DUPLICATE_FILENAMES: usize = 500;

/// The result of parsing and validating a .torrent buffer.
#[derive(Debug)]
pub struct Metainfo {
    /// The sanitized torrent name.
    pub name: String,
    /// The torrent's identity; v1, v2, or both for hybrids.
    pub info_hash: InfoHash,
    /// The nominal piece length.
    pub piece_len: u32,
    /// The concatenation of 20-byte SHA-1 piece hashes (empty for v2-only
    /// torrents).
    pub piece_hashes: Vec<u8>,
    /// The flattened, ordered file list, pad files included, paths
    /// sanitized. For v2-only torrents the pad entries are synthesized to
    /// express the per-file piece alignment.
    pub files: Vec<FileInfo>,
    /// Whether the torrent has multiple top level files (downloads go into
    /// a directory named after the torrent).
    archive: bool,
    /// Per-file merkle trees for v2 torrents, indexed like `files` (`None`
    /// for pad entries, empty files, and v1-only torrents). The piece
    /// layers of the metainfo are already imported and verified.
    pub(crate) trees: Vec<Option<MerkleTree>>,
    /// The raw bytes of the info dictionary, kept for re-encoding and for
    /// serving metadata to peers.
    pub(crate) info_bytes: Vec<u8>,
    /// Tracker URLs: the flattened announce-list, or the single announce.
    pub trackers: Vec<String>,
    /// Web seed (BEP 19) URLs.
    pub url_list: Vec<String>,
    pub creation_date: Option<i64>,
    pub comment: Option<String>,
    pub created_by: Option<String>,
}

/// The serde view of the parts of the metainfo with fixed shapes.
#[derive(Debug, Deserialize)]
struct RawMetainfo {
    info: Option<RawInfo>,
    announce: Option<String>,
    #[serde(rename = "announce-list")]
    announce_list: Option<Vec<Vec<String>>>,
    #[serde(rename = "creation date")]
    creation_date: Option<i64>,
    comment: Option<ByteBuf>,
    #[serde(rename = "created by")]
    created_by: Option<ByteBuf>,
}

#[derive(Debug, Deserialize)]
struct RawInfo {
    name: Option<ByteBuf>,
    #[serde(rename = "piece length")]
    piece_length: Option<i64>,
    pieces: Option<ByteBuf>,
    length: Option<i64>,
    files: Option<Vec<RawFile>>,
    #[serde(rename = "meta version")]
    meta_version: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RawFile {
    path: Vec<ByteBuf>,
    length: i64,
    attr: Option<ByteBuf>,
    #[serde(rename = "symlink path")]
    symlink_path: Option<Vec<ByteBuf>>,
}

/// A file parsed out of the v2 `file tree`, in metainfo order.
#[derive(Debug)]
struct TreeFile {
    path_components: Vec<Vec<u8>>,
    length: u64,
    pieces_root: Option<Sha256Hash>,
    attributes: FileAttributes,
    symlink_path: Option<Vec<Vec<u8>>>,
}

impl Metainfo {
    /// Parses and validates a .torrent buffer.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, TorrentError> {
        let raw: RawMetainfo = serde_bencode::from_bytes(buf)
            .map_err(|_| TorrentError::ParseFailed)?;
        let info = raw.info.ok_or(TorrentError::MissingInfo)?;

        let info_span = bencode::info_span(buf)
            .map_err(|_| TorrentError::ParseFailed)?
            .ok_or(TorrentError::MissingInfo)?;
        let info_bytes = buf[info_span].to_vec();

        // the scanner view of the same buffer, for the v2 parts
        let root = bencode::decode(buf).map_err(|_| TorrentError::ParseFailed)?;
        let root = root.as_dict().ok_or(TorrentError::ParseFailed)?;
        let scanned_info = root
            .get(b"info")
            .and_then(Value::as_dict)
            .ok_or(TorrentError::MissingInfo)?;

        let piece_length =
            info.piece_length.ok_or(TorrentError::MissingPieceLength)?;
        if piece_length < BLOCK_LEN as i64 || piece_length > u32::MAX as i64 {
            return Err(TorrentError::InvalidPieceLength);
        }
        let piece_len = piece_length as u32;

        let is_v2 = info.meta_version == Some(2);
        if is_v2 && !piece_len.is_power_of_two() {
            return Err(TorrentError::InvalidPieceLength);
        }
        let has_v1 = info.pieces.is_some();
        if !has_v1 && !is_v2 {
            return Err(TorrentError::InvalidHashes);
        }

        // the info hashes exist for the metadata versions actually present
        let v1_hash = if has_v1 {
            let digest = Sha1::digest(&info_bytes);
            let mut hash = [0; 20];
            hash.copy_from_slice(&digest);
            Some(hash)
        } else {
            None
        };
        let v2_hash = if is_v2 {
            let digest = Sha256::digest(&info_bytes);
            let mut hash = [0; 32];
            hash.copy_from_slice(&digest);
            Some(hash)
        } else {
            None
        };
        let info_hash = InfoHash {
            v1: v1_hash,
            v2: v2_hash,
        };

        // name: sanitized; if nothing survives, fall back to the info hash
        // in hex
        let raw_name = info.name.as_ref().ok_or(TorrentError::MissingName)?;
        let name = match sanitize_path_component(raw_name, TargetOs::host()) {
            Some(name) => name,
            None => match (&info_hash.v1, &info_hash.v2) {
                (Some(v1), _) => hex::encode(v1),
                (_, Some(v2)) => hex::encode(v2),
                _ => return Err(TorrentError::InvalidName),
            },
        };

        // the v1 file list, if present
        let v1_files = if has_v1 {
            Some(Self::parse_v1_files(&info, &name, piece_len)?)
        } else {
            None
        };

        // the v2 file tree, if present
        let v2_files = if is_v2 {
            let tree = scanned_info
                .get(b"file tree")
                .and_then(Value::as_dict)
                .ok_or(TorrentError::ParseFailed)?;
            let mut tree_files = Vec::new();
            Self::walk_file_tree(tree, &mut Vec::new(), &mut tree_files, 0)?;
            if tree_files.is_empty() {
                return Err(TorrentError::NoFiles);
            }
            Some(tree_files)
        } else {
            None
        };

        // build the canonical flattened layout
        let (files, archive) = match (v1_files, v2_files) {
            (Some(v1), Some(v2)) => {
                let files = Self::check_hybrid_consistency(&v1, &v2)?;
                (files, info.files.is_some())
            }
            (Some(v1), None) => (v1, info.files.is_some()),
            (None, Some(v2)) => {
                let archive =
                    v2.len() > 1 || v2[0].path_components.len() > 1;
                (Self::layout_v2_files(&v2, piece_len)?, archive)
            }
            (None, None) => return Err(TorrentError::InvalidHashes),
        };
        if !files.iter().any(|f| !f.attributes.pad) {
            return Err(TorrentError::NoFiles);
        }

        let download_len: u64 = files.iter().map(|f| f.len).sum();
        let piece_count =
            ((download_len + piece_len as u64 - 1) / piece_len as u64) as usize;
        if piece_count == 0 {
            return Err(TorrentError::NoFiles);
        }
        if piece_count > MAX_PIECE_COUNT {
            return Err(TorrentError::TooManyPieces);
        }

        // v1 piece hashes must cover exactly the pieces of the layout
        let piece_hashes = match info.pieces {
            Some(pieces) => {
                if pieces.len() % 20 != 0 || pieces.len() / 20 != piece_count {
                    return Err(TorrentError::InvalidHashes);
                }
                pieces.into_vec()
            }
            None => Vec::new(),
        };

        // v2: build a merkle tree per file and import the piece layers
        let trees = if is_v2 {
            let piece_layers = root.get(b"piece layers").and_then(Value::as_dict);
            Self::build_trees(&files, piece_len, piece_layers)?
        } else {
            files.iter().map(|_| None).collect()
        };

        // trackers: flattened announce-list, or the single announce URL
        let mut trackers = Vec::new();
        if let Some(tiers) = raw.announce_list {
            trackers.extend(tiers.into_iter().flatten());
        } else if let Some(announce) = raw.announce {
            trackers.push(announce);
        }

        // url-list may be a single string or a list of strings
        let url_list = match root.get(b"url-list") {
            Some(Value::Bytes(url)) => {
                vec![String::from_utf8_lossy(url).into_owned()]
            }
            Some(Value::List(urls)) => urls
                .iter()
                .filter_map(Value::as_bytes)
                .map(|url| String::from_utf8_lossy(url).into_owned())
                .collect(),
            _ => Vec::new(),
        };

        Ok(Self {
            name,
            info_hash,
            piece_len,
            piece_hashes,
            files,
            archive,
            trees,
            info_bytes,
            trackers,
            url_list,
            creation_date: raw.creation_date,
            comment: raw
                .comment
                .map(|c| String::from_utf8_lossy(&c).into_owned()),
            created_by: raw
                .created_by
                .map(|c| String::from_utf8_lossy(&c).into_owned()),
        })
    }

    /// The number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        let len = self.download_len();
        ((len + self.piece_len as u64 - 1) / self.piece_len as u64) as usize
    }

    /// The total length of the torrent, pad files included.
    pub fn download_len(&self) -> u64 {
        self.files.iter().map(|f| f.len).sum()
    }

    /// Whether the download is a directory rather than a single file.
    pub fn is_archive(&self) -> bool {
        self.archive
    }

    /// Whether the torrent carries v2 metadata.
    pub fn is_v2(&self) -> bool {
        self.info_hash.v2.is_some()
    }

    /// The expected SHA-1 of a piece (v1 and hybrid torrents).
    pub(crate) fn piece_hash(&self, index: usize) -> Option<[u8; 20]> {
        let pos = index * 20;
        if pos + 20 > self.piece_hashes.len() {
            return None;
        }
        let mut hash = [0; 20];
        hash.copy_from_slice(&self.piece_hashes[pos..pos + 20]);
        Some(hash)
    }

    /// Re-encodes the metainfo. The info dictionary is emitted byte for
    /// byte as it was read, so the info hash is preserved.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.info_bytes.len() + 256);
        out.push(b'd');
        // keys must be emitted in sorted order
        if let Some(announce) = self.trackers.first() {
            encode_str(&mut out, "announce", announce.as_bytes());
        }
        if let Some(comment) = &self.comment {
            encode_str(&mut out, "comment", comment.as_bytes());
        }
        if let Some(created_by) = &self.created_by {
            encode_str(&mut out, "created by", created_by.as_bytes());
        }
        if let Some(creation_date) = self.creation_date {
            encode_key(&mut out, "creation date");
            out.extend_from_slice(
                format!("i{}e", creation_date).as_bytes(),
            );
        }
        encode_key(&mut out, "info");
        out.extend_from_slice(&self.info_bytes);
        // piece layers, for v2 torrents with multi-piece files
        let layers: Vec<(Sha256Hash, Vec<u8>)> = self
            .trees
            .iter()
            .flatten()
            .filter_map(|tree| {
                if tree.num_pieces() > 1 {
                    let hashes = tree.piece_layer_hashes()?;
                    let mut bytes = Vec::with_capacity(hashes.len() * 32);
                    for hash in hashes {
                        bytes.extend_from_slice(&hash);
                    }
                    Some((*tree.root(), bytes))
                } else {
                    None
                }
            })
            .collect();
        if !layers.is_empty() {
            let mut layers = layers;
            layers.sort_by(|a, b| a.0.cmp(&b.0));
            encode_key(&mut out, "piece layers");
            out.push(b'd');
            for (root, bytes) in layers {
                out.extend_from_slice(b"32:");
                out.extend_from_slice(&root);
                out.extend_from_slice(format!("{}:", bytes.len()).as_bytes());
                out.extend_from_slice(&bytes);
            }
            out.push(b'e');
        }
        if !self.url_list.is_empty() {
            encode_key(&mut out, "url-list");
            out.push(b'l');
            for url in &self.url_list {
                out.extend_from_slice(
                    format!("{}:", url.len()).as_bytes(),
                );
                out.extend_from_slice(url.as_bytes());
            }
            out.push(b'e');
        }
        out.push(b'e');
        out
    }

    /// Builds the flattened v1 file list: either the single `length` or the
    /// `files` list, with sanitized paths and pad validation.
    fn parse_v1_files(
        info: &RawInfo,
        name: &str,
        piece_len: u32,
    ) -> Result<Vec<FileInfo>, TorrentError> {
        match (&info.length, &info.files) {
            (Some(len), None) => {
                if *len < 0 {
                    return Err(TorrentError::InvalidLength);
                }
                Ok(vec![FileInfo {
                    // a single file torrent's one file is named after the
                    // torrent
                    path: PathBuf::from(name),
                    len: *len as u64,
                    torrent_offset: 0,
                    attributes: FileAttributes::default(),
                    symlink_target: None,
                    pieces_root: None,
                }])
            }
            (None, Some(raw_files)) => {
                if raw_files.is_empty() {
                    return Err(TorrentError::NoFiles);
                }
                let mut files = Vec::with_capacity(raw_files.len());
                let mut taken_paths: HashMap<PathBuf, usize> = HashMap::new();
                let mut torrent_offset = 0;
                for raw_file in raw_files {
                    if raw_file.length < 0 {
                        return Err(TorrentError::InvalidLength);
                    }
                    let attributes = raw_file
                        .attr
                        .as_ref()
                        .map(|attr| FileAttributes::from_attr(attr))
                        .unwrap_or_default();
                    let path = if attributes.pad {
                        // pad files are never materialized; their name only
                        // needs to be unique among pads of different sizes
                        PathBuf::from(".pad").join(raw_file.length.to_string())
                    } else {
                        let path = sanitize_path(&raw_file.path)?;
                        claim_path(&mut taken_paths, path)?
                    };
                    let symlink_target = match (&raw_file.symlink_path, attributes.symlink) {
                        (Some(target), true) => Some(sanitize_path(target)?),
                        _ => None,
                    };
                    files.push(FileInfo {
                        path,
                        len: raw_file.length as u64,
                        torrent_offset,
                        attributes,
                        symlink_target,
                        pieces_root: None,
                    });
                    torrent_offset += raw_file.length as u64;

                    // a pad file must land the stream on a piece boundary,
                    // unless it's the (pointless) last file
                    if attributes.pad
                        && torrent_offset % piece_len as u64 != 0
                    {
                        return Err(TorrentError::InvalidPadFile);
                    }
                }
                Ok(files)
            }
            _ => Err(TorrentError::InvalidLength),
        }
    }

    /// Walks the v2 `file tree` recursively, collecting files in metainfo
    /// order.
    fn walk_file_tree(
        dict: &bencode::Dict,
        components: &mut Vec<Vec<u8>>,
        out: &mut Vec<TreeFile>,
        depth: usize,
    ) -> Result<(), TorrentError> {
        if depth > 64 {
            return Err(TorrentError::ParseFailed);
        }
        for (key, value) in &dict.entries {
            let value = value.as_dict().ok_or(TorrentError::ParseFailed)?;
            if key.is_empty() {
                // the empty key holds the file descriptor
                let length = value
                    .get(b"length")
                    .and_then(Value::as_int)
                    .unwrap_or(0);
                if length < 0 {
                    return Err(TorrentError::InvalidLength);
                }
                let pieces_root = match value.get(b"pieces root") {
                    Some(Value::Bytes(root)) if root.len() == 32 => {
                        let mut hash = [0; 32];
                        hash.copy_from_slice(root);
                        Some(hash)
                    }
                    Some(_) => return Err(TorrentError::MissingPiecesRoot),
                    None => None,
                };
                if length > 0 && pieces_root.is_none() {
                    return Err(TorrentError::MissingPiecesRoot);
                }
                let attributes = value
                    .get(b"attr")
                    .and_then(Value::as_bytes)
                    .map(FileAttributes::from_attr)
                    .unwrap_or_default();
                let symlink_path = value
                    .get(b"symlink path")
                    .and_then(Value::as_list)
                    .map(|components| {
                        components
                            .iter()
                            .filter_map(Value::as_bytes)
                            .map(|c| c.to_vec())
                            .collect()
                    });
                out.push(TreeFile {
                    path_components: components.clone(),
                    length: length as u64,
                    pieces_root,
                    attributes,
                    symlink_path,
                });
            } else {
                components.push(key.to_vec());
                Self::walk_file_tree(value, components, out, depth + 1)?;
                components.pop();
            }
        }
        Ok(())
    }

    /// Lays out v2 files: each file starts on a piece boundary, expressed
    /// by synthesizing pad entries for the alignment gaps.
    fn layout_v2_files(
        tree_files: &[TreeFile],
        piece_len: u32,
    ) -> Result<Vec<FileInfo>, TorrentError> {
        let mut files = Vec::with_capacity(tree_files.len());
        let mut taken_paths: HashMap<PathBuf, usize> = HashMap::new();
        let mut torrent_offset: u64 = 0;
        let last_nonempty = tree_files
            .iter()
            .rposition(|f| f.length > 0)
            .unwrap_or(0);
        for (index, tree_file) in tree_files.iter().enumerate() {
            let raw_components: Vec<ByteBuf> = tree_file
                .path_components
                .iter()
                .map(|c| ByteBuf::from(c.clone()))
                .collect();
            let path = sanitize_path(&raw_components)?;
            let path = claim_path(&mut taken_paths, path)?;
            let symlink_target = match &tree_file.symlink_path {
                Some(target) if tree_file.attributes.symlink => {
                    let target: Vec<ByteBuf> = target
                        .iter()
                        .map(|c| ByteBuf::from(c.clone()))
                        .collect();
                    Some(sanitize_path(&target)?)
                }
                _ => None,
            };
            files.push(FileInfo {
                path,
                len: tree_file.length,
                torrent_offset,
                attributes: tree_file.attributes,
                symlink_target,
                pieces_root: tree_file.pieces_root,
            });
            torrent_offset += tree_file.length;

            // align the next file to a piece boundary with a synthetic pad
            let misalignment = torrent_offset % piece_len as u64;
            if misalignment != 0 && index < last_nonempty {
                let pad_len = piece_len as u64 - misalignment;
                files.push(FileInfo {
                    path: PathBuf::from(".pad").join(pad_len.to_string()),
                    len: pad_len,
                    torrent_offset,
                    attributes: FileAttributes {
                        pad: true,
                        ..Default::default()
                    },
                    symlink_target: None,
                    pieces_root: None,
                });
                torrent_offset += pad_len;
            }
        }
        Ok(files)
    }

    /// For hybrid torrents the v1 list (pads included) and the v2 tree must
    /// describe the same layout. Returns the merged list: the v1 layout
    /// with the v2 pieces roots attached.
    fn check_hybrid_consistency(
        v1: &[FileInfo],
        v2: &[TreeFile],
    ) -> Result<Vec<FileInfo>, TorrentError> {
        let mut merged = v1.to_vec();
        let mut v2_iter = v2.iter();
        for file in merged.iter_mut().filter(|f| !f.attributes.pad) {
            let tree_file =
                v2_iter.next().ok_or(TorrentError::InconsistentFiles)?;
            if file.len != tree_file.length {
                return Err(TorrentError::InconsistentFiles);
            }
            file.pieces_root = tree_file.pieces_root;
        }
        if v2_iter.next().is_some() {
            return Err(TorrentError::InconsistentFiles);
        }
        Ok(merged)
    }

    /// Builds a merkle tree per v2 file and imports the matching `piece
    /// layers` entry. Single-piece files need no layer entry; multi-piece
    /// files without one, or with one that doesn't hash up to the file
    /// root, reject the torrent.
    fn build_trees(
        files: &[FileInfo],
        piece_len: u32,
        piece_layers: Option<&bencode::Dict>,
    ) -> Result<Vec<Option<MerkleTree>>, TorrentError> {
        let blocks_per_piece = (piece_len / BLOCK_LEN) as usize;
        let mut trees = Vec::with_capacity(files.len());
        for file in files {
            let root = match (file.attributes.pad, file.len, file.pieces_root)
            {
                (true, _, _) | (_, 0, _) => {
                    trees.push(None);
                    continue;
                }
                (false, _, Some(root)) => root,
                (false, _, None) => {
                    return Err(TorrentError::MissingPiecesRoot)
                }
            };
            let num_blocks =
                ((file.len + BLOCK_LEN as u64 - 1) / BLOCK_LEN as u64) as usize;
            let mut tree = MerkleTree::new(num_blocks, blocks_per_piece, root);
            if tree.num_pieces() > 1 {
                let layer_bytes = piece_layers
                    .and_then(|layers| layers.get(&root[..]))
                    .and_then(Value::as_bytes)
                    .ok_or(TorrentError::InvalidPieceLayer)?;
                if layer_bytes.len() % 32 != 0 {
                    return Err(TorrentError::InvalidPieceLayer);
                }
                let layer: Vec<Sha256Hash> = layer_bytes
                    .chunks(32)
                    .map(|chunk| {
                        let mut hash = [0; 32];
                        hash.copy_from_slice(chunk);
                        hash
                    })
                    .collect();
                if !tree.import_piece_layer(&layer) {
                    return Err(TorrentError::InvalidPieceLayer);
                }
            }
            trees.push(Some(tree));
        }
        Ok(trees)
    }
}

/// Sanitizes a full path out of raw components, skipping components that
/// sanitize to nothing.
fn sanitize_path(raw: &[ByteBuf]) -> Result<PathBuf, TorrentError> {
    let mut path = PathBuf::new();
    for component in raw {
        if let Some(component) =
            sanitize_path_component(component, TargetOs::host())
        {
            path.push(component);
        }
    }
    if path.as_os_str().is_empty() {
        return Err(TorrentError::InvalidName);
    }
    Ok(path)
}

/// Claims a path for a file, disambiguating collisions with a counter
/// suffix before the extension.
fn claim_path(
    taken: &mut HashMap<PathBuf, usize>,
    path: PathBuf,
) -> Result<PathBuf, TorrentError> {
    if !taken.contains_key(&path) {
        taken.insert(path.clone(), 0);
        return Ok(path);
    }
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut counter = *taken.get(&path).expect("checked above");
    loop {
        counter += 1;
        if counter > MAX_DUPLICATE_FILENAMES {
            return Err(TorrentError::TooManyDuplicateFilenames);
        }
        let candidate = path.with_file_name(disambiguate(&name, counter));
        if !taken.contains_key(&candidate) {
            *taken.get_mut(&path).expect("checked above") = counter;
            taken.insert(candidate.clone(), 0);
            return Ok(candidate);
        }
    }
}

fn encode_key(out: &mut Vec<u8>, key: &str) {
    out.extend_from_slice(format!("{}:", key.len()).as_bytes());
    out.extend_from_slice(key.as_bytes());
}

fn encode_str(out: &mut Vec<u8>, key: &str, value: &[u8]) {
    encode_key(out, key);
    out.extend_from_slice(format!("{}:", value.len()).as_bytes());
    out.extend_from_slice(value);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::merkle;

    /// Encodes a minimal single-file v1 torrent with the given piece count,
    /// returning the buffer and the piece hash bytes used.
    fn v1_torrent(piece_count: usize) -> Vec<u8> {
        let piece_len: usize = 0x4000;
        let length = piece_len * piece_count;
        let pieces = vec![0xab; piece_count * 20];
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce7:url:foo4:infod");
        buf.extend_from_slice(format!("6:lengthi{}e", length).as_bytes());
        buf.extend_from_slice(b"4:name4:test");
        buf.extend_from_slice(
            format!("12:piece lengthi{}e", piece_len).as_bytes(),
        );
        buf.extend_from_slice(format!("6:pieces{}:", pieces.len()).as_bytes());
        buf.extend_from_slice(&pieces);
        buf.extend_from_slice(b"ee");
        buf
    }

    #[test]
    fn test_parse_v1_single_file() {
        let buf = v1_torrent(4);
        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        assert_eq!(metainfo.name, "test");
        assert_eq!(metainfo.piece_count(), 4);
        assert_eq!(metainfo.piece_len, 0x4000);
        assert_eq!(metainfo.download_len(), 4 * 0x4000);
        assert!(!metainfo.is_archive());
        assert!(!metainfo.is_v2());
        assert!(metainfo.info_hash.v1.is_some());
        assert!(metainfo.info_hash.v2.is_none());
        assert_eq!(metainfo.piece_hash(0), Some([0xab; 20]));
        assert_eq!(metainfo.piece_hash(4), None);
        assert_eq!(metainfo.trackers, vec!["url:foo".to_string()]);
    }

    #[test]
    fn test_parse_failures() {
        // not bencode at all
        assert_eq!(
            Metainfo::from_bytes(b"garbage").unwrap_err(),
            TorrentError::ParseFailed
        );
        // no info dict
        assert_eq!(
            Metainfo::from_bytes(b"d8:announce3:urle").unwrap_err(),
            TorrentError::MissingInfo
        );
        // missing piece length
        assert_eq!(
            Metainfo::from_bytes(
                b"d4:infod6:lengthi16384e4:name1:t6:pieces20:aaaaaaaaaaaaaaaaaaaaee"
            )
            .unwrap_err(),
            TorrentError::MissingPieceLength
        );
        // missing name
        assert_eq!(
            Metainfo::from_bytes(
                b"d4:infod6:lengthi16384e12:piece lengthi16384e6:pieces20:aaaaaaaaaaaaaaaaaaaaee"
            )
            .unwrap_err(),
            TorrentError::MissingName
        );
        // piece length too small
        assert_eq!(
            Metainfo::from_bytes(
                b"d4:infod6:lengthi16384e4:name1:t12:piece lengthi1024e6:pieces20:aaaaaaaaaaaaaaaaaaaaee"
            )
            .unwrap_err(),
            TorrentError::InvalidPieceLength
        );
        // pieces not covering the length
        assert_eq!(
            Metainfo::from_bytes(
                b"d4:infod6:lengthi32768e4:name1:t12:piece lengthi16384e6:pieces20:aaaaaaaaaaaaaaaaaaaaee"
            )
            .unwrap_err(),
            TorrentError::InvalidHashes
        );
        // neither pieces nor meta version
        assert_eq!(
            Metainfo::from_bytes(
                b"d4:infod6:lengthi16384e4:name1:t12:piece lengthi16384eee"
            )
            .unwrap_err(),
            TorrentError::InvalidHashes
        );
    }

    #[test]
    fn test_parse_v1_multi_file_with_pad() {
        // files [a: 0x3ff0, pad: 0x10, b: 0x10]
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d4:infod5:filesl");
        buf.extend_from_slice(b"d6:lengthi16368e4:pathl1:aee");
        buf.extend_from_slice(b"d4:attr1:p6:lengthi16e4:pathl4:.pad2:16ee");
        buf.extend_from_slice(b"d6:lengthi16e4:pathl1:bee");
        buf.extend_from_slice(b"e4:name4:test12:piece lengthi16384e");
        let pieces = vec![0xcd; 2 * 20];
        buf.extend_from_slice(format!("6:pieces{}:", pieces.len()).as_bytes());
        buf.extend_from_slice(&pieces);
        buf.extend_from_slice(b"ee");

        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        assert!(metainfo.is_archive());
        assert_eq!(metainfo.files.len(), 3);
        assert!(!metainfo.files[0].attributes.pad);
        assert!(metainfo.files[1].attributes.pad);
        assert_eq!(metainfo.files[1].len, 0x10);
        assert_eq!(metainfo.files[1].torrent_offset, 0x3ff0);
        assert_eq!(metainfo.files[2].torrent_offset, 0x4000);
        assert_eq!(metainfo.piece_count(), 2);
    }

    #[test]
    fn test_misaligned_pad_rejected() {
        // the pad doesn't bring the stream to a piece boundary
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d4:infod5:filesl");
        buf.extend_from_slice(b"d6:lengthi16368e4:pathl1:aee");
        buf.extend_from_slice(b"d4:attr1:p6:lengthi8e4:pathl4:.pad1:8ee");
        buf.extend_from_slice(b"d6:lengthi24e4:pathl1:bee");
        buf.extend_from_slice(b"e4:name4:test12:piece lengthi16384e");
        let pieces = vec![0xcd; 2 * 20];
        buf.extend_from_slice(format!("6:pieces{}:", pieces.len()).as_bytes());
        buf.extend_from_slice(&pieces);
        buf.extend_from_slice(b"ee");

        assert_eq!(
            Metainfo::from_bytes(&buf).unwrap_err(),
            TorrentError::InvalidPadFile
        );
    }

    /// Builds a v2-only torrent with one file of `num_blocks` 16 KiB blocks
    /// at one-block pieces, returning the buffer.
    pub(crate) fn v2_fixture(num_blocks: usize) -> Vec<u8> {
        let piece_len: usize = 0x4000;
        // deterministic leaf content hashes
        let mut leaves = Vec::new();
        for i in 0..num_blocks {
            let mut hasher = Sha256::new();
            hasher.update(&(i as u32).to_le_bytes());
            let mut hash = [0; 32];
            hash.copy_from_slice(&hasher.finalize());
            leaves.push(hash);
        }
        let root = merkle::root_from_leaves(&leaves, &merkle::pad_hash(0));
        // one block per piece: the piece layer is the leaf layer
        let mut layer_bytes = Vec::new();
        for leaf in &leaves {
            layer_bytes.extend_from_slice(leaf);
        }

        let mut buf = Vec::new();
        buf.extend_from_slice(b"d4:infod");
        buf.extend_from_slice(b"9:file treed4:datad0:d");
        buf.extend_from_slice(
            format!("6:lengthi{}e", num_blocks * 0x4000).as_bytes(),
        );
        buf.extend_from_slice(b"11:pieces root32:");
        buf.extend_from_slice(&root);
        buf.extend_from_slice(b"eee");
        buf.extend_from_slice(b"12:meta versioni2e");
        buf.extend_from_slice(b"4:name4:test");
        buf.extend_from_slice(
            format!("12:piece lengthi{}e", piece_len).as_bytes(),
        );
        buf.extend_from_slice(b"e");
        if num_blocks > 1 {
            buf.extend_from_slice(b"12:piece layersd32:");
            buf.extend_from_slice(&root);
            buf.extend_from_slice(
                format!("{}:", layer_bytes.len()).as_bytes(),
            );
            buf.extend_from_slice(&layer_bytes);
            buf.extend_from_slice(b"e");
        }
        buf.extend_from_slice(b"e");
        buf
    }

    #[test]
    fn test_parse_v2() {
        let buf = v2_fixture(4);
        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        assert!(metainfo.is_v2());
        assert!(metainfo.info_hash.v1.is_none());
        assert!(metainfo.info_hash.v2.is_some());
        assert_eq!(metainfo.piece_count(), 4);
        assert_eq!(metainfo.files.len(), 1);
        assert_eq!(metainfo.files[0].path, PathBuf::from("data"));
        assert!(metainfo.files[0].pieces_root.is_some());
        // the tree was built and its piece layer imported
        let tree = metainfo.trees[0].as_ref().unwrap();
        assert_eq!(tree.num_pieces(), 4);
        assert!(tree.piece_root(0).is_some());
        assert!(metainfo.piece_hashes.is_empty());
    }

    #[test]
    fn test_v2_corrupt_piece_layer_rejected() {
        let mut buf = v2_fixture(4);
        // flip a byte inside the piece layers payload (towards the end of
        // the buffer, well past the info dict)
        let len = buf.len();
        buf[len - 10] ^= 0xff;
        assert_eq!(
            Metainfo::from_bytes(&buf).unwrap_err(),
            TorrentError::InvalidPieceLayer
        );
    }

    #[test]
    fn test_v2_missing_piece_layer_rejected() {
        let buf = v2_fixture(4);
        // strip the piece layers dict entirely: the final 'e' closes the
        // root dict, the layers sit right before it
        let info_end = buf.windows(12).position(|w| w == b"piece layers");
        let info_end = info_end.unwrap() - 3;
        let mut stripped = buf[..info_end].to_vec();
        stripped.push(b'e');
        assert_eq!(
            Metainfo::from_bytes(&stripped).unwrap_err(),
            TorrentError::InvalidPieceLayer
        );
    }

    #[test]
    fn test_v2_single_piece_file_needs_no_layer() {
        let buf = v2_fixture(1);
        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        let tree = metainfo.trees[0].as_ref().unwrap();
        assert_eq!(tree.num_pieces(), 1);
        assert!(tree.piece_root(0).is_some());
    }

    #[test]
    fn test_to_bytes_round_trip() {
        let buf = v1_torrent(4);
        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        let encoded = metainfo.to_bytes();
        let reparsed = Metainfo::from_bytes(&encoded).unwrap();
        // identity is preserved exactly; for this torrent the bytes are too
        assert_eq!(metainfo.info_hash, reparsed.info_hash);
        assert_eq!(encoded, buf);

        let buf = v2_fixture(4);
        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        let encoded = metainfo.to_bytes();
        assert_eq!(encoded, buf);
    }

    #[test]
    fn test_colliding_file_names() {
        // two files that sanitize to the same path
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d4:infod5:filesl");
        buf.extend_from_slice(b"d6:lengthi16384e4:pathl5:a:b.xee");
        buf.extend_from_slice(b"d6:lengthi16384e4:pathl5:a_b.xee");
        buf.extend_from_slice(b"e4:name4:test12:piece lengthi16384e");
        let pieces = vec![0xcd; 2 * 20];
        buf.extend_from_slice(format!("6:pieces{}:", pieces.len()).as_bytes());
        buf.extend_from_slice(&pieces);
        buf.extend_from_slice(b"ee");

        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        let paths: Vec<_> =
            metainfo.files.iter().map(|f| f.path.clone()).collect();
        // distinct paths on every platform; on windows the first also
        // sanitizes to a_b.x and gets disambiguated
        assert_ne!(paths[0], paths[1]);
    }
}
