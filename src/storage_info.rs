use std::{ops::Range, path::PathBuf};

use crate::{error::*, metainfo::Metainfo, FileIndex, PieceIndex, Sha256Hash};

/// Per-file attribute flags from the metainfo (`attr` key).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileAttributes {
    /// A pad file: its bytes are defined to be zero, it is never stored on
    /// disk and never requested from peers.
    pub pad: bool,
    pub hidden: bool,
    pub executable: bool,
    pub symlink: bool,
}

impl FileAttributes {
    /// Parses the BEP 47 `attr` string, one flag per character.
    pub(crate) fn from_attr(attr: &[u8]) -> Self {
        Self {
            pad: attr.contains(&b'p'),
            hidden: attr.contains(&b'h'),
            executable: attr.contains(&b'x'),
            symlink: attr.contains(&b'l'),
        }
    }
}

/// Information about a torrent's file.
#[derive(Clone, Debug)]
pub struct FileInfo {
    /// The file's relative path from the download directory, with every
    /// component already sanitized.
    pub path: PathBuf,
    /// The file's length, in bytes.
    pub len: u64,
    /// The byte offset of the file within the torrent, when all files in
    /// torrent are viewed as a single contiguous byte array. This is always
    /// 0 for a single file torrent.
    pub torrent_offset: u64,
    /// Attribute flags (pad, hidden, executable, symlink).
    pub attributes: FileAttributes,
    /// Where a symlink points, when the symlink attribute is set.
    pub symlink_target: Option<PathBuf>,
    /// The file's v2 merkle root, when the torrent has v2 metadata and the
    /// file is not empty.
    pub pieces_root: Option<Sha256Hash>,
}

impl FileInfo {
    /// Returns a range that represents the file's first and one past the last
    /// bytes' offsets in the torrent.
    pub(crate) fn byte_range(&self) -> Range<u64> {
        self.torrent_offset..self.torrent_end_offset()
    }

    /// Returns the file's one past the last byte's offset in the torrent.
    pub(crate) fn torrent_end_offset(&self) -> u64 {
        self.torrent_offset + self.len
    }

    /// Returns the slice in file that overlaps with the range starting at the
    /// given offset.
    ///
    /// # Arguments
    ///
    /// * `torrent_offset` - A byte offset in the entire torrent.
    /// * `len` - The length of the byte range, starting from the offset. This
    ///         may exceed the file length, in which case the returned file
    ///         length will be smaller.
    ///
    /// # Panics
    ///
    /// This will panic if `torrent_offset` is smaller than the file's offset in
    /// torrent, or if it's past the last byte in file.
    pub(crate) fn get_slice(&self, torrent_offset: u64, len: u64) -> FileSlice {
        if torrent_offset < self.torrent_offset {
            panic!("torrent offset must be larger than file offset");
        }

        let torrent_end_offset = self.torrent_end_offset();
        if torrent_offset >= torrent_end_offset {
            panic!("torrent offset must be smaller than file end offset");
        }

        FileSlice {
            offset: torrent_offset - self.torrent_offset,
            len: len.min(torrent_end_offset - torrent_offset),
        }
    }
}

/// Represents the location of a range of bytes within a file.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct FileSlice {
    /// The byte offset in file, relative to the file's start.
    pub offset: u64,
    /// The length of the slice, in bytes.
    pub len: u64,
}

/// Information about a torrent's storage details, such as the piece count and
/// length, download length, the file layout, etc.
#[derive(Clone, Debug)]
pub(crate) struct StorageInfo {
    /// The number of pieces in the torrent.
    pub piece_count: usize,
    /// The nominal length of a piece.
    pub piece_len: u32,
    /// The length of the last piece in torrent, which may differ from the
    /// normal piece length if the download size is not an exact multiple of
    /// the piece length.
    pub last_piece_len: u32,
    /// The sum of the length of all files in the torrent, pad files
    /// included.
    pub download_len: u64,
    /// The download destination directory of the torrent.
    ///
    /// In case of single file downloads, this is the directory where the file
    /// is downloaded. In case of archive downloads, this directory is the
    /// download directory joined by the torrent's name.
    pub download_dir: PathBuf,
    /// The flattened, ordered list of all files in the torrent, pad files
    /// included.
    pub files: Vec<FileInfo>,
}

impl StorageInfo {
    /// Extracts storage related information from the torrent metainfo.
    pub fn new(metainfo: &Metainfo, download_dir: PathBuf) -> Self {
        let piece_count = metainfo.piece_count();
        let download_len = metainfo.download_len();
        let piece_len = metainfo.piece_len;
        let last_piece_len =
            download_len - piece_len as u64 * (piece_count - 1) as u64;
        let last_piece_len = last_piece_len as u32;

        // if this is an archive, download files into torrent's own dir
        let download_dir = if metainfo.is_archive() {
            download_dir.join(&metainfo.name)
        } else {
            download_dir
        };

        Self {
            piece_count,
            piece_len,
            last_piece_len,
            download_len,
            download_dir,
            files: metainfo.files.clone(),
        }
    }

    /// Returns the zero-based indices of the files of torrent that intersect
    /// with the piece.
    pub fn files_intersecting_piece(
        &self,
        index: PieceIndex,
    ) -> Result<Range<FileIndex>> {
        log::trace!("Returning files intersecting piece {}", index);
        let piece_offset = index as u64 * self.piece_len as u64;
        let piece_end = piece_offset + self.piece_len(index)? as u64;
        Ok(self.files_intersecting_bytes(piece_offset..piece_end))
    }

    /// Returns the files that overlap with the given left-inclusive range of
    /// bytes, where `bytes.start` is the offset and `bytes.end` is one past
    /// the last byte offset.
    pub fn files_intersecting_bytes(
        &self,
        byte_range: Range<u64>,
    ) -> Range<FileIndex> {
        // find the index of the first file that contains the first byte of
        // the given range
        let first_matching_index = match self
            .files
            .iter()
            .enumerate()
            .find(|(_, file)| file.byte_range().contains(&byte_range.start))
            .map(|(index, _)| index)
        {
            Some(index) => index,
            None => return 0..0,
        };

        // the resulting files
        let mut file_range = first_matching_index..first_matching_index + 1;

        // Find the last file that contains the last byte of the given range,
        // starting at the file after the above found one.
        //
        // NOTE: the order of `enumerate` and `skip` matters as otherwise
        // we'd be getting relative indices
        for (index, file) in
            self.files.iter().enumerate().skip(first_matching_index + 1)
        {
            // stop if file's first byte is not contained by the given byte
            // range (is at or past the end of the byte range we're looking
            // for). zero length files start at the same offset as their
            // successor; they intersect nothing
            if !byte_range.contains(&file.torrent_offset) || file.len == 0 {
                if file.len == 0 {
                    continue;
                }
                break;
            }

            // note that we need to add one to the end as this is
            // a left-inclusive range, so we want the end (excluded) to be one
            // past the actually included value
            file_range.end = index + 1;
        }

        file_range
    }

    /// Returns the length of the piece at the given index.
    pub fn piece_len(&self, index: PieceIndex) -> Result<u32> {
        if index == self.piece_count - 1 {
            Ok(self.last_piece_len)
        } else if index < self.piece_count - 1 {
            Ok(self.piece_len)
        } else {
            log::error!("Piece {} is invalid for torrent", index);
            Err(Error::InvalidPieceIndex(index))
        }
    }

    /// The first byte offset of the piece in the torrent.
    pub fn piece_offset(&self, index: PieceIndex) -> u64 {
        index as u64 * self.piece_len as u64
    }

    /// Returns how many of the piece's bytes fall within pad files. Those
    /// bytes are defined to be zero and are neither stored nor transferred.
    pub fn pad_bytes_in_piece(&self, index: PieceIndex) -> Result<u32> {
        let piece_offset = self.piece_offset(index);
        let piece_end = piece_offset + self.piece_len(index)? as u64;
        let mut pad_bytes = 0;
        for file in &self.files[self.files_intersecting_piece(index)?] {
            if !file.attributes.pad {
                continue;
            }
            let overlap_start = file.torrent_offset.max(piece_offset);
            let overlap_end = file.torrent_end_offset().min(piece_end);
            pad_bytes += (overlap_end - overlap_start) as u32;
        }
        Ok(pad_bytes)
    }

    /// True if every byte of the piece is pad. Such a piece is complete at
    /// time zero and never hashed or requested.
    pub fn is_piece_all_pad(&self, index: PieceIndex) -> Result<bool> {
        Ok(self.pad_bytes_in_piece(index)? == self.piece_len(index)?)
    }

    /// True if at least one non-pad file overlapping the piece has a nonzero
    /// priority, i.e. the piece is worth downloading at all.
    pub fn piece_has_wanted_files(
        &self,
        index: PieceIndex,
        file_priorities: &[u8],
    ) -> Result<bool> {
        debug_assert_eq!(file_priorities.len(), self.files.len());
        let files = self.files_intersecting_piece(index)?;
        Ok(self.files[files.clone()]
            .iter()
            .zip(&file_priorities[files])
            .any(|(file, prio)| !file.attributes.pad && *prio > 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(offset: u64, len: u64) -> FileInfo {
        FileInfo {
            // file doesn't need to exist as we're not doing any IO in tests
            path: PathBuf::from(format!("/bogus/{}", offset)),
            len,
            torrent_offset: offset,
            attributes: FileAttributes::default(),
            symlink_target: None,
            pieces_root: None,
        }
    }

    fn pad_file(offset: u64, len: u64) -> FileInfo {
        FileInfo {
            attributes: FileAttributes {
                pad: true,
                ..Default::default()
            },
            ..file(offset, len)
        }
    }

    fn storage(
        piece_len: u32,
        last_piece_len: u32,
        files: Vec<FileInfo>,
    ) -> StorageInfo {
        let download_len: u64 = files.iter().map(|f| f.len).sum();
        let piece_count = ((download_len + piece_len as u64 - 1)
            / piece_len as u64) as usize;
        StorageInfo {
            piece_count,
            piece_len,
            last_piece_len,
            download_len,
            download_dir: PathBuf::from("/"),
            files,
        }
    }

    #[test]
    fn test_file_get_slice() {
        let file = file(200, 500);

        assert_eq!(
            file.get_slice(300, 1000),
            FileSlice {
                offset: 300 - 200,
                len: 500 - (300 - 200),
            },
            "file slice for byte range longer than file should return \
            at most file length long slice"
        );

        assert_eq!(
            file.get_slice(300, 10),
            FileSlice {
                offset: 300 - 200,
                len: 10,
            },
            "file slice for byte range smaller than file should return \
            at most byte range long slice"
        );

        assert_eq!(
            file.get_slice(200, 500),
            FileSlice {
                offset: 0,
                len: 500,
            },
            "file slice for byte range equal to file length should return \
            the full file slice"
        );
    }

    #[test]
    #[should_panic(expected = "torrent offset must be larger than file offset")]
    fn test_file_get_slice_starting_before_file() {
        let file = file(200, 500);
        // we can't query a file slice for a byte range starting before the
        // file
        file.get_slice(100, 400);
    }

    #[test]
    #[should_panic(
        expected = "torrent offset must be smaller than file end offset"
    )]
    fn test_file_get_slice_starting_after_file() {
        let file = file(200, 500);
        file.get_slice(200 + 500, 400);
    }

    #[test]
    fn test_files_intersecting_pieces() {
        // single file: 3 full length pieces; 1 smaller piece
        let info = storage(4, 2, vec![file(0, 3 * 4 + 2)]);
        // all 4 pieces are in the same file
        assert_eq!(info.files_intersecting_piece(0).unwrap(), 0..1);
        assert_eq!(info.files_intersecting_piece(1).unwrap(), 0..1);
        assert_eq!(info.files_intersecting_piece(2).unwrap(), 0..1);
        assert_eq!(info.files_intersecting_piece(3).unwrap(), 0..1);

        // multi-file
        //
        // pieces: (index:first byte offset)
        // --------------------------------------------------------------------
        // |0:0         |1:16          |2:32          |3:48          |4:64    |
        // --------------------------------------------------------------------
        // files: (index:first byte offset,last byte offset)
        // --------------------------------------------------------------------
        // |0:0,8 |1:9,19  |2:20,26|3:27,35 |4:36,47  |5:48,63       |6:64,71 |
        // --------------------------------------------------------------------
        let info = storage(
            16,
            8,
            vec![
                file(0, 9),
                file(9, 11),
                file(20, 7),
                file(27, 9),
                file(36, 12),
                file(48, 16),
                file(64, 8),
            ],
        );
        // sanity check that the offsets in the files above correctly follow
        // each other and that they add up to the total download length
        debug_assert_eq!(
            info.files.iter().fold(0, |offset, file| {
                debug_assert_eq!(offset, file.torrent_offset);
                offset + file.len
            }),
            info.download_len,
        );
        // piece 0 intersects with files 0 and 1
        assert_eq!(info.files_intersecting_piece(0).unwrap(), 0..2);
        // piece 1 intersects with files 1, 2, 3
        assert_eq!(info.files_intersecting_piece(1).unwrap(), 1..4);
        // piece 2 intersects with files 3 and 4
        assert_eq!(info.files_intersecting_piece(2).unwrap(), 3..5);
        // piece 3 intersects with only file 5
        assert_eq!(info.files_intersecting_piece(3).unwrap(), 5..6);
        // last piece 4 intersects with only file 6
        assert_eq!(info.files_intersecting_piece(4).unwrap(), 6..7);
        // piece 5 is invalid
        assert!(info.files_intersecting_piece(5).is_err());
    }

    #[test]
    fn test_files_intersecting_bytes() {
        // single file
        let info = storage(0x4000, 0x4000, vec![file(0, 12341234)]);
        assert_eq!(info.files_intersecting_bytes(0..0), 0..1);
        assert_eq!(info.files_intersecting_bytes(0..1), 0..1);
        assert_eq!(info.files_intersecting_bytes(0..12341234), 0..1);

        // multi-file
        let info = storage(
            16,
            10,
            vec![file(0, 4), file(4, 9), file(13, 3), file(16, 10)],
        );
        // bytes only in the first file
        assert_eq!(info.files_intersecting_bytes(0..4), 0..1);
        // bytes intersecting two files
        assert_eq!(info.files_intersecting_bytes(0..5), 0..2);
        // bytes overlapping with two files
        assert_eq!(info.files_intersecting_bytes(0..13), 0..2);
        // bytes intersecting three files
        assert_eq!(info.files_intersecting_bytes(0..15), 0..3);
        // bytes intersecting all files
        assert_eq!(info.files_intersecting_bytes(0..18), 0..4);
        // bytes intersecting the last byte of the last file
        assert_eq!(info.files_intersecting_bytes(25..26), 3..4);
        // bytes overlapping with two files in the middle
        assert_eq!(info.files_intersecting_bytes(4..16), 1..3);
        // bytes intersecting only one byte of two files each, among the middle
        // of all files
        assert_eq!(info.files_intersecting_bytes(8..14), 1..3);
        // bytes intersecting only one byte of one file, among the middle of all
        // files
        assert_eq!(info.files_intersecting_bytes(13..14), 2..3);
        // bytes not intersecting any files
        assert_eq!(info.files_intersecting_bytes(30..38), 0..0);
    }

    #[test]
    fn test_pad_bytes_in_piece() {
        // files [A: 0x3ff0, PAD: 0x10, B: 0x10] at 16 KiB piece length:
        // piece 0 overlaps A and the pad, piece 1 overlaps B alone
        let info = storage(
            0x4000,
            0x10,
            vec![
                file(0, 0x3ff0),
                pad_file(0x3ff0, 0x10),
                file(0x4000, 0x10),
            ],
        );
        assert_eq!(info.pad_bytes_in_piece(0).unwrap(), 0x10);
        assert_eq!(info.pad_bytes_in_piece(1).unwrap(), 0);
        assert!(!info.is_piece_all_pad(0).unwrap());
        assert!(!info.is_piece_all_pad(1).unwrap());
    }

    #[test]
    fn test_piece_has_wanted_files() {
        let info = storage(
            0x4000,
            0x10,
            vec![
                file(0, 0x3ff0),
                pad_file(0x3ff0, 0x10),
                file(0x4000, 0x10),
            ],
        );
        // all files wanted
        assert!(info.piece_has_wanted_files(0, &[1, 1, 1]).unwrap());
        assert!(info.piece_has_wanted_files(1, &[1, 1, 1]).unwrap());
        // first file skipped: piece 0 has nothing to offer (its only other
        // overlap is the pad file, which doesn't count)
        assert!(!info.piece_has_wanted_files(0, &[0, 1, 1]).unwrap());
        assert!(info.piece_has_wanted_files(1, &[0, 1, 1]).unwrap());
    }
}
