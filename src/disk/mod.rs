//! The disk task: an asynchronous interface over torrent storage.
//!
//! All file IO and hashing runs on the blocking thread pool, driven by a
//! single event loop task. The rest of the engine talks to it through the
//! cloneable [`DiskHandle`]; results come back on per-torrent alert
//! channels. Write backpressure is a shared counter with a high/low
//! watermark pair: peer sessions stop requesting when the queue is above
//! the high mark and resume when told it drained below the low mark.

mod io;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use tokio::{
    sync::mpsc::{UnboundedReceiver, UnboundedSender},
    task,
};

use crate::{
    conf::DiskConf,
    error::{DiskError, Error, Result},
    storage_info::StorageInfo,
    torrent::SharedTrees,
    Bitfield, BlockInfo, PieceIndex, Sha1Hash, TorrentId,
};
use io::Disk;

/// Spawns a disk IO task and returns a tuple with the task join handle, the
/// disk handle used for sending commands, and a channel for receiving
/// command results and other notifications.
pub(crate) fn spawn(
    conf: DiskConf,
) -> Result<(task::JoinHandle<Result<()>>, DiskHandle, AlertReceiver)> {
    log::info!("Spawning disk IO task");
    let queued_blocks = Arc::new(AtomicUsize::new(0));
    let (mut disk, cmd_chan, alert_port) =
        Disk::new(conf.clone(), Arc::clone(&queued_blocks))?;
    // spawn disk event loop on a new task
    let join_handle = task::spawn(async move { disk.start().await });
    log::info!("Spawned disk IO task");

    Ok((
        join_handle,
        DiskHandle {
            cmd_chan,
            queued_blocks,
            high_watermark: conf.write_queue_high_watermark,
        },
        alert_port,
    ))
}

/// The handle for the disk task, used to execute disk IO related tasks.
///
/// The handle may be copied an arbitrary number of times. It is an
/// abstraction over the means to communicate with the disk IO task.
#[derive(Clone)]
pub(crate) struct DiskHandle {
    cmd_chan: CommandSender,
    /// The number of blocks queued for writing but not yet flushed, shared
    /// with the disk task.
    queued_blocks: Arc<AtomicUsize>,
    high_watermark: usize,
}

impl DiskHandle {
    /// Instructs the disk task to set up everything needed for a new
    /// torrent.
    pub fn allocate_new_torrent(
        &self,
        id: TorrentId,
        storage: StorageInfo,
        piece_hashes: Vec<u8>,
        trees: SharedTrees,
        file_priorities: Vec<u8>,
        smart_ban_salt: u32,
        seed_mode: bool,
    ) -> Result<()> {
        log::trace!("Allocating new torrent {}", id);
        self.cmd_chan
            .send(Command::NewTorrent {
                id,
                storage,
                piece_hashes,
                trees,
                file_priorities,
                smart_ban_salt,
                seed_mode,
            })
            .map_err(Error::from)
    }

    /// Queues a block for eventual writing to disk. Returns true when the
    /// write queue has grown past the high watermark: the caller should
    /// stop issuing requests until the queue drains (a
    /// [`TorrentAlert::WriteQueueDrained`] is posted when it does).
    pub fn write_block(
        &self,
        id: TorrentId,
        info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<bool> {
        log::trace!("Saving block {:?} to disk", info);
        let queued = self.queued_blocks.fetch_add(1, Ordering::AcqRel) + 1;
        self.cmd_chan
            .send(Command::WriteBlock { id, info, data })
            .map_err(Error::from)?;
        Ok(queued >= self.high_watermark)
    }

    /// Asks for a block to be read from disk (or the read cache) and sent
    /// back on the given channel.
    pub fn read_block(
        &self,
        id: TorrentId,
        info: BlockInfo,
        result_chan: BlockReadSender,
    ) -> Result<()> {
        log::trace!("Reading block {:?} from disk", info);
        self.cmd_chan
            .send(Command::ReadBlock {
                id,
                info,
                result_chan,
            })
            .map_err(Error::from)
    }

    /// Reads a whole piece back and hash checks it, without any write
    /// buffer involvement. Used for seed-mode lazy verification and for
    /// re-checking after resume divergence.
    pub fn hash_piece(&self, id: TorrentId, index: PieceIndex) -> Result<()> {
        self.cmd_chan
            .send(Command::HashPiece { id, index })
            .map_err(Error::from)
    }

    /// Checks which pieces of the torrent are present and valid on disk,
    /// reported via [`TorrentAlert::FilesChecked`].
    pub fn check_files(&self, id: TorrentId) -> Result<()> {
        self.cmd_chan
            .send(Command::CheckFiles { id })
            .map_err(Error::from)
    }

    /// Drops an incomplete piece's write buffer.
    pub fn clear_piece(&self, id: TorrentId, index: PieceIndex) -> Result<()> {
        self.cmd_chan
            .send(Command::ClearPiece { id, index })
            .map_err(Error::from)
    }

    /// Updates the file priorities; priority-0 files are never allocated,
    /// read, or written.
    pub fn set_file_priorities(
        &self,
        id: TorrentId,
        file_priorities: Vec<u8>,
    ) -> Result<()> {
        self.cmd_chan
            .send(Command::SetFilePriorities {
                id,
                file_priorities,
            })
            .map_err(Error::from)
    }

    /// Moves the torrent's storage to a new directory.
    pub fn move_storage(
        &self,
        id: TorrentId,
        new_dir: std::path::PathBuf,
    ) -> Result<()> {
        self.cmd_chan
            .send(Command::MoveStorage { id, new_dir })
            .map_err(Error::from)
    }

    /// Renames one file of the torrent.
    pub fn rename_file(
        &self,
        id: TorrentId,
        file_index: usize,
        new_path: std::path::PathBuf,
    ) -> Result<()> {
        self.cmd_chan
            .send(Command::RenameFile {
                id,
                file_index,
                new_path,
            })
            .map_err(Error::from)
    }

    /// Closes the torrent's file handles (they reopen lazily on the next
    /// access).
    pub fn release_files(&self, id: TorrentId) -> Result<()> {
        self.cmd_chan
            .send(Command::ReleaseFiles { id })
            .map_err(Error::from)
    }

    /// Deletes the torrent's downloaded files.
    pub fn delete_files(&self, id: TorrentId) -> Result<()> {
        self.cmd_chan
            .send(Command::DeleteFiles { id })
            .map_err(Error::from)
    }

    /// Removes the torrent from the disk task (files stay on disk).
    pub fn remove_torrent(&self, id: TorrentId) -> Result<()> {
        self.cmd_chan
            .send(Command::RemoveTorrent { id })
            .map_err(Error::from)
    }

    /// Shuts down the disk IO task, flushing nothing: incomplete piece
    /// buffers are dropped (their blocks re-download after resume).
    pub fn shutdown(&self) -> Result<()> {
        log::trace!("Shutting down disk IO task");
        self.cmd_chan.send(Command::Shutdown).map_err(Error::from)
    }

    /// True while the write queue is above the high watermark. Peer
    /// sessions must not issue new requests while this holds.
    pub fn is_congested(&self) -> bool {
        self.queued_blocks.load(Ordering::Acquire) >= self.high_watermark
    }
}

/// The channel for sending commands to the disk task.
type CommandSender = UnboundedSender<Command>;
/// The channel the disk task uses to listen for commands.
type CommandReceiver = UnboundedReceiver<Command>;

/// The channel on which a peer session receives the blocks it asked the
/// disk task to read.
pub(crate) type BlockReadSender = UnboundedSender<BlockRead>;

/// A block read off the disk (or the read cache), on its way to a peer.
#[derive(Debug)]
pub(crate) struct BlockRead {
    pub info: BlockInfo,
    pub data: Vec<u8>,
}

/// The type of commands that the disk can execute.
enum Command {
    NewTorrent {
        id: TorrentId,
        storage: StorageInfo,
        piece_hashes: Vec<u8>,
        trees: SharedTrees,
        file_priorities: Vec<u8>,
        smart_ban_salt: u32,
        seed_mode: bool,
    },
    WriteBlock {
        id: TorrentId,
        info: BlockInfo,
        data: Vec<u8>,
    },
    ReadBlock {
        id: TorrentId,
        info: BlockInfo,
        result_chan: BlockReadSender,
    },
    HashPiece {
        id: TorrentId,
        index: PieceIndex,
    },
    CheckFiles {
        id: TorrentId,
    },
    ClearPiece {
        id: TorrentId,
        index: PieceIndex,
    },
    SetFilePriorities {
        id: TorrentId,
        file_priorities: Vec<u8>,
    },
    MoveStorage {
        id: TorrentId,
        new_dir: std::path::PathBuf,
    },
    RenameFile {
        id: TorrentId,
        file_index: usize,
        new_path: std::path::PathBuf,
    },
    ReleaseFiles {
        id: TorrentId,
    },
    DeleteFiles {
        id: TorrentId,
    },
    RemoveTorrent {
        id: TorrentId,
    },
    Shutdown,
}

/// The type of channel used to alert the engine about global events.
type AlertSender = UnboundedSender<Alert>;
/// The channel on which the engine can listen for global disk events.
pub(crate) type AlertReceiver = UnboundedReceiver<Alert>;

/// The alerts that the disk task may send about global events (i.e. events
/// not related to individual torrents).
#[derive(Debug)]
pub(crate) enum Alert {
    /// Torrent allocation result. If successful, the id of the allocated
    /// torrent is returned for identification, if not, the reason of the
    /// error is included.
    TorrentAllocation(Result<TorrentAllocation, DiskError>),
}

/// The result of successfully allocating a torrent.
#[derive(Debug)]
pub(crate) struct TorrentAllocation {
    /// The id of the torrent that has been allocated.
    pub id: TorrentId,
    /// The port on which the torrent may receive alerts.
    pub alert_port: TorrentAlertReceiver,
}

/// The type of channel used to alert a torrent about torrent specific
/// events.
pub(crate) type TorrentAlertSender = UnboundedSender<TorrentAlert>;
/// The type of channel on which a torrent can listen for disk events.
pub(crate) type TorrentAlertReceiver = UnboundedReceiver<TorrentAlert>;

/// The alerts that the disk task may send about events related to a
/// specific torrent.
#[derive(Debug)]
pub(crate) enum TorrentAlert {
    /// A piece had all its blocks written and was hash checked.
    PieceCompletion(Result<PieceCompletion, DiskError>),
    /// The congested write queue drained below the low watermark; peer
    /// sessions may request again.
    WriteQueueDrained,
    /// A block read failed (the requesting peer session gave up on it).
    ReadError {
        block: BlockInfo,
        error: DiskError,
    },
    /// The result of a `check_files` sweep: which pieces are present and
    /// valid on disk.
    FilesChecked(Result<Bitfield, DiskError>),
    /// Storage was moved to a new directory.
    StorageMoved(Result<std::path::PathBuf, DiskError>),
    /// The torrent's files were deleted.
    FilesDeleted(Result<(), DiskError>),
}

/// The outcome of hashing a freshly completed (or re-checked) piece.
#[derive(Debug)]
pub(crate) struct PieceCompletion {
    pub index: PieceIndex,
    /// The blocks that made up the piece (empty for lazy re-checks, where
    /// no write buffer was involved).
    pub blocks: Vec<BlockInfo>,
    /// Whether the piece passed verification.
    pub result: HashResult,
    /// Salted per-block SHA-1 hashes of the piece data, computed for v1
    /// and hybrid torrents. The torrent's ban logic compares these across
    /// a failure and the eventual pass to attribute corruption.
    pub salted_block_hashes: Vec<Sha1Hash>,
}

/// How a piece fared against its expected hashes.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum HashResult {
    /// All applicable (v1 and/or v2) checks passed.
    Pass,
    /// The v1 SHA-1 didn't match. No per-block attribution is possible
    /// from the hash alone.
    FailV1,
    /// The v2 merkle check failed and pinpointed these exact blocks
    /// (indices within the piece) as corrupt.
    FailV2 {
        bad_blocks: Vec<usize>,
    },
    /// The v2 merkle check failed at piece granularity without block
    /// attribution.
    FailV2Piece,
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            block_count,
            conf::DiskConf,
            merkle::{self, MerkleTree},
            storage_info::{FileAttributes, FileInfo},
            Sha256Hash, BLOCK_LEN,
        },
        sha1::{Digest, Sha1},
        sha2::Sha256,
        std::{fs, path::PathBuf, sync::Mutex},
        tokio::sync::mpsc,
    };

    // Tests the allocation of a torrent, and then the allocation of the
    // same torrent returning an error.
    #[tokio::test]
    async fn test_allocate_new_torrent() {
        let (_, disk_handle, mut alert_port) =
            spawn(DiskConf::default()).unwrap();

        let env = Env::new("allocate");

        env.allocate(&disk_handle, 0);
        let alert = alert_port.recv().await.unwrap();
        match alert {
            Alert::TorrentAllocation(Ok(allocation)) => {
                assert_eq!(allocation.id, 0);
            }
            _ => panic!("torrent could not be allocated"),
        }

        // try to allocate the same torrent a second time
        env.allocate(&disk_handle, 0);
        let alert = alert_port.recv().await.unwrap();
        assert!(matches!(
            alert,
            Alert::TorrentAllocation(Err(DiskError::AlreadyExists))
        ));

        env.clean_up();
    }

    // Tests writing a complete valid torrent's pieces and verifying that
    // the disk task reports each piece completion with a pass.
    #[tokio::test]
    async fn test_write_all_pieces() {
        let (_, disk_handle, mut alert_port) =
            spawn(DiskConf::default()).unwrap();

        let env = Env::new("write-all");
        env.allocate(&disk_handle, 0);
        let mut torrent_port = expect_allocation(&mut alert_port).await;

        for index in 0..env.pieces.len() {
            let piece = &env.pieces[index];
            for_each_block(index, piece.len() as u32, |info| {
                let block_end = info.offset + info.len;
                let data = &piece[info.offset as usize..block_end as usize];
                disk_handle.write_block(0, info, data.to_vec()).unwrap();
            });

            match torrent_port.recv().await.unwrap() {
                TorrentAlert::PieceCompletion(Ok(completion)) => {
                    assert_eq!(completion.index, index);
                    assert_eq!(completion.result, HashResult::Pass);
                    assert_eq!(
                        completion.blocks.len(),
                        block_count(piece.len() as u32)
                    );
                    assert_eq!(
                        completion.salted_block_hashes.len(),
                        block_count(piece.len() as u32)
                    );
                }
                other => panic!("unexpected alert: {:?}", other),
            }
        }

        // the file contents are the concatenated pieces
        let mut expected = Vec::new();
        for piece in &env.pieces {
            expected.extend_from_slice(piece);
        }
        let on_disk =
            fs::read(env.download_dir.join("data")).expect("file missing");
        assert_eq!(on_disk, expected);

        env.clean_up();
    }

    // Tests that a corrupt piece is reported as failed and never written
    // to disk.
    #[tokio::test]
    async fn test_write_invalid_piece() {
        let (_, disk_handle, mut alert_port) =
            spawn(DiskConf::default()).unwrap();

        let env = Env::new("write-invalid");
        env.allocate(&disk_handle, 0);
        let mut torrent_port = expect_allocation(&mut alert_port).await;

        let index = 0;
        let invalid_piece: Vec<u8> =
            env.pieces[index].iter().map(|b| b.wrapping_add(5)).collect();
        for_each_block(index, invalid_piece.len() as u32, |info| {
            let block_end = info.offset + info.len;
            let data =
                &invalid_piece[info.offset as usize..block_end as usize];
            disk_handle.write_block(0, info, data.to_vec()).unwrap();
        });

        match torrent_port.recv().await.unwrap() {
            TorrentAlert::PieceCompletion(Ok(completion)) => {
                assert_eq!(completion.result, HashResult::FailV1);
            }
            other => panic!("unexpected alert: {:?}", other),
        }

        // an invalid piece must not be written to disk
        assert!(!env.download_dir.join("data").exists());

        env.clean_up();
    }

    // A piece whose suffix falls in a pad file: only the data prefix is
    // transferred, the pad bytes enter the hash as zeros, and nothing of
    // the pad is materialized on disk.
    #[tokio::test]
    async fn test_pad_suffix_piece() {
        let (_, disk_handle, mut alert_port) =
            spawn(DiskConf::default()).unwrap();

        // files [a: 0x3ff0, pad: 0x10] in a single 16 KiB piece
        let dir = test_dir("pad-suffix");
        let data: Vec<u8> = (0..0x3ff0u32).map(|b| (b % 251) as u8).collect();
        let mut hasher = Sha1::new();
        hasher.update(&data);
        hasher.update(&[0u8; 0x10]);
        let piece_hashes = hasher.finalize().to_vec();

        let storage = StorageInfo {
            piece_count: 1,
            piece_len: BLOCK_LEN,
            last_piece_len: BLOCK_LEN,
            download_len: 0x4000,
            download_dir: dir.clone(),
            files: vec![
                FileInfo {
                    path: "a".into(),
                    len: 0x3ff0,
                    torrent_offset: 0,
                    attributes: FileAttributes::default(),
                    symlink_target: None,
                    pieces_root: None,
                },
                FileInfo {
                    path: ".pad/16".into(),
                    len: 0x10,
                    torrent_offset: 0x3ff0,
                    attributes: FileAttributes {
                        pad: true,
                        ..Default::default()
                    },
                    symlink_target: None,
                    pieces_root: None,
                },
            ],
        };
        let trees: SharedTrees =
            std::sync::Arc::new(vec![Mutex::new(None), Mutex::new(None)]);
        disk_handle
            .allocate_new_torrent(
                0,
                storage,
                piece_hashes,
                trees,
                vec![1, 1],
                0,
                false,
            )
            .unwrap();
        let mut torrent_port = expect_allocation(&mut alert_port).await;

        // the single block's request covers only the data bytes
        let info = BlockInfo {
            piece_index: 0,
            offset: 0,
            len: 0x3ff0,
        };
        disk_handle.write_block(0, info, data.clone()).unwrap();

        match torrent_port.recv().await.unwrap() {
            TorrentAlert::PieceCompletion(Ok(completion)) => {
                assert_eq!(completion.result, HashResult::Pass);
            }
            other => panic!("unexpected alert: {:?}", other),
        }

        // the data file holds exactly the data bytes; no pad file exists
        assert_eq!(fs::read(dir.join("a")).unwrap(), data);
        assert!(!dir.join(".pad").exists());

        fs::remove_dir_all(&dir).ok();
    }

    /// A one-piece, four-block v2 layout: the piece's block data, its leaf
    /// hashes, and the storage description.
    struct V2Env {
        dir: PathBuf,
        blocks: Vec<Vec<u8>>,
        leaves: Vec<Sha256Hash>,
        root: Sha256Hash,
        storage: StorageInfo,
    }

    impl V2Env {
        fn new(name: &str) -> Self {
            let dir = test_dir(name);
            if dir.exists() {
                fs::remove_dir_all(&dir).expect("failed to clean test dir");
            }
            let blocks: Vec<Vec<u8>> = (0..4u32)
                .map(|b| {
                    (0..BLOCK_LEN).map(|i| ((i + b) % 251) as u8).collect()
                })
                .collect();
            let leaves: Vec<Sha256Hash> = blocks
                .iter()
                .map(|block| {
                    let mut leaf = [0; 32];
                    leaf.copy_from_slice(&Sha256::digest(block));
                    leaf
                })
                .collect();
            let root =
                merkle::root_from_leaves(&leaves, &merkle::pad_hash(0));
            let piece_len = 4 * BLOCK_LEN;
            let storage = StorageInfo {
                piece_count: 1,
                piece_len,
                last_piece_len: piece_len,
                download_len: piece_len as u64,
                download_dir: dir.clone(),
                files: vec![FileInfo {
                    path: "data".into(),
                    len: piece_len as u64,
                    torrent_offset: 0,
                    attributes: FileAttributes::default(),
                    symlink_target: None,
                    pieces_root: Some(root),
                }],
            };
            Self {
                dir,
                blocks,
                leaves,
                root,
                storage,
            }
        }

        /// Allocates the torrent with the given tree (no v1 hashes).
        fn allocate(&self, disk_handle: &DiskHandle, tree: MerkleTree) {
            let trees: SharedTrees =
                std::sync::Arc::new(vec![Mutex::new(Some(tree))]);
            disk_handle
                .allocate_new_torrent(
                    0,
                    self.storage.clone(),
                    Vec::new(),
                    trees,
                    vec![1],
                    0,
                    false,
                )
                .unwrap();
        }

        fn write_blocks(
            &self,
            disk_handle: &DiskHandle,
            corrupt_block: Option<usize>,
        ) {
            for (index, block) in self.blocks.iter().enumerate() {
                let mut data = block.clone();
                if corrupt_block == Some(index) {
                    data[0] ^= 0xff;
                }
                let info = BlockInfo {
                    piece_index: 0,
                    offset: index as u32 * BLOCK_LEN,
                    len: BLOCK_LEN,
                };
                disk_handle.write_block(0, info, data).unwrap();
            }
        }
    }

    // With the block-hash layer already verified in the tree, a corrupt
    // block is pinpointed exactly and only it is blamed.
    #[tokio::test]
    async fn test_write_v2_piece_exact_attribution() {
        let (_, disk_handle, mut alert_port) =
            spawn(DiskConf::default()).unwrap();

        let env = V2Env::new("v2-exact");
        let mut tree = MerkleTree::new(4, 4, env.root);
        // the leaf layer arrived with proofs (e.g. from a hash exchange)
        // before the data did
        assert!(tree.add_hashes(0, 0, &env.leaves, &[]));
        env.allocate(&disk_handle, tree);
        let mut torrent_port = expect_allocation(&mut alert_port).await;

        env.write_blocks(&disk_handle, Some(1));
        match torrent_port.recv().await.unwrap() {
            TorrentAlert::PieceCompletion(Ok(completion)) => {
                assert_eq!(
                    completion.result,
                    HashResult::FailV2 {
                        bad_blocks: vec![1]
                    }
                );
            }
            other => panic!("unexpected alert: {:?}", other),
        }
        // nothing of the invalid piece hit the disk
        assert!(!env.dir.join("data").exists());

        // the re-download with good data passes and is written out
        env.write_blocks(&disk_handle, None);
        match torrent_port.recv().await.unwrap() {
            TorrentAlert::PieceCompletion(Ok(completion)) => {
                assert_eq!(completion.result, HashResult::Pass);
            }
            other => panic!("unexpected alert: {:?}", other),
        }
        let expected: Vec<u8> = env.blocks.concat();
        assert_eq!(fs::read(env.dir.join("data")).unwrap(), expected);

        fs::remove_dir_all(&env.dir).ok();
    }

    // Without pre-verified leaves every block of the piece is tentative,
    // so a corrupt one fails the piece as a whole without naming a block.
    #[tokio::test]
    async fn test_write_v2_piece_unattributed_failure() {
        let (_, disk_handle, mut alert_port) =
            spawn(DiskConf::default()).unwrap();

        let env = V2Env::new("v2-unattributed");
        env.allocate(&disk_handle, MerkleTree::new(4, 4, env.root));
        let mut torrent_port = expect_allocation(&mut alert_port).await;

        env.write_blocks(&disk_handle, Some(1));
        match torrent_port.recv().await.unwrap() {
            TorrentAlert::PieceCompletion(Ok(completion)) => {
                assert_eq!(completion.result, HashResult::FailV2Piece);
            }
            other => panic!("unexpected alert: {:?}", other),
        }
        assert!(!env.dir.join("data").exists());

        fs::remove_dir_all(&env.dir).ok();
    }

    // `check_files` reports exactly the pieces that are present and valid
    // on disk.
    #[tokio::test]
    async fn test_check_files() {
        let (_, disk_handle, mut alert_port) =
            spawn(DiskConf::default()).unwrap();

        let env = Env::new("check-files");
        env.allocate(&disk_handle, 0);
        let mut torrent_port = expect_allocation(&mut alert_port).await;

        // write pieces 0 and 2, leaving 1 and 3 as holes
        for index in [0usize, 2] {
            let piece = &env.pieces[index];
            for_each_block(index, piece.len() as u32, |info| {
                let block_end = info.offset + info.len;
                let data = &piece[info.offset as usize..block_end as usize];
                disk_handle.write_block(0, info, data.to_vec()).unwrap();
            });
            assert!(matches!(
                torrent_port.recv().await.unwrap(),
                TorrentAlert::PieceCompletion(Ok(_))
            ));
        }

        disk_handle.check_files(0).unwrap();
        match torrent_port.recv().await.unwrap() {
            TorrentAlert::FilesChecked(Ok(valid)) => {
                assert!(valid[0]);
                assert!(!valid[1]);
                assert!(valid[2]);
                assert!(!valid[3]);
            }
            other => panic!("unexpected alert: {:?}", other),
        }

        env.clean_up();
    }

    // Storage moves to a new directory and can then be deleted.
    #[tokio::test]
    async fn test_move_and_delete_storage() {
        let (_, disk_handle, mut alert_port) =
            spawn(DiskConf::default()).unwrap();

        let env = Env::new("move-delete");
        env.allocate(&disk_handle, 0);
        let mut torrent_port = expect_allocation(&mut alert_port).await;

        let piece = &env.pieces[0];
        for_each_block(0, piece.len() as u32, |info| {
            let block_end = info.offset + info.len;
            let data = &piece[info.offset as usize..block_end as usize];
            disk_handle.write_block(0, info, data.to_vec()).unwrap();
        });
        assert!(matches!(
            torrent_port.recv().await.unwrap(),
            TorrentAlert::PieceCompletion(Ok(_))
        ));

        let new_dir = test_dir("move-delete-target");
        fs::remove_dir_all(&new_dir).ok();
        disk_handle.move_storage(0, new_dir.clone()).unwrap();
        match torrent_port.recv().await.unwrap() {
            TorrentAlert::StorageMoved(Ok(moved_to)) => {
                assert_eq!(moved_to, new_dir);
            }
            other => panic!("unexpected alert: {:?}", other),
        }
        assert!(new_dir.join("data").exists());
        assert!(!env.download_dir.exists());

        disk_handle.delete_files(0).unwrap();
        match torrent_port.recv().await.unwrap() {
            TorrentAlert::FilesDeleted(Ok(())) => {}
            other => panic!("unexpected alert: {:?}", other),
        }
        assert!(!new_dir.exists());
    }

    // Seed mode verifies a piece on its first requested read: valid data
    // is served, corrupt data surfaces a completion failure and the read
    // is dropped.
    #[tokio::test]
    async fn test_seed_mode_lazy_check() {
        let (_, disk_handle, mut alert_port) =
            spawn(DiskConf::default()).unwrap();

        // two one-block pieces; the file on disk holds valid bytes for
        // piece 0 and corrupt bytes for piece 1
        let dir = test_dir("seed-lazy");
        fs::remove_dir_all(&dir).ok();
        fs::create_dir_all(&dir).unwrap();
        let piece0: Vec<u8> = (0..BLOCK_LEN).map(|b| (b % 256) as u8).collect();
        let piece1_good: Vec<u8> =
            (0..BLOCK_LEN).map(|b| ((b + 1) % 256) as u8).collect();
        let mut piece1_bad = piece1_good.clone();
        piece1_bad[0] ^= 0xff;
        let mut on_disk = piece0.clone();
        on_disk.extend_from_slice(&piece1_bad);
        fs::write(dir.join("data"), &on_disk).unwrap();

        let mut piece_hashes = Vec::new();
        piece_hashes.extend(Sha1::digest(&piece0).as_slice());
        piece_hashes.extend(Sha1::digest(&piece1_good).as_slice());

        let storage = StorageInfo {
            piece_count: 2,
            piece_len: BLOCK_LEN,
            last_piece_len: BLOCK_LEN,
            download_len: 2 * BLOCK_LEN as u64,
            download_dir: dir.clone(),
            files: vec![FileInfo {
                path: "data".into(),
                len: 2 * BLOCK_LEN as u64,
                torrent_offset: 0,
                attributes: FileAttributes::default(),
                symlink_target: None,
                pieces_root: None,
            }],
        };
        let trees: SharedTrees = std::sync::Arc::new(vec![Mutex::new(None)]);
        disk_handle
            .allocate_new_torrent(
                0,
                storage,
                piece_hashes,
                trees,
                vec![1],
                0,
                true,
            )
            .unwrap();
        let mut torrent_port = expect_allocation(&mut alert_port).await;

        let (read_chan, mut read_port) = mpsc::unbounded_channel();

        // the valid piece passes its lazy check and is served
        let info = BlockInfo {
            piece_index: 0,
            offset: 0,
            len: BLOCK_LEN,
        };
        disk_handle.read_block(0, info, read_chan.clone()).unwrap();
        let block = read_port.recv().await.unwrap();
        assert_eq!(block.data, piece0);

        // the corrupt piece fails its lazy check: a completion failure is
        // alerted (so the torrent downgrades) and nothing is served
        let info = BlockInfo {
            piece_index: 1,
            offset: 0,
            len: BLOCK_LEN,
        };
        disk_handle.read_block(0, info, read_chan.clone()).unwrap();
        match torrent_port.recv().await.unwrap() {
            TorrentAlert::PieceCompletion(Ok(completion)) => {
                assert_eq!(completion.index, 1);
                assert_eq!(completion.result, HashResult::FailV1);
            }
            other => panic!("unexpected alert: {:?}", other),
        }
        assert!(read_port.try_recv().is_err());

        fs::remove_dir_all(&dir).ok();
    }

    // Reading back a written block, and serving the second read from the
    // cache.
    #[tokio::test]
    async fn test_read_block() {
        let (_, disk_handle, mut alert_port) =
            spawn(DiskConf::default()).unwrap();

        let env = Env::new("read-block");
        env.allocate(&disk_handle, 0);
        let mut torrent_port = expect_allocation(&mut alert_port).await;

        // write out piece 0
        let piece = &env.pieces[0];
        for_each_block(0, piece.len() as u32, |info| {
            let block_end = info.offset + info.len;
            let data = &piece[info.offset as usize..block_end as usize];
            disk_handle.write_block(0, info, data.to_vec()).unwrap();
        });
        assert!(matches!(
            torrent_port.recv().await.unwrap(),
            TorrentAlert::PieceCompletion(Ok(_))
        ));

        let (read_chan, mut read_port) = mpsc::unbounded_channel();
        let info = BlockInfo {
            piece_index: 0,
            offset: BLOCK_LEN,
            len: BLOCK_LEN,
        };
        for _ in 0..2 {
            disk_handle.read_block(0, info, read_chan.clone()).unwrap();
            let block = read_port.recv().await.unwrap();
            assert_eq!(block.info, info);
            assert_eq!(
                block.data,
                &piece[BLOCK_LEN as usize..2 * BLOCK_LEN as usize]
            );
        }

        env.clean_up();
    }

    // Calls the provided function for each block in piece, passing it the
    // block's `BlockInfo`.
    fn for_each_block(
        piece_index: usize,
        piece_len: u32,
        block_visitor: impl Fn(BlockInfo),
    ) {
        let mut block_offset = 0;
        for _ in 0..block_count(piece_len) {
            // the last block may be shorter than the rest
            let block_len = (piece_len - block_offset).min(BLOCK_LEN);
            debug_assert!(block_len > 0);

            block_visitor(BlockInfo {
                piece_index,
                offset: block_offset,
                len: block_len,
            });

            block_offset += block_len;
        }
    }

    fn test_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "swarmbit-disk-test-{}-{}",
            name,
            std::process::id()
        ))
    }

    async fn expect_allocation(
        alert_port: &mut AlertReceiver,
    ) -> TorrentAlertReceiver {
        match alert_port.recv().await.unwrap() {
            Alert::TorrentAllocation(Ok(allocation)) => {
                allocation.alert_port
            }
            _ => panic!("torrent could not be allocated"),
        }
    }

    // The disk IO test environment: a single file torrent of four pieces,
    // the last one shorter.
    struct Env {
        pieces: Vec<Vec<u8>>,
        piece_hashes: Vec<u8>,
        storage: StorageInfo,
        download_dir: PathBuf,
    }

    impl Env {
        fn new(name: &str) -> Self {
            let download_dir = test_dir(name);
            let piece_len: u32 = 4 * BLOCK_LEN;
            // the last piece is slightly shorter to test that it is
            // handled correctly
            let last_piece_len: u32 = piece_len - 935;
            let pieces: Vec<Vec<u8>> = vec![
                (0..piece_len).map(|b| (b % 256) as u8).collect(),
                (0..piece_len).map(|b| ((b + 1) % 256) as u8).collect(),
                (0..piece_len).map(|b| ((b + 2) % 256) as u8).collect(),
                (0..last_piece_len).map(|b| ((b + 3) % 256) as u8).collect(),
            ];
            let mut piece_hashes = Vec::with_capacity(pieces.len() * 20);
            for piece in pieces.iter() {
                let hash = Sha1::digest(piece);
                piece_hashes.extend(hash.as_slice());
            }

            // clean up any previous test run
            if download_dir.exists() {
                fs::remove_dir_all(&download_dir)
                    .expect("failed to clean up test dir");
            }

            let download_len: u64 =
                pieces.iter().map(|piece| piece.len() as u64).sum();
            let storage = StorageInfo {
                piece_count: pieces.len(),
                piece_len,
                last_piece_len,
                download_len,
                download_dir: download_dir.clone(),
                files: vec![FileInfo {
                    path: "data".into(),
                    len: download_len,
                    torrent_offset: 0,
                    attributes: FileAttributes::default(),
                    symlink_target: None,
                    pieces_root: None,
                }],
            };

            Self {
                pieces,
                piece_hashes,
                storage,
                download_dir,
            }
        }

        fn allocate(&self, disk_handle: &DiskHandle, id: TorrentId) {
            let trees: SharedTrees =
                std::sync::Arc::new(vec![Mutex::new(None)]);
            disk_handle
                .allocate_new_torrent(
                    id,
                    self.storage.clone(),
                    self.piece_hashes.clone(),
                    trees,
                    vec![1],
                    0,
                    false,
                )
                .unwrap();
        }

        fn clean_up(&self) {
            fs::remove_dir_all(&self.download_dir).ok();
        }
    }
}
