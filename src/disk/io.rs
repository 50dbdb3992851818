use {
    lru::LruCache,
    nix::sys::uio::{pread, pwrite},
    sha1::{Digest, Sha1},
    sha2::Sha256,
    std::{
        collections::{BTreeMap, HashMap},
        fs::{self, File, OpenOptions},
        ops::Range,
        os::unix::io::AsRawFd,
        path::PathBuf,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
    },
    tokio::{sync::mpsc, task},
};

use {
    super::{
        Alert, AlertReceiver, AlertSender, BlockRead, BlockReadSender,
        Command, CommandReceiver, CommandSender, HashResult,
        PieceCompletion, TorrentAlert, TorrentAlertSender,
        TorrentAllocation,
    },
    crate::{
        block_count,
        conf::DiskConf,
        error::{DiskError, DiskOp, Result},
        merkle::BlockHashResult,
        storage_info::{FileInfo, StorageInfo},
        torrent::SharedTrees,
        Bitfield, BlockInfo, FileIndex, PieceIndex, Sha1Hash, TorrentId,
        BLOCK_LEN,
    },
};

/// The entity responsible for saving downloaded file blocks to disk,
/// serving block reads, and verifying pieces against their v1 and/or v2
/// hashes.
pub(super) struct Disk {
    /// Each torrent in the engine has a corresponding entry in this map,
    /// which includes various metadata about the torrent and the torrent
    /// specific alert channel.
    torrents: HashMap<TorrentId, Torrent>,
    /// Port on which disk IO commands are received.
    cmd_port: CommandReceiver,
    /// Channel on which `Disk` sends alerts to the torrent engine.
    alert_chan: AlertSender,
    conf: DiskConf,
    /// Blocks queued for writing, shared with every `DiskHandle`.
    queued_blocks: Arc<AtomicUsize>,
    /// Whether the write queue went past the high watermark and hasn't
    /// drained below the low one yet.
    congested: bool,
}

impl Disk {
    /// Creates a new `Disk` instance and returns a command sender and an
    /// alert receiver.
    pub(super) fn new(
        conf: DiskConf,
        queued_blocks: Arc<AtomicUsize>,
    ) -> Result<(Self, CommandSender, AlertReceiver)> {
        let (alert_chan, alert_port) = mpsc::unbounded_channel();
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        Ok((
            Self {
                torrents: HashMap::new(),
                cmd_port,
                alert_chan,
                conf,
                queued_blocks,
                congested: false,
            },
            cmd_chan,
            alert_port,
        ))
    }

    /// Starts the disk event loop which is run until shutdown or an
    /// unrecoverable error occurs (e.g. mpsc channel failure).
    pub(super) async fn start(&mut self) -> Result<()> {
        log::info!("Starting disk IO event loop");
        while let Some(cmd) = self.cmd_port.recv().await {
            match cmd {
                Command::NewTorrent {
                    id,
                    storage,
                    piece_hashes,
                    trees,
                    file_priorities,
                    smart_ban_salt,
                    seed_mode,
                } => {
                    self.new_torrent(
                        id,
                        storage,
                        piece_hashes,
                        trees,
                        file_priorities,
                        smart_ban_salt,
                        seed_mode,
                    )?;
                }
                Command::WriteBlock { id, info, data } => {
                    self.write_block(id, info, data).await?;
                }
                Command::ReadBlock {
                    id,
                    info,
                    result_chan,
                } => {
                    self.read_block(id, info, result_chan).await?;
                }
                Command::HashPiece { id, index } => {
                    self.hash_piece(id, index).await?;
                }
                Command::CheckFiles { id } => {
                    self.check_files(id).await?;
                }
                Command::ClearPiece { id, index } => {
                    if let Some(torrent) = self.torrents.get_mut(&id) {
                        torrent.clear_piece(index, &self.queued_blocks);
                    }
                }
                Command::SetFilePriorities {
                    id,
                    file_priorities,
                } => {
                    if let Some(torrent) = self.torrents.get_mut(&id) {
                        torrent.file_priorities = file_priorities;
                    }
                }
                Command::MoveStorage { id, new_dir } => {
                    if let Some(torrent) = self.torrents.get_mut(&id) {
                        torrent.move_storage(new_dir);
                    }
                }
                Command::RenameFile {
                    id,
                    file_index,
                    new_path,
                } => {
                    if let Some(torrent) = self.torrents.get_mut(&id) {
                        torrent.rename_file(file_index, new_path);
                    }
                }
                Command::ReleaseFiles { id } => {
                    if let Some(torrent) = self.torrents.get_mut(&id) {
                        torrent.release_files();
                    }
                }
                Command::DeleteFiles { id } => {
                    if let Some(torrent) = self.torrents.get_mut(&id) {
                        torrent.delete_files();
                    }
                }
                Command::RemoveTorrent { id } => {
                    if let Some(torrent) = self.torrents.remove(&id) {
                        let buffered = torrent.buffered_block_count();
                        self.queued_blocks
                            .fetch_sub(buffered, Ordering::AcqRel);
                    }
                }
                Command::Shutdown => {
                    log::info!("Shutting down disk event loop");
                    break;
                }
            }
        }
        Ok(())
    }

    fn new_torrent(
        &mut self,
        id: TorrentId,
        storage: StorageInfo,
        piece_hashes: Vec<u8>,
        trees: SharedTrees,
        file_priorities: Vec<u8>,
        smart_ban_salt: u32,
        seed_mode: bool,
    ) -> Result<()> {
        if self.torrents.contains_key(&id) {
            log::warn!("Torrent {} already allocated", id);
            self.alert_chan.send(Alert::TorrentAllocation(Err(
                DiskError::AlreadyExists,
            )))?;
            return Ok(());
        }

        // NOTE: do _not_ return on failure, we don't want to kill the disk
        // task due to IO errors: we log them and notify the engine.
        match Torrent::new(
            storage,
            piece_hashes,
            trees,
            file_priorities,
            smart_ban_salt,
            seed_mode,
            self.conf.read_cache_capacity,
        ) {
            Ok((torrent, alert_port)) => {
                log::info!("Torrent {} successfully allocated", id);
                self.torrents.insert(id, torrent);
                self.alert_chan.send(Alert::TorrentAllocation(Ok(
                    TorrentAllocation { id, alert_port },
                )))?;
            }
            Err(e) => {
                log::warn!("Torrent {} allocation failure: {}", id, e);
                self.alert_chan.send(Alert::TorrentAllocation(Err(e)))?;
            }
        }
        Ok(())
    }

    /// Queues a block for writing. If it completes its piece, the piece is
    /// hashed and flushed, and the completion is alerted to the torrent.
    async fn write_block(
        &mut self,
        id: TorrentId,
        info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        let torrent = match self.torrents.get_mut(&id) {
            Some(torrent) => torrent,
            None => {
                log::warn!("Torrent {} not found", id);
                self.queued_blocks.fetch_sub(1, Ordering::AcqRel);
                return Ok(());
            }
        };

        if self.queued_blocks.load(Ordering::Acquire)
            >= self.conf.write_queue_high_watermark
        {
            self.congested = true;
        }

        let flushed = torrent.write_block(info, data).await?;
        if flushed > 0 {
            let remaining = self
                .queued_blocks
                .fetch_sub(flushed, Ordering::AcqRel)
                - flushed;
            if self.congested
                && remaining < self.conf.write_queue_low_watermark
            {
                self.congested = false;
                if let Some(torrent) = self.torrents.get(&id) {
                    let _ = torrent
                        .alert_chan
                        .send(TorrentAlert::WriteQueueDrained);
                }
            }
        }
        Ok(())
    }

    async fn read_block(
        &mut self,
        id: TorrentId,
        info: BlockInfo,
        result_chan: BlockReadSender,
    ) -> Result<()> {
        match self.torrents.get_mut(&id) {
            Some(torrent) => torrent.read_block(info, result_chan).await,
            None => {
                log::warn!("Torrent {} not found", id);
                Ok(())
            }
        }
    }

    async fn hash_piece(&mut self, id: TorrentId, index: PieceIndex) -> Result<()> {
        match self.torrents.get_mut(&id) {
            Some(torrent) => torrent.hash_piece(index).await,
            None => {
                log::warn!("Torrent {} not found", id);
                Ok(())
            }
        }
    }

    async fn check_files(&mut self, id: TorrentId) -> Result<()> {
        match self.torrents.get_mut(&id) {
            Some(torrent) => torrent.check_files().await,
            None => {
                log::warn!("Torrent {} not found", id);
                Ok(())
            }
        }
    }
}

/// Torrent information related to disk IO.
///
/// Contains the in-progress pieces (i.e. the write buffer), metadata about
/// the torrent's layout and expected hashes, the file handles, and the
/// block read cache.
struct Torrent {
    /// All information concerning this torrent's storage.
    storage: StorageInfo,
    /// The concatenation of all expected v1 piece hashes (empty for
    /// v2-only torrents).
    piece_hashes: Vec<u8>,
    /// The per-file merkle trees, shared with the torrent task. The disk
    /// worker updates them with block hashes during verification.
    trees: SharedTrees,
    /// Per-file priorities; priority-0 files are never allocated, read or
    /// written.
    file_priorities: Vec<u8>,
    /// The salt folded into per-block hashes for corruption attribution.
    smart_ban_salt: u32,
    /// The channel used to alert the torrent of piece completions, reads
    /// and queue drain events.
    alert_chan: TorrentAlertSender,
    /// The in-progress piece downloads and disk writes. This is the
    /// torrent's disk write buffer. Each piece is mapped to its index for
    /// faster lookups.
    pieces: HashMap<PieceIndex, Piece>,
    /// Handles of all files in the torrent, opened lazily on first access.
    ///
    /// Each blocking task gets exclusive access to the file handle it
    /// needs, referring to it directly in the vector (hence the arc).
    files: Arc<Vec<Mutex<TorrentFile>>>,
    /// Recently read blocks, served to peers without touching the
    /// filesystem again.
    read_cache: LruCache<(PieceIndex, u32), Vec<u8>>,
    /// In seed mode every piece is trusted present but only verified when
    /// a peer first requests it: bits are set as pieces pass their lazy
    /// check. `None` outside seed mode.
    lazy_verify: Option<Bitfield>,
}

impl Torrent {
    /// Sets up the torrent's directory structure. Files themselves are
    /// created lazily when their first bytes are written.
    fn new(
        storage: StorageInfo,
        piece_hashes: Vec<u8>,
        trees: SharedTrees,
        file_priorities: Vec<u8>,
        smart_ban_salt: u32,
        seed_mode: bool,
        read_cache_capacity: usize,
    ) -> Result<(Self, super::TorrentAlertReceiver), DiskError> {
        fs::create_dir_all(&storage.download_dir).map_err(|e| {
            DiskError::from_io(e, DiskOp::DirCreate, None)
        })?;

        let files = storage
            .files
            .iter()
            .map(|info| {
                Mutex::new(TorrentFile {
                    path: storage.download_dir.join(&info.path),
                    handle: None,
                })
            })
            .collect();

        let (alert_chan, alert_port) = mpsc::unbounded_channel();
        let piece_count = storage.piece_count;

        Ok((
            Self {
                storage,
                piece_hashes,
                trees,
                file_priorities,
                smart_ban_salt,
                alert_chan,
                pieces: HashMap::new(),
                files: Arc::new(files),
                read_cache: LruCache::new(read_cache_capacity.max(1)),
                lazy_verify: if seed_mode {
                    let mut verified = Bitfield::with_capacity(piece_count);
                    verified.resize(piece_count, false);
                    Some(verified)
                } else {
                    None
                },
            },
            alert_port,
        ))
    }

    fn buffered_block_count(&self) -> usize {
        self.pieces.values().map(|piece| piece.blocks.len()).sum()
    }

    fn clear_piece(
        &mut self,
        index: PieceIndex,
        queued_blocks: &AtomicUsize,
    ) {
        if let Some(piece) = self.pieces.remove(&index) {
            queued_blocks.fetch_sub(piece.blocks.len(), Ordering::AcqRel);
        }
    }

    /// Buffers a block; once its piece has all data blocks, hashes the
    /// piece and, if valid, writes it out. Returns how many buffered
    /// blocks were consumed (for the write queue accounting).
    async fn write_block(
        &mut self,
        info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<usize> {
        log::trace!("Saving block {:?} to disk", info);

        let piece_index = info.piece_index;
        if !self.pieces.contains_key(&piece_index) {
            if let Err(e) = self.start_new_piece(info) {
                self.alert_chan
                    .send(TorrentAlert::PieceCompletion(Err(e)))?;
                // return with ok as the disk task itself shouldn't be
                // aborted due to invalid input; the dropped block still
                // counts as consumed for the queue accounting
                return Ok(1);
            }
        }
        let piece = self
            .pieces
            .get_mut(&piece_index)
            .expect("newly inserted piece not present");

        if !piece.enqueue_block(info.offset, data) {
            // a duplicate; dropped and thus consumed
            return Ok(1);
        }

        if !piece.is_complete() {
            return Ok(0);
        }

        // the piece has all its data: verify it and, if valid, flush it
        let piece = self.pieces.remove(&piece_index).expect("checked above");
        let block_count = piece.blocks.len();
        let blocks: Vec<BlockInfo> = piece
            .blocks
            .iter()
            .map(|(offset, block)| BlockInfo {
                piece_index,
                offset: *offset,
                len: block.len() as u32,
            })
            .collect();

        let verification = self.verification_context(piece_index);
        let files = Arc::clone(&self.files);
        let file_priorities = self.file_priorities.clone();
        let piece_offset = self.storage.piece_offset(piece_index);
        let file_range = self
            .storage
            .files_intersecting_piece(piece_index)?;
        let file_infos = self.storage.files.clone();

        // don't block the reactor with the hashing and the sync file
        // writing
        let write_result: std::result::Result<
            (HashResult, Vec<Sha1Hash>),
            DiskError,
        > = task::spawn_blocking(move || {
            let data = piece.assemble();
            let (result, salted) = verification.verify(&data);
            if matches!(result, HashResult::Pass) {
                write_piece_data(
                    &data,
                    piece_offset,
                    &file_infos,
                    file_range,
                    &file_priorities,
                    &files,
                )?;
            }
            Ok((result, salted))
        })
        .await
        // our code doesn't panic in the task so until better strategies
        // are devised, unwrap here
        .expect("disk IO write task panicked");

        match write_result {
            Ok((result, salted_block_hashes)) => {
                if matches!(result, HashResult::Pass) {
                    log::debug!("Piece {} is valid", piece_index);
                } else {
                    log::warn!("Piece {} failed verification", piece_index);
                }
                self.alert_chan.send(TorrentAlert::PieceCompletion(Ok(
                    PieceCompletion {
                        index: piece_index,
                        blocks,
                        result,
                        salted_block_hashes,
                    },
                )))?;
            }
            Err(e) => {
                log::warn!("Disk write error: {}", e);
                self.alert_chan
                    .send(TorrentAlert::PieceCompletion(Err(e)))?;
            }
        }
        Ok(block_count)
    }

    /// Starts a new in-progress piece, looking up its length, pad suffix
    /// and file extent.
    fn start_new_piece(
        &mut self,
        info: BlockInfo,
    ) -> std::result::Result<(), DiskError> {
        log::trace!("Creating piece {} write buffer", info.piece_index);

        let len = self
            .storage
            .piece_len(info.piece_index)
            .map_err(|_| DiskError::InvalidPieceIndex(info.piece_index))?;
        let pad_bytes = self
            .storage
            .pad_bytes_in_piece(info.piece_index)
            .map_err(|_| DiskError::InvalidPieceIndex(info.piece_index))?;
        if !self.piece_hashes.is_empty()
            && (info.piece_index + 1) * 20 > self.piece_hashes.len()
        {
            return Err(DiskError::InvalidPieceIndex(info.piece_index));
        }

        self.pieces.insert(
            info.piece_index,
            Piece {
                len,
                pad_bytes,
                blocks: BTreeMap::new(),
            },
        );
        Ok(())
    }

    /// Bundles everything the blocking verification needs for a piece.
    fn verification_context(&self, index: PieceIndex) -> VerificationContext {
        let expected_v1 = if self.piece_hashes.is_empty() {
            None
        } else {
            let pos = index * 20;
            let mut hash = [0; 20];
            hash.copy_from_slice(&self.piece_hashes[pos..pos + 20]);
            Some(hash)
        };

        // in v2 layouts a piece overlaps exactly one non-pad file
        let v2 = self
            .storage
            .files_intersecting_piece(index)
            .ok()
            .and_then(|range| {
                let piece_offset = self.storage.piece_offset(index);
                let blocks_per_piece =
                    (self.storage.piece_len / BLOCK_LEN) as usize;
                self.storage.files[range.clone()]
                    .iter()
                    .zip(range)
                    .find(|(file, file_index)| {
                        !file.attributes.pad
                            && self.trees[*file_index]
                                .lock()
                                .expect("tree lock poisoned")
                                .is_some()
                    })
                    .map(|(file, file_index)| V2Context {
                        file_index,
                        piece_in_file: ((piece_offset
                            - file.torrent_offset)
                            / self.storage.piece_len as u64)
                            as usize,
                        blocks_per_piece,
                    })
            });

        VerificationContext {
            expected_v1,
            v2,
            trees: Arc::clone(&self.trees),
            smart_ban_salt: self.smart_ban_salt,
            pad_bytes: self
                .storage
                .pad_bytes_in_piece(index)
                .unwrap_or(0) as usize,
        }
    }

    /// Serves a block read, from the cache when possible. In seed mode a
    /// piece is verified on its first request; a failure surfaces as a
    /// piece completion failure (the torrent downgrades out of seed mode)
    /// and the read is dropped.
    async fn read_block(
        &mut self,
        info: BlockInfo,
        result_chan: BlockReadSender,
    ) -> Result<()> {
        let needs_lazy_check = self
            .lazy_verify
            .as_ref()
            .map(|verified| {
                !verified.get(info.piece_index).copied().unwrap_or(true)
            })
            .unwrap_or(false);
        if needs_lazy_check {
            match self.verify_piece_on_disk(info.piece_index).await {
                Ok((HashResult::Pass, _)) => {
                    if let Some(verified) = &mut self.lazy_verify {
                        verified.set(info.piece_index, true);
                    }
                }
                Ok((result, salted_block_hashes)) => {
                    log::warn!(
                        "Seed mode piece {} failed its lazy check",
                        info.piece_index
                    );
                    self.alert_chan.send(TorrentAlert::PieceCompletion(
                        Ok(PieceCompletion {
                            index: info.piece_index,
                            blocks: Vec::new(),
                            result,
                            salted_block_hashes,
                        }),
                    ))?;
                    return Ok(());
                }
                Err(e) => {
                    self.alert_chan.send(TorrentAlert::ReadError {
                        block: info,
                        error: e,
                    })?;
                    return Ok(());
                }
            }
        }

        if let Some(data) = self.read_cache.get(&(info.piece_index, info.offset))
        {
            if data.len() == info.len as usize {
                log::trace!("Block {:?} served from cache", info);
                let _ = result_chan.send(BlockRead {
                    info,
                    data: data.clone(),
                });
                return Ok(());
            }
        }

        match self.read_range(info.piece_index, info.offset, info.len).await {
            Ok(data) => {
                self.read_cache
                    .put((info.piece_index, info.offset), data.clone());
                let _ = result_chan.send(BlockRead { info, data });
            }
            Err(e) => {
                log::warn!("Block {:?} read error: {}", info, e);
                self.alert_chan.send(TorrentAlert::ReadError {
                    block: info,
                    error: e,
                })?;
            }
        }
        Ok(())
    }

    /// Reads a byte range of a piece off the files it overlaps. Pad file
    /// and priority-0 ranges are served as zeros without touching disk.
    async fn read_range(
        &self,
        index: PieceIndex,
        offset: u32,
        len: u32,
    ) -> std::result::Result<Vec<u8>, DiskError> {
        let piece_len = self
            .storage
            .piece_len(index)
            .map_err(|_| DiskError::InvalidPieceIndex(index))?;
        if offset as u64 + len as u64 > piece_len as u64 {
            return Err(DiskError::InvalidBlock {
                piece_index: index,
                offset,
            });
        }
        let absolute = self.storage.piece_offset(index) + offset as u64;
        let range = absolute..absolute + len as u64;
        let file_range = self.storage.files_intersecting_bytes(range.clone());

        let files = Arc::clone(&self.files);
        let file_infos = self.storage.files.clone();
        let file_priorities = self.file_priorities.clone();
        task::spawn_blocking(move || {
            let mut data = vec![0; (range.end - range.start) as usize];
            for file_index in file_range {
                let info = &file_infos[file_index];
                let overlap_start = info.torrent_offset.max(range.start);
                let overlap_end = info.torrent_end_offset().min(range.end);
                if overlap_start >= overlap_end {
                    continue;
                }
                // pad bytes and unwanted files read as zeros
                if info.attributes.pad
                    || file_priorities.get(file_index) == Some(&0)
                {
                    continue;
                }
                let buf_start = (overlap_start - range.start) as usize;
                let buf_end = (overlap_end - range.start) as usize;
                let mut file = files[file_index]
                    .lock()
                    .expect("file lock poisoned");
                file.read_exact_at(
                    &mut data[buf_start..buf_end],
                    overlap_start - info.torrent_offset,
                    file_index,
                )?;
            }
            Ok(data)
        })
        .await
        .expect("disk IO read task panicked")
    }

    /// Reads a piece's data back from disk and verifies it, without any
    /// write buffer involvement (seed-mode lazy checks, resume checks).
    async fn hash_piece(&mut self, index: PieceIndex) -> Result<()> {
        let result = self.verify_piece_on_disk(index).await;
        match result {
            Ok((result, salted_block_hashes)) => {
                self.alert_chan.send(TorrentAlert::PieceCompletion(Ok(
                    PieceCompletion {
                        index,
                        blocks: Vec::new(),
                        result,
                        salted_block_hashes,
                    },
                )))?;
            }
            Err(e) => {
                self.alert_chan
                    .send(TorrentAlert::PieceCompletion(Err(e)))?;
            }
        }
        Ok(())
    }

    async fn verify_piece_on_disk(
        &mut self,
        index: PieceIndex,
    ) -> std::result::Result<(HashResult, Vec<Sha1Hash>), DiskError> {
        let piece_len = self
            .storage
            .piece_len(index)
            .map_err(|_| DiskError::InvalidPieceIndex(index))?;
        let pad_bytes = self
            .storage
            .pad_bytes_in_piece(index)
            .map_err(|_| DiskError::InvalidPieceIndex(index))?;
        let data_len = piece_len - pad_bytes;
        let data = self.read_range(index, 0, data_len).await?;
        let verification = self.verification_context(index);
        Ok(task::spawn_blocking(move || verification.verify(&data))
            .await
            .expect("disk hash task panicked"))
    }

    /// Scans all pieces on disk, reporting which are present and valid.
    async fn check_files(&mut self) -> Result<()> {
        let mut valid = Bitfield::with_capacity(self.storage.piece_count);
        valid.resize(self.storage.piece_count, false);
        for index in 0..self.storage.piece_count {
            // pieces of entirely unwanted files aren't checked
            let wanted = self
                .storage
                .piece_has_wanted_files(index, &self.file_priorities)
                .unwrap_or(false);
            let all_pad =
                self.storage.is_piece_all_pad(index).unwrap_or(false);
            if all_pad {
                valid.set(index, true);
                continue;
            }
            if !wanted {
                continue;
            }
            match self.verify_piece_on_disk(index).await {
                Ok((HashResult::Pass, _)) => valid.set(index, true),
                Ok(_) => {}
                // an absent file simply means the piece isn't there yet
                Err(DiskError::FileNotFound) => {}
                Err(e) => {
                    self.alert_chan
                        .send(TorrentAlert::FilesChecked(Err(e)))?;
                    return Ok(());
                }
            }
        }
        self.alert_chan
            .send(TorrentAlert::FilesChecked(Ok(valid)))?;
        Ok(())
    }

    fn move_storage(&mut self, new_dir: PathBuf) {
        self.release_files();
        let result = fs::rename(&self.storage.download_dir, &new_dir)
            .map(|_| new_dir.clone())
            .map_err(|e| DiskError::from_io(e, DiskOp::FileRename, None));
        if result.is_ok() {
            self.storage.download_dir = new_dir.clone();
            self.files = Arc::new(
                self.storage
                    .files
                    .iter()
                    .map(|info| {
                        Mutex::new(TorrentFile {
                            path: new_dir.join(&info.path),
                            handle: None,
                        })
                    })
                    .collect(),
            );
        }
        let _ = self.alert_chan.send(TorrentAlert::StorageMoved(result));
    }

    fn rename_file(&mut self, file_index: FileIndex, new_path: PathBuf) {
        if file_index >= self.storage.files.len() {
            return;
        }
        let old = self.storage.download_dir.join(
            &self.storage.files[file_index].path,
        );
        let new = self.storage.download_dir.join(&new_path);
        if old.exists() {
            if let Err(e) = fs::rename(&old, &new) {
                log::warn!("Failed to rename {:?}: {}", old, e);
                return;
            }
        }
        self.storage.files[file_index].path = new_path;
        let mut file = self.files[file_index]
            .lock()
            .expect("file lock poisoned");
        file.path = new;
        file.handle = None;
    }

    fn release_files(&mut self) {
        for file in self.files.iter() {
            file.lock().expect("file lock poisoned").handle = None;
        }
    }

    fn delete_files(&mut self) {
        self.release_files();
        for (file_index, info) in self.storage.files.iter().enumerate() {
            if info.attributes.pad {
                continue;
            }
            let path = self.storage.download_dir.join(&info.path);
            if path.exists() {
                if let Err(e) = fs::remove_file(&path) {
                    let _ = self.alert_chan.send(TorrentAlert::FilesDeleted(
                        Err(DiskError::from_io(
                            e,
                            DiskOp::FileRemove,
                            Some(file_index),
                        )),
                    ));
                    return;
                }
            }
        }
        // best effort removal of now-empty directories
        let _ = fs::remove_dir_all(&self.storage.download_dir);
        let _ = self.alert_chan.send(TorrentAlert::FilesDeleted(Ok(())));
    }
}

/// Everything the blocking verification of one piece needs.
struct VerificationContext {
    expected_v1: Option<Sha1Hash>,
    v2: Option<V2Context>,
    trees: SharedTrees,
    smart_ban_salt: u32,
    /// The length of the piece's pad suffix; zeros appended to the v1
    /// hash input.
    pad_bytes: usize,
}

struct V2Context {
    file_index: FileIndex,
    piece_in_file: usize,
    blocks_per_piece: usize,
}

impl VerificationContext {
    /// Verifies the piece's data (its non-pad bytes; the pad suffix is
    /// defined zero and appended to the v1 hash input here). Returns the
    /// verification result and the salted per-block hashes for corruption
    /// attribution.
    fn verify(&self, data: &[u8]) -> (HashResult, Vec<Sha1Hash>) {
        // salted block hashes, always computed so the torrent can compare
        // them across a failure and the eventual pass
        let salt = self.smart_ban_salt.to_be_bytes();
        let salted: Vec<Sha1Hash> = data
            .chunks(BLOCK_LEN as usize)
            .map(|block| {
                let mut hasher = Sha1::new();
                hasher.update(block);
                hasher.update(&salt);
                let mut hash = [0; 20];
                hash.copy_from_slice(&hasher.finalize());
                hash
            })
            .collect();

        let v1_pass = match &self.expected_v1 {
            Some(expected) => {
                let mut hasher = Sha1::new();
                hasher.update(data);
                // pad bytes are defined zero; they were never read off
                // disk or the wire
                let zeros = [0u8; 1024];
                let mut remaining = self.pad_bytes;
                while remaining > 0 {
                    let n = remaining.min(zeros.len());
                    hasher.update(&zeros[..n]);
                    remaining -= n;
                }
                hasher.finalize().as_slice() == expected
            }
            None => true,
        };

        let v2_result = match &self.v2 {
            Some(ctx) => {
                let mut tree_guard = self.trees[ctx.file_index]
                    .lock()
                    .expect("tree lock poisoned");
                let tree =
                    tree_guard.as_mut().expect("v2 context without tree");
                let base = ctx.piece_in_file * ctx.blocks_per_piece;
                let leaves: Vec<[u8; 32]> = data
                    .chunks(BLOCK_LEN as usize)
                    .map(|block| {
                        let mut leaf = [0; 32];
                        leaf.copy_from_slice(&Sha256::digest(block));
                        leaf
                    })
                    .collect();

                let mut bad_blocks = Vec::new();
                let mut piece_failed = false;
                let mut pending = false;
                for (i, leaf) in leaves.iter().enumerate() {
                    match tree.set_block_hash(base + i, *leaf) {
                        BlockHashResult::Success => {}
                        BlockHashResult::Unknown => pending = true,
                        BlockHashResult::BlockHashFailed => {
                            bad_blocks.push(i);
                        }
                        BlockHashResult::PieceHashFailed => {
                            piece_failed = true;
                        }
                    }
                }
                // A leaf offered before its last sibling comes back as
                // unknown; the offer that closes the subtree settles them
                // all. Re-offer the settled leaves to read off their
                // verdicts.
                if pending && !piece_failed && bad_blocks.is_empty() {
                    for (i, leaf) in leaves.iter().enumerate() {
                        match tree.set_block_hash(base + i, *leaf) {
                            BlockHashResult::Success => {}
                            BlockHashResult::BlockHashFailed => {
                                bad_blocks.push(i);
                            }
                            BlockHashResult::Unknown
                            | BlockHashResult::PieceHashFailed => {
                                piece_failed = true;
                            }
                        }
                    }
                }

                if !bad_blocks.is_empty() {
                    Some(HashResult::FailV2 { bad_blocks })
                } else if piece_failed {
                    Some(HashResult::FailV2Piece)
                } else {
                    None
                }
            }
            None => None,
        };

        let result = match (v1_pass, v2_result) {
            (true, None) => HashResult::Pass,
            (false, None) => HashResult::FailV1,
            // v2 attribution is strictly better than a v1 piece failure
            (_, Some(v2_fail)) => v2_fail,
        };
        (result, salted)
    }
}

/// An in-progress piece download that keeps in memory the so far
/// downloaded blocks and the expected hash of the piece.
struct Piece {
    /// The length of the piece, in bytes, pad suffix included.
    len: u32,
    /// The trailing bytes of the piece that fall in pad files. They are
    /// defined zero and never enter the write buffer.
    pad_bytes: u32,
    /// The so far downloaded blocks. Each block is mapped to its offset
    /// within piece; the BTreeMap keeps keys sorted, which matters when
    /// assembling the piece for hashing and writing.
    blocks: BTreeMap<u32, Vec<u8>>,
}

impl Piece {
    /// Places the block into the piece's write buffer. Returns false for a
    /// duplicate, which is dropped.
    fn enqueue_block(&mut self, offset: u32, data: Vec<u8>) -> bool {
        if self.blocks.contains_key(&offset) {
            log::warn!("Duplicate piece block at offset {}", offset);
            false
        } else {
            self.blocks.insert(offset, data);
            true
        }
    }

    /// Returns true if the piece has all its data blocks in its write
    /// buffer (the pad suffix never arrives; it is defined zero).
    fn is_complete(&self) -> bool {
        self.blocks.len() == block_count(self.len - self.pad_bytes)
    }

    /// Concatenates the buffered blocks into the piece's data bytes.
    fn assemble(&self) -> Vec<u8> {
        let mut data =
            Vec::with_capacity((self.len - self.pad_bytes) as usize);
        for block in self.blocks.values() {
            data.extend_from_slice(block);
        }
        data
    }
}

/// Writes a verified piece's data onto the files it overlaps. Pad file
/// ranges are skipped (never materialized), as are priority-0 files.
fn write_piece_data(
    data: &[u8],
    piece_offset: u64,
    file_infos: &[FileInfo],
    file_range: Range<FileIndex>,
    file_priorities: &[u8],
    files: &[Mutex<TorrentFile>],
) -> std::result::Result<(), DiskError> {
    let range = piece_offset..piece_offset + data.len() as u64;
    for file_index in file_range {
        let info = &file_infos[file_index];
        if info.attributes.pad {
            continue;
        }
        if file_priorities.get(file_index) == Some(&0) {
            continue;
        }
        let overlap_start = info.torrent_offset.max(range.start);
        let overlap_end = info.torrent_end_offset().min(range.end);
        if overlap_start >= overlap_end {
            continue;
        }
        let buf_start = (overlap_start - range.start) as usize;
        let buf_end = (overlap_end - range.start) as usize;
        let mut file = files[file_index].lock().expect("file lock poisoned");
        file.write_all_at(
            &data[buf_start..buf_end],
            overlap_start - info.torrent_offset,
            file_index,
        )?;
    }
    Ok(())
}

/// A file of the torrent and its lazily opened handle.
struct TorrentFile {
    path: PathBuf,
    handle: Option<File>,
}

impl TorrentFile {
    fn ensure_open(
        &mut self,
        create: bool,
        file_index: FileIndex,
    ) -> std::result::Result<&File, DiskError> {
        if self.handle.is_none() {
            if let (true, Some(parent)) = (create, self.path.parent()) {
                fs::create_dir_all(parent).map_err(|e| {
                    DiskError::from_io(e, DiskOp::DirCreate, Some(file_index))
                })?;
            }
            let handle = OpenOptions::new()
                .read(true)
                .write(create)
                .create(create)
                .open(&self.path)
                .map_err(|e| {
                    DiskError::from_io(e, DiskOp::FileOpen, Some(file_index))
                })?;
            self.handle = Some(handle);
        }
        Ok(self.handle.as_ref().expect("just opened"))
    }

    /// Positioned write of the whole buffer. IO syscalls are not
    /// guaranteed to write everything in one go, so this loops until all
    /// bytes are on their way to disk or an error occurs.
    fn write_all_at(
        &mut self,
        mut buf: &[u8],
        mut offset: u64,
        file_index: FileIndex,
    ) -> std::result::Result<(), DiskError> {
        let file = self.ensure_open(true, file_index)?;
        let fd = file.as_raw_fd();
        while !buf.is_empty() {
            let written = pwrite(fd, buf, offset as i64).map_err(|e| {
                log::warn!("File {:?} write error: {}", self.path, e);
                DiskError::from_io(
                    std::io::Error::from_raw_os_error(
                        e.as_errno().unwrap_or(nix::errno::Errno::EIO)
                            as i32,
                    ),
                    DiskOp::FileWrite,
                    Some(file_index),
                )
            })?;
            buf = &buf[written..];
            offset += written as u64;
        }
        Ok(())
    }

    /// Positioned read of exactly the buffer's length.
    fn read_exact_at(
        &mut self,
        mut buf: &mut [u8],
        mut offset: u64,
        file_index: FileIndex,
    ) -> std::result::Result<(), DiskError> {
        let file = self.ensure_open(false, file_index)?;
        let fd = file.as_raw_fd();
        while !buf.is_empty() {
            let read = pread(fd, buf, offset as i64).map_err(|e| {
                DiskError::from_io(
                    std::io::Error::from_raw_os_error(
                        e.as_errno().unwrap_or(nix::errno::Errno::EIO)
                            as i32,
                    ),
                    DiskOp::FileRead,
                    Some(file_index),
                )
            })?;
            if read == 0 {
                // the file is shorter than the layout says: bytes that
                // were never written read as zeros
                return Ok(());
            }
            buf = &mut buf[read..];
            offset += read as u64;
        }
        Ok(())
    }
}
