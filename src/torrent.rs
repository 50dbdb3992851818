//! The per-torrent coordination task.
//!
//! A torrent owns its peer sessions (by handle index, never by pointer),
//! routes disk completions into the piece picker, runs the corruption
//! attribution (ban) policy, and reports progress to the engine's alert
//! queue.

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use futures::{select, stream::Fuse, StreamExt};
use rand::Rng;
use tokio::{
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        RwLock,
    },
    task,
};

use crate::{
    alert::{self, Alert},
    conf::TorrentConf,
    disk::{
        DiskHandle, HashResult, PieceCompletion, TorrentAlert,
        TorrentAlertReceiver,
    },
    error::{PeerError, Result},
    merkle::MerkleTree,
    metainfo::Metainfo,
    peer::{self, codec::Handshake, PeerSession},
    piece_picker::PiecePicker,
    storage_info::StorageInfo,
    InfoHash, PeerId, PeerKey, PieceIndex, Sha1Hash, TorrentId,
};

/// The per-file sparse merkle trees of a v2 torrent, shared between the
/// torrent task and the disk workers (which update them during hash
/// verification).
pub(crate) type SharedTrees = Arc<Vec<Mutex<Option<MerkleTree>>>>;

/// Information shared with every peer session of the torrent. Immutable
/// after torrent startup.
pub(crate) struct SharedStatus {
    pub id: TorrentId,
    pub info_hash: InfoHash,
    pub client_id: PeerId,
    pub storage: StorageInfo,
    pub conf: TorrentConf,
}

/// The channel on which peer sessions notify their torrent.
pub(crate) type Sender = UnboundedSender<Event>;
type Receiver = UnboundedReceiver<Event>;

/// Events flowing from peer sessions to their torrent.
pub(crate) enum Event {
    /// The session ended; its outstanding requests have already been
    /// re-queued with the picker by the time this is visible.
    PeerDisconnected {
        key: PeerKey,
        reason: Option<PeerError>,
    },
}

/// The channel on which the engine commands a torrent.
pub(crate) type CommandSender = UnboundedSender<Command>;
type CommandReceiver = UnboundedReceiver<Command>;

pub(crate) enum Command {
    /// Connect to the given peers (from the host, a tracker, or the DHT).
    AddPeers(Vec<SocketAddr>),
    /// Take over an accepted connection whose handshake matched this
    /// torrent.
    AddInboundPeer {
        socket: tokio_util::codec::Framed<
            tokio::net::TcpStream,
            peer::codec::HandshakeCodec,
        >,
        handshake: Handshake,
    },
    /// Boost a piece to time-critical priority.
    SetPieceDeadline {
        index: PieceIndex,
        deadline: Duration,
        alert_when_available: bool,
    },
    SetPiecePriority {
        index: PieceIndex,
        priority: u8,
    },
    SetFilePriorities(Vec<u8>),
    /// Serialize the torrent's progress into resume data, delivered as an
    /// alert.
    SaveResumeData,
    Shutdown,
}

/// A record of who supplied a block of a piece that later failed its hash,
/// together with the salted hash of the data they sent. When the piece
/// finally passes, any record whose hash differs from the passing data's
/// hash identifies its peer as the one who sent corrupt bytes.
struct BanRecord {
    addr: SocketAddr,
    salted_hash: Sha1Hash,
}

struct PeerHandle {
    addr: SocketAddr,
    chan: peer::Sender,
}

pub(crate) struct Torrent {
    shared: Arc<SharedStatus>,
    piece_picker: Arc<RwLock<PiecePicker>>,
    trees: SharedTrees,
    disk: DiskHandle,
    disk_alert_port: Fuse<TorrentAlertReceiver>,
    /// Connected peer sessions, addressed by their dense key.
    peers: HashMap<PeerKey, PeerHandle>,
    next_peer_key: PeerKey,
    /// Known but not yet connected peer addresses.
    available_peers: Vec<SocketAddr>,
    /// Endpoints blacklisted for protocol violations or corruption, with
    /// the time the ban lifts.
    banned: HashMap<IpAddr, Instant>,
    /// Per-block corruption attribution records of failed pieces, keyed by
    /// piece and block index.
    ban_records: HashMap<(PieceIndex, usize), BanRecord>,
    /// The salt folded into attribution hashes, fixed per torrent so
    /// records stay comparable. Random so peers can't precompute forged
    /// collisions.
    smart_ban_salt: u32,
    /// Whether the torrent is in seed mode (trusting on-disk data until a
    /// lazy check fails).
    seed_mode: bool,
    /// Set when a fatal disk error pauses the torrent.
    paused: bool,
    /// The sender half of the session event channel, cloned into sessions.
    event_chan: Sender,
    event_port: Fuse<Receiver>,
    cmd_port: Fuse<CommandReceiver>,
    /// The engine-wide alert queue.
    alert_chan: alert::Sender,
    /// Per-file priorities, 0 meaning do-not-download.
    file_priorities: Vec<u8>,
}

impl Torrent {
    /// Creates the torrent. The caller has already allocated it with the
    /// disk task (which produced `disk_alert_port` and needed the same
    /// `smart_ban_salt`). Returns the torrent and the engine's command
    /// channel to it.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: TorrentId,
        info_hash: InfoHash,
        storage: StorageInfo,
        client_id: PeerId,
        conf: TorrentConf,
        disk: DiskHandle,
        disk_alert_port: TorrentAlertReceiver,
        alert_chan: alert::Sender,
        trees: SharedTrees,
        smart_ban_salt: u32,
    ) -> (Self, CommandSender) {
        let pad_bytes: Vec<u32> = (0..storage.piece_count)
            .map(|index| {
                storage.pad_bytes_in_piece(index).unwrap_or(0)
            })
            .collect();
        let mut rng = rand::thread_rng();
        let piece_picker = PiecePicker::new(
            storage.piece_count,
            storage.piece_len,
            storage.last_piece_len,
            pad_bytes,
            rng.gen(),
            conf.end_game_threshold,
            conf.end_game_block_peer_bound,
        );

        let file_priorities = vec![1; storage.files.len()];
        let seed_mode = conf.seed_mode;
        let shared = Arc::new(SharedStatus {
            id,
            info_hash,
            client_id,
            storage,
            conf,
        });

        let (event_chan, event_port) = mpsc::unbounded_channel();
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();

        (
            Self {
                shared,
                piece_picker: Arc::new(RwLock::new(piece_picker)),
                trees,
                disk,
                disk_alert_port: disk_alert_port.fuse(),
                peers: HashMap::new(),
                next_peer_key: 0,
                available_peers: Vec::new(),
                banned: HashMap::new(),
                ban_records: HashMap::new(),
                smart_ban_salt,
                seed_mode,
                paused: false,
                event_chan,
                event_port: event_port.fuse(),
                cmd_port: cmd_port.fuse(),
                alert_chan,
                file_priorities,
            },
            cmd_chan,
        )
    }

    /// The salt for this torrent's attribution hashes, to be passed to the
    /// disk task at allocation.
    pub fn smart_ban_salt(&self) -> u32 {
        self.smart_ban_salt
    }

    /// Applies a magnet-style file selection or any other initial file
    /// priorities before starting.
    pub fn set_initial_file_priorities(&mut self, priorities: Vec<u8>) {
        debug_assert_eq!(
            priorities.len(),
            self.shared.storage.files.len()
        );
        self.file_priorities = priorities;
        // must happen before start: the picker learns which pieces are
        // unwanted
    }

    /// Restores saved progress before starting. On divergence nothing is
    /// restored and the caller falls back to a full file check.
    pub async fn apply_resume(
        &mut self,
        resume: crate::resume::ResumeData,
    ) -> std::result::Result<(), crate::error::ResumeError> {
        resume.validate(
            &self.shared.info_hash,
            &self.shared.storage,
            false,
        )?;

        if resume.file_priorities.len() == self.shared.storage.files.len() {
            self.file_priorities = resume.file_priorities.clone();
        }
        let mut picker = self.piece_picker.write().await;
        let piece_count = self.shared.storage.piece_count;
        for (index, priority) in resume
            .piece_priorities
            .iter()
            .take(piece_count)
            .enumerate()
        {
            picker.set_piece_priority(index, (*priority).min(7));
        }
        for index in 0..piece_count {
            if resume.pieces[index] {
                picker.we_have(index);
            }
        }
        drop(picker);

        for (file_index, (hashes, mask)) in &resume.trees {
            if let Some(slot) = self.trees.get(*file_index) {
                if let Some(tree) =
                    slot.lock().expect("tree lock poisoned").as_mut()
                {
                    if !tree.load_sparse_tree(hashes, mask) {
                        log::warn!(
                            "Resume tree for file {} rejected",
                            file_index
                        );
                    }
                }
            }
        }

        self.available_peers.extend(resume.peers.iter().copied());
        Ok(())
    }

    /// Runs the torrent until shutdown.
    pub async fn start(&mut self) -> Result<()> {
        log::info!("Starting torrent {}", self.shared.id);

        self.apply_file_priorities().await;
        if self.seed_mode {
            // trust the files on disk; pieces entirely within unwanted
            // files are not claimed
            let mut picker = self.piece_picker.write().await;
            for index in 0..self.shared.storage.piece_count {
                let wanted = self
                    .shared
                    .storage
                    .piece_has_wanted_files(index, &self.file_priorities)
                    .unwrap_or(false);
                if wanted {
                    picker.we_have(index);
                }
            }
        }

        loop {
            select! {
                alert = self.disk_alert_port.select_next_some() => {
                    self.handle_disk_alert(alert).await?;
                }
                event = self.event_port.select_next_some() => {
                    match event {
                        Event::PeerDisconnected { key, reason } => {
                            self.handle_peer_disconnected(key, reason);
                        }
                    }
                }
                cmd = self.cmd_port.select_next_some() => {
                    if !self.handle_command(cmd).await? {
                        break;
                    }
                }
            }
        }

        log::info!("Torrent {} stopped", self.shared.id);
        Ok(())
    }

    /// Returns false when the torrent should stop.
    async fn handle_command(&mut self, cmd: Command) -> Result<bool> {
        match cmd {
            Command::AddPeers(addrs) => {
                for addr in addrs {
                    self.connect_peer(addr);
                }
            }
            Command::AddInboundPeer { socket, handshake } => {
                self.accept_peer(socket, handshake);
            }
            Command::SetPieceDeadline {
                index,
                deadline,
                alert_when_available,
            } => {
                self.piece_picker.write().await.set_piece_deadline(
                    index,
                    deadline,
                    alert_when_available,
                );
            }
            Command::SetPiecePriority { index, priority } => {
                self.piece_picker
                    .write()
                    .await
                    .set_piece_priority(index, priority);
            }
            Command::SetFilePriorities(priorities) => {
                if priorities.len() == self.shared.storage.files.len() {
                    self.file_priorities = priorities.clone();
                    let _ = self
                        .disk
                        .set_file_priorities(self.shared.id, priorities);
                    self.apply_file_priorities().await;
                }
            }
            Command::SaveResumeData => {
                let resume = self.build_resume_data().await;
                let _ = self.alert_chan.send(Alert::ResumeDataReady {
                    id: self.shared.id,
                    resume_data: resume,
                });
            }
            Command::Shutdown => {
                for peer in self.peers.values() {
                    let _ = peer.chan.send(peer::Command::Shutdown);
                }
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Folds the file priorities down to piece priorities: a piece
    /// overlapping no wanted file is excluded from picking.
    async fn apply_file_priorities(&mut self) {
        let mut picker = self.piece_picker.write().await;
        for index in 0..self.shared.storage.piece_count {
            let wanted = self
                .shared
                .storage
                .piece_has_wanted_files(index, &self.file_priorities)
                .unwrap_or(false);
            let all_pad = self
                .shared
                .storage
                .is_piece_all_pad(index)
                .unwrap_or(false);
            if !wanted && !all_pad {
                picker.set_piece_priority(index, 0);
            } else if picker.piece_priority(index) == 0 {
                picker.set_piece_priority(index, 1);
            }
        }
    }

    fn is_banned(&mut self, addr: &SocketAddr) -> bool {
        match self.banned.get(&addr.ip()) {
            Some(until) if *until > Instant::now() => true,
            Some(_) => {
                self.banned.remove(&addr.ip());
                false
            }
            None => false,
        }
    }

    fn connect_peer(&mut self, addr: SocketAddr) {
        if self.paused
            || self.peers.len() >= self.shared.conf.max_connected_peer_count
        {
            self.available_peers.push(addr);
            return;
        }
        if self.is_banned(&addr)
            || self.peers.values().any(|peer| peer.addr == addr)
        {
            return;
        }

        let key = self.next_peer_key;
        self.next_peer_key += 1;
        let (mut session, chan) = PeerSession::new(
            Arc::clone(&self.shared),
            Arc::clone(&self.piece_picker),
            self.disk.clone(),
            self.event_chan.clone(),
            addr,
            key,
        );
        self.peers.insert(key, PeerHandle { addr, chan });
        task::spawn(async move { session.start_outbound().await });
    }

    fn accept_peer(
        &mut self,
        socket: tokio_util::codec::Framed<
            tokio::net::TcpStream,
            peer::codec::HandshakeCodec,
        >,
        handshake: Handshake,
    ) {
        let addr = match socket.get_ref().peer_addr() {
            Ok(addr) => addr,
            Err(_) => return,
        };
        if self.paused
            || self.is_banned(&addr)
            || self.peers.len() >= self.shared.conf.max_connected_peer_count
        {
            return;
        }

        let key = self.next_peer_key;
        self.next_peer_key += 1;
        let (mut session, chan) = PeerSession::new(
            Arc::clone(&self.shared),
            Arc::clone(&self.piece_picker),
            self.disk.clone(),
            self.event_chan.clone(),
            addr,
            key,
        );
        self.peers.insert(key, PeerHandle { addr, chan });
        task::spawn(async move {
            session.start_inbound(socket, handshake).await
        });
    }

    fn handle_peer_disconnected(
        &mut self,
        key: PeerKey,
        reason: Option<PeerError>,
    ) {
        let peer = match self.peers.remove(&key) {
            Some(peer) => peer,
            None => return,
        };
        log::info!(
            "Torrent {} peer {} disconnected",
            self.shared.id,
            peer.addr
        );

        // protocol violations blacklist the endpoint for a while
        if let Some(reason) = &reason {
            if matches!(
                reason,
                PeerError::DuplicateBitfield
                    | PeerError::InvalidHaveAll
                    | PeerError::InvalidReject
                    | PeerError::InvalidRequest
                    | PeerError::InvalidPiece
                    | PeerError::InvalidCancel
                    | PeerError::InvalidMessage
            ) {
                self.ban_ip(peer.addr.ip());
            }
            let _ = self.alert_chan.send(Alert::PeerError {
                id: self.shared.id,
                addr: peer.addr,
                error: reason.clone(),
            });
        }

        // backfill the connection slot
        if let Some(addr) = self.available_peers.pop() {
            self.connect_peer(addr);
        }
    }

    fn ban_ip(&mut self, ip: IpAddr) {
        log::warn!("Torrent {} banning peer {}", self.shared.id, ip);
        self.banned
            .insert(ip, Instant::now() + self.shared.conf.ban_duration);
        let _ = self.alert_chan.send(Alert::PeerBanned {
            id: self.shared.id,
            ip,
        });
    }

    fn ban_peer(&mut self, key: PeerKey) {
        if let Some(peer) = self.peers.get(&key) {
            let ip = peer.addr.ip();
            let _ = peer.chan.send(peer::Command::Shutdown);
            self.ban_ip(ip);
        }
    }

    async fn handle_disk_alert(&mut self, alert: TorrentAlert) -> Result<()> {
        match alert {
            TorrentAlert::PieceCompletion(Ok(completion)) => {
                self.handle_piece_completion(completion).await?;
            }
            TorrentAlert::PieceCompletion(Err(e)) => {
                log::warn!(
                    "Torrent {} disk error: {}",
                    self.shared.id,
                    e
                );
                if e.is_fatal() {
                    // unrecoverable: pause the torrent
                    self.paused = true;
                    let _ = self.alert_chan.send(Alert::TorrentError {
                        id: self.shared.id,
                        error: e.to_string(),
                    });
                    for peer in self.peers.values() {
                        let _ = peer.chan.send(peer::Command::Shutdown);
                    }
                }
            }
            TorrentAlert::WriteQueueDrained => {
                // sessions poll the congestion flag on their tick; nothing
                // further to route
            }
            TorrentAlert::ReadError { block, error } => {
                log::warn!(
                    "Torrent {} read error at {:?}: {}",
                    self.shared.id,
                    block,
                    error
                );
            }
            TorrentAlert::FilesChecked(Ok(valid)) => {
                let mut picker = self.piece_picker.write().await;
                for index in 0..valid.len() {
                    if valid[index] {
                        picker.we_have(index);
                    }
                }
                let _ = self.alert_chan.send(Alert::FilesChecked {
                    id: self.shared.id,
                    num_valid: valid.count_ones(),
                });
            }
            TorrentAlert::FilesChecked(Err(e)) => {
                let _ = self.alert_chan.send(Alert::TorrentError {
                    id: self.shared.id,
                    error: e.to_string(),
                });
            }
            TorrentAlert::StorageMoved(result) => {
                let _ = self.alert_chan.send(Alert::StorageMoved {
                    id: self.shared.id,
                    result: result.map_err(|e| e.to_string()),
                });
            }
            TorrentAlert::FilesDeleted(result) => {
                let _ = self.alert_chan.send(Alert::FilesDeleted {
                    id: self.shared.id,
                    result: result.map_err(|e| e.to_string()),
                });
            }
        }
        Ok(())
    }

    /// Routes a piece's verification outcome into the picker and the ban
    /// policy.
    async fn handle_piece_completion(
        &mut self,
        completion: PieceCompletion,
    ) -> Result<()> {
        let index = completion.index;
        let mut picker = self.piece_picker.write().await;
        for block in &completion.blocks {
            picker.mark_as_finished(*block);
        }

        match completion.result {
            HashResult::Pass => {
                // a pass after an earlier failure: any recorded block whose
                // salted hash doesn't match the now-known-good data was
                // corrupt, and its supplier is banned
                let mut culprits: Vec<SocketAddr> = Vec::new();
                for (block, good_hash) in
                    completion.salted_block_hashes.iter().enumerate()
                {
                    if let Some(record) =
                        self.ban_records.remove(&(index, block))
                    {
                        if record.salted_hash != *good_hash {
                            culprits.push(record.addr);
                        }
                    }
                }
                self.ban_records.retain(|(piece, _), _| *piece != index);

                picker.we_have(index);
                let complete = picker.is_complete();
                let alert_wanted = picker.alert_when_available(index);
                drop(picker);

                for addr in culprits {
                    self.ban_ip(addr.ip());
                }

                log::info!(
                    "Torrent {} piece {} complete",
                    self.shared.id,
                    index
                );
                for peer in self.peers.values() {
                    let _ =
                        peer.chan.send(peer::Command::PieceCompleted(index));
                }
                if alert_wanted {
                    let _ = self.alert_chan.send(Alert::PieceFinished {
                        id: self.shared.id,
                        index,
                    });
                }
                if complete {
                    log::info!("Torrent {} complete", self.shared.id);
                    let _ = self.alert_chan.send(Alert::TorrentComplete {
                        id: self.shared.id,
                    });
                }
            }
            HashResult::FailV1 => {
                if self.seed_mode {
                    drop(picker);
                    self.downgrade_seed_mode(index).await;
                    return Ok(());
                }
                // record who sent what for later attribution, then forget
                // the piece
                let downloaders = picker.restore_piece(index);
                drop(picker);
                for (block, owner) in downloaders.iter().enumerate() {
                    let addr = owner
                        .and_then(|key| self.peers.get(&key))
                        .map(|peer| peer.addr);
                    if let (Some(addr), Some(salted_hash)) = (
                        addr,
                        completion.salted_block_hashes.get(block),
                    ) {
                        self.ban_records.insert(
                            (index, block),
                            BanRecord {
                                addr,
                                salted_hash: *salted_hash,
                            },
                        );
                    }
                }
                let _ = self.alert_chan.send(Alert::PieceHashFailed {
                    id: self.shared.id,
                    index,
                });
            }
            HashResult::FailV2 { bad_blocks } => {
                if self.seed_mode {
                    drop(picker);
                    self.downgrade_seed_mode(index).await;
                    return Ok(());
                }
                // the merkle tree pinpointed the corrupt blocks: revert
                // only those and ban exactly their suppliers
                let downloaders = picker.get_downloaders(index);
                let mut culprits = Vec::new();
                for block in bad_blocks {
                    if let Some(Some(key)) = downloaders.get(block) {
                        culprits.push(*key);
                    }
                    picker.revert_block(crate::BlockInfo {
                        piece_index: index,
                        offset: block as u32 * crate::BLOCK_LEN,
                        len: crate::block_len(
                            self.shared
                                .storage
                                .piece_len(index)
                                .unwrap_or(crate::BLOCK_LEN),
                            block,
                        ),
                    });
                }
                drop(picker);
                for key in culprits {
                    self.ban_peer(key);
                }
                let _ = self.alert_chan.send(Alert::PieceHashFailed {
                    id: self.shared.id,
                    index,
                });
            }
            HashResult::FailV2Piece => {
                if self.seed_mode {
                    drop(picker);
                    self.downgrade_seed_mode(index).await;
                    return Ok(());
                }
                picker.restore_piece(index);
                drop(picker);
                let _ = self.alert_chan.send(Alert::PieceHashFailed {
                    id: self.shared.id,
                    index,
                });
            }
        }
        Ok(())
    }

    /// A lazy seed-mode check failed: leave seed mode and re-download the
    /// piece like a normal torrent would.
    async fn downgrade_seed_mode(&mut self, index: PieceIndex) {
        log::warn!(
            "Torrent {} leaving seed mode: piece {} failed its check",
            self.shared.id,
            index
        );
        self.seed_mode = false;
        self.piece_picker.write().await.we_dont_have(index);
        let _ = self.alert_chan.send(Alert::SeedModeDowngraded {
            id: self.shared.id,
            index,
        });
    }

    /// Snapshots the torrent's progress for resume data.
    async fn build_resume_data(&self) -> crate::resume::ResumeData {
        let picker = self.piece_picker.read().await;
        let own_pieces = picker.own_pieces();
        let piece_priorities: Vec<u8> = (0..self.shared.storage.piece_count)
            .map(|index| picker.piece_priority(index))
            .collect();
        drop(picker);

        let trees = self
            .trees
            .iter()
            .enumerate()
            .filter_map(|(file_index, tree)| {
                tree.lock()
                    .expect("tree lock poisoned")
                    .as_ref()
                    .map(|tree| (file_index, tree.to_sparse()))
            })
            .collect();

        crate::resume::ResumeData::new(
            self.shared.info_hash,
            own_pieces,
            piece_priorities,
            self.file_priorities.clone(),
            self.peers.values().map(|peer| peer.addr).collect(),
            trees,
            &self.shared.storage,
        )
    }

    /// Exposes the picker to the engine for tests and status queries.
    #[cfg(test)]
    pub(crate) fn piece_picker(&self) -> &Arc<RwLock<PiecePicker>> {
        &self.piece_picker
    }
}

/// Builds the shared merkle trees for a torrent out of parsed metainfo,
/// moving the trees out of it.
pub(crate) fn shared_trees(metainfo: &mut Metainfo) -> SharedTrees {
    let trees = std::mem::take(&mut metainfo.trees);
    Arc::new(trees.into_iter().map(Mutex::new).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{conf::Conf, disk, resume::ResumeData, BlockInfo, BLOCK_LEN};

    /// A two-piece single-file layout with four blocks per piece, enough
    /// to play out the corruption attribution scenarios.
    fn test_storage(dir: &std::path::Path) -> StorageInfo {
        let piece_len = 4 * BLOCK_LEN;
        StorageInfo {
            piece_count: 2,
            piece_len,
            last_piece_len: piece_len,
            download_len: 2 * piece_len as u64,
            download_dir: dir.to_path_buf(),
            files: vec![crate::FileInfo {
                path: "data".into(),
                len: 2 * piece_len as u64,
                torrent_offset: 0,
                attributes: Default::default(),
                symlink_target: None,
                pieces_root: None,
            }],
        }
    }

    /// Builds a torrent without going through the engine: a disk task
    /// exists for the handle but nothing is allocated on it, and the
    /// torrent's event loop is not running (tests drive its handlers
    /// directly).
    async fn test_torrent(
        name: &str,
        seed_mode: bool,
    ) -> (Torrent, alert::Receiver) {
        let dir = std::env::temp_dir().join(format!(
            "swarmbit-torrent-{}-{}",
            name,
            std::process::id()
        ));
        let mut conf = Conf::new(&dir);
        conf.torrent.seed_mode = seed_mode;
        let (_join, disk_handle, _disk_alerts) =
            disk::spawn(conf.disk.clone()).unwrap();
        let (_torrent_alert_chan, torrent_alert_port) =
            mpsc::unbounded_channel();
        let (alert_chan, alert_port) = mpsc::unbounded_channel();
        let trees: SharedTrees = Arc::new(vec![Mutex::new(None)]);
        let (torrent, _cmd_chan) = Torrent::new(
            0,
            InfoHash::new_v1([0xab; 20]),
            test_storage(&dir),
            *crate::conf::SWARMBIT_CLIENT_ID,
            conf.torrent.clone(),
            disk_handle,
            torrent_alert_port,
            alert_chan,
            trees,
            0,
        );
        (torrent, alert_port)
    }

    /// Registers a fake connected peer, returning its command port.
    fn add_peer(
        torrent: &mut Torrent,
        key: PeerKey,
        addr: &str,
    ) -> UnboundedReceiver<peer::Command> {
        let (chan, port) = mpsc::unbounded_channel();
        torrent.peers.insert(
            key,
            PeerHandle {
                addr: addr.parse().unwrap(),
                chan,
            },
        );
        port
    }

    fn piece_blocks(piece: PieceIndex) -> Vec<BlockInfo> {
        (0..4)
            .map(|block| BlockInfo {
                piece_index: piece,
                offset: block as u32 * BLOCK_LEN,
                len: BLOCK_LEN,
            })
            .collect()
    }

    /// Plays the given peers supplying the given blocks of piece 0 into
    /// the picker, up to the writing state (the completion alert marks
    /// them finished).
    async fn supply_blocks(
        torrent: &Torrent,
        owners: &[(PeerKey, std::ops::Range<usize>)],
    ) {
        let mut picker = torrent.piece_picker.write().await;
        for (peer, blocks) in owners {
            for block in blocks.clone() {
                let info = BlockInfo {
                    piece_index: 0,
                    offset: block as u32 * BLOCK_LEN,
                    len: BLOCK_LEN,
                };
                assert!(picker.mark_as_downloading(info, *peer));
                assert!(picker.mark_as_writing(info, *peer));
            }
        }
    }

    // Two peers each supply two of a piece's four blocks; peer A's second
    // block is corrupt. The v1 hash failure alone can't attribute blame,
    // so the salted block hashes are recorded; once the piece finally
    // passes, the recorded hash that disagrees with the good data
    // identifies peer A, and peer B is left alone.
    #[tokio::test]
    async fn test_smart_ban_v1_attribution() {
        let (mut torrent, mut alerts) =
            test_torrent("smart-ban-v1", false).await;
        let a_ip: IpAddr = "10.0.0.1".parse().unwrap();
        let b_ip: IpAddr = "10.0.0.2".parse().unwrap();
        let _a_port = add_peer(&mut torrent, 0, "10.0.0.1:6881");
        let _b_port = add_peer(&mut torrent, 1, "10.0.0.2:6881");

        supply_blocks(&torrent, &[(0, 0..2), (1, 2..4)]).await;
        // block 1 carries peer A's corrupt bytes
        let fail_salted = vec![[0; 20], [9; 20], [2; 20], [3; 20]];
        torrent
            .handle_piece_completion(PieceCompletion {
                index: 0,
                blocks: piece_blocks(0),
                result: HashResult::FailV1,
                salted_block_hashes: fail_salted,
            })
            .await
            .unwrap();

        // no attribution yet, but every block's supplier is on record and
        // the piece was forgotten for re-download
        assert!(torrent.banned.is_empty());
        assert_eq!(torrent.ban_records.len(), 4);
        assert!(torrent
            .piece_picker
            .read()
            .await
            .get_downloaders(0)
            .is_empty());

        // the piece is re-downloaded (all of it from peer B) and passes;
        // only block 1's salted hash changed
        supply_blocks(&torrent, &[(1, 0..4)]).await;
        let pass_salted = vec![[0; 20], [1; 20], [2; 20], [3; 20]];
        torrent
            .handle_piece_completion(PieceCompletion {
                index: 0,
                blocks: piece_blocks(0),
                result: HashResult::Pass,
                salted_block_hashes: pass_salted,
            })
            .await
            .unwrap();

        // peer A is banned, peer B is not
        assert!(torrent.banned.contains_key(&a_ip));
        assert!(!torrent.banned.contains_key(&b_ip));
        assert!(torrent.ban_records.is_empty());
        assert!(torrent.piece_picker.read().await.have_piece(0));

        // the ban surfaced on the alert queue
        let mut saw_ban = false;
        while let Ok(alert) = alerts.try_recv() {
            if let Alert::PeerBanned { ip, .. } = alert {
                assert_eq!(ip, a_ip);
                saw_ban = true;
            }
        }
        assert!(saw_ban);
    }

    // The v2 variant: the merkle tree pinpointed block 1, so its supplier
    // is banned immediately, only that block is reverted, and the other
    // peer's finished blocks are untouched.
    #[tokio::test]
    async fn test_smart_ban_v2_exact_attribution() {
        let (mut torrent, _alerts) =
            test_torrent("smart-ban-v2", false).await;
        let a_ip: IpAddr = "10.0.0.1".parse().unwrap();
        let b_ip: IpAddr = "10.0.0.2".parse().unwrap();
        let mut a_port = add_peer(&mut torrent, 0, "10.0.0.1:6881");
        let mut b_port = add_peer(&mut torrent, 1, "10.0.0.2:6881");

        supply_blocks(&torrent, &[(0, 0..2), (1, 2..4)]).await;
        torrent
            .handle_piece_completion(PieceCompletion {
                index: 0,
                blocks: piece_blocks(0),
                result: HashResult::FailV2 {
                    bad_blocks: vec![1],
                },
                salted_block_hashes: Vec::new(),
            })
            .await
            .unwrap();

        // peer A banned without any re-download round, peer B untouched
        assert!(torrent.banned.contains_key(&a_ip));
        assert!(!torrent.banned.contains_key(&b_ip));
        // A's session is being shut down, B's is not
        assert!(matches!(
            a_port.try_recv(),
            Ok(peer::Command::Shutdown)
        ));
        assert!(b_port.try_recv().is_err());

        // only block 1 was reverted; the rest keep their progress
        let picker = torrent.piece_picker.read().await;
        assert_eq!(
            picker.get_downloaders(0),
            vec![Some(0), None, Some(1), Some(1)]
        );
    }

    #[tokio::test]
    async fn test_ban_expiry_and_reconnect_refusal() {
        let (mut torrent, _alerts) = test_torrent("ban-expiry", false).await;
        let addr: SocketAddr = "10.0.0.3:6881".parse().unwrap();

        torrent.ban_ip(addr.ip());
        assert!(torrent.is_banned(&addr));
        // a banned endpoint doesn't get a session
        torrent.connect_peer(addr);
        assert!(torrent.peers.is_empty());

        // once the window lapses the entry is cleaned up and the peer may
        // come back
        torrent.banned.insert(addr.ip(), Instant::now());
        assert!(!torrent.is_banned(&addr));
        assert!(torrent.banned.is_empty());
    }

    // A failed lazy check drops the torrent out of seed mode and marks
    // the piece missing again.
    #[tokio::test]
    async fn test_seed_mode_downgrade() {
        let (mut torrent, mut alerts) =
            test_torrent("seed-downgrade", true).await;
        torrent.piece_picker.write().await.we_have(0);
        assert!(torrent.seed_mode);

        torrent
            .handle_piece_completion(PieceCompletion {
                index: 0,
                blocks: Vec::new(),
                result: HashResult::FailV1,
                salted_block_hashes: Vec::new(),
            })
            .await
            .unwrap();

        assert!(!torrent.seed_mode);
        assert!(!torrent.piece_picker.read().await.have_piece(0));
        assert!(matches!(
            alerts.try_recv(),
            Ok(Alert::SeedModeDowngraded { index: 0, .. })
        ));
    }

    #[test]
    fn test_shared_trees_moves_metainfo_trees() {
        let buf = crate::metainfo::tests::v2_fixture(4);
        let mut metainfo = Metainfo::from_bytes(&buf).unwrap();
        let trees = shared_trees(&mut metainfo);
        assert_eq!(trees.len(), 1);
        assert!(trees[0].lock().unwrap().is_some());
        // the metainfo no longer owns them
        assert!(metainfo.trees.is_empty());
    }

    // A fully seeding torrent restored from resume data reports complete
    // without hashing anything off disk.
    #[tokio::test]
    async fn test_resume_restores_seeding_state() {
        let dir = std::env::temp_dir().join(format!(
            "swarmbit-torrent-resume-test-{}",
            std::process::id()
        ));
        let conf = Conf::new(&dir);
        let (_join, disk_handle, mut disk_alerts) =
            disk::spawn(conf.disk.clone()).unwrap();

        let buf = crate::metainfo::tests::v2_fixture(4);
        let mut metainfo = Metainfo::from_bytes(&buf).unwrap();
        let storage = StorageInfo::new(&metainfo, dir.clone());
        let trees = shared_trees(&mut metainfo);

        disk_handle
            .allocate_new_torrent(
                0,
                storage.clone(),
                metainfo.piece_hashes.clone(),
                Arc::clone(&trees),
                vec![1; storage.files.len()],
                0,
                false,
            )
            .unwrap();
        let alert_port = match disk_alerts.recv().await.unwrap() {
            disk::Alert::TorrentAllocation(Ok(allocation)) => {
                allocation.alert_port
            }
            _ => panic!("allocation failed"),
        };

        let (mut torrent, _cmd_chan) = Torrent::new(
            0,
            metainfo.info_hash,
            storage.clone(),
            *crate::conf::SWARMBIT_CLIENT_ID,
            conf.torrent.clone(),
            disk_handle,
            alert_port,
            mpsc::unbounded_channel().0,
            Arc::clone(&trees),
            0,
        );

        // resume data claiming everything is had
        let mut pieces = crate::Bitfield::with_capacity(4);
        pieces.resize(4, true);
        let resume = ResumeData::new(
            metainfo.info_hash,
            pieces,
            vec![1; 4],
            vec![1; storage.files.len()],
            Vec::new(),
            Vec::new(),
            &storage,
        );

        torrent.apply_resume(resume).await.unwrap();
        let picker = torrent.piece_picker().read().await;
        assert!(picker.is_complete());
        assert_eq!(picker.num_have(), 4);

        std::fs::remove_dir_all(&dir).ok();
    }
}
