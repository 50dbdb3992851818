//! The engine: the session object owning every torrent, the disk task,
//! the inbound listener, and the alert queue to the host.
//!
//! Torrents are addressed by their [`TorrentId`]; nothing in the engine
//! holds owning pointers across subsystem boundaries. The host drives the
//! engine through an [`EngineHandle`] and consumes events off the alert
//! receiver.

use std::{collections::HashMap, net::SocketAddr, time::Duration};

use futures::{select, stream::Fuse, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task, time,
};
use tokio_util::codec::Framed;

use crate::{
    alert::{self, Alert, AlertCategory},
    conf::Conf,
    disk::{self, DiskHandle},
    error::{Error, Result},
    metainfo::{magnet::MagnetUri, Metainfo},
    peer::codec::{Handshake, HandshakeCodec},
    piece_picker::Priority,
    resume::ResumeData,
    storage_info::StorageInfo,
    torrent::{self, Torrent},
    InfoHash, PieceIndex, TorrentId,
};

/// How long an inbound connection gets to present its handshake.
const INBOUND_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Spawns the engine and returns the handle the host drives it with and
/// the alert queue it listens on.
pub fn spawn(conf: Conf) -> Result<(EngineHandle, alert::Receiver)> {
    let (disk_join, disk, disk_alert_port) = disk::spawn(conf.disk.clone())?;
    let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
    let (host_alert_chan, host_alert_port) = mpsc::unbounded_channel();
    let (internal_alert_chan, internal_alert_port) =
        mpsc::unbounded_channel();

    let mut engine = Engine {
        conf,
        disk,
        disk_alert_port: disk_alert_port.fuse(),
        cmd_chan: cmd_chan.clone(),
        cmd_port: cmd_port.fuse(),
        internal_alert_chan,
        internal_alert_port: internal_alert_port.fuse(),
        host_alert_chan,
        alert_mask: AlertCategory::ALL,
        torrents: HashMap::new(),
        pending_allocations: HashMap::new(),
        pending_magnets: HashMap::new(),
        next_torrent_id: 0,
    };
    task::spawn(async move {
        if let Err(e) = engine.run().await {
            log::error!("Engine stopped with error: {}", e);
        }
        drop(disk_join);
    });

    Ok((EngineHandle { cmd_chan }, host_alert_port))
}

/// The host's handle to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    cmd_chan: CommandSender,
}

impl EngineHandle {
    /// Adds a torrent from parsed metainfo. Parse and validation errors
    /// are the host's to handle before this point
    /// ([`Metainfo::from_bytes`]); allocation failures surface as alerts.
    pub fn add_torrent(
        &self,
        metainfo: Metainfo,
        resume: Option<ResumeData>,
    ) -> Result<()> {
        self.cmd_chan
            .send(Command::AddTorrent {
                metainfo: Box::new(metainfo),
                resume,
            })
            .map_err(Error::from)
    }

    /// Adds a magnet link. The torrent stays metadata-pending (its picker
    /// inert) until the host provides the info dictionary with
    /// [`Self::provide_metainfo`].
    pub fn add_magnet(&self, uri: &str) -> Result<()> {
        let magnet = MagnetUri::parse(uri)?;
        self.cmd_chan
            .send(Command::AddMagnet(Box::new(magnet)))
            .map_err(Error::from)
    }

    /// Completes a metadata-pending torrent with its metainfo (e.g.
    /// fetched out of band or through an extension by the host).
    pub fn provide_metainfo(
        &self,
        id: TorrentId,
        metainfo: Metainfo,
    ) -> Result<()> {
        self.cmd_chan
            .send(Command::ProvideMetainfo {
                id,
                metainfo: Box::new(metainfo),
            })
            .map_err(Error::from)
    }

    /// Hands the torrent peer addresses to connect to (from the host, a
    /// tracker, or the DHT).
    pub fn add_peers(
        &self,
        id: TorrentId,
        peers: Vec<SocketAddr>,
    ) -> Result<()> {
        self.cmd_chan
            .send(Command::AddPeers { id, peers })
            .map_err(Error::from)
    }

    /// Boosts a piece to time-critical priority with a deadline.
    pub fn set_piece_deadline(
        &self,
        id: TorrentId,
        index: PieceIndex,
        deadline: Duration,
        alert_when_available: bool,
    ) -> Result<()> {
        self.cmd_chan
            .send(Command::Torrent {
                id,
                cmd: torrent::Command::SetPieceDeadline {
                    index,
                    deadline,
                    alert_when_available,
                },
            })
            .map_err(Error::from)
    }

    pub fn set_piece_priority(
        &self,
        id: TorrentId,
        index: PieceIndex,
        priority: Priority,
    ) -> Result<()> {
        self.cmd_chan
            .send(Command::Torrent {
                id,
                cmd: torrent::Command::SetPiecePriority { index, priority },
            })
            .map_err(Error::from)
    }

    pub fn set_file_priorities(
        &self,
        id: TorrentId,
        priorities: Vec<u8>,
    ) -> Result<()> {
        self.cmd_chan
            .send(Command::Torrent {
                id,
                cmd: torrent::Command::SetFilePriorities(priorities),
            })
            .map_err(Error::from)
    }

    /// Requests the torrent's resume data; it arrives as a
    /// [`Alert::ResumeDataReady`].
    pub fn save_resume_data(&self, id: TorrentId) -> Result<()> {
        self.cmd_chan
            .send(Command::Torrent {
                id,
                cmd: torrent::Command::SaveResumeData,
            })
            .map_err(Error::from)
    }

    /// Stops and removes a torrent. Its files stay on disk.
    pub fn remove_torrent(&self, id: TorrentId) -> Result<()> {
        self.cmd_chan
            .send(Command::RemoveTorrent { id })
            .map_err(Error::from)
    }

    /// Restricts which alert categories are delivered to the host.
    pub fn set_alert_mask(&self, mask: AlertCategory) -> Result<()> {
        self.cmd_chan
            .send(Command::SetAlertMask(mask))
            .map_err(Error::from)
    }

    /// Gracefully shuts the engine down: all torrents stop, pending
    /// writes flush, and the disk task exits.
    pub fn shutdown(&self) -> Result<()> {
        self.cmd_chan.send(Command::Shutdown).map_err(Error::from)
    }
}

type CommandSender = UnboundedSender<Command>;
type CommandReceiver = UnboundedReceiver<Command>;

enum Command {
    AddTorrent {
        metainfo: Box<Metainfo>,
        resume: Option<ResumeData>,
    },
    AddMagnet(Box<MagnetUri>),
    ProvideMetainfo {
        id: TorrentId,
        metainfo: Box<Metainfo>,
    },
    AddPeers {
        id: TorrentId,
        peers: Vec<SocketAddr>,
    },
    Torrent {
        id: TorrentId,
        cmd: torrent::Command,
    },
    RemoveTorrent {
        id: TorrentId,
    },
    InboundPeer {
        socket: Framed<TcpStream, HandshakeCodec>,
        handshake: Handshake,
    },
    SetAlertMask(AlertCategory),
    Shutdown,
}

/// A torrent known to the engine.
struct TorrentEntry {
    info_hash: InfoHash,
    cmd_chan: torrent::CommandSender,
}

/// A torrent whose disk allocation is in flight.
struct PendingAllocation {
    metainfo: Box<Metainfo>,
    storage: StorageInfo,
    trees: torrent::SharedTrees,
    smart_ban_salt: u32,
    resume: Option<ResumeData>,
    file_priorities: Option<Vec<u8>>,
    peers: Vec<SocketAddr>,
}

/// A magnet-added torrent waiting for its metadata.
struct PendingMagnet {
    magnet: Box<MagnetUri>,
}

struct Engine {
    conf: Conf,
    disk: DiskHandle,
    disk_alert_port: Fuse<disk::AlertReceiver>,
    cmd_chan: CommandSender,
    cmd_port: Fuse<CommandReceiver>,
    /// The queue all subsystems produce alerts into.
    internal_alert_chan: alert::Sender,
    internal_alert_port: Fuse<UnboundedReceiver<Alert>>,
    /// The filtered queue the host consumes.
    host_alert_chan: alert::Sender,
    alert_mask: AlertCategory,
    torrents: HashMap<TorrentId, TorrentEntry>,
    pending_allocations: HashMap<TorrentId, PendingAllocation>,
    pending_magnets: HashMap<TorrentId, PendingMagnet>,
    next_torrent_id: TorrentId,
}

impl Engine {
    async fn run(&mut self) -> Result<()> {
        log::info!("Starting engine");

        if let Some(listen_addr) = self.conf.engine.listen_addr {
            self.spawn_listener(listen_addr);
        }

        loop {
            select! {
                cmd = self.cmd_port.select_next_some() => {
                    if !self.handle_command(cmd).await? {
                        break;
                    }
                }
                disk_alert = self.disk_alert_port.select_next_some() => {
                    self.handle_disk_alert(disk_alert).await;
                }
                alert = self.internal_alert_port.select_next_some() => {
                    if self.alert_mask.contains(alert.category()) {
                        let _ = self.host_alert_chan.send(alert);
                    }
                }
            }
        }

        log::info!("Engine stopped");
        Ok(())
    }

    /// Accepts inbound connections, reads their handshakes and routes them
    /// to the engine for torrent matching.
    fn spawn_listener(&self, listen_addr: SocketAddr) {
        let cmd_chan = self.cmd_chan.clone();
        task::spawn(async move {
            let mut listener = match TcpListener::bind(listen_addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    log::error!(
                        "Failed to bind listener on {}: {}",
                        listen_addr,
                        e
                    );
                    return;
                }
            };
            log::info!("Listening on {}", listen_addr);
            loop {
                let (socket, addr) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        log::warn!("Accept error: {}", e);
                        continue;
                    }
                };
                log::info!("Inbound connection from {}", addr);
                let cmd_chan = cmd_chan.clone();
                task::spawn(async move {
                    let mut socket = Framed::new(socket, HandshakeCodec);
                    let handshake = time::timeout(
                        INBOUND_HANDSHAKE_TIMEOUT,
                        socket.next(),
                    )
                    .await;
                    if let Ok(Some(Ok(handshake))) = handshake {
                        let _ = cmd_chan
                            .send(Command::InboundPeer { socket, handshake });
                    }
                });
            }
        });
    }

    /// Returns false when the engine should stop.
    async fn handle_command(&mut self, cmd: Command) -> Result<bool> {
        match cmd {
            Command::AddTorrent { metainfo, resume } => {
                self.add_torrent(metainfo, resume, None, Vec::new());
            }
            Command::AddMagnet(magnet) => {
                let id = self.next_torrent_id;
                self.next_torrent_id += 1;
                log::info!(
                    "Torrent {} added as metadata-pending magnet {}",
                    id,
                    magnet.info_hash
                );
                self.pending_magnets.insert(id, PendingMagnet { magnet });
                let _ = self
                    .internal_alert_chan
                    .send(Alert::TorrentAdded { id });
            }
            Command::ProvideMetainfo { id, metainfo } => {
                let pending = match self.pending_magnets.remove(&id) {
                    Some(pending) => pending,
                    None => return Ok(true),
                };
                if pending.magnet.info_hash != metainfo.info_hash {
                    let _ = self.internal_alert_chan.send(
                        Alert::TorrentError {
                            id,
                            error: "metadata does not match the magnet's \
                                    info hash"
                                .to_string(),
                        },
                    );
                    self.pending_magnets.insert(id, pending);
                    return Ok(true);
                }
                // the magnet's select-only list maps to file priorities
                let file_priorities =
                    pending.magnet.file_selection.as_ref().map(
                        |selection| {
                            metainfo
                                .files
                                .iter()
                                .enumerate()
                                .map(|(index, _)| {
                                    selection.contains(&index) as u8
                                })
                                .collect()
                        },
                    );
                let peers = pending
                    .magnet
                    .peers
                    .iter()
                    .filter_map(|peer| peer.parse().ok())
                    .collect();
                self.add_torrent_with_id(
                    id,
                    metainfo,
                    None,
                    file_priorities,
                    peers,
                );
            }
            Command::AddPeers { id, peers } => {
                if let Some(entry) = self.torrents.get(&id) {
                    let _ = entry
                        .cmd_chan
                        .send(torrent::Command::AddPeers(peers));
                }
            }
            Command::Torrent { id, cmd } => {
                if let Some(entry) = self.torrents.get(&id) {
                    let _ = entry.cmd_chan.send(cmd);
                }
            }
            Command::RemoveTorrent { id } => {
                self.pending_magnets.remove(&id);
                self.pending_allocations.remove(&id);
                if let Some(entry) = self.torrents.remove(&id) {
                    let _ = entry.cmd_chan.send(torrent::Command::Shutdown);
                    let _ = self.disk.remove_torrent(id);
                }
            }
            Command::InboundPeer { socket, handshake } => {
                // route the connection to the torrent the handshake names;
                // no match means we simply drop the socket
                let entry = self.torrents.values().find(|entry| {
                    entry.info_hash.matches_wire_hash(&handshake.info_hash)
                });
                match entry {
                    Some(entry) => {
                        let _ = entry.cmd_chan.send(
                            torrent::Command::AddInboundPeer {
                                socket,
                                handshake,
                            },
                        );
                    }
                    None => {
                        log::info!(
                            "Dropping inbound connection: {}",
                            crate::error::PeerError::UnknownTorrent
                        );
                    }
                }
            }
            Command::SetAlertMask(mask) => {
                self.alert_mask = mask;
            }
            Command::Shutdown => {
                for entry in self.torrents.values() {
                    let _ = entry.cmd_chan.send(torrent::Command::Shutdown);
                }
                let _ = self.disk.shutdown();
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn add_torrent(
        &mut self,
        metainfo: Box<Metainfo>,
        resume: Option<ResumeData>,
        file_priorities: Option<Vec<u8>>,
        peers: Vec<SocketAddr>,
    ) {
        let id = self.next_torrent_id;
        self.next_torrent_id += 1;
        self.add_torrent_with_id(id, metainfo, resume, file_priorities, peers);
    }

    /// Kicks off a torrent: allocates it with the disk task and stashes
    /// the rest of the startup state until the allocation completes.
    fn add_torrent_with_id(
        &mut self,
        id: TorrentId,
        mut metainfo: Box<Metainfo>,
        resume: Option<ResumeData>,
        file_priorities: Option<Vec<u8>>,
        peers: Vec<SocketAddr>,
    ) {
        use rand::Rng;

        if self
            .torrents
            .values()
            .any(|entry| entry.info_hash == metainfo.info_hash)
        {
            log::warn!("Torrent {} already added", metainfo.info_hash);
            return;
        }

        let storage = StorageInfo::new(
            &metainfo,
            self.conf.torrent.download_dir.clone(),
        );
        let trees = torrent::shared_trees(&mut metainfo);
        let smart_ban_salt = rand::thread_rng().gen();
        let priorities = file_priorities
            .clone()
            .unwrap_or_else(|| vec![1; storage.files.len()]);

        if let Err(e) = self.disk.allocate_new_torrent(
            id,
            storage.clone(),
            metainfo.piece_hashes.clone(),
            std::sync::Arc::clone(&trees),
            priorities,
            smart_ban_salt,
            self.conf.torrent.seed_mode,
        ) {
            log::error!("Failed to reach the disk task: {}", e);
            return;
        }

        self.pending_allocations.insert(
            id,
            PendingAllocation {
                metainfo,
                storage,
                trees,
                smart_ban_salt,
                resume,
                file_priorities,
                peers,
            },
        );
    }

    /// The disk task finished (or failed) allocating a torrent: build the
    /// torrent task and start it.
    async fn handle_disk_alert(&mut self, alert: disk::Alert) {
        match alert {
            disk::Alert::TorrentAllocation(Ok(allocation)) => {
                let id = allocation.id;
                let pending = match self.pending_allocations.remove(&id) {
                    Some(pending) => pending,
                    None => return,
                };

                let (mut torrent, cmd_chan) = Torrent::new(
                    id,
                    pending.metainfo.info_hash,
                    pending.storage,
                    self.conf.engine.client_id,
                    self.conf.torrent.clone(),
                    self.disk.clone(),
                    allocation.alert_port,
                    self.internal_alert_chan.clone(),
                    pending.trees,
                    pending.smart_ban_salt,
                );
                if let Some(priorities) = pending.file_priorities {
                    torrent.set_initial_file_priorities(priorities);
                }
                match pending.resume {
                    Some(resume) => {
                        if torrent.apply_resume(resume).await.is_err() {
                            // saved progress can't be trusted: re-check
                            // everything on disk instead
                            log::warn!(
                                "Torrent {} resume data diverged, \
                                 re-checking files",
                                id
                            );
                            let _ = self.disk.check_files(id);
                        }
                    }
                    None => {}
                }

                self.torrents.insert(
                    id,
                    TorrentEntry {
                        info_hash: pending.metainfo.info_hash,
                        cmd_chan: cmd_chan.clone(),
                    },
                );
                if !pending.peers.is_empty() {
                    let _ = cmd_chan
                        .send(torrent::Command::AddPeers(pending.peers));
                }
                task::spawn(async move { torrent.start().await });

                let _ = self
                    .internal_alert_chan
                    .send(Alert::TorrentAdded { id });
            }
            disk::Alert::TorrentAllocation(Err(e)) => {
                log::warn!("Torrent allocation failed: {}", e);
            }
        }
    }
}
