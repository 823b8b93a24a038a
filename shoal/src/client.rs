//! Top-level orchestrator: one listening socket, a torrent registry
//! keyed by info-hash, and a single event loop that owns every
//! torrent's state. Peer I/O, tracker announces and storage calls run
//! as detached tasks that report back over the client channel, so all
//! state mutation happens on the loop, one message at a time.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use slotmap::{SecondaryMap, SlotMap};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

use crate::tracker::Announce;
use crate::{wire, Error, PeerId, PieceIdx, PortMapper, Result, Sha1, Storage, TorrentInfo};

mod announcer;
mod listener;
mod peer;
mod torrent;

use announcer::{AnnouncerProc, TransferStats};
use peer::{PeerIo, PeerProc};
use torrent::{PeerKey, TorrentCmd, TorrentState};
pub use torrent::TorrentStatus;

slotmap::new_key_type! {
    pub(crate) struct TorrentKey;
}

type ClientSender = mpsc::UnboundedSender<ClientMsg>;
type ClientReceiver = mpsc::UnboundedReceiver<ClientMsg>;

const TICK_PERIOD: Duration = Duration::from_secs(1);

pub struct ClientConfig {
    /// Listening address for inbound peers; port 0 binds an ephemeral
    /// port, `None` disables inbound connections entirely.
    pub listen_addr: Option<SocketAddr>,
    /// First 8 bytes of the peer id; the remaining 12 are random.
    pub peer_id_prefix: [u8; 8],
    /// Optional gateway mapper consulted once at startup.
    pub port_mapper: Option<Arc<dyn PortMapper>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            listen_addr: Some("0.0.0.0:0".parse().expect("static address")),
            peer_id_prefix: *b"-SH0010-",
            port_mapper: None,
        }
    }
}

enum ClientMsg {
    ListenerIncoming {
        peer_id: PeerId,
        peer_addr: SocketAddr,
        info_hash: Sha1,
        io: PeerIo,
    },
    PeerHandshake {
        torrent_key: TorrentKey,
        peer_key: PeerKey,
        peer_id: PeerId,
    },
    PeerMessage {
        torrent_key: TorrentKey,
        peer_key: PeerKey,
        message: wire::Message,
    },
    PeerFailure {
        torrent_key: TorrentKey,
        peer_key: PeerKey,
        error: Error,
    },
    AnnounceOk {
        torrent_key: TorrentKey,
        announce: Announce,
    },
    AnnounceError {
        torrent_key: TorrentKey,
        error: Error,
    },
    StorageExists {
        torrent_key: TorrentKey,
        exists: bool,
    },
    StorageRead {
        torrent_key: TorrentKey,
        peer_key: PeerKey,
        index: PieceIdx,
        begin: u32,
        data: Option<Bytes>,
    },
    StorageWrite {
        torrent_key: TorrentKey,
        index: PieceIdx,
        ok: bool,
    },
    TorrentAdd {
        info: TorrentInfo,
        storage: Arc<dyn Storage>,
        response: oneshot::Sender<Torrent>,
    },
    TorrentRemove {
        torrent_key: TorrentKey,
    },
    TorrentStatus {
        torrent_key: TorrentKey,
        response: oneshot::Sender<TorrentStatus>,
    },
    TorrentConnect {
        torrent_key: TorrentKey,
        address: SocketAddr,
    },
    RequestMorePeers {
        torrent_key: TorrentKey,
    },
    Tick,
    Shutdown,
}

impl ClientMsg {
    fn torrent_key(&self) -> Option<TorrentKey> {
        match self {
            ClientMsg::PeerHandshake { torrent_key, .. }
            | ClientMsg::PeerMessage { torrent_key, .. }
            | ClientMsg::PeerFailure { torrent_key, .. }
            | ClientMsg::AnnounceOk { torrent_key, .. }
            | ClientMsg::AnnounceError { torrent_key, .. }
            | ClientMsg::StorageExists { torrent_key, .. }
            | ClientMsg::StorageRead { torrent_key, .. }
            | ClientMsg::StorageWrite { torrent_key, .. }
            | ClientMsg::TorrentConnect { torrent_key, .. }
            | ClientMsg::TorrentStatus { torrent_key, .. }
            | ClientMsg::RequestMorePeers { torrent_key } => Some(*torrent_key),
            ClientMsg::ListenerIncoming { .. }
            | ClientMsg::TorrentAdd { .. }
            | ClientMsg::TorrentRemove { .. }
            | ClientMsg::Tick
            | ClientMsg::Shutdown => None,
        }
    }
}

/// Handle to a running client. Dropping it shuts the event loop and
/// every peer connection down.
pub struct Client {
    sender: ClientSender,
    local_addr: Option<SocketAddr>,
    handles: Vec<AbortHandle>,
}

impl Drop for Client {
    fn drop(&mut self) {
        let _ = self.sender.send(ClientMsg::Shutdown);
        for handle in &self.handles {
            handle.abort();
        }
    }
}

impl Client {
    pub async fn new(config: ClientConfig) -> Result<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let peer_id = PeerId::generate(&config.peer_id_prefix);
        let mut handles = Vec::new();

        let mut local_addr = None;
        if let Some(addr) = config.listen_addr {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            local_addr = Some(listener.local_addr()?);
            handles.push(listener::spawn(sender.clone(), listener));
        }

        let mut external_ip = None;
        if let (Some(mapper), Some(addr)) = (&config.port_mapper, local_addr) {
            match mapper.map_port(addr.port()).await {
                Ok((internal, external)) => {
                    tracing::info!(%internal, %external, "mapped listening port on the gateway");
                    if let IpAddr::V4(v4) = external {
                        external_ip = Some(v4);
                    }
                }
                Err(error) => {
                    tracing::warn!("port mapping failed, staying on the bound address: {error}");
                }
            }
        }

        let state = ClientState {
            peer_id,
            port: local_addr.map(|a| a.port()).unwrap_or(0),
            external_ip,
            sender: sender.clone(),
            torrents: SlotMap::default(),
        };
        handles.push(tokio::spawn(run(state, receiver)).abort_handle());

        handles.push(
            tokio::spawn({
                let sender = sender.clone();
                async move {
                    while sender.send(ClientMsg::Tick).is_ok() {
                        tokio::time::sleep(TICK_PERIOD).await;
                    }
                }
            })
            .abort_handle(),
        );

        Ok(Self {
            sender,
            local_addr,
            handles,
        })
    }

    /// Address of the inbound listener, if one was configured.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub async fn add_torrent(&self, info: TorrentInfo, storage: Arc<dyn Storage>) -> Torrent {
        let (response, receiver) = oneshot::channel();
        let _ = self.sender.send(ClientMsg::TorrentAdd {
            info,
            storage,
            response,
        });
        receiver.await.expect("client loop owns the response sender")
    }
}

/// Handle to one torrent inside a running client.
#[derive(Clone)]
pub struct Torrent {
    sender: ClientSender,
    key: TorrentKey,
}

impl Torrent {
    /// Dial a peer directly, outside of tracker discovery.
    pub fn connect(&self, address: SocketAddr) {
        let _ = self.sender.send(ClientMsg::TorrentConnect {
            torrent_key: self.key,
            address,
        });
    }

    /// Wake the announcer early and ask for a fresh batch of peers.
    pub fn request_more_peers(&self) {
        let _ = self.sender.send(ClientMsg::RequestMorePeers {
            torrent_key: self.key,
        });
    }

    /// `None` when the client (or this torrent) is gone.
    pub async fn status(&self) -> Option<TorrentStatus> {
        let (response, receiver) = oneshot::channel();
        self.sender
            .send(ClientMsg::TorrentStatus {
                torrent_key: self.key,
                response,
            })
            .ok()?;
        receiver.await.ok()
    }

    /// Remove the torrent: drop every peer, cancel the announcer and
    /// send a final `stopped` announce.
    pub fn remove(self) {
        let _ = self.sender.send(ClientMsg::TorrentRemove {
            torrent_key: self.key,
        });
    }
}

struct TorrentEntry {
    state: TorrentState,
    storage: Arc<dyn Storage>,
    announcer: Option<AnnouncerProc>,
    peers: SecondaryMap<PeerKey, PeerProc>,
}

struct ClientState {
    peer_id: PeerId,
    port: u16,
    external_ip: Option<Ipv4Addr>,
    sender: ClientSender,
    torrents: SlotMap<TorrentKey, TorrentEntry>,
}

async fn run(mut state: ClientState, mut receiver: ClientReceiver) {
    while let Some(msg) = receiver.recv().await {
        if process(&mut state, msg) {
            break;
        }
    }
}

fn process(state: &mut ClientState, msg: ClientMsg) -> bool {
    let torrent_key = msg.torrent_key();

    match msg {
        ClientMsg::ListenerIncoming {
            peer_id,
            peer_addr,
            info_hash,
            io,
        } => process_listener_incoming(state, peer_id, peer_addr, info_hash, io),
        ClientMsg::PeerHandshake {
            torrent_key,
            peer_key,
            peer_id,
        } => {
            if let Some(entry) = state.torrents.get_mut(torrent_key) {
                entry.state.on_peer_handshake(peer_key, peer_id);
            }
        }
        ClientMsg::PeerMessage {
            torrent_key,
            peer_key,
            message,
        } => {
            if let Some(entry) = state.torrents.get_mut(torrent_key) {
                entry.state.on_peer_message(peer_key, message);
            }
        }
        ClientMsg::PeerFailure {
            torrent_key,
            peer_key,
            error,
        } => {
            if let Some(entry) = state.torrents.get_mut(torrent_key) {
                entry.state.on_peer_failure(peer_key, error);
            }
        }
        ClientMsg::AnnounceOk {
            torrent_key,
            announce,
        } => {
            if let Some(entry) = state.torrents.get_mut(torrent_key) {
                entry.state.on_announce(announce);
            }
        }
        ClientMsg::AnnounceError { torrent_key, error } => {
            if state.torrents.contains_key(torrent_key) {
                tracing::warn!("announce failed, retrying on the next interval: {error}");
            }
        }
        ClientMsg::StorageExists { torrent_key, exists } => {
            process_storage_exists(state, torrent_key, exists)
        }
        ClientMsg::StorageRead {
            torrent_key,
            peer_key,
            index,
            begin,
            data,
        } => {
            if let Some(entry) = state.torrents.get_mut(torrent_key) {
                entry.state.on_storage_read(peer_key, index, begin, data);
            }
        }
        ClientMsg::StorageWrite {
            torrent_key,
            index,
            ok,
        } => {
            if let Some(entry) = state.torrents.get_mut(torrent_key) {
                entry.state.on_storage_write(index, ok);
            }
        }
        ClientMsg::TorrentAdd {
            info,
            storage,
            response,
        } => process_torrent_add(state, info, storage, response),
        ClientMsg::TorrentRemove { torrent_key } => process_torrent_remove(state, torrent_key),
        ClientMsg::TorrentStatus {
            torrent_key,
            response,
        } => {
            if let Some(entry) = state.torrents.get(torrent_key) {
                let _ = response.send(entry.state.status());
            }
        }
        ClientMsg::TorrentConnect {
            torrent_key,
            address,
        } => {
            if let Some(entry) = state.torrents.get_mut(torrent_key) {
                entry.state.connect_to(address, None);
            }
        }
        ClientMsg::RequestMorePeers { torrent_key } => {
            if let Some(entry) = state.torrents.get(torrent_key) {
                if let Some(announcer) = &entry.announcer {
                    announcer.request_more_peers();
                }
            }
        }
        ClientMsg::Tick => {
            let keys = state.torrents.keys().collect::<Vec<_>>();
            for key in keys {
                state.torrents[key].state.tick();
                drain_and_execute(state, key);
            }
        }
        ClientMsg::Shutdown => return true,
    }

    if let Some(torrent_key) = torrent_key {
        drain_and_execute(state, torrent_key);
    }

    false
}

fn process_listener_incoming(
    state: &mut ClientState,
    peer_id: PeerId,
    peer_addr: SocketAddr,
    info_hash: Sha1,
    io: PeerIo,
) {
    let Some(torrent_key) = state
        .torrents
        .iter()
        .find(|(_, entry)| entry.state.info_hash() == info_hash)
        .map(|(key, _)| key)
    else {
        // unknown swarm: the connection closes without a reply handshake
        tracing::debug!(%info_hash, addr = %peer_addr, "dropping peer for unknown torrent");
        return;
    };

    let entry = &mut state.torrents[torrent_key];
    let Some(peer_key) = entry.state.on_peer_accepted(peer_id, peer_addr) else {
        // over the peer cap or a duplicate address: drop without replying
        tracing::debug!(addr = %peer_addr, "refusing inbound peer");
        return;
    };
    let proc = PeerProc::accept(
        state.sender.clone(),
        torrent_key,
        peer_key,
        info_hash,
        entry.state.id(),
        io,
    );
    entry.peers.insert(peer_key, proc);
    drain_and_execute(state, torrent_key);
}

fn process_torrent_add(
    state: &mut ClientState,
    info: TorrentInfo,
    storage: Arc<dyn Storage>,
    response: oneshot::Sender<Torrent>,
) {
    let torrent_key = state.torrents.insert(TorrentEntry {
        state: TorrentState::new(state.peer_id, info),
        storage: storage.clone(),
        announcer: None,
        peers: SecondaryMap::default(),
    });

    // the announcer starts once we know whether we are a seed
    let sender = state.sender.clone();
    tokio::spawn(async move {
        let exists = storage.exists().await;
        let _ = sender.send(ClientMsg::StorageExists {
            torrent_key,
            exists,
        });
    });

    let _ = response.send(Torrent {
        sender: state.sender.clone(),
        key: torrent_key,
    });
}

fn process_storage_exists(state: &mut ClientState, torrent_key: TorrentKey, exists: bool) {
    let Some(entry) = state.torrents.get_mut(torrent_key) else {
        return;
    };
    if exists {
        entry.state.assume_seeded();
    }

    let info = entry.state.info().clone();
    entry.announcer = Some(AnnouncerProc::spawn(
        state.sender.clone(),
        torrent_key,
        info.announce().to_string(),
        info.info_hash(),
        state.peer_id,
        state.port,
        state.external_ip,
        TransferStats {
            uploaded: 0,
            downloaded: 0,
            left: entry.state.left(),
        },
    ));
}

fn process_torrent_remove(state: &mut ClientState, torrent_key: TorrentKey) {
    let Some(mut entry) = state.torrents.remove(torrent_key) else {
        return;
    };
    entry.state.disconnect_all();
    if let Some(announcer) = &entry.announcer {
        announcer.announce_stopped();
    }
    // dropping the entry aborts the announcer and closes every peer
}

fn drain_and_execute(state: &mut ClientState, torrent_key: TorrentKey) {
    loop {
        let Some(entry) = state.torrents.get_mut(torrent_key) else {
            return;
        };
        let commands = entry.state.drain().collect::<Vec<_>>();
        if commands.is_empty() {
            return;
        }

        for command in commands {
            let Some(entry) = state.torrents.get_mut(torrent_key) else {
                return;
            };
            match command {
                TorrentCmd::PeerConnect {
                    peer_key,
                    address,
                    expected_id,
                } => {
                    let proc = PeerProc::connect(
                        state.sender.clone(),
                        torrent_key,
                        peer_key,
                        entry.state.info_hash(),
                        entry.state.id(),
                        expected_id,
                        address,
                    );
                    entry.peers.insert(peer_key, proc);
                }
                TorrentCmd::PeerDisconnect { peer_key } => {
                    entry.peers.remove(peer_key);
                }
                TorrentCmd::PeerSend { peer_key, message } => {
                    if let Some(proc) = entry.peers.get(peer_key) {
                        proc.send(message);
                    }
                }
                TorrentCmd::StorageGet {
                    peer_key,
                    index,
                    begin,
                    length,
                } => {
                    let offset = entry.state.info().piece_offset(index) + u64::from(begin);
                    let storage = entry.storage.clone();
                    let sender = state.sender.clone();
                    tokio::spawn(async move {
                        let data = storage.get(offset, u64::from(length)).await;
                        let _ = sender.send(ClientMsg::StorageRead {
                            torrent_key,
                            peer_key,
                            index,
                            begin,
                            data,
                        });
                    });
                }
                TorrentCmd::StorageSet { index, data } => {
                    let offset = entry.state.info().piece_offset(index);
                    let storage = entry.storage.clone();
                    let sender = state.sender.clone();
                    tokio::spawn(async move {
                        let ok = storage.set(offset, data).await;
                        let _ = sender.send(ClientMsg::StorageWrite {
                            torrent_key,
                            index,
                            ok,
                        });
                    });
                }
                TorrentCmd::AnnounceStats {
                    uploaded,
                    downloaded,
                    left,
                } => {
                    if let Some(announcer) = &entry.announcer {
                        announcer.update_stats(TransferStats {
                            uploaded,
                            downloaded,
                            left,
                        });
                    }
                }
            }
        }
    }
}
