use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;

use bytes::Bytes;
use slotmap::SlotMap;

use crate::tracker::Announce;
use crate::{
    validate_block, validate_request, wire, Error, PeerId, PieceBitfield, PieceIdx, Sha1,
    TorrentInfo, BLOCK_LENGTH,
};

pub(super) const PEER_COUNT_LIMIT: usize = 50;
const MAX_PENDING_REQUESTS: usize = 16;

slotmap::new_key_type! {
    pub(crate) struct PeerKey;
}

/// Side effects requested by the state machine, drained and executed
/// by the client actor after every event.
#[derive(Debug)]
pub(super) enum TorrentCmd {
    PeerConnect {
        peer_key: PeerKey,
        address: SocketAddr,
        expected_id: Option<PeerId>,
    },
    PeerDisconnect {
        peer_key: PeerKey,
    },
    PeerSend {
        peer_key: PeerKey,
        message: wire::Message,
    },
    StorageGet {
        peer_key: PeerKey,
        index: PieceIdx,
        begin: u32,
        length: u32,
    },
    StorageSet {
        index: PieceIdx,
        data: Bytes,
    },
    AnnounceStats {
        uploaded: u64,
        downloaded: u64,
        left: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockRef {
    index: PieceIdx,
    begin: u32,
    length: u32,
}

#[derive(Debug)]
struct PeerState {
    key: PeerKey,
    id: PeerId,
    addr: SocketAddr,
    handshake_received: bool,
    /// A bitfield may only arrive as the very first message; any other
    /// first message implies an empty one.
    bitfield_received: bool,
    bitfield: PieceBitfield,
    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,
    pending_requests: Vec<BlockRef>,
}

impl PeerState {
    fn new(key: PeerKey, id: PeerId, addr: SocketAddr, handshake_received: bool) -> Self {
        Self {
            key,
            id,
            addr,
            handshake_received,
            bitfield_received: false,
            bitfield: PieceBitfield::new(),
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            pending_requests: Vec::new(),
        }
    }
}

/// Incoming blocks of one piece, buffered until the piece is whole and
/// its hash can be checked.
#[derive(Debug)]
struct PieceAssembly {
    data: Vec<u8>,
    received: Vec<bool>,
}

impl PieceAssembly {
    fn new(piece_length: u32) -> Self {
        let blocks = piece_length.div_ceil(BLOCK_LENGTH) as usize;
        Self {
            data: vec![0; piece_length as usize],
            received: vec![false; blocks],
        }
    }

    fn block_received(&self, begin: u32) -> bool {
        self.received
            .get((begin / BLOCK_LENGTH) as usize)
            .copied()
            .unwrap_or(true)
    }

    fn accept(&mut self, begin: u32, block: &[u8]) {
        let begin = begin as usize;
        self.data[begin..begin + block.len()].copy_from_slice(block);
        self.received[begin / BLOCK_LENGTH as usize] = true;
    }

    fn complete(&self) -> bool {
        self.received.iter().all(|&r| r)
    }
}

pub(super) struct TorrentState {
    id: PeerId,
    info: TorrentInfo,
    queue: VecDeque<TorrentCmd>,
    bitfield: PieceBitfield,
    peers: SlotMap<PeerKey, PeerState>,
    assembly: HashMap<PieceIdx, PieceAssembly>,
    uploaded: u64,
    downloaded: u64,
    reported: (u64, u64, u64),
}

#[derive(Debug, Clone)]
pub struct TorrentStatus {
    pub info_hash: Sha1,
    pub name: String,
    pub progress: f64,
    pub peer_count: usize,
    pub complete: bool,
    pub uploaded: u64,
    pub downloaded: u64,
}

impl TorrentState {
    pub fn new(id: PeerId, info: TorrentInfo) -> Self {
        let bitfield = PieceBitfield::with_size(info.pieces_count());
        Self {
            id,
            info,
            queue: VecDeque::new(),
            bitfield,
            peers: SlotMap::default(),
            assembly: HashMap::new(),
            uploaded: 0,
            downloaded: 0,
            reported: (0, 0, u64::MAX),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn info(&self) -> &TorrentInfo {
        &self.info
    }

    pub fn info_hash(&self) -> Sha1 {
        self.info.info_hash()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = TorrentCmd> + '_ {
        self.queue.drain(..)
    }

    /// The backing store already holds the full verified content.
    pub fn assume_seeded(&mut self) {
        self.bitfield.fill();
    }

    pub fn left(&self) -> u64 {
        let have: u64 = self
            .bitfield
            .pieces()
            .map(|idx| u64::from(self.info.piece_length_from_index(idx)))
            .sum();
        self.info.total_size() - have
    }

    pub fn status(&self) -> TorrentStatus {
        let pieces = self.bitfield.len().max(1);
        TorrentStatus {
            info_hash: self.info.info_hash(),
            name: self.info.name().to_string(),
            progress: f64::from(self.bitfield.num_set()) / f64::from(pieces),
            peer_count: self.peers.len(),
            complete: self.bitfield.complete(),
            uploaded: self.uploaded,
            downloaded: self.downloaded,
        }
    }

    /// Inbound connection whose handshake the listener already read.
    /// Subject to the same peer cap and address dedup as outbound
    /// dials; `None` refuses the connection. The local bitfield goes
    /// out first, even when all zero.
    pub fn on_peer_accepted(&mut self, peer_id: PeerId, addr: SocketAddr) -> Option<PeerKey> {
        if self.peers.len() >= PEER_COUNT_LIMIT || self.peer_with_addr_exists(addr) {
            return None;
        }
        let key = self
            .peers
            .insert_with_key(|key| PeerState::new(key, peer_id, addr, true));
        self.queue.push_back(TorrentCmd::PeerSend {
            peer_key: key,
            message: wire::Message::Bitfield {
                bitfield: self.bitfield.clone().into_vec(),
            },
        });
        Some(key)
    }

    /// Dial an address from a tracker response (or an explicit
    /// connect). `expected_id` is the id the tracker advertised, if
    /// any; the handshake must match it.
    pub fn connect_to(&mut self, address: SocketAddr, expected_id: Option<PeerId>) {
        if self.peers.len() >= PEER_COUNT_LIMIT || self.peer_with_addr_exists(address) {
            return;
        }
        let key = self
            .peers
            .insert_with_key(|key| PeerState::new(key, expected_id.unwrap_or_default(), address, false));
        self.queue.push_back(TorrentCmd::PeerConnect {
            peer_key: key,
            address,
            expected_id,
        });
    }

    /// Outbound handshake completed; the remote id has already been
    /// verified against the expectation by the dialing task.
    pub fn on_peer_handshake(&mut self, peer_key: PeerKey, peer_id: PeerId) {
        let Some(peer) = self.peers.get_mut(peer_key) else {
            return;
        };
        if peer.handshake_received {
            self.disconnect_peer(peer_key, "duplicate handshake");
            return;
        }
        peer.handshake_received = true;
        peer.id = peer_id;
        self.queue.push_back(TorrentCmd::PeerSend {
            peer_key,
            message: wire::Message::Bitfield {
                bitfield: self.bitfield.clone().into_vec(),
            },
        });
    }

    pub fn on_peer_failure(&mut self, peer_key: PeerKey, error: Error) {
        let Some(peer) = self.peers.get(peer_key) else {
            return;
        };
        tracing::info!(addr = %peer.addr, "peer failed: {error}");
        self.disconnect_peer(peer_key, "io failure");
    }

    pub fn on_peer_message(&mut self, peer_key: PeerKey, message: wire::Message) {
        let Some(peer) = self.peers.get_mut(peer_key) else {
            return;
        };
        if !peer.handshake_received {
            self.disconnect_peer(peer_key, "message before handshake");
            return;
        }

        if let wire::Message::Bitfield { bitfield } = message {
            if peer.bitfield_received {
                self.disconnect_peer(peer_key, "second bitfield");
                return;
            }
            let expected_len = (self.info.pieces_count() as usize + 7) / 8;
            if bitfield.len() != expected_len {
                self.disconnect_peer(peer_key, "bitfield of the wrong length");
                return;
            }
            peer.bitfield_received = true;
            peer.bitfield = PieceBitfield::from_vec(bitfield, self.info.pieces_count());
            self.update_interest(peer_key);
            return;
        }

        if !peer.bitfield_received {
            // first message was not a bitfield; it is implied empty
            peer.bitfield_received = true;
            peer.bitfield = PieceBitfield::with_size(self.info.pieces_count());
        }

        match message {
            wire::Message::KeepAlive => {}
            wire::Message::Choke => {
                peer.peer_choking = true;
                peer.pending_requests.clear();
            }
            wire::Message::Unchoke => {
                peer.peer_choking = false;
                self.pump_requests(peer_key);
            }
            wire::Message::Interested => {
                peer.peer_interested = true;
                // minimal reciprocation: serve whoever asks
                if peer.am_choking {
                    peer.am_choking = false;
                    self.queue.push_back(TorrentCmd::PeerSend {
                        peer_key,
                        message: wire::Message::Unchoke,
                    });
                }
            }
            wire::Message::NotInterested => {
                peer.peer_interested = false;
                if !peer.am_choking {
                    peer.am_choking = true;
                    self.queue.push_back(TorrentCmd::PeerSend {
                        peer_key,
                        message: wire::Message::Choke,
                    });
                }
            }
            wire::Message::Have { index } => {
                if !self.info.piece_index_valid(index) {
                    self.disconnect_peer(peer_key, "have for an invalid piece");
                    return;
                }
                peer.bitfield.set_piece(index);
                self.update_interest(peer_key);
                self.pump_requests(peer_key);
            }
            wire::Message::Bitfield { .. } => unreachable!("handled above"),
            wire::Message::Request {
                index,
                begin,
                length,
            } => self.on_peer_request(peer_key, index, begin, length),
            wire::Message::Piece { index, begin, data } => {
                self.on_peer_piece(peer_key, index, begin, data)
            }
            wire::Message::Cancel {
                index,
                begin,
                length,
            } => {
                // cancellation of a not-yet-served request is best
                // effort; reads already in flight complete and send
                tracing::debug!(%index, begin, length, "peer cancelled a request");
            }
        }
    }

    fn on_peer_request(&mut self, peer_key: PeerKey, index: PieceIdx, begin: u32, length: u32) {
        if let Err(error) = validate_request(&self.info, index, begin, length) {
            tracing::info!("tearing down peer: {error}");
            self.disconnect_peer(peer_key, "invalid request");
            return;
        }
        let peer = &self.peers[peer_key];
        if peer.am_choking {
            tracing::debug!(addr = %peer.addr, "dropping request from choked peer");
            return;
        }
        if !self.bitfield.has_piece(index) {
            tracing::debug!(%index, "dropping request for a piece we lack");
            return;
        }
        self.queue.push_back(TorrentCmd::StorageGet {
            peer_key,
            index,
            begin,
            length,
        });
    }

    fn on_peer_piece(&mut self, peer_key: PeerKey, index: PieceIdx, begin: u32, data: Bytes) {
        if let Err(error) = validate_block(&self.info, index, begin, data.len()) {
            tracing::info!("tearing down peer: {error}");
            self.disconnect_peer(peer_key, "invalid block");
            return;
        }

        let peer = &mut self.peers[peer_key];
        let block = BlockRef {
            index,
            begin,
            length: data.len() as u32,
        };
        if let Some(at) = peer.pending_requests.iter().position(|r| *r == block) {
            peer.pending_requests.swap_remove(at);
        }

        if self.bitfield.has_piece(index) {
            return;
        }

        self.downloaded += data.len() as u64;
        let piece_length = self.info.piece_length_from_index(index);
        let assembly = self
            .assembly
            .entry(index)
            .or_insert_with(|| PieceAssembly::new(piece_length));
        if !assembly.block_received(begin) {
            assembly.accept(begin, &data);
        }

        if assembly.complete() {
            let assembly = self.assembly.remove(&index).expect("assembly exists");
            let data = Bytes::from(assembly.data);
            let expected = self.info.piece_hash(index).expect("piece exists");
            if Sha1::hash(&data) == expected {
                self.bitfield.set_piece(index);
                self.queue.push_back(TorrentCmd::StorageSet { index, data });
                self.broadcast_have(index);
                self.report_stats();
            } else {
                tracing::warn!(%index, "piece failed its hash check, discarding");
            }
        }

        self.pump_requests(peer_key);
    }

    /// Completion of a storage read for a remote request. A missing
    /// read declines silently; the peer session stays up.
    pub fn on_storage_read(
        &mut self,
        peer_key: PeerKey,
        index: PieceIdx,
        begin: u32,
        data: Option<Bytes>,
    ) {
        let Some(peer) = self.peers.get(peer_key) else {
            return;
        };
        if peer.am_choking {
            return;
        }
        let Some(data) = data else {
            tracing::warn!(%index, begin, "storage read failed, declining request");
            return;
        };
        self.uploaded += data.len() as u64;
        self.queue.push_back(TorrentCmd::PeerSend {
            peer_key,
            message: wire::Message::Piece { index, begin, data },
        });
        self.report_stats();
    }

    /// Completion of a storage write of a verified piece. A failed
    /// write surrenders the piece so it can be fetched again.
    pub fn on_storage_write(&mut self, index: PieceIdx, ok: bool) {
        if !ok {
            tracing::warn!(%index, "storage write failed, dropping the piece");
            self.bitfield.unset_piece(index);
            self.report_stats();
        }
    }

    pub fn on_announce(&mut self, announce: Announce) {
        tracing::debug!(
            peers = announce.peers.len(),
            complete = announce.complete,
            incomplete = announce.incomplete,
            "announce ok"
        );
        for peer in announce.peers {
            self.connect_to(SocketAddr::V4(peer.addr), peer.id);
        }
    }

    /// Periodic upkeep: refresh interest flags, keep request pipelines
    /// full, report transfer stats to the announcer.
    pub fn tick(&mut self) {
        let keys = self.peers.keys().collect::<Vec<_>>();
        for key in keys {
            self.update_interest(key);
            self.pump_requests(key);
        }
        self.report_stats();
    }

    fn update_interest(&mut self, peer_key: PeerKey) {
        let Some(peer) = self.peers.get_mut(peer_key) else {
            return;
        };
        if !peer.bitfield_received {
            return;
        }
        // interested iff the peer has a piece we are missing
        let interested = self.bitfield.missing_pieces_in(&peer.bitfield).next().is_some();
        if interested != peer.am_interested {
            peer.am_interested = interested;
            let message = if interested {
                wire::Message::Interested
            } else {
                wire::Message::NotInterested
            };
            self.queue.push_back(TorrentCmd::PeerSend { peer_key, message });
        }
    }

    /// Fill the request pipeline towards an unchoked peer with blocks
    /// of the lowest-indexed pieces it can provide, in order.
    fn pump_requests(&mut self, peer_key: PeerKey) {
        let Some(peer) = self.peers.get(peer_key) else {
            return;
        };
        if peer.peer_choking || !peer.am_interested {
            return;
        }

        let mut wanted = Vec::new();
        let budget = MAX_PENDING_REQUESTS.saturating_sub(peer.pending_requests.len());
        'pieces: for index in self.bitfield.missing_pieces_in(&peer.bitfield) {
            let piece_length = self.info.piece_length_from_index(index);
            let mut begin = 0;
            while begin < piece_length {
                let length = BLOCK_LENGTH.min(piece_length - begin);
                let block = BlockRef {
                    index,
                    begin,
                    length,
                };
                let already_received = self
                    .assembly
                    .get(&index)
                    .is_some_and(|a| a.block_received(begin));
                if !already_received && !peer.pending_requests.contains(&block) {
                    wanted.push(block);
                    if wanted.len() >= budget {
                        break 'pieces;
                    }
                }
                begin += length;
            }
        }

        let peer = &mut self.peers[peer_key];
        for block in wanted {
            peer.pending_requests.push(block);
            self.queue.push_back(TorrentCmd::PeerSend {
                peer_key,
                message: wire::Message::Request {
                    index: block.index,
                    begin: block.begin,
                    length: block.length,
                },
            });
        }
    }

    fn broadcast_have(&mut self, index: PieceIdx) {
        for peer in self.peers.values() {
            self.queue.push_back(TorrentCmd::PeerSend {
                peer_key: peer.key,
                message: wire::Message::Have { index },
            });
        }
    }

    fn report_stats(&mut self) {
        let stats = (self.uploaded, self.downloaded, self.left());
        if stats != self.reported {
            self.reported = stats;
            self.queue.push_back(TorrentCmd::AnnounceStats {
                uploaded: stats.0,
                downloaded: stats.1,
                left: stats.2,
            });
        }
    }

    fn disconnect_peer(&mut self, peer_key: PeerKey, reason: &str) {
        let Some(peer) = self.peers.remove(peer_key) else {
            return;
        };
        tracing::info!(addr = %peer.addr, "disconnecting peer: {reason}");
        self.queue.push_back(TorrentCmd::PeerDisconnect { peer_key });
    }

    pub fn disconnect_all(&mut self) {
        let keys = self.peers.keys().collect::<Vec<_>>();
        for key in keys {
            self.disconnect_peer(key, "torrent removed");
        }
    }

    fn peer_with_addr_exists(&self, addr: SocketAddr) -> bool {
        self.peers.values().any(|p| p.addr == addr)
    }
}
