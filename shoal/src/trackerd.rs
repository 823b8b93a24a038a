//! Tracker server: HTTP and UDP listeners multiplexed into one stream
//! of validated requests. Each request value carries the capability to
//! answer it (`respond`) or to turn it away (`reject`); the transport
//! behind the capability is invisible to the consumer.

use std::collections::HashSet;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

use crate::tracker::proto::{self, Wire as _};
use crate::tracker::{AnnounceEvent, PeerInfo, ScrapeEntry};
use crate::{PeerId, Result, Sha1};

mod http;
mod udp;

pub mod memory;
pub use memory::MemoryTracker;

#[derive(Debug, Default, Clone)]
pub struct TrackerServerConfig {
    /// HTTP listener address; `None` disables the HTTP transport.
    pub http_addr: Option<SocketAddr>,
    /// UDP listener address; `None` disables the UDP transport.
    pub udp_addr: Option<SocketAddr>,
    /// When set, announces and scrapes for other info-hashes are
    /// rejected before they reach the consumer.
    pub filter: Option<HashSet<Sha1>>,
}

/// One validated request from either transport.
#[derive(Debug)]
pub enum TrackerRequest {
    Announce(AnnounceRequest),
    Scrape(ScrapeRequest),
}

/// Counters and peers handed back to an announcing client.
#[derive(Debug, Clone, Default)]
pub struct AnnounceReply {
    pub interval: u32,
    pub complete: u32,
    pub incomplete: u32,
    pub peers: Vec<PeerInfo>,
}

#[derive(Debug)]
pub struct AnnounceRequest {
    pub info_hash: Sha1,
    pub peer_id: PeerId,
    /// Resolved client address: socket peer address unless overridden
    /// by `X-Forwarded-For` or an explicit `ip` parameter.
    pub addr: SocketAddrV4,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: AnnounceEvent,
    pub key: Option<Vec<u8>>,
    pub num_want: u32,
    pub compact: bool,
    responder: AnnounceResponder,
}

impl AnnounceRequest {
    pub fn respond(self, reply: AnnounceReply) {
        self.responder.respond(self.compact, reply);
    }

    pub fn reject(self, reason: &str) {
        self.responder.reject(reason);
    }
}

#[derive(Debug)]
pub struct ScrapeRequest {
    /// Requested torrents; empty means "everything you track".
    pub info_hashes: Vec<Sha1>,
    responder: ScrapeResponder,
}

impl ScrapeRequest {
    pub fn respond(self, entries: Vec<(Sha1, ScrapeEntry)>) {
        self.responder.respond(entries);
    }

    pub fn reject(self, reason: &str) {
        self.responder.reject(reason);
    }
}

#[derive(Debug)]
enum AnnounceResponder {
    Http {
        reply: oneshot::Sender<Vec<u8>>,
    },
    Udp {
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        transaction_id: u32,
    },
}

impl AnnounceResponder {
    fn respond(self, compact: bool, reply: AnnounceReply) {
        match self {
            AnnounceResponder::Http { reply: sender } => {
                let _ = sender.send(http::announce_body(compact, &reply));
            }
            AnnounceResponder::Udp {
                socket,
                peer,
                transaction_id,
            } => {
                let frame = proto::AnnounceResponse {
                    transaction_id,
                    interval: reply.interval,
                    leechers: reply.incomplete,
                    seeders: reply.complete,
                    addresses: reply.peers.iter().map(|p| p.addr).collect(),
                };
                udp::send_detached(socket, peer, frame.to_bytes());
            }
        }
    }

    fn reject(self, reason: &str) {
        match self {
            AnnounceResponder::Http { reply: sender } => {
                let _ = sender.send(http::failure_body(reason));
            }
            AnnounceResponder::Udp {
                socket,
                peer,
                transaction_id,
            } => {
                let frame = proto::ErrorResponse {
                    transaction_id,
                    message: reason.as_bytes().to_vec(),
                };
                udp::send_detached(socket, peer, frame.to_bytes());
            }
        }
    }
}

#[derive(Debug)]
enum ScrapeResponder {
    Http {
        reply: oneshot::Sender<Vec<u8>>,
    },
    Udp {
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        transaction_id: u32,
    },
}

impl ScrapeResponder {
    fn respond(self, entries: Vec<(Sha1, ScrapeEntry)>) {
        match self {
            ScrapeResponder::Http { reply: sender } => {
                let _ = sender.send(http::scrape_body(&entries));
            }
            ScrapeResponder::Udp {
                socket,
                peer,
                transaction_id,
            } => {
                let frame = proto::ScrapeResponse {
                    transaction_id,
                    stats: entries
                        .iter()
                        .map(|(_, entry)| proto::ScrapeStats {
                            seeders: entry.complete,
                            completed: entry.downloaded,
                            leechers: entry.incomplete,
                        })
                        .collect(),
                };
                udp::send_detached(socket, peer, frame.to_bytes());
            }
        }
    }

    fn reject(self, reason: &str) {
        match self {
            ScrapeResponder::Http { reply: sender } => {
                let _ = sender.send(http::failure_body(reason));
            }
            ScrapeResponder::Udp {
                socket,
                peer,
                transaction_id,
            } => {
                let frame = proto::ErrorResponse {
                    transaction_id,
                    message: reason.as_bytes().to_vec(),
                };
                udp::send_detached(socket, peer, frame.to_bytes());
            }
        }
    }
}

type RequestSender = mpsc::UnboundedSender<TrackerRequest>;
type RequestReceiver = mpsc::UnboundedReceiver<TrackerRequest>;

struct ListenerShared {
    sender: RequestSender,
    filter: Option<HashSet<Sha1>>,
}

impl ListenerShared {
    fn info_hash_allowed(&self, info_hash: &Sha1) -> bool {
        match &self.filter {
            Some(filter) => filter.contains(info_hash),
            None => true,
        }
    }

    fn push_announce(&self, request: AnnounceRequest) {
        if !self.info_hash_allowed(&request.info_hash) {
            tracing::debug!(info_hash = %request.info_hash, "rejecting filtered announce");
            request.reject("info hash not tracked here");
            return;
        }
        let _ = self.sender.send(TrackerRequest::Announce(request));
    }

    fn push_scrape(&self, request: ScrapeRequest) {
        if let Some(hash) = request
            .info_hashes
            .iter()
            .find(|hash| !self.info_hash_allowed(hash))
        {
            tracing::debug!(info_hash = %hash, "rejecting filtered scrape");
            request.reject("info hash not tracked here");
            return;
        }
        let _ = self.sender.send(TrackerRequest::Scrape(request));
    }
}

pub struct TrackerServer {
    receiver: RequestReceiver,
    http_addr: Option<SocketAddr>,
    udp_addr: Option<SocketAddr>,
    handles: Vec<AbortHandle>,
}

impl Drop for TrackerServer {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

impl TrackerServer {
    /// Bind the configured listeners and start producing requests.
    pub async fn bind(config: TrackerServerConfig) -> Result<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut handles = Vec::new();
        let mut http_addr = None;
        let mut udp_addr = None;

        if let Some(addr) = config.http_addr {
            let shared = Arc::new(ListenerShared {
                sender: sender.clone(),
                filter: config.filter.clone(),
            });
            let (local_addr, handle) = http::spawn(addr, shared).await?;
            http_addr = Some(local_addr);
            handles.push(handle);
        }

        if let Some(addr) = config.udp_addr {
            let shared = Arc::new(ListenerShared {
                sender: sender.clone(),
                filter: config.filter.clone(),
            });
            let (local_addr, handle) = udp::spawn(addr, shared).await?;
            udp_addr = Some(local_addr);
            handles.push(handle);
        }

        Ok(Self {
            receiver,
            http_addr,
            udp_addr,
            handles,
        })
    }

    /// Next request from either transport. `None` once every listener
    /// task has stopped.
    pub async fn recv(&mut self) -> Option<TrackerRequest> {
        self.receiver.recv().await
    }

    /// Bound address of the HTTP listener, if enabled.
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    /// Bound address of the UDP listener, if enabled.
    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp_addr
    }
}
