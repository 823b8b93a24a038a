//! UDP transport of the tracker server: the connect-id challenge and
//! the binary announce/scrape frames from `tracker::proto`.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::task::AbortHandle;

use super::{AnnounceRequest, AnnounceResponder, ListenerShared, ScrapeRequest, ScrapeResponder};
use crate::tracker::proto::{self, Action, Wire as _, PROTOCOL_MAGIC};
use crate::tracker::DEFAULT_NUM_WANT;
use crate::Result;

/// How long an issued connection id authenticates follow-up frames.
const CONNECTION_ID_LIFETIME: Duration = Duration::from_secs(120);
const PRUNE_PERIOD: Duration = Duration::from_secs(60);

const MIN_AUTHENTICATED_LENGTH: usize = 16;
const MAX_DATAGRAM: usize = 8 * 1024;

pub(super) async fn spawn(
    addr: SocketAddr,
    shared: Arc<ListenerShared>,
) -> Result<(SocketAddr, AbortHandle)> {
    let socket = Arc::new(UdpSocket::bind(addr).await?);
    let local_addr = socket.local_addr()?;
    let handle = tokio::spawn(run(socket, shared)).abort_handle();
    Ok((local_addr, handle))
}

async fn run(socket: Arc<UdpSocket>, shared: Arc<ListenerShared>) {
    let mut connections = ConnectionIds::default();
    let mut prune = tokio::time::interval(PRUNE_PERIOD);
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            _ = prune.tick() => connections.prune(),
            received = socket.recv_from(&mut buf) => {
                let (len, peer) = match received {
                    Ok(received) => received,
                    Err(error) => {
                        tracing::warn!("udp tracker receive failed: {error}");
                        continue;
                    }
                };
                handle_datagram(&socket, &shared, &mut connections, &buf[..len], peer);
            }
        }
    }
}

fn handle_datagram(
    socket: &Arc<UdpSocket>,
    shared: &Arc<ListenerShared>,
    connections: &mut ConnectionIds,
    datagram: &[u8],
    peer: SocketAddr,
) {
    if datagram.len() < MIN_AUTHENTICATED_LENGTH {
        return;
    }

    let prefix = u64::from_be_bytes(datagram[..8].try_into().expect("span is 8 bytes"));
    if prefix == PROTOCOL_MAGIC {
        if let Ok(request) = proto::ConnectRequest::from_bytes(datagram) {
            let connection_id = connections.issue();
            let response = proto::ConnectResponse {
                transaction_id: request.transaction_id,
                connection_id,
            };
            send_detached(socket.clone(), peer, response.to_bytes());
        }
        return;
    }

    // anything else must present a previously issued connection id
    if !connections.valid(prefix) {
        tracing::debug!(peer = %peer, "dropping datagram with unknown connection id");
        return;
    }

    let action = u32::from_be_bytes(datagram[8..12].try_into().expect("span is 4 bytes"));
    let transaction_id = u32::from_be_bytes(datagram[12..16].try_into().expect("span is 4 bytes"));

    match Action::from_u32(action) {
        Some(Action::Announce) => {
            let request = if datagram.len() >= proto::ANNOUNCE_REQUEST_LENGTH {
                proto::AnnounceRequest::from_bytes(datagram).ok()
            } else {
                None
            };
            match request {
                Some(request) => announce(socket, shared, request, peer, transaction_id),
                None => send_error(socket, peer, transaction_id, "malformed announce"),
            }
        }
        Some(Action::Scrape) => match proto::ScrapeRequest::from_bytes(datagram) {
            Ok(request) => {
                shared.push_scrape(ScrapeRequest {
                    info_hashes: request.info_hashes,
                    responder: ScrapeResponder::Udp {
                        socket: socket.clone(),
                        peer,
                        transaction_id,
                    },
                });
            }
            Err(_) => send_error(socket, peer, transaction_id, "malformed scrape"),
        },
        _ => send_error(socket, peer, transaction_id, "unknown action"),
    }
}

fn announce(
    socket: &Arc<UdpSocket>,
    shared: &Arc<ListenerShared>,
    frame: proto::AnnounceRequest,
    peer: SocketAddr,
    transaction_id: u32,
) {
    let ip = if frame.ip_address.is_unspecified() {
        match peer.ip() {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(_) => {
                send_error(socket, peer, transaction_id, "ipv6 peers are not supported");
                return;
            }
        }
    } else {
        frame.ip_address
    };

    let num_want = if frame.num_want == u32::MAX {
        DEFAULT_NUM_WANT
    } else {
        frame.num_want
    };

    shared.push_announce(AnnounceRequest {
        info_hash: frame.info_hash,
        peer_id: frame.peer_id,
        addr: SocketAddrV4::new(ip, frame.port),
        uploaded: frame.uploaded,
        downloaded: frame.downloaded,
        left: frame.left,
        event: frame.event,
        key: Some(frame.key.to_be_bytes().to_vec()),
        num_want,
        compact: true,
        responder: AnnounceResponder::Udp {
            socket: socket.clone(),
            peer,
            transaction_id,
        },
    });
}

fn send_error(socket: &Arc<UdpSocket>, peer: SocketAddr, transaction_id: u32, reason: &str) {
    let frame = proto::ErrorResponse {
        transaction_id,
        message: reason.as_bytes().to_vec(),
    };
    send_detached(socket.clone(), peer, frame.to_bytes());
}

/// Fire-and-forget send; UDP replies are best effort.
pub(super) fn send_detached(socket: Arc<UdpSocket>, peer: SocketAddr, payload: Vec<u8>) {
    tokio::spawn(async move {
        let _ = socket.send_to(&payload, peer).await;
    });
}

/// Issued connection ids with their issue time. Ids authenticate
/// announce and scrape frames for two minutes.
#[derive(Debug, Default)]
struct ConnectionIds {
    ids: HashMap<u64, Instant>,
}

impl ConnectionIds {
    fn issue(&mut self) -> u64 {
        loop {
            let id: u64 = rand::random();
            if id == PROTOCOL_MAGIC || self.ids.contains_key(&id) {
                continue;
            }
            self.ids.insert(id, Instant::now());
            return id;
        }
    }

    fn valid(&self, id: u64) -> bool {
        match self.ids.get(&id) {
            Some(issued) => issued.elapsed() < CONNECTION_ID_LIFETIME,
            None => false,
        }
    }

    fn prune(&mut self) {
        self.ids
            .retain(|_, issued| issued.elapsed() < CONNECTION_ID_LIFETIME);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_ids_validate_until_pruned() {
        let mut connections = ConnectionIds::default();
        let id = connections.issue();
        assert!(connections.valid(id));
        assert!(!connections.valid(id.wrapping_add(1)));

        // backdate past the lifetime; the entry stops validating and
        // the next prune removes it
        *connections.ids.get_mut(&id).unwrap() =
            Instant::now() - CONNECTION_ID_LIFETIME - Duration::from_secs(1);
        assert!(!connections.valid(id));
        connections.prune();
        assert!(connections.ids.is_empty());
    }

    #[test]
    fn ids_are_unique() {
        let mut connections = ConnectionIds::default();
        let a = connections.issue();
        let b = connections.issue();
        assert_ne!(a, b);
        assert_eq!(connections.ids.len(), 2);
    }
}
