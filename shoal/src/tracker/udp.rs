use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;

use crate::tracker::proto::{self, Action, Wire as _};
use crate::tracker::{Announce, AnnounceParams, PeerInfo, Scrape, ScrapeEntry};
use crate::{Error, Result, Sha1};

/// How long a server-issued connection id is trusted before a new
/// CONNECT exchange.
const CONNECTION_ID_LIFETIME: Duration = Duration::from_secs(60);
const MAX_ATTEMPTS: u32 = 8;
const MAX_DATAGRAM: usize = 8 * 1024;

/// Per-attempt timeout: 15 s doubled on every retry.
fn attempt_timeout(attempt: u32) -> Duration {
    Duration::from_secs(15) * 2u32.pow(attempt)
}

#[derive(Debug)]
pub struct TrackerUdpClient {
    socket: UdpSocket,
    connection: Option<(u64, Instant)>,
}

impl TrackerUdpClient {
    pub async fn new(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(addr).await?;
        Ok(Self {
            socket,
            connection: None,
        })
    }

    pub async fn announce(&mut self, params: &AnnounceParams) -> Result<Announce> {
        for attempt in 0..MAX_ATTEMPTS {
            let deadline = Instant::now() + attempt_timeout(attempt);
            match self.announce_once(params, deadline).await {
                Err(Error::Timeout) => continue,
                other => return other,
            }
        }
        Err(Error::Timeout)
    }

    pub async fn scrape(&mut self, info_hashes: &[Sha1]) -> Result<Scrape> {
        for attempt in 0..MAX_ATTEMPTS {
            let deadline = Instant::now() + attempt_timeout(attempt);
            match self.scrape_once(info_hashes, deadline).await {
                Err(Error::Timeout) => continue,
                other => return other,
            }
        }
        Err(Error::Timeout)
    }

    async fn announce_once(
        &mut self,
        params: &AnnounceParams,
        deadline: Instant,
    ) -> Result<Announce> {
        let connection_id = self.connection_id(deadline).await?;
        let transaction_id = rand::random();
        let request = proto::AnnounceRequest {
            connection_id,
            transaction_id,
            info_hash: params.info_hash,
            peer_id: params.peer_id,
            downloaded: params.downloaded,
            left: params.left,
            uploaded: params.uploaded,
            event: params.event,
            ip_address: params.ip.unwrap_or(Ipv4Addr::UNSPECIFIED),
            key: params.key.unwrap_or(0),
            num_want: params.num_want_or_default(),
            port: params.port,
        };
        self.socket.send(&request.to_bytes()).await?;

        let reply = self
            .await_reply(transaction_id, Action::Announce, deadline)
            .await?;
        if reply.len() < 20 {
            return Err(Error::ProtocolViolation(format!(
                "short announce reply of {} bytes",
                reply.len()
            )));
        }
        let response = proto::AnnounceResponse::from_bytes(&reply)
            .map_err(|e| Error::ProtocolViolation(e.to_string()))?;
        Ok(Announce {
            interval: response.interval,
            complete: response.seeders,
            incomplete: response.leechers,
            peers: response
                .addresses
                .into_iter()
                .map(|addr| PeerInfo { addr, id: None })
                .collect(),
        })
    }

    async fn scrape_once(&mut self, info_hashes: &[Sha1], deadline: Instant) -> Result<Scrape> {
        let connection_id = self.connection_id(deadline).await?;
        let transaction_id = rand::random();
        let request = proto::ScrapeRequest {
            connection_id,
            transaction_id,
            info_hashes: info_hashes.to_vec(),
        };
        self.socket.send(&request.to_bytes()).await?;

        let reply = self
            .await_reply(transaction_id, Action::Scrape, deadline)
            .await?;
        let response = proto::ScrapeResponse::from_bytes(&reply)
            .map_err(|e| Error::ProtocolViolation(e.to_string()))?;
        if response.stats.len() != info_hashes.len() {
            return Err(Error::ProtocolViolation(format!(
                "scrape reply covers {} of {} torrents",
                response.stats.len(),
                info_hashes.len()
            )));
        }
        Ok(Scrape {
            entries: info_hashes
                .iter()
                .zip(response.stats)
                .map(|(&hash, stats)| {
                    (
                        hash,
                        ScrapeEntry {
                            complete: stats.seeders,
                            downloaded: stats.completed,
                            incomplete: stats.leechers,
                        },
                    )
                })
                .collect(),
        })
    }

    /// Cached connection id if still fresh, otherwise a CONNECT
    /// exchange within the caller's deadline.
    async fn connection_id(&mut self, deadline: Instant) -> Result<u64> {
        if let Some((id, issued)) = self.connection {
            if issued.elapsed() < CONNECTION_ID_LIFETIME {
                return Ok(id);
            }
            self.connection = None;
        }

        let transaction_id = rand::random();
        let request = proto::ConnectRequest { transaction_id };
        self.socket.send(&request.to_bytes()).await?;

        let reply = self
            .await_reply(transaction_id, Action::Connect, deadline)
            .await?;
        if reply.len() < 16 {
            return Err(Error::ProtocolViolation(format!(
                "short connect reply of {} bytes",
                reply.len()
            )));
        }
        let response = proto::ConnectResponse::from_bytes(&reply)
            .map_err(|e| Error::ProtocolViolation(e.to_string()))?;
        self.connection = Some((response.connection_id, Instant::now()));
        Ok(response.connection_id)
    }

    /// Wait for a datagram whose transaction id matches. Non-matching
    /// datagrams are ignored without consuming the deadline. A matching
    /// `action=3` frame surfaces its payload tail as a rejection.
    async fn await_reply(
        &mut self,
        transaction_id: u32,
        expected: Action,
        deadline: Instant,
    ) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let received = tokio::time::timeout_at(deadline.into(), self.socket.recv(&mut buf))
                .await
                .map_err(|_| Error::Timeout)?;
            let len = received?;
            let datagram = &buf[..len];
            if len < 8 {
                continue;
            }

            let action = u32::from_be_bytes(datagram[0..4].try_into().expect("span is 4 bytes"));
            let txid = u32::from_be_bytes(datagram[4..8].try_into().expect("span is 4 bytes"));
            if txid != transaction_id {
                continue;
            }

            match Action::from_u32(action) {
                Some(Action::Error) if len >= 9 => {
                    let reason = String::from_utf8_lossy(&datagram[8..]).into_owned();
                    return Err(Error::TrackerRejected(reason));
                }
                Some(action) if action == expected => return Ok(datagram.to_vec()),
                _ => continue,
            }
        }
    }
}
