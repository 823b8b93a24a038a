//! Tracker client: announce and scrape over HTTP(S) or UDP, selected
//! by URL scheme.

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::{Error, PeerId, Result, Sha1};

pub mod http;
pub mod proto;
pub mod udp;

pub use http::TrackerHttpClient;
pub use udp::TrackerUdpClient;

/// Default number of peers requested from a tracker when the caller
/// does not say otherwise.
pub const DEFAULT_NUM_WANT: u32 = 50;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    #[default]
    None = 0,
    Completed = 1,
    Started = 2,
    Stopped = 3,
}

impl AnnounceEvent {
    /// Value of the HTTP `event` query parameter; `None` is omitted.
    pub fn query_value(&self) -> Option<&'static str> {
        match self {
            AnnounceEvent::None => None,
            AnnounceEvent::Completed => Some("completed"),
            AnnounceEvent::Started => Some("started"),
            AnnounceEvent::Stopped => Some("stopped"),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct AnnounceParams {
    pub info_hash: Sha1,
    pub peer_id: PeerId,
    pub ip: Option<Ipv4Addr>,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: AnnounceEvent,
    pub key: Option<u32>,
    pub num_want: Option<u32>,
}

impl AnnounceParams {
    pub fn num_want_or_default(&self) -> u32 {
        self.num_want.unwrap_or(DEFAULT_NUM_WANT)
    }
}

/// One peer from an announce response. Compact responses carry no id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerInfo {
    pub addr: SocketAddrV4,
    pub id: Option<PeerId>,
}

#[derive(Debug, Clone)]
pub struct Announce {
    pub interval: u32,
    pub complete: u32,
    pub incomplete: u32,
    pub peers: Vec<PeerInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrapeEntry {
    pub complete: u32,
    pub downloaded: u32,
    pub incomplete: u32,
}

#[derive(Debug, Clone)]
pub struct Scrape {
    pub entries: Vec<(Sha1, ScrapeEntry)>,
}

#[derive(Debug)]
pub enum TrackerClient {
    Http(TrackerHttpClient),
    Udp(TrackerUdpClient),
}

impl TrackerClient {
    pub async fn new(url: &str) -> Result<Self> {
        if let Some(authority) = url.strip_prefix("udp://") {
            let authority = authority.split('/').next().unwrap_or(authority);
            let mut addrs = tokio::net::lookup_host(authority)
                .await
                .map_err(|_| Error::BadUrl(url.to_string()))?;
            let addr = addrs
                .next()
                .ok_or_else(|| Error::BadUrl(url.to_string()))?;
            Ok(Self::Udp(TrackerUdpClient::new(addr).await?))
        } else if url.starts_with("http://") || url.starts_with("https://") {
            Ok(Self::Http(TrackerHttpClient::new(url.to_string())?))
        } else {
            Err(Error::UnsupportedTrackerScheme(url.to_string()))
        }
    }

    pub async fn announce(&mut self, params: &AnnounceParams) -> Result<Announce> {
        match self {
            Self::Http(client) => client.announce(params).await,
            Self::Udp(client) => client.announce(params).await,
        }
    }

    pub async fn scrape(&mut self, info_hashes: &[Sha1]) -> Result<Scrape> {
        match self {
            Self::Http(client) => client.scrape(info_hashes).await,
            Self::Udp(client) => client.scrape(info_hashes).await,
        }
    }
}

pub fn encode_compact_peers<'a>(addrs: impl IntoIterator<Item = &'a SocketAddrV4>) -> Vec<u8> {
    let mut buf = Vec::new();
    for addr in addrs {
        buf.extend_from_slice(&addr.ip().octets());
        buf.extend_from_slice(&addr.port().to_be_bytes());
    }
    buf
}

pub fn decode_compact_peers(buf: &[u8]) -> Result<Vec<SocketAddrV4>> {
    if buf.len() % 6 != 0 {
        return Err(Error::ProtocolViolation(format!(
            "compact peer list of {} bytes is not a multiple of 6",
            buf.len()
        )));
    }
    Ok(buf
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddrV4::new(ip, port)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_peers_round_trip() {
        let addrs = vec![
            SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 42), 8080),
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 6881),
        ];
        let buf = encode_compact_peers(&addrs);
        assert_eq!(buf.len(), 12);
        assert_eq!(buf[..6], [192, 168, 0, 42, 31, 144]);
        assert_eq!(decode_compact_peers(&buf).unwrap(), addrs);
    }

    #[test]
    fn compact_peers_reject_partial_entries() {
        assert!(decode_compact_peers(&[1, 2, 3, 4, 5]).is_err());
        assert!(decode_compact_peers(&[]).unwrap().is_empty());
    }

    #[tokio::test]
    async fn scheme_dispatch_rejects_unknown_schemes() {
        assert!(matches!(
            TrackerClient::new("wss://tracker.example/announce").await,
            Err(Error::UnsupportedTrackerScheme(_))
        ));
    }
}
