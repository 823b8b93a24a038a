use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use crate::percent::escape_bytes;
use crate::tracker::{
    decode_compact_peers, Announce, AnnounceParams, PeerInfo, Scrape, ScrapeEntry,
};
use crate::{Error, PeerId, Result, Sha1};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct TrackerHttpClient {
    announce_url: String,
    client: reqwest::Client,
}

impl TrackerHttpClient {
    pub fn new(announce_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;
        Ok(Self {
            announce_url: announce_url.into(),
            client,
        })
    }

    pub async fn announce(&mut self, params: &AnnounceParams) -> Result<Announce> {
        let mut url = format!(
            "{}?info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1&numwant={}",
            self.announce_url,
            escape_bytes(params.info_hash.as_bytes()),
            escape_bytes(params.peer_id.as_bytes()),
            params.port,
            params.uploaded,
            params.downloaded,
            params.left,
            params.num_want_or_default(),
        );
        if let Some(ip) = params.ip {
            url.push_str(&format!("&ip={ip}"));
        }
        if let Some(event) = params.event.query_value() {
            url.push_str(&format!("&event={event}"));
        }
        if let Some(key) = params.key {
            url.push_str(&format!("&key={}", escape_bytes(&key.to_be_bytes())));
        }

        let body = self.fetch(url).await?;
        parse_announce_response(&body)
    }

    pub async fn scrape(&mut self, info_hashes: &[Sha1]) -> Result<Scrape> {
        let mut url = scrape_url(&self.announce_url)?;
        for (i, hash) in info_hashes.iter().enumerate() {
            url.push(if i == 0 { '?' } else { '&' });
            url.push_str("info_hash=");
            url.push_str(&escape_bytes(hash.as_bytes()));
        }

        let body = self.fetch(url).await?;
        parse_scrape_response(&body)
    }

    async fn fetch(&self, url: String) -> Result<bytes::Bytes> {
        let response = self
            .client
            .get(url)
            .header(reqwest::header::CACHE_CONTROL, "no-store")
            .send()
            .await
            .map_err(request_error)?;
        let response = response.error_for_status().map_err(request_error)?;
        response.bytes().await.map_err(request_error)
    }
}

fn request_error(error: reqwest::Error) -> Error {
    if error.is_timeout() {
        Error::Timeout
    } else {
        Error::Io(std::io::Error::other(error))
    }
}

/// Derive the scrape URL by swapping the `announce` at the start of the
/// last path component for `scrape`. Trackers without an `announce`
/// component do not support scraping.
pub fn scrape_url(announce_url: &str) -> Result<String> {
    let (query_free, _query) = match announce_url.split_once('?') {
        Some((base, query)) => (base, Some(query)),
        None => (announce_url, None),
    };
    let (prefix, last) = match query_free.rsplit_once('/') {
        Some((prefix, last)) => (prefix, last),
        None => return Err(Error::BadUrl(announce_url.to_string())),
    };
    match last.strip_prefix("announce") {
        Some(suffix) => Ok(format!("{prefix}/scrape{suffix}")),
        None => Err(Error::BadUrl(announce_url.to_string())),
    }
}

pub(crate) fn parse_announce_response(body: &[u8]) -> Result<Announce> {
    let value = bencode::decode_value(body)?;
    let dict = value.as_dict()?;

    if let Some(reason) = dict.find::<String>(b"failure reason")? {
        return Err(Error::TrackerRejected(reason));
    }

    let complete = dict.require::<u32>(b"complete")?;
    let incomplete = dict.require::<u32>(b"incomplete")?;
    let interval = dict.require::<u32>(b"interval")?;

    let peers_value = dict.require_value(b"peers")?;
    let peers = match &peers_value.data {
        bencode::ValueData::Bytes(compact) => decode_compact_peers(compact)?
            .into_iter()
            .map(|addr| PeerInfo { addr, id: None })
            .collect(),
        bencode::ValueData::List(entries) => {
            let mut peers = Vec::with_capacity(entries.len());
            for entry in entries {
                peers.push(parse_peer_entry(entry)?);
            }
            peers
        }
        _ => {
            return Err(Error::ProtocolViolation(
                "peers must be a byte string or a list".into(),
            ))
        }
    };

    Ok(Announce {
        interval,
        complete,
        incomplete,
        peers,
    })
}

fn parse_peer_entry(value: &bencode::Value) -> Result<PeerInfo> {
    let dict = value.as_dict()?;
    let ip: Ipv4Addr = dict
        .require::<String>(b"ip")?
        .parse()
        .map_err(|_| Error::ProtocolViolation("peer ip is not a dotted quad".into()))?;
    let port = dict.require::<u16>(b"port")?;

    // trackers emit the id under "peer id", some older ones under "id"
    let id_bytes = match dict.find_value(b"peer id") {
        Some(value) => Some(value.as_bytes()?),
        None => match dict.find_value(b"id") {
            Some(value) => Some(value.as_bytes()?),
            None => None,
        },
    };
    let id = match id_bytes {
        Some(bytes) => Some(PeerId::from_bytes(bytes.try_into().map_err(|_| {
            Error::ProtocolViolation("peer id is not 20 bytes".into())
        })?)),
        None => None,
    };

    Ok(PeerInfo {
        addr: SocketAddrV4::new(ip, port),
        id,
    })
}

pub(crate) fn parse_scrape_response(body: &[u8]) -> Result<Scrape> {
    let value = bencode::decode_value(body)?;
    let dict = value.as_dict()?;

    if let Some(reason) = dict.find::<String>(b"failure reason")? {
        return Err(Error::TrackerRejected(reason));
    }

    let files = dict.require_value(b"files")?.as_dict()?;
    let mut entries = Vec::with_capacity(files.len());
    for (key, stats) in files.iter() {
        let hash: [u8; 20] = key
            .try_into()
            .map_err(|_| Error::ProtocolViolation("scrape key is not a 20-byte hash".into()))?;
        let stats = stats.as_dict()?;
        entries.push((
            Sha1::from_bytes(hash),
            ScrapeEntry {
                complete: stats.require(b"complete")?,
                downloaded: stats.require(b"downloaded")?,
                incomplete: stats.require(b"incomplete")?,
            },
        ));
    }

    Ok(Scrape { entries })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announce_with_peer_dicts() {
        let body = b"d8:completei0e10:incompletei1e8:intervali900e5:peersld4:porti6881e2:ip12:192.168.0.422:id20:abcdefghijklmnopqrstee";
        let announce = parse_announce_response(body).unwrap();
        assert_eq!(announce.complete, 0);
        assert_eq!(announce.incomplete, 1);
        assert_eq!(announce.interval, 900);
        assert_eq!(announce.peers.len(), 1);
        assert_eq!(
            announce.peers[0].addr,
            SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 42), 6881)
        );
        assert_eq!(
            announce.peers[0].id,
            Some(PeerId::from_bytes(*b"abcdefghijklmnopqrst"))
        );
    }

    #[test]
    fn announce_with_compact_peers() {
        let mut body = b"d8:completei0e10:incompletei1e8:intervali900e5:peers6:".to_vec();
        body.extend_from_slice(&[192, 168, 0, 42, 31, 144]);
        body.push(b'e');

        let announce = parse_announce_response(&body).unwrap();
        assert_eq!(announce.peers.len(), 1);
        assert_eq!(
            announce.peers[0].addr,
            SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 42), 8080)
        );
        assert_eq!(announce.peers[0].id, None);
    }

    #[test]
    fn announce_failure_reason() {
        let body = b"d14:failure reason18:something happenede";
        match parse_announce_response(body) {
            Err(Error::TrackerRejected(reason)) => assert_eq!(reason, "something happened"),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn announce_rejects_ragged_compact_peers() {
        let mut body = b"d8:completei0e10:incompletei1e8:intervali900e5:peers5:".to_vec();
        body.extend_from_slice(&[192, 168, 0, 42, 31]);
        body.push(b'e');
        assert!(parse_announce_response(&body).is_err());
    }

    #[test]
    fn announce_requires_counters() {
        let body = b"d8:intervali900e5:peers0:e";
        assert!(parse_announce_response(body).is_err());
    }

    #[test]
    fn scrape_preserves_raw_hash_keys() {
        let hash = Sha1::hash(b"content");
        let body = bencode::encode_fn(|e| {
            let mut dict = e.dict();
            dict.push_with_encoder(b"files", |e| {
                let mut files = e.dict();
                files.push_with_encoder(hash.as_bytes(), |e| {
                    let mut stats = e.dict();
                    stats.push(b"complete", 3u32);
                    stats.push(b"downloaded", 9u32);
                    stats.push(b"incomplete", 5u32);
                });
            });
        });

        let scrape = parse_scrape_response(&body).unwrap();
        assert_eq!(scrape.entries.len(), 1);
        assert_eq!(scrape.entries[0].0, hash);
        assert_eq!(
            scrape.entries[0].1,
            ScrapeEntry {
                complete: 3,
                downloaded: 9,
                incomplete: 5
            }
        );
    }

    #[test]
    fn scrape_url_derivation() {
        assert_eq!(
            scrape_url("http://t.example/announce").unwrap(),
            "http://t.example/scrape"
        );
        assert_eq!(
            scrape_url("http://t.example/x/announce.php").unwrap(),
            "http://t.example/x/scrape.php"
        );
        assert!(scrape_url("http://t.example/a").is_err());
        assert!(scrape_url("announce").is_err());
    }
}
