//! HTTP transport of the tracker server. Queries arrive with
//! `info_hash`, `peer_id` and `key` as URL-binary escapes of raw
//! bytes, so the query string is parsed by hand instead of through a
//! UTF-8 form decoder.

use std::net::{IpAddr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use axum::extract::{ConnectInfo, RawQuery, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use super::{
    AnnounceReply, AnnounceRequest, AnnounceResponder, ListenerShared, ScrapeRequest,
    ScrapeResponder,
};
use crate::percent::unescape_bytes;
use crate::tracker::{encode_compact_peers, AnnounceEvent, ScrapeEntry, DEFAULT_NUM_WANT};
use crate::{PeerId, Result, Sha1};

pub(super) async fn spawn(
    addr: SocketAddr,
    shared: Arc<ListenerShared>,
) -> Result<(SocketAddr, AbortHandle)> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;

    let app = Router::new()
        .route("/announce", get(handle_announce))
        .route("/scrape", get(handle_scrape))
        .with_state(shared);

    let handle = tokio::spawn(async move {
        let service = app.into_make_service_with_connect_info::<SocketAddr>();
        if let Err(error) = axum::serve(listener, service).await {
            tracing::error!("http tracker listener failed: {error}");
        }
    })
    .abort_handle();

    Ok((local_addr, handle))
}

async fn handle_announce(
    State(shared): State<Arc<ListenerShared>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Response {
    let query = match QueryParams::parse(query.as_deref().unwrap_or("")) {
        Some(query) => query,
        None => return bencoded(failure_body("malformed query string")),
    };

    let request = match build_announce(&query, peer, &headers) {
        Ok(build) => build,
        Err(reason) => return bencoded(failure_body(reason)),
    };

    let (reply_sender, reply_receiver) = oneshot::channel();
    shared.push_announce(request(AnnounceResponder::Http {
        reply: reply_sender,
    }));

    match reply_receiver.await {
        Ok(body) => bencoded(body),
        Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

async fn handle_scrape(
    State(shared): State<Arc<ListenerShared>>,
    RawQuery(query): RawQuery,
) -> Response {
    let query = match QueryParams::parse(query.as_deref().unwrap_or("")) {
        Some(query) => query,
        None => return bencoded(failure_body("malformed query string")),
    };

    let mut info_hashes = Vec::new();
    for value in query.all("info_hash") {
        match <[u8; 20]>::try_from(value) {
            Ok(bytes) => info_hashes.push(Sha1::from_bytes(bytes)),
            Err(_) => return bencoded(failure_body("info_hash must be 20 bytes")),
        }
    }

    let (reply_sender, reply_receiver) = oneshot::channel();
    shared.push_scrape(ScrapeRequest {
        info_hashes,
        responder: ScrapeResponder::Http {
            reply: reply_sender,
        },
    });

    match reply_receiver.await {
        Ok(body) => bencoded(body),
        Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

fn bencoded(body: Vec<u8>) -> Response {
    ([(header::CONTENT_TYPE, "text/plain")], body).into_response()
}

type BuildAnnounce = Box<dyn FnOnce(AnnounceResponder) -> AnnounceRequest + Send>;

fn build_announce(
    query: &QueryParams,
    peer: SocketAddr,
    headers: &HeaderMap,
) -> std::result::Result<BuildAnnounce, &'static str> {
    let info_hash = query
        .first("info_hash")
        .ok_or("missing info_hash")
        .and_then(|v| <[u8; 20]>::try_from(v).map_err(|_| "info_hash must be 20 bytes"))
        .map(Sha1::from_bytes)?;
    let peer_id = query
        .first("peer_id")
        .ok_or("missing peer_id")
        .and_then(|v| <[u8; 20]>::try_from(v).map_err(|_| "peer_id must be 20 bytes"))
        .map(PeerId::from_bytes)?;
    let port = query
        .first_str("port")
        .ok_or("missing port")?
        .parse::<u16>()
        .map_err(|_| "port is not a number")?;

    let uploaded = query.first_u64("uploaded").unwrap_or(0);
    let downloaded = query.first_u64("downloaded").unwrap_or(0);
    let left = query.first_u64("left").unwrap_or(0);
    let event = match query.first_str("event").as_deref() {
        None | Some("") => AnnounceEvent::None,
        Some("started") => AnnounceEvent::Started,
        Some("completed") => AnnounceEvent::Completed,
        Some("stopped") => AnnounceEvent::Stopped,
        Some(_) => return Err("unknown event"),
    };
    let num_want = query
        .first_u64("numwant")
        .map(|v| v.min(u64::from(u32::MAX)) as u32)
        .unwrap_or(DEFAULT_NUM_WANT);
    let compact = query.first_str("compact").as_deref() == Some("1");
    let key = query.first("key").map(|v| v.to_vec());

    let ip = resolve_client_ip(query, peer, headers);
    let ip = match ip {
        IpAddr::V4(ip) => ip,
        IpAddr::V6(_) => return Err("ipv6 peers are not supported"),
    };
    let addr = SocketAddrV4::new(ip, port);

    Ok(Box::new(move |responder| AnnounceRequest {
        info_hash,
        peer_id,
        addr,
        uploaded,
        downloaded,
        left,
        event,
        key,
        num_want,
        compact,
        responder,
    }))
}

/// Socket peer address, overridden by the first `X-Forwarded-For` hop,
/// overridden by an explicit `ip` parameter.
fn resolve_client_ip(query: &QueryParams, peer: SocketAddr, headers: &HeaderMap) -> IpAddr {
    let mut ip = peer.ip();

    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first_hop) = forwarded.split(',').next() {
            if let Ok(parsed) = first_hop.trim().parse() {
                ip = parsed;
            }
        }
    }

    if let Some(param) = query.first_str("ip") {
        if let Ok(parsed) = param.parse() {
            ip = parsed;
        }
    }

    ip
}

/// Query parameters with byte-string values. Keys repeat (`info_hash`
/// in scrapes), so this is an ordered multimap.
struct QueryParams {
    params: Vec<(String, Vec<u8>)>,
}

impl QueryParams {
    fn parse(raw: &str) -> Option<QueryParams> {
        let mut params = Vec::new();
        for pair in raw.split('&') {
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = String::from_utf8(unescape_bytes(key.as_bytes())?).ok()?;
            let value = unescape_bytes(value.as_bytes())?;
            params.push((key, value));
        }
        Some(QueryParams { params })
    }

    fn first(&self, key: &str) -> Option<&[u8]> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    fn first_str(&self, key: &str) -> Option<String> {
        self.first(key)
            .and_then(|v| std::str::from_utf8(v).ok())
            .map(str::to_owned)
    }

    fn first_u64(&self, key: &str) -> Option<u64> {
        self.first_str(key)?.parse().ok()
    }

    fn all(&self, key: &str) -> Vec<&[u8]> {
        self.params
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
            .collect()
    }
}

pub(super) fn announce_body(compact: bool, reply: &AnnounceReply) -> Vec<u8> {
    bencode::encode_fn(|e| {
        let mut dict = e.dict();
        dict.push(b"complete", reply.complete);
        dict.push(b"incomplete", reply.incomplete);
        dict.push(b"interval", reply.interval);
        if compact {
            let peers = encode_compact_peers(reply.peers.iter().map(|p| &p.addr));
            dict.push_with_encoder(b"peers", |e| e.bytes(&peers));
        } else {
            dict.push_with_encoder(b"peers", |e| {
                let mut list = e.list();
                for peer in &reply.peers {
                    list.push_with_encoder(|e| {
                        let mut entry = e.dict();
                        entry.push(b"ip", peer.addr.ip().to_string());
                        entry.push(b"port", peer.addr.port());
                        if let Some(id) = peer.id {
                            entry.push_with_encoder(b"peer id", |e| e.bytes(id.as_bytes()));
                        }
                    });
                }
            });
        }
    })
}

pub(super) fn scrape_body(entries: &[(Sha1, ScrapeEntry)]) -> Vec<u8> {
    bencode::encode_fn(|e| {
        let mut dict = e.dict();
        dict.push_with_encoder(b"files", |e| {
            let mut files = e.dict();
            for (hash, entry) in entries {
                files.push_with_encoder(hash.as_bytes(), |e| {
                    let mut stats = e.dict();
                    stats.push(b"complete", entry.complete);
                    stats.push(b"downloaded", entry.downloaded);
                    stats.push(b"incomplete", entry.incomplete);
                });
            }
        });
    })
}

pub(super) fn failure_body(reason: &str) -> Vec<u8> {
    bencode::encode_fn(|e| {
        let mut dict = e.dict();
        dict.push(b"failure reason", reason);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::PeerInfo;
    use std::net::Ipv4Addr;

    #[test]
    fn query_keeps_binary_values_verbatim() {
        let raw = "info_hash=%00%01%ff-abc&port=6881&peer_id=AZ%2f";
        let query = QueryParams::parse(raw).unwrap();
        assert_eq!(query.first("info_hash").unwrap(), &[0x00, 0x01, 0xff, b'-', b'a', b'b', b'c']);
        assert_eq!(query.first("peer_id").unwrap(), b"AZ/");
        assert_eq!(query.first_u64("port"), Some(6881));
        assert!(QueryParams::parse("x=%zz").is_none());
    }

    #[test]
    fn repeated_keys_are_kept_in_order() {
        let query = QueryParams::parse("info_hash=a&info_hash=b").unwrap();
        assert_eq!(query.all("info_hash"), vec![b"a".as_slice(), b"b".as_slice()]);
    }

    #[test]
    fn failure_body_layout() {
        assert_eq!(
            failure_body("something happened"),
            b"d14:failure reason18:something happenede"
        );
    }

    #[test]
    fn announce_body_compact() {
        let reply = AnnounceReply {
            interval: 900,
            complete: 0,
            incomplete: 1,
            peers: vec![PeerInfo {
                addr: SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 42), 8080),
                id: None,
            }],
        };
        let body = announce_body(true, &reply);
        let mut expected = b"d8:completei0e10:incompletei1e8:intervali900e5:peers6:".to_vec();
        expected.extend_from_slice(&[192, 168, 0, 42, 31, 144]);
        expected.push(b'e');
        assert_eq!(body, expected);
    }

    #[test]
    fn announce_body_with_peer_dicts() {
        let reply = AnnounceReply {
            interval: 900,
            complete: 0,
            incomplete: 1,
            peers: vec![PeerInfo {
                addr: SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 42), 6881),
                id: Some(PeerId::from_bytes(*b"abcdefghijklmnopqrst")),
            }],
        };
        let body = announce_body(false, &reply);
        let parsed = crate::tracker::http::parse_announce_response(&body).unwrap();
        assert_eq!(parsed.interval, 900);
        assert_eq!(parsed.peers.len(), 1);
        assert_eq!(
            parsed.peers[0].id,
            Some(PeerId::from_bytes(*b"abcdefghijklmnopqrst"))
        );
    }

    #[test]
    fn scrape_body_round_trips_through_client_parser() {
        let hash = Sha1::hash(b"content");
        let body = scrape_body(&[(
            hash,
            ScrapeEntry {
                complete: 1,
                downloaded: 2,
                incomplete: 3,
            },
        )]);
        let scrape = crate::tracker::http::parse_scrape_response(&body).unwrap();
        assert_eq!(scrape.entries, vec![(
            hash,
            ScrapeEntry {
                complete: 1,
                downloaded: 2,
                incomplete: 3,
            },
        )]);
    }
}
