//! Tracker loopback tests: a real `TrackerServer` + `MemoryTracker`
//! behind the real `TrackerClient`, over both transports.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use shoal::tracker::{AnnounceEvent, AnnounceParams, TrackerClient};
use shoal::trackerd::{MemoryTracker, TrackerServer, TrackerServerConfig};
use shoal::{Error, PeerId, Sha1};

const LOCAL_HTTP: &str = "127.0.0.1:0";

async fn start_tracker(config: TrackerServerConfig) -> (Option<SocketAddr>, Option<SocketAddr>) {
    let server = TrackerServer::bind(config).await.unwrap();
    let http_addr = server.http_addr();
    let udp_addr = server.udp_addr();
    tokio::spawn(MemoryTracker::new(900).serve(server));
    (http_addr, udp_addr)
}

fn params(info_hash: Sha1, tag: u8, port: u16, left: u64) -> AnnounceParams {
    AnnounceParams {
        info_hash,
        peer_id: PeerId::from_bytes([tag; 20]),
        ip: None,
        port,
        uploaded: 0,
        downloaded: 0,
        left,
        event: AnnounceEvent::Started,
        key: Some(u32::from_be_bytes([tag, tag, tag, tag])),
        num_want: Some(50),
    }
}

#[tokio::test]
async fn http_announce_and_scrape() {
    let (http_addr, _) = start_tracker(TrackerServerConfig {
        http_addr: Some(LOCAL_HTTP.parse().unwrap()),
        udp_addr: None,
        filter: None,
    })
    .await;
    let url = format!("http://{}/announce", http_addr.unwrap());
    let info_hash = Sha1::hash(b"http swarm");

    // first peer sees an empty swarm apart from itself
    let mut alice = TrackerClient::new(&url).await.unwrap();
    let announce = alice.announce(&params(info_hash, 1, 6881, 1000)).await.unwrap();
    assert_eq!(announce.interval, 900);
    assert_eq!(announce.complete, 0);
    assert_eq!(announce.incomplete, 1);
    assert!(announce.peers.is_empty());

    // a seeder joins and is handed the first peer
    let mut bob = TrackerClient::new(&url).await.unwrap();
    let announce = bob.announce(&params(info_hash, 2, 6882, 0)).await.unwrap();
    assert_eq!(announce.complete, 1);
    assert_eq!(announce.incomplete, 1);
    assert_eq!(announce.peers.len(), 1);
    assert_eq!(announce.peers[0].addr.port(), 6881);
    assert_eq!(*announce.peers[0].addr.ip(), Ipv4Addr::new(127, 0, 0, 1));

    let scrape = alice.scrape(&[info_hash]).await.unwrap();
    assert_eq!(scrape.entries.len(), 1);
    assert_eq!(scrape.entries[0].0, info_hash);
    assert_eq!(scrape.entries[0].1.complete, 1);
    assert_eq!(scrape.entries[0].1.incomplete, 1);
    assert_eq!(scrape.entries[0].1.downloaded, 0);

    // stopping removes the peer from the swarm
    let mut stop = params(info_hash, 1, 6881, 1000);
    stop.event = AnnounceEvent::Stopped;
    let announce = alice.announce(&stop).await.unwrap();
    assert!(announce.peers.is_empty());
    assert_eq!(announce.incomplete, 0);
}

#[tokio::test]
async fn http_filter_rejects_unknown_hashes() {
    let allowed = Sha1::hash(b"allowed");
    let (http_addr, _) = start_tracker(TrackerServerConfig {
        http_addr: Some(LOCAL_HTTP.parse().unwrap()),
        udp_addr: None,
        filter: Some(HashSet::from([allowed])),
    })
    .await;
    let url = format!("http://{}/announce", http_addr.unwrap());

    let mut client = TrackerClient::new(&url).await.unwrap();
    client.announce(&params(allowed, 1, 6881, 0)).await.unwrap();

    let result = client
        .announce(&params(Sha1::hash(b"other"), 1, 6881, 0))
        .await;
    assert!(matches!(result, Err(Error::TrackerRejected(_))));
}

#[tokio::test]
async fn udp_announce_with_connect_handshake() {
    let (_, udp_addr) = start_tracker(TrackerServerConfig {
        http_addr: None,
        udp_addr: Some(LOCAL_HTTP.parse().unwrap()),
        filter: None,
    })
    .await;
    let url = format!("udp://{}", udp_addr.unwrap());
    let info_hash = Sha1::hash(b"udp swarm");

    let mut alice = TrackerClient::new(&url).await.unwrap();
    let announce = alice.announce(&params(info_hash, 1, 7001, 500)).await.unwrap();
    assert_eq!(announce.interval, 900);
    assert_eq!(announce.incomplete, 1);
    assert_eq!(announce.complete, 0);
    assert!(announce.peers.is_empty());

    let mut bob = TrackerClient::new(&url).await.unwrap();
    let announce = bob.announce(&params(info_hash, 2, 7002, 0)).await.unwrap();
    assert_eq!(announce.complete, 1);
    assert_eq!(announce.peers.len(), 1);
    assert_eq!(announce.peers[0].addr.port(), 7001);

    let scrape = bob.scrape(&[info_hash]).await.unwrap();
    assert_eq!(scrape.entries[0].1.complete, 1);
    assert_eq!(scrape.entries[0].1.incomplete, 1);
}

#[tokio::test]
async fn udp_rejects_filtered_hash_with_error_frame() {
    let allowed = Sha1::hash(b"allowed");
    let (_, udp_addr) = start_tracker(TrackerServerConfig {
        http_addr: None,
        udp_addr: Some(LOCAL_HTTP.parse().unwrap()),
        filter: Some(HashSet::from([allowed])),
    })
    .await;
    let url = format!("udp://{}", udp_addr.unwrap());

    let mut client = TrackerClient::new(&url).await.unwrap();
    let result = client
        .announce(&params(Sha1::hash(b"other"), 3, 7003, 0))
        .await;
    assert!(matches!(result, Err(Error::TrackerRejected(_))));
}

#[tokio::test]
async fn udp_drops_announces_without_a_connection_id() {
    use shoal::tracker::proto::{AnnounceRequest, Wire};

    let (_, udp_addr) = start_tracker(TrackerServerConfig {
        http_addr: None,
        udp_addr: Some(LOCAL_HTTP.parse().unwrap()),
        filter: None,
    })
    .await;

    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.connect(udp_addr.unwrap()).await.unwrap();

    let frame = AnnounceRequest {
        connection_id: 0xdead_beef_dead_beef,
        transaction_id: 77,
        info_hash: Sha1::hash(b"swarm"),
        peer_id: PeerId::from_bytes([9; 20]),
        downloaded: 0,
        left: 0,
        uploaded: 0,
        event: AnnounceEvent::Started,
        ip_address: Ipv4Addr::UNSPECIFIED,
        key: 0,
        num_want: 50,
        port: 6881,
    };
    socket.send(&frame.to_bytes()).await.unwrap();

    let mut buf = [0u8; 64];
    let reply = tokio::time::timeout(Duration::from_millis(500), socket.recv(&mut buf)).await;
    assert!(reply.is_err(), "unauthenticated announce must be ignored");
}
