//! Whole-stack swarm test: a seeder and a leecher discover each other
//! through a real tracker and move content over the peer wire
//! protocol, plus handshake rejection behavior.

use std::sync::Arc;
use std::time::Duration;

use shoal::trackerd::{MemoryTracker, TrackerServer, TrackerServerConfig};
use shoal::{wire, Client, ClientConfig, MemoryStorage, Sha1, TorrentInfo};
use tokio::io::AsyncReadExt;

fn deterministic_content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// A single-file torrent whose piece hashes match `content`, pointed
/// at `announce`.
fn build_torrent(announce: &str, name: &str, piece_length: u32, content: &[u8]) -> TorrentInfo {
    let pieces: Vec<u8> = content
        .chunks(piece_length as usize)
        .flat_map(|chunk| *Sha1::hash(chunk).as_bytes())
        .collect();
    let buf = bencode::encode_fn(|e| {
        let mut dict = e.dict();
        dict.push(b"announce", announce);
        dict.push_with_encoder(b"info", |e| {
            let mut info = e.dict();
            info.push(b"name", name);
            info.push(b"piece length", piece_length);
            info.push(b"length", content.len() as u64);
            info.push_with_encoder(b"pieces", |e| e.bytes(&pieces));
        });
    });
    TorrentInfo::decode(&buf).unwrap()
}

async fn start_tracker() -> String {
    let server = TrackerServer::bind(TrackerServerConfig {
        http_addr: Some("127.0.0.1:0".parse().unwrap()),
        udp_addr: None,
        filter: None,
    })
    .await
    .unwrap();
    let addr = server.http_addr().unwrap();
    tokio::spawn(MemoryTracker::new(900).serve(server));
    format!("http://{addr}/announce")
}

fn local_client_config() -> ClientConfig {
    ClientConfig {
        listen_addr: Some("127.0.0.1:0".parse().unwrap()),
        ..Default::default()
    }
}

#[tokio::test]
async fn leecher_downloads_from_seeder_via_tracker() {
    // 3 pieces: 16 KiB, 16 KiB and a 7232-byte tail
    let content = deterministic_content(40_000);
    let tracker_url = start_tracker().await;
    let info = build_torrent(&tracker_url, "payload.bin", 16 * 1024, &content);

    let seeder = Client::new(local_client_config()).await.unwrap();
    let seeder_storage = Arc::new(MemoryStorage::seeded(content.clone()));
    let seeder_torrent = seeder.add_torrent(info.clone(), seeder_storage).await;

    let leecher = Client::new(local_client_config()).await.unwrap();
    let leecher_storage = Arc::new(MemoryStorage::empty(content.len() as u64));
    let leecher_torrent = leecher
        .add_torrent(info.clone(), leecher_storage.clone())
        .await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        if let Some(status) = leecher_torrent.status().await {
            if status.complete {
                assert_eq!(status.downloaded, content.len() as u64);
                break;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "download did not finish in time"
        );
        // keep poking the announcer until the seeder shows up
        leecher_torrent.request_more_peers();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    assert_eq!(leecher_storage.snapshot(), content);
    assert!(leecher_storage.written_everywhere());

    // the seeder served the whole payload
    let status = seeder_torrent.status().await.unwrap();
    assert_eq!(status.uploaded, content.len() as u64);
}

#[tokio::test]
async fn handshake_with_unknown_info_hash_gets_no_reply() {
    let tracker_url = start_tracker().await;
    let content = deterministic_content(16 * 1024);
    let info = build_torrent(&tracker_url, "known.bin", 16 * 1024, &content);

    let client = Client::new(local_client_config()).await.unwrap();
    let _torrent = client
        .add_torrent(info, Arc::new(MemoryStorage::seeded(content)))
        .await;

    let mut stream = tokio::net::TcpStream::connect(client.local_addr().unwrap())
        .await
        .unwrap();
    let handshake = wire::Handshake {
        info_hash: Sha1::hash(b"a different torrent"),
        peer_id: shoal::PeerId::from_bytes([7; 20]),
    };
    wire::write_handshake_async(&mut stream, &handshake)
        .await
        .unwrap();

    // the listener must close without sending its own handshake
    let mut buf = [0u8; 68];
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("connection should close promptly")
        .unwrap();
    assert_eq!(read, 0, "no handshake bytes may come back");
}

#[tokio::test]
async fn handshake_with_known_info_hash_is_answered() {
    let tracker_url = start_tracker().await;
    let content = deterministic_content(16 * 1024);
    let info = build_torrent(&tracker_url, "known.bin", 16 * 1024, &content);
    let info_hash = info.info_hash();

    let client = Client::new(local_client_config()).await.unwrap();
    let torrent = client
        .add_torrent(info, Arc::new(MemoryStorage::seeded(content)))
        .await;

    // wait for the seed check so the bitfield below is full
    while !torrent.status().await.unwrap().complete {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let mut stream = tokio::net::TcpStream::connect(client.local_addr().unwrap())
        .await
        .unwrap();
    let handshake = wire::Handshake {
        info_hash,
        peer_id: shoal::PeerId::from_bytes([7; 20]),
    };
    wire::write_handshake_async(&mut stream, &handshake)
        .await
        .unwrap();

    let reply = wire::read_handshake_async(&mut stream).await.unwrap();
    assert_eq!(reply.info_hash, info_hash);

    // the first frame after the handshake is the full bitfield
    let message = wire::read_message_async(&mut stream).await.unwrap();
    match message {
        wire::Message::Bitfield { bitfield } => assert_eq!(bitfield, vec![0b1000_0000]),
        other => panic!("expected a bitfield, got {other:?}"),
    }
}
