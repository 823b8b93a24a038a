//! In-memory tracker backend: swarm tables keyed by info-hash, peers
//! keyed by `ip:port`, counters adjusted on state transitions and a
//! periodic sweep that evicts silent peers.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use rand::seq::IteratorRandom;

use super::{AnnounceReply, TrackerRequest, TrackerServer};
use crate::tracker::{AnnounceEvent, PeerInfo, ScrapeEntry};
use crate::{PeerId, Sha1};

/// Peers that have not announced for this long are evicted; also the
/// sweep period.
pub const PEER_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Announce interval advertised to clients.
pub const DEFAULT_INTERVAL: u32 = 900;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerState {
    Seeder,
    Leecher,
}

#[derive(Debug, Clone)]
struct SwarmPeer {
    id: PeerId,
    state: PeerState,
    last_updated: Instant,
}

#[derive(Debug, Default)]
struct Swarm {
    complete: u32,
    incomplete: u32,
    downloaded: u32,
    peers: HashMap<SocketAddrV4, SwarmPeer>,
}

impl Swarm {
    fn count_in(&mut self, state: PeerState) {
        match state {
            PeerState::Seeder => self.complete += 1,
            PeerState::Leecher => self.incomplete += 1,
        }
    }

    fn count_out(&mut self, state: PeerState) {
        match state {
            PeerState::Seeder => self.complete = self.complete.saturating_sub(1),
            PeerState::Leecher => self.incomplete = self.incomplete.saturating_sub(1),
        }
    }

    fn stats(&self) -> ScrapeEntry {
        ScrapeEntry {
            complete: self.complete,
            downloaded: self.downloaded,
            incomplete: self.incomplete,
        }
    }
}

#[derive(Debug)]
pub struct MemoryTracker {
    swarms: HashMap<Sha1, Swarm>,
    interval: u32,
    peer_timeout: Duration,
}

impl Default for MemoryTracker {
    fn default() -> Self {
        Self::new(DEFAULT_INTERVAL)
    }
}

impl MemoryTracker {
    pub fn new(interval: u32) -> Self {
        Self {
            swarms: HashMap::new(),
            interval,
            peer_timeout: PEER_TIMEOUT,
        }
    }

    /// Consume requests from the server until its listeners stop,
    /// sweeping stale peers on a timer.
    pub async fn serve(mut self, mut server: TrackerServer) {
        let mut sweep = tokio::time::interval(self.peer_timeout);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        sweep.tick().await; // the first tick fires immediately

        loop {
            tokio::select! {
                request = server.recv() => match request {
                    Some(TrackerRequest::Announce(request)) => {
                        let reply = self.announce(
                            request.info_hash,
                            request.peer_id,
                            request.addr,
                            request.left,
                            request.event,
                            request.num_want,
                        );
                        request.respond(reply);
                    }
                    Some(TrackerRequest::Scrape(request)) => {
                        let entries = self.scrape(&request.info_hashes);
                        request.respond(entries);
                    }
                    None => break,
                },
                _ = sweep.tick() => self.sweep().await,
            }
        }
    }

    pub fn announce(
        &mut self,
        info_hash: Sha1,
        peer_id: PeerId,
        addr: SocketAddrV4,
        left: u64,
        event: AnnounceEvent,
        num_want: u32,
    ) -> AnnounceReply {
        let swarm = self.swarms.entry(info_hash).or_default();

        if event == AnnounceEvent::Stopped {
            if let Some(peer) = swarm.peers.remove(&addr) {
                swarm.count_out(peer.state);
            }
            let reply = AnnounceReply {
                interval: self.interval,
                complete: swarm.complete,
                incomplete: swarm.incomplete,
                peers: Vec::new(),
            };
            if swarm.peers.is_empty() {
                self.swarms.remove(&info_hash);
            }
            return reply;
        }

        let state = if event == AnnounceEvent::Completed || left == 0 {
            PeerState::Seeder
        } else {
            PeerState::Leecher
        };

        match swarm.peers.get_mut(&addr) {
            Some(peer) => {
                let previous = peer.state;
                peer.state = state;
                peer.id = peer_id;
                peer.last_updated = Instant::now();
                if previous == PeerState::Leecher && state == PeerState::Seeder {
                    swarm.incomplete = swarm.incomplete.saturating_sub(1);
                    swarm.complete += 1;
                    swarm.downloaded += 1;
                } else if previous == PeerState::Seeder && state == PeerState::Leecher {
                    swarm.complete = swarm.complete.saturating_sub(1);
                    swarm.incomplete += 1;
                }
            }
            None => {
                swarm.peers.insert(
                    addr,
                    SwarmPeer {
                        id: peer_id,
                        state,
                        last_updated: Instant::now(),
                    },
                );
                swarm.count_in(state);
            }
        }

        // a uniform sample of other peers, never the requester
        let peers = swarm
            .peers
            .iter()
            .filter(|(peer_addr, _)| **peer_addr != addr)
            .choose_multiple(&mut rand::thread_rng(), num_want as usize)
            .into_iter()
            .map(|(peer_addr, peer)| PeerInfo {
                addr: *peer_addr,
                id: Some(peer.id),
            })
            .collect();

        AnnounceReply {
            interval: self.interval,
            complete: swarm.complete,
            incomplete: swarm.incomplete,
            peers,
        }
    }

    /// Stats for the requested torrents; an empty request reports
    /// every swarm.
    pub fn scrape(&self, info_hashes: &[Sha1]) -> Vec<(Sha1, ScrapeEntry)> {
        if info_hashes.is_empty() {
            return self
                .swarms
                .iter()
                .map(|(hash, swarm)| (*hash, swarm.stats()))
                .collect();
        }

        info_hashes
            .iter()
            .map(|hash| {
                let stats = self
                    .swarms
                    .get(hash)
                    .map(Swarm::stats)
                    .unwrap_or(ScrapeEntry {
                        complete: 0,
                        downloaded: 0,
                        incomplete: 0,
                    });
                (*hash, stats)
            })
            .collect()
    }

    /// Evict peers that have been silent past the timeout, yielding
    /// between swarms so a large table does not stall the loop.
    pub async fn sweep(&mut self) {
        let hashes = self.swarms.keys().copied().collect::<Vec<_>>();
        for hash in hashes {
            if let Some(swarm) = self.swarms.get_mut(&hash) {
                let timeout = self.peer_timeout;
                let mut evicted = 0u32;
                let stale = swarm
                    .peers
                    .iter()
                    .filter(|(_, peer)| peer.last_updated.elapsed() > timeout)
                    .map(|(addr, _)| *addr)
                    .collect::<Vec<_>>();
                for addr in stale {
                    if let Some(peer) = swarm.peers.remove(&addr) {
                        swarm.count_out(peer.state);
                        evicted += 1;
                    }
                }
                if evicted > 0 {
                    tracing::debug!(info_hash = %hash, evicted, "swept stale peers");
                }
                if swarm.peers.is_empty() {
                    self.swarms.remove(&hash);
                }
            }
            tokio::task::yield_now().await;
        }
    }

    #[cfg(test)]
    fn counters(&self, info_hash: Sha1) -> Option<(u32, u32, u32)> {
        self.swarms
            .get(&info_hash)
            .map(|swarm| (swarm.complete, swarm.incomplete, swarm.downloaded))
    }

    #[cfg(test)]
    fn peer_count(&self, info_hash: Sha1) -> usize {
        self.swarms
            .get(&info_hash)
            .map(|swarm| swarm.peers.len())
            .unwrap_or(0)
    }

    #[cfg(test)]
    fn backdate_peer(&mut self, info_hash: Sha1, addr: SocketAddrV4, by: Duration) {
        let peer = self
            .swarms
            .get_mut(&info_hash)
            .and_then(|swarm| swarm.peers.get_mut(&addr))
            .expect("peer must exist");
        peer.last_updated = Instant::now() - by;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(host: u8, port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, host), port)
    }

    fn id(tag: u8) -> PeerId {
        let mut bytes = [tag; 20];
        bytes[0] = b'-';
        PeerId::from_bytes(bytes)
    }

    #[test]
    fn counters_track_peer_population() {
        let mut tracker = MemoryTracker::default();
        let hash = Sha1::hash(b"swarm");

        tracker.announce(hash, id(1), addr(1, 6881), 100, AnnounceEvent::Started, 50);
        tracker.announce(hash, id(2), addr(2, 6881), 0, AnnounceEvent::Started, 50);
        tracker.announce(hash, id(3), addr(3, 6881), 100, AnnounceEvent::Started, 50);

        let (complete, incomplete, downloaded) = tracker.counters(hash).unwrap();
        assert_eq!((complete, incomplete, downloaded), (1, 2, 0));
        assert_eq!(complete + incomplete, tracker.peer_count(hash) as u32);
    }

    #[test]
    fn leecher_to_seeder_transition_counts_a_download() {
        let mut tracker = MemoryTracker::default();
        let hash = Sha1::hash(b"swarm");

        tracker.announce(hash, id(1), addr(1, 6881), 100, AnnounceEvent::Started, 50);
        assert_eq!(tracker.counters(hash).unwrap(), (0, 1, 0));

        tracker.announce(hash, id(1), addr(1, 6881), 0, AnnounceEvent::Completed, 50);
        assert_eq!(tracker.counters(hash).unwrap(), (1, 0, 1));

        // repeat announces as seeder do not double count
        tracker.announce(hash, id(1), addr(1, 6881), 0, AnnounceEvent::None, 50);
        assert_eq!(tracker.counters(hash).unwrap(), (1, 0, 1));
    }

    #[test]
    fn stopped_removes_the_peer_and_returns_no_peers() {
        let mut tracker = MemoryTracker::default();
        let hash = Sha1::hash(b"swarm");

        tracker.announce(hash, id(1), addr(1, 6881), 100, AnnounceEvent::Started, 50);
        tracker.announce(hash, id(2), addr(2, 6881), 100, AnnounceEvent::Started, 50);

        let reply = tracker.announce(hash, id(1), addr(1, 6881), 100, AnnounceEvent::Stopped, 50);
        assert!(reply.peers.is_empty());
        assert_eq!(tracker.counters(hash).unwrap(), (0, 1, 0));
        assert_eq!(tracker.peer_count(hash), 1);

        // last peer leaving drops the swarm entirely
        tracker.announce(hash, id(2), addr(2, 6881), 100, AnnounceEvent::Stopped, 50);
        assert!(tracker.counters(hash).is_none());
    }

    #[test]
    fn sample_excludes_requester_and_honors_num_want() {
        let mut tracker = MemoryTracker::default();
        let hash = Sha1::hash(b"swarm");

        for i in 1..=10 {
            tracker.announce(hash, id(i), addr(i, 6881), 100, AnnounceEvent::Started, 0);
        }

        let reply = tracker.announce(hash, id(1), addr(1, 6881), 100, AnnounceEvent::None, 4);
        assert_eq!(reply.peers.len(), 4);
        assert!(reply.peers.iter().all(|p| p.addr != addr(1, 6881)));

        let reply = tracker.announce(hash, id(1), addr(1, 6881), 100, AnnounceEvent::None, 50);
        assert_eq!(reply.peers.len(), 9);
    }

    #[test]
    fn scrape_reports_requested_and_all_swarms() {
        let mut tracker = MemoryTracker::default();
        let hash_a = Sha1::hash(b"a");
        let hash_b = Sha1::hash(b"b");

        tracker.announce(hash_a, id(1), addr(1, 6881), 0, AnnounceEvent::Started, 50);
        tracker.announce(hash_b, id(2), addr(2, 6881), 100, AnnounceEvent::Started, 50);

        let entries = tracker.scrape(&[hash_a]);
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0],
            (
                hash_a,
                ScrapeEntry {
                    complete: 1,
                    downloaded: 0,
                    incomplete: 0
                }
            )
        );

        // unknown hashes scrape as zeroes
        let unknown = Sha1::hash(b"unknown");
        let entries = tracker.scrape(&[unknown]);
        assert_eq!(entries[0].1, ScrapeEntry { complete: 0, downloaded: 0, incomplete: 0 });

        let all = tracker.scrape(&[]);
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn sweep_evicts_silent_peers() {
        let mut tracker = MemoryTracker::default();
        let hash = Sha1::hash(b"swarm");

        tracker.announce(hash, id(1), addr(1, 6881), 0, AnnounceEvent::Started, 50);
        tracker.announce(hash, id(2), addr(2, 6881), 100, AnnounceEvent::Started, 50);
        tracker.backdate_peer(hash, addr(1, 6881), PEER_TIMEOUT + Duration::from_secs(1));

        tracker.sweep().await;
        assert_eq!(tracker.counters(hash).unwrap(), (0, 1, 0));
        assert_eq!(tracker.peer_count(hash), 1);

        tracker.backdate_peer(hash, addr(2, 6881), PEER_TIMEOUT + Duration::from_secs(1));
        tracker.sweep().await;
        assert!(tracker.counters(hash).is_none());
    }

    #[test]
    fn downloaded_is_monotone_over_random_announces() {
        let mut tracker = MemoryTracker::default();
        let hash = Sha1::hash(b"swarm");
        let mut last_downloaded = 0;

        let events = [
            AnnounceEvent::Started,
            AnnounceEvent::None,
            AnnounceEvent::Completed,
            AnnounceEvent::None,
            AnnounceEvent::Started,
            AnnounceEvent::Completed,
        ];
        for (round, event) in events.iter().cycle().take(30).enumerate() {
            let peer = (round % 3) as u8 + 1;
            let left = if *event == AnnounceEvent::Completed { 0 } else { 100 };
            tracker.announce(hash, id(peer), addr(peer, 6881), left, *event, 50);

            let (complete, incomplete, downloaded) = tracker.counters(hash).unwrap();
            assert_eq!(complete + incomplete, tracker.peer_count(hash) as u32);
            assert!(downloaded >= last_downloaded);
            last_downloaded = downloaded;
        }
    }
}
