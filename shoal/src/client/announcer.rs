use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::task::AbortHandle;

use super::{ClientMsg, ClientSender, TorrentKey};
use crate::tracker::{AnnounceEvent, AnnounceParams, TrackerClient, DEFAULT_NUM_WANT};
use crate::{PeerId, Sha1};

const CONNECT_RETRY: Duration = Duration::from_secs(15);
const FAILURE_RETRY: Duration = Duration::from_secs(30);
const STOPPED_ANNOUNCE_LIMIT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(super) struct TransferStats {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

/// Per-torrent announce loop. Announces `started` first, then regular
/// empty-event refreshes with `numwant=0`; a wake signal cuts the
/// sleep short and asks for a full batch of peers again.
#[derive(Debug)]
pub(super) struct AnnouncerProc {
    stats: watch::Sender<TransferStats>,
    wake: Arc<Notify>,
    params: AnnounceParams,
    url: String,
    handle: AbortHandle,
}

impl Drop for AnnouncerProc {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl AnnouncerProc {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        sender: ClientSender,
        torrent_key: TorrentKey,
        url: String,
        info_hash: Sha1,
        peer_id: PeerId,
        port: u16,
        external_ip: Option<Ipv4Addr>,
        initial: TransferStats,
    ) -> Self {
        let (stats_sender, stats_receiver) = watch::channel(initial);
        let wake = Arc::new(Notify::new());

        let params = AnnounceParams {
            info_hash,
            peer_id,
            ip: external_ip,
            port,
            uploaded: initial.uploaded,
            downloaded: initial.downloaded,
            left: initial.left,
            event: AnnounceEvent::None,
            key: Some(rand::random()),
            num_want: None,
        };

        let handle = tokio::spawn(run(
            sender,
            torrent_key,
            url.clone(),
            params.clone(),
            stats_receiver,
            wake.clone(),
        ))
        .abort_handle();

        Self {
            stats: stats_sender,
            wake,
            params,
            url,
            handle,
        }
    }

    pub fn update_stats(&self, stats: TransferStats) {
        self.stats.send_replace(stats);
    }

    pub fn request_more_peers(&self) {
        self.wake.notify_one();
    }

    /// Final `stopped` announce, detached because the proc is being
    /// dropped. Best effort with a hard time limit.
    pub fn announce_stopped(&self) {
        let url = self.url.clone();
        let mut params = self.params.clone();
        let stats = *self.stats.borrow();
        params.uploaded = stats.uploaded;
        params.downloaded = stats.downloaded;
        params.left = stats.left;
        params.event = AnnounceEvent::Stopped;
        params.num_want = Some(0);

        tokio::spawn(async move {
            let announce = async {
                let mut client = TrackerClient::new(&url).await?;
                client.announce(&params).await
            };
            let _ = tokio::time::timeout(STOPPED_ANNOUNCE_LIMIT, announce).await;
        });
    }
}

async fn run(
    sender: ClientSender,
    torrent_key: TorrentKey,
    url: String,
    base_params: AnnounceParams,
    stats: watch::Receiver<TransferStats>,
    wake: Arc<Notify>,
) {
    let mut client = loop {
        match TrackerClient::new(&url).await {
            Ok(client) => break client,
            Err(error) => {
                let _ = sender.send(ClientMsg::AnnounceError { torrent_key, error });
                tokio::time::sleep(CONNECT_RETRY).await;
            }
        }
    };

    let mut event = AnnounceEvent::Started;
    let mut num_want = DEFAULT_NUM_WANT;
    loop {
        let current = *stats.borrow();
        let mut params = base_params.clone();
        params.uploaded = current.uploaded;
        params.downloaded = current.downloaded;
        params.left = current.left;
        params.event = event;
        params.num_want = Some(num_want);

        let sleep_for = match client.announce(&params).await {
            Ok(announce) => {
                let interval = u64::from(announce.interval.clamp(10, 6 * 3600));
                let _ = sender.send(ClientMsg::AnnounceOk {
                    torrent_key,
                    announce,
                });
                // next refresh asks for nothing new until woken
                event = AnnounceEvent::None;
                num_want = 0;
                Duration::from_secs(interval)
            }
            Err(error) => {
                let _ = sender.send(ClientMsg::AnnounceError { torrent_key, error });
                FAILURE_RETRY
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {}
            _ = wake.notified() => {
                num_want = DEFAULT_NUM_WANT;
            }
        }
    }
}
