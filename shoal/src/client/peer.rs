use std::net::SocketAddr;
use std::pin::Pin;

use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter},
    net::TcpStream,
    sync::mpsc,
    task::AbortHandle,
};

use super::torrent::PeerKey;
use super::{ClientMsg, ClientSender, TorrentKey};
use crate::{wire, Error, PeerId, Sha1};

pub(super) type PeerReader = Pin<Box<dyn AsyncRead + Send + 'static>>;
pub(super) type PeerWriter = Pin<Box<dyn AsyncWrite + Send + 'static>>;

pub(super) struct PeerIo {
    pub reader: PeerReader,
    pub writer: PeerWriter,
}

impl PeerIo {
    pub fn new(
        reader: impl AsyncRead + Send + 'static,
        writer: impl AsyncWrite + Send + 'static,
    ) -> Self {
        Self {
            reader: Box::pin(reader),
            writer: Box::pin(writer),
        }
    }
}

type PeerSender = mpsc::UnboundedSender<wire::Message>;
type PeerReceiver = mpsc::UnboundedReceiver<wire::Message>;

/// Handle to one peer connection's reader/writer task pair. Dropping
/// it closes the outbound channel, which stops the writer and aborts
/// the reader.
#[derive(Debug)]
pub(super) struct PeerProc {
    sender: PeerSender,
}

impl PeerProc {
    /// Inbound connection; the listener already read the remote
    /// handshake, ours goes out before any messages.
    pub fn accept(
        sender: ClientSender,
        torrent_key: TorrentKey,
        peer_key: PeerKey,
        info_hash: Sha1,
        local_peer_id: PeerId,
        peer_io: PeerIo,
    ) -> Self {
        let (peer_sender, peer_receiver) = mpsc::unbounded_channel();
        tokio::spawn(accept(
            sender,
            peer_receiver,
            torrent_key,
            peer_key,
            info_hash,
            local_peer_id,
            peer_io,
        ));
        Self {
            sender: peer_sender,
        }
    }

    /// Outbound dial: connect, exchange handshakes, verify.
    pub fn connect(
        sender: ClientSender,
        torrent_key: TorrentKey,
        peer_key: PeerKey,
        info_hash: Sha1,
        local_peer_id: PeerId,
        expected_peer_id: Option<PeerId>,
        address: SocketAddr,
    ) -> Self {
        let (peer_sender, peer_receiver) = mpsc::unbounded_channel();
        tokio::spawn(connect(
            sender,
            peer_receiver,
            torrent_key,
            peer_key,
            info_hash,
            local_peer_id,
            expected_peer_id,
            address,
        ));
        Self {
            sender: peer_sender,
        }
    }

    pub fn send(&self, message: wire::Message) {
        let _ = self.sender.send(message);
    }
}

#[allow(clippy::too_many_arguments)]
async fn connect(
    sender: ClientSender,
    receiver: PeerReceiver,
    torrent_key: TorrentKey,
    peer_key: PeerKey,
    info_hash: Sha1,
    local_peer_id: PeerId,
    expected_peer_id: Option<PeerId>,
    address: SocketAddr,
) {
    let fail = |error: Error| {
        let _ = sender.send(ClientMsg::PeerFailure {
            torrent_key,
            peer_key,
            error,
        });
    };

    let mut stream = match TcpStream::connect(address).await {
        Ok(stream) => stream,
        Err(error) => return fail(error.into()),
    };

    let handshake = wire::Handshake {
        info_hash,
        peer_id: local_peer_id,
    };
    if let Err(error) = wire::write_handshake_async(&mut stream, &handshake).await {
        return fail(error);
    }

    let remote = match wire::read_handshake_async(&mut stream).await {
        Ok(remote) => remote,
        Err(error) => return fail(error),
    };
    if remote.info_hash != info_hash {
        return fail(Error::HandshakeMismatch(format!(
            "peer at {address} answered for {}",
            remote.info_hash
        )));
    }
    if let Some(expected) = expected_peer_id {
        if remote.peer_id != expected {
            return fail(Error::HandshakeMismatch(format!(
                "peer at {address} is not who the tracker advertised"
            )));
        }
    }

    let _ = sender.send(ClientMsg::PeerHandshake {
        torrent_key,
        peer_key,
        peer_id: remote.peer_id,
    });

    let (reader, writer) = stream.into_split();
    spawn_reader_writer(
        sender,
        receiver,
        torrent_key,
        peer_key,
        PeerIo::new(reader, writer),
    );
}

async fn accept(
    sender: ClientSender,
    receiver: PeerReceiver,
    torrent_key: TorrentKey,
    peer_key: PeerKey,
    info_hash: Sha1,
    local_peer_id: PeerId,
    mut peer_io: PeerIo,
) {
    let handshake = wire::Handshake {
        info_hash,
        peer_id: local_peer_id,
    };
    if let Err(error) = wire::write_handshake_async(&mut peer_io.writer, &handshake).await {
        let _ = sender.send(ClientMsg::PeerFailure {
            torrent_key,
            peer_key,
            error,
        });
        return;
    }
    spawn_reader_writer(sender, receiver, torrent_key, peer_key, peer_io);
}

fn spawn_reader_writer(
    sender: ClientSender,
    receiver: PeerReceiver,
    torrent_key: TorrentKey,
    peer_key: PeerKey,
    peer_io: PeerIo,
) {
    let reader_handle = tokio::spawn(reader_task(
        sender.clone(),
        torrent_key,
        peer_key,
        peer_io.reader,
    ))
    .abort_handle();
    tokio::spawn(writer_task(
        sender,
        receiver,
        torrent_key,
        peer_key,
        peer_io.writer,
        reader_handle,
    ));
}

async fn reader_task(
    sender: ClientSender,
    torrent_key: TorrentKey,
    peer_key: PeerKey,
    mut reader: PeerReader,
) {
    loop {
        match wire::read_message_async(&mut reader).await {
            Ok(message) => {
                if sender
                    .send(ClientMsg::PeerMessage {
                        torrent_key,
                        peer_key,
                        message,
                    })
                    .is_err()
                {
                    return;
                }
            }
            Err(error) => {
                let _ = sender.send(ClientMsg::PeerFailure {
                    torrent_key,
                    peer_key,
                    error,
                });
                return;
            }
        }
    }
}

async fn writer_task(
    sender: ClientSender,
    mut receiver: PeerReceiver,
    torrent_key: TorrentKey,
    peer_key: PeerKey,
    writer: PeerWriter,
    // the writer owns the reader's lifetime: channel closed = session over
    reader_handle: AbortHandle,
) {
    let mut writer = BufWriter::new(writer);
    while let Some(message) = receiver.recv().await {
        let write_result = wire::write_message_async(&mut writer, &message).await;
        let flush_result = writer.flush().await.map_err(Error::from);
        if let Err(error) = write_result.and(flush_result) {
            let _ = sender.send(ClientMsg::PeerFailure {
                torrent_key,
                peer_key,
                error,
            });
            break;
        }
    }
    reader_handle.abort();
}
