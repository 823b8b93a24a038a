use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::AbortHandle;

use super::peer::PeerIo;
use super::{ClientMsg, ClientSender};
use crate::wire;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

pub(super) fn spawn(sender: ClientSender, listener: TcpListener) -> AbortHandle {
    tokio::spawn(run(sender, listener)).abort_handle()
}

async fn run(sender: ClientSender, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                tokio::spawn(accept(sender.clone(), stream, addr));
            }
            Err(error) => {
                tracing::warn!("failed to accept connection: {error}");
            }
        }
    }
}

/// Read the remote handshake and route by info-hash. The reply
/// handshake is only written once a torrent claims the connection, so
/// an unknown info-hash is dropped without answering.
async fn accept(sender: ClientSender, mut stream: TcpStream, addr: std::net::SocketAddr) {
    let read_future = wire::read_handshake_async(&mut stream);
    let handshake = match tokio::time::timeout(HANDSHAKE_TIMEOUT, read_future).await {
        Ok(Ok(handshake)) => handshake,
        Ok(Err(error)) => {
            tracing::debug!("bad handshake from {addr}: {error}");
            return;
        }
        Err(_) => {
            tracing::debug!("handshake from {addr} timed out");
            return;
        }
    };

    let (reader, writer) = stream.into_split();
    let _ = sender.send(ClientMsg::ListenerIncoming {
        peer_id: handshake.peer_id,
        peer_addr: addr,
        info_hash: handshake.info_hash,
        io: PeerIo::new(reader, writer),
    });
}
