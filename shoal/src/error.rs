pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure taxonomy for the whole crate.
///
/// Peer-facing variants (`InvalidBlock`, `HandshakeMismatch`,
/// `ProtocolViolation`, `UnexpectedEof`) are fatal to the peer session
/// that produced them and to nothing else. Tracker variants surface to
/// the announcer, which logs and retries on the next interval.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("bad bencode")]
    Bencode(#[from] bencode::Error),

    #[error("malformed torrent: {0}")]
    MalformedTorrent(String),

    #[error("invalid block: {0}")]
    InvalidBlock(String),

    #[error("handshake mismatch: {0}")]
    HandshakeMismatch(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("unexpected end of stream")]
    UnexpectedEof,

    #[error("timed out")]
    Timeout,

    #[error("tracker rejected request: {0}")]
    TrackerRejected(String),

    #[error("unsupported tracker scheme in {0}")]
    UnsupportedTrackerScheme(String),

    #[error("storage failure")]
    Storage,

    #[error("bad url: {0}")]
    BadUrl(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<Error> for std::io::Error {
    fn from(error: Error) -> Self {
        match error {
            Error::Io(io) => io,
            Error::UnexpectedEof => {
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "unexpected end of stream")
            }
            Error::Timeout => std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out"),
            other => std::io::Error::other(other),
        }
    }
}
