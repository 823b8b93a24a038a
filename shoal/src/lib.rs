mod error;
pub use error::{Error, Result};

mod hash;
pub use hash::Sha1;

mod info;
pub use info::{Info, InfoFile, Metainfo, TorrentFile, TorrentInfo};

mod piece;
pub use piece::{validate_block, validate_request, PieceBitfield, PieceIdx, BLOCK_LENGTH};

pub mod percent;
pub mod tracker;
pub mod trackerd;
pub mod wire;

mod storage;
pub use storage::{MemoryStorage, Storage};

mod nat;
pub use nat::PortMapper;

mod client;
pub use client::{Client, ClientConfig, Torrent, TorrentStatus};

#[derive(Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; 20]);

impl PeerId {
    /// A fresh peer id: the client's 8-byte prefix followed by 12
    /// random bytes.
    pub fn generate(prefix: &[u8; 8]) -> PeerId {
        use rand::Rng;
        let mut bytes = [0u8; 20];
        bytes[..8].copy_from_slice(prefix);
        rand::thread_rng().fill(&mut bytes[8..]);
        PeerId(bytes)
    }

    pub fn from_bytes(bytes: [u8; 20]) -> PeerId {
        PeerId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl From<[u8; 20]> for PeerId {
    fn from(bytes: [u8; 20]) -> Self {
        PeerId(bytes)
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PeerId(")?;
        for v in self.0 {
            write!(f, "{:02x}", v)?;
        }
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_keeps_prefix() {
        let id = PeerId::generate(b"-SH0001-");
        assert_eq!(&id.as_bytes()[..8], b"-SH0001-");
    }

    #[test]
    fn peer_ids_are_distinct() {
        let a = PeerId::generate(b"-SH0001-");
        let b = PeerId::generate(b"-SH0001-");
        assert_ne!(a, b);
    }
}
