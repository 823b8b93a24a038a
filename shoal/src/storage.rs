use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;

/// Pluggable content store consumed by the peer session. Offsets are
/// absolute within the torrent's concatenated content. `None`/`false`
/// signal a recoverable failure: the caller logs and declines, it does
/// not tear anything down.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    async fn get(&self, offset: u64, length: u64) -> Option<Bytes>;
    async fn set(&self, offset: u64, data: Bytes) -> bool;
    /// Whether the store already holds the full content (a seed).
    async fn exists(&self) -> bool;
}

/// Fixed-size in-memory store. Reads only serve byte ranges that have
/// been written (or were present at construction), so a half-written
/// piece never reads back as zeroes.
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

struct Inner {
    data: Vec<u8>,
    written: Vec<bool>,
    complete: bool,
}

impl MemoryStorage {
    pub fn empty(size: u64) -> Self {
        let size = usize::try_from(size).expect("memory storage size fits in usize");
        Self {
            inner: Mutex::new(Inner {
                data: vec![0; size],
                written: vec![false; size],
                complete: false,
            }),
        }
    }

    pub fn seeded(content: Vec<u8>) -> Self {
        let len = content.len();
        Self {
            inner: Mutex::new(Inner {
                data: content,
                written: vec![true; len],
                complete: true,
            }),
        }
    }

    /// Current contents; unwritten bytes read as zero.
    pub fn snapshot(&self) -> Vec<u8> {
        self.inner.lock().unwrap().data.clone()
    }

    pub fn written_everywhere(&self) -> bool {
        self.inner.lock().unwrap().written.iter().all(|&w| w)
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, offset: u64, length: u64) -> Option<Bytes> {
        let inner = self.inner.lock().unwrap();
        let start = usize::try_from(offset).ok()?;
        let end = start.checked_add(usize::try_from(length).ok()?)?;
        if end > inner.data.len() || !inner.written[start..end].iter().all(|&w| w) {
            return None;
        }
        Some(Bytes::copy_from_slice(&inner.data[start..end]))
    }

    async fn set(&self, offset: u64, data: Bytes) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let start = match usize::try_from(offset) {
            Ok(start) => start,
            Err(_) => return false,
        };
        let end = match start.checked_add(data.len()) {
            Some(end) if end <= inner.data.len() => end,
            _ => return false,
        };
        inner.data[start..end].copy_from_slice(&data);
        inner.written[start..end].iter_mut().for_each(|w| *w = true);
        true
    }

    async fn exists(&self) -> bool {
        self.inner.lock().unwrap().complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_only_written_ranges() {
        let storage = MemoryStorage::empty(64);
        assert!(!storage.exists().await);
        assert_eq!(storage.get(0, 8).await, None);

        assert!(storage.set(8, Bytes::from_static(b"abcdefgh")).await);
        assert_eq!(storage.get(8, 8).await.unwrap(), &b"abcdefgh"[..]);
        // partially written span still refuses to read
        assert_eq!(storage.get(0, 16).await, None);
    }

    #[tokio::test]
    async fn rejects_out_of_bounds_writes() {
        let storage = MemoryStorage::empty(16);
        assert!(!storage.set(10, Bytes::from_static(b"0123456789")).await);
        assert_eq!(storage.get(20, 1).await, None);
    }

    #[tokio::test]
    async fn seeded_storage_serves_everything() {
        let storage = MemoryStorage::seeded(b"0123456789".to_vec());
        assert!(storage.exists().await);
        assert_eq!(storage.get(3, 4).await.unwrap(), &b"3456"[..]);
    }
}
