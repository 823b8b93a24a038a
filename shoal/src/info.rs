use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{Error, PieceIdx, Result, Sha1};

/// A `.torrent` file after bencode projection. `info_hash` is the SHA-1
/// of the exact `info` byte span of the input, not of a re-encoding.
#[derive(Debug, Clone)]
pub struct Metainfo {
    pub announce: String,
    pub info: Info,
    pub info_hash: Sha1,
    pub comment: Option<String>,
    pub created_by: Option<String>,
    pub creation_date: Option<i64>,
    pub encoding: Option<String>,
}

#[derive(Debug, Clone)]
pub struct InfoFile {
    pub path: String,
    pub length: u64,
}

#[derive(Debug, Clone)]
pub struct Info {
    pub name: String,
    pub piece_length: u32,
    pub private: bool,
    /// Total content length over all files.
    pub length: u64,
    pub pieces: Vec<Sha1>,
    pub files: Vec<InfoFile>,
}

impl bencode::FromValue for InfoFile {
    fn from_value(value: &bencode::Value) -> bencode::Result<Self> {
        let dict = value.as_dict()?;
        let components = dict.require::<Vec<String>>(b"path")?;
        if components.is_empty() || components.iter().any(String::is_empty) {
            return Err(bencode::Error::message(
                "file path must be a list of non-empty components",
            ));
        }
        Ok(Self {
            length: dict.require(b"length")?,
            path: components.join("/"),
        })
    }
}

impl bencode::FromValue for Info {
    fn from_value(value: &bencode::Value) -> bencode::Result<Self> {
        let dict = value.as_dict()?;
        let name = dict.require::<String>(b"name")?;
        let piece_length: u32 = dict.require(b"piece length")?;
        if piece_length == 0 {
            return Err(bencode::Error::message("piece length must be positive"));
        }
        let private = match dict.find::<i64>(b"private")? {
            Some(v) => v != 0,
            None => false,
        };

        let pieces_bytes = dict.require_value(b"pieces")?.as_bytes()?;
        if pieces_bytes.len() % 20 != 0 {
            return Err(bencode::Error::message(
                "pieces byte string is not a multiple of 20",
            ));
        }
        let pieces = pieces_bytes
            .chunks_exact(20)
            .map(|chunk| Sha1::from_bytes(chunk.try_into().expect("chunks are 20 bytes")))
            .collect::<Vec<_>>();

        let mut files = Vec::new();
        let mut length = 0u64;
        match (dict.find_value(b"length"), dict.find_value(b"files")) {
            (Some(single), None) => {
                length = <u64 as bencode::FromValue>::from_value(single)?;
                files.push(InfoFile {
                    path: name.clone(),
                    length,
                });
            }
            (None, Some(list)) => {
                for v in list.as_list()? {
                    let file = InfoFile::from_value(v)?;
                    length += file.length;
                    files.push(file);
                }
                if files.is_empty() {
                    return Err(bencode::Error::message("files list is empty"));
                }
            }
            (Some(_), Some(_)) => {
                return Err(bencode::Error::message(
                    "info dictionary contains both length and files",
                ))
            }
            (None, None) => {
                return Err(bencode::Error::message(
                    "info dictionary contains neither length nor files",
                ))
            }
        }

        let expected_pieces = length.div_ceil(u64::from(piece_length));
        if pieces.len() as u64 != expected_pieces {
            return Err(bencode::Error::message(format!(
                "{} piece hashes for {} bytes of content",
                pieces.len(),
                length
            )));
        }

        Ok(Self {
            name,
            piece_length,
            private,
            length,
            pieces,
            files,
        })
    }
}

impl bencode::FromValue for Metainfo {
    fn from_value(value: &bencode::Value) -> bencode::Result<Self> {
        let dict = value.as_dict()?;
        let announce = dict.require(b"announce")?;
        let info_value = dict.require_value(b"info")?;
        let info = Info::from_value(info_value)?;
        let info_hash = Sha1::hash(info_value.bytes);
        Ok(Self {
            announce,
            info,
            info_hash,
            comment: dict.find(b"comment")?,
            created_by: dict.find(b"created by")?,
            creation_date: dict.find(b"creation date")?,
            encoding: dict.find(b"encoding")?,
        })
    }
}

impl Metainfo {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        bencode::decode::<Metainfo>(buf)
            .map_err(|error| Error::MalformedTorrent(error.to_string()))
    }
}

struct TorrentInfoInner {
    announce: String,
    name: String,
    comment: Option<String>,
    created_by: Option<String>,
    private: bool,
    piece_length: u32,
    pieces: Vec<Sha1>,
    info_hash: Sha1,
    total_size: u64,
    files: Vec<TorrentFile>,
}

/// Shared immutable torrent description: the parsed metainfo plus the
/// derived file offsets, handed around as a cheap clone.
#[derive(Clone)]
pub struct TorrentInfo(Arc<TorrentInfoInner>);

impl std::fmt::Debug for TorrentInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TorrentInfo")
            .field("name", &self.0.name)
            .field("announce", &self.0.announce)
            .field("info_hash", &self.0.info_hash)
            .field("piece_length", &self.0.piece_length)
            .field("pieces", &self.0.pieces.len())
            .field("files", &self.0.files.len())
            .finish()
    }
}

impl TorrentInfo {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        Ok(Self::from_metainfo(Metainfo::decode(buf)?))
    }

    pub fn from_metainfo(metainfo: Metainfo) -> Self {
        let mut files = Vec::with_capacity(metainfo.info.files.len());
        let mut offset = 0;
        for (index, file) in metainfo.info.files.into_iter().enumerate() {
            files.push(TorrentFile {
                index,
                start: offset,
                length: file.length,
                path: PathBuf::from(file.path),
            });
            offset += file.length;
        }

        Self(Arc::new(TorrentInfoInner {
            announce: metainfo.announce,
            name: metainfo.info.name,
            comment: metainfo.comment,
            created_by: metainfo.created_by,
            private: metainfo.info.private,
            piece_length: metainfo.info.piece_length,
            pieces: metainfo.info.pieces,
            info_hash: metainfo.info_hash,
            total_size: metainfo.info.length,
            files,
        }))
    }

    #[cfg(test)]
    pub(crate) fn for_tests_with_content(name: &str, piece_length: u32, content: &[u8]) -> Self {
        let pieces = content
            .chunks(piece_length.max(1) as usize)
            .map(Sha1::hash)
            .collect();
        Self(Arc::new(TorrentInfoInner {
            announce: "http://tracker.invalid/announce".to_string(),
            name: name.to_string(),
            comment: None,
            created_by: None,
            private: false,
            piece_length,
            pieces,
            info_hash: Sha1::hash(name.as_bytes()),
            total_size: content.len() as u64,
            files: vec![TorrentFile {
                index: 0,
                start: 0,
                length: content.len() as u64,
                path: PathBuf::from(name),
            }],
        }))
    }

    #[cfg(test)]
    pub(crate) fn for_tests(name: &str, piece_length: u32, total_size: u64) -> Self {
        let pieces = (0..total_size.div_ceil(u64::from(piece_length)))
            .map(|i| Sha1::hash(&i.to_be_bytes()))
            .collect();
        Self(Arc::new(TorrentInfoInner {
            announce: "http://tracker.invalid/announce".to_string(),
            name: name.to_string(),
            comment: None,
            created_by: None,
            private: false,
            piece_length,
            pieces,
            info_hash: Sha1::hash(name.as_bytes()),
            total_size,
            files: vec![TorrentFile {
                index: 0,
                start: 0,
                length: total_size,
                path: PathBuf::from(name),
            }],
        }))
    }

    pub fn announce(&self) -> &str {
        &self.0.announce
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn comment(&self) -> Option<&str> {
        self.0.comment.as_deref()
    }

    pub fn created_by(&self) -> Option<&str> {
        self.0.created_by.as_deref()
    }

    pub fn private(&self) -> bool {
        self.0.private
    }

    pub fn total_size(&self) -> u64 {
        self.0.total_size
    }

    pub fn info_hash(&self) -> Sha1 {
        self.0.info_hash
    }

    pub fn piece_length(&self) -> u32 {
        self.0.piece_length
    }

    pub fn pieces_count(&self) -> u32 {
        self.0.pieces.len() as u32
    }

    pub fn pieces(&self) -> &[Sha1] {
        &self.0.pieces
    }

    pub fn piece_indices(&self) -> impl Iterator<Item = PieceIdx> {
        (0..self.pieces_count()).map(PieceIdx::new)
    }

    pub fn piece_index_valid(&self, index: PieceIdx) -> bool {
        u32::from(index) < self.pieces_count()
    }

    pub fn piece_hash(&self, index: PieceIdx) -> Option<Sha1> {
        self.0.pieces.get(u32::from(index) as usize).copied()
    }

    /// Byte offset of the piece within the whole content.
    pub fn piece_offset(&self, index: PieceIdx) -> u64 {
        u64::from(u32::from(index)) * u64::from(self.piece_length())
    }

    /// Effective length of a piece: `piece_length` for all but the last
    /// piece, the remainder (or `piece_length` when it divides evenly)
    /// for the last, zero past the end.
    pub fn piece_length_from_index(&self, index: PieceIdx) -> u32 {
        let size = self.total_size();
        let q = size / u64::from(self.piece_length());
        let r = size % u64::from(self.piece_length());
        match u64::from(u32::from(index)).cmp(&q) {
            std::cmp::Ordering::Greater => 0,
            std::cmp::Ordering::Equal => r as u32,
            std::cmp::Ordering::Less => self.piece_length(),
        }
    }

    pub fn files(&self) -> &[TorrentFile] {
        &self.0.files
    }
}

#[derive(Debug, Clone)]
pub struct TorrentFile {
    index: usize,
    start: u64,
    length: u64,
    path: PathBuf,
}

impl TorrentFile {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_file_torrent() -> Vec<u8> {
        let pieces: Vec<u8> = (0..2)
            .flat_map(|i| *Sha1::hash(&[i]).as_bytes())
            .collect();
        bencode::encode_fn(|e| {
            let mut dict = e.dict();
            dict.push(b"announce", "http://tracker.example/announce");
            dict.push(b"comment", "example payload");
            dict.push_with_encoder(b"info", |e| {
                let mut info = e.dict();
                info.push(b"name", "payload.bin");
                info.push(b"piece length", 32768u32);
                info.push(b"length", 40000u32);
                info.push_with_encoder(b"pieces", |e| e.bytes(&pieces));
            });
        })
    }

    fn multi_file_torrent() -> Vec<u8> {
        let pieces: Vec<u8> = (0..3)
            .flat_map(|i| *Sha1::hash(&[i]).as_bytes())
            .collect();
        bencode::encode_fn(|e| {
            let mut dict = e.dict();
            dict.push(b"announce", "udp://tracker.example:6969");
            dict.push_with_encoder(b"info", |e| {
                let mut info = e.dict();
                info.push(b"name", "album");
                info.push(b"piece length", 16384u32);
                info.push(b"private", 1u8);
                info.push_with_encoder(b"files", |e| {
                    let mut files = e.list();
                    files.push_with_encoder(|e| {
                        let mut file = e.dict();
                        file.push(b"length", 30000u32);
                        file.push(b"path", vec!["cd1", "track1.flac"]);
                    });
                    files.push_with_encoder(|e| {
                        let mut file = e.dict();
                        file.push(b"length", 10000u32);
                        file.push(b"path", vec!["cover.jpg"]);
                    });
                });
                info.push_with_encoder(b"pieces", |e| e.bytes(&pieces));
            });
        })
    }

    #[test]
    fn decode_single_file() {
        let info = TorrentInfo::decode(&single_file_torrent()).unwrap();
        assert_eq!(info.name(), "payload.bin");
        assert_eq!(info.announce(), "http://tracker.example/announce");
        assert_eq!(info.comment(), Some("example payload"));
        assert_eq!(info.total_size(), 40000);
        assert_eq!(info.pieces_count(), 2);
        assert!(!info.private());
        assert_eq!(info.files().len(), 1);
        assert_eq!(info.files()[0].length(), 40000);
        // last piece is the 40000 - 32768 remainder
        assert_eq!(info.piece_length_from_index(PieceIdx::new(0)), 32768);
        assert_eq!(info.piece_length_from_index(PieceIdx::new(1)), 7232);
        assert_eq!(info.piece_length_from_index(PieceIdx::new(2)), 0);
    }

    #[test]
    fn decode_multi_file() {
        let info = TorrentInfo::decode(&multi_file_torrent()).unwrap();
        assert_eq!(info.name(), "album");
        assert!(info.private());
        assert_eq!(info.total_size(), 40000);
        assert_eq!(info.files().len(), 2);
        assert_eq!(info.files()[0].path(), Path::new("cd1/track1.flac"));
        assert_eq!(info.files()[0].start(), 0);
        assert_eq!(info.files()[1].start(), 30000);
    }

    #[test]
    fn info_hash_is_deterministic_and_covers_info_span() {
        let buf = single_file_torrent();
        let a = TorrentInfo::decode(&buf).unwrap();
        let b = TorrentInfo::decode(&buf).unwrap();
        assert_eq!(a.info_hash(), b.info_hash());

        let value = bencode::decode_value(&buf).unwrap();
        let info_bytes = value.as_dict().unwrap().require_value(b"info").unwrap().bytes;
        assert_eq!(a.info_hash(), Sha1::hash(info_bytes));
    }

    #[test]
    fn rejects_malformed_shapes() {
        // missing announce
        let buf = bencode::encode_fn(|e| {
            let mut dict = e.dict();
            dict.push(b"comment", "nope");
        });
        assert!(matches!(
            Metainfo::decode(&buf),
            Err(Error::MalformedTorrent(_))
        ));

        // pieces not a multiple of 20
        let buf = bencode::encode_fn(|e| {
            let mut dict = e.dict();
            dict.push(b"announce", "http://t/announce");
            dict.push_with_encoder(b"info", |e| {
                let mut info = e.dict();
                info.push(b"name", "x");
                info.push(b"piece length", 16384u32);
                info.push(b"length", 1u32);
                info.push_with_encoder(b"pieces", |e| e.bytes(&[0u8; 19]));
            });
        });
        assert!(Metainfo::decode(&buf).is_err());

        // both length and files
        let buf = bencode::encode_fn(|e| {
            let mut dict = e.dict();
            dict.push(b"announce", "http://t/announce");
            dict.push_with_encoder(b"info", |e| {
                let mut info = e.dict();
                info.push(b"name", "x");
                info.push(b"piece length", 16384u32);
                info.push(b"length", 1u32);
                info.push_with_encoder(b"files", |e| {
                    e.list();
                });
                info.push_with_encoder(b"pieces", |e| e.bytes(&[0u8; 20]));
            });
        });
        assert!(Metainfo::decode(&buf).is_err());

        // piece count does not match content length
        let buf = bencode::encode_fn(|e| {
            let mut dict = e.dict();
            dict.push(b"announce", "http://t/announce");
            dict.push_with_encoder(b"info", |e| {
                let mut info = e.dict();
                info.push(b"name", "x");
                info.push(b"piece length", 16384u32);
                info.push(b"length", 16384u32 * 3);
                info.push_with_encoder(b"pieces", |e| e.bytes(&[0u8; 20]));
            });
        });
        assert!(Metainfo::decode(&buf).is_err());

        // truncated input
        assert!(Metainfo::decode(b"d8:announce").is_err());
    }
}
