//! UDP tracker frame layout, shared by the client and the server. All
//! integers are big-endian; encoding and decoding go through the
//! [`Wire`] trait over `std::io` cursors.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddrV4};

use crate::tracker::AnnounceEvent;
use crate::{PeerId, Sha1};

/// Magic constant carried in the first 8 bytes of every CONNECT frame.
pub const PROTOCOL_MAGIC: u64 = 0x0000_0417_2710_1980;

/// CONNECT frame: magic + action + transaction id.
pub const CONNECT_REQUEST_LENGTH: usize = 16;
/// Fixed part of an announce request frame.
pub const ANNOUNCE_REQUEST_LENGTH: usize = 98;
/// Connection id + action + transaction id; a scrape with zero hashes.
pub const SCRAPE_REQUEST_HEADER_LENGTH: usize = 16;

fn invalid_data(msg: &'static str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg)
}

pub trait Wire: Sized {
    fn encode<W: Write>(&self, writer: W) -> std::io::Result<()>;
    fn decode<R: Read>(reader: R) -> std::io::Result<Self>;

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf).expect("vec writes cannot fail");
        buf
    }

    fn from_bytes(buf: &[u8]) -> std::io::Result<Self> {
        Self::decode(std::io::Cursor::new(buf))
    }
}

impl Wire for u16 {
    fn encode<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        writer.write_all(&self.to_be_bytes())
    }
    fn decode<R: Read>(mut reader: R) -> std::io::Result<Self> {
        let mut buf = [0u8; 2];
        reader.read_exact(&mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }
}

impl Wire for u32 {
    fn encode<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        writer.write_all(&self.to_be_bytes())
    }
    fn decode<R: Read>(mut reader: R) -> std::io::Result<Self> {
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }
}

impl Wire for u64 {
    fn encode<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        writer.write_all(&self.to_be_bytes())
    }
    fn decode<R: Read>(mut reader: R) -> std::io::Result<Self> {
        let mut buf = [0u8; 8];
        reader.read_exact(&mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }
}

impl Wire for Ipv4Addr {
    fn encode<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        writer.write_all(&self.octets())
    }
    fn decode<R: Read>(mut reader: R) -> std::io::Result<Self> {
        let mut octets = [0u8; 4];
        reader.read_exact(&mut octets)?;
        Ok(Ipv4Addr::from(octets))
    }
}

impl Wire for SocketAddrV4 {
    fn encode<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        self.ip().encode(&mut writer)?;
        self.port().encode(&mut writer)
    }
    fn decode<R: Read>(mut reader: R) -> std::io::Result<Self> {
        let ip = Ipv4Addr::decode(&mut reader)?;
        let port = u16::decode(&mut reader)?;
        Ok(SocketAddrV4::new(ip, port))
    }
}

impl Wire for Sha1 {
    fn encode<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        writer.write_all(self.as_bytes())
    }
    fn decode<R: Read>(mut reader: R) -> std::io::Result<Self> {
        let mut bytes = [0u8; 20];
        reader.read_exact(&mut bytes)?;
        Ok(Sha1::from_bytes(bytes))
    }
}

impl Wire for PeerId {
    fn encode<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        writer.write_all(self.as_bytes())
    }
    fn decode<R: Read>(mut reader: R) -> std::io::Result<Self> {
        let mut bytes = [0u8; 20];
        reader.read_exact(&mut bytes)?;
        Ok(PeerId::from_bytes(bytes))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Connect = 0,
    Announce = 1,
    Scrape = 2,
    Error = 3,
}

impl Action {
    pub fn from_u32(v: u32) -> Option<Action> {
        match v {
            _ if v == Action::Connect as u32 => Some(Action::Connect),
            _ if v == Action::Announce as u32 => Some(Action::Announce),
            _ if v == Action::Scrape as u32 => Some(Action::Scrape),
            _ if v == Action::Error as u32 => Some(Action::Error),
            _ => None,
        }
    }
}

impl Wire for Action {
    fn encode<W: Write>(&self, writer: W) -> std::io::Result<()> {
        (*self as u32).encode(writer)
    }
    fn decode<R: Read>(reader: R) -> std::io::Result<Self> {
        Action::from_u32(u32::decode(reader)?).ok_or_else(|| invalid_data("unknown action value"))
    }
}

impl Wire for AnnounceEvent {
    fn encode<W: Write>(&self, writer: W) -> std::io::Result<()> {
        (*self as u32).encode(writer)
    }
    fn decode<R: Read>(reader: R) -> std::io::Result<Self> {
        match u32::decode(reader)? {
            v if v == AnnounceEvent::None as u32 => Ok(AnnounceEvent::None),
            v if v == AnnounceEvent::Completed as u32 => Ok(AnnounceEvent::Completed),
            v if v == AnnounceEvent::Started as u32 => Ok(AnnounceEvent::Started),
            v if v == AnnounceEvent::Stopped as u32 => Ok(AnnounceEvent::Stopped),
            _ => Err(invalid_data("unknown event value")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub transaction_id: u32,
}

impl Wire for ConnectRequest {
    fn encode<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        PROTOCOL_MAGIC.encode(&mut writer)?;
        Action::Connect.encode(&mut writer)?;
        self.transaction_id.encode(&mut writer)
    }

    fn decode<R: Read>(mut reader: R) -> std::io::Result<Self> {
        if u64::decode(&mut reader)? != PROTOCOL_MAGIC {
            return Err(invalid_data("bad protocol magic"));
        }
        if Action::decode(&mut reader)? != Action::Connect {
            return Err(invalid_data("expected connect action"));
        }
        let transaction_id = u32::decode(&mut reader)?;
        Ok(Self { transaction_id })
    }
}

#[derive(Debug, Clone)]
pub struct ConnectResponse {
    pub transaction_id: u32,
    pub connection_id: u64,
}

impl Wire for ConnectResponse {
    fn encode<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        Action::Connect.encode(&mut writer)?;
        self.transaction_id.encode(&mut writer)?;
        self.connection_id.encode(&mut writer)
    }

    fn decode<R: Read>(mut reader: R) -> std::io::Result<Self> {
        if Action::decode(&mut reader)? != Action::Connect {
            return Err(invalid_data("expected connect action"));
        }
        let transaction_id = u32::decode(&mut reader)?;
        let connection_id = u64::decode(&mut reader)?;
        Ok(Self {
            transaction_id,
            connection_id,
        })
    }
}

#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub connection_id: u64,
    pub transaction_id: u32,
    pub info_hash: Sha1,
    pub peer_id: PeerId,
    pub downloaded: u64,
    pub left: u64,
    pub uploaded: u64,
    pub event: AnnounceEvent,
    pub ip_address: Ipv4Addr,
    pub key: u32,
    pub num_want: u32,
    pub port: u16,
}

impl Wire for AnnounceRequest {
    fn encode<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        self.connection_id.encode(&mut writer)?;
        Action::Announce.encode(&mut writer)?;
        self.transaction_id.encode(&mut writer)?;
        self.info_hash.encode(&mut writer)?;
        self.peer_id.encode(&mut writer)?;
        self.downloaded.encode(&mut writer)?;
        self.left.encode(&mut writer)?;
        self.uploaded.encode(&mut writer)?;
        self.event.encode(&mut writer)?;
        self.ip_address.encode(&mut writer)?;
        self.key.encode(&mut writer)?;
        self.num_want.encode(&mut writer)?;
        self.port.encode(&mut writer)
    }

    fn decode<R: Read>(mut reader: R) -> std::io::Result<Self> {
        let connection_id = u64::decode(&mut reader)?;
        if Action::decode(&mut reader)? != Action::Announce {
            return Err(invalid_data("expected announce action"));
        }
        Ok(Self {
            connection_id,
            transaction_id: u32::decode(&mut reader)?,
            info_hash: Sha1::decode(&mut reader)?,
            peer_id: PeerId::decode(&mut reader)?,
            downloaded: u64::decode(&mut reader)?,
            left: u64::decode(&mut reader)?,
            uploaded: u64::decode(&mut reader)?,
            event: AnnounceEvent::decode(&mut reader)?,
            ip_address: Ipv4Addr::decode(&mut reader)?,
            key: u32::decode(&mut reader)?,
            num_want: u32::decode(&mut reader)?,
            port: u16::decode(&mut reader)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    pub transaction_id: u32,
    pub interval: u32,
    pub leechers: u32,
    pub seeders: u32,
    pub addresses: Vec<SocketAddrV4>,
}

impl Wire for AnnounceResponse {
    fn encode<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        Action::Announce.encode(&mut writer)?;
        self.transaction_id.encode(&mut writer)?;
        self.interval.encode(&mut writer)?;
        self.leechers.encode(&mut writer)?;
        self.seeders.encode(&mut writer)?;
        for addr in &self.addresses {
            addr.encode(&mut writer)?;
        }
        Ok(())
    }

    fn decode<R: Read>(mut reader: R) -> std::io::Result<Self> {
        if Action::decode(&mut reader)? != Action::Announce {
            return Err(invalid_data("expected announce action"));
        }
        let transaction_id = u32::decode(&mut reader)?;
        let interval = u32::decode(&mut reader)?;
        let leechers = u32::decode(&mut reader)?;
        let seeders = u32::decode(&mut reader)?;
        let mut addresses = Vec::new();
        loop {
            match SocketAddrV4::decode(&mut reader) {
                Ok(addr) => addresses.push(addr),
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
        }
        Ok(Self {
            transaction_id,
            interval,
            leechers,
            seeders,
            addresses,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ScrapeRequest {
    pub connection_id: u64,
    pub transaction_id: u32,
    pub info_hashes: Vec<Sha1>,
}

impl Wire for ScrapeRequest {
    fn encode<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        self.connection_id.encode(&mut writer)?;
        Action::Scrape.encode(&mut writer)?;
        self.transaction_id.encode(&mut writer)?;
        for hash in &self.info_hashes {
            hash.encode(&mut writer)?;
        }
        Ok(())
    }

    fn decode<R: Read>(mut reader: R) -> std::io::Result<Self> {
        let connection_id = u64::decode(&mut reader)?;
        if Action::decode(&mut reader)? != Action::Scrape {
            return Err(invalid_data("expected scrape action"));
        }
        let transaction_id = u32::decode(&mut reader)?;
        let mut info_hashes = Vec::new();
        loop {
            match Sha1::decode(&mut reader) {
                Ok(hash) => info_hashes.push(hash),
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
        }
        Ok(Self {
            connection_id,
            transaction_id,
            info_hashes,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ScrapeStats {
    pub seeders: u32,
    pub completed: u32,
    pub leechers: u32,
}

impl Wire for ScrapeStats {
    fn encode<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        self.seeders.encode(&mut writer)?;
        self.completed.encode(&mut writer)?;
        self.leechers.encode(&mut writer)
    }

    fn decode<R: Read>(mut reader: R) -> std::io::Result<Self> {
        Ok(Self {
            seeders: u32::decode(&mut reader)?,
            completed: u32::decode(&mut reader)?,
            leechers: u32::decode(&mut reader)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ScrapeResponse {
    pub transaction_id: u32,
    pub stats: Vec<ScrapeStats>,
}

impl Wire for ScrapeResponse {
    fn encode<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        Action::Scrape.encode(&mut writer)?;
        self.transaction_id.encode(&mut writer)?;
        for stats in &self.stats {
            stats.encode(&mut writer)?;
        }
        Ok(())
    }

    fn decode<R: Read>(mut reader: R) -> std::io::Result<Self> {
        if Action::decode(&mut reader)? != Action::Scrape {
            return Err(invalid_data("expected scrape action"));
        }
        let transaction_id = u32::decode(&mut reader)?;
        let mut stats = Vec::new();
        loop {
            match ScrapeStats::decode(&mut reader) {
                Ok(entry) => stats.push(entry),
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
        }
        Ok(Self {
            transaction_id,
            stats,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ErrorResponse {
    pub transaction_id: u32,
    pub message: Vec<u8>,
}

impl Wire for ErrorResponse {
    fn encode<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        Action::Error.encode(&mut writer)?;
        self.transaction_id.encode(&mut writer)?;
        writer.write_all(&self.message)
    }

    fn decode<R: Read>(mut reader: R) -> std::io::Result<Self> {
        if Action::decode(&mut reader)? != Action::Error {
            return Err(invalid_data("expected error action"));
        }
        let transaction_id = u32::decode(&mut reader)?;
        let mut message = Vec::new();
        reader.read_to_end(&mut message)?;
        Ok(Self {
            transaction_id,
            message,
        })
    }
}
