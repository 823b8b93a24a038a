//! Peer wire protocol: the 68-byte handshake and the length-prefixed
//! message framing. Both sync (`std::io`) and async (`tokio::io`)
//! entry points are provided; the session uses the async ones, tests
//! and tools drive the sync ones over in-memory buffers.

use std::io::{Read, Write};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Error, PeerId, PieceIdx, Result, Sha1};

const HANDSHAKE_PREFIX_LENGTH: usize = 20;
const HANDSHAKE_PREFIX: &[u8; HANDSHAKE_PREFIX_LENGTH] = b"\x13BitTorrent protocol";

const HANDSHAKE_RESERVED_LENGTH: usize = 8;

const HANDSHAKE_INFOHASH_IDX: usize = HANDSHAKE_PREFIX_LENGTH + HANDSHAKE_RESERVED_LENGTH;
const HANDSHAKE_PEERID_IDX: usize = HANDSHAKE_INFOHASH_IDX + 20;

pub const HANDSHAKE_LENGTH: usize = HANDSHAKE_PREFIX_LENGTH
    + HANDSHAKE_RESERVED_LENGTH // reserved bytes, all zero
    + 20 // info hash
    + 20; // peer id

// Upper bound on a single frame. Piece messages carry one 16 KiB block
// and bitfields one bit per piece; anything past this is a hostile
// length prefix, not a legitimate message.
const MAX_MESSAGE_LENGTH: u32 = 2 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: Sha1,
    pub peer_id: PeerId,
}

pub fn serialize_handshake(handshake: &Handshake) -> [u8; HANDSHAKE_LENGTH] {
    let mut buf = [0u8; HANDSHAKE_LENGTH];
    buf[..HANDSHAKE_PREFIX_LENGTH].copy_from_slice(HANDSHAKE_PREFIX);
    buf[HANDSHAKE_INFOHASH_IDX..HANDSHAKE_INFOHASH_IDX + 20]
        .copy_from_slice(handshake.info_hash.as_bytes());
    buf[HANDSHAKE_PEERID_IDX..HANDSHAKE_PEERID_IDX + 20]
        .copy_from_slice(handshake.peer_id.as_bytes());
    buf
}

pub fn parse_handshake(buf: &[u8; HANDSHAKE_LENGTH]) -> Result<Handshake> {
    if &buf[..HANDSHAKE_PREFIX_LENGTH] != HANDSHAKE_PREFIX {
        return Err(Error::ProtocolViolation(
            "handshake does not start with the protocol string".into(),
        ));
    }

    let info_hash: [u8; 20] = buf[HANDSHAKE_INFOHASH_IDX..HANDSHAKE_INFOHASH_IDX + 20]
        .try_into()
        .expect("span is 20 bytes");
    let peer_id: [u8; 20] = buf[HANDSHAKE_PEERID_IDX..HANDSHAKE_PEERID_IDX + 20]
        .try_into()
        .expect("span is 20 bytes");

    Ok(Handshake {
        info_hash: Sha1::from_bytes(info_hash),
        peer_id: PeerId::from_bytes(peer_id),
    })
}

pub fn write_handshake<W: Write>(mut writer: W, handshake: &Handshake) -> Result<()> {
    writer.write_all(&serialize_handshake(handshake))?;
    Ok(())
}

pub fn read_handshake<R: Read>(mut reader: R) -> Result<Handshake> {
    let mut buf = [0u8; HANDSHAKE_LENGTH];
    reader.read_exact(&mut buf).map_err(eof_as_protocol_eof)?;
    parse_handshake(&buf)
}

pub async fn write_handshake_async<W>(writer: &mut W, handshake: &Handshake) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&serialize_handshake(handshake)).await?;
    Ok(())
}

pub async fn read_handshake_async<R>(reader: &mut R) -> Result<Handshake>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; HANDSHAKE_LENGTH];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(eof_as_protocol_eof)?;
    parse_handshake(&buf)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        index: PieceIdx,
    },
    Bitfield {
        bitfield: Vec<u8>,
    },
    Request {
        index: PieceIdx,
        begin: u32,
        length: u32,
    },
    Piece {
        index: PieceIdx,
        begin: u32,
        data: Bytes,
    },
    Cancel {
        index: PieceIdx,
        begin: u32,
        length: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum MessageKind {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl MessageKind {
    fn from_u8(kind: u8) -> Option<MessageKind> {
        match kind {
            _ if kind == MessageKind::Choke as u8 => Some(MessageKind::Choke),
            _ if kind == MessageKind::Unchoke as u8 => Some(MessageKind::Unchoke),
            _ if kind == MessageKind::Interested as u8 => Some(MessageKind::Interested),
            _ if kind == MessageKind::NotInterested as u8 => Some(MessageKind::NotInterested),
            _ if kind == MessageKind::Have as u8 => Some(MessageKind::Have),
            _ if kind == MessageKind::Bitfield as u8 => Some(MessageKind::Bitfield),
            _ if kind == MessageKind::Request as u8 => Some(MessageKind::Request),
            _ if kind == MessageKind::Piece as u8 => Some(MessageKind::Piece),
            _ if kind == MessageKind::Cancel as u8 => Some(MessageKind::Cancel),
            _ => None,
        }
    }

    fn to_u8(self) -> u8 {
        self as u8
    }
}

fn violation(msg: impl Into<String>) -> Error {
    Error::ProtocolViolation(msg.into())
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes(buf[at..at + 4].try_into().expect("span is 4 bytes"))
}

/// Decode one frame body (everything after the length prefix). Returns
/// `None` for an unknown message id, which the readers skip over.
pub fn decode_message(buf: &[u8]) -> Result<Option<Message>> {
    if buf.is_empty() {
        return Ok(Some(Message::KeepAlive));
    }
    let kind = match MessageKind::from_u8(buf[0]) {
        Some(kind) => kind,
        None => return Ok(None),
    };

    let expect_len = |expected: usize| {
        if buf.len() == expected {
            Ok(())
        } else {
            Err(violation(format!(
                "{kind:?} message of {} bytes, expected {expected}",
                buf.len()
            )))
        }
    };

    let message = match kind {
        MessageKind::Choke => {
            expect_len(1)?;
            Message::Choke
        }
        MessageKind::Unchoke => {
            expect_len(1)?;
            Message::Unchoke
        }
        MessageKind::Interested => {
            expect_len(1)?;
            Message::Interested
        }
        MessageKind::NotInterested => {
            expect_len(1)?;
            Message::NotInterested
        }
        MessageKind::Have => {
            expect_len(5)?;
            Message::Have {
                index: PieceIdx::from(read_u32(buf, 1)),
            }
        }
        MessageKind::Bitfield => Message::Bitfield {
            bitfield: buf[1..].to_owned(),
        },
        MessageKind::Request => {
            expect_len(13)?;
            Message::Request {
                index: PieceIdx::from(read_u32(buf, 1)),
                begin: read_u32(buf, 5),
                length: read_u32(buf, 9),
            }
        }
        MessageKind::Piece => {
            if buf.len() < 9 {
                return Err(violation(format!("Piece message of {} bytes", buf.len())));
            }
            Message::Piece {
                index: PieceIdx::from(read_u32(buf, 1)),
                begin: read_u32(buf, 5),
                data: Bytes::copy_from_slice(&buf[9..]),
            }
        }
        MessageKind::Cancel => {
            expect_len(13)?;
            Message::Cancel {
                index: PieceIdx::from(read_u32(buf, 1)),
                begin: read_u32(buf, 5),
                length: read_u32(buf, 9),
            }
        }
    };
    Ok(Some(message))
}

pub fn encode_message(message: &Message) -> Vec<u8> {
    fn frame(kind: MessageKind, body_len: usize) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + 1 + body_len);
        buf.extend_from_slice(&(1 + body_len as u32).to_be_bytes());
        buf.push(kind.to_u8());
        buf
    }

    match message {
        Message::KeepAlive => 0u32.to_be_bytes().to_vec(),
        Message::Choke => frame(MessageKind::Choke, 0),
        Message::Unchoke => frame(MessageKind::Unchoke, 0),
        Message::Interested => frame(MessageKind::Interested, 0),
        Message::NotInterested => frame(MessageKind::NotInterested, 0),
        Message::Have { index } => {
            let mut buf = frame(MessageKind::Have, 4);
            buf.extend_from_slice(&u32::from(*index).to_be_bytes());
            buf
        }
        Message::Bitfield { bitfield } => {
            let mut buf = frame(MessageKind::Bitfield, bitfield.len());
            buf.extend_from_slice(bitfield);
            buf
        }
        Message::Request {
            index,
            begin,
            length,
        } => {
            let mut buf = frame(MessageKind::Request, 12);
            buf.extend_from_slice(&u32::from(*index).to_be_bytes());
            buf.extend_from_slice(&begin.to_be_bytes());
            buf.extend_from_slice(&length.to_be_bytes());
            buf
        }
        Message::Piece { index, begin, data } => {
            let mut buf = frame(MessageKind::Piece, 8 + data.len());
            buf.extend_from_slice(&u32::from(*index).to_be_bytes());
            buf.extend_from_slice(&begin.to_be_bytes());
            buf.extend_from_slice(data);
            buf
        }
        Message::Cancel {
            index,
            begin,
            length,
        } => {
            let mut buf = frame(MessageKind::Cancel, 12);
            buf.extend_from_slice(&u32::from(*index).to_be_bytes());
            buf.extend_from_slice(&begin.to_be_bytes());
            buf.extend_from_slice(&length.to_be_bytes());
            buf
        }
    }
}

pub fn write_message<W: Write>(mut writer: W, message: &Message) -> Result<()> {
    writer.write_all(&encode_message(message))?;
    Ok(())
}

pub async fn write_message_async<W>(writer: &mut W, message: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_message(message)).await?;
    Ok(())
}

fn check_frame_length(len: u32) -> Result<usize> {
    if len > MAX_MESSAGE_LENGTH {
        Err(violation(format!("frame length {len} exceeds limit")))
    } else {
        Ok(len as usize)
    }
}

/// Read the next known message, skipping frames with unknown ids.
pub fn read_message<R: Read>(mut reader: R) -> Result<Message> {
    let mut buf = Vec::new();
    loop {
        let mut len = [0u8; 4];
        reader.read_exact(&mut len).map_err(eof_as_protocol_eof)?;
        let len = check_frame_length(u32::from_be_bytes(len))?;
        buf.resize(len, 0);
        reader.read_exact(&mut buf).map_err(eof_as_protocol_eof)?;
        if let Some(message) = decode_message(&buf)? {
            return Ok(message);
        }
    }
}

pub async fn read_message_async<R>(reader: &mut R) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    loop {
        let len = reader
            .read_u32()
            .await
            .map_err(eof_as_protocol_eof)?;
        let len = check_frame_length(len)?;
        buf.resize(len, 0);
        reader
            .read_exact(&mut buf)
            .await
            .map_err(eof_as_protocol_eof)?;
        if let Some(message) = decode_message(&buf)? {
            return Ok(message);
        }
    }
}

fn eof_as_protocol_eof(error: std::io::Error) -> Error {
    if error.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::UnexpectedEof
    } else {
        Error::Io(error)
    }
}
