use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::PeerError;

/// Protocol identifier carried in every handshake.
pub const PROTOCOL_TAG: &[u8] = b"URTorrent protocol";

/// Fixed handshake length: tag length byte + 18-byte tag + 8 reserved +
/// 20-byte info hash + 20-byte peer id.
pub const HANDSHAKE_LEN: usize = 67;

/// Message type identifiers. Every framed message except keep-alive carries
/// one of these as its first payload byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
}

impl TryFrom<u8> for MessageId {
    type Error = PeerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            other => Err(PeerError::UnknownMessageId(other)),
        }
    }
}

/// The 67-byte connection preamble.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self { info_hash, peer_id }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL_TAG.len() as u8);
        buf.put_slice(PROTOCOL_TAG);
        buf.put_slice(&[0u8; 8]);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf.freeze()
    }

    /// Decodes a handshake, validating only the protocol tag. The caller
    /// decides what a mismatched info hash means for the connection.
    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        if data.len() < HANDSHAKE_LEN {
            return Err(PeerError::BadHandshake);
        }
        if data[0] as usize != PROTOCOL_TAG.len() || &data[1..19] != PROTOCOL_TAG {
            return Err(PeerError::BadHandshake);
        }

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[27..47]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[47..67]);

        Ok(Self { info_hash, peer_id })
    }
}

/// A framed peer wire message: a `u32` big-endian length prefix followed by
/// the message id and payload. A zero-length prefix is a keep-alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece: u32 },
    Bitfield(Bytes),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, data: Bytes },
}

impl Message {
    /// Encodes the message including its length prefix.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();

        match self {
            Message::KeepAlive => buf.put_u32(0),
            Message::Choke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Choke as u8);
            }
            Message::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Unchoke as u8);
            }
            Message::Interested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Interested as u8);
            }
            Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::NotInterested as u8);
            }
            Message::Have { piece } => {
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(*piece);
            }
            Message::Bitfield(bits) => {
                buf.put_u32(1 + bits.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(bits);
            }
            Message::Request {
                index,
                begin,
                length,
            } => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece { index, begin, data } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(data);
            }
        }

        buf.freeze()
    }

    /// Decodes a message from a buffer that starts at the length prefix and
    /// contains the complete frame.
    pub fn decode(mut data: Bytes) -> Result<Self, PeerError> {
        if data.len() < 4 {
            return Err(PeerError::InvalidMessage("short prefix".into()));
        }

        let length = data.get_u32() as usize;
        if length == 0 {
            return Ok(Message::KeepAlive);
        }
        if data.remaining() < length {
            return Err(PeerError::InvalidMessage("truncated frame".into()));
        }

        match MessageId::try_from(data.get_u8())? {
            MessageId::Choke => Ok(Message::Choke),
            MessageId::Unchoke => Ok(Message::Unchoke),
            MessageId::Interested => Ok(Message::Interested),
            MessageId::NotInterested => Ok(Message::NotInterested),
            MessageId::Have => {
                if length != 5 {
                    return Err(PeerError::InvalidMessage("bad have length".into()));
                }
                Ok(Message::Have {
                    piece: data.get_u32(),
                })
            }
            MessageId::Bitfield => Ok(Message::Bitfield(data.copy_to_bytes(length - 1))),
            MessageId::Request => {
                if length != 13 {
                    return Err(PeerError::InvalidMessage("bad request length".into()));
                }
                Ok(Message::Request {
                    index: data.get_u32(),
                    begin: data.get_u32(),
                    length: data.get_u32(),
                })
            }
            MessageId::Piece => {
                if length < 9 {
                    return Err(PeerError::InvalidMessage("bad piece length".into()));
                }
                let index = data.get_u32();
                let begin = data.get_u32();
                Ok(Message::Piece {
                    index,
                    begin,
                    data: data.copy_to_bytes(length - 9),
                })
            }
        }
    }
}
