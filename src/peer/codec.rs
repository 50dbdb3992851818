//! The wire codecs: the fixed 68-byte handshake and the length-prefixed
//! peer messages of BEP 3, extended with the BEP 6 fast-extension messages
//! and the BEP 10 extension envelope.

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash};

/// The protocol string of the standard BitTorrent handshake.
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// An upper bound on the advertised message length. The largest legitimate
/// message is a block (16 KiB plus header) or a bitfield; anything past
/// this is a protocol error or an attempt to make us allocate unboundedly.
const MAX_MESSAGE_LEN: u32 = 2 * 1024 * 1024;

// reserved-byte capability bits
const EXTENSION_BYTE: usize = 5;
const EXTENSION_BIT: u8 = 0x10;
const FAST_BYTE: usize = 7;
const FAST_BIT: u8 = 0x04;
const DHT_BYTE: usize = 7;
const DHT_BIT: u8 = 0x01;

/// The standard BitTorrent handshake.
#[derive(Clone, Debug)]
pub(crate) struct Handshake {
    /// The protocol string, always "BitTorrent protocol" (the codec rejects
    /// anything else).
    pub prot: [u8; 19],
    /// Capability bits.
    pub reserved: [u8; 8],
    /// The torrent's wire info hash: v1, or the truncated v2 hash.
    pub info_hash: Sha1Hash,
    /// The remote peer's arbitrary 20 byte id.
    pub peer_id: PeerId,
}

impl Handshake {
    /// Creates our side of the handshake, advertising the capabilities this
    /// engine implements (fast extension, extension protocol, DHT).
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        let mut reserved = [0; 8];
        reserved[EXTENSION_BYTE] |= EXTENSION_BIT;
        reserved[FAST_BYTE] |= FAST_BIT | DHT_BIT;
        Self {
            prot,
            reserved,
            info_hash,
            peer_id,
        }
    }

    pub fn supports_fast(&self) -> bool {
        self.reserved[FAST_BYTE] & FAST_BIT != 0
    }

    pub fn supports_extension(&self) -> bool {
        self.reserved[EXTENSION_BYTE] & EXTENSION_BIT != 0
    }

    pub fn supports_dht(&self) -> bool {
        self.reserved[DHT_BYTE] & DHT_BIT != 0
    }
}

/// Codec for the handshake exchange right after connecting.
pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = io::Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> io::Result<()> {
        buf.reserve(68);
        buf.put_u8(PROTOCOL_STRING.len() as u8);
        buf.put_slice(&handshake.prot);
        buf.put_slice(&handshake.reserved);
        buf.put_slice(&handshake.info_hash);
        buf.put_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Handshake>> {
        if buf.is_empty() {
            return Ok(None);
        }
        // the protocol string length must be valid before waiting for the
        // full handshake
        if buf[0] as usize != PROTOCOL_STRING.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid handshake protocol string length",
            ));
        }
        if buf.len() < 68 {
            return Ok(None);
        }

        buf.advance(1);
        let mut prot = [0; 19];
        buf.copy_to_slice(&mut prot);
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid handshake protocol string",
            ));
        }
        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// The id byte of each message, directly after the length prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Block = 7,
    Cancel = 8,
    DhtPort = 9,
    SuggestPiece = 13,
    HaveAll = 14,
    HaveNone = 15,
    RejectRequest = 16,
    AllowedFast = 17,
    Extended = 20,
}

impl MessageId {
    fn from_u8(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::Choke),
            1 => Some(Self::Unchoke),
            2 => Some(Self::Interested),
            3 => Some(Self::NotInterested),
            4 => Some(Self::Have),
            5 => Some(Self::Bitfield),
            6 => Some(Self::Request),
            7 => Some(Self::Block),
            8 => Some(Self::Cancel),
            9 => Some(Self::DhtPort),
            13 => Some(Self::SuggestPiece),
            14 => Some(Self::HaveAll),
            15 => Some(Self::HaveNone),
            16 => Some(Self::RejectRequest),
            17 => Some(Self::AllowedFast),
            20 => Some(Self::Extended),
            _ => None,
        }
    }
}

/// A peer protocol message.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece_index: PieceIndex,
    },
    Bitfield(Bitfield),
    Request(BlockInfo),
    Block {
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
    DhtPort(u16),
    SuggestPiece {
        piece_index: PieceIndex,
    },
    HaveAll,
    HaveNone,
    RejectRequest(BlockInfo),
    AllowedFast {
        piece_index: PieceIndex,
    },
    Extended {
        id: u8,
        payload: Vec<u8>,
    },
}

impl Message {
    /// The message's id, or `None` for a keepalive (which has no id byte).
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Self::KeepAlive => None,
            Self::Choke => Some(MessageId::Choke),
            Self::Unchoke => Some(MessageId::Unchoke),
            Self::Interested => Some(MessageId::Interested),
            Self::NotInterested => Some(MessageId::NotInterested),
            Self::Have { .. } => Some(MessageId::Have),
            Self::Bitfield(_) => Some(MessageId::Bitfield),
            Self::Request(_) => Some(MessageId::Request),
            Self::Block { .. } => Some(MessageId::Block),
            Self::Cancel(_) => Some(MessageId::Cancel),
            Self::DhtPort(_) => Some(MessageId::DhtPort),
            Self::SuggestPiece { .. } => Some(MessageId::SuggestPiece),
            Self::HaveAll => Some(MessageId::HaveAll),
            Self::HaveNone => Some(MessageId::HaveNone),
            Self::RejectRequest(_) => Some(MessageId::RejectRequest),
            Self::AllowedFast { .. } => Some(MessageId::AllowedFast),
            Self::Extended { .. } => Some(MessageId::Extended),
        }
    }
}

/// Codec for the length-prefixed messages after the handshake.
pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = io::Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> io::Result<()> {
        use Message::*;
        match msg {
            KeepAlive => {
                buf.put_u32(0);
            }
            Choke | Unchoke | Interested | NotInterested | HaveAll
            | HaveNone => {
                buf.put_u32(1);
                buf.put_u8(msg.id().expect("not keepalive") as u8);
            }
            Have { piece_index } | SuggestPiece { piece_index }
            | AllowedFast { piece_index } => {
                let id = msg.id().expect("not keepalive");
                buf.put_u32(1 + 4);
                buf.put_u8(id as u8);
                buf.put_u32(piece_index as u32);
            }
            Bitfield(bitfield) => {
                let bytes = bitfield.as_slice();
                buf.put_u32(1 + bytes.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(bytes);
            }
            Request(block) | Cancel(block) | RejectRequest(block) => {
                let id = msg.id().expect("not keepalive");
                buf.put_u32(1 + 3 * 4);
                buf.put_u8(id as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Block {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(1 + 2 * 4 + data.len() as u32);
                buf.put_u8(MessageId::Block as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.put_slice(&data);
            }
            DhtPort(port) => {
                buf.put_u32(1 + 2);
                buf.put_u8(MessageId::DhtPort as u8);
                buf.put_u16(port);
            }
            Extended { id, payload } => {
                buf.put_u32(2 + payload.len() as u32);
                buf.put_u8(MessageId::Extended as u8);
                buf.put_u8(id);
                buf.put_slice(&payload);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Message>> {
        if buf.len() < 4 {
            return Ok(None);
        }
        // peek the length prefix without consuming it, as the full message
        // may not have arrived yet
        let mut len_bytes = [0; 4];
        len_bytes.copy_from_slice(&buf[..4]);
        let len = u32::from_be_bytes(len_bytes);
        if len > MAX_MESSAGE_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "message length exceeds the protocol maximum",
            ));
        }
        if (buf.len() as u32) < 4 + len {
            return Ok(None);
        }
        buf.advance(4);

        if len == 0 {
            return Ok(Some(Message::KeepAlive));
        }
        let mut payload = buf.split_to(len as usize);
        let id = payload.get_u8();
        let id = MessageId::from_u8(id).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "invalid message id")
        })?;

        use MessageId::*;
        let msg = match id {
            Choke => Message::Choke,
            Unchoke => Message::Unchoke,
            Interested => Message::Interested,
            NotInterested => Message::NotInterested,
            Have => {
                check_payload_len(&payload, 4)?;
                Message::Have {
                    piece_index: payload.get_u32() as PieceIndex,
                }
            }
            Bitfield => Message::Bitfield(crate::Bitfield::from_vec(
                payload.to_vec(),
            )),
            Request => Message::Request(decode_block_info(&mut payload)?),
            Block => {
                check_min_payload_len(&payload, 8)?;
                let piece_index = payload.get_u32() as PieceIndex;
                let offset = payload.get_u32();
                Message::Block {
                    piece_index,
                    offset,
                    data: payload.to_vec(),
                }
            }
            Cancel => Message::Cancel(decode_block_info(&mut payload)?),
            DhtPort => {
                check_payload_len(&payload, 2)?;
                Message::DhtPort(payload.get_u16())
            }
            SuggestPiece => {
                check_payload_len(&payload, 4)?;
                Message::SuggestPiece {
                    piece_index: payload.get_u32() as PieceIndex,
                }
            }
            HaveAll => Message::HaveAll,
            HaveNone => Message::HaveNone,
            RejectRequest => {
                Message::RejectRequest(decode_block_info(&mut payload)?)
            }
            AllowedFast => {
                check_payload_len(&payload, 4)?;
                Message::AllowedFast {
                    piece_index: payload.get_u32() as PieceIndex,
                }
            }
            Extended => {
                check_min_payload_len(&payload, 1)?;
                let id = payload.get_u8();
                Message::Extended {
                    id,
                    payload: payload.to_vec(),
                }
            }
        };
        Ok(Some(msg))
    }
}

fn decode_block_info(payload: &mut BytesMut) -> io::Result<BlockInfo> {
    check_payload_len(payload, 12)?;
    Ok(BlockInfo {
        piece_index: payload.get_u32() as PieceIndex,
        offset: payload.get_u32(),
        len: payload.get_u32(),
    })
}

fn check_payload_len(payload: &BytesMut, expected: usize) -> io::Result<()> {
    if payload.len() != expected {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "invalid message payload length",
        ));
    }
    Ok(())
}

fn check_min_payload_len(payload: &BytesMut, min: usize) -> io::Result<()> {
    if payload.len() < min {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "message payload too short",
        ));
    }
    Ok(())
}
