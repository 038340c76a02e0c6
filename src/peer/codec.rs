//! Wire-level encoding and decoding of the BitTorrent peer protocol (BEP 3):
//! the fixed handshake and the length-prefixed message stream that follows
//! it.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    bitfield::BitField,
    error::{Error, ProtocolError, Result},
    BlockInfo, PeerId, PieceIndex,
};

/// The protocol string identifying BitTorrent v1, as sent in every
/// handshake.
const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// A message's 4-byte length prefix may not exceed this many bytes. Chosen
/// generously above the largest legitimate message (a 16 KiB PIECE block
/// plus its small header) to reject memory-exhaustion attempts.
const MAX_MESSAGE_LEN: u32 = 1 << 20;

/// The fixed 68-byte handshake message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Handshake {
    pub info_hash: crate::Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: crate::Sha1Hash, peer_id: PeerId) -> Self {
        Self { info_hash, peer_id }
    }
}

/// Codec for the handshake only; the connection switches to [`PeerCodec`]
/// immediately afterwards.
pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(&mut self, handshake: Handshake, buf: &mut BytesMut) -> Result<()> {
        buf.reserve(1 + 19 + 8 + 20 + 20);
        buf.put_u8(19);
        buf.put_slice(PROTOCOL_STRING.as_bytes());
        buf.put_slice(&[0u8; 8]);
        buf.put_slice(&handshake.info_hash);
        buf.put_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Handshake>> {
        if buf.len() < 1 {
            return Ok(None);
        }
        let pstrlen = buf[0] as usize;
        let total = 1 + pstrlen + 8 + 20 + 20;
        if buf.len() < total {
            buf.reserve(total - buf.len());
            return Ok(None);
        }

        let mut buf = buf.split_to(total);
        buf.advance(1);
        if pstrlen != 19 || &buf[..19] != PROTOCOL_STRING.as_bytes() {
            return Err(Error::Protocol(ProtocolError::InvalidHandshake));
        }
        buf.advance(19);
        // reserved bytes, ignored
        buf.advance(8);

        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake { info_hash, peer_id }))
    }
}

/// Numeric wire ids of each message kind, per BEP 3.
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
    Piece = 7,
    Cancel = 8,
}

impl MessageId {
    fn from_u8(id: u8) -> Result<Self> {
        Ok(match id {
            0 => Self::Choke,
            1 => Self::Unchoke,
            2 => Self::Interested,
            3 => Self::NotInterested,
            4 => Self::Have,
            5 => Self::Bitfield,
            6 => Self::Request,
            7 => Self::Piece,
            8 => Self::Cancel,
            _ => return Err(Error::Protocol(ProtocolError::InvalidMessage { id })),
        })
    }
}

/// A single peer wire protocol message, after the length prefix and id byte
/// have been parsed away.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: PieceIndex },
    Bitfield(BitField),
    Request(BlockInfo),
    Block {
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
}

impl Message {
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
            Self::Block { .. } => Some(MessageId::Piece),
            Self::Cancel(_) => Some(MessageId::Cancel),
        }
    }
}

/// Codec for the post-handshake message stream.
pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> Result<()> {
        // reserve space for the length prefix, filled in once the payload
        // length is known
        let len_pos = buf.len();
        buf.put_u32(0);

        if let Some(id) = msg.id() {
            buf.put_u8(id as u8);
        }

        match msg {
            Message::KeepAlive
            | Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {}
            Message::Have { piece_index } => {
                buf.put_u32(piece_index as u32);
            }
            Message::Bitfield(bitfield) => {
                buf.put_slice(&bitfield.to_wire_bytes());
            }
            Message::Request(block) | Message::Cancel(block) => {
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.put_slice(&data);
            }
        }

        let payload_len = (buf.len() - len_pos - 4) as u32;
        buf[len_pos..len_pos + 4].copy_from_slice(&payload_len.to_be_bytes());

        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>> {
        loop {
            if buf.len() < 4 {
                return Ok(None);
            }
            let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
            if len > MAX_MESSAGE_LEN {
                return Err(Error::Protocol(ProtocolError::OversizePayload { len }));
            }
            if len == 0 {
                buf.advance(4);
                return Ok(Some(Message::KeepAlive));
            }

            let total = 4 + len as usize;
            if buf.len() < total {
                buf.reserve(total - buf.len());
                return Ok(None);
            }

            buf.advance(4);
            let id = buf.get_u8();
            let mut payload = buf.split_to(len as usize - 1);

            let id = MessageId::from_u8(id)?;
            let msg = match id {
                MessageId::Choke => Message::Choke,
                MessageId::Unchoke => Message::Unchoke,
                MessageId::Interested => Message::Interested,
                MessageId::NotInterested => Message::NotInterested,
                MessageId::Have => {
                    if payload.len() != 4 {
                        return Err(Error::Protocol(ProtocolError::InvalidMessage {
                            id: MessageId::Have as u8,
                        }));
                    }
                    Message::Have {
                        piece_index: payload.get_u32() as PieceIndex,
                    }
                }
                MessageId::Bitfield => {
                    // `piece_count` isn't known at this layer; callers resize
                    // the bitfield to the torrent's actual piece count.
                    let piece_count = payload.len() * 8;
                    Message::Bitfield(BitField::from_wire_bytes(&payload, piece_count))
                }
                MessageId::Request | MessageId::Cancel => {
                    if payload.len() != 12 {
                        return Err(Error::Protocol(ProtocolError::InvalidMessage { id: id as u8 }));
                    }
                    let block = BlockInfo {
                        piece_index: payload.get_u32() as PieceIndex,
                        offset: payload.get_u32(),
                        len: payload.get_u32(),
                    };
                    if id == MessageId::Request {
                        Message::Request(block)
                    } else {
                        Message::Cancel(block)
                    }
                }
                MessageId::Piece => {
                    if payload.len() < 8 {
                        return Err(Error::Protocol(ProtocolError::InvalidMessage {
                            id: MessageId::Piece as u8,
                        }));
                    }
                    let piece_index = payload.get_u32() as PieceIndex;
                    let offset = payload.get_u32();
                    let data = payload.to_vec();
                    Message::Block {
                        piece_index,
                        offset,
                        data,
                    }
                }
            };

            return Ok(Some(msg));
        }
    }
}
