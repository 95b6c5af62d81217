//! The wire codec: framing for the BitTorrent handshake and the
//! length-prefixed peer message stream (BEP 3, §4.1 of the design).
//!
//! Two independent `tokio_util::codec` implementations exist because the
//! handshake and the steady-state message stream use entirely different
//! framing rules, and because a peer session only ever needs the handshake
//! codec once, at the very start of the connection.

use std::convert::TryFrom;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    error::{Error, Result},
    Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash,
};

/// The literal protocol string exchanged in every handshake.
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// `1 (pstrlen) + 19 (pstr) + 8 (reserved) + 20 (info hash) + 20 (peer id)`.
const HANDSHAKE_LEN: usize = 1 + 19 + 8 + 20 + 20;

/// The initial handshake message exchanged by both ends of a peer
/// connection before any other message may be sent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        Self {
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }
}

/// Encodes and decodes the fixed-length handshake frame.
///
/// This is a distinct codec from [`PeerCodec`] because the handshake's
/// framing (a length-prefixed protocol string rather than a 4 byte message
/// length) differs from every other message on the wire.
pub(crate) struct HandshakeCodec;

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Handshake>> {
        if src.is_empty() {
            return Ok(None);
        }
        let pstrlen = src[0] as usize;
        if pstrlen != PROTOCOL_STRING.len() {
            return Err(Error::ProtocolMismatch);
        }
        if src.len() < HANDSHAKE_LEN {
            src.reserve(HANDSHAKE_LEN - src.len());
            return Ok(None);
        }

        let mut buf = src.split_to(HANDSHAKE_LEN);
        buf.advance(1); // pstrlen
        let pstr = buf.split_to(pstrlen);
        if pstr != PROTOCOL_STRING.as_bytes() {
            return Err(Error::ProtocolMismatch);
        }

        let mut reserved = [0; 8];
        reserved.copy_from_slice(&buf[..8]);
        buf.advance(8);

        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&buf[..20]);
        buf.advance(20);

        let mut peer_id = [0; 20];
        peer_id.copy_from_slice(&buf[..20]);

        Ok(Some(Handshake {
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(&mut self, handshake: Handshake, dst: &mut BytesMut) -> Result<()> {
        dst.reserve(HANDSHAKE_LEN);
        dst.put_u8(PROTOCOL_STRING.len() as u8);
        dst.put(PROTOCOL_STRING.as_bytes());
        dst.put(&handshake.reserved[..]);
        dst.put(&handshake.info_hash[..]);
        dst.put(&handshake.peer_id[..]);
        Ok(())
    }
}

/// The numeric ids used on the wire to distinguish message types, per BEP 3.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
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

impl TryFrom<u8> for MessageId {
    type Error = Error;

    fn try_from(id: u8) -> Result<Self> {
        match id {
            0 => Ok(Self::Choke),
            1 => Ok(Self::Unchoke),
            2 => Ok(Self::Interested),
            3 => Ok(Self::NotInterested),
            4 => Ok(Self::Have),
            5 => Ok(Self::Bitfield),
            6 => Ok(Self::Request),
            7 => Ok(Self::Piece),
            8 => Ok(Self::Cancel),
            _ => Err(Error::InvalidMessageId(id)),
        }
    }
}

/// A single peer protocol message, post-handshake.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: PieceIndex },
    Bitfield(Bitfield),
    Request(BlockInfo),
    Piece { piece_index: PieceIndex, offset: u32, data: Vec<u8> },
    Cancel(BlockInfo),
}

impl Message {
    /// Returns the wire id of this message, or `None` for the synthetic
    /// keep-alive (which has no id on the wire).
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
            Self::Piece { .. } => Some(MessageId::Piece),
            Self::Cancel(_) => Some(MessageId::Cancel),
        }
    }
}

fn read_u32(buf: &[u8]) -> u32 {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
}

fn decode_block_info(payload: &[u8]) -> BlockInfo {
    BlockInfo {
        piece_index: read_u32(&payload[0..4]) as PieceIndex,
        offset: read_u32(&payload[4..8]),
        len: read_u32(&payload[8..12]),
    }
}

/// Encodes and decodes the length-prefixed message frames exchanged after
/// the handshake.
pub(crate) struct PeerCodec;

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = read_u32(&src[0..4]) as usize;
        if len == 0 {
            src.advance(4);
            return Ok(Some(Message::KeepAlive));
        }

        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let id = src[0];
        let message_id = MessageId::try_from(id)?;
        src.advance(1);
        let payload_len = len - 1;
        let payload = src.split_to(payload_len);

        let msg = match message_id {
            MessageId::Choke => {
                require_len(payload_len, 0)?;
                Message::Choke
            }
            MessageId::Unchoke => {
                require_len(payload_len, 0)?;
                Message::Unchoke
            }
            MessageId::Interested => {
                require_len(payload_len, 0)?;
                Message::Interested
            }
            MessageId::NotInterested => {
                require_len(payload_len, 0)?;
                Message::NotInterested
            }
            MessageId::Have => {
                require_len(payload_len, 4)?;
                Message::Have {
                    piece_index: read_u32(&payload[0..4]) as PieceIndex,
                }
            }
            MessageId::Bitfield => {
                // the wire bitfield is padded to a byte boundary; callers
                // resize it down to the actual piece count once they know it
                Message::Bitfield(Bitfield::from_vec(payload.to_vec()))
            }
            MessageId::Request => {
                require_len(payload_len, 12)?;
                Message::Request(decode_block_info(&payload))
            }
            MessageId::Piece => {
                if payload_len < 8 {
                    return Err(Error::BadPayloadSize);
                }
                let piece_index = read_u32(&payload[0..4]) as PieceIndex;
                let offset = read_u32(&payload[4..8]);
                let data = payload[8..].to_vec();
                Message::Piece { piece_index, offset, data }
            }
            MessageId::Cancel => {
                require_len(payload_len, 12)?;
                Message::Cancel(decode_block_info(&payload))
            }
        };

        Ok(Some(msg))
    }
}

fn require_len(actual: usize, expected: usize) -> Result<()> {
    if actual != expected {
        Err(Error::BadPayloadSize)
    } else {
        Ok(())
    }
}

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<()> {
        let id = msg.id();
        let payload_len = match &msg {
            Message::KeepAlive => 0,
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => 0,
            Message::Have { .. } => 4,
            Message::Bitfield(bf) => (bf.len() + 7) / 8,
            Message::Request(_) | Message::Cancel(_) => 12,
            Message::Piece { data, .. } => 8 + data.len(),
        };

        let id_len = if id.is_some() { 1 } else { 0 };
        dst.reserve(4 + id_len + payload_len);
        dst.put_u32(id_len as u32 + payload_len as u32);
        if let Some(id) = id {
            dst.put_u8(id as u8);
        }

        match msg {
            Message::KeepAlive
            | Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {}
            Message::Have { piece_index } => {
                dst.put_u32(piece_index as u32);
            }
            Message::Bitfield(bf) => {
                dst.put(bf.into_vec().as_slice());
            }
            Message::Request(block) | Message::Cancel(block) => {
                dst.put_u32(block.piece_index as u32);
                dst.put_u32(block.offset);
                dst.put_u32(block.len);
            }
            Message::Piece { piece_index, offset, data } => {
                dst.put_u32(piece_index as u32);
                dst.put_u32(offset);
                dst.put(data.as_slice());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitvec::prelude::{BitVec, Msb0};

    fn roundtrip_message(msg: Message) -> Message {
        let mut buf = BytesMut::new();
        PeerCodec.encode(msg, &mut buf).unwrap();
        PeerCodec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn roundtrips_simple_messages() {
        assert_eq!(roundtrip_message(Message::Choke), Message::Choke);
        assert_eq!(roundtrip_message(Message::Unchoke), Message::Unchoke);
        assert_eq!(roundtrip_message(Message::Interested), Message::Interested);
        assert_eq!(
            roundtrip_message(Message::NotInterested),
            Message::NotInterested
        );
    }

    #[test]
    fn roundtrips_have() {
        let msg = Message::Have { piece_index: 42 };
        assert_eq!(roundtrip_message(msg.clone()), msg);
    }

    #[test]
    fn roundtrips_request_and_cancel() {
        let block = BlockInfo { piece_index: 3, offset: 16384, len: 16384 };
        assert_eq!(
            roundtrip_message(Message::Request(block)),
            Message::Request(block)
        );
        assert_eq!(
            roundtrip_message(Message::Cancel(block)),
            Message::Cancel(block)
        );
    }

    #[test]
    fn roundtrips_piece() {
        let msg = Message::Piece {
            piece_index: 1,
            offset: 0,
            data: vec![1, 2, 3, 4],
        };
        assert_eq!(roundtrip_message(msg.clone()), msg);
    }

    #[test]
    fn roundtrips_bitfield() {
        let mut bf = BitVec::<Msb0, u8>::repeat(false, 16);
        bf.set(0, true);
        bf.set(7, true);
        bf.set(15, true);
        let msg = Message::Bitfield(bf.clone());
        let decoded = roundtrip_message(msg);
        assert_eq!(decoded, Message::Bitfield(bf));
    }

    #[test]
    fn keep_alive_has_zero_length_prefix() {
        let mut buf = BytesMut::new();
        PeerCodec.encode(Message::KeepAlive, &mut buf).unwrap();
        assert_eq!(buf.len(), 4);
        assert_eq!(read_u32(&buf[0..4]), 0);
    }

    #[test]
    fn rejects_bad_payload_size() {
        let mut buf = BytesMut::new();
        // Have message with a 1-byte payload instead of 4
        buf.put_u32(2);
        buf.put_u8(MessageId::Have as u8);
        buf.put_u8(0);
        assert!(matches!(
            PeerCodec.decode(&mut buf),
            Err(Error::BadPayloadSize)
        ));
    }

    #[test]
    fn rejects_unknown_message_id() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(200);
        assert!(matches!(
            PeerCodec.decode(&mut buf),
            Err(Error::InvalidMessageId(200))
        ));
    }

    #[test]
    fn handshake_roundtrips() {
        let handshake = Handshake::new([1; 20], [2; 20]);
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake.clone(), &mut buf).unwrap();
        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, handshake);
    }

    #[test]
    fn handshake_rejects_wrong_protocol_string() {
        let mut buf = BytesMut::new();
        buf.put_u8(10);
        buf.put(&b"OtherProto"[..]);
        buf.put(&[0u8; 8][..]);
        buf.put(&[0u8; 20][..]);
        buf.put(&[0u8; 20][..]);
        assert!(matches!(
            HandshakeCodec.decode(&mut buf),
            Err(Error::ProtocolMismatch)
        ));
    }

    #[test]
    fn handshake_waits_for_more_bytes() {
        let mut buf = BytesMut::new();
        buf.put_u8(19);
        buf.put(&PROTOCOL_STRING.as_bytes()[..]);
        // incomplete: missing reserved/info_hash/peer_id
        assert_eq!(HandshakeCodec.decode(&mut buf).unwrap(), None);
    }
}
