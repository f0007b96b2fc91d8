//! The wire protocol of the swarm.
//!
//! Two frame shapes travel on a link. The handshake is a fixed 32 bytes
//! with no length prefix: the protocol string, ten reserved zero bytes, and
//! the sender's peer id. Every other frame is length prefixed, and the
//! 4-byte big endian length field counts the message id byte as well as the
//! payload, so an empty message (e.g. choke) has a length field of 1.
//!
//! The handshake is self-identifying by its leading magic, which is what
//! lets the reader recognize it without knowing in advance what the remote
//! will send first.

use std::convert::TryFrom;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    error::{Error, Result},
    Bitfield, PeerId, PieceIndex,
};

/// The protocol string every handshake starts with.
pub(crate) const PROTOCOL_STRING: &str = "P2PFILESHARINGPROJ";

/// The length of a handshake frame: the protocol string, 10 reserved zero
/// bytes, and a 4-byte peer id.
const HANDSHAKE_LEN: usize = PROTOCOL_STRING.len() + 10 + 4;

/// The handshake is the first frame exchanged on every new connection, in
/// both directions.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Handshake {
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(peer_id: PeerId) -> Self {
        Self { peer_id }
    }
}

pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(&mut self, handshake: Handshake, buf: &mut BytesMut) -> Result<()> {
        buf.reserve(HANDSHAKE_LEN);
        buf.extend_from_slice(PROTOCOL_STRING.as_bytes());
        buf.extend_from_slice(&[0; 10]);
        buf.put_u32(handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Handshake>> {
        if buf.len() < 4 {
            return Ok(None);
        }
        // the magic makes a handshake recognizable from its first bytes, so
        // anything else on a fresh connection is a protocol violation
        if buf[..4] != PROTOCOL_STRING.as_bytes()[..4] {
            return Err(Error::InvalidHandshake);
        }
        if buf.len() < HANDSHAKE_LEN {
            return Ok(None);
        }
        if buf[..PROTOCOL_STRING.len()] != *PROTOCOL_STRING.as_bytes() {
            return Err(Error::InvalidHandshake);
        }
        let mut frame = buf.split_to(HANDSHAKE_LEN);
        frame.advance(PROTOCOL_STRING.len() + 10);
        Ok(Some(Handshake::new(frame.get_u32())))
    }
}

/// The id of a message, as it appears on the wire.
///
/// The handshake never travels inside a length prefixed frame; its id
/// exists only so the program can name it alongside the others.
#[derive(Clone, Copy, Debug, PartialEq)]
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
    Handshake = 10,
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
            10 => Ok(Self::Handshake),
            id => Err(Error::InvalidMessageId(id)),
        }
    }
}

/// A regular, length prefixed protocol message.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Message {
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: PieceIndex },
    Bitfield(Bitfield),
    Request { piece_index: PieceIndex },
    Piece { piece_index: PieceIndex, data: Vec<u8> },
}

impl Message {
    /// Returns the id of the message.
    pub fn id(&self) -> MessageId {
        match self {
            Self::Choke => MessageId::Choke,
            Self::Unchoke => MessageId::Unchoke,
            Self::Interested => MessageId::Interested,
            Self::NotInterested => MessageId::NotInterested,
            Self::Have { .. } => MessageId::Have,
            Self::Bitfield(_) => MessageId::Bitfield,
            Self::Request { .. } => MessageId::Request,
            Self::Piece { .. } => MessageId::Piece,
        }
    }
}

pub(crate) struct PeerCodec {
    /// The largest length field a well-formed frame can carry, derived from
    /// the swarm's piece geometry. Anything larger is treated as a framing
    /// error rather than buffered indefinitely.
    max_frame_len: usize,
}

impl PeerCodec {
    pub fn new(piece_count: usize, piece_len: u32) -> Self {
        let piece_frame = 1 + 4 + piece_len as usize;
        let bitfield_frame = 1 + (piece_count + 7) / 8;
        Self {
            max_frame_len: piece_frame.max(bitfield_frame),
        }
    }
}

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> Result<()> {
        match msg {
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(msg.id() as u8);
            }
            Message::Have { piece_index } => {
                buf.put_u32(1 + 4);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index as u32);
            }
            Message::Bitfield(bitfield) => {
                let payload = bitfield.as_slice();
                buf.put_u32(1 + payload.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.extend_from_slice(payload);
            }
            Message::Request { piece_index } => {
                buf.put_u32(1 + 4);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(piece_index as u32);
            }
            Message::Piece { piece_index, data } => {
                buf.put_u32(1 + 4 + data.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(piece_index as u32);
                buf.extend_from_slice(&data);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let mut len_bytes = [0; 4];
        len_bytes.copy_from_slice(&buf[..4]);
        let frame_len = u32::from_be_bytes(len_bytes) as usize;
        // the length field counts the id byte, so it can never be zero
        if frame_len == 0 || frame_len > self.max_frame_len {
            return Err(Error::InvalidFrame);
        }
        if buf.len() < 4 + frame_len {
            return Ok(None);
        }

        buf.advance(4);
        let id = buf.get_u8();
        let payload_len = frame_len - 1;

        let msg = match MessageId::try_from(id)? {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => Message::Have {
                piece_index: decode_piece_index(buf, payload_len)?,
            },
            MessageId::Bitfield => {
                Message::Bitfield(Bitfield::from_vec(buf.split_to(payload_len).to_vec()))
            }
            MessageId::Request => Message::Request {
                piece_index: decode_piece_index(buf, payload_len)?,
            },
            MessageId::Piece => {
                if payload_len < 4 {
                    return Err(Error::InvalidFrame);
                }
                Message::Piece {
                    piece_index: buf.get_u32() as PieceIndex,
                    data: buf.split_to(payload_len - 4).to_vec(),
                }
            }
            // the handshake never travels inside a length prefixed frame
            MessageId::Handshake => return Err(Error::InvalidFrame),
        };
        Ok(Some(msg))
    }
}

fn decode_piece_index(buf: &mut BytesMut, payload_len: usize) -> Result<PieceIndex> {
    if payload_len != 4 {
        return Err(Error::InvalidFrame);
    }
    Ok(buf.get_u32() as PieceIndex)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn codec() -> PeerCodec {
        // 16 pieces of up to 1024 bytes
        PeerCodec::new(16, 1024)
    }

    fn encoded(msg: Message) -> BytesMut {
        let mut buf = BytesMut::new();
        codec().encode(msg, &mut buf).unwrap();
        buf
    }

    fn roundtrip(msg: Message) {
        let mut buf = encoded(msg.clone());
        let decoded = codec().decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn roundtrips_every_message_kind() {
        roundtrip(Message::Choke);
        roundtrip(Message::Unchoke);
        roundtrip(Message::Interested);
        roundtrip(Message::NotInterested);
        roundtrip(Message::Have { piece_index: 0 });
        roundtrip(Message::Have { piece_index: 15 });
        roundtrip(Message::Request { piece_index: 15 });
        roundtrip(Message::Piece {
            piece_index: 0,
            data: b"ABCD".to_vec(),
        });
        // a ragged tail piece is shorter than the rest
        roundtrip(Message::Piece {
            piece_index: 15,
            data: b"AB".to_vec(),
        });
        // empty bitfield and a full byte-aligned one
        roundtrip(Message::Bitfield(Bitfield::new()));
        roundtrip(Message::Bitfield(Bitfield::repeat(true, 16)));
    }

    #[test]
    fn length_field_counts_the_id_byte() {
        assert_eq!(&encoded(Message::Choke)[..], [0, 0, 0, 1, 0]);
        assert_eq!(
            &encoded(Message::Have { piece_index: 9 })[..],
            [0, 0, 0, 5, 4, 0, 0, 0, 9]
        );
        assert_eq!(
            &encoded(Message::Piece {
                piece_index: 2,
                data: b"IJ".to_vec(),
            })[..],
            [0, 0, 0, 7, 7, 0, 0, 0, 2, b'I', b'J']
        );
    }

    #[test]
    fn wire_bitfield_is_padded_to_whole_bytes() {
        let mut bitfield = Bitfield::repeat(false, 12);
        bitfield.set(0, true);
        bitfield.set(11, true);

        let mut buf = encoded(Message::Bitfield(bitfield));
        // 2 payload bytes for 12 pieces, MSB first within each byte
        assert_eq!(&buf[..], [0, 0, 0, 3, 5, 0b1000_0000, 0b0001_0000]);

        // the decoded bitmap keeps the padding; receivers truncate it to
        // the swarm's piece count
        match codec().decode(&mut buf).unwrap().unwrap() {
            Message::Bitfield(decoded) => {
                assert_eq!(decoded.len(), 16);
                assert!(decoded[0]);
                assert!(decoded[11]);
                assert_eq!(decoded.count_ones(), 2);
            }
            other => panic!("expected bitfield, got {:?}", other),
        }
    }

    #[test]
    fn decodes_partial_frames_incrementally() {
        let full = encoded(Message::Request { piece_index: 3 });

        let mut buf = BytesMut::from(&full[..3]);
        assert_eq!(codec().decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&full[3..6]);
        assert_eq!(codec().decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&full[6..]);
        assert_eq!(
            codec().decode(&mut buf).unwrap(),
            Some(Message::Request { piece_index: 3 })
        );
    }

    #[test]
    fn rejects_malformed_frames() {
        // unknown message id
        let mut buf = BytesMut::from(&[0, 0, 0, 1, 9][..]);
        assert!(codec().decode(&mut buf).is_err());

        // zero length field
        let mut buf = BytesMut::from(&[0, 0, 0, 0][..]);
        assert!(codec().decode(&mut buf).is_err());

        // have frame with a truncated index
        let mut buf = BytesMut::from(&[0, 0, 0, 2, 4, 1][..]);
        assert!(codec().decode(&mut buf).is_err());

        // length field far beyond any frame of this swarm
        let mut buf = BytesMut::from(&[0xff, 0xff, 0xff, 0xff][..]);
        assert!(codec().decode(&mut buf).is_err());
    }

    #[test]
    fn handshake_is_32_bytes_with_magic_and_id() {
        let mut buf = BytesMut::new();
        HandshakeCodec
            .encode(Handshake::new(42), &mut buf)
            .unwrap();

        let mut expected = Vec::new();
        expected.extend_from_slice(b"P2PFILESHARINGPROJ");
        expected.extend_from_slice(&[0; 10]);
        expected.extend_from_slice(&[0, 0, 0, 42]);
        assert_eq!(&buf[..], &expected[..]);

        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Handshake::new(42));
        assert!(buf.is_empty());
    }

    #[test]
    fn handshake_decodes_incrementally() {
        let mut full = BytesMut::new();
        HandshakeCodec.encode(Handshake::new(7), &mut full).unwrap();

        let mut buf = BytesMut::from(&full[..20]);
        assert_eq!(HandshakeCodec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&full[20..]);
        assert_eq!(
            HandshakeCodec.decode(&mut buf).unwrap(),
            Some(Handshake::new(7))
        );
    }

    #[test]
    fn handshake_with_bad_magic_is_rejected() {
        let mut buf = BytesMut::from(&b"NOTAHANDSHAKEFRAME0000000000042!"[..]);
        assert!(HandshakeCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn handshake_keeps_pipelined_bytes_in_the_buffer() {
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(Handshake::new(42), &mut buf).unwrap();
        // the remote pipelined a frame right behind its handshake
        buf.extend_from_slice(&[0, 0, 0, 1, 2]);

        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.peer_id, 42);
        assert_eq!(
            codec().decode(&mut buf).unwrap(),
            Some(Message::Interested)
        );
    }
}
