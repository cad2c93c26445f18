//! The two wire codecs a peer connection goes through: the fixed 68 byte
//! handshake frame, and the length-prefixed message frames that make up the
//! rest of the session.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{error::*, Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash};

/// The protocol string required in every handshake.
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The initial message transmitted after the TCP connection is established.
///
/// Layout: 1 byte protocol string length (always 19), the protocol string,
/// 8 reserved bytes (we send zeroes and ignore what we receive), the 20 byte
/// info hash, and the sender's 20 byte peer id.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Handshake {
    /// The protocol string, which must equal [`PROTOCOL_STRING`].
    pub prot: [u8; 19],
    /// Reserved extension bits. We advertise none.
    pub reserved: [u8; 8],
    /// The torrent's SHA-1 info hash, binding the connection to a swarm.
    pub info_hash: Sha1Hash,
    /// The sender's arbitrary peer id.
    pub peer_id: PeerId,
}

impl Handshake {
    /// Creates a new protocol version 1 handshake with the given info hash
    /// and peer id.
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        Self {
            prot,
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }
}

/// The length of the wire representation of a handshake.
const HANDSHAKE_LEN: usize = 1 + 19 + 8 + 20 + 20;

/// Codec for the handshake exchange at the start of a connection.
pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> Result<()> {
        let Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        } = handshake;

        buf.reserve(HANDSHAKE_LEN);
        buf.put_u8(prot.len() as u8);
        buf.extend_from_slice(&prot);
        buf.extend_from_slice(&reserved);
        buf.extend_from_slice(&info_hash);
        buf.extend_from_slice(&peer_id);

        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Handshake>> {
        if buf.is_empty() {
            return Ok(None);
        }

        // the protocol string length is checked as soon as it's available so
        // that a peer speaking something else is rejected without waiting
        // for 68 bytes that may never come
        let prot_len = buf[0] as usize;
        if prot_len != PROTOCOL_STRING.len() {
            return Err(Error::HandshakeProtocolMismatch);
        }

        if buf.len() < HANDSHAKE_LEN {
            buf.reserve(HANDSHAKE_LEN - buf.len());
            return Ok(None);
        }
        buf.advance(1);

        let mut prot = [0; 19];
        buf.copy_to_slice(&mut prot);
        if prot[..] != *PROTOCOL_STRING.as_bytes() {
            return Err(Error::HandshakeProtocolMismatch);
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

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Handshake>> {
        match self.decode(buf)? {
            Some(handshake) => Ok(Some(handshake)),
            None if buf.is_empty() => Ok(None),
            None => Err(Error::ShortRead),
        }
    }
}

/// The ids of the protocol messages that carry one.
///
/// Keep-alives are a zero length frame and so have no id; ids outside this
/// set are decoded as [`Message::Unknown`] and must never tear down a
/// session.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq)]
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
}

/// A message in the peer wire protocol.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Message {
    /// A zero length frame, sent periodically to keep the connection from
    /// idling out.
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    /// Announces that the sender acquired the piece at the given index.
    Have { piece_index: PieceIndex },
    /// The sender's full piece availability. Only valid as the first
    /// message after the handshake.
    Bitfield(Bitfield),
    /// Asks the receiver for a block of a piece.
    Request(BlockInfo),
    /// Carries a block of a piece. The canonical name of this message is
    /// "piece", but it transfers a single block of one.
    Block {
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    },
    /// Revokes an earlier request.
    Cancel(BlockInfo),
    /// A message with an id we don't recognize. Logged and otherwise
    /// ignored.
    Unknown { id: u8, payload: Vec<u8> },
}

impl Message {
    /// Returns the id carried on the wire for this message, if any.
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Self::KeepAlive | Self::Unknown { .. } => None,
            Self::Choke => Some(MessageId::Choke),
            Self::Unchoke => Some(MessageId::Unchoke),
            Self::Interested => Some(MessageId::Interested),
            Self::NotInterested => Some(MessageId::NotInterested),
            Self::Have { .. } => Some(MessageId::Have),
            Self::Bitfield(_) => Some(MessageId::Bitfield),
            Self::Request(_) => Some(MessageId::Request),
            Self::Block { .. } => Some(MessageId::Block),
            Self::Cancel(_) => Some(MessageId::Cancel),
        }
    }
}

/// Codec for the length-prefixed message frames exchanged after the
/// handshake.
///
/// Each frame is a 4 byte big-endian length followed by that many bytes; a
/// zero length is a keep-alive, otherwise the first body byte is the message
/// id. The length prefix is only trusted up to `max_frame_len`.
pub(crate) struct PeerCodec {
    max_frame_len: usize,
}

impl PeerCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }
}

impl Default for PeerCodec {
    fn default() -> Self {
        // 2 MiB, far above the largest legitimate message
        Self::new(2 * 1024 * 1024)
    }
}

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> Result<()> {
        match msg {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
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
            Message::Request(block) => {
                buf.put_u32(1 + 3 * 4);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(1 + 2 * 4 + data.len() as u32);
                buf.put_u8(MessageId::Block as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.extend_from_slice(&data);
            }
            Message::Cancel(block) => {
                buf.put_u32(1 + 3 * 4);
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Message::Unknown { id, payload } => {
                buf.put_u32(1 + payload.len() as u32);
                buf.put_u8(id);
                buf.extend_from_slice(&payload);
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

        // peek at the length prefix without consuming it, as the rest of the
        // frame may not have arrived yet
        let mut prefix = [0; 4];
        prefix.copy_from_slice(&buf[..4]);
        let msg_len = u32::from_be_bytes(prefix) as usize;

        // an adversarial length prefix must be rejected before we start
        // buffering for it
        if msg_len > self.max_frame_len {
            return Err(Error::FrameTooLarge(msg_len));
        }

        if buf.len() < 4 + msg_len {
            buf.reserve(4 + msg_len - buf.len());
            return Ok(None);
        }
        buf.advance(4);

        if msg_len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let mut frame = buf.split_to(msg_len);
        let id = frame.get_u8();
        let msg = match id {
            id if id == MessageId::Choke as u8 => Message::Choke,
            id if id == MessageId::Unchoke as u8 => Message::Unchoke,
            id if id == MessageId::Interested as u8 => Message::Interested,
            id if id == MessageId::NotInterested as u8 => {
                Message::NotInterested
            }
            id if id == MessageId::Have as u8 => {
                if frame.remaining() != 4 {
                    return Err(Error::MalformedFrame);
                }
                Message::Have {
                    piece_index: frame.get_u32() as PieceIndex,
                }
            }
            id if id == MessageId::Bitfield as u8 => {
                Message::Bitfield(Bitfield::from_vec(frame.to_vec()))
            }
            id if id == MessageId::Request as u8 => {
                if frame.remaining() != 3 * 4 {
                    return Err(Error::MalformedFrame);
                }
                Message::Request(BlockInfo {
                    piece_index: frame.get_u32() as PieceIndex,
                    offset: frame.get_u32(),
                    len: frame.get_u32(),
                })
            }
            id if id == MessageId::Block as u8 => {
                if frame.remaining() < 2 * 4 {
                    return Err(Error::MalformedFrame);
                }
                Message::Block {
                    piece_index: frame.get_u32() as PieceIndex,
                    offset: frame.get_u32(),
                    data: frame.to_vec(),
                }
            }
            id if id == MessageId::Cancel as u8 => {
                if frame.remaining() != 3 * 4 {
                    return Err(Error::MalformedFrame);
                }
                Message::Cancel(BlockInfo {
                    piece_index: frame.get_u32() as PieceIndex,
                    offset: frame.get_u32(),
                    len: frame.get_u32(),
                })
            }
            id => Message::Unknown {
                id,
                payload: frame.to_vec(),
            },
        };

        Ok(Some(msg))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Message>> {
        match self.decode(buf)? {
            Some(msg) => Ok(Some(msg)),
            None if buf.is_empty() => Ok(None),
            // exactly the 4 byte prefix of a non-empty frame arrived: the
            // peer promised a body but not even the id byte is available
            None if buf.len() == 4 => Err(Error::MalformedFrame),
            None => Err(Error::ShortRead),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn test_handshake() -> Handshake {
        let mut peer_id = [0; 20];
        peer_id.copy_from_slice(b"-TRLY01-000000000001");
        Handshake::new([0x01; 20], peer_id)
    }

    fn encode_handshake(handshake: Handshake) -> BytesMut {
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_handshake_wire_layout() {
        let buf = encode_handshake(test_handshake());

        let mut expected = Vec::with_capacity(68);
        expected.push(19);
        expected.extend_from_slice(b"BitTorrent protocol");
        expected.extend_from_slice(&[0; 8]);
        expected.extend_from_slice(&[0x01; 20]);
        expected.extend_from_slice(b"-TRLY01-000000000001");

        assert_eq!(buf.len(), 68);
        assert_eq!(&buf[..], &expected[..]);
    }

    #[test]
    fn test_handshake_round_trip() {
        let mut buf = encode_handshake(test_handshake());
        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, test_handshake());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_handshake_reserved_bits_ignored() {
        let mut buf = encode_handshake(test_handshake());
        // the first reserved byte sits right after the protocol string
        buf[20] = 0xFF;
        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.reserved[0], 0xFF);
        assert_eq!(decoded.info_hash, [0x01; 20]);
    }

    #[test]
    fn test_handshake_rejects_wrong_protocol() {
        // a wrong protocol string length fails from the very first byte
        let mut buf = encode_handshake(test_handshake());
        buf[0] = 20;
        assert!(matches!(
            HandshakeCodec.decode(&mut buf),
            Err(Error::HandshakeProtocolMismatch)
        ));

        // flipping any protocol string byte fails too
        for pos in 1..20 {
            let mut buf = encode_handshake(test_handshake());
            buf[pos] ^= 0xFF;
            assert!(
                matches!(
                    HandshakeCodec.decode(&mut buf),
                    Err(Error::HandshakeProtocolMismatch)
                ),
                "byte {} should have caused a protocol mismatch",
                pos
            );
        }
    }

    #[test]
    fn test_handshake_incomplete() {
        let mut buf = encode_handshake(test_handshake());
        let mut partial = buf.split_to(40);
        assert!(HandshakeCodec.decode(&mut partial).unwrap().is_none());
        assert!(matches!(
            HandshakeCodec.decode_eof(&mut partial),
            Err(Error::ShortRead)
        ));
    }

    #[test]
    fn test_keep_alive_frame() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0, 0, 0, 0]);
        let msg = PeerCodec::default().decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg, Message::KeepAlive);
        // the stream ended cleanly after the frame
        assert!(PeerCodec::default().decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_short_read_mid_prefix() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0, 0]);
        assert!(PeerCodec::default().decode(&mut buf).unwrap().is_none());
        assert!(matches!(
            PeerCodec::default().decode_eof(&mut buf),
            Err(Error::ShortRead)
        ));
    }

    #[test]
    fn test_short_read_mid_body() {
        // length prefix of 5 with only the id byte delivered
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0, 0, 0, 5, 4]);
        assert!(PeerCodec::default().decode(&mut buf).unwrap().is_none());
        assert!(matches!(
            PeerCodec::default().decode_eof(&mut buf),
            Err(Error::ShortRead)
        ));
    }

    #[test]
    fn test_malformed_frame_without_id() {
        // a non-empty frame whose id byte never arrives
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0, 0, 0, 5]);
        assert!(PeerCodec::default().decode(&mut buf).unwrap().is_none());
        assert!(matches!(
            PeerCodec::default().decode_eof(&mut buf),
            Err(Error::MalformedFrame)
        ));
    }

    #[test]
    fn test_request_wire_layout() {
        let mut buf = BytesMut::new();
        PeerCodec::default()
            .encode(
                Message::Request(BlockInfo {
                    piece_index: 7,
                    offset: 32768,
                    len: 16384,
                }),
                &mut buf,
            )
            .unwrap();
        assert_eq!(
            &buf[..],
            &[
                0x00, 0x00, 0x00, 0x0D, // length 13
                0x06, // id
                0x00, 0x00, 0x00, 0x07, // index
                0x00, 0x00, 0x80, 0x00, // begin
                0x00, 0x00, 0x40, 0x00, // length
            ][..]
        );
    }

    #[test]
    fn test_frame_too_large() {
        let max = PeerCodec::default().max_frame_len;
        let mut buf = BytesMut::new();
        buf.put_u32(max as u32 + 1);
        buf.put_u8(MessageId::Bitfield as u8);
        assert!(matches!(
            PeerCodec::default().decode(&mut buf),
            Err(Error::FrameTooLarge(_))
        ));
        // the prefix itself must not have been consumed
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn test_malformed_have_payload() {
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_u8(MessageId::Have as u8);
        buf.extend_from_slice(&[0, 1]);
        assert!(matches!(
            PeerCodec::default().decode(&mut buf),
            Err(Error::MalformedFrame)
        ));
    }

    #[test]
    fn test_unknown_id_is_not_fatal() {
        let mut buf = BytesMut::new();
        buf.put_u32(4);
        buf.put_u8(42);
        buf.extend_from_slice(&[1, 2, 3]);
        let msg = PeerCodec::default().decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            msg,
            Message::Unknown {
                id: 42,
                payload: vec![1, 2, 3]
            }
        );
    }

    #[test]
    fn test_message_codec_identity() {
        let msgs = vec![
            Message::KeepAlive,
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have { piece_index: 42 },
            Message::Bitfield(Bitfield::from_vec(vec![0xF0, 0x00])),
            Message::Request(BlockInfo {
                piece_index: 1,
                offset: 16384,
                len: 16384,
            }),
            Message::Block {
                piece_index: 1,
                offset: 16384,
                data: vec![0xAB; 100],
            },
            Message::Cancel(BlockInfo {
                piece_index: 9,
                offset: 0,
                len: 16384,
            }),
        ];

        let mut codec = PeerCodec::default();
        for msg in msgs {
            let mut buf = BytesMut::new();
            codec.encode(msg.clone(), &mut buf).unwrap();
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, msg);
            assert!(buf.is_empty(), "frame must be fully consumed");
        }
    }

    #[test]
    fn test_frames_are_self_delimiting() {
        // several messages back to back in one buffer decode in order
        let mut codec = PeerCodec::default();
        let mut buf = BytesMut::new();
        let msgs = vec![
            Message::Unchoke,
            Message::Have { piece_index: 3 },
            Message::KeepAlive,
            Message::Block {
                piece_index: 3,
                offset: 0,
                data: vec![7; 16],
            },
        ];
        for msg in &msgs {
            codec.encode(msg.clone(), &mut buf).unwrap();
        }
        for msg in &msgs {
            assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), *msg);
        }
        assert!(buf.is_empty());
    }
}
