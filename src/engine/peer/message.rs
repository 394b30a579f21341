use std::collections::HashSet;
use std::fmt::Display;

use bytes::*;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{PayloadError, PeerError};

pub const HANDSHAKE_HEADER: [u8; 18] = *b"P2PFILESHARINGPROJ";
pub const HANDSHAKE_LEN: usize = 32;

/// Encodes our handshake: header, 10 zero bytes, then our id (big-endian).
pub fn encode_handshake(peer_id: u32) -> [u8; HANDSHAKE_LEN] {
    let mut handshake = [0; HANDSHAKE_LEN];

    handshake[..18].copy_from_slice(&HANDSHAKE_HEADER);
    handshake[28..].copy_from_slice(&peer_id.to_be_bytes());

    handshake
}

/// Splits a handshake into its header and sender id. Doesn't check anything,
/// see `validate_handshake` for that.
pub fn decode_handshake(data: &[u8; HANDSHAKE_LEN]) -> ([u8; 18], u32) {
    let mut header = [0; 18];
    header.copy_from_slice(&data[..18]);

    let mut id = &data[28..];
    (header, id.get_u32())
}

pub fn validate_handshake(data: &[u8], expected_ids: &HashSet<u32>) -> Result<u32, PeerError> {
    let data: &[u8; HANDSHAKE_LEN] = data.try_into().map_err(|_| PeerError::InvalidHandshake)?;
    let (header, id) = decode_handshake(data);

    if header == HANDSHAKE_HEADER && expected_ids.contains(&id) {
        Ok(id)
    }
    else {
        Err(PeerError::InvalidHandshake)
    }
}

/// Numeric type codes. These are fixed by the wire protocol.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum MessageKind {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
}

impl TryFrom<u8> for MessageKind {
    type Error = PeerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageKind::Choke),
            1 => Ok(MessageKind::Unchoke),
            2 => Ok(MessageKind::Interested),
            3 => Ok(MessageKind::NotInterested),
            4 => Ok(MessageKind::Have),
            5 => Ok(MessageKind::Bitfield),
            6 => Ok(MessageKind::Request),
            7 => Ok(MessageKind::Piece),
            _ => Err(PeerError::UnknownMessageType(value)),
        }
    }
}

impl Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::Choke => write!(f, "Choke"),
            MessageKind::Unchoke => write!(f, "Unchoke"),
            MessageKind::Interested => write!(f, "Interested"),
            MessageKind::NotInterested => write!(f, "Not Interested"),
            MessageKind::Have => write!(f, "Have"),
            MessageKind::Bitfield => write!(f, "Bitfield"),
            MessageKind::Request => write!(f, "Request"),
            MessageKind::Piece => write!(f, "Piece"),
        }
    }
}

/// A length-prefixed frame as it sits on the wire. `length` counts the type
/// byte plus the payload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    pub length: u32,
    pub kind: MessageKind,
    pub payload: Bytes,
}

pub fn encode_message(kind: MessageKind, payload: &[u8]) -> Bytes {
    let mut message = BytesMut::with_capacity(5 + payload.len());

    message.put_u32((payload.len() + 1) as u32);
    message.put_u8(kind as u8);
    message.put_slice(payload);

    message.freeze()
}

/// Reads one frame. A zero length, an unknown type or a frame longer than
/// `max_len` is malformed, and a stream that ends early is a closed
/// connection.
pub async fn decode_message<R: AsyncRead + Unpin>(reader: &mut R, max_len: u32) -> Result<Frame, PeerError> {
    let length = reader.read_u32().await.map_err(eof_as_closed)?;

    if length == 0 {
        return Err(PeerError::MalformedFrame("zero length".into()));
    }

    if length > max_len {
        return Err(PeerError::MalformedFrame(format!("length {length} exceeds {max_len}")));
    }

    let kind = MessageKind::try_from(reader.read_u8().await.map_err(eof_as_closed)?)?;
    let mut payload = vec![0; length as usize - 1];
    reader.read_exact(&mut payload).await.map_err(eof_as_closed)?;

    Ok(Frame { length, kind, payload: payload.into() })
}

fn eof_as_closed(e: std::io::Error) -> PeerError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        PeerError::ConnectionClosed
    }
    else {
        PeerError::Io(e)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Message {
    Choke,
    Unchoke,
    Interested,
    NotInterested,

    Have { piece: u32 },
    /// Raw packed bits. Turned into a `PieceSet` by the receiver, which
    /// knows the piece count.
    Bitfield { bitfield: Bytes },
    Request { piece: u32 },
    Piece { piece: u32, data: Bytes },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Choke => MessageKind::Choke,
            Message::Unchoke => MessageKind::Unchoke,
            Message::Interested => MessageKind::Interested,
            Message::NotInterested => MessageKind::NotInterested,
            Message::Have { .. } => MessageKind::Have,
            Message::Bitfield { .. } => MessageKind::Bitfield,
            Message::Request { .. } => MessageKind::Request,
            Message::Piece { .. } => MessageKind::Piece,
        }
    }

    /// Piece index carried by HAVE, REQUEST and PIECE.
    pub fn piece_index(&self) -> Option<u32> {
        match self {
            Message::Have { piece } | Message::Request { piece } | Message::Piece { piece, .. } => Some(*piece),
            _ => None,
        }
    }
}

impl TryFrom<Frame> for Message {
    type Error = PayloadError;

    fn try_from(frame: Frame) -> Result<Self, Self::Error> {
        let mut data = frame.payload;

        let message = match frame.kind {
            MessageKind::Choke => Message::Choke,
            MessageKind::Unchoke => Message::Unchoke,
            MessageKind::Interested => Message::Interested,
            MessageKind::NotInterested => Message::NotInterested,
            MessageKind::Have => Message::Have { piece: index_payload("Have", &data)? },
            MessageKind::Bitfield => Message::Bitfield { bitfield: data },
            MessageKind::Request => Message::Request { piece: index_payload("Request", &data)? },
            MessageKind::Piece => {
                if data.len() < 4 {
                    return Err(PayloadError::BadLength { kind: "Piece", expected: 4, actual: data.len() });
                }

                let piece = data.get_u32();
                Message::Piece { piece, data }
            }
        };

        Ok(message)
    }
}

fn index_payload(kind: &'static str, mut data: &[u8]) -> Result<u32, PayloadError> {
    if data.len() != 4 {
        return Err(PayloadError::BadLength { kind, expected: 4, actual: data.len() });
    }

    Ok(data.get_u32())
}

impl From<&Message> for Bytes {
    fn from(msg: &Message) -> Bytes {
        match msg {
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => encode_message(msg.kind(), &[]),

            Message::Have { piece } | Message::Request { piece } => encode_message(msg.kind(), &piece.to_be_bytes()),
            Message::Bitfield { bitfield } => encode_message(MessageKind::Bitfield, bitfield),
            Message::Piece { piece, data } => {
                let mut payload = BytesMut::with_capacity(4 + data.len());
                payload.put_u32(*piece);
                payload.put_slice(data);

                encode_message(MessageKind::Piece, &payload)
            }
        }
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.piece_index() {
            Some(piece) => write!(f, "{} ({piece})", self.kind()),
            None => write!(f, "{}", self.kind()),
        }
    }
}
