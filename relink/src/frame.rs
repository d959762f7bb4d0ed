//! Relink wire messages and the codec that frames them.
//!
//! Every message starts with a one-byte kind tag followed by a zig-zag
//! encoded signed varint:
//!
//! ```text
//! +-------+------------------+--- rest of frame ---+
//! | kind  |  varint seqno /  |  payload (CHUNK     |
//! | (1B)  |  nackd (1..10B)  |  only)              |
//! +-------+------------------+---------------------+
//! ```
//!
//! The substrate delimits frames, so a chunk's payload is simply whatever
//! follows the varint.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{RelinkError, Result};

/// Position of a chunk in one direction of the logical stream, starting at 0.
pub type SeqNo = u64;

/// Longest encoding of a 64-bit varint.
pub const MAX_VARINT_LEN: usize = 10;

/// Message kind identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Chunk = 0x00,
    Sync = 0x01,
    Ack = 0x02,
}

impl TryFrom<u8> for MessageKind {
    type Error = RelinkError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(MessageKind::Chunk),
            0x01 => Ok(MessageKind::Sync),
            0x02 => Ok(MessageKind::Ack),
            other => Err(RelinkError::UnknownMessageKind(other)),
        }
    }
}

/// A message exchanged between the two ends of a logical connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// One unit of sequenced application data.
    Chunk { seqno: SeqNo, payload: Bytes },
    /// The peer accepted everything below `nackd`.
    Ack { nackd: SeqNo },
    /// The peer wants everything from `nackd` onwards resent.
    Sync { nackd: SeqNo },
}

impl Message {
    /// Return the kind discriminant.
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Chunk { .. } => MessageKind::Chunk,
            Message::Ack { .. } => MessageKind::Ack,
            Message::Sync { .. } => MessageKind::Sync,
        }
    }

    /// Encode this message into a fresh buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Encode into a pre-allocated `BytesMut`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind() as u8);
        match self {
            Message::Chunk { seqno, payload } => {
                put_varint(buf, *seqno as i64);
                buf.put_slice(payload);
            }
            Message::Ack { nackd } | Message::Sync { nackd } => {
                put_varint(buf, *nackd as i64);
            }
        }
    }

    /// Upper bound on the number of bytes `encode` produces.
    pub fn encoded_len(&self) -> usize {
        1 + MAX_VARINT_LEN
            + match self {
                Message::Chunk { payload, .. } => payload.len(),
                Message::Ack { .. } | Message::Sync { .. } => 0,
            }
    }

    /// Decode one message from a complete frame.
    pub fn decode(mut raw: Bytes) -> Result<Self> {
        if raw.is_empty() {
            return Err(RelinkError::TruncatedMessage {
                expected: 1,
                actual: 0,
            });
        }
        let kind = MessageKind::try_from(raw.get_u8())?;
        let value = get_varint(&mut raw)?;
        if value < 0 {
            return Err(RelinkError::Decode(format!(
                "negative sequence number {value}"
            )));
        }
        let value = value as SeqNo;

        match kind {
            MessageKind::Chunk => Ok(Message::Chunk {
                seqno: value,
                payload: raw,
            }),
            MessageKind::Ack | MessageKind::Sync if !raw.is_empty() => Err(RelinkError::Decode(
                format!("{} trailing bytes after {kind:?}", raw.len()),
            )),
            MessageKind::Ack => Ok(Message::Ack { nackd: value }),
            MessageKind::Sync => Ok(Message::Sync { nackd: value }),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Chunk { seqno, payload } => {
                write!(f, "Chunk(seqno={seqno}, len={})", payload.len())
            }
            Message::Ack { nackd } => write!(f, "Ack(nackd={nackd})"),
            Message::Sync { nackd } => write!(f, "Sync(nackd={nackd})"),
        }
    }
}

fn put_varint(buf: &mut BytesMut, v: i64) {
    let mut u = ((v << 1) ^ (v >> 63)) as u64;
    while u >= 0x80 {
        buf.put_u8((u as u8) | 0x80);
        u >>= 7;
    }
    buf.put_u8(u as u8);
}

fn get_varint(raw: &mut Bytes) -> Result<i64> {
    let mut u: u64 = 0;
    let mut shift = 0u32;
    for i in 0..MAX_VARINT_LEN {
        if !raw.has_remaining() {
            return Err(RelinkError::TruncatedMessage {
                expected: i + 2,
                actual: i + 1,
            });
        }
        let b = raw.get_u8();
        if i == MAX_VARINT_LEN - 1 && b > 1 {
            return Err(RelinkError::Decode("varint overflows 64 bits".into()));
        }
        u |= u64::from(b & 0x7f) << shift;
        if b < 0x80 {
            return Ok(((u >> 1) as i64) ^ -((u & 1) as i64));
        }
        shift += 7;
    }
    Err(RelinkError::Decode("varint overflows 64 bits".into()))
}

/// Turns messages into frames and back. Swappable per connection.
pub trait Codec: Send + Sync + 'static {
    fn encode(&self, msg: &Message) -> Bytes;
    fn decode(&self, raw: Bytes) -> Result<Message>;
}

/// The default codec: the layout described at the top of this module.
#[derive(Debug, Clone, Copy, Default)]
pub struct WireCodec;

impl Codec for WireCodec {
    fn encode(&self, msg: &Message) -> Bytes {
        msg.encode()
    }

    fn decode(&self, raw: Bytes) -> Result<Message> {
        Message::decode(raw)
    }
}
