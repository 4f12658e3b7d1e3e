//! Channel control messages and their binary encoding.
//!
//! Everything that crosses the bus is a [`ChannelMessage`]. The encoding is a
//! fixed 19-byte header followed by a kind-dependent body:
//!
//! ```text
//! +------+----------+------------------+------------------------------+
//! | kind | seq (BE) | channel id (16)  | body                         |
//! +------+----------+------------------+------------------------------+
//! ```
//!
//! Data kinds (`OPEN`, `DATA_*`) carry a one-byte payload tag (1 = binary,
//! 0 = UTF-8 text) followed by the payload. Close kinds carry a big-endian
//! close code followed by a UTF-8 reason. All other kinds have no body.

use crate::error::WireError;
use bytes::Bytes;
use std::fmt;
use uuid::Uuid;

/// 128-bit channel identifier, generated by the initiator.
pub type ChannelId = Uuid;

/// Length of the fixed header: kind + sequence id + channel id.
pub const HEADER_LEN: usize = 19;

/// Payload tag for binary data.
const TAG_BINARY: u8 = 1;
/// Payload tag for UTF-8 text.
const TAG_TEXT: u8 = 0;

/// Default close code.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code used when the bus breaks underneath a channel.
pub const CLOSE_MEDIUM_BROKEN: u16 = 1001;
/// Close code used when an initiator never sees `CREATED`.
pub const CLOSE_ESTABLISH_TIMEOUT: u16 = 1002;

/// Message kinds.
///
/// Bit 7 separates low-level traffic (0) from sequenced channel traffic (1).
/// Bit 6 is the direction: 0 travels client to destination, 1 travels back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Ping = 0b0000_0000,

    Pong = 0b0100_0000,
    MediumBreak = 0b0100_0001,

    Open = 0b1000_0000,
    DataFromClient = 0b1000_0001,
    CloseFromClient = 0b1000_0010,
    CloseAckFromClient = 0b1000_0011,

    Created = 0b1100_0000,
    DataFromDest = 0b1100_0001,
    CloseAckFromDest = 0b1100_0010,
    CloseFromDest = 0b1100_0011,
}

impl MessageKind {
    /// Parse a kind byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        let kind = match byte {
            0x00 => Self::Ping,
            0x40 => Self::Pong,
            0x41 => Self::MediumBreak,
            0x80 => Self::Open,
            0x81 => Self::DataFromClient,
            0x82 => Self::CloseFromClient,
            0x83 => Self::CloseAckFromClient,
            0xC0 => Self::Created,
            0xC1 => Self::DataFromDest,
            0xC2 => Self::CloseAckFromDest,
            0xC3 => Self::CloseFromDest,
            _ => return None,
        };
        Some(kind)
    }

    /// The kind byte as it appears on the wire.
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Low-level kinds are not sequenced and belong to no channel.
    pub fn is_low_level(self) -> bool {
        self.as_byte() & 0x80 == 0
    }

    /// Kinds whose body is a tagged payload.
    pub fn carries_data(self) -> bool {
        matches!(self, Self::Open | Self::DataFromClient | Self::DataFromDest)
    }

    /// Kinds whose body is a close code and reason.
    pub fn carries_close(self) -> bool {
        matches!(self, Self::CloseFromClient | Self::CloseFromDest)
    }

    /// Wire name, used in logs.
    pub fn name(self) -> &'static str {
        match self {
            Self::Ping => "PING",
            Self::Pong => "PONG",
            Self::MediumBreak => "MEDIUM_BREAK",
            Self::Open => "OPEN",
            Self::DataFromClient => "DATA_FROM_CLIENT",
            Self::CloseFromClient => "CLOSE_FROM_CLIENT",
            Self::CloseAckFromClient => "CLOSE_ACK_FROM_CLIENT",
            Self::Created => "CREATED",
            Self::DataFromDest => "DATA_FROM_DEST",
            Self::CloseAckFromDest => "CLOSE_ACK_FROM_DEST",
            Self::CloseFromDest => "CLOSE_FROM_DEST",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Opaque channel data, either raw bytes or UTF-8 text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Binary(Bytes),
    Text(String),
}

impl Payload {
    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        match self {
            Self::Binary(bytes) => bytes.len(),
            Self::Text(text) => text.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Binary(Bytes::from(bytes))
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Self::Binary(bytes)
    }
}

/// Close code and reason carried by `CLOSE_*` messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    /// WebSocket-style close code, big-endian on the wire.
    pub code: u16,
    /// UTF-8 reason, possibly empty.
    pub reason: String,
}

/// Kind-dependent message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Empty,
    Data(Payload),
    Close(CloseFrame),
}

/// A channel control message (the protocol's wire unit).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    /// What the message does; decides how `body` is laid out.
    pub kind: MessageKind,
    /// Per-channel, per-direction sequence id. Always 0 for low-level kinds.
    pub sequence_id: u16,
    /// Owning channel. Low-level kinds carry the sender's instance id or nil.
    pub channel_id: ChannelId,
    /// Payload, close frame, or nothing, depending on `kind`.
    pub body: MessageBody,
}

impl ChannelMessage {
    /// Arbitration probe carrying the sender's instance id.
    pub fn ping(instance_id: Uuid) -> Self {
        Self::low_level(MessageKind::Ping, instance_id)
    }

    /// Arbitration reply carrying the responder's instance id.
    pub fn pong(instance_id: Uuid) -> Self {
        Self::low_level(MessageKind::Pong, instance_id)
    }

    /// Bus failure notice.
    pub fn medium_break() -> Self {
        Self::low_level(MessageKind::MediumBreak, Uuid::nil())
    }

    fn low_level(kind: MessageKind, id: Uuid) -> Self {
        Self {
            kind,
            sequence_id: 0,
            channel_id: id,
            body: MessageBody::Empty,
        }
    }

    pub fn is_low_level(&self) -> bool {
        self.kind.is_low_level()
    }

    /// The data payload, for data kinds.
    pub fn payload(&self) -> Option<&Payload> {
        match &self.body {
            MessageBody::Data(payload) => Some(payload),
            _ => None,
        }
    }

    /// The close frame, for close kinds.
    pub fn close_frame(&self) -> Option<&CloseFrame> {
        match &self.body {
            MessageBody::Close(frame) => Some(frame),
            _ => None,
        }
    }

    /// Bytes charged against the outbound rate limit.
    ///
    /// Approximate on purpose: only `DATA_*` payloads count, headers and
    /// control traffic are free.
    pub fn effective_len(&self) -> usize {
        match self.kind {
            MessageKind::DataFromClient | MessageKind::DataFromDest => {
                self.payload().map(Payload::len).unwrap_or(0)
            }
            _ => 0,
        }
    }
}

impl fmt::Display for ChannelMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = self.channel_id.simple().to_string();
        write!(f, "{} #{} {}", &short[..8], self.sequence_id, self.kind)?;
        match &self.body {
            MessageBody::Data(Payload::Text(text)) if text.len() < 80 => {
                write!(f, " text({}): {}", text.len(), text)
            }
            MessageBody::Data(Payload::Text(text)) => write!(f, " text({})", text.len()),
            MessageBody::Data(Payload::Binary(bytes)) => write!(f, " binary({})", bytes.len()),
            MessageBody::Close(frame) => write!(f, " {} {:?}", frame.code, frame.reason),
            MessageBody::Empty => Ok(()),
        }
    }
}

/// Encode a message into its wire representation.
pub fn encode_message(msg: &ChannelMessage) -> Vec<u8> {
    let body_len = match &msg.body {
        MessageBody::Data(payload) => 1 + payload.len(),
        MessageBody::Close(frame) => 2 + frame.reason.len(),
        MessageBody::Empty => 0,
    };

    let mut bytes = Vec::with_capacity(HEADER_LEN + body_len);
    bytes.push(msg.kind.as_byte());
    bytes.extend_from_slice(&msg.sequence_id.to_be_bytes());
    bytes.extend_from_slice(msg.channel_id.as_bytes());

    if msg.kind.carries_data() {
        match &msg.body {
            MessageBody::Data(Payload::Binary(data)) => {
                bytes.push(TAG_BINARY);
                bytes.extend_from_slice(data);
            }
            MessageBody::Data(Payload::Text(text)) => {
                bytes.push(TAG_TEXT);
                bytes.extend_from_slice(text.as_bytes());
            }
            // A data kind always has a tag byte, even without a payload.
            _ => bytes.push(TAG_TEXT),
        }
    } else if msg.kind.carries_close() {
        let (code, reason) = match &msg.body {
            MessageBody::Close(frame) => (frame.code, frame.reason.as_str()),
            _ => (CLOSE_NORMAL, ""),
        };
        bytes.extend_from_slice(&code.to_be_bytes());
        bytes.extend_from_slice(reason.as_bytes());
    }

    bytes
}

/// Decode a message from its wire representation.
pub fn decode_message(buf: &[u8]) -> Result<ChannelMessage, WireError> {
    if buf.len() < HEADER_LEN {
        return Err(WireError::MalformedMessage(format!(
            "frame of {} bytes is shorter than the {HEADER_LEN}-byte header",
            buf.len()
        )));
    }

    let kind = MessageKind::from_byte(buf[0]).ok_or_else(|| {
        WireError::MalformedMessage(format!("unknown message kind 0x{:02x}", buf[0]))
    })?;
    let sequence_id = u16::from_be_bytes([buf[1], buf[2]]);
    let mut id = [0u8; 16];
    id.copy_from_slice(&buf[3..HEADER_LEN]);
    let channel_id = Uuid::from_bytes(id);
    let rest = &buf[HEADER_LEN..];

    let body = if kind.carries_data() {
        let (&tag, data) = rest.split_first().ok_or_else(|| {
            WireError::MalformedMessage(format!("{kind} without payload tag"))
        })?;
        if tag != TAG_TEXT {
            MessageBody::Data(Payload::Binary(Bytes::copy_from_slice(data)))
        } else {
            MessageBody::Data(Payload::Text(utf8(data, kind)?))
        }
    } else if kind.carries_close() {
        if rest.len() < 2 {
            return Err(WireError::MalformedMessage(format!(
                "{kind} without close code"
            )));
        }
        MessageBody::Close(CloseFrame {
            code: u16::from_be_bytes([rest[0], rest[1]]),
            reason: utf8(&rest[2..], kind)?,
        })
    } else {
        MessageBody::Empty
    };

    Ok(ChannelMessage {
        kind,
        sequence_id,
        channel_id,
        body,
    })
}

fn utf8(bytes: &[u8], kind: MessageKind) -> Result<String, WireError> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| WireError::MalformedMessage(format!("{kind} carries invalid UTF-8: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sequenced(kind: MessageKind, seq: u16, body: MessageBody) -> ChannelMessage {
        ChannelMessage {
            kind,
            sequence_id: seq,
            channel_id: Uuid::new_v4(),
            body,
        }
    }

    #[test]
    fn test_header_layout() {
        let id = Uuid::parse_str("01234567-89ab-cdef-0123-456789abcdef").unwrap();
        let msg = ChannelMessage {
            kind: MessageKind::CloseAckFromDest,
            sequence_id: 0x0102,
            channel_id: id,
            body: MessageBody::Empty,
        };
        let bytes = encode_message(&msg);
        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(bytes[0], 0xC2);
        assert_eq!(&bytes[1..3], &[0x01, 0x02]);
        assert_eq!(&bytes[3..19], id.as_bytes());
    }

    #[test]
    fn test_data_layout() {
        let msg = sequenced(
            MessageKind::DataFromClient,
            7,
            MessageBody::Data(Payload::Binary(Bytes::from_static(&[9, 8, 7]))),
        );
        let bytes = encode_message(&msg);
        assert_eq!(bytes[19], 1);
        assert_eq!(&bytes[20..], &[9, 8, 7]);

        let text = sequenced(
            MessageKind::Open,
            0,
            MessageBody::Data(Payload::Text("ws://dest".to_string())),
        );
        let bytes = encode_message(&text);
        assert_eq!(bytes[19], 0);
        assert_eq!(&bytes[20..], b"ws://dest");
    }

    #[test]
    fn test_close_layout() {
        let msg = sequenced(
            MessageKind::CloseFromDest,
            3,
            MessageBody::Close(CloseFrame {
                code: 4001,
                reason: "bye".to_string(),
            }),
        );
        let bytes = encode_message(&msg);
        assert_eq!(&bytes[19..21], &4001u16.to_be_bytes());
        assert_eq!(&bytes[21..], b"bye");
    }

    #[test]
    fn test_roundtrip_every_kind() {
        let messages = vec![
            ChannelMessage::ping(Uuid::new_v4()),
            ChannelMessage::pong(Uuid::new_v4()),
            ChannelMessage::medium_break(),
            sequenced(
                MessageKind::Open,
                0,
                MessageBody::Data(Payload::Text("ws://example.com/chat".into())),
            ),
            sequenced(
                MessageKind::DataFromClient,
                1,
                MessageBody::Data(Payload::Binary(Bytes::from_static(b"\x00\xffraw"))),
            ),
            sequenced(
                MessageKind::DataFromDest,
                65535,
                MessageBody::Data(Payload::Text("héllo wörld".into())),
            ),
            sequenced(
                MessageKind::CloseFromClient,
                2,
                MessageBody::Close(CloseFrame {
                    code: 1000,
                    reason: "bye".into(),
                }),
            ),
            sequenced(
                MessageKind::CloseFromDest,
                9,
                MessageBody::Close(CloseFrame {
                    code: 4999,
                    reason: String::new(),
                }),
            ),
            sequenced(MessageKind::CloseAckFromClient, 4, MessageBody::Empty),
            sequenced(MessageKind::CloseAckFromDest, 5, MessageBody::Empty),
            sequenced(MessageKind::Created, 0, MessageBody::Empty),
        ];

        for msg in messages {
            let decoded = decode_message(&encode_message(&msg)).unwrap();
            assert_eq!(decoded, msg, "roundtrip failed for {}", msg.kind);
        }
    }

    #[test]
    fn test_empty_payloads_roundtrip() {
        let binary = sequenced(
            MessageKind::DataFromDest,
            3,
            MessageBody::Data(Payload::Binary(Bytes::new())),
        );
        assert_eq!(decode_message(&encode_message(&binary)).unwrap(), binary);

        let text = sequenced(
            MessageKind::DataFromClient,
            3,
            MessageBody::Data(Payload::Text(String::new())),
        );
        assert_eq!(decode_message(&encode_message(&text)).unwrap(), text);
    }

    #[test]
    fn test_truncated_header_rejected() {
        let err = decode_message(&[0x80; 18]).unwrap_err();
        assert!(matches!(err, WireError::MalformedMessage(_)));
        assert!(decode_message(&[]).is_err());
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let mut bytes = vec![0u8; HEADER_LEN];
        bytes[0] = 0x7f;
        let err = decode_message(&bytes).unwrap_err();
        assert!(err.to_string().contains("0x7f"));
    }

    #[test]
    fn test_missing_bodies_rejected() {
        let mut data = vec![0u8; HEADER_LEN];
        data[0] = MessageKind::DataFromClient.as_byte();
        assert!(decode_message(&data).is_err());

        let mut close = vec![0u8; HEADER_LEN + 1];
        close[0] = MessageKind::CloseFromClient.as_byte();
        assert!(decode_message(&close).is_err());
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let mut bytes = vec![0u8; HEADER_LEN];
        bytes[0] = MessageKind::DataFromDest.as_byte();
        bytes.push(TAG_TEXT);
        bytes.extend_from_slice(&[0xff, 0xfe]);
        assert!(matches!(
            decode_message(&bytes),
            Err(WireError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_nonzero_tag_is_binary() {
        let mut bytes = vec![0u8; HEADER_LEN];
        bytes[0] = MessageKind::DataFromDest.as_byte();
        bytes.push(7);
        bytes.extend_from_slice(b"abc");
        let msg = decode_message(&bytes).unwrap();
        assert_eq!(msg.payload(), Some(&Payload::Binary(Bytes::from_static(b"abc"))));
    }

    #[test]
    fn test_kind_classes() {
        assert!(MessageKind::Ping.is_low_level());
        assert!(MessageKind::MediumBreak.is_low_level());
        assert!(!MessageKind::Open.is_low_level());
        assert!(MessageKind::Open.carries_data());
        assert!(MessageKind::CloseFromDest.carries_close());
        assert!(!MessageKind::CloseAckFromDest.carries_close());
        for byte in 0..=255u8 {
            if let Some(kind) = MessageKind::from_byte(byte) {
                assert_eq!(kind.as_byte(), byte);
            }
        }
    }

    #[test]
    fn test_effective_len() {
        let data = sequenced(
            MessageKind::DataFromClient,
            0,
            MessageBody::Data(Payload::Text("12345".into())),
        );
        assert_eq!(data.effective_len(), 5);

        let open = sequenced(
            MessageKind::Open,
            0,
            MessageBody::Data(Payload::Text("ws://dest".into())),
        );
        assert_eq!(open.effective_len(), 0);
        assert_eq!(ChannelMessage::ping(Uuid::new_v4()).effective_len(), 0);
    }
}
