//! Conversions between channel payloads and real WebSocket frames.
//!
//! The frontend speaks axum's WebSocket types to clients, the outlet speaks
//! tungstenite to destinations. Close codes cross the channel verbatim, but
//! only some of them may be sent by an application on a real socket.

use axum::extract::ws as client_ws;
use portal_wire::{Payload, CLOSE_NORMAL};
use std::borrow::Cow;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as DestCloseFrame;
use tokio_tungstenite::tungstenite::Message as DestMessage;

/// A close code an application may put on a WebSocket: 1000 or the
/// 3000-4999 range. Anything else becomes 1000.
pub fn sendable_close_code(code: u16) -> u16 {
    match code {
        CLOSE_NORMAL | 3000..=4999 => code,
        _ => CLOSE_NORMAL,
    }
}

/// Longest close reason a close frame can carry.
pub const MAX_CLOSE_REASON: usize = 123;

/// Cut `reason` to fit a close frame, on a char boundary.
pub fn close_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

/// What a socket frame means to the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Data(Payload),
    Close { code: u16, reason: String },
    /// Ping, pong and other control frames.
    Ignore,
}

/// Interpret a frame from a frontend client.
pub fn from_client(msg: client_ws::Message) -> Inbound {
    match msg {
        client_ws::Message::Text(text) => Inbound::Data(Payload::Text(text.as_str().to_string())),
        client_ws::Message::Binary(bytes) => Inbound::Data(Payload::Binary(bytes)),
        client_ws::Message::Close(frame) => match frame {
            Some(frame) => Inbound::Close {
                code: frame.code,
                reason: frame.reason.as_str().to_string(),
            },
            None => Inbound::Close {
                code: CLOSE_NORMAL,
                reason: String::new(),
            },
        },
        client_ws::Message::Ping(_) | client_ws::Message::Pong(_) => Inbound::Ignore,
    }
}

/// Frame for a frontend client.
pub fn to_client(payload: Payload) -> client_ws::Message {
    match payload {
        Payload::Text(text) => client_ws::Message::Text(text.into()),
        Payload::Binary(bytes) => client_ws::Message::Binary(bytes),
    }
}

/// Close frame for a frontend client.
pub fn client_close(code: u16, reason: &str) -> client_ws::Message {
    client_ws::Message::Close(Some(client_ws::CloseFrame {
        code: sendable_close_code(code),
        reason: close_reason(reason).to_string().into(),
    }))
}

/// Interpret a frame from a destination socket.
pub fn from_destination(msg: DestMessage) -> Inbound {
    match msg {
        DestMessage::Text(text) => Inbound::Data(Payload::Text(text)),
        DestMessage::Binary(bytes) => Inbound::Data(Payload::Binary(bytes.into())),
        DestMessage::Close(frame) => match frame {
            Some(frame) => Inbound::Close {
                code: u16::from(frame.code),
                reason: frame.reason.into_owned(),
            },
            None => Inbound::Close {
                code: CLOSE_NORMAL,
                reason: String::new(),
            },
        },
        _ => Inbound::Ignore,
    }
}

/// Frame for a destination socket.
pub fn to_destination(payload: Payload) -> DestMessage {
    match payload {
        Payload::Text(text) => DestMessage::Text(text),
        Payload::Binary(bytes) => DestMessage::Binary(bytes.to_vec()),
    }
}

/// Close frame for a destination socket.
pub fn destination_close(code: u16, reason: &str) -> DestMessage {
    DestMessage::Close(Some(DestCloseFrame {
        code: CloseCode::from(sendable_close_code(code)),
        reason: Cow::Owned(close_reason(reason).to_string()),
    }))
}
