//! # Relay Frames
//!
//! The unit of data that crosses a session bridge. A frame is either a text or a
//! binary WebSocket message and is forwarded byte-for-byte; the relay never looks
//! inside it. Control frames (ping, pong, close) belong to a single hop and are
//! never relayed.
//!
//! ## Conversions:
//! - **Browser side**: `actix_web_actors::ws::Message` → [`Frame`]
//! - **Upstream side**: [`Frame`] ↔ `tokio_tungstenite::tungstenite::Message`

use actix_web::web::Bytes;
use actix_web_actors::ws;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

/// Largest close reason a WebSocket close frame can carry (125 byte payload minus the code).
pub const MAX_CLOSE_REASON_BYTES: usize = 123;

/// A data message relayed unmodified between the browser and upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Extract the data frame from a browser message, if it is one.
    pub fn from_browser(msg: ws::Message) -> Option<Frame> {
        match msg {
            ws::Message::Text(text) => Some(Frame::Text(text.to_string())),
            ws::Message::Binary(data) => Some(Frame::Binary(data)),
            _ => None,
        }
    }

    /// Extract the data frame from an upstream message, if it is one.
    pub fn from_upstream(msg: Message) -> Option<Frame> {
        match msg {
            Message::Text(text) => Some(Frame::Text(text)),
            Message::Binary(data) => Some(Frame::Binary(Bytes::from(data))),
            _ => None,
        }
    }

    /// Payload as UTF-8 text. Binary frames that hold valid UTF-8 (the live API
    /// sends its JSON that way) are returned as well.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Frame::Text(text) => Some(text),
            Frame::Binary(data) => std::str::from_utf8(data).ok(),
        }
    }
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(data) => Message::Binary(data.to_vec()),
        }
    }
}

/// How the browser is told that its session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseNotice {
    pub code: u16,
    pub reason: String,
}

impl CloseNotice {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const POLICY: u16 = 1008;
    pub const INTERNAL_ERROR: u16 = 1011;
    pub const TRY_AGAIN_LATER: u16 = 1013;

    /// Build a notice, truncating the reason to what a close frame can carry.
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        let mut reason = reason.into();
        if reason.len() > MAX_CLOSE_REASON_BYTES {
            let mut cut = MAX_CLOSE_REASON_BYTES;
            while !reason.is_char_boundary(cut) {
                cut -= 1;
            }
            reason.truncate(cut);
        }
        Self { code, reason }
    }

    pub fn normal(reason: impl Into<String>) -> Self {
        Self::new(Self::NORMAL, reason)
    }

    /// Mirror an upstream close frame. Codes that must never appear on the wire
    /// (1005, 1006, 1015) are reported as "going away".
    pub fn from_upstream(frame: Option<CloseFrame<'_>>) -> Self {
        match frame {
            Some(frame) => {
                let code = match u16::from(frame.code) {
                    1005 | 1006 | 1015 => Self::GOING_AWAY,
                    code => code,
                };
                Self::new(code, frame.reason.into_owned())
            }
            None => Self::normal("upstream closed"),
        }
    }

    pub fn into_browser_reason(self) -> ws::CloseReason {
        ws::CloseReason {
            code: ws::CloseCode::from(self.code),
            description: if self.reason.is_empty() { None } else { Some(self.reason) },
        }
    }
}

/// Close frame sent upstream when the browser goes away.
pub fn browser_gone_frame() -> CloseFrame<'static> {
    CloseFrame {
        code: CloseCode::Normal,
        reason: "browser disconnected".into(),
    }
}
