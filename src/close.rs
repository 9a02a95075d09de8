//! Close codes, close frame payloads and the final close information of a connection.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{Result, WebSocketError};

use self::CloseCode::*;

/// Maximum length in bytes of a close reason, so that code and reason fit in 125 bytes.
pub const MAX_CLOSE_REASON: usize = 123;

/// Status codes representing the reasons why an endpoint is closing the WebSocket connection.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum CloseCode {
    /// Normal closure, the purpose of the connection has been fulfilled.
    Normal,
    /// The endpoint is going away, such as a server shutting down.
    Away,
    /// The endpoint received a frame that violates the protocol.
    Protocol,
    /// The endpoint received a type of data it cannot accept.
    Unsupported,
    /// No status code was present in the close frame. Never sent on the wire.
    Status,
    /// The connection was closed without a closing handshake. Never sent on the wire.
    Abnormal,
    /// Message data was inconsistent with its type, like non-UTF-8 data in a text message.
    Invalid,
    /// Generic policy violation, also used for oversized frames.
    Policy,
    /// The message is too large to process.
    Size,
    /// The client expected an extension the server did not negotiate.
    Extension,
    /// Unexpected condition on the endpoint.
    Error,
    /// The server is restarting.
    Restart,
    /// The server is overloaded, try again later.
    Again,
    /// A gateway received an invalid response from upstream.
    Gateway,
    #[doc(hidden)]
    /// TLS handshake failure. Never sent on the wire.
    Tls,
    #[doc(hidden)]
    /// Codes reserved by RFC 6455 for future use.
    Reserved(u16),
    #[doc(hidden)]
    /// Codes registered with IANA (3000-3999).
    Iana(u16),
    #[doc(hidden)]
    /// Codes for private use by applications (4000-4999).
    Library(u16),
    #[doc(hidden)]
    /// Codes outside of every range defined by the protocol.
    Bad(u16),
}

impl CloseCode {
    /// Whether the code may be received in a close frame from the peer.
    ///
    /// Accepts 1000-1003, 1007-1013 and 3000-4999.
    pub fn is_allowed(self) -> bool {
        !matches!(self, Bad(_) | Reserved(_) | Status | Abnormal | Gateway | Tls)
    }

    /// Whether the application may initiate a close with this code: 1000 or 3000-4999.
    pub fn is_sendable(self) -> bool {
        matches!(self, Normal | Iana(_) | Library(_))
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> CloseCode {
        match code {
            1000 => Normal,
            1001 => Away,
            1002 => Protocol,
            1003 => Unsupported,
            1005 => Status,
            1006 => Abnormal,
            1007 => Invalid,
            1008 => Policy,
            1009 => Size,
            1010 => Extension,
            1011 => Error,
            1012 => Restart,
            1013 => Again,
            1014 => Gateway,
            1015 => Tls,
            1004 | 1016..=2999 => Reserved(code),
            3000..=3999 => Iana(code),
            4000..=4999 => Library(code),
            _ => Bad(code),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> u16 {
        match code {
            Normal => 1000,
            Away => 1001,
            Protocol => 1002,
            Unsupported => 1003,
            Status => 1005,
            Abnormal => 1006,
            Invalid => 1007,
            Policy => 1008,
            Size => 1009,
            Extension => 1010,
            Error => 1011,
            Restart => 1012,
            Again => 1013,
            Gateway => 1014,
            Tls => 1015,
            Reserved(code) | Iana(code) | Library(code) | Bad(code) => code,
        }
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", u16::from(*self))
    }
}

/// How a connection ended. Built once when the transport goes away.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CloseInfo {
    /// `true` when both close frames were exchanged before the transport closed.
    pub was_clean: bool,
    /// The close code: the peer's code for clean closes, 1006 otherwise.
    pub code: Option<u16>,
    /// The close reason: the peer's reason for clean closes, a description otherwise.
    pub reason: Option<String>,
    /// We sent the first close frame.
    pub closed_by_me: bool,
    /// We failed the connection because of a protocol or payload violation.
    pub failed_by_me: bool,
    /// We dropped the transport.
    pub dropped_by_me: bool,
}

/// Decoded payload of a received close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosePayload {
    pub code: Option<u16>,
    pub reason: Option<String>,
}

impl ClosePayload {
    /// Parses and validates a close frame payload received from the peer.
    ///
    /// An empty payload carries no code. Otherwise the first two bytes are the code, which
    /// must be accepted by [`CloseCode::is_allowed`], and the rest must be UTF-8.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        match payload.len() {
            0 => Ok(Self {
                code: None,
                reason: None,
            }),
            1 => Err(WebSocketError::InvalidCloseFrame),
            _ => {
                let code = u16::from_be_bytes([payload[0], payload[1]]);
                if !CloseCode::from(code).is_allowed() {
                    return Err(WebSocketError::CloseCodeNotAllowed(code));
                }

                let reason = if payload.len() > 2 {
                    let reason = std::str::from_utf8(&payload[2..])
                        .map_err(|_| WebSocketError::InvalidCloseReason)?;
                    Some(reason.to_owned())
                } else {
                    None
                };

                Ok(Self {
                    code: Some(code),
                    reason,
                })
            }
        }
    }
}

/// Encodes the payload of a close frame. The reason is only written with a code.
pub fn encode_close_payload(code: Option<u16>, reason: Option<&str>) -> Bytes {
    let Some(code) = code else {
        return Bytes::new();
    };

    let reason = reason.map(truncate_reason).unwrap_or_default();
    let mut payload = BytesMut::with_capacity(2 + reason.len());
    payload.put_u16(code);
    payload.extend_from_slice(reason.as_bytes());
    payload.freeze()
}

/// Cuts `reason` to at most [`MAX_CLOSE_REASON`] bytes on a character boundary.
pub fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason;
    }

    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}
