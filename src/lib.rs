//! # wsengine
//! A sans-io implementation of the WebSocket protocol (RFC 6455) and permessage-deflate
//! compression (RFC 7692), driven by a single-threaded reactor.
//!
//! The engine turns a byte-oriented duplex transport into message-oriented send/receive
//! semantics. It handles frame parsing and validation, masking, fragmentation, per-message
//! compression, size limits, keepalive pings and the closing handshake. Sockets and timers
//! are not owned by the engine: they are reached through the [`Transport`] and [`Reactor`]
//! traits, and the reactor calls back into the engine when bytes arrive, when a timer fires
//! or when the transport goes away.
//!
//! The HTTP opening handshake is not parsed here. Whatever performs it produces a
//! [`ConnectionRequest`] (server side) or a [`ConnectionResponse`] (client side), and the
//! helpers in [`handshake`] negotiate permessage-deflate from the extension headers.
//!
//! # Features
//! - `native` (default): a Tokio driver ([`native`]) that runs an engine over any
//!   `AsyncRead + AsyncWrite` stream.
//! - `zlib`: window size control (`client_max_window_bits` / `server_max_window_bits`)
//!   through the zlib backend of `flate2`.
//! - `simd`: SIMD accelerated UTF-8 validation through `simdutf8`.
//! - `json`: JSON helpers on [`Message`] and [`Connection`], and `serde` support for
//!   [`TrafficStats`].
//!
//! # Example
//! ```rust,no_run
//! use wsengine::{Connection, Handler, Message};
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn on_message(&mut self, conn: &mut Connection, message: Message) {
//!         let _ = conn.send_message(message.payload, message.is_binary);
//!     }
//! }
//! ```
//!
//! # Memory Safety
//! - Maximum frame and message payload sizes (default 1 MiB and 2 MiB)
//! - Decompressed size is bounded by the message limit
//! - UTF-8 validation of text messages, incrementally across frames
//! - Any protocol violation stops the processing of further inbound data

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod close;
pub mod codec;
pub mod compression;
pub mod engine;
pub mod extensions;
pub mod frame;
pub mod handshake;
pub mod mask;
pub mod message;
pub mod options;
pub mod protocol;
pub mod scheduler;
pub mod stats;
pub mod transport;
pub mod utf8;

#[cfg(feature = "native")]
#[cfg_attr(docsrs, doc(cfg(feature = "native")))]
pub mod native;

use thiserror::Error;

pub use close::{CloseCode, CloseInfo};
pub use compression::{PerMessageCompress, PerMessageDeflate, PerMessageDeflateParams};
pub use engine::{Factory, Handler, HandlerFactory, WebSocketEngine};
pub use extensions::ExtensionRegistry;
pub use frame::{FrameHeader, OpCode, PreparedMessage};
pub use handshake::{ConnectionRequest, ConnectionResponse, Handshake};
pub use message::Message;
pub use options::{Options, Role};
pub use protocol::{Connection, ConnectionState, Inbound, RawFrame, SendOptions};
pub use stats::TrafficStats;
pub use transport::{Reactor, TimerHandle, TimerKind, TimerToken, Transport};

/// A result type for WebSocket operations, using `WebSocketError` as the error type.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Represents errors that can occur while running a WebSocket connection.
///
/// The variants fall in three groups:
///
/// - Violations committed by the peer (invalid frames, bad close codes, oversized or
///   malformed payloads). These fail the connection with the code returned by
///   [`WebSocketError::close_code`] and only reach the application through
///   [`Handler::on_close`].
/// - Misuse of the API by the caller (sending on a closed connection, invalid close
///   codes, oversized control payloads, invalid options). These are returned synchronously.
/// - I/O, compression and serialization failures.
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// RSV bits set that no negotiated extension owns.
    #[error("Reserved bits are not zero")]
    ReservedBitsNotZero,

    /// RSV1 set on a frame while no compression was negotiated.
    #[error("Received compressed frame on stream that doesn't support compression")]
    CompressionNotSupported,

    /// RSV1 set on a control frame.
    #[error("Control frame must not be compressed")]
    CompressedControlFrame,

    /// RSV1 set on a continuation frame. Only the first frame of a message carries it.
    #[error("Continuation frame must not carry the compression bit")]
    CompressedContinuationFrame,

    /// A server received a frame from the client without a masking key.
    #[error("Received unmasked frame from client")]
    UnmaskedFrame,

    /// A client received a masked frame from the server.
    #[error("Received masked frame from server")]
    MaskedFrame,

    /// A control frame arrived with FIN cleared.
    #[error("Control frame must not be fragmented")]
    ControlFrameFragmented,

    /// A control frame declared a payload longer than 125 bytes.
    #[error("Control frame payload of {0} bytes exceeds 125")]
    ControlFrameTooLarge(u64),

    /// The opcode is reserved or otherwise unknown.
    #[error("Invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// A close frame with a payload of exactly one byte.
    #[error("Invalid close frame")]
    InvalidCloseFrame,

    /// A continuation frame arrived while no message was in progress.
    #[error("Invalid continuation frame")]
    InvalidContinuationFrame,

    /// A new data message started while the previous one was still in progress.
    #[error("Invalid fragment")]
    InvalidFragment,

    /// The payload length was not encoded with the minimal number of bytes.
    #[error("Payload length is not minimally encoded")]
    NonMinimalLength,

    /// The 64-bit payload length has its most significant bit set.
    #[error("Payload length exceeds 2^63-1")]
    PayloadLengthOverflow,

    /// The peer sent a close code that must not appear on the wire.
    #[error("Close code {0} is not allowed")]
    CloseCodeNotAllowed(u16),

    /// Invalid UTF-8 in a text message; `offset` is the index of the failing octet
    /// within the message.
    #[error("Invalid UTF-8 at octet {offset}")]
    InvalidUTF8 { offset: usize },

    /// The reason of a close frame is not valid UTF-8.
    #[error("Close reason is not valid UTF-8")]
    InvalidCloseReason,

    /// The compressed payload could not be inflated.
    #[error("Decompression failed: {0}")]
    InflateFailed(String),

    /// A frame payload exceeded the configured frame limit.
    #[error("Frame exceeds the payload limit of {limit} bytes")]
    FrameTooLarge { limit: usize },

    /// A message exceeded the configured message limit.
    #[error("Message exceeds the payload limit of {limit} bytes")]
    MessageTooLarge { limit: usize },

    /// The caller asked to send a close code other than 1000 or 3000-4999.
    #[error("Invalid close code: {0}")]
    InvalidCloseCode(u16),

    /// The caller asked to send a close reason without a close code.
    #[error("Close reason requires a close code")]
    CloseReasonWithoutCode,

    /// Ping and pong payloads are limited to 125 bytes.
    #[error("Control frame payload of {0} bytes exceeds 125")]
    ControlPayloadTooLarge(usize),

    /// Fragment and chop sizes must be greater than zero.
    #[error("Fragment size must be greater than zero")]
    InvalidFragmentSize,

    /// The connection is not open.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// A configuration value is out of range.
    #[error("Invalid option: {0}")]
    InvalidOption(String),

    /// An extension header could not be parsed or negotiated.
    #[error("Invalid extension: {0}")]
    InvalidExtension(String),

    /// The origin of the opening handshake is not in the allowed list.
    #[error("Origin not allowed: {0}")]
    OriginNotAllowed(String),

    /// Deflate reported an error while compressing outgoing data.
    #[error("Compression failed: {0}")]
    Compression(String),

    /// Wraps standard I/O errors raised by a transport.
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// Occurs when serialization of JSON data fails.
    /// Only available when the `json` feature is enabled.
    #[cfg(feature = "json")]
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl WebSocketError {
    /// The close code used when this error fails a connection.
    pub fn close_code(&self) -> CloseCode {
        use WebSocketError::*;
        match self {
            InvalidUTF8 { .. } | InvalidCloseReason | InflateFailed(_) => CloseCode::Invalid,
            FrameTooLarge { .. } => CloseCode::Policy,
            MessageTooLarge { .. } => CloseCode::Size,
            Compression(_) | IoError(_) => CloseCode::Error,
            #[cfg(feature = "json")]
            Json(_) => CloseCode::Error,
            _ => CloseCode::Protocol,
        }
    }
}
