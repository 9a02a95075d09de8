//! # Frame
//!
//! Frame headers as defined in [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2)
//! and the encoder used for every outgoing frame.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 or 64 bits)       |
//! |N|V|V|V|       |S|             |                               |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |        Extended payload length continued, if payload len == 127|
//! +---------------------------------------------------------------+
//! |                               |   Masking-key, if MASK set to 1|
//! +-------------------------------+-------------------------------+
//! |     Masking-key (continued)       |          Payload Data      |
//! +-----------------------------------+ - - - - - - - - - - - - - -+
//! :                     Payload Data continued ...                :
//! +---------------------------------------------------------------+
//! ```
//!
//! The payload length is always written with the minimal encoding: 7 bits below 126,
//! 16 bits below 65536 and 64 bits otherwise. When a masking key is present the payload is
//! XOR-ed with it in place while encoding.
use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    compression::{PerMessageCompress, PerMessageDeflate, PerMessageDeflateParams},
    mask::{create_xor_masker, XorMasker},
    options::Role,
    Result, WebSocketError,
};

/// Maximum size of a frame header: 2 bytes, 8 bytes of extended length and a 4 byte mask.
pub const MAX_HEAD_SIZE: usize = 14;

/// Maximum payload of a control frame.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// RSV1, used by permessage-deflate to flag the first frame of a compressed message.
pub const RSV1: u8 = 0b100;

/// WebSocket operation code (OpCode) that determines the semantic meaning of a frame.
///
/// The numeric values are defined in [RFC 6455, Section 11.8](https://datatracker.ietf.org/doc/html/rfc6455#section-11.8).
/// The ranges 0x3-0x7 and 0xB-0xF are reserved and rejected when parsing.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    /// Returns `true` for `Close`, `Ping` and `Pong`.
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WebSocketError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(WebSocketError::InvalidOpCode(value)),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(val: OpCode) -> Self {
        match val {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

/// Decoded header of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub opcode: OpCode,
    /// Final fragment of a message.
    pub fin: bool,
    /// The three reserved bits, RSV1 being the most significant (`0b100`).
    pub rsv: u8,
    pub payload_len: u64,
    pub mask: Option<[u8; 4]>,
}

impl FrameHeader {
    /// Whether RSV1 is set, meaning the message is compressed.
    #[inline]
    pub fn is_compressed(&self) -> bool {
        self.rsv & RSV1 != 0
    }

    /// Writes the header into `head`, returning the number of bytes written.
    ///
    /// `head` must hold at least [`MAX_HEAD_SIZE`] bytes.
    pub fn encode(&self, head: &mut [u8]) -> usize {
        head[0] = (self.fin as u8) << 7 | (self.rsv & 0b111) << 4 | u8::from(self.opcode);

        let len = self.payload_len;
        let size = if len < 126 {
            head[1] = len as u8;
            2
        } else if len < 65536 {
            head[1] = 126;
            head[2..4].copy_from_slice(&(len as u16).to_be_bytes());
            4
        } else {
            head[1] = 127;
            head[2..10].copy_from_slice(&len.to_be_bytes());
            10
        };

        if let Some(mask) = self.mask {
            head[1] |= 0x80;
            head[size..size + 4].copy_from_slice(&mask);
            size + 4
        } else {
            size
        }
    }
}

/// Encodes a complete frame, masking the payload when a key is given.
pub fn encode_frame(
    opcode: OpCode,
    fin: bool,
    rsv: u8,
    payload: &[u8],
    mask: Option<[u8; 4]>,
) -> Bytes {
    let header = FrameHeader {
        opcode,
        fin,
        rsv,
        payload_len: payload.len() as u64,
        mask,
    };

    let mut head = [0; MAX_HEAD_SIZE];
    let size = header.encode(&mut head);

    let mut out = BytesMut::with_capacity(size + payload.len());
    out.put_slice(&head[..size]);
    let start = out.len();
    out.put_slice(payload);

    if mask.is_some() {
        let mut masker = create_xor_masker(mask, payload.len() as u64);
        masker.process(&mut out[start..]);
    }

    out.freeze()
}

/// Generates a fresh masking key.
#[inline]
pub fn random_mask() -> [u8; 4] {
    rand::random()
}

/// A data message encoded once and sent on many connections.
///
/// Holds the plain frame and, optionally, a frame compressed with a fresh deflate context,
/// which any peer that negotiated permessage-deflate with the default window can inflate.
#[derive(Debug, Clone)]
pub struct PreparedMessage {
    pub(crate) plain: Bytes,
    pub(crate) deflated: Option<Bytes>,
    pub(crate) payload_len: usize,
}

impl PreparedMessage {
    /// Prepares an uncompressed message. Client connections need `apply_mask`.
    pub fn new(payload: &[u8], is_binary: bool, apply_mask: bool) -> Self {
        let mask = apply_mask.then(random_mask);
        Self {
            plain: encode_frame(data_opcode(is_binary), true, 0, payload, mask),
            deflated: None,
            payload_len: payload.len(),
        }
    }

    /// Prepares a message with both a plain and a compressed frame.
    pub fn with_compression(
        payload: &[u8],
        is_binary: bool,
        apply_mask: bool,
        level: u32,
    ) -> Result<Self> {
        let mut prepared = Self::new(payload, is_binary, apply_mask);

        let params = PerMessageDeflateParams {
            server_no_context_takeover: true,
            client_no_context_takeover: true,
            ..Default::default()
        };
        let mut deflate = PerMessageDeflate::new(Role::Server, params, level)?;
        deflate.start_compress_message();
        let mut compressed = deflate.compress_message_data(payload)?.to_vec();
        compressed.extend_from_slice(&deflate.end_compress_message()?);

        let mask = apply_mask.then(random_mask);
        prepared.deflated = Some(encode_frame(
            data_opcode(is_binary),
            true,
            RSV1,
            &compressed,
            mask,
        ));
        Ok(prepared)
    }

    /// Size of the application payload.
    pub fn payload_len(&self) -> usize {
        self.payload_len
    }
}

#[inline]
pub(crate) fn data_opcode(is_binary: bool) -> OpCode {
    if is_binary {
        OpCode::Binary
    } else {
        OpCode::Text
    }
}
