//! Frame header parsing and the streaming frame decoder.
use bytes::{Buf, BytesMut};

use crate::{
    frame::{FrameHeader, OpCode, MAX_CONTROL_PAYLOAD, RSV1},
    mask::{create_xor_masker, FrameMasker, XorMasker},
    Result, WebSocketError,
};

/// The rules a header is checked against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeaderPolicy {
    /// Frames without a masking key are rejected.
    pub require_mask: bool,
    /// Frames with a masking key are rejected.
    pub reject_mask: bool,
    /// permessage-deflate is active, so RSV1 is owned by it.
    pub compression: bool,
    /// A fragmented data message is in progress.
    pub inside_message: bool,
}

/// Parses a frame header from the start of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed. Every rule that only depends on the
/// first two bytes is checked as soon as those are available, so a violation is reported
/// before the rest of the header arrives.
pub fn try_parse_header(buf: &[u8], policy: &HeaderPolicy) -> Result<Option<(FrameHeader, usize)>> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let fin = buf[0] & 0b1000_0000 != 0;
    let rsv = (buf[0] & 0b0111_0000) >> 4;
    let raw_opcode = buf[0] & 0b0000_1111;
    let masked = buf[1] & 0b1000_0000 != 0;
    let length_code = buf[1] & 0x7F;

    // reserved bits
    if rsv & !RSV1 != 0 {
        return Err(WebSocketError::ReservedBitsNotZero);
    }
    let compressed = rsv & RSV1 != 0;
    if compressed && !policy.compression {
        return Err(WebSocketError::CompressionNotSupported);
    }

    // masking
    if !masked && policy.require_mask {
        return Err(WebSocketError::UnmaskedFrame);
    }
    if masked && policy.reject_mask {
        return Err(WebSocketError::MaskedFrame);
    }

    let opcode = OpCode::try_from(raw_opcode)?;
    if opcode.is_control() {
        if !fin {
            return Err(WebSocketError::ControlFrameFragmented);
        }
        if length_code as usize > MAX_CONTROL_PAYLOAD {
            return Err(WebSocketError::ControlFrameTooLarge(length_code as u64));
        }
        if opcode == OpCode::Close && length_code == 1 {
            return Err(WebSocketError::InvalidCloseFrame);
        }
        if compressed {
            return Err(WebSocketError::CompressedControlFrame);
        }
    } else if opcode == OpCode::Continuation {
        if !policy.inside_message {
            return Err(WebSocketError::InvalidContinuationFrame);
        }
        if compressed {
            return Err(WebSocketError::CompressedContinuationFrame);
        }
    } else if policy.inside_message {
        return Err(WebSocketError::InvalidFragment);
    }

    let extra = match length_code {
        126 => 2,
        127 => 8,
        _ => 0,
    };
    let header_size = 2 + extra + if masked { 4 } else { 0 };
    if buf.len() < header_size {
        return Ok(None);
    }

    let payload_len = match extra {
        0 => u64::from(length_code),
        2 => {
            let len = u16::from_be_bytes([buf[2], buf[3]]) as u64;
            if len < 126 {
                return Err(WebSocketError::NonMinimalLength);
            }
            len
        }
        _ => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[2..10]);
            let len = u64::from_be_bytes(raw);
            if len & (1 << 63) != 0 {
                return Err(WebSocketError::PayloadLengthOverflow);
            }
            if len < 65536 {
                return Err(WebSocketError::NonMinimalLength);
            }
            len
        }
    };

    let mask = masked.then(|| {
        let at = 2 + extra;
        [buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]
    });

    Ok(Some((
        FrameHeader {
            opcode,
            fin,
            rsv,
            payload_len,
            mask,
        },
        header_size,
    )))
}

/// Output of the [`FrameDecoder`].
#[derive(Debug, PartialEq, Eq)]
pub enum FrameEvent {
    /// A new frame started.
    Begin(FrameHeader),
    /// An unmasked chunk of the current frame's payload. Control frame payloads are
    /// delivered in a single chunk.
    Data(BytesMut),
    /// The current frame is complete.
    End(FrameHeader),
}

struct PayloadState {
    header: FrameHeader,
    masker: FrameMasker,
    remaining: u64,
}

/// Streaming decoder that splits buffered bytes into header, payload chunks and frame end.
///
/// Data payloads are handed out as soon as bytes arrive, so large frames are never
/// buffered whole.
#[derive(Default)]
pub struct FrameDecoder {
    state: Option<PayloadState>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a frame is currently being decoded.
    pub fn in_frame(&self) -> bool {
        self.state.is_some()
    }

    /// Decodes the next event from `src`, consuming the bytes it covers.
    pub fn decode(&mut self, src: &mut BytesMut, policy: &HeaderPolicy) -> Result<Option<FrameEvent>> {
        match self.state.take() {
            None => {
                let Some((header, size)) = try_parse_header(&src[..], policy)? else {
                    return Ok(None);
                };
                src.advance(size);

                self.state = Some(PayloadState {
                    header,
                    masker: create_xor_masker(header.mask, header.payload_len),
                    remaining: header.payload_len,
                });
                Ok(Some(FrameEvent::Begin(header)))
            }
            Some(state) if state.remaining == 0 => Ok(Some(FrameEvent::End(state.header))),
            Some(mut state) => {
                let wanted = state.remaining.min(usize::MAX as u64) as usize;
                let take = if state.header.opcode.is_control() {
                    if src.len() < wanted {
                        self.state = Some(state);
                        return Ok(None);
                    }
                    wanted
                } else {
                    wanted.min(src.len())
                };

                if take == 0 {
                    self.state = Some(state);
                    return Ok(None);
                }

                let mut chunk = src.split_to(take);
                state.masker.process(&mut chunk);
                state.remaining -= take as u64;
                self.state = Some(state);
                Ok(Some(FrameEvent::Data(chunk)))
            }
        }
    }

    /// Drops any frame in progress.
    pub fn reset(&mut self) {
        self.state = None;
    }
}
