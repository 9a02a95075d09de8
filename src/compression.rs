//! Per-message compression (RFC 7692).
//!
//! A compressed message is one raw deflate stream segment terminated by a sync flush. The
//! four byte `00 00 ff ff` marker the flush produces is stripped before sending and added
//! back before inflating the last chunk of a received message.
//!
//! With context takeover the LZ77 window is kept from one message to the next. Without it
//! the deflate (or inflate) state is reset when a new message starts.
use bytes::Bytes;
use flate2::{Compression, FlushCompress, FlushDecompress, Status};

use crate::{options::Role, Result, WebSocketError};

/// Name of the extension in `Sec-WebSocket-Extensions`.
pub const PERMESSAGE_DEFLATE: &str = "permessage-deflate";

/// Trailer of a sync-flushed deflate block.
const DEFLATE_TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Default LZ77 window, in bits.
pub const DEFAULT_WINDOW_BITS: u8 = 15;

/// Default zlib memory level.
pub const DEFAULT_MEM_LEVEL: u8 = 8;

/// Output buffer growth step.
const CHUNK: usize = 4096;

/// Negotiated parameters of a permessage-deflate session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerMessageDeflateParams {
    pub server_no_context_takeover: bool,
    pub client_no_context_takeover: bool,
    /// LZ77 window the server compresses with, 8 to 15.
    pub server_max_window_bits: u8,
    /// LZ77 window the client compresses with, 8 to 15.
    pub client_max_window_bits: u8,
    /// zlib memory level, 1 to 9.
    pub mem_level: u8,
}

impl Default for PerMessageDeflateParams {
    fn default() -> Self {
        Self {
            server_no_context_takeover: false,
            client_no_context_takeover: false,
            server_max_window_bits: DEFAULT_WINDOW_BITS,
            client_max_window_bits: DEFAULT_WINDOW_BITS,
            mem_level: DEFAULT_MEM_LEVEL,
        }
    }
}

impl PerMessageDeflateParams {
    pub fn validate(&self) -> Result<()> {
        for bits in [self.server_max_window_bits, self.client_max_window_bits] {
            if !(8..=15).contains(&bits) {
                return Err(WebSocketError::InvalidExtension(format!(
                    "window bits {bits} out of range 8..=15"
                )));
            }
        }
        if !(1..=9).contains(&self.mem_level) {
            return Err(WebSocketError::InvalidExtension(format!(
                "mem level {} out of range 1..=9",
                self.mem_level
            )));
        }
        Ok(())
    }
}

/// Message compression lifecycle used by the connection.
///
/// Outgoing messages call `start_compress_message`, any number of `compress_message_data`
/// and `end_compress_message`. Incoming messages follow the same pattern on the
/// decompression side.
pub trait PerMessageCompress: Send {
    /// Extension name as it appears in the handshake.
    fn extension_name(&self) -> &'static str;

    fn start_compress_message(&mut self);

    fn compress_message_data(&mut self, data: &[u8]) -> Result<Bytes>;

    /// Flushes the message and returns the remaining compressed bytes, trailer stripped.
    fn end_compress_message(&mut self) -> Result<Bytes>;

    fn start_decompress_message(&mut self);

    fn decompress_message_data(&mut self, data: &[u8]) -> Result<Bytes>;

    /// Feeds the stripped trailer and returns the last inflated bytes of the message.
    fn end_decompress_message(&mut self) -> Result<Bytes>;

    /// Bounds the inflated size of one message; `0` disables the bound.
    fn set_max_message_size(&mut self, limit: usize);

    /// Whether a message compressed with a fresh, full-size window may be sent as is.
    fn accepts_prepared(&self) -> bool {
        false
    }
}

/// permessage-deflate backed by `flate2`.
pub struct PerMessageDeflate {
    params: PerMessageDeflateParams,
    compress: Deflate,
    decompress: Inflate,
}

impl PerMessageDeflate {
    /// Builds the codec for one side of the connection.
    ///
    /// The server compresses with the `server_*` parameters and inflates with the
    /// `client_*` ones; the client does the opposite.
    pub fn new(role: Role, params: PerMessageDeflateParams, level: u32) -> Result<Self> {
        params.validate()?;

        let (out_no_context, out_bits, in_no_context, in_bits) = match role {
            Role::Server => (
                params.server_no_context_takeover,
                params.server_max_window_bits,
                params.client_no_context_takeover,
                params.client_max_window_bits,
            ),
            Role::Client => (
                params.client_no_context_takeover,
                params.client_max_window_bits,
                params.server_no_context_takeover,
                params.server_max_window_bits,
            ),
        };

        log::debug!(
            "permessage-deflate for {role}: outgoing no_context_takeover={out_no_context} \
            window_bits={out_bits}, incoming no_context_takeover={in_no_context} window_bits={in_bits}"
        );

        Ok(Self {
            params,
            compress: Deflate::new(level.min(9), out_bits, out_no_context),
            decompress: Inflate::new(in_bits, in_no_context),
        })
    }

    pub fn params(&self) -> &PerMessageDeflateParams {
        &self.params
    }
}

impl PerMessageCompress for PerMessageDeflate {
    fn extension_name(&self) -> &'static str {
        PERMESSAGE_DEFLATE
    }

    fn start_compress_message(&mut self) {
        self.compress.start();
    }

    fn compress_message_data(&mut self, data: &[u8]) -> Result<Bytes> {
        self.compress.write(data, FlushCompress::None)
    }

    fn end_compress_message(&mut self) -> Result<Bytes> {
        let mut tail = self.compress.write(&[], FlushCompress::Sync)?;
        if tail.ends_with(&DEFLATE_TRAILER) {
            tail.truncate(tail.len() - DEFLATE_TRAILER.len());
        }
        Ok(tail)
    }

    fn start_decompress_message(&mut self) {
        self.decompress.start();
    }

    fn decompress_message_data(&mut self, data: &[u8]) -> Result<Bytes> {
        self.decompress.write(data, FlushDecompress::None)
    }

    fn end_decompress_message(&mut self) -> Result<Bytes> {
        self.decompress.write(&DEFLATE_TRAILER, FlushDecompress::Sync)
    }

    fn set_max_message_size(&mut self, limit: usize) {
        self.decompress.limit = limit;
    }

    fn accepts_prepared(&self) -> bool {
        // with context takeover the peer's window would no longer match ours
        self.compress.no_context_takeover && self.compress.window_bits == DEFAULT_WINDOW_BITS
    }
}

/// Outgoing half: raw deflate without zlib header.
struct Deflate {
    compress: flate2::Compress,
    no_context_takeover: bool,
    window_bits: u8,
}

impl Deflate {
    fn new(level: u32, window_bits: u8, no_context_takeover: bool) -> Self {
        #[cfg(feature = "zlib")]
        let (compress, window_bits) = {
            // zlib refuses an 8 bit window for raw deflate
            let bits = window_bits.max(9);
            (
                flate2::Compress::new_with_window_bits(Compression::new(level), false, bits),
                bits,
            )
        };
        #[cfg(not(feature = "zlib"))]
        let (compress, window_bits) = {
            let _ = window_bits;
            (
                flate2::Compress::new(Compression::new(level), false),
                DEFAULT_WINDOW_BITS,
            )
        };

        Self {
            compress,
            no_context_takeover,
            window_bits,
        }
    }

    fn start(&mut self) {
        if self.no_context_takeover {
            self.compress.reset();
        }
    }

    fn write(&mut self, mut input: &[u8], flush: FlushCompress) -> Result<Bytes> {
        let mut output = Vec::with_capacity(input.len() / 2 + 64);

        loop {
            if output.len() == output.capacity() {
                output.reserve(CHUNK);
            }

            let before_in = self.compress.total_in();
            let before_out = self.compress.total_out();

            self.compress
                .compress_vec(input, &mut output, flush)
                .map_err(|err| WebSocketError::Compression(err.to_string()))?;

            let consumed = (self.compress.total_in() - before_in) as usize;
            let produced = self.compress.total_out() - before_out;
            input = &input[consumed..];

            let filled = output.len() == output.capacity();
            if input.is_empty() && !filled {
                break;
            }
            if consumed == 0 && produced == 0 && !filled {
                return Err(WebSocketError::Compression(
                    "deflate made no progress".to_string(),
                ));
            }
        }

        Ok(Bytes::from(output))
    }
}

/// Incoming half: raw inflate bounded by the message limit.
struct Inflate {
    decompress: flate2::Decompress,
    no_context_takeover: bool,
    limit: usize,
    inflated: usize,
    /// The peer closed the stream with a final block.
    finished: bool,
}

impl Inflate {
    fn new(window_bits: u8, no_context_takeover: bool) -> Self {
        #[cfg(feature = "zlib")]
        let decompress = flate2::Decompress::new_with_window_bits(false, window_bits.max(9));
        #[cfg(not(feature = "zlib"))]
        let decompress = {
            // a 15 bit window inflates streams produced with any smaller window
            let _ = window_bits;
            flate2::Decompress::new(false)
        };

        Self {
            decompress,
            no_context_takeover,
            limit: 0,
            inflated: 0,
            finished: false,
        }
    }

    fn start(&mut self) {
        if self.no_context_takeover || self.finished {
            self.decompress.reset(false);
        }
        self.inflated = 0;
        self.finished = false;
    }

    fn write(&mut self, mut input: &[u8], flush: FlushDecompress) -> Result<Bytes> {
        let mut output = Vec::with_capacity((input.len() * 2).clamp(64, CHUNK * 4));

        loop {
            if output.len() == output.capacity() {
                output.reserve(CHUNK);
            }

            let before_in = self.decompress.total_in();
            let before_out = self.decompress.total_out();

            let status = self
                .decompress
                .decompress_vec(input, &mut output, flush)
                .map_err(|err| WebSocketError::InflateFailed(err.to_string()))?;

            let consumed = (self.decompress.total_in() - before_in) as usize;
            let produced = (self.decompress.total_out() - before_out) as usize;
            input = &input[consumed..];

            self.inflated += produced;
            if self.limit > 0 && self.inflated > self.limit {
                return Err(WebSocketError::MessageTooLarge { limit: self.limit });
            }

            if status == Status::StreamEnd {
                self.finished = true;
                // only the trailer appended on our side may follow a final block
                let trailer = matches!(flush, FlushDecompress::Sync) && DEFLATE_TRAILER.ends_with(input);
                if !input.is_empty() && !trailer {
                    return Err(WebSocketError::InflateFailed(
                        "data after the end of the deflate stream".to_string(),
                    ));
                }
                break;
            }

            let filled = output.len() == output.capacity();
            if input.is_empty() && !filled {
                break;
            }
            if consumed == 0 && produced == 0 && !filled {
                return Err(WebSocketError::InflateFailed(
                    "inflate made no progress".to_string(),
                ));
            }
        }

        Ok(Bytes::from(output))
    }
}
