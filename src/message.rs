//! Messages and their reassembly from frames.
use bytes::{Bytes, BytesMut};

use crate::{
    compression::PerMessageCompress,
    frame::{FrameHeader, OpCode},
    utf8::Utf8Validator,
    Result, WebSocketError,
};

/// A complete data message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub payload: Bytes,
    pub is_binary: bool,
}

impl Message {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            payload: Bytes::from(text.into()),
            is_binary: false,
        }
    }

    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            is_binary: true,
        }
    }

    /// The payload as text. `None` for binary messages or invalid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        if self.is_binary {
            return None;
        }
        std::str::from_utf8(&self.payload).ok()
    }

    /// Deserializes the payload as JSON.
    #[cfg(feature = "json")]
    #[cfg_attr(docsrs, doc(cfg(feature = "json")))]
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Reassembles data frames into messages.
///
/// Payload flows chunk by chunk: it is inflated when the message is compressed, validated
/// when it is text, and accumulated in the frame buffer, which moves into the message
/// buffer at the end of each frame.
#[derive(Debug)]
pub struct MessageAssembler {
    inside_message: bool,
    is_binary: bool,
    is_compressed: bool,
    frame_buffer: BytesMut,
    message_buffer: BytesMut,
    message_total_len: u64,
    utf8: Option<Utf8Validator>,
    max_frame_payload_size: usize,
    max_message_payload_size: usize,
}

impl MessageAssembler {
    /// Limits of `0` disable the respective check.
    pub fn new(validate_utf8: bool, max_frame_payload_size: usize, max_message_payload_size: usize) -> Self {
        Self {
            inside_message: false,
            is_binary: false,
            is_compressed: false,
            frame_buffer: BytesMut::new(),
            message_buffer: BytesMut::new(),
            message_total_len: 0,
            utf8: validate_utf8.then(Utf8Validator::new),
            max_frame_payload_size,
            max_message_payload_size,
        }
    }

    /// A fragmented message is in progress.
    pub fn inside_message(&self) -> bool {
        self.inside_message
    }

    /// Starts a data frame, opening a new message on its first frame.
    pub fn begin_frame(
        &mut self,
        header: &FrameHeader,
        codec: &mut Option<Box<dyn PerMessageCompress>>,
    ) -> Result<()> {
        if self.max_frame_payload_size > 0 && header.payload_len > self.max_frame_payload_size as u64 {
            return Err(WebSocketError::FrameTooLarge {
                limit: self.max_frame_payload_size,
            });
        }

        if !self.inside_message {
            self.inside_message = true;
            self.is_binary = header.opcode == OpCode::Binary;
            self.is_compressed = header.is_compressed();
            self.message_total_len = 0;

            if self.is_compressed {
                let codec = codec
                    .as_mut()
                    .ok_or(WebSocketError::CompressionNotSupported)?;
                codec.start_decompress_message();
            }
            if let Some(validator) = &mut self.utf8 {
                validator.reset();
            }
        }

        self.message_total_len += header.payload_len;
        if self.max_message_payload_size > 0
            && self.message_total_len > self.max_message_payload_size as u64
        {
            return Err(WebSocketError::MessageTooLarge {
                limit: self.max_message_payload_size,
            });
        }

        Ok(())
    }

    /// Feeds an unmasked payload chunk of the current frame.
    pub fn frame_data(
        &mut self,
        chunk: &[u8],
        codec: &mut Option<Box<dyn PerMessageCompress>>,
    ) -> Result<()> {
        if self.is_compressed {
            let codec = codec
                .as_mut()
                .ok_or(WebSocketError::CompressionNotSupported)?;
            let inflated = codec.decompress_message_data(chunk)?;
            self.accept(&inflated)
        } else {
            self.accept(chunk)
        }
    }

    /// Ends the current frame. Returns the message when `fin` completes it.
    pub fn end_frame(
        &mut self,
        fin: bool,
        codec: &mut Option<Box<dyn PerMessageCompress>>,
    ) -> Result<Option<Message>> {
        let frame = self.frame_buffer.split();
        self.message_buffer.unsplit(frame);

        if !fin {
            return Ok(None);
        }

        if self.is_compressed {
            let codec = codec
                .as_mut()
                .ok_or(WebSocketError::CompressionNotSupported)?;
            let tail = codec.end_decompress_message()?;
            self.accept(&tail)?;
            let frame = self.frame_buffer.split();
            self.message_buffer.unsplit(frame);
        }

        if !self.is_binary {
            if let Some(validator) = &mut self.utf8 {
                let status = validator.validate(&[]);
                if !status.ends_on_codepoint {
                    return Err(WebSocketError::InvalidUTF8 {
                        offset: status.offset,
                    });
                }
            }
        }

        let message = Message {
            payload: self.message_buffer.split().freeze(),
            is_binary: self.is_binary,
        };
        self.inside_message = false;
        self.message_total_len = 0;
        Ok(Some(message))
    }

    /// Drops any message in progress.
    pub fn reset(&mut self) {
        self.inside_message = false;
        self.frame_buffer.clear();
        self.message_buffer.clear();
        self.message_total_len = 0;
    }

    fn accept(&mut self, data: &[u8]) -> Result<()> {
        if self.is_compressed && self.max_message_payload_size > 0 {
            let total = self.message_buffer.len() + self.frame_buffer.len() + data.len();
            if total > self.max_message_payload_size {
                return Err(WebSocketError::MessageTooLarge {
                    limit: self.max_message_payload_size,
                });
            }
        }

        if !self.is_binary {
            if let Some(validator) = &mut self.utf8 {
                let status = validator.validate(data);
                if !status.valid {
                    return Err(WebSocketError::InvalidUTF8 {
                        offset: status.offset,
                    });
                }
            }
        }

        self.frame_buffer.extend_from_slice(data);
        Ok(())
    }
}
