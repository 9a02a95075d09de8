//! Incremental UTF-8 validation.
//!
//! Text messages arrive in chunks that may split a code point anywhere. The validator keeps
//! the bytes of an incomplete trailing code point and completes it with the next chunk, so
//! invalid input is reported as early as the first octet that cannot start or continue a
//! valid sequence.

#[cfg(feature = "simd")]
use simdutf8::compat::from_utf8;
#[cfg(not(feature = "simd"))]
use std::str::from_utf8;

/// Result of feeding a chunk to the [`Utf8Validator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Utf8Status {
    /// No invalid sequence has been seen so far.
    pub valid: bool,
    /// The input seen so far ends on a code point boundary.
    pub ends_on_codepoint: bool,
    /// Number of octets processed so far, or the index of the first invalid octet.
    pub offset: usize,
}

/// Validator carrying state across chunks.
#[derive(Debug, Default, Clone)]
pub struct Utf8Validator {
    partial: [u8; 4],
    partial_len: usize,
    offset: usize,
    failed: bool,
}

impl Utf8Validator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forgets every byte seen so far.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Validates the next chunk of the message.
    pub fn validate(&mut self, mut data: &[u8]) -> Utf8Status {
        if self.failed {
            return self.status();
        }

        // complete a code point split by the previous chunk
        while self.partial_len > 0 {
            let Some((&byte, rest)) = data.split_first() else {
                return self.status();
            };
            self.partial[self.partial_len] = byte;
            self.partial_len += 1;
            data = rest;

            match from_utf8(&self.partial[..self.partial_len]) {
                Ok(_) => {
                    self.offset += self.partial_len;
                    self.partial_len = 0;
                }
                Err(e) if e.error_len().is_none() => {}
                Err(_) => {
                    // the octet just added is the first one that cannot be valid
                    self.offset += self.partial_len - 1;
                    return self.fail();
                }
            }
        }

        match from_utf8(data) {
            Ok(_) => {
                self.offset += data.len();
            }
            Err(e) => {
                let valid_up_to = e.valid_up_to();
                match e.error_len() {
                    None => {
                        let tail = &data[valid_up_to..];
                        self.partial[..tail.len()].copy_from_slice(tail);
                        self.partial_len = tail.len();
                        self.offset += valid_up_to;
                    }
                    Some(_) => {
                        self.offset += valid_up_to;
                        return self.fail();
                    }
                }
            }
        }

        self.status()
    }

    fn fail(&mut self) -> Utf8Status {
        self.failed = true;
        self.partial_len = 0;
        self.status()
    }

    fn status(&self) -> Utf8Status {
        Utf8Status {
            valid: !self.failed,
            ends_on_codepoint: !self.failed && self.partial_len == 0,
            offset: self.offset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_ascii() {
        let mut v = Utf8Validator::new();
        let status = v.validate(b"hello");
        assert!(status.valid);
        assert!(status.ends_on_codepoint);
        assert_eq!(status.offset, 5);
    }

    #[test]
    fn test_split_codepoint() {
        // U+20AC EURO SIGN: E2 82 AC
        let mut v = Utf8Validator::new();
        let status = v.validate(&[b'a', 0xE2]);
        assert!(status.valid);
        assert!(!status.ends_on_codepoint);
        assert_eq!(status.offset, 1);

        let status = v.validate(&[0x82]);
        assert!(status.valid);
        assert!(!status.ends_on_codepoint);

        let status = v.validate(&[0xAC, b'b']);
        assert!(status.valid);
        assert!(status.ends_on_codepoint);
        assert_eq!(status.offset, 5);
    }

    #[test]
    fn test_byte_by_byte() {
        let text = "κόσμε 😀 done".as_bytes();
        let mut v = Utf8Validator::new();
        for byte in text {
            assert!(v.validate(std::slice::from_ref(byte)).valid);
        }
        let status = v.validate(&[]);
        assert!(status.ends_on_codepoint);
        assert_eq!(status.offset, text.len());
    }

    #[test]
    fn test_invalid_offset() {
        let mut v = Utf8Validator::new();
        let status = v.validate(b"abc\xffdef");
        assert!(!status.valid);
        assert_eq!(status.offset, 3);

        // stays failed
        assert!(!v.validate(b"ok").valid);
    }

    #[test]
    fn test_invalid_continuation_across_chunks() {
        let mut v = Utf8Validator::new();
        assert!(v.validate(&[b'x', 0xE2, 0x82]).valid);
        let status = v.validate(&[b'y']);
        assert!(!status.valid);
        assert_eq!(status.offset, 3);
    }

    #[test]
    fn test_surrogate_rejected() {
        // ED A0 80 encodes U+D800
        let mut v = Utf8Validator::new();
        assert!(v.validate(&[0xED]).valid);
        let status = v.validate(&[0xA0, 0x80]);
        assert!(!status.valid);
        assert_eq!(status.offset, 1);
    }

    #[test]
    fn test_reset() {
        let mut v = Utf8Validator::new();
        v.validate(&[0xff]);
        v.reset();
        let status = v.validate(b"fine");
        assert!(status.valid);
        assert_eq!(status.offset, 4);
    }
}
