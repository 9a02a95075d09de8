//! XOR masking of frame payloads.
//!
//! A masker keeps a running offset so a payload can be processed in arbitrary chunks as it
//! arrives from the transport. All maskers produce identical output; they only differ in
//! throughput.

/// Payloads below this size use the byte-wise masker.
pub const SHIFTED_MASKER_THRESHOLD: usize = 128;

/// Common interface of the maskers.
pub trait XorMasker {
    /// Masks or unmasks `data` in place, continuing from the current offset.
    fn process(&mut self, data: &mut [u8]);

    /// Number of payload bytes processed so far.
    fn pointer(&self) -> u64;

    /// Rewinds the offset to the start of the payload.
    fn reset(&mut self);
}

/// Masker for unmasked frames. Only tracks the offset.
#[derive(Debug, Default, Clone)]
pub struct XorMaskerNull {
    ptr: u64,
}

impl XorMasker for XorMaskerNull {
    #[inline]
    fn process(&mut self, data: &mut [u8]) {
        self.ptr += data.len() as u64;
    }

    fn pointer(&self) -> u64 {
        self.ptr
    }

    fn reset(&mut self) {
        self.ptr = 0;
    }
}

/// Byte-wise masker.
#[derive(Debug, Clone)]
pub struct XorMaskerSimple {
    mask: [u8; 4],
    ptr: u64,
}

impl XorMaskerSimple {
    pub fn new(mask: [u8; 4]) -> Self {
        Self { mask, ptr: 0 }
    }
}

impl XorMasker for XorMaskerSimple {
    #[inline]
    fn process(&mut self, data: &mut [u8]) {
        let start = (self.ptr & 3) as usize;
        for (i, byte) in data.iter_mut().enumerate() {
            *byte ^= self.mask[(start + i) & 3];
        }
        self.ptr += data.len() as u64;
    }

    fn pointer(&self) -> u64 {
        self.ptr
    }

    fn reset(&mut self) {
        self.ptr = 0;
    }
}

/// Masker that XORs four bytes at a time with the key rotated to the current offset.
#[derive(Debug, Clone)]
pub struct XorMaskerShifted1 {
    mask: [u8; 4],
    ptr: u64,
}

impl XorMaskerShifted1 {
    pub fn new(mask: [u8; 4]) -> Self {
        Self { mask, ptr: 0 }
    }
}

impl XorMasker for XorMaskerShifted1 {
    #[inline]
    fn process(&mut self, data: &mut [u8]) {
        let shift = (self.ptr & 3) as usize;
        let key = [
            self.mask[shift],
            self.mask[(shift + 1) & 3],
            self.mask[(shift + 2) & 3],
            self.mask[(shift + 3) & 3],
        ];
        let key = u32::from_ne_bytes(key);

        let mut chunks = data.chunks_exact_mut(4);
        for chunk in &mut chunks {
            let word = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) ^ key;
            chunk.copy_from_slice(&word.to_ne_bytes());
        }

        let key = key.to_ne_bytes();
        for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
            *byte ^= key[i];
        }

        self.ptr += data.len() as u64;
    }

    fn pointer(&self) -> u64 {
        self.ptr
    }

    fn reset(&mut self) {
        self.ptr = 0;
    }
}

/// The masker picked for one frame.
#[derive(Debug, Clone)]
pub enum FrameMasker {
    Null(XorMaskerNull),
    Simple(XorMaskerSimple),
    Shifted(XorMaskerShifted1),
}

impl XorMasker for FrameMasker {
    #[inline]
    fn process(&mut self, data: &mut [u8]) {
        match self {
            Self::Null(m) => m.process(data),
            Self::Simple(m) => m.process(data),
            Self::Shifted(m) => m.process(data),
        }
    }

    fn pointer(&self) -> u64 {
        match self {
            Self::Null(m) => m.pointer(),
            Self::Simple(m) => m.pointer(),
            Self::Shifted(m) => m.pointer(),
        }
    }

    fn reset(&mut self) {
        match self {
            Self::Null(m) => m.reset(),
            Self::Simple(m) => m.reset(),
            Self::Shifted(m) => m.reset(),
        }
    }
}

/// Picks a masker for a payload of `len` bytes.
pub fn create_xor_masker(mask: Option<[u8; 4]>, len: u64) -> FrameMasker {
    match mask {
        None => FrameMasker::Null(XorMaskerNull::default()),
        Some(mask) if len < SHIFTED_MASKER_THRESHOLD as u64 => {
            FrameMasker::Simple(XorMaskerSimple::new(mask))
        }
        Some(mask) => FrameMasker::Shifted(XorMaskerShifted1::new(mask)),
    }
}

/// Masks a complete payload in one call.
#[inline]
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    create_xor_masker(Some(mask), buf.len() as u64).process(buf);
}
