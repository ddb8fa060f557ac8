//! Bounds-checked backing memory for the logical address space
//!
//! The runtime never dereferences tracked addresses directly. All loads,
//! stores, and byte moves go through a [`MemoryImage`]: an owned byte
//! buffer mapped at a fixed logical base. Every access is range-checked,
//! so the patch engine physically cannot write outside the span it was
//! handed. An address it cannot validate simply fails the access.

/// Size of a patchable word in bytes. Escape locations, register slots,
/// and stack slots are all word-granular.
pub const WORD_BYTES: u64 = 8;

/// Owned backing for one contiguous span of the logical address space.
///
/// Words are read and written little-endian. Accesses that fall outside
/// `[base, base + len)` fail cleanly: loads return `None`, stores and
/// copies return false and touch nothing.
#[derive(Debug, Clone)]
pub struct MemoryImage {
    base: u64,
    bytes: Vec<u8>,
}

impl MemoryImage {
    /// Create a zero-filled image covering `[base, base + len)`.
    ///
    /// # Panics
    /// Panics if the span would wrap the address space.
    pub fn new(base: u64, len: u64) -> Self {
        assert!(
            base.checked_add(len).is_some(),
            "memory image [{base:#x}, {base:#x}+{len:#x}) wraps the address space"
        );
        Self {
            base,
            bytes: vec![0u8; len as usize],
        }
    }

    /// First address covered by the image.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// One past the last address covered by the image.
    pub fn limit(&self) -> u64 {
        self.base + self.bytes.len() as u64
    }

    /// Whether `[addr, addr + len)` lies entirely inside the image.
    pub fn contains_range(&self, addr: u64, len: u64) -> bool {
        addr >= self.base
            && addr
                .checked_add(len)
                .is_some_and(|end| end <= self.limit())
    }

    /// Byte offset of `addr` into the buffer, if `len` bytes starting
    /// there are in bounds.
    fn offset_of(&self, addr: u64, len: u64) -> Option<usize> {
        if self.contains_range(addr, len) {
            Some((addr - self.base) as usize)
        } else {
            None
        }
    }

    /// Load the word at `addr`, or `None` if it is not fully backed.
    pub fn load_word(&self, addr: u64) -> Option<u64> {
        let off = self.offset_of(addr, WORD_BYTES)?;
        let raw: [u8; 8] = self.bytes[off..off + 8].try_into().ok()?;
        Some(u64::from_le_bytes(raw))
    }

    /// Store a word at `addr`. Returns false (storing nothing) if the
    /// word is not fully backed.
    pub fn store_word(&mut self, addr: u64, value: u64) -> bool {
        match self.offset_of(addr, WORD_BYTES) {
            Some(off) => {
                self.bytes[off..off + 8].copy_from_slice(&value.to_le_bytes());
                true
            }
            None => false,
        }
    }

    /// Move `len` bytes from `src` to `dst` with memmove semantics
    /// (overlapping ranges are handled). Returns false, copying nothing,
    /// unless both ranges are fully backed.
    pub fn copy_region(&mut self, src: u64, dst: u64, len: u64) -> bool {
        let (Some(src_off), Some(dst_off)) = (self.offset_of(src, len), self.offset_of(dst, len))
        else {
            return false;
        };
        self.bytes.copy_within(src_off..src_off + len as usize, dst_off);
        true
    }
}
