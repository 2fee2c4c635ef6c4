//! Sandboxed data segments.
//!
//! A segment is a power-of-two sized buffer followed by a guard region. Every
//! module-relative address is masked before use, so a module can only ever
//! reach its own segment (and at worst the guard bytes right behind it for a
//! multi-byte access at the very end).

use qvm_bytecode::Fault;
use qvm_bytecode::layout::{self, GUARD_FILL, GUARD_SIZE};

/// One module's data segment.
pub struct Sandbox {
    bytes: Box<[u8]>,
    mask: u32,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("size", &self.size())
            .field("base", &self.bytes.as_ptr())
            .finish()
    }
}

impl Sandbox {
    /// Zero-filled segment of `size` bytes (a power of two) plus guard.
    pub fn new(size: u32) -> Self {
        debug_assert!(size.is_power_of_two());
        let mut bytes = vec![0u8; size as usize + GUARD_SIZE].into_boxed_slice();
        bytes[size as usize..].fill(GUARD_FILL);
        Self {
            bytes,
            mask: size - 1,
        }
    }

    /// Segment size in bytes.
    pub fn size(&self) -> u32 {
        self.mask.wrapping_add(1)
    }

    /// `size - 1`.
    pub fn mask(&self) -> u32 {
        self.mask
    }

    /// The segment without its guard.
    pub fn segment(&self) -> &[u8] {
        &self.bytes[..self.size() as usize]
    }

    /// Mutable segment without its guard.
    pub fn segment_mut(&mut self) -> &mut [u8] {
        let size = self.size() as usize;
        &mut self.bytes[..size]
    }

    /// Base pointer handed to compiled code.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.bytes.as_mut_ptr()
    }

    /// Clear the segment, leaving the guard alone.
    pub fn zero(&mut self) {
        self.segment_mut().fill(0);
    }

    /// Whether the guard region still holds its fill pattern.
    pub fn guard_intact(&self) -> bool {
        self.bytes[self.size() as usize..]
            .iter()
            .all(|&b| b == GUARD_FILL)
    }

    /// Masked offset of a module address.
    #[inline]
    pub fn offset(&self, address: i32) -> usize {
        (address as u32 & self.mask) as usize
    }

    /// Host pointer for a module address. Address 0 maps to null.
    pub fn host_address(&mut self, address: i32) -> *mut u8 {
        if address == 0 {
            return std::ptr::null_mut();
        }
        let offset = self.offset(address);
        self.bytes[offset..].as_mut_ptr()
    }

    // Bytecode accesses. Alignment masks keep every access inside the segment.

    #[inline]
    pub(crate) fn load_u8(&self, address: i32) -> u8 {
        self.bytes[self.offset(address)]
    }

    #[inline]
    pub(crate) fn load_u16(&self, address: i32) -> u16 {
        let at = (address as u32 & layout::half_mask(self.mask)) as usize;
        u16::from_ne_bytes([self.bytes[at], self.bytes[at + 1]])
    }

    #[inline]
    pub(crate) fn load_word(&self, address: i32) -> i32 {
        let at = (address as u32 & layout::word_mask(self.mask)) as usize;
        let mut word = [0u8; 4];
        word.copy_from_slice(&self.bytes[at..at + 4]);
        i32::from_ne_bytes(word)
    }

    #[inline]
    pub(crate) fn store_u8(&mut self, address: i32, value: u8) {
        let at = self.offset(address);
        self.bytes[at] = value;
    }

    #[inline]
    pub(crate) fn store_u16(&mut self, address: i32, value: u16) {
        let at = (address as u32 & layout::half_mask(self.mask)) as usize;
        self.bytes[at..at + 2].copy_from_slice(&value.to_ne_bytes());
    }

    #[inline]
    pub(crate) fn store_word(&mut self, address: i32, value: i32) {
        let at = (address as u32 & layout::word_mask(self.mask)) as usize;
        self.bytes[at..at + 4].copy_from_slice(&value.to_ne_bytes());
    }

    /// Overlap-safe copy of `len` bytes; both ranges must lie in the segment.
    pub fn block_copy(&mut self, dest: i32, src: i32, len: u32) -> Result<(), Fault> {
        if !layout::block_copy_in_range(dest, src, len, self.mask) {
            return Err(Fault::BlockCopyOutOfRange);
        }
        let (dest, src, len) = (dest as usize, src as usize, len as usize);
        self.bytes.copy_within(src..src + len, dest);
        Ok(())
    }

    // Host accessors. These mask with the plain segment mask like pointer
    // translation does, so a word at the last byte spills into the guard.

    /// Read a native-order word.
    pub fn read_i32(&self, address: i32) -> i32 {
        let at = self.offset(address);
        let mut word = [0u8; 4];
        word.copy_from_slice(&self.bytes[at..at + 4]);
        i32::from_ne_bytes(word)
    }

    /// Write a native-order word.
    pub fn write_i32(&mut self, address: i32, value: i32) {
        let at = self.offset(address);
        self.bytes[at..at + 4].copy_from_slice(&value.to_ne_bytes());
    }

    /// Up to `len` bytes starting at `address`, cut at the segment end.
    pub fn read_bytes(&self, address: i32, len: usize) -> &[u8] {
        let at = self.offset(address);
        let end = at.saturating_add(len).min(self.size() as usize);
        &self.bytes[at..end]
    }

    /// Copy `data` to `address`, cut at the segment end. Returns the number
    /// of bytes written.
    pub fn write_bytes(&mut self, address: i32, data: &[u8]) -> usize {
        let at = self.offset(address);
        let count = data.len().min(self.size() as usize - at);
        self.bytes[at..at + count].copy_from_slice(&data[..count]);
        count
    }

    /// NUL-terminated string at `address`, bounded by the segment.
    pub fn read_string(&self, address: i32) -> String {
        let tail = &self.segment()[self.offset(address)..];
        let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        String::from_utf8_lossy(&tail[..end]).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_guard_region() {
        let mut sandbox = Sandbox::new(64);
        assert_eq!(sandbox.mask(), 63);
        assert!(sandbox.guard_intact());
        sandbox.write_i32(63, -1);
        assert!(!sandbox.guard_intact());
    }

    #[test]
    fn test_masked_word_access() {
        let mut sandbox = Sandbox::new(256);
        sandbox.store_word(256 + 8, 42);
        assert_eq!(sandbox.load_word(8), 42);
        // low bits are dropped for word accesses
        assert_eq!(sandbox.load_word(11), 42);
        sandbox.store_u16(3, 0xBEEF);
        assert_eq!(sandbox.load_u16(2), 0xBEEF);
        sandbox.store_u8(-1, 7);
        assert_eq!(sandbox.load_u8(255), 7);
    }

    #[test]
    fn test_block_copy_overlap() {
        let mut sandbox = Sandbox::new(64);
        sandbox.write_bytes(0, b"abcdef");
        sandbox.block_copy(2, 0, 4).unwrap();
        assert_eq!(sandbox.read_bytes(0, 6), b"ababcd");
        assert_eq!(
            sandbox.block_copy(60, 0, 8),
            Err(Fault::BlockCopyOutOfRange)
        );
    }

    #[test]
    fn test_strings_and_bounds() {
        let mut sandbox = Sandbox::new(16);
        assert_eq!(sandbox.write_bytes(12, b"hello"), 4);
        assert_eq!(sandbox.read_string(12), "hell");
        sandbox.write_bytes(0, b"hi\0there");
        assert_eq!(sandbox.read_string(0), "hi");
        assert_eq!(sandbox.read_bytes(14, 100).len(), 2);
    }

    #[test]
    fn test_zero_leaves_guard() {
        let mut sandbox = Sandbox::new(32);
        sandbox.write_bytes(0, &[9; 32]);
        sandbox.zero();
        assert!(sandbox.segment().iter().all(|&b| b == 0));
        assert!(sandbox.guard_intact());
    }

    proptest! {
        #[test]
        fn host_addresses_stay_inside(shift in 0u32..16, address in any::<i32>()) {
            let size = 1u32 << shift;
            let mut sandbox = Sandbox::new(size);
            let base = sandbox.as_mut_ptr() as usize;
            let ptr = sandbox.host_address(address);
            if address == 0 {
                prop_assert!(ptr.is_null());
            } else {
                let offset = ptr as usize - base;
                prop_assert!(offset < size as usize);
                prop_assert_eq!(offset, (address as u32 & (size - 1)) as usize);
            }
        }
    }
}
