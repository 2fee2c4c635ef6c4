//! Sandbox sizing and the address-masking rules every backend applies.

/// Bytes reserved for the program stack at the top of the sandbox.
pub const PROGRAM_STACK_SIZE: i32 = 0x10000;

/// Bytes of guard region following the sandbox.
pub const GUARD_SIZE: usize = 0x1000;

/// Fill pattern of the guard region.
pub const GUARD_FILL: u8 = 0xAB;

/// Largest addressable segment an image may request.
pub const MAX_SANDBOX_SIZE: u64 = 1 << 30;

/// Bytes the host entry frame occupies: return slot, spare slot, the
/// selector and [`crate::MAX_CALL_ARGS`] arguments.
pub const ENTRY_FRAME_SIZE: i32 = 8 + 4 * (1 + crate::MAX_CALL_ARGS as i32);

/// Return address marking the outermost frame of a host call.
pub const RETURN_SENTINEL: i32 = -1;

/// Smallest power of two that holds `segment_length` bytes (at least 1).
pub fn sandbox_size(segment_length: u64) -> u64 {
    segment_length.max(1).next_power_of_two()
}

/// Mask for word accesses.
#[inline]
pub fn word_mask(data_mask: u32) -> u32 {
    data_mask & !3
}

/// Mask for halfword accesses.
#[inline]
pub fn half_mask(data_mask: u32) -> u32 {
    data_mask & !1
}

/// Whether a block copy of `len` bytes from `src` to `dest` stays inside the
/// segment. The end of each range must itself be addressable.
pub fn block_copy_in_range(dest: i32, src: i32, len: u32, data_mask: u32) -> bool {
    let inside = |addr: i32| {
        let start = addr as u32 as u64;
        let mask = data_mask as u64;
        start <= mask && start + len as u64 <= mask
    };
    inside(dest) && inside(src)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn sizes_round_up() {
        assert_eq!(sandbox_size(0), 1);
        assert_eq!(sandbox_size(1), 1);
        assert_eq!(sandbox_size(150), 256);
        assert_eq!(sandbox_size(256), 256);
        assert_eq!(sandbox_size(257), 512);
    }

    #[test]
    fn entry_frame_holds_selector_and_args() {
        assert_eq!(ENTRY_FRAME_SIZE, 52);
    }

    #[test]
    fn block_copy_bounds() {
        assert!(block_copy_in_range(0, 16, 16, 255));
        assert!(!block_copy_in_range(250, 0, 16, 255));
        assert!(!block_copy_in_range(-4, 0, 4, 255));
        assert!(!block_copy_in_range(0, 0, 256, 255));
        assert!(block_copy_in_range(0, 0, 255, 255));
    }

    proptest! {
        #[test]
        fn sandbox_size_is_smallest_power_of_two(total in 0u64..(1 << 31)) {
            let size = sandbox_size(total);
            prop_assert!(size.is_power_of_two());
            prop_assert!(size >= total.max(1));
            prop_assert!(size == 1 || size / 2 < total);
        }
    }
}
