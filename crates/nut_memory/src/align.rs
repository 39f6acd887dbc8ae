//! Alignment arithmetic shared by every allocator.
//!
//! An alignment of `0` means "no constraint" and leaves values unchanged.
//! Any other alignment must be a power of two.

/// Align a value up to the given alignment
///
/// ```
/// use nut_memory::align_up;
///
/// assert_eq!(align_up(100, 16), 112);
/// assert_eq!(align_up(112, 16), 112);
/// assert_eq!(align_up(7, 0), 7);
/// ```
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    if align == 0 {
        return value;
    }
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Align a value up, returning `None` if the result does not fit in `usize`
#[inline]
pub const fn try_align_up(value: usize, align: usize) -> Option<usize> {
    if align == 0 {
        return Some(value);
    }
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Align a value down to the given alignment
#[inline]
pub const fn align_down(value: usize, align: usize) -> usize {
    if align == 0 {
        return value;
    }
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Check if a pointer is aligned
#[inline]
pub fn is_aligned(ptr: *const u8, align: usize) -> bool {
    align == 0 || (ptr as usize) & (align - 1) == 0
}

/// Whether `align` is usable as an allocator alignment (zero or a power of two)
#[inline]
pub const fn is_valid_alignment(align: usize) -> bool {
    align == 0 || align.is_power_of_two()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(9, 8), 16);
        assert_eq!(align_up(50, 16), 64);
        assert_eq!(align_up(13, 1), 13);
    }

    #[test]
    fn test_zero_alignment_is_identity() {
        for value in [0, 1, 3, 17, 4096, usize::MAX] {
            assert_eq!(align_up(value, 0), value);
            assert_eq!(align_down(value, 0), value);
            assert_eq!(try_align_up(value, 0), Some(value));
        }
    }

    #[test]
    fn test_align_up_bounds() {
        for align in [1usize, 2, 4, 8, 16, 64, 256] {
            for value in 0..600 {
                let aligned = align_up(value, align);
                assert!(aligned >= value);
                assert!(aligned - value < align);
                assert_eq!(aligned % align, 0);
            }
        }
    }

    #[test]
    fn test_align_down() {
        assert_eq!(align_down(15, 8), 8);
        assert_eq!(align_down(16, 8), 16);
        assert_eq!(align_down(3, 4), 0);
    }

    #[test]
    fn test_try_align_up_overflow() {
        assert_eq!(try_align_up(usize::MAX, 16), None);
        assert_eq!(try_align_up(usize::MAX - 20, 16), Some(usize::MAX - 15));
    }

    #[test]
    fn test_valid_alignment() {
        assert!(is_valid_alignment(0));
        assert!(is_valid_alignment(1));
        assert!(is_valid_alignment(64));
        assert!(!is_valid_alignment(3));
        assert!(!is_valid_alignment(24));
    }

    #[test]
    fn test_is_aligned() {
        assert!(is_aligned(64 as *const u8, 16));
        assert!(!is_aligned(65 as *const u8, 16));
        assert!(is_aligned(65 as *const u8, 0));
    }
}
