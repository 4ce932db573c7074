//! Alignment helpers.

/// Default alignment for tensor buffers, in bytes.
///
/// Matches a cache line and the widest common SIMD register.
pub const MEMORY_ALIGN_DEFAULT: usize = 64;

/// Rounds `value` up to the next multiple of `align`.
///
/// `align` does not have to be a power of two. An `align` of zero is treated
/// as one.
///
/// # Examples
///
/// ```rust
/// use tactics_common::align_up;
///
/// assert_eq!(align_up(13, 8), 16);
/// assert_eq!(align_up(64, 64), 64);
/// assert_eq!(align_up(100, 48), 144);
/// ```
#[inline]
#[must_use]
pub const fn align_up(value: usize, align: usize) -> usize {
    if align <= 1 {
        return value;
    }
    value.div_ceil(align) * align
}

/// Returns true if `value` is a multiple of `align`.
#[inline]
#[must_use]
pub const fn is_aligned(value: usize, align: usize) -> bool {
    align <= 1 || value % align == 0
}
