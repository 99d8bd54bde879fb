//! Size-class arithmetic.
//!
//! A block of rank `r` spans exactly `2^r` bytes, header included.

/// Returns the greatest `r` such that `2^r <= n`.
///
/// # Panics
///
/// Panics if `n` is zero.
#[inline]
pub const fn floor_log2(n: usize) -> u32 {
    assert!(n != 0, "floor_log2 of zero");

    usize::BITS - 1 - n.leading_zeros()
}

/// Returns the smallest `r` such that `2^r >= n`.
///
/// # Panics
///
/// Panics if `n` is zero.
#[inline]
pub const fn ceil_log2(n: usize) -> u32 {
    let lower = floor_log2(n);

    if n.is_power_of_two() {
        lower
    } else {
        lower + 1
    }
}

/// Returns the size in bytes of a block of rank `rank`.
///
/// Returns `None` if the size does not fit in a `usize`.
#[inline]
pub const fn rank_size(rank: u32) -> Option<usize> {
    1usize.checked_shl(rank)
}
