//! Small helpers for reading little-endian data out of cache bytes.
//!
//! All reads are unaligned: sandbox tables live in `__DATA_CONST` at
//! arbitrary 8-byte boundaries and alias records are packed to 16 bytes.

use byteorder::{ByteOrder, LittleEndian};

// =============================================================================
// Unaligned Reads
// =============================================================================

/// Reads a little-endian u64 from an unaligned byte slice.
///
/// # Panics
///
/// Panics if `data.len() < 8`.
#[inline(always)]
pub fn read_u64_le(data: &[u8]) -> u64 {
    LittleEndian::read_u64(data)
}

/// Reads a little-endian u32 from an unaligned byte slice.
///
/// # Panics
///
/// Panics if `data.len() < 4`.
#[inline(always)]
pub fn read_u32_le(data: &[u8]) -> u32 {
    LittleEndian::read_u32(data)
}

// =============================================================================
// Terminator Search
// =============================================================================

/// Finds the position of the first null byte in a slice.
///
/// Returns `data.len()` when there is none.
#[inline(always)]
pub fn memchr_null(data: &[u8]) -> usize {
    memchr::memchr(0, data).unwrap_or(data.len())
}

/// Returns the bytes before the first null, looking at most `limit` bytes.
///
/// Returns `None` if no terminator appears in the window.
#[inline]
pub fn cstr_in_window(data: &[u8], limit: usize) -> Option<&[u8]> {
    let window = &data[..data.len().min(limit)];
    memchr::memchr(0, window).map(|end| &window[..end])
}
