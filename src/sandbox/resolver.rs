//! Address and symbol resolution seams.
//!
//! The table walkers never touch cache files directly. They go through
//! [`AddressResolver`], which turns a virtual address into a location in one
//! of the (possibly many) cache files, and [`SymbolResolver`], which turns a
//! symbol name into a virtual address inside the sandbox library.

use crate::error::{Error, Result};
use crate::util::{cstr_in_window, read_u32_le, read_u64_le};

/// Upper bound on a C string scan.
pub const MAX_CSTRING_LEN: usize = 4096;

/// Size of a pointer slot in the tables.
pub const POINTER_SIZE: usize = 8;

/// A physical location: cache file index plus byte offset in that file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Location {
    /// Index of the cache file (0 = main cache, n = subcache n)
    pub file: usize,
    /// Byte offset within that file
    pub offset: u64,
}

/// Trait for reading memory of a mapped, possibly multi-file image.
///
/// Implementors provide address translation, pointer decoding and raw access
/// to file bytes; everything else has a default built on those three.
pub trait AddressResolver {
    /// Translates a virtual address into a file location.
    ///
    /// Fails with [`Error::UnmappedAddress`] when no file maps `addr`.
    fn resolve(&self, addr: u64) -> Result<Location>;

    /// Decodes a raw stored pointer into an unslid virtual address.
    ///
    /// Must be applied to every pointer field before it is dereferenced.
    fn slide(&self, raw: u64) -> u64;

    /// Returns up to `max_len` bytes starting at `loc`.
    ///
    /// Fewer bytes are returned when the file ends first.
    fn bytes_at(&self, loc: Location, max_len: usize) -> Result<&[u8]>;

    /// Reads exactly `len` bytes at `loc`.
    fn read_bytes(&self, loc: Location, len: usize) -> Result<&[u8]> {
        let data = self.bytes_at(loc, len)?;
        if data.len() < len {
            return Err(Error::ShortRead {
                file: loc.file,
                offset: loc.offset,
                needed: len,
                available: data.len(),
            });
        }
        Ok(data)
    }

    /// Reads exactly `len` bytes at a virtual address.
    fn read_at(&self, addr: u64, len: usize) -> Result<&[u8]> {
        self.read_bytes(self.resolve(addr)?, len)
    }

    /// Reads a null-terminated string at a virtual address.
    ///
    /// The terminator must appear within [`MAX_CSTRING_LEN`] bytes.
    fn read_cstring(&self, addr: u64) -> Result<String> {
        let data = self.bytes_at(self.resolve(addr)?, MAX_CSTRING_LEN)?;
        let bytes = cstr_in_window(data, MAX_CSTRING_LEN).ok_or(Error::UnterminatedString {
            addr,
            limit: MAX_CSTRING_LEN,
        })?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Reads one little-endian pointer-sized value.
    fn read_pointer(&self, addr: u64) -> Result<u64> {
        Ok(read_u64_le(self.read_at(addr, POINTER_SIZE)?))
    }

    /// Reads one little-endian u32.
    fn read_u32(&self, addr: u64) -> Result<u32> {
        Ok(read_u32_le(self.read_at(addr, 4)?))
    }
}

/// Trait for looking up symbols of one image.
pub trait SymbolResolver {
    /// Returns the virtual address of `name` (with its leading underscore).
    ///
    /// Fails with [`Error::SymbolNotFound`].
    fn find_symbol_address(&self, name: &str) -> Result<u64>;
}

/// A sandbox library image: readable memory plus its symbols.
pub trait SandboxImage: AddressResolver + SymbolResolver {}

impl<T: AddressResolver + SymbolResolver> SandboxImage for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::testing::MemoryImage;

    #[test]
    fn test_read_cstring() {
        let mut img = MemoryImage::new(0x1000);
        let addr = img.push_cstr("mach-lookup");
        assert_eq!(img.read_cstring(addr).unwrap(), "mach-lookup");
    }

    #[test]
    fn test_unterminated_string() {
        let mut img = MemoryImage::new(0x1000);
        let addr = img.push_bytes(&[b'a'; MAX_CSTRING_LEN + 8]);
        img.push_bytes(&[0]);

        let err = img.read_cstring(addr).unwrap_err();
        assert!(matches!(
            err,
            Error::UnterminatedString {
                limit: MAX_CSTRING_LEN,
                ..
            }
        ));
    }

    #[test]
    fn test_string_running_off_the_end() {
        let mut img = MemoryImage::new(0x1000);
        let addr = img.push_bytes(b"abc");
        assert!(matches!(
            img.read_cstring(addr),
            Err(Error::UnterminatedString { .. })
        ));
    }

    #[test]
    fn test_short_read() {
        let mut img = MemoryImage::new(0x1000);
        let addr = img.push_bytes(&[1, 2, 3, 4]);
        assert!(matches!(
            img.read_pointer(addr),
            Err(Error::ShortRead {
                needed: 8,
                available: 4,
                ..
            })
        ));
        assert_eq!(img.read_u32(addr).unwrap(), 0x04030201);
    }

    #[test]
    fn test_unmapped_address() {
        let img = MemoryImage::new(0x1000);
        assert!(matches!(
            img.read_pointer(0x10),
            Err(Error::UnmappedAddress { addr: 0x10 })
        ));
    }
}
