//! On-disk records of the dyld shared cache.
//!
//! Only what the reader touches is named: the header fields that locate
//! mappings, images, subcaches and local symbols, the slide info headers and
//! the local symbols tables. Everything else in the header is kept as opaque
//! padding so the named fields land at their real offsets.

use std::fmt;
use std::mem::offset_of;

use bitflags::bitflags;
use zerocopy::{FromBytes, Immutable, KnownLayout};

/// First four bytes of every cache file.
pub const DYLD_CACHE_MAGIC_PREFIX: &[u8; 4] = b"dyld";

// =============================================================================
// Header
// =============================================================================

/// Cache file header, up to the image array location.
///
/// Old caches end their header early; `mapping_offset` tells where it stops,
/// see [`DyldCacheHeader::contains_field`].
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheHeader {
    /// "dyld_v1" followed by the architecture, space padded
    pub magic: [u8; 16],
    /// File offset of the mapping array (also the header length)
    pub mapping_offset: u32,
    /// Number of mappings
    pub mapping_count: u32,
    /// Image array offset used before `images_offset` existed
    pub images_offset_old: u32,
    /// Image count used before `images_count` existed
    pub images_count_old: u32,
    _reserved0: [u8; 40],
    /// File offset of the local symbols side table
    pub local_symbols_offset: u64,
    /// Size of the local symbols side table
    pub local_symbols_size: u64,
    /// UUID of this file
    pub uuid: [u8; 16],
    _reserved1: [u8; 120],
    /// Unslid base of the shared region
    pub shared_region_start: u64,
    _reserved2: [u8; 80],
    /// File offset of the mapping array with slide info
    pub mapping_with_slide_offset: u32,
    /// Number of mappings with slide info
    pub mapping_with_slide_count: u32,
    _reserved3: [u8; 72],
    /// File offset of the subcache array
    pub sub_cache_array_offset: u32,
    /// Number of subcaches
    pub sub_cache_array_count: u32,
    /// UUID of the `.symbols` file, zero when there is none
    pub symbol_file_uuid: [u8; 16],
    _reserved4: [u8; 32],
    /// File offset of the image array
    pub images_offset: u32,
    /// Number of images
    pub images_count: u32,
}

impl DyldCacheHeader {
    /// Returns the architecture named in the magic, e.g. "arm64e".
    pub fn architecture(&self) -> &str {
        std::str::from_utf8(&self.magic)
            .unwrap_or("")
            .trim_start_matches("dyld_v0")
            .trim_start_matches("dyld_v1")
            .trim_matches(|c: char| c.is_whitespace() || c == '\0')
    }

    /// Returns true if the header is long enough to hold the field at `field_offset`.
    pub fn contains_field(&self, field_offset: usize) -> bool {
        field_offset < self.mapping_offset as usize
    }

    /// Returns true if the magic starts with "dyld".
    pub fn is_valid(&self) -> bool {
        &self.magic[..4] == DYLD_CACHE_MAGIC_PREFIX
    }

    /// Returns true if the cache is split over subcache files.
    pub fn has_subcaches(&self) -> bool {
        self.contains_field(offset_of!(Self, sub_cache_array_count))
            && self.sub_cache_array_count > 0
    }

    /// Returns true if local symbols live in a separate `.symbols` file.
    pub fn has_symbol_file(&self) -> bool {
        self.contains_field(offset_of!(Self, symbol_file_uuid))
            && self.symbol_file_uuid != [0u8; 16]
    }

    fn has_new_images_fields(&self) -> bool {
        self.contains_field(offset_of!(Self, images_offset)) && self.images_offset != 0
    }

    /// Returns the image array offset from whichever field this cache uses.
    pub fn actual_images_offset(&self) -> u64 {
        if self.has_new_images_fields() {
            u64::from(self.images_offset)
        } else {
            u64::from(self.images_offset_old)
        }
    }

    /// Returns the image count from whichever field this cache uses.
    pub fn actual_images_count(&self) -> u64 {
        if self.has_new_images_fields() {
            u64::from(self.images_count)
        } else {
            u64::from(self.images_count_old)
        }
    }
}

impl fmt::Display for DyldCacheHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dyld cache {} (uuid {}, {} mappings, {} images)",
            self.architecture(),
            uuid_to_string(&self.uuid),
            self.mapping_count,
            self.actual_images_count()
        )
    }
}

/// Formats a UUID in the usual 8-4-4-4-12 form.
pub fn uuid_to_string(uuid: &[u8; 16]) -> String {
    let mut out = String::with_capacity(36);
    for (i, byte) in uuid.iter().enumerate() {
        if matches!(i, 4 | 6 | 8 | 10) {
            out.push('-');
        }
        out.push_str(&format!("{byte:02X}"));
    }
    out
}

// =============================================================================
// Mappings and images
// =============================================================================

/// Mapping record of caches without per-mapping slide info.
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheMappingInfo {
    /// Unslid start address
    pub address: u64,
    /// Length in bytes
    pub size: u64,
    /// Offset in the owning file
    pub file_offset: u64,
    /// Maximum VM protection
    pub max_prot: u32,
    /// Initial VM protection
    pub init_prot: u32,
}

/// Mapping record that also locates the mapping's slide info.
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheMappingAndSlideInfo {
    /// Unslid start address
    pub address: u64,
    /// Length in bytes
    pub size: u64,
    /// Offset in the owning file
    pub file_offset: u64,
    /// Offset of the slide info in the owning file
    pub slide_info_file_offset: u64,
    /// Slide info length, zero for mappings without pointers
    pub slide_info_file_size: u64,
    /// [`MappingFlags`] bits
    pub flags: u64,
    /// Maximum VM protection
    pub max_prot: u32,
    /// Initial VM protection
    pub init_prot: u32,
}

bitflags! {
    /// What a mapping holds.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MappingFlags: u64 {
        /// Signed pointers
        const AUTH_DATA = 1 << 0;
        /// Data written at runtime
        const DIRTY_DATA = 1 << 1;
        /// Read-only after fixups
        const CONST_DATA = 1 << 2;
        /// Branch stubs
        const TEXT_STUBS = 1 << 3;
    }
}

/// One entry of the image array.
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheImageInfo {
    /// Unslid address of the image's Mach-O header
    pub address: u64,
    _mod_time_and_inode: [u8; 16],
    /// Main cache file offset of the install name
    pub path_file_offset: u32,
    _pad: u32,
}

// =============================================================================
// Slide info
// =============================================================================

/// Slide info header, version 2 (arm64 without pointer authentication).
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheSlideInfo2 {
    /// Always 2
    pub version: u32,
    /// Page size the page starts refer to
    pub page_size: u32,
    /// Offset of the page starts array
    pub page_starts_offset: u32,
    /// Number of page starts
    pub page_starts_count: u32,
    /// Offset of the page extras array
    pub page_extras_offset: u32,
    /// Number of page extras
    pub page_extras_count: u32,
    /// Bits of a stored pointer that hold the chain delta
    pub delta_mask: u64,
    /// Added to every non-zero target
    pub value_add: u64,
}

/// Slide info header, version 3 (arm64e).
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheSlideInfo3 {
    /// Always 3
    pub version: u32,
    /// Page size the page starts refer to
    pub page_size: u32,
    /// Number of page starts
    pub page_starts_count: u32,
    _pad: u32,
    /// Base added to the offset of signed pointers
    pub auth_value_add: u64,
}

/// Slide info header, version 5 (arm64e, iOS 18 and later).
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheSlideInfo5 {
    /// Always 5
    pub version: u32,
    /// Page size the page starts refer to
    pub page_size: u32,
    /// Number of page starts
    pub page_starts_count: u32,
    _pad: u32,
    /// Base added to every runtime offset
    pub value_add: u64,
}

/// A stored pointer under slide info v3.
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct SlidePointer3(pub u64);

impl SlidePointer3 {
    /// Bit 63 marks a signed pointer.
    #[inline]
    pub fn is_auth(&self) -> bool {
        self.0 >> 63 != 0
    }

    /// Signed pointers: the low 32 bits, relative to `auth_value_add`.
    #[inline]
    pub fn auth_offset(&self) -> u32 {
        self.0 as u32
    }

    /// Plain pointers: the target, with its top byte moved back from bits 43..51.
    #[inline]
    pub fn plain_value(&self) -> u64 {
        let top8 = self.0 & 0x0007_F800_0000_0000;
        let bottom43 = self.0 & 0x0000_07FF_FFFF_FFFF;
        (top8 << 13) | bottom43
    }
}

/// A stored pointer under slide info v5.
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct SlidePointer5(pub u64);

impl SlidePointer5 {
    /// Bit 63 marks a signed pointer.
    #[inline]
    pub fn is_auth(&self) -> bool {
        self.0 >> 63 != 0
    }

    /// Returns the 34-bit offset from the cache base, shared by both kinds.
    #[inline]
    pub fn runtime_offset(&self) -> u64 {
        self.0 & 0x3_FFFF_FFFF
    }

    /// For plain pointers: the top byte of the target, stored in bits 34..42.
    ///
    /// Signed pointers keep their diversity in the same bits.
    #[inline]
    pub fn high8(&self) -> u8 {
        (self.0 >> 34) as u8
    }
}

// =============================================================================
// Subcaches
// =============================================================================

/// Subcache array entry of caches that number their subcaches `.1`, `.2`...
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldSubcacheEntry {
    /// Expected UUID of the subcache file
    pub uuid: [u8; 16],
    /// Distance of the subcache from the main cache base
    pub cache_vm_offset: u64,
}

/// Subcache array entry that names the file suffix explicitly.
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldSubcacheEntry2 {
    /// Expected UUID of the subcache file
    pub uuid: [u8; 16],
    /// Distance of the subcache from the main cache base
    pub cache_vm_offset: u64,
    /// NUL-padded suffix such as ".01" or ".symbols"
    pub file_suffix: [u8; 32],
}

impl DyldSubcacheEntry2 {
    /// Returns the suffix without its NUL padding.
    pub fn suffix_str(&self) -> &str {
        let end = crate::util::memchr_null(&self.file_suffix);
        std::str::from_utf8(&self.file_suffix[..end]).unwrap_or("")
    }
}

// =============================================================================
// Local symbols
// =============================================================================

/// Head of the local symbols side table. Offsets are relative to it.
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheLocalSymbolsInfo {
    /// Offset of the nlist array
    pub nlist_offset: u32,
    /// Number of nlists
    pub nlist_count: u32,
    /// Offset of the string pool
    pub strings_offset: u32,
    /// Size of the string pool
    pub strings_size: u32,
    /// Offset of the per-image entries
    pub entries_offset: u32,
    /// Number of per-image entries
    pub entries_count: u32,
}

/// Per-image slice of the nlist array, keyed by file offset.
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheLocalSymbolsEntry {
    /// File offset of the image's `__TEXT`
    pub dylib_offset: u32,
    /// First nlist of the image
    pub nlist_start_index: u32,
    /// Number of nlists of the image
    pub nlist_count: u32,
}

/// Per-image slice of the nlist array, keyed by VM offset from the shared region.
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheLocalSymbolsEntry64 {
    /// VM offset of the image's `__TEXT`
    pub dylib_offset: u64,
    /// First nlist of the image
    pub nlist_start_index: u32,
    /// Number of nlists of the image
    pub nlist_count: u32,
}
