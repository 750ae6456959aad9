//! Mach-O constants and flags.

use bitflags::bitflags;

// =============================================================================
// Magic Numbers
// =============================================================================

/// 64-bit Mach-O magic (little-endian)
pub const MH_MAGIC_64: u32 = 0xFEEDFACF;

// =============================================================================
// File Types
// =============================================================================

/// Dynamically bound shared library
pub const MH_DYLIB: u32 = 0x6;

// =============================================================================
// CPU Types
// =============================================================================

/// Mask for 64-bit architecture
pub const CPU_ARCH_ABI64: u32 = 0x0100_0000;

/// ARM
pub const CPU_TYPE_ARM: u32 = 12;
/// ARM64
pub const CPU_TYPE_ARM64: u32 = CPU_TYPE_ARM | CPU_ARCH_ABI64;
/// x86
pub const CPU_TYPE_X86: u32 = 7;
/// x86_64
pub const CPU_TYPE_X86_64: u32 = CPU_TYPE_X86 | CPU_ARCH_ABI64;

/// ARM64 all subtypes
pub const CPU_SUBTYPE_ARM64_ALL: u32 = 0;
/// ARM64e (pointer authentication)
pub const CPU_SUBTYPE_ARM64E: u32 = 2;

// =============================================================================
// Load Commands
// =============================================================================

/// Segment of this file to be mapped (64-bit)
pub const LC_SEGMENT_64: u32 = 0x19;
/// Link-edit stab symbol table info
pub const LC_SYMTAB: u32 = 0x2;
/// The uuid
pub const LC_UUID: u32 = 0x1B;
/// Source version used to build binary
pub const LC_SOURCE_VERSION: u32 = 0x2A;

// =============================================================================
// Symbol Types
// =============================================================================

/// If any of these bits set, a symbolic debugging entry
pub const N_STAB: u8 = 0xE0;
/// Mask for the type bits
pub const N_TYPE: u8 = 0x0E;
/// External symbol bit
pub const N_EXT: u8 = 0x01;
/// Defined in section number n_sect
pub const N_SECT: u8 = 0xE;

// =============================================================================
// Header Flags
// =============================================================================

bitflags! {
    /// Mach-O header flags relevant to cached dylibs.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MachOFlags: u32 {
        /// The object file is input for the dynamic linker
        const DYLDLINK = 0x4;
        /// The image is using two-level name space bindings
        const TWOLEVEL = 0x80;
        /// The dylib is part of the dyld shared cache
        const DYLIB_IN_CACHE = 0x80000000;
    }
}
