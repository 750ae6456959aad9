//! Decoding of slid pointers stored in the cache.
//!
//! Pointers in the cache's data mappings are not plain virtual addresses:
//! each one carries a chain delta and, on arm64e, authentication bits. Before
//! a pointer read from a sandbox table can be dereferenced it has to be
//! turned back into an unslid virtual address. Unlike a full rebase pass this
//! only decodes single values, so it never touches the page-start chains.

use tracing::debug;
use zerocopy::FromBytes;

use super::structs::*;
use super::MappingEntry;
use crate::error::{Error, Result};

/// Pointer format of the cache, taken from its slide info.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerSlide {
    /// No slide info: pointers are stored as plain addresses.
    None,
    /// Slide info v2 (arm64, x86_64).
    V2 {
        /// Bits holding the chain delta
        delta_mask: u64,
        /// Base added to non-zero values
        value_add: u64,
    },
    /// Slide info v3 (arm64e).
    V3 {
        /// Base added to authenticated pointer offsets
        auth_value_add: u64,
    },
    /// Slide info v5 (arm64e, iOS 18+).
    V5 {
        /// Base added to runtime offsets
        value_add: u64,
    },
}

impl PointerSlide {
    /// Reads the pointer format from the first mapping that carries slide info.
    ///
    /// `data_for` returns the file bytes of the given subcache index.
    pub fn from_mappings<'a, F>(mappings: &[MappingEntry], data_for: F) -> Result<Self>
    where
        F: Fn(usize) -> &'a [u8],
    {
        let Some(mapping) = mappings.iter().find(|m| m.has_slide_info()) else {
            return Ok(PointerSlide::None);
        };

        let data = data_for(mapping.subcache_index);
        let offset = mapping.slide_info_offset as usize;
        let info = data
            .get(offset..)
            .filter(|d| d.len() >= 4)
            .ok_or(Error::BufferTooSmall {
                needed: offset + 4,
                available: data.len(),
            })?;

        let version = crate::util::read_u32_le(info);
        let slide = match version {
            2 => {
                let v2 = DyldCacheSlideInfo2::read_from_prefix(info)
                    .map_err(|_| Error::parse(offset, "failed to parse slide info v2"))?
                    .0;
                PointerSlide::V2 {
                    delta_mask: v2.delta_mask,
                    value_add: v2.value_add,
                }
            }
            3 => {
                let v3 = DyldCacheSlideInfo3::read_from_prefix(info)
                    .map_err(|_| Error::parse(offset, "failed to parse slide info v3"))?
                    .0;
                PointerSlide::V3 {
                    auth_value_add: v3.auth_value_add,
                }
            }
            5 => {
                let v5 = DyldCacheSlideInfo5::read_from_prefix(info)
                    .map_err(|_| Error::parse(offset, "failed to parse slide info v5"))?
                    .0;
                PointerSlide::V5 {
                    value_add: v5.value_add,
                }
            }
            _ => return Err(Error::UnsupportedSlideVersion(version)),
        };

        debug!("Pointer format from slide info v{}: {:x?}", version, slide);
        Ok(slide)
    }

    /// Decodes a raw stored pointer into an unslid virtual address.
    ///
    /// Zero stays zero so callers can keep testing for null after decoding.
    #[inline]
    pub fn decode(&self, raw: u64) -> u64 {
        if raw == 0 {
            return 0;
        }
        match *self {
            PointerSlide::None => raw,
            PointerSlide::V2 {
                delta_mask,
                value_add,
            } => {
                let value = raw & !delta_mask;
                if value != 0 {
                    value + value_add
                } else {
                    0
                }
            }
            PointerSlide::V3 { auth_value_add } => {
                let ptr = SlidePointer3(raw);
                if ptr.is_auth() {
                    ptr.auth_offset() as u64 + auth_value_add
                } else {
                    ptr.plain_value()
                }
            }
            PointerSlide::V5 { value_add } => {
                let ptr = SlidePointer5(raw);
                if ptr.is_auth() {
                    ptr.runtime_offset() + value_add
                } else {
                    ptr.runtime_offset() + value_add + ((ptr.high8() as u64) << 56)
                }
            }
        }
    }
}
