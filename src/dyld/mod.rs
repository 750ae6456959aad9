//! Dyld shared cache handling.
//!
//! Only as much of the cache format as reading one dylib's data needs:
//! the header, the mappings of every cache file, the image list, the
//! pointer format of the data mappings and the local symbols side table.
//!
//! # Sub-caches
//!
//! Starting with iOS 15 / macOS 12, caches can be split into multiple files:
//! - Main cache: `dyld_shared_cache_arm64e`
//! - Sub-caches: `dyld_shared_cache_arm64e.1`, `.2`, etc.
//! - Symbols: `dyld_shared_cache_arm64e.symbols`

mod context;
#[cfg(test)]
pub(crate) mod fixture;
mod image;
mod slide;
mod structs;

pub use context::*;
pub use image::CacheImage;
pub use slide::PointerSlide;
pub use structs::*;
