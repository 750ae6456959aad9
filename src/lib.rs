//! sbdump - libsandbox table extractor for the dyld shared cache.
//!
//! `libsandbox.1.dylib` describes the sandbox profile language (its
//! operations, filters and modifiers) in plain C arrays. This crate finds
//! the library inside a (possibly split) dyld shared cache, walks those
//! arrays and their pointer-chained tails, and decodes filter operands into
//! profile source text.
//!
//! # Features
//!
//! - Memory-mapped split caches (iOS 15+, macOS 12+) with local symbols
//! - Slide info v2, v3 and v5 pointer decoding
//! - Filter, modifier and operation tables, extracted in parallel
//! - gzip + JSON snapshots usable as a reference database
//!
//! # Example
//!
//! ```no_run
//! use sbdump::{extract_snapshot, CacheImage, DyldContext, ExtractOptions};
//!
//! fn main() -> sbdump::Result<()> {
//!     let cache = DyldContext::open("/path/to/dyld_shared_cache_arm64e")?;
//!     let libsandbox = CacheImage::new(&cache, sbdump::sandbox::LIBSANDBOX_IMAGE)?;
//!
//!     let snapshot = extract_snapshot(&libsandbox, &ExtractOptions::default())?;
//!     for op in &snapshot.operations {
//!         println!("{} {}", op.id, op.name);
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dyld;
pub mod error;
pub mod macho;
pub mod sandbox;
mod util;
pub mod webkit;

// Re-export main types
pub use dyld::{CacheImage, DyldContext, ImageEntry, MappingEntry, PointerSlide};
pub use error::{Error, Result};
pub use macho::{MachOContext, SourceVersion};
pub use sandbox::{
    decode_operand, extract_snapshot, ExtractOptions, LibSandboxSnapshot, Operand, SnapshotDiff,
};
pub use webkit::webkit_version;

/// Opens the sandbox library of `cache` and extracts its tables.
pub fn extract_from_cache(
    cache: &DyldContext,
    options: &ExtractOptions,
) -> Result<LibSandboxSnapshot> {
    let image = CacheImage::new(cache, sandbox::LIBSANDBOX_IMAGE)?;
    extract_snapshot(&image, options)
}
