//! Mach-O file format handling.
//!
//! Just enough of the format to read a cached image's load commands: its
//! segments, symbol table location, UUID and source version.

mod constants;
mod context;
mod structs;

pub use constants::*;
pub use context::*;
pub use structs::*;
