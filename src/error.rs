//! Error types for the sandbox table extractor.
//!
//! This module covers every failure the extractor can surface: cache and
//! Mach-O parsing, address translation, table walking, operand decoding and
//! the reference database.

use std::path::PathBuf;

use thiserror::Error;

use crate::sandbox::Table;

/// The main error type for sandbox table extraction.
#[derive(Error, Debug)]
pub enum Error {
    // ==================== I/O Errors ====================
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to open file '{path}': {source}")]
    FileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to memory map file '{path}': {source}")]
    MemoryMap {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ==================== Cache Format Errors ====================
    #[error("invalid dyld cache magic: expected 'dyld', got {0:?}")]
    InvalidMagic([u8; 4]),

    #[error("subcache file not found: {path}")]
    SubcacheNotFound { path: PathBuf },

    #[error("subcache UUID mismatch for '{path}': expected {expected}, got {actual}")]
    SubcacheUuidMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("unsupported slide info version: {0}")]
    UnsupportedSlideVersion(u32),

    // ==================== Address Translation ====================
    #[error("address {addr:#x} not mapped by any cache file")]
    UnmappedAddress { addr: u64 },

    #[error("short read at {offset:#x} in file {file}: need {needed} bytes, have {available}")]
    ShortRead {
        file: usize,
        offset: u64,
        needed: usize,
        available: usize,
    },

    #[error("no string terminator within {limit} bytes at {addr:#x}")]
    UnterminatedString { addr: u64, limit: usize },

    // ==================== Mach-O Errors ====================
    #[error("invalid Mach-O magic: {0:#x}")]
    InvalidMachoMagic(u32),

    #[error("Mach-O segment '{name}' not found")]
    SegmentNotFound { name: String },

    #[error("load command at offset {offset:#x} extends beyond header")]
    LoadCommandOverflow { offset: usize },

    #[error("image not found: {name}")]
    ImageNotFound { name: String },

    #[error("symbol not found: {name}")]
    SymbolNotFound { name: String },

    #[error("no LC_SOURCE_VERSION in {image}")]
    SourceVersionNotFound { image: String },

    // ==================== Table Errors ====================
    #[error("{table} table truncated at {addr:#x}: need {needed} bytes, have {available}")]
    TruncatedTable {
        table: Table,
        addr: u64,
        needed: usize,
        available: usize,
    },

    #[error("{table} chain at {addr:#x} not terminated after {limit} entries")]
    ChainTooLong { table: Table, addr: u64, limit: usize },

    #[error("invalid {table} table layout: {reason}")]
    InvalidTableLayout { table: Table, reason: String },

    #[error("{table}[{index}].{field}: {source}")]
    Table {
        table: Table,
        index: usize,
        field: &'static str,
        #[source]
        source: Box<Error>,
    },

    // ==================== Operand Errors ====================
    #[error("alias id not found: {id}")]
    UnknownAlias { id: u16 },

    #[error("unsupported filter category: {category}")]
    UnsupportedOperandCategory { category: String },

    #[error("operand pool has no entry at offset {offset:#x}")]
    OperandOutOfRange { offset: u32 },

    // ==================== Reference Database ====================
    #[error("invalid filter id: {0}")]
    InvalidFilterId(usize),

    #[error("invalid modifier id: {0}")]
    InvalidModifierId(usize),

    #[error("invalid operation id: {0}")]
    InvalidOperationId(usize),

    #[error("failed to decode libsandbox data: {0}")]
    Snapshot(#[from] serde_json::Error),

    #[error("reference database already loaded")]
    ReferenceAlreadyLoaded,

    #[error("reference database not loaded")]
    ReferenceNotLoaded,

    // ==================== Parse Errors ====================
    #[error("parse error at offset {offset:#x}: {reason}")]
    Parse { offset: usize, reason: String },

    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },
}

/// A specialized Result type for extraction operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a parse error with a formatted message.
    #[inline]
    pub fn parse(offset: usize, reason: impl Into<String>) -> Self {
        Error::Parse {
            offset,
            reason: reason.into(),
        }
    }

    /// Creates an unmapped address error.
    #[inline]
    pub fn unmapped(addr: u64) -> Self {
        Error::UnmappedAddress { addr }
    }

    /// Attributes this error to a table row and field.
    pub fn in_table(self, table: Table, index: usize, field: &'static str) -> Self {
        Error::Table {
            table,
            index,
            field,
            source: Box::new(self),
        }
    }

    /// Returns the innermost error, looking through table attribution.
    pub fn root(&self) -> &Error {
        match self {
            Error::Table { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Extension for attributing errors to a table row and field.
pub trait TableContext<T> {
    /// Wraps the error with the table, row index and field it came from.
    fn in_table(self, table: Table, index: usize, field: &'static str) -> Result<T>;
}

impl<T> TableContext<T> for Result<T> {
    #[inline]
    fn in_table(self, table: Table, index: usize, field: &'static str) -> Result<T> {
        self.map_err(|e| e.in_table(table, index, field))
    }
}
