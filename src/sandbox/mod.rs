//! libsandbox metadata tables.
//!
//! `libsandbox.1.dylib` describes the operations, filters and modifiers of
//! the sandbox profile language with plain C arrays in its data segments:
//!
//! - `_filter_info`: one 32-byte record per filter, each pointing at a name,
//!   a category and a zero-terminated list of 16-byte alias records
//! - `_modifier_info`: one 32-byte record per modifier, shaped the same way
//! - `_operation_names`: a flat array of pointers to operation names,
//!   immediately followed by
//! - `_operation_info`: one 40-byte record per operation, with
//!   zero-terminated pointer arrays for its categories and modifiers
//!
//! Every pointer stored in these tables is a raw cache pointer and must be
//! decoded with [`AddressResolver::slide`] before it can be followed.

mod bound;
pub mod db;
mod filter;
mod modifier;
pub mod operand;
mod operation;
mod reader;
mod resolver;
mod types;
mod walker;

#[cfg(test)]
pub(crate) mod testing;

use std::fmt;

use tracing::info;

pub use bound::{FixedBound, TableBound, FILTER_COUNT, MODIFIER_COUNT};
pub use db::{reference, LibSandboxSnapshot, SnapshotDiff, TableDiff};
pub use filter::extract_filters;
pub use modifier::extract_modifiers;
pub use operand::{decode_operand, NoPool, Operand, OperandPool};
pub use operation::extract_operations;
pub use reader::{read_records, read_records_raw};
pub use resolver::{
    AddressResolver, Location, SandboxImage, SymbolResolver, MAX_CSTRING_LEN, POINTER_SIZE,
};
pub use types::*;
pub use walker::{walk_alias_chain, walk_flat_pointer_table, walk_sentinel_pointers, ChainLimits};

use crate::error::Result;

/// Install name suffix of the sandbox library inside the cache.
pub const LIBSANDBOX_IMAGE: &str = "libsandbox.1.dylib";

/// Symbol of the filter table.
pub const FILTER_INFO_SYMBOL: &str = "_filter_info";
/// Symbol of the modifier table.
pub const MODIFIER_INFO_SYMBOL: &str = "_modifier_info";
/// Symbol of the operation name pointer table.
pub const OPERATION_NAMES_SYMBOL: &str = "_operation_names";
/// Symbol of the operation table.
pub const OPERATION_INFO_SYMBOL: &str = "_operation_info";

// =============================================================================
// Tables
// =============================================================================

/// The tables and sub-tables walked during extraction.
///
/// Used to attribute errors to the structure they were raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    /// `_filter_info`
    Filter,
    /// `_modifier_info`
    Modifier,
    /// `_operation_info`
    Operation,
    /// `_operation_names`
    OperationNames,
    /// An alias list of a filter or modifier
    Alias,
    /// The category list of an operation
    Categories,
    /// The modifier list of an operation
    OperationModifiers,
}

impl Table {
    /// Returns the short name used in messages.
    pub fn name(&self) -> &'static str {
        match self {
            Table::Filter => "filter",
            Table::Modifier => "modifier",
            Table::Operation => "operation",
            Table::OperationNames => "operation_names",
            Table::Alias => "alias",
            Table::Categories => "categories",
            Table::OperationModifiers => "operation_modifiers",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Options
// =============================================================================

/// Options for table extraction.
pub struct ExtractOptions {
    /// Highest filter id (the filter table has one more row than this)
    pub filter_bound: Box<dyn TableBound>,
    /// Number of modifier rows
    pub modifier_bound: Box<dyn TableBound>,
    /// Caps on zero-terminated lists
    pub chain_limits: ChainLimits,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            filter_bound: Box::new(FixedBound(FILTER_COUNT)),
            modifier_bound: Box::new(FixedBound(MODIFIER_COUNT)),
            chain_limits: ChainLimits::default(),
        }
    }
}

impl fmt::Debug for ExtractOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractOptions")
            .field("filter_rows", &self.filter_bound.row_count(Table::Filter).ok())
            .field("modifier_rows", &self.modifier_bound.row_count(Table::Modifier).ok())
            .field("chain_limits", &self.chain_limits)
            .finish()
    }
}

// =============================================================================
// Snapshot Extraction
// =============================================================================

/// Extracts all three tables.
///
/// The pipelines share nothing but the read-only image, so they run in
/// parallel. The first failure (in table order) is returned.
pub fn extract_snapshot<I>(image: &I, options: &ExtractOptions) -> Result<LibSandboxSnapshot>
where
    I: SandboxImage + Sync + ?Sized,
{
    let (operations, (filters, modifiers)) = rayon::join(
        || extract_operations(image, options),
        || {
            rayon::join(
                || extract_filters(image, options),
                || extract_modifiers(image, options),
            )
        },
    );

    let snapshot = LibSandboxSnapshot {
        operations: operations?,
        filters: filters?,
        modifiers: modifiers?,
    };

    info!(
        "Extracted {} operations, {} filters, {} modifiers",
        snapshot.operations.len(),
        snapshot.filters.len(),
        snapshot.modifiers.len()
    );

    Ok(snapshot)
}
