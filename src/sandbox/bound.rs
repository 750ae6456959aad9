//! Row counts of the fixed-size tables.
//!
//! Neither `_filter_info` nor `_modifier_info` carries its own length. The
//! counts are compiled into the code that indexes them, so for now they are
//! configured per library version.

use super::Table;
use crate::error::Result;

/// Highest filter id of the known library versions.
pub const FILTER_COUNT: usize = 0x55;

/// Number of modifiers of the known library versions.
pub const MODIFIER_COUNT: usize = 0x15;

/// Strategy deciding how many rows a table has.
pub trait TableBound: Send + Sync {
    /// Returns the row count (or the highest id, for the filter table).
    fn row_count(&self, table: Table) -> Result<usize>;
}

/// A constant row count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedBound(pub usize);

impl TableBound for FixedBound {
    #[inline]
    fn row_count(&self, _table: Table) -> Result<usize> {
        Ok(self.0)
    }
}
