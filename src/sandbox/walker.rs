//! Walkers for the variable-length parts of the tables.
//!
//! Three shapes occur:
//!
//! - alias chains: consecutive 16-byte [`RawAlias`] records ending at the
//!   first record whose name pointer is zero
//! - sentinel pointer arrays: consecutive pointers to strings ending at the
//!   first zero pointer
//! - flat pointer tables: a known number of pointers to strings
//!
//! None of the zero-terminated lists carry a length, so every walk is capped
//! by [`ChainLimits`]. The terminator itself is never part of the result.

use tracing::trace;

use super::reader::{read_record, read_records_raw, read_slot};
use super::resolver::{AddressResolver, POINTER_SIZE};
use super::types::{Alias, RawAlias};
use super::Table;
use crate::error::{Error, Result, TableContext};
use crate::util::read_u64_le;

/// Size of one alias record.
const ALIAS_SIZE: u64 = std::mem::size_of::<RawAlias>() as u64;

/// Caps on zero-terminated lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainLimits {
    /// Maximum number of entries before a list is declared runaway
    pub max_len: usize,
}

impl Default for ChainLimits {
    fn default() -> Self {
        Self { max_len: 4096 }
    }
}

/// Walks an alias chain starting at the raw pointer `base`.
///
/// A zero `base` yields an empty list.
pub fn walk_alias_chain<R>(resolver: &R, base: u64, limits: ChainLimits) -> Result<Vec<Alias>>
where
    R: AddressResolver + ?Sized,
{
    if base == 0 {
        return Ok(Vec::new());
    }

    let start = resolver.slide(base);
    let mut aliases = Vec::new();

    for index in 0..limits.max_len {
        let raw: RawAlias = read_record(resolver, Table::Alias, start + index as u64 * ALIAS_SIZE)?;
        if raw.name_addr == 0 {
            trace!("Alias chain at {:#x}: {} entries", start, aliases.len());
            return Ok(aliases);
        }

        let name = resolver
            .read_cstring(resolver.slide(raw.name_addr))
            .in_table(Table::Alias, index, "name")?;

        aliases.push(Alias {
            name,
            id: raw.id,
            unknown: raw.unknown,
        });
    }

    Err(Error::ChainTooLong {
        table: Table::Alias,
        addr: start,
        limit: limits.max_len,
    })
}

/// Walks a zero-terminated array of string pointers at the raw pointer `base`.
///
/// A zero `base` yields an empty list.
pub fn walk_sentinel_pointers<R>(
    resolver: &R,
    table: Table,
    base: u64,
    limits: ChainLimits,
) -> Result<Vec<String>>
where
    R: AddressResolver + ?Sized,
{
    if base == 0 {
        return Ok(Vec::new());
    }

    let start = resolver.slide(base);
    let mut strings = Vec::new();

    for index in 0..limits.max_len {
        let slot = read_slot(resolver, table, start + (index * POINTER_SIZE) as u64)?;
        if slot == 0 {
            return Ok(strings);
        }

        let s = resolver
            .read_cstring(resolver.slide(slot))
            .in_table(table, index, "entry")?;
        strings.push(s);
    }

    Err(Error::ChainTooLong {
        table,
        addr: start,
        limit: limits.max_len,
    })
}

/// Reads exactly `count` string pointers at the (unslid) address `start`.
pub fn walk_flat_pointer_table<R>(
    resolver: &R,
    table: Table,
    start: u64,
    count: usize,
) -> Result<Vec<String>>
where
    R: AddressResolver + ?Sized,
{
    read_records_raw(resolver, table, start, POINTER_SIZE, count)?
        .into_iter()
        .enumerate()
        .map(|(index, slot)| {
            resolver
                .read_cstring(resolver.slide(read_u64_le(slot)))
                .in_table(table, index, "name")
        })
        .collect()
}
