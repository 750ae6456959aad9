//! Fixed-size record reads.

use zerocopy::{FromBytes, Immutable, KnownLayout};

use super::resolver::{AddressResolver, POINTER_SIZE};
use super::Table;
use crate::error::{Error, Result};
use crate::util::read_u64_le;

/// Turns a short read into a truncated-table error for `table`.
fn truncated(table: Table, addr: u64) -> impl Fn(Error) -> Error {
    move |err| match err {
        Error::ShortRead {
            needed, available, ..
        } => Error::TruncatedTable {
            table,
            addr,
            needed,
            available,
        },
        other => other,
    }
}

/// Reads `count` consecutive records of `record_size` bytes at `start`.
///
/// The whole table is fetched with a single read, so a table crossing the
/// end of its cache file fails with [`Error::TruncatedTable`] instead of
/// silently returning fewer rows. Slices are returned in address order.
pub fn read_records_raw<'a, R>(
    resolver: &'a R,
    table: Table,
    start: u64,
    record_size: usize,
    count: usize,
) -> Result<Vec<&'a [u8]>>
where
    R: AddressResolver + ?Sized,
{
    if count == 0 || record_size == 0 {
        return Ok(Vec::new());
    }

    let len = record_size
        .checked_mul(count)
        .ok_or_else(|| Error::InvalidTableLayout {
            table,
            reason: format!("{count} records of {record_size} bytes overflow"),
        })?;

    let data = resolver
        .read_at(start, len)
        .map_err(truncated(table, start))?;

    Ok(data.chunks_exact(record_size).collect())
}

/// Reads and decodes `count` consecutive records of type `T`.
pub fn read_records<T, R>(resolver: &R, table: Table, start: u64, count: usize) -> Result<Vec<T>>
where
    T: FromBytes + KnownLayout + Immutable,
    R: AddressResolver + ?Sized,
{
    read_records_raw(resolver, table, start, std::mem::size_of::<T>(), count)?
        .into_iter()
        .map(|chunk| {
            T::read_from_bytes(chunk).map_err(|_| Error::InvalidTableLayout {
                table,
                reason: format!("record at {start:#x} has wrong size"),
            })
        })
        .collect()
}

/// Reads a single record of type `T` at `addr`.
pub(crate) fn read_record<T, R>(resolver: &R, table: Table, addr: u64) -> Result<T>
where
    T: FromBytes + KnownLayout + Immutable,
    R: AddressResolver + ?Sized,
{
    read_records(resolver, table, addr, 1)?
        .pop()
        .ok_or_else(|| Error::InvalidTableLayout {
            table,
            reason: format!("empty read at {addr:#x}"),
        })
}

/// Reads one raw pointer slot of `table` at `addr`.
pub(crate) fn read_slot<R>(resolver: &R, table: Table, addr: u64) -> Result<u64>
where
    R: AddressResolver + ?Sized,
{
    let data = resolver
        .read_at(addr, POINTER_SIZE)
        .map_err(truncated(table, addr))?;
    Ok(read_u64_le(data))
}
