//! `_filter_info` extraction.

use tracing::debug;

use super::reader::read_records;
use super::resolver::SandboxImage;
use super::types::{FilterInfo, RawFilterInfo};
use super::walker::{walk_alias_chain, ChainLimits};
use super::{ExtractOptions, Table, FILTER_INFO_SYMBOL};
use crate::error::{Error, Result, TableContext};

/// Extracts every filter definition.
///
/// The bound names the highest filter id, so `bound + 1` rows are read.
pub fn extract_filters<I>(image: &I, options: &ExtractOptions) -> Result<Vec<FilterInfo>>
where
    I: SandboxImage + ?Sized,
{
    let base = image.find_symbol_address(FILTER_INFO_SYMBOL)?;
    let last_id = options.filter_bound.row_count(Table::Filter)?;
    let rows = last_id
        .checked_add(1)
        .ok_or_else(|| Error::InvalidTableLayout {
            table: Table::Filter,
            reason: format!("highest filter id {last_id} leaves no room for a row count"),
        })?;

    debug!("{} at {:#x}, {} rows", FILTER_INFO_SYMBOL, base, rows);

    read_records::<RawFilterInfo, _>(image, Table::Filter, base, rows)?
        .iter()
        .enumerate()
        .map(|(id, raw)| decode_filter(image, id, raw, options.chain_limits))
        .collect()
}

fn decode_filter<I>(image: &I, id: usize, raw: &RawFilterInfo, limits: ChainLimits) -> Result<FilterInfo>
where
    I: SandboxImage + ?Sized,
{
    let mut filter = FilterInfo {
        id,
        data_type: raw.data_type,
        namespace: raw.namespace,
        side_effects: raw.side_effects,
        dependency: raw.dependency,
        ..Default::default()
    };

    if raw.name_addr != 0 {
        filter.name = image
            .read_cstring(image.slide(raw.name_addr))
            .in_table(Table::Filter, id, "name")?;
    }
    if raw.category_addr != 0 {
        filter.category = image
            .read_cstring(image.slide(raw.category_addr))
            .in_table(Table::Filter, id, "category")?;
    }
    filter.aliases =
        walk_alias_chain(image, raw.aliases_addr, limits).in_table(Table::Filter, id, "aliases")?;

    Ok(filter)
}
