//! `_modifier_info` extraction.

use tracing::debug;

use super::reader::read_records;
use super::resolver::SandboxImage;
use super::types::{ModifierInfo, RawModifierInfo};
use super::walker::walk_alias_chain;
use super::{ExtractOptions, Table, MODIFIER_INFO_SYMBOL};
use crate::error::{Result, TableContext};

/// Extracts every modifier definition.
pub fn extract_modifiers<I>(image: &I, options: &ExtractOptions) -> Result<Vec<ModifierInfo>>
where
    I: SandboxImage + ?Sized,
{
    let base = image.find_symbol_address(MODIFIER_INFO_SYMBOL)?;
    let count = options.modifier_bound.row_count(Table::Modifier)?;

    debug!("{} at {:#x}, {} rows", MODIFIER_INFO_SYMBOL, base, count);

    let rows = read_records::<RawModifierInfo, _>(image, Table::Modifier, base, count)?;
    let mut modifiers = Vec::with_capacity(rows.len());

    for (id, raw) in rows.iter().enumerate() {
        let name = if raw.name_addr != 0 {
            image
                .read_cstring(image.slide(raw.name_addr))
                .in_table(Table::Modifier, id, "name")?
        } else {
            String::new()
        };

        let aliases = walk_alias_chain(image, raw.aliases_addr, options.chain_limits)
            .in_table(Table::Modifier, id, "aliases")?;

        modifiers.push(ModifierInfo {
            id,
            name,
            aliases,
            action_mask: raw.action_mask,
            action_flag: raw.action_flag,
            unknown_1: raw.unknown_1,
            unknown_2: raw.unknown_2,
        });
    }

    Ok(modifiers)
}
