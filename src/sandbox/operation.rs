//! `_operation_names` / `_operation_info` extraction.
//!
//! The operation count is not stored anywhere. `_operation_names` is laid
//! out directly before `_operation_info`, so the distance between the two
//! symbols divided by the pointer size gives it.

use tracing::debug;

use super::reader::read_records;
use super::resolver::{SandboxImage, POINTER_SIZE};
use super::types::{OperationInfo, RawOperationInfo};
use super::walker::{walk_flat_pointer_table, walk_sentinel_pointers};
use super::{ExtractOptions, Table, OPERATION_INFO_SYMBOL, OPERATION_NAMES_SYMBOL};
use crate::error::{Error, Result, TableContext};

/// Returns the number of operations implied by the two symbol addresses.
fn operation_count(names_addr: u64, info_addr: u64) -> Result<usize> {
    let span = info_addr
        .checked_sub(names_addr)
        .ok_or_else(|| Error::InvalidTableLayout {
            table: Table::OperationNames,
            reason: format!(
                "{OPERATION_INFO_SYMBOL} ({info_addr:#x}) precedes {OPERATION_NAMES_SYMBOL} ({names_addr:#x})"
            ),
        })?;
    Ok((span / POINTER_SIZE as u64) as usize)
}

/// Extracts every operation definition.
pub fn extract_operations<I>(image: &I, options: &ExtractOptions) -> Result<Vec<OperationInfo>>
where
    I: SandboxImage + ?Sized,
{
    let names_addr = image.find_symbol_address(OPERATION_NAMES_SYMBOL)?;
    let info_addr = image.find_symbol_address(OPERATION_INFO_SYMBOL)?;
    let count = operation_count(names_addr, info_addr)?;

    debug!(
        "{} at {:#x}, {} at {:#x}, {} operations",
        OPERATION_NAMES_SYMBOL, names_addr, OPERATION_INFO_SYMBOL, info_addr, count
    );

    let names = walk_flat_pointer_table(image, Table::OperationNames, names_addr, count)?;
    let rows = read_records::<RawOperationInfo, _>(image, Table::Operation, info_addr, count)?;

    let mut operations = Vec::with_capacity(count);
    for (id, (name, raw)) in names.into_iter().zip(rows.iter()).enumerate() {
        let categories = walk_sentinel_pointers(
            image,
            Table::Categories,
            raw.categories_addr,
            options.chain_limits,
        )
        .in_table(Table::Operation, id, "categories")?;

        let modifiers = walk_sentinel_pointers(
            image,
            Table::OperationModifiers,
            raw.modifiers_addr,
            options.chain_limits,
        )
        .in_table(Table::Operation, id, "modifiers")?;

        let unknown1 = if raw.unknown_addr != 0 {
            Some(
                image
                    .read_u32(image.slide(raw.unknown_addr))
                    .in_table(Table::Operation, id, "unknown1")?,
            )
        } else {
            None
        };

        operations.push(OperationInfo {
            id,
            name,
            categories,
            modifiers,
            version: raw.version,
            jump_target_operation: raw.jump_target_operation,
            unknown1,
            unknown2: raw.unknown2,
        });
    }

    Ok(operations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::testing::MemoryImage;
    use zerocopy::IntoBytes;

    fn build(img: &mut MemoryImage, ops: &[(&str, RawOperationInfo)]) {
        let name_addrs: Vec<u64> = ops.iter().map(|(n, _)| img.push_cstr(n)).collect();
        let names = img.push_pointers(&name_addrs);
        let rows: Vec<RawOperationInfo> = ops.iter().map(|(_, r)| *r).collect();
        let info = img.push_bytes(rows.as_slice().as_bytes());

        img.define_symbol(OPERATION_NAMES_SYMBOL, names);
        img.define_symbol(OPERATION_INFO_SYMBOL, info);
    }

    #[test]
    fn test_operation_count() {
        assert_eq!(operation_count(0x1000, 0x1000 + 8 * 190).unwrap(), 190);
        assert_eq!(operation_count(0x1000, 0x1000).unwrap(), 0);
        assert!(matches!(
            operation_count(0x2000, 0x1000),
            Err(Error::InvalidTableLayout { .. })
        ));
    }

    #[test]
    fn test_extract_operations() {
        let mut img = MemoryImage::new(0x1_8800_0000);
        let file = img.push_cstr("file");
        let report = img.push_cstr("report");
        let no_report = img.push_cstr("no-report");
        let cats = img.push_pointers(&[file, 0]);
        let mods = img.push_pointers(&[report, no_report, 0]);
        let aux = img.push_bytes(&7u32.to_le_bytes());

        build(
            &mut img,
            &[
                (
                    "default",
                    RawOperationInfo {
                        version: 1,
                        unknown2: 0xFEED,
                        ..Default::default()
                    },
                ),
                (
                    "file-read-data",
                    RawOperationInfo {
                        version: 1,
                        jump_target_operation: 0,
                        categories_addr: MemoryImage::encode(cats),
                        modifiers_addr: MemoryImage::encode(mods),
                        unknown_addr: MemoryImage::encode(aux),
                        ..Default::default()
                    },
                ),
            ],
        );

        let ops = extract_operations(&img, &ExtractOptions::default()).unwrap();
        assert_eq!(ops.len(), 2);

        assert_eq!(ops[0].name, "default");
        assert!(ops[0].categories.is_empty());
        assert_eq!(ops[0].unknown1, None);
        assert_eq!(ops[0].unknown2, 0xFEED);

        assert_eq!(ops[1].id, 1);
        assert_eq!(ops[1].categories, ["file"]);
        assert_eq!(ops[1].modifiers, ["report", "no-report"]);
        assert_eq!(ops[1].unknown1, Some(7));
    }

    #[test]
    fn test_unmapped_modifier_list() {
        let mut img = MemoryImage::new(0x1_8800_0000);
        build(
            &mut img,
            &[(
                "default",
                RawOperationInfo {
                    modifiers_addr: MemoryImage::encode(0x20),
                    ..Default::default()
                },
            )],
        );

        let err = extract_operations(&img, &ExtractOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            Error::Table {
                table: Table::Operation,
                index: 0,
                field: "modifiers",
                ..
            }
        ));
    }
}
