//! One image inside the cache, seen as a [`SandboxImage`].
//!
//! Memory reads are delegated to the cache; symbols come from the image's
//! own symbol table plus the cache's local symbols for it.
//!
//! [`SandboxImage`]: crate::sandbox::SandboxImage

use std::collections::HashMap;

use tracing::{debug, trace};
use zerocopy::FromBytes;

use super::context::{DyldContext, ImageEntry};
use crate::error::{Error, Result};
use crate::macho::{MachHeader64, MachOContext, Nlist64};
use crate::sandbox::{AddressResolver, Location, SymbolResolver};
use crate::util::cstr_in_window;

/// A cached dylib with its symbol table loaded.
#[derive(Debug)]
pub struct CacheImage<'a> {
    cache: &'a DyldContext,
    entry: &'a ImageEntry,
    macho: MachOContext,
    symbols: HashMap<String, u64>,
}

impl<'a> CacheImage<'a> {
    /// Loads the image matching `name` (see [`DyldContext::find_image`]).
    pub fn new(cache: &'a DyldContext, name: &str) -> Result<Self> {
        let entry = cache.find_image(name).ok_or_else(|| Error::ImageNotFound {
            name: name.to_string(),
        })?;
        Self::from_entry(cache, entry)
    }

    /// Loads the image described by `entry`.
    pub fn from_entry(cache: &'a DyldContext, entry: &'a ImageEntry) -> Result<Self> {
        let macho = Self::parse_macho(cache, entry.address)?;
        let mut image = Self {
            cache,
            entry,
            macho,
            symbols: HashMap::new(),
        };
        for segment in image.macho.segments() {
            trace!("  {}", segment);
        }
        image.load_symtab()?;
        image.load_local_symbols()?;

        debug!(
            "Loaded {} at {:#x}: {} symbols",
            entry.path,
            entry.address,
            image.symbols.len()
        );
        Ok(image)
    }

    /// Parses the header and load commands at `addr`.
    fn parse_macho(cache: &DyldContext, addr: u64) -> Result<MachOContext> {
        let header_bytes = cache.read_at(addr, MachHeader64::SIZE)?;
        let header = MachHeader64::read_from_prefix(header_bytes)
            .map_err(|_| Error::parse(0, "failed to parse Mach-O header"))?
            .0;
        let len = MachHeader64::SIZE + header.sizeofcmds as usize;
        MachOContext::new(cache.read_at(addr, len)?)
    }

    /// Adds the defined symbols of `LC_SYMTAB`.
    ///
    /// The symbol and string tables live in `__LINKEDIT`, which may sit in a
    /// different cache file than the header.
    fn load_symtab(&mut self) -> Result<()> {
        let Some(symtab) = self.macho.symtab().copied() else {
            return Ok(());
        };
        let linkedit = *self
            .macho
            .linkedit_segment()
            .ok_or_else(|| Error::SegmentNotFound {
                name: "__LINKEDIT".into(),
            })?;

        let to_addr = |offset: u32| {
            linkedit
                .file_offset_to_addr(u64::from(offset))
                .ok_or_else(|| Error::parse(offset as usize, "symtab outside __LINKEDIT"))
        };
        let nlists = self.cache.read_at(
            to_addr(symtab.symoff)?,
            symtab.nsyms as usize * Nlist64::SIZE,
        )?;
        let strings = self
            .cache
            .read_at(to_addr(symtab.stroff)?, symtab.strsize as usize)?;

        for chunk in nlists.chunks_exact(Nlist64::SIZE) {
            let Ok((nlist, _)) = Nlist64::read_from_prefix(chunk) else {
                continue;
            };
            if nlist.is_debug() || !nlist.is_defined() {
                continue;
            }
            let Some(name) = strings
                .get(nlist.n_strx as usize..)
                .and_then(|s| cstr_in_window(s, s.len()))
            else {
                continue;
            };
            self.symbols
                .entry(String::from_utf8_lossy(name).into_owned())
                .or_insert(nlist.n_value);
        }
        Ok(())
    }

    /// Adds the local symbols stripped into the cache's side table.
    fn load_local_symbols(&mut self) -> Result<()> {
        let Some(text) = self.macho.text_segment() else {
            return Ok(());
        };
        for (name, addr) in self.cache.local_symbols_for(text.vmaddr)? {
            self.symbols.entry(name).or_insert(addr);
        }
        Ok(())
    }

    /// Returns the parsed load commands.
    pub fn macho(&self) -> &MachOContext {
        &self.macho
    }

    /// Returns the cache's entry for this image.
    pub fn entry(&self) -> &ImageEntry {
        self.entry
    }

    /// Returns the number of symbols known for this image.
    pub fn symbol_count(&self) -> usize {
        self.symbols.len()
    }
}

impl SymbolResolver for CacheImage<'_> {
    fn find_symbol_address(&self, name: &str) -> Result<u64> {
        self.symbols
            .get(name)
            .copied()
            .ok_or_else(|| Error::SymbolNotFound {
                name: name.to_string(),
            })
    }
}

impl AddressResolver for CacheImage<'_> {
    fn resolve(&self, addr: u64) -> Result<Location> {
        self.cache.resolve(addr)
    }

    fn slide(&self, raw: u64) -> u64 {
        self.cache.slide(raw)
    }

    fn bytes_at(&self, loc: Location, max_len: usize) -> Result<&[u8]> {
        self.cache.bytes_at(loc, max_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dyld::fixture::CacheBuilder;
    use crate::sandbox::{extract_snapshot, ExtractOptions, FILTER_INFO_SYMBOL};

    #[test]
    fn test_symbols_from_symtab_and_local_table() {
        let dir = tempfile::tempdir().unwrap();
        let mut builder = CacheBuilder::new(0x1_8000_0000);
        let lib = builder.add_dylib(
            0,
            "/usr/lib/libsandbox.1.dylib",
            &[("_sandbox_init", 0x1_8000_4000)],
            None,
        );
        builder.add_local_symbols(lib, &[(FILTER_INFO_SYMBOL, 0x1_8000_8000)]);
        let path = builder.write(dir.path());

        let cache = DyldContext::open(&path).unwrap();
        let image = CacheImage::new(&cache, "libsandbox.1.dylib").unwrap();

        assert_eq!(image.entry().address, lib);
        assert_eq!(image.macho().text_segment().unwrap().vmaddr, lib);
        assert_eq!(image.symbol_count(), 2);
        assert_eq!(
            image.find_symbol_address("_sandbox_init").unwrap(),
            0x1_8000_4000
        );
        assert_eq!(
            image.find_symbol_address(FILTER_INFO_SYMBOL).unwrap(),
            0x1_8000_8000
        );
        assert!(matches!(
            image.find_symbol_address("_missing"),
            Err(Error::SymbolNotFound { .. })
        ));
    }

    #[test]
    fn test_image_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = CacheBuilder::new(0x1_8000_0000).write(dir.path());
        let cache = DyldContext::open(&path).unwrap();

        assert!(matches!(
            CacheImage::new(&cache, "libsandbox.1.dylib"),
            Err(Error::ImageNotFound { .. })
        ));
    }

    /// Tables live in a subcache, their strings in the main file.
    #[test]
    fn test_extract_snapshot_across_files() {
        use crate::sandbox::{
            RawFilterInfo, RawModifierInfo, RawOperationInfo, MODIFIER_INFO_SYMBOL,
            OPERATION_INFO_SYMBOL, OPERATION_NAMES_SYMBOL,
        };
        use zerocopy::IntoBytes;

        let dir = tempfile::tempdir().unwrap();
        let mut builder = CacheBuilder::new(0x1_8000_0000);
        let sub = builder.add_subcache(0x1_9000_0000);

        let path_name = builder.push(b"path\0");
        let file_cat = builder.push(b"file\0");
        let report = builder.push(b"report\0");
        let default = builder.push(b"default\0");
        let read_data = builder.push(b"file-read-data\0");

        let options = ExtractOptions {
            filter_bound: Box::new(crate::sandbox::FixedBound(1)),
            modifier_bound: Box::new(crate::sandbox::FixedBound(1)),
            ..Default::default()
        };

        let filters = [
            RawFilterInfo {
                name_addr: path_name,
                category_addr: file_cat,
                data_type: 8,
                ..Default::default()
            },
            RawFilterInfo::default(),
        ];
        let filter_addr = builder.push_in(sub, filters.as_bytes());

        let modifiers = [RawModifierInfo {
            name_addr: report,
            action_mask: 0x3,
            ..Default::default()
        }];
        let modifier_addr = builder.push_in(sub, modifiers.as_bytes());

        let names: Vec<u8> = [default, read_data]
            .iter()
            .flat_map(|a| a.to_le_bytes())
            .collect();
        let names_addr = builder.push_in(sub, &names);
        let ops = [
            RawOperationInfo {
                version: 1,
                ..Default::default()
            },
            RawOperationInfo {
                version: 2,
                ..Default::default()
            },
        ];
        let info_addr = builder.push_in(sub, ops.as_bytes());
        assert_eq!(info_addr, names_addr + 16);

        let lib = builder.add_dylib(
            sub,
            "/usr/lib/libsandbox.1.dylib",
            &[
                (FILTER_INFO_SYMBOL, filter_addr),
                (MODIFIER_INFO_SYMBOL, modifier_addr),
                (OPERATION_NAMES_SYMBOL, names_addr),
                (OPERATION_INFO_SYMBOL, info_addr),
            ],
            None,
        );
        let path = builder.write(dir.path());

        let cache = DyldContext::open(&path).unwrap();
        let image = CacheImage::new(&cache, "libsandbox").unwrap();
        assert_eq!(image.entry().address, lib);
        assert_eq!(image.entry().subcache_index, 1);

        let snapshot = extract_snapshot(&image, &options).unwrap();
        assert_eq!(snapshot.filters.len(), 2);
        assert_eq!(snapshot.filters[0].name, "path");
        assert_eq!(snapshot.filters[0].category, "file");
        assert_eq!(snapshot.filters[1].id, 1);
        assert!(snapshot.filters[1].name.is_empty());

        assert_eq!(snapshot.modifiers.len(), 1);
        assert_eq!(snapshot.modifiers[0].name, "report");

        let names: Vec<&str> = snapshot.operations.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, ["default", "file-read-data"]);
        assert_eq!(snapshot.operations[1].version, 2);
    }
}
