//! Dyld shared cache context and file handling.
//!
//! A cache is one main file plus, on newer systems, numbered subcaches and a
//! `.symbols` file. All of them are memory-mapped up front; every virtual
//! address then resolves to exactly one of them through the merged,
//! address-sorted mapping list.

use std::fs::File;
use std::mem::offset_of;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use tracing::{debug, trace, warn};
use zerocopy::{FromBytes, Immutable, KnownLayout};

use super::slide::PointerSlide;
use super::structs::*;
use crate::error::{Error, Result};
use crate::macho::Nlist64;
use crate::sandbox::{AddressResolver, Location};
use crate::util::memchr_null;

// =============================================================================
// Mapping Entry
// =============================================================================

/// A unified mapping entry that works with both basic and extended mapping formats.
#[derive(Debug, Clone)]
pub struct MappingEntry {
    /// Virtual memory address
    pub address: u64,
    /// Size in bytes
    pub size: u64,
    /// File offset
    pub file_offset: u64,
    /// Maximum protection
    pub max_prot: u32,
    /// Initial protection
    pub init_prot: u32,
    /// File offset to slide info (0 if none)
    pub slide_info_offset: u64,
    /// Size of slide info (0 if none)
    pub slide_info_size: u64,
    /// Mapping flags
    pub flags: u64,
    /// Index of the file containing this mapping (0 = main cache)
    pub subcache_index: usize,
}

impl MappingEntry {
    /// Creates a mapping entry from basic mapping info.
    pub fn from_basic(info: &DyldCacheMappingInfo, subcache_index: usize) -> Self {
        Self {
            address: info.address,
            size: info.size,
            file_offset: info.file_offset,
            max_prot: info.max_prot,
            init_prot: info.init_prot,
            slide_info_offset: 0,
            slide_info_size: 0,
            flags: 0,
            subcache_index,
        }
    }

    /// Creates a mapping entry from extended mapping info.
    pub fn from_extended(info: &DyldCacheMappingAndSlideInfo, subcache_index: usize) -> Self {
        Self {
            address: info.address,
            size: info.size,
            file_offset: info.file_offset,
            max_prot: info.max_prot,
            init_prot: info.init_prot,
            slide_info_offset: info.slide_info_file_offset,
            slide_info_size: info.slide_info_file_size,
            flags: info.flags,
            subcache_index,
        }
    }

    /// Returns true if this mapping contains the given virtual address.
    #[inline]
    pub fn contains_addr(&self, addr: u64) -> bool {
        addr >= self.address && addr < self.address + self.size
    }

    /// Converts a virtual address to a file offset.
    #[inline]
    pub fn addr_to_offset(&self, addr: u64) -> u64 {
        self.file_offset + (addr - self.address)
    }

    /// Returns true if this mapping has slide info.
    #[inline]
    pub fn has_slide_info(&self) -> bool {
        self.slide_info_size > 0
    }

    /// Returns the mapping flags.
    #[inline]
    pub fn mapping_flags(&self) -> MappingFlags {
        MappingFlags::from_bits_truncate(self.flags)
    }
}

// =============================================================================
// Image Entry
// =============================================================================

/// Information about a dylib in the cache.
#[derive(Debug, Clone)]
pub struct ImageEntry {
    /// Index in the images array
    pub index: usize,
    /// Virtual address of the Mach-O header
    pub address: u64,
    /// Path of the dylib (e.g., "/usr/lib/libsandbox.1.dylib")
    pub path: String,
    /// Index of the file containing the header
    pub subcache_index: usize,
}

impl ImageEntry {
    /// Returns the basename of the path.
    pub fn basename(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Returns true if the path matches the given filter.
    pub fn matches_filter(&self, filter: &str) -> bool {
        self.path.contains(filter) || self.basename().contains(filter)
    }
}

// =============================================================================
// Subcache Entry
// =============================================================================

/// A loaded subcache or symbols file.
#[derive(Debug)]
pub struct SubcacheFile {
    /// Memory-mapped file data
    pub mmap: Mmap,
    /// Path to the file
    pub path: PathBuf,
    /// UUID of the subcache
    pub uuid: [u8; 16],
    /// VM offset from the main cache
    pub vm_offset: u64,
    /// Parsed header
    pub header: DyldCacheHeader,
}

// =============================================================================
// Dyld Context
// =============================================================================

/// Main context for working with a dyld shared cache.
///
/// Holds every mapped file of the cache and resolves virtual addresses
/// across them.
#[derive(Debug)]
pub struct DyldContext {
    /// Main cache file (memory-mapped)
    pub mmap: Mmap,
    /// Path to the main cache file
    pub path: PathBuf,
    /// Parsed header
    pub header: DyldCacheHeader,
    /// All mappings (including from subcaches), sorted by address
    pub mappings: Vec<MappingEntry>,
    /// All images
    pub images: Vec<ImageEntry>,
    /// Subcache files
    pub subcaches: Vec<SubcacheFile>,
    /// Symbols file (if separate)
    pub symbols_file: Option<SubcacheFile>,
    /// Local symbols info (if available)
    pub local_symbols_info: Option<DyldCacheLocalSymbolsInfo>,
    /// Shared region start address
    pub shared_region_start: u64,
    /// Pointer format of the data mappings
    pub slide: PointerSlide,
}

impl DyldContext {
    /// Opens a dyld shared cache from the given path.
    ///
    /// This will automatically detect and load any subcaches.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mmap = Self::map_file(&path)?;
        let header = Self::parse_header(&mmap)?;
        let mappings = Self::parse_mappings(&mmap, &header, 0)?;

        let mut ctx = Self {
            mmap,
            path: path.clone(),
            header,
            mappings,
            images: Vec::new(),
            subcaches: Vec::new(),
            symbols_file: None,
            local_symbols_info: None,
            shared_region_start: 0,
            slide: PointerSlide::None,
        };

        if ctx
            .header
            .contains_field(offset_of!(DyldCacheHeader, shared_region_start))
        {
            ctx.shared_region_start = ctx.header.shared_region_start;
        }

        ctx.load_subcaches(&path)?;
        ctx.load_symbols_file(&path)?;

        // Address lookups binary-search the mappings.
        ctx.mappings.sort_by_key(|m| m.address);
        for m in &ctx.mappings {
            trace!(
                "Mapping {:#x}+{:#x} in file {} {:?}",
                m.address,
                m.size,
                m.subcache_index,
                m.mapping_flags()
            );
        }

        ctx.images = ctx.parse_images()?;
        ctx.parse_local_symbols()?;

        let slide = PointerSlide::from_mappings(&ctx.mappings, |i| ctx.data_for_subcache(i))?;
        ctx.slide = slide;

        debug!(
            "Opened {} ({}): {} mappings, {} images, {} subcaches",
            path.display(),
            ctx.architecture(),
            ctx.mappings.len(),
            ctx.images.len(),
            ctx.subcaches.len()
        );

        Ok(ctx)
    }

    /// Memory-maps one cache file.
    fn map_file(path: &Path) -> Result<Mmap> {
        let file = File::open(path).map_err(|e| Error::FileOpen {
            path: path.to_path_buf(),
            source: e,
        })?;

        // SAFETY: cache files are treated as read-only for the lifetime of the map.
        unsafe { Mmap::map(&file) }.map_err(|e| Error::MemoryMap {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Parses and validates the cache header.
    fn parse_header(data: &[u8]) -> Result<DyldCacheHeader> {
        if data.len() < std::mem::size_of::<DyldCacheHeader>() {
            return Err(Error::BufferTooSmall {
                needed: std::mem::size_of::<DyldCacheHeader>(),
                available: data.len(),
            });
        }

        let header = DyldCacheHeader::read_from_prefix(data)
            .map_err(|_| Error::parse(0, "failed to parse dyld cache header"))?
            .0;

        if !header.is_valid() {
            return Err(Error::InvalidMagic([
                header.magic[0],
                header.magic[1],
                header.magic[2],
                header.magic[3],
            ]));
        }

        Ok(header)
    }

    /// Parses mapping entries from one cache file.
    fn parse_mappings(
        data: &[u8],
        header: &DyldCacheHeader,
        subcache_index: usize,
    ) -> Result<Vec<MappingEntry>> {
        let use_extended = header
            .contains_field(offset_of!(DyldCacheHeader, mapping_with_slide_offset))
            && header.mapping_with_slide_offset != 0;

        let mut mappings = Vec::new();

        if use_extended {
            let offset = header.mapping_with_slide_offset as usize;
            for i in 0..header.mapping_with_slide_count as usize {
                let entry_offset = offset + i * std::mem::size_of::<DyldCacheMappingAndSlideInfo>();
                let info = data
                    .get(entry_offset..)
                    .and_then(|d| DyldCacheMappingAndSlideInfo::read_from_prefix(d).ok())
                    .ok_or_else(|| Error::parse(entry_offset, "failed to parse extended mapping"))?
                    .0;
                mappings.push(MappingEntry::from_extended(&info, subcache_index));
            }
        } else {
            let offset = header.mapping_offset as usize;
            for i in 0..header.mapping_count as usize {
                let entry_offset = offset + i * std::mem::size_of::<DyldCacheMappingInfo>();
                let info = data
                    .get(entry_offset..)
                    .and_then(|d| DyldCacheMappingInfo::read_from_prefix(d).ok())
                    .ok_or_else(|| Error::parse(entry_offset, "failed to parse mapping"))?
                    .0;
                mappings.push(MappingEntry::from_basic(&info, subcache_index));
            }
        }

        Ok(mappings)
    }

    /// Loads subcache files.
    fn load_subcaches(&mut self, main_path: &Path) -> Result<()> {
        if !self.header.has_subcaches() {
            return Ok(());
        }

        let parent_dir = main_path.parent().unwrap_or(Path::new("."));
        let main_name = main_path.file_name().and_then(|n| n.to_str()).unwrap_or("");

        let count = self.header.sub_cache_array_count as usize;
        let offset = self.header.sub_cache_array_offset as usize;
        let v2 = self.has_v2_subcache_entries();

        let entry_size = if v2 {
            std::mem::size_of::<DyldSubcacheEntry2>()
        } else {
            std::mem::size_of::<DyldSubcacheEntry>()
        };

        for i in 0..count {
            let entry_offset = offset + i * entry_size;
            let entry_data = self
                .mmap
                .get(entry_offset..)
                .ok_or_else(|| Error::parse(entry_offset, "subcache entry out of bounds"))?;

            let (uuid, vm_offset, suffix) = if v2 {
                let entry = DyldSubcacheEntry2::read_from_prefix(entry_data)
                    .map_err(|_| Error::parse(entry_offset, "failed to parse subcache entry v2"))?
                    .0;
                (
                    entry.uuid,
                    entry.cache_vm_offset,
                    entry.suffix_str().to_string(),
                )
            } else {
                let entry = DyldSubcacheEntry::read_from_prefix(entry_data)
                    .map_err(|_| Error::parse(entry_offset, "failed to parse subcache entry"))?
                    .0;
                (entry.uuid, entry.cache_vm_offset, format!(".{}", i + 1))
            };

            let subcache_path = parent_dir.join(format!("{}{}", main_name, suffix));
            self.load_subcache_file(&subcache_path, uuid, vm_offset, i + 1)?;
        }

        Ok(())
    }

    /// Loads a single subcache file.
    fn load_subcache_file(
        &mut self,
        path: &Path,
        expected_uuid: [u8; 16],
        vm_offset: u64,
        subcache_index: usize,
    ) -> Result<()> {
        if !path.exists() {
            return Err(Error::SubcacheNotFound {
                path: path.to_path_buf(),
            });
        }

        let mmap = Self::map_file(path)?;
        let header = Self::parse_header(&mmap)?;

        if header.uuid != expected_uuid {
            return Err(Error::SubcacheUuidMismatch {
                path: path.to_path_buf(),
                expected: uuid_to_string(&expected_uuid),
                actual: uuid_to_string(&header.uuid),
            });
        }

        let subcache_mappings = Self::parse_mappings(&mmap, &header, subcache_index)?;
        trace!(
            "Subcache {} ({}): {} mappings",
            subcache_index,
            path.display(),
            subcache_mappings.len()
        );
        self.mappings.extend(subcache_mappings);

        self.subcaches.push(SubcacheFile {
            mmap,
            path: path.to_path_buf(),
            uuid: header.uuid,
            vm_offset,
            header,
        });

        Ok(())
    }

    /// Loads the symbols file if present.
    fn load_symbols_file(&mut self, main_path: &Path) -> Result<()> {
        if !self.header.has_symbol_file() {
            return Ok(());
        }

        let parent_dir = main_path.parent().unwrap_or(Path::new("."));
        let main_name = main_path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        let symbols_path = parent_dir.join(format!("{}.symbols", main_name));

        if !symbols_path.exists() {
            warn!(
                "Symbols file {} missing, local symbols unavailable",
                symbols_path.display()
            );
            return Ok(());
        }

        let mmap = Self::map_file(&symbols_path)?;
        let header = Self::parse_header(&mmap)?;

        if header.uuid != self.header.symbol_file_uuid {
            return Err(Error::SubcacheUuidMismatch {
                path: symbols_path,
                expected: uuid_to_string(&self.header.symbol_file_uuid),
                actual: uuid_to_string(&header.uuid),
            });
        }

        self.symbols_file = Some(SubcacheFile {
            mmap,
            path: symbols_path,
            uuid: header.uuid,
            vm_offset: 0,
            header,
        });

        Ok(())
    }

    /// Parses the image list.
    fn parse_images(&self) -> Result<Vec<ImageEntry>> {
        let count = self.header.actual_images_count() as usize;
        let offset = self.header.actual_images_offset() as usize;

        let mut images = Vec::with_capacity(count);

        for i in 0..count {
            let entry_offset = offset + i * std::mem::size_of::<DyldCacheImageInfo>();
            let info = self
                .mmap
                .get(entry_offset..)
                .and_then(|d| DyldCacheImageInfo::read_from_prefix(d).ok())
                .ok_or_else(|| Error::parse(entry_offset, "failed to parse image info"))?
                .0;

            let path = self.read_string(info.path_file_offset as usize)?;
            let subcache_index = self
                .mapping_for_addr(info.address)
                .map_or(0, |m| m.subcache_index);

            images.push(ImageEntry {
                index: i,
                address: info.address,
                path,
                subcache_index,
            });
        }

        Ok(images)
    }

    /// Parses local symbols info.
    fn parse_local_symbols(&mut self) -> Result<()> {
        let (Some(data), Some(offset)) = (self.symbols_cache_data(), self.local_symbols_offset())
        else {
            return Ok(());
        };
        let offset = offset as usize;

        let Some(info) = data
            .get(offset..)
            .and_then(|d| DyldCacheLocalSymbolsInfo::read_from_prefix(d).ok())
            .map(|(info, _)| info)
        else {
            warn!("Local symbols info at {:#x} out of bounds", offset);
            return Ok(());
        };

        self.local_symbols_info = Some(info);
        Ok(())
    }

    /// Checks if this cache uses v2 subcache entries.
    fn has_v2_subcache_entries(&self) -> bool {
        if self.header.sub_cache_array_count == 0 {
            return false;
        }

        // V2 entries embed an ASCII suffix starting with '.'
        let offset = self.header.sub_cache_array_offset as usize;
        self.mmap
            .get(offset..)
            .and_then(|d| DyldSubcacheEntry2::read_from_prefix(d).ok())
            .is_some_and(|(entry, _)| entry.file_suffix[0] == b'.')
    }

    /// Reads a null-terminated string at a main cache file offset.
    pub fn read_string(&self, offset: usize) -> Result<String> {
        let bytes = self
            .mmap
            .get(offset..)
            .ok_or_else(|| Error::parse(offset, "string offset out of bounds"))?;
        let end = memchr_null(bytes);
        String::from_utf8(bytes[..end].to_vec())
            .map_err(|_| Error::parse(offset, "invalid UTF-8 string"))
    }

    /// Converts a virtual address to a file offset.
    #[inline]
    pub fn addr_to_offset(&self, addr: u64) -> Option<u64> {
        self.mapping_for_addr(addr).map(|m| m.addr_to_offset(addr))
    }

    /// Returns the mmap data for a given file index.
    #[inline]
    pub fn data_for_subcache(&self, index: usize) -> &[u8] {
        if index == 0 {
            &self.mmap[..]
        } else if let Some(subcache) = self.subcaches.get(index - 1) {
            &subcache.mmap[..]
        } else {
            &[]
        }
    }

    /// Returns the mapping for a given virtual address.
    #[inline]
    pub fn mapping_for_addr(&self, addr: u64) -> Option<&MappingEntry> {
        let idx = self
            .mappings
            .partition_point(|m| m.address + m.size <= addr);
        self.mappings.get(idx).filter(|m| m.contains_addr(addr))
    }

    /// Returns an iterator over all images.
    pub fn iter_images(&self) -> impl Iterator<Item = &ImageEntry> {
        self.images.iter()
    }

    /// Finds an image by path, basename or substring, in that order.
    pub fn find_image(&self, name: &str) -> Option<&ImageEntry> {
        self.images
            .iter()
            .find(|img| img.path == name)
            .or_else(|| self.images.iter().find(|img| img.basename() == name))
            .or_else(|| self.images.iter().find(|img| img.matches_filter(name)))
    }

    /// Returns the number of images in the cache.
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Returns the total size of all cache files.
    pub fn total_size(&self) -> u64 {
        let main_size = self.mmap.len() as u64;
        let subcache_size: u64 = self.subcaches.iter().map(|s| s.mmap.len() as u64).sum();
        let symbols_size = self
            .symbols_file
            .as_ref()
            .map_or(0, |s| s.mmap.len() as u64);
        main_size + subcache_size + symbols_size
    }

    /// Returns the architecture of this cache.
    pub fn architecture(&self) -> &str {
        self.header.architecture()
    }

    /// Returns the data holding local symbols (the `.symbols` file or the main cache).
    pub fn symbols_cache_data(&self) -> Option<&[u8]> {
        if let Some(ref symbols_file) = self.symbols_file {
            if symbols_file.header.local_symbols_offset != 0 {
                return Some(&symbols_file.mmap[..]);
            }
        }

        if self.header.local_symbols_offset != 0 && self.header.local_symbols_size != 0 {
            return Some(&self.mmap[..]);
        }

        None
    }

    /// Returns the local symbols offset in the symbols cache.
    pub fn local_symbols_offset(&self) -> Option<u64> {
        if let Some(ref symbols_file) = self.symbols_file {
            if symbols_file.header.local_symbols_offset != 0 {
                return Some(symbols_file.header.local_symbols_offset);
            }
        }

        if self.header.local_symbols_offset != 0 {
            return Some(self.header.local_symbols_offset);
        }

        None
    }

    /// Returns true if this cache uses 64-bit local symbol entries.
    ///
    /// Caches with a separate symbols file key entries by VM offset from the
    /// shared region start instead of by file offset.
    pub fn uses_64bit_local_symbol_entries(&self) -> bool {
        self.header.has_symbol_file()
    }

    /// Returns the local (non-exported) symbols of the image whose `__TEXT`
    /// segment starts at `text_vmaddr`, as `(name, address)` pairs.
    ///
    /// Returns an empty list when the cache has no local symbols or none for
    /// this image.
    pub fn local_symbols_for(&self, text_vmaddr: u64) -> Result<Vec<(String, u64)>> {
        let (Some(info), Some(data), Some(base)) = (
            self.local_symbols_info,
            self.symbols_cache_data(),
            self.local_symbols_offset(),
        ) else {
            return Ok(Vec::new());
        };
        let base = base as usize;
        let entries_start = base + info.entries_offset as usize;

        let entry = if self.uses_64bit_local_symbol_entries() {
            let key = text_vmaddr.wrapping_sub(self.shared_region_start);
            Self::find_local_symbols_entry::<DyldCacheLocalSymbolsEntry64>(
                data,
                entries_start,
                info.entries_count,
                |e| (e.dylib_offset == key).then_some((e.nlist_start_index, e.nlist_count)),
            )?
        } else {
            let key = self
                .addr_to_offset(text_vmaddr)
                .ok_or_else(|| Error::unmapped(text_vmaddr))?;
            Self::find_local_symbols_entry::<DyldCacheLocalSymbolsEntry>(
                data,
                entries_start,
                info.entries_count,
                |e| {
                    (u64::from(e.dylib_offset) == key)
                        .then_some((e.nlist_start_index, e.nlist_count))
                },
            )?
        };

        let Some((start, count)) = entry else {
            trace!("No local symbols entry for image at {:#x}", text_vmaddr);
            return Ok(Vec::new());
        };

        let nlist_base = base + info.nlist_offset as usize;
        let string_base = base + info.strings_offset as usize;

        let available = data.len().saturating_sub(nlist_base) / Nlist64::SIZE;
        let end = start as usize + count as usize;
        if end > available {
            return Err(Error::parse(
                nlist_base,
                format!("local symbols {start}..{end} run past {available} nlists"),
            ));
        }
        let mut symbols = Vec::with_capacity(count as usize);

        for i in start..start.saturating_add(count) {
            let nlist_offset = nlist_base + i as usize * Nlist64::SIZE;
            let nlist = data
                .get(nlist_offset..)
                .and_then(|d| Nlist64::read_from_prefix(d).ok())
                .ok_or_else(|| Error::parse(nlist_offset, "failed to parse local nlist"))?
                .0;

            if nlist.is_debug() || nlist.n_strx >= info.strings_size {
                continue;
            }

            let name_offset = string_base + nlist.n_strx as usize;
            let Some(bytes) = data.get(name_offset..) else {
                continue;
            };
            let end = memchr_null(bytes);
            symbols.push((
                String::from_utf8_lossy(&bytes[..end]).into_owned(),
                nlist.n_value,
            ));
        }

        Ok(symbols)
    }

    /// Scans the per-dylib local symbol entries for the first match.
    fn find_local_symbols_entry<E>(
        data: &[u8],
        entries_start: usize,
        entries_count: u32,
        matches: impl Fn(&E) -> Option<(u32, u32)>,
    ) -> Result<Option<(u32, u32)>>
    where
        E: FromBytes + KnownLayout + Immutable,
    {
        for i in 0..entries_count as usize {
            let entry_offset = entries_start + i * std::mem::size_of::<E>();
            let Some(entry_data) = data.get(entry_offset..) else {
                break;
            };
            let (entry, _) = E::read_from_prefix(entry_data)
                .map_err(|_| Error::parse(entry_offset, "failed to parse local symbols entry"))?;

            if let Some(found) = matches(&entry) {
                return Ok(Some(found));
            }
        }

        Ok(None)
    }
}

impl AddressResolver for DyldContext {
    fn resolve(&self, addr: u64) -> Result<Location> {
        self.mapping_for_addr(addr)
            .map(|m| Location {
                file: m.subcache_index,
                offset: m.addr_to_offset(addr),
            })
            .ok_or_else(|| Error::unmapped(addr))
    }

    #[inline]
    fn slide(&self, raw: u64) -> u64 {
        self.slide.decode(raw)
    }

    fn bytes_at(&self, loc: Location, max_len: usize) -> Result<&[u8]> {
        let data = self.data_for_subcache(loc.file);
        let start = usize::try_from(loc.offset)
            .ok()
            .filter(|&start| start <= data.len())
            .ok_or(Error::ShortRead {
                file: loc.file,
                offset: loc.offset,
                needed: max_len,
                available: 0,
            })?;
        let end = start.saturating_add(max_len).min(data.len());
        Ok(&data[start..end])
    }
}
