//! Synthetic split caches written to disk for tests.
//!
//! Every file maps its whole contents at its base address with a single
//! mapping; the first `HEADER_SPACE` bytes hold the header, the mapping, the
//! subcache array and the image list.

use std::mem::{offset_of, size_of};
use std::path::{Path, PathBuf};

use zerocopy::IntoBytes;

use super::structs::*;
use crate::macho::*;

/// Bytes reserved at the start of every file for headers and tables.
pub(crate) const HEADER_SPACE: usize = 0x1000;

/// File name of the main cache.
pub(crate) const CACHE_NAME: &str = "dyld_shared_cache_arm64e";

const MAPPING_AT: usize = size_of::<DyldCacheHeader>();
const SUBCACHES_AT: usize = MAPPING_AT + 0x40;
const IMAGES_AT: usize = MAPPING_AT + 0x100;

struct FixtureFile {
    base: u64,
    data: Vec<u8>,
}

/// Builds a cache image by image.
pub(crate) struct CacheBuilder {
    files: Vec<FixtureFile>,
    images: Vec<(u64, u64)>,
    local_symbols: Vec<(u64, Vec<(String, u64)>)>,
}

fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

fn uuid_for(file: usize) -> [u8; 16] {
    [0x10 + file as u8; 16]
}

impl CacheBuilder {
    /// Starts a cache whose main file is mapped at `base`.
    pub fn new(base: u64) -> Self {
        Self {
            files: vec![FixtureFile {
                base,
                data: vec![0; HEADER_SPACE],
            }],
            images: Vec::new(),
            local_symbols: Vec::new(),
        }
    }

    /// Adds a subcache mapped at `base` and returns its file index.
    pub fn add_subcache(&mut self, base: u64) -> usize {
        self.files.push(FixtureFile {
            base,
            data: vec![0; HEADER_SPACE],
        });
        self.files.len() - 1
    }

    /// Returns the address the next push into `file` will land at.
    pub fn next_addr(&self, file: usize) -> u64 {
        let f = &self.files[file];
        f.base + f.data.len().next_multiple_of(8) as u64
    }

    /// Appends 8-byte aligned bytes to `file` and returns their address.
    pub fn push_in(&mut self, file: usize, bytes: &[u8]) -> u64 {
        let addr = self.next_addr(file);
        let f = &mut self.files[file];
        f.data.resize((addr - f.base) as usize, 0);
        f.data.extend_from_slice(bytes);
        addr
    }

    /// Appends bytes to the main file.
    pub fn push(&mut self, bytes: &[u8]) -> u64 {
        self.push_in(0, bytes)
    }

    /// Registers an image whose header is at `addr`.
    pub fn add_image(&mut self, path: &str, addr: u64) {
        let mut bytes = path.as_bytes().to_vec();
        bytes.push(0);
        let path_addr = self.push(&bytes);
        self.images.push((addr, path_addr - self.files[0].base));
    }

    /// Registers local symbols for the image whose `__TEXT` starts at `text_addr`.
    pub fn add_local_symbols(&mut self, text_addr: u64, symbols: &[(&str, u64)]) {
        self.local_symbols.push((
            text_addr,
            symbols.iter().map(|(n, v)| (n.to_string(), *v)).collect(),
        ));
    }

    /// Writes a dylib with the given exported symbols into `file`.
    ///
    /// Returns the address of its Mach-O header.
    pub fn add_dylib(
        &mut self,
        file: usize,
        path: &str,
        exports: &[(&str, u64)],
        source_version: Option<u64>,
    ) -> u64 {
        // __LINKEDIT: nlist array followed by the string pool.
        let mut strings = vec![0u8];
        let mut nlists = Vec::new();
        for (name, value) in exports {
            let nlist = Nlist64 {
                n_strx: strings.len() as u32,
                n_type: N_SECT | N_EXT,
                n_sect: 1,
                n_desc: 0,
                n_value: *value,
            };
            nlists.extend_from_slice(nlist.as_bytes());
            strings.extend_from_slice(name.as_bytes());
            strings.push(0);
        }
        let mut linkedit_blob = nlists.clone();
        linkedit_blob.extend_from_slice(&strings);
        let linkedit_addr = self.push_in(file, &linkedit_blob);
        let linkedit_fileoff = linkedit_addr - self.files[file].base;

        let mut linkedit = SegmentCommand64::default();
        linkedit.set_name("__LINKEDIT");
        linkedit.vmaddr = linkedit_addr;
        linkedit.vmsize = linkedit_blob.len() as u64;
        linkedit.fileoff = linkedit_fileoff;
        linkedit.filesize = linkedit_blob.len() as u64;

        let symtab = SymtabCommand {
            cmd: LC_SYMTAB,
            cmdsize: SymtabCommand::SIZE as u32,
            symoff: linkedit_fileoff as u32,
            nsyms: exports.len() as u32,
            stroff: (linkedit_fileoff as usize + nlists.len()) as u32,
            strsize: strings.len() as u32,
        };

        let version = source_version.map(|version| SourceVersionCommand {
            cmd: LC_SOURCE_VERSION,
            cmdsize: SourceVersionCommand::SIZE as u32,
            version,
        });

        let ncmds = 3 + u32::from(version.is_some());
        let sizeofcmds = 2 * SegmentCommand64::SIZE
            + SymtabCommand::SIZE
            + version.map_or(0, |_| SourceVersionCommand::SIZE);
        let total = MachHeader64::SIZE + sizeofcmds;

        let header_addr = self.next_addr(file);
        let mut text = SegmentCommand64::default();
        text.set_name("__TEXT");
        text.vmaddr = header_addr;
        text.vmsize = total as u64;
        text.fileoff = header_addr - self.files[file].base;
        text.filesize = total as u64;

        let header = MachHeader64 {
            magic: MH_MAGIC_64,
            cputype: CPU_TYPE_ARM64,
            cpusubtype: CPU_SUBTYPE_ARM64E,
            filetype: MH_DYLIB,
            ncmds,
            sizeofcmds: sizeofcmds as u32,
            flags: MachOFlags::DYLIB_IN_CACHE.bits(),
            reserved: 0,
        };

        let mut image = Vec::with_capacity(total);
        image.extend_from_slice(header.as_bytes());
        image.extend_from_slice(text.as_bytes());
        image.extend_from_slice(linkedit.as_bytes());
        image.extend_from_slice(symtab.as_bytes());
        if let Some(version) = version {
            image.extend_from_slice(version.as_bytes());
        }

        let addr = self.push_in(file, &image);
        assert_eq!(addr, header_addr);
        self.add_image(path, addr);
        addr
    }

    /// Appends the local symbols side table to the main file.
    fn write_local_symbols(&mut self) {
        if self.local_symbols.is_empty() {
            return;
        }

        let mut nlists = Vec::new();
        let mut strings = vec![0u8];
        let mut entries = Vec::new();

        for (text_addr, symbols) in &self.local_symbols {
            let file = self
                .files
                .iter()
                .find(|f| *text_addr >= f.base && *text_addr < f.base + f.data.len() as u64)
                .expect("local symbols for an unmapped image");
            let start = nlists.len() / Nlist64::SIZE;

            for (name, value) in symbols {
                let nlist = Nlist64 {
                    n_strx: strings.len() as u32,
                    n_type: N_SECT,
                    n_sect: 1,
                    n_desc: 0,
                    n_value: *value,
                };
                nlists.extend_from_slice(nlist.as_bytes());
                strings.extend_from_slice(name.as_bytes());
                strings.push(0);
            }

            let entry = [
                (text_addr - file.base) as u32,
                start as u32,
                symbols.len() as u32,
            ];
            entries.extend_from_slice(entry.as_bytes());
        }

        let info_size = size_of::<DyldCacheLocalSymbolsInfo>();
        let nlist_offset = info_size;
        let strings_offset = nlist_offset + nlists.len();
        let entries_offset = (strings_offset + strings.len()).next_multiple_of(8);

        let mut blob = vec![0u8; entries_offset + entries.len()];
        put_u32(&mut blob, 0, nlist_offset as u32);
        put_u32(&mut blob, 4, (nlists.len() / Nlist64::SIZE) as u32);
        put_u32(&mut blob, 8, strings_offset as u32);
        put_u32(&mut blob, 12, strings.len() as u32);
        put_u32(&mut blob, 16, entries_offset as u32);
        put_u32(&mut blob, 20, self.local_symbols.len() as u32);
        blob[nlist_offset..strings_offset].copy_from_slice(&nlists);
        blob[strings_offset..strings_offset + strings.len()].copy_from_slice(&strings);
        blob[entries_offset..].copy_from_slice(&entries);

        let addr = self.push(&blob);
        let main = &mut self.files[0];
        let offset = addr - main.base;
        put_u64(
            &mut main.data,
            offset_of!(DyldCacheHeader, local_symbols_offset),
            offset,
        );
        put_u64(
            &mut main.data,
            offset_of!(DyldCacheHeader, local_symbols_size),
            blob.len() as u64,
        );
    }

    /// Writes all files into `dir` and returns the main cache path.
    pub fn write(mut self, dir: &Path) -> PathBuf {
        self.write_local_symbols();

        let main_base = self.files[0].base;
        let subcaches: Vec<(u64, [u8; 16])> = (1..self.files.len())
            .map(|i| (self.files[i].base - main_base, uuid_for(i)))
            .collect();
        assert!(IMAGES_AT + self.images.len() * size_of::<DyldCacheImageInfo>() <= HEADER_SPACE);

        for (index, file) in self.files.iter_mut().enumerate() {
            let h = &mut file.data;
            h[..16].copy_from_slice(b"dyld_v1  arm64e\0");
            put_u32(h, offset_of!(DyldCacheHeader, mapping_offset), MAPPING_AT as u32);
            put_u32(h, offset_of!(DyldCacheHeader, mapping_count), 1);
            h[offset_of!(DyldCacheHeader, uuid)..][..16].copy_from_slice(&uuid_for(index));
            put_u64(h, offset_of!(DyldCacheHeader, shared_region_start), main_base);

            let len = h.len() as u64;
            put_u64(h, MAPPING_AT, file.base);
            put_u64(h, MAPPING_AT + 8, len);
            put_u64(h, MAPPING_AT + 16, 0);
            put_u32(h, MAPPING_AT + 24, 1);
            put_u32(h, MAPPING_AT + 28, 1);

            if index != 0 {
                continue;
            }

            put_u32(h, offset_of!(DyldCacheHeader, images_offset), IMAGES_AT as u32);
            put_u32(
                h,
                offset_of!(DyldCacheHeader, images_count),
                self.images.len() as u32,
            );
            for (i, (addr, path_offset)) in self.images.iter().enumerate() {
                let at = IMAGES_AT + i * size_of::<DyldCacheImageInfo>();
                put_u64(h, at, *addr);
                put_u32(h, at + 24, *path_offset as u32);
            }

            put_u32(
                h,
                offset_of!(DyldCacheHeader, sub_cache_array_offset),
                SUBCACHES_AT as u32,
            );
            put_u32(
                h,
                offset_of!(DyldCacheHeader, sub_cache_array_count),
                subcaches.len() as u32,
            );
            for (i, (vm_offset, uuid)) in subcaches.iter().enumerate() {
                let at = SUBCACHES_AT + i * size_of::<DyldSubcacheEntry>();
                h[at..at + 16].copy_from_slice(uuid);
                put_u64(h, at + 16, *vm_offset);
            }
        }

        let main_path = dir.join(CACHE_NAME);
        for (index, file) in self.files.iter().enumerate() {
            let path = if index == 0 {
                main_path.clone()
            } else {
                dir.join(format!("{CACHE_NAME}.{index}"))
            };
            std::fs::write(path, &file.data).expect("write fixture file");
        }

        main_path
    }
}
