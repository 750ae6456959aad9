//! In-memory images for unit tests.

use std::collections::HashMap;

use crate::dyld::PointerSlide;
use crate::error::{Error, Result};

use super::operand::OperandPool;
use super::resolver::{AddressResolver, Location, SymbolResolver};

/// Chain-delta bits set on every stored pointer; a walker that forgets to
/// slide will chase an unmapped address.
const DELTA_BITS: u64 = 0x0012_0000_0000_0000;

/// A fake multi-file image: each file is mapped contiguously at its own base.
pub(crate) struct MemoryImage {
    files: Vec<(u64, Vec<u8>)>,
    symbols: HashMap<String, u64>,
    slide: PointerSlide,
}

impl MemoryImage {
    /// Creates an image whose first file is mapped at `base`.
    pub fn new(base: u64) -> Self {
        Self {
            files: vec![(base, Vec::new())],
            symbols: HashMap::new(),
            slide: PointerSlide::V2 {
                delta_mask: 0x00FF_0000_0000_0000,
                value_add: 0,
            },
        }
    }

    /// Adds another file mapped at `base` and returns its index.
    pub fn add_file(&mut self, base: u64) -> usize {
        self.files.push((base, Vec::new()));
        self.files.len() - 1
    }

    /// Encodes a virtual address the way the cache stores pointers.
    pub fn encode(addr: u64) -> u64 {
        if addr == 0 {
            0
        } else {
            addr | DELTA_BITS
        }
    }

    /// Appends 8-byte aligned bytes to `file` and returns their address.
    pub fn push_bytes_in(&mut self, file: usize, bytes: &[u8]) -> u64 {
        let (base, data) = &mut self.files[file];
        let pad = (8 - data.len() % 8) % 8;
        data.extend(std::iter::repeat(0xAA).take(pad));
        let addr = *base + data.len() as u64;
        data.extend_from_slice(bytes);
        addr
    }

    /// Appends 8-byte aligned bytes to the first file.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> u64 {
        self.push_bytes_in(0, bytes)
    }

    /// Appends a null-terminated string.
    pub fn push_cstr(&mut self, s: &str) -> u64 {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        self.push_bytes(&bytes)
    }

    /// Appends an array of encoded pointers.
    pub fn push_pointers(&mut self, addrs: &[u64]) -> u64 {
        let bytes: Vec<u8> = addrs
            .iter()
            .flat_map(|&a| Self::encode(a).to_le_bytes())
            .collect();
        self.push_bytes(&bytes)
    }

    /// Defines a symbol.
    pub fn define_symbol(&mut self, name: &str, addr: u64) {
        self.symbols.insert(name.to_string(), addr);
    }
}

impl AddressResolver for MemoryImage {
    fn resolve(&self, addr: u64) -> Result<Location> {
        self.files
            .iter()
            .enumerate()
            .find(|(_, (base, data))| addr >= *base && addr < base + data.len() as u64)
            .map(|(file, (base, _))| Location {
                file,
                offset: addr - base,
            })
            .ok_or(Error::UnmappedAddress { addr })
    }

    fn slide(&self, raw: u64) -> u64 {
        self.slide.decode(raw)
    }

    fn bytes_at(&self, loc: Location, max_len: usize) -> Result<&[u8]> {
        let data = &self.files[loc.file].1;
        let start = (loc.offset as usize).min(data.len());
        let end = start.saturating_add(max_len).min(data.len());
        Ok(&data[start..end])
    }
}

impl SymbolResolver for MemoryImage {
    fn find_symbol_address(&self, name: &str) -> Result<u64> {
        self.symbols
            .get(name)
            .copied()
            .ok_or_else(|| Error::SymbolNotFound {
                name: name.to_string(),
            })
    }
}

/// Operand pools backed by maps.
#[derive(Default)]
pub(crate) struct MemoryPool {
    pub strings: HashMap<u32, String>,
    pub patterns: HashMap<u32, Vec<String>>,
    pub host_ports: HashMap<u32, (u16, u16)>,
}

impl OperandPool for MemoryPool {
    fn string_at(&self, offset: u32) -> Result<String> {
        self.strings
            .get(&offset)
            .cloned()
            .ok_or(Error::OperandOutOfRange { offset })
    }

    fn pattern_at(&self, offset: u32) -> Result<Vec<String>> {
        self.patterns
            .get(&offset)
            .cloned()
            .ok_or(Error::OperandOutOfRange { offset })
    }

    fn host_port_at(&self, offset: u32) -> Result<(u16, u16)> {
        self.host_ports
            .get(&offset)
            .copied()
            .ok_or(Error::OperandOutOfRange { offset })
    }
}
