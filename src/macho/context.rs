//! Mach-O load command parsing for cached images.

use std::collections::HashMap;

use zerocopy::FromBytes;

use super::constants::*;
use super::structs::*;
use crate::error::{Error, Result};

// =============================================================================
// Load Command Info
// =============================================================================

/// Parsed load command information.
///
/// The variant names correspond to the load command types. Commands this
/// crate has no use for are kept as `Unknown` so offsets stay accurate.
#[derive(Debug, Clone)]
#[allow(missing_docs)] // Variants are self-documenting via names
pub enum LoadCommandInfo {
    Segment {
        command: SegmentCommand64,
        offset: usize,
    },
    Symtab {
        command: SymtabCommand,
        offset: usize,
    },
    Uuid {
        command: UuidCommand,
        offset: usize,
    },
    SourceVersion {
        command: SourceVersionCommand,
        offset: usize,
    },
    Unknown {
        cmd: u32,
        cmdsize: u32,
        offset: usize,
    },
}

impl LoadCommandInfo {
    /// Returns the load command offset.
    pub fn offset(&self) -> usize {
        match self {
            LoadCommandInfo::Segment { offset, .. }
            | LoadCommandInfo::Symtab { offset, .. }
            | LoadCommandInfo::Uuid { offset, .. }
            | LoadCommandInfo::SourceVersion { offset, .. }
            | LoadCommandInfo::Unknown { offset, .. } => *offset,
        }
    }
}

// =============================================================================
// Mach-O Context
// =============================================================================

/// Parsed header and load commands of one Mach-O image.
///
/// Only the header and load command bytes are held; segment contents stay in
/// the cache and are read through its address resolver.
#[derive(Debug, Clone)]
pub struct MachOContext {
    /// The Mach-O header
    pub header: MachHeader64,
    /// Parsed load commands
    pub load_commands: Vec<LoadCommandInfo>,
    /// Segment lookup by name
    segment_indices: HashMap<String, usize>,
}

impl MachOContext {
    /// Parses the header and load commands from `data`.
    ///
    /// `data` must cover at least the header and `sizeofcmds` bytes.
    pub fn new(data: &[u8]) -> Result<Self> {
        if data.len() < MachHeader64::SIZE {
            return Err(Error::BufferTooSmall {
                needed: MachHeader64::SIZE,
                available: data.len(),
            });
        }

        let header = MachHeader64::read_from_prefix(data)
            .map_err(|_| Error::InvalidMachoMagic(0))?
            .0;

        if !header.is_valid() {
            return Err(Error::InvalidMachoMagic(header.magic));
        }

        let mut ctx = Self {
            header,
            load_commands: Vec::with_capacity(header.ncmds as usize),
            segment_indices: HashMap::new(),
        };

        ctx.parse_load_commands(data)?;

        Ok(ctx)
    }

    /// Parses all load commands.
    fn parse_load_commands(&mut self, data: &[u8]) -> Result<()> {
        let mut offset = MachHeader64::SIZE;
        let end_offset = MachHeader64::SIZE + self.header.sizeofcmds as usize;

        for _ in 0..self.header.ncmds {
            if offset + LoadCommand::SIZE > end_offset || offset + LoadCommand::SIZE > data.len() {
                return Err(Error::LoadCommandOverflow { offset });
            }

            let lc = LoadCommand::read_from_prefix(&data[offset..])
                .map_err(|_| Error::parse(offset, "failed to parse load command"))?
                .0;

            if lc.cmdsize < LoadCommand::SIZE as u32 || offset + lc.cmdsize as usize > data.len() {
                return Err(Error::LoadCommandOverflow { offset });
            }

            let cmd_data = &data[offset..offset + lc.cmdsize as usize];
            let cmd_info = Self::parse_load_command(lc, cmd_data, offset)?;

            if let LoadCommandInfo::Segment { ref command, .. } = cmd_info {
                self.segment_indices
                    .insert(command.name().to_string(), self.load_commands.len());
            }

            self.load_commands.push(cmd_info);
            offset += lc.cmdsize as usize;
        }

        Ok(())
    }

    /// Parses a single load command.
    fn parse_load_command(lc: LoadCommand, data: &[u8], offset: usize) -> Result<LoadCommandInfo> {
        match lc.cmd {
            LC_SEGMENT_64 => {
                let command = SegmentCommand64::read_from_prefix(data)
                    .map_err(|_| Error::parse(offset, "failed to parse segment command"))?
                    .0;
                Ok(LoadCommandInfo::Segment { command, offset })
            }

            LC_SYMTAB => {
                let command = SymtabCommand::read_from_prefix(data)
                    .map_err(|_| Error::parse(offset, "failed to parse symtab command"))?
                    .0;
                Ok(LoadCommandInfo::Symtab { command, offset })
            }

            LC_UUID => {
                let command = UuidCommand::read_from_prefix(data)
                    .map_err(|_| Error::parse(offset, "failed to parse uuid command"))?
                    .0;
                Ok(LoadCommandInfo::Uuid { command, offset })
            }

            LC_SOURCE_VERSION => {
                let command = SourceVersionCommand::read_from_prefix(data)
                    .map_err(|_| Error::parse(offset, "failed to parse source version command"))?
                    .0;
                Ok(LoadCommandInfo::SourceVersion { command, offset })
            }

            cmd => Ok(LoadCommandInfo::Unknown {
                cmd,
                cmdsize: lc.cmdsize,
                offset,
            }),
        }
    }

    /// Returns a segment by name.
    pub fn segment(&self, name: &str) -> Option<&SegmentCommand64> {
        self.segment_indices.get(name).and_then(|&idx| {
            if let LoadCommandInfo::Segment { ref command, .. } = self.load_commands[idx] {
                Some(command)
            } else {
                None
            }
        })
    }

    /// Returns an iterator over all segments.
    pub fn segments(&self) -> impl Iterator<Item = &SegmentCommand64> {
        self.load_commands.iter().filter_map(|lc| {
            if let LoadCommandInfo::Segment { command, .. } = lc {
                Some(command)
            } else {
                None
            }
        })
    }

    /// Returns the __TEXT segment.
    pub fn text_segment(&self) -> Option<&SegmentCommand64> {
        self.segment("__TEXT")
    }

    /// Returns the __LINKEDIT segment.
    pub fn linkedit_segment(&self) -> Option<&SegmentCommand64> {
        self.segment("__LINKEDIT")
    }

    /// Returns the symbol table command.
    pub fn symtab(&self) -> Option<&SymtabCommand> {
        self.load_commands.iter().find_map(|lc| {
            if let LoadCommandInfo::Symtab { command, .. } = lc {
                Some(command)
            } else {
                None
            }
        })
    }

    /// Returns the image UUID.
    pub fn uuid(&self) -> Option<[u8; 16]> {
        self.load_commands.iter().find_map(|lc| {
            if let LoadCommandInfo::Uuid { command, .. } = lc {
                Some(command.uuid)
            } else {
                None
            }
        })
    }

    /// Returns the packed source version.
    pub fn source_version(&self) -> Option<SourceVersion> {
        self.load_commands.iter().find_map(|lc| {
            if let LoadCommandInfo::SourceVersion { command, .. } = lc {
                Some(SourceVersion(command.version))
            } else {
                None
            }
        })
    }

    /// Returns true if the address is within one of this image's segments.
    pub fn contains_addr(&self, addr: u64) -> bool {
        self.segments()
            .any(|seg| addr >= seg.vmaddr && addr < seg.vmaddr + seg.vmsize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::IntoBytes;

    fn create_minimal_macho() -> Vec<u8> {
        let mut data = vec![0u8; 0x200];

        let mut text = SegmentCommand64::default();
        text.set_name("__TEXT");
        text.vmaddr = 0x1_8000_0000;
        text.vmsize = 0x4000;
        text.filesize = 0x4000;

        let version = SourceVersionCommand {
            cmd: LC_SOURCE_VERSION,
            cmdsize: SourceVersionCommand::SIZE as u32,
            version: (613 << 40) | (1 << 30) | (17 << 20),
        };

        let header = MachHeader64 {
            magic: MH_MAGIC_64,
            cputype: CPU_TYPE_ARM64,
            cpusubtype: CPU_SUBTYPE_ARM64E,
            filetype: MH_DYLIB,
            ncmds: 2,
            sizeofcmds: (SegmentCommand64::SIZE + SourceVersionCommand::SIZE) as u32,
            flags: MachOFlags::DYLIB_IN_CACHE.bits(),
            reserved: 0,
        };

        let mut off = 0;
        for chunk in [header.as_bytes(), text.as_bytes(), version.as_bytes()] {
            data[off..off + chunk.len()].copy_from_slice(chunk);
            off += chunk.len();
        }

        data
    }

    #[test]
    fn test_parse_minimal_macho() {
        let data = create_minimal_macho();
        let ctx = MachOContext::new(&data).unwrap();

        assert!(ctx.header.is_valid());
        assert!(ctx.header.is_in_cache());
        assert_eq!(ctx.header.arch_name(), "arm64e");
        assert!(ctx.text_segment().is_some());
        assert!(ctx.linkedit_segment().is_none());
        assert!(ctx.contains_addr(0x1_8000_1000));
        assert_eq!(ctx.source_version().unwrap().to_string(), "613.1.17");
        assert_eq!(ctx.load_commands[1].offset(), MachHeader64::SIZE + SegmentCommand64::SIZE);
    }

    #[test]
    fn test_truncated_load_commands() {
        let data = create_minimal_macho();
        let err = MachOContext::new(&data[..MachHeader64::SIZE + 16]).unwrap_err();
        assert!(matches!(err, Error::LoadCommandOverflow { .. }));
    }

    #[test]
    fn test_bad_magic() {
        let data = vec![0u8; 64];
        assert!(matches!(
            MachOContext::new(&data),
            Err(Error::InvalidMachoMagic(0))
        ));
    }
}
