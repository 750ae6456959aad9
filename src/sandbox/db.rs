//! Snapshots of the three tables and the reference database.
//!
//! A snapshot is stored as gzip-compressed JSON. One snapshot can be loaded
//! per process as the reference database: operand decoding of compiled
//! profiles needs the filter table of the library version that compiled
//! them, and that version is not always the one in the cache at hand.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use super::types::{FilterInfo, ModifierInfo, OperationInfo};
use crate::error::{Error, Result};

/// gzip member magic.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// The decoded operation, filter and modifier tables of one library.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibSandboxSnapshot {
    /// Operations, indexed by id
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub operations: Vec<OperationInfo>,
    /// Filters, indexed by id
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<FilterInfo>,
    /// Modifiers, indexed by id
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub modifiers: Vec<ModifierInfo>,
}

impl LibSandboxSnapshot {
    /// Decodes a gzip-compressed JSON snapshot.
    pub fn from_gzip_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_reader(GzDecoder::new(bytes))?)
    }

    /// Encodes the snapshot as gzip-compressed JSON.
    pub fn to_gzip_json(&self) -> Result<Vec<u8>> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        serde_json::to_writer(&mut enc, self)?;
        Ok(enc.finish()?)
    }

    /// Decodes a snapshot that may or may not be gzip-compressed.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.starts_with(&GZIP_MAGIC) {
            Self::from_gzip_json(bytes)
        } else {
            Ok(serde_json::from_slice(bytes)?)
        }
    }

    /// Reads a snapshot from `reader`, compressed or not.
    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        Self::from_bytes(&bytes)
    }

    /// Writes the snapshot to `writer` as JSON, gzip-compressed if asked.
    pub fn write_to<W: Write>(&self, mut writer: W, gzip: bool, pretty: bool) -> Result<()> {
        if gzip {
            writer.write_all(&self.to_gzip_json()?)?;
        } else if pretty {
            serde_json::to_writer_pretty(&mut writer, self)?;
        } else {
            serde_json::to_writer(&mut writer, self)?;
        }
        Ok(())
    }

    /// Returns the filter with id `id`.
    pub fn filter(&self, id: usize) -> Result<&FilterInfo> {
        self.filters.get(id).ok_or(Error::InvalidFilterId(id))
    }

    /// Returns the modifier with id `id`.
    pub fn modifier(&self, id: usize) -> Result<&ModifierInfo> {
        self.modifiers.get(id).ok_or(Error::InvalidModifierId(id))
    }

    /// Returns the operation with id `id`.
    pub fn operation(&self, id: usize) -> Result<&OperationInfo> {
        self.operations.get(id).ok_or(Error::InvalidOperationId(id))
    }

    /// Returns the operation named `name`.
    pub fn operation_by_name(&self, name: &str) -> Option<&OperationInfo> {
        self.operations.iter().find(|op| op.name == name)
    }
}

// =============================================================================
// Reference Database
// =============================================================================

/// The process-wide reference database.
///
/// Installed at most once; readers afterwards share it without locking.
pub mod reference {
    use std::sync::OnceLock;

    use tracing::info;

    use super::LibSandboxSnapshot;
    use crate::error::{Error, Result};

    static REFERENCE: OnceLock<LibSandboxSnapshot> = OnceLock::new();

    /// Decodes `bytes` and installs the result as the reference database.
    ///
    /// Fails with [`Error::ReferenceAlreadyLoaded`] on a second call, even if
    /// the bytes are identical.
    pub fn install(bytes: &[u8]) -> Result<&'static LibSandboxSnapshot> {
        let snapshot = LibSandboxSnapshot::from_bytes(bytes)?;
        info!(
            "Loaded reference database: {} operations, {} filters, {} modifiers",
            snapshot.operations.len(),
            snapshot.filters.len(),
            snapshot.modifiers.len()
        );

        REFERENCE
            .set(snapshot)
            .map_err(|_| Error::ReferenceAlreadyLoaded)?;
        get()
    }

    /// Returns the reference database.
    pub fn get() -> Result<&'static LibSandboxSnapshot> {
        REFERENCE.get().ok_or(Error::ReferenceNotLoaded)
    }
}

// =============================================================================
// Diff
// =============================================================================

/// Ids that differ between two versions of one table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TableDiff {
    /// Ids only in the newer table
    pub added: Vec<usize>,
    /// Ids only in the older table
    pub removed: Vec<usize>,
    /// Ids in both whose entries differ
    pub changed: Vec<usize>,
}

impl TableDiff {
    fn between<T: PartialEq>(old: &[T], new: &[T], id: impl Fn(&T) -> usize) -> Self {
        let old: BTreeMap<usize, &T> = old.iter().map(|e| (id(e), e)).collect();
        let new: BTreeMap<usize, &T> = new.iter().map(|e| (id(e), e)).collect();

        let mut diff = TableDiff::default();
        for (key, entry) in &new {
            match old.get(key) {
                None => diff.added.push(*key),
                Some(prev) if prev != entry => diff.changed.push(*key),
                Some(_) => {}
            }
        }
        diff.removed = old.keys().filter(|k| !new.contains_key(k)).copied().collect();
        diff
    }

    /// Returns true if the tables are identical.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Per-table differences between two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SnapshotDiff {
    /// Operation table differences
    pub operations: TableDiff,
    /// Filter table differences
    pub filters: TableDiff,
    /// Modifier table differences
    pub modifiers: TableDiff,
}

impl SnapshotDiff {
    /// Compares `extracted` against `reference`, keyed by id.
    pub fn between(reference: &LibSandboxSnapshot, extracted: &LibSandboxSnapshot) -> Self {
        Self {
            operations: TableDiff::between(&reference.operations, &extracted.operations, |o| o.id),
            filters: TableDiff::between(&reference.filters, &extracted.filters, |f| f.id),
            modifiers: TableDiff::between(&reference.modifiers, &extracted.modifiers, |m| m.id),
        }
    }

    /// Returns true if the snapshots are identical.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty() && self.filters.is_empty() && self.modifiers.is_empty()
    }
}

impl fmt::Display for SnapshotDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, diff) in [
            ("operations", &self.operations),
            ("filters", &self.filters),
            ("modifiers", &self.modifiers),
        ] {
            writeln!(
                f,
                "{:<12} +{} -{} ~{}",
                name,
                diff.added.len(),
                diff.removed.len(),
                diff.changed.len()
            )?;
        }
        Ok(())
    }
}
