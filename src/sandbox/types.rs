//! Raw table records and their decoded forms.
//!
//! The `Raw*` structs mirror the in-memory C layout and are read with
//! `zerocopy`. The decoded structs own their strings and are what gets
//! serialized into snapshots. Their JSON field names stay stable so a
//! snapshot written today can be read back as a reference database later.

use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{Error, Result};

// =============================================================================
// Raw Records
// =============================================================================

/// One `_filter_info` row.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct RawFilterInfo {
    /// Pointer to the filter name
    pub name_addr: u64,
    /// Pointer to the category name
    pub category_addr: u64,
    /// Operand type tag
    pub data_type: u8,
    /// Namespace the filter lives in
    pub namespace: u8,
    /// Side effect bits
    pub side_effects: u16,
    /// Id of the filter this one depends on
    pub dependency: u32,
    /// Pointer to the first alias record
    pub aliases_addr: u64,
}

/// One alias record; a zero `name_addr` ends the list.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct RawAlias {
    /// Pointer to the alias name
    pub name_addr: u64,
    /// Value the alias stands for
    pub id: u16,
    /// Opaque
    pub unknown: u16,
    /// Padding to 16 bytes
    pub padding: u32,
}

/// One `_modifier_info` row.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct RawModifierInfo {
    /// Pointer to the modifier name
    pub name_addr: u64,
    /// Actions the modifier applies to
    pub action_mask: u32,
    /// Flag set on matching actions
    pub action_flag: u32,
    /// Opaque
    pub unknown_1: u32,
    /// Opaque
    pub unknown_2: u32,
    /// Pointer to the first alias record
    pub aliases_addr: u64,
}

/// One `_operation_info` row.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct RawOperationInfo {
    /// Operation version
    pub version: u32,
    /// Operation evaluated in place of this one
    pub jump_target_operation: u32,
    /// Opaque
    pub unknown2: u64,
    /// Pointer to a zero-terminated array of category name pointers
    pub categories_addr: u64,
    /// Pointer to a zero-terminated array of modifier name pointers
    pub modifiers_addr: u64,
    /// Pointer to an auxiliary u32
    pub unknown_addr: u64,
}

// =============================================================================
// Decoded Records
// =============================================================================

/// A named value accepted by a filter or modifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Alias {
    /// Alias name as written in profiles
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Numeric value
    pub id: u16,
    /// Opaque
    pub unknown: u16,
}

/// A filter definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterInfo {
    /// Row index in `_filter_info`
    pub id: usize,
    /// Filter name, empty for unused rows
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Category the filter belongs to (e.g. "file")
    #[serde(skip_serializing_if = "String::is_empty")]
    pub category: String,
    /// Named operand values
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<Alias>,
    /// Operand type tag, see [`decode_operand`](super::decode_operand)
    pub data_type: u8,
    /// Operand namespace
    pub namespace: u8,
    /// Side effect flags
    pub side_effects: u16,
    /// Id of a filter this one depends on
    pub dependency: u32,
}

/// A modifier definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModifierInfo {
    /// Row index in `_modifier_info`
    pub id: usize,
    /// Modifier name
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Named argument values
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<Alias>,
    /// Actions the modifier may be attached to
    pub action_mask: u32,
    /// Action flag bits
    pub action_flag: u32,
    /// Opaque
    pub unknown_1: u32,
    /// Opaque
    pub unknown_2: u32,
}

/// An operation definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationInfo {
    /// Position in `_operation_names`
    pub id: usize,
    /// Operation name (e.g. "file-read-data")
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Filter categories accepted by the operation
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
    /// Modifiers accepted by the operation
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub modifiers: Vec<String>,
    /// Table version field
    pub version: u32,
    /// Operation id to fall back to
    pub jump_target_operation: u32,
    /// Present only when the auxiliary pointer was non-zero
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unknown1: Option<u32>,
    /// Opaque
    pub unknown2: u64,
}

/// Finds an alias by value.
pub fn find_alias(aliases: &[Alias], id: u16) -> Result<&Alias> {
    aliases
        .iter()
        .find(|a| a.id == id)
        .ok_or(Error::UnknownAlias { id })
}

impl FilterInfo {
    /// Returns the alias with value `id`.
    pub fn alias(&self, id: u16) -> Result<&Alias> {
        find_alias(&self.aliases, id)
    }
}

impl ModifierInfo {
    /// Returns the alias with value `id`.
    pub fn alias(&self, id: u16) -> Result<&Alias> {
        find_alias(&self.aliases, id)
    }
}
