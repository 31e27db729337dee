//! Item Table Module
//!
//! Generic, schema-less row sets carried as command and reply bodies.
//!
//! ## Wire Format
//! ```text
//! Table: ┌──────────┬──────────────┬────────────┐
//!        │ Flags(2) │ NumGroups(4) │ Length(4)  │ + groups
//!        └──────────┴──────────────┴────────────┘
//! Group: ┌──────────┬──────────────┬────────────┐
//!        │ Flags(2) │ NumItems(4)  │ Length(4)  │ + items
//!        └──────────┴──────────────┴────────────┘
//! Item:  ┌──────────┬──────────┬────────────────┐
//!        │ Flags(1) │ Type(1)  │   ItemId(8)    │ + value
//!        └──────────┴──────────┴────────────────┘
//! ```
//!
//! `Length` counts the structure's own header plus all of its children.
//! Item values: Bool 1 byte, Int/UInt64/Double 8 bytes, String
//! `len (4) + bytes + NUL`. A NULL item (flag bit 0) carries no value bytes.

use std::borrow::Cow;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{HapiError, Result};

mod decoder;
mod encoder;

pub use decoder::{decode_group, decode_item, decode_table, decode_table_into};
pub use encoder::{
    append_group, append_item, append_table, complete_group, complete_table, encode_table,
};

/// Table header size: flags (2) + group count (4) + length (4)
pub const TABLE_HEADER_SIZE: usize = 10;

/// Group header size: flags (2) + item count (4) + length (4)
pub const GROUP_HEADER_SIZE: usize = 10;

/// Item header size: flags (1) + type (1) + item id (8)
pub const ITEM_HEADER_SIZE: usize = 10;

/// Item flag bit marking a NULL value
pub const ITEM_FLAG_NULL: u8 = 0x01;

/// Value type tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ItemType {
    Bool = 0,
    Int = 1,
    UInt64 = 2,
    Double = 3,
    String = 4,
}

impl TryFrom<u8> for ItemType {
    type Error = HapiError;

    fn try_from(raw: u8) -> Result<Self> {
        Ok(match raw {
            0 => ItemType::Bool,
            1 => ItemType::Int,
            2 => ItemType::UInt64,
            3 => ItemType::Double,
            4 => ItemType::String,
            _ => return Err(HapiError::MalformedTable(format!("unknown item type {}", raw))),
        })
    }
}

/// A typed cell value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ItemValue {
    Bool(bool),
    Int(i64),
    UInt64(u64),
    Double(f64),
    String(String),
}

impl ItemValue {
    pub fn item_type(&self) -> ItemType {
        match self {
            ItemValue::Bool(_) => ItemType::Bool,
            ItemValue::Int(_) => ItemType::Int,
            ItemValue::UInt64(_) => ItemType::UInt64,
            ItemValue::Double(_) => ItemType::Double,
            ItemValue::String(_) => ItemType::String,
        }
    }

    /// Zero value of `item_type`, used as the payload of NULL items.
    pub fn default_of(item_type: ItemType) -> Self {
        match item_type {
            ItemType::Bool => ItemValue::Bool(false),
            ItemType::Int => ItemValue::Int(0),
            ItemType::UInt64 => ItemValue::UInt64(0),
            ItemType::Double => ItemValue::Double(0.0),
            ItemType::String => ItemValue::String(String::new()),
        }
    }
}

/// One cell: a value tagged with the id of the column it belongs to
///
/// A NULL cell carries only its type on the wire, so equality ignores
/// whatever payload `value` holds once `null` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemData {
    pub item_id: u64,
    pub value: ItemValue,
    pub null: bool,
}

impl ItemData {
    pub fn new(item_id: u64, value: ItemValue) -> Self {
        Self {
            item_id,
            value,
            null: false,
        }
    }

    /// A NULL cell of the given type.
    pub fn null(item_id: u64, item_type: ItemType) -> Self {
        Self {
            item_id,
            value: ItemValue::default_of(item_type),
            null: true,
        }
    }

    pub fn item_type(&self) -> ItemType {
        self.value.item_type()
    }

    /// The value, or `None` for NULL cells.
    pub fn get(&self) -> Option<&ItemValue> {
        if self.null {
            None
        } else {
            Some(&self.value)
        }
    }
}

impl PartialEq for ItemData {
    fn eq(&self, other: &Self) -> bool {
        if self.item_id != other.item_id || self.null != other.null {
            return false;
        }
        if self.null {
            self.item_type() == other.item_type()
        } else {
            self.value == other.value
        }
    }
}

/// One row
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemGroup {
    pub items: Vec<ItemData>,
}

impl ItemGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: ItemData) {
        self.items.push(item);
    }

    /// First cell carrying `item_id`.
    pub fn find(&self, item_id: u64) -> Option<&ItemData> {
        self.items.iter().find(|i| i.item_id == item_id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl From<Vec<ItemData>> for ItemGroup {
    fn from(items: Vec<ItemData>) -> Self {
        Self { items }
    }
}

/// An ordered set of rows
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemTable {
    pub groups: Vec<ItemGroup>,
}

impl ItemTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, group: impl Into<ItemGroup>) {
        self.groups.push(group.into());
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Encode into a standalone buffer.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        encode_table(&mut buf, self)?;
        Ok(buf.freeze())
    }

    /// Decode a table that must span the whole of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = bytes;
        let table = decode_table(&mut cursor)?;
        if !cursor.is_empty() {
            return Err(HapiError::MalformedTable(format!(
                "{} trailing bytes after table",
                cursor.len()
            )));
        }
        Ok(table)
    }
}

// =============================================================================
// Caller-supplied table abstractions
// =============================================================================

/// Anything that can be read as rows of cells for encoding
pub trait TableSource {
    fn num_groups(&self) -> usize;

    fn num_items(&self, group: usize) -> usize;

    fn item(&self, group: usize, index: usize) -> Cow<'_, ItemData>;
}

/// Anything that can be filled with rows while decoding
pub trait TableSink {
    /// `num_groups_hint` is capped by what the buffer could actually hold.
    fn begin_table(&mut self, _num_groups_hint: usize) {}

    fn begin_group(&mut self, num_items_hint: usize);

    fn push_item(&mut self, item: ItemData);

    fn end_group(&mut self) {}
}

impl TableSource for ItemTable {
    fn num_groups(&self) -> usize {
        self.groups.len()
    }

    fn num_items(&self, group: usize) -> usize {
        self.groups[group].items.len()
    }

    fn item(&self, group: usize, index: usize) -> Cow<'_, ItemData> {
        Cow::Borrowed(&self.groups[group].items[index])
    }
}

impl TableSink for ItemTable {
    fn begin_table(&mut self, num_groups_hint: usize) {
        self.groups.reserve(num_groups_hint);
    }

    fn begin_group(&mut self, num_items_hint: usize) {
        self.groups.push(ItemGroup {
            items: Vec::with_capacity(num_items_hint),
        });
    }

    fn push_item(&mut self, item: ItemData) {
        if let Some(group) = self.groups.last_mut() {
            group.items.push(item);
        }
    }
}
