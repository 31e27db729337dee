//! Item table encoder
//!
//! Tables and groups are written in two phases: the header is reserved with
//! a zero length, the children are appended, and `complete_*` patches the
//! real length once it is known.

use bytes::{BufMut, BytesMut};

use crate::error::{HapiError, Result};
use crate::protocol::patch_u32_le;

use super::{ItemData, ItemValue, TableSource, GROUP_HEADER_SIZE, ITEM_FLAG_NULL, TABLE_HEADER_SIZE};

/// Offset of the length field inside a table or group header
const LENGTH_FIELD: usize = 6;

fn count_u32(count: usize, what: &str) -> Result<u32> {
    u32::try_from(count).map_err(|_| HapiError::InvalidArg(format!("too many {}: {}", what, count)))
}

/// Reserve a table header for `num_groups` groups; returns its position.
pub fn append_table(buf: &mut BytesMut, num_groups: u32) -> usize {
    let index = buf.len();
    buf.put_u16_le(0);
    buf.put_u32_le(num_groups);
    buf.put_u32_le(0);
    index
}

/// Patch the length of the table header at `header_index`.
pub fn complete_table(buf: &mut BytesMut, header_index: usize) -> Result<()> {
    complete(buf, header_index, TABLE_HEADER_SIZE, "table")
}

/// Reserve a group header for `num_items` items; returns its position.
pub fn append_group(buf: &mut BytesMut, num_items: u32) -> usize {
    let index = buf.len();
    buf.put_u16_le(0);
    buf.put_u32_le(num_items);
    buf.put_u32_le(0);
    index
}

/// Patch the length of the group header at `header_index`.
pub fn complete_group(buf: &mut BytesMut, header_index: usize) -> Result<()> {
    complete(buf, header_index, GROUP_HEADER_SIZE, "group")
}

fn complete(buf: &mut BytesMut, header_index: usize, header_size: usize, what: &str) -> Result<()> {
    if header_index + header_size > buf.len() {
        return Err(HapiError::InvalidArg(format!(
            "no {} header at index {}",
            what, header_index
        )));
    }
    let length = buf.len() - header_index;
    let length = u32::try_from(length)
        .map_err(|_| HapiError::InvalidArg(format!("{} of {} bytes is too large", what, length)))?;
    patch_u32_le(buf, header_index + LENGTH_FIELD, length);
    Ok(())
}

/// Append one item: header, then the value unless the item is NULL.
pub fn append_item(buf: &mut BytesMut, item: &ItemData) -> Result<()> {
    let flags = if item.null { ITEM_FLAG_NULL } else { 0 };
    buf.put_u8(flags);
    buf.put_u8(item.item_type() as u8);
    buf.put_u64_le(item.item_id);
    if item.null {
        return Ok(());
    }
    match &item.value {
        ItemValue::Bool(v) => buf.put_u8(*v as u8),
        ItemValue::Int(v) => buf.put_i64_le(*v),
        ItemValue::UInt64(v) => buf.put_u64_le(*v),
        ItemValue::Double(v) => buf.put_f64_le(*v),
        ItemValue::String(s) => {
            buf.put_u32_le(count_u32(s.len(), "string bytes")?);
            buf.put_slice(s.as_bytes());
            buf.put_u8(0);
        }
    }
    Ok(())
}

/// Encode every row of `source` as one table.
pub fn encode_table<S: TableSource + ?Sized>(buf: &mut BytesMut, source: &S) -> Result<()> {
    let num_groups = source.num_groups();
    let table = append_table(buf, count_u32(num_groups, "groups")?);
    for g in 0..num_groups {
        let num_items = source.num_items(g);
        let group = append_group(buf, count_u32(num_items, "items")?);
        for i in 0..num_items {
            append_item(buf, &source.item(g, i))?;
        }
        complete_group(buf, group)?;
    }
    complete_table(buf, table)
}
