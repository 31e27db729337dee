//! Item table decoder
//!
//! Each function consumes from the front of a cursor and advances it only
//! on success. Declared counts and lengths must match the bytes exactly.

use bytes::Buf;

use crate::error::{HapiError, Result};
use crate::protocol::ensure_len;

use super::{
    ItemData, ItemTable, ItemType, ItemValue, TableSink, GROUP_HEADER_SIZE, ITEM_FLAG_NULL,
    ITEM_HEADER_SIZE, TABLE_HEADER_SIZE,
};

fn need(src: &[u8], n: usize, context: &'static str) -> Result<()> {
    ensure_len(src, n, context).map_err(|e| HapiError::MalformedTable(e.to_string()))
}

/// Reads a table/group header and returns `(count, body, rest)` where `body`
/// spans exactly the declared length minus the header.
fn read_sized<'a>(
    src: &'a [u8],
    header_size: usize,
    context: &'static str,
) -> Result<(usize, &'a [u8], &'a [u8])> {
    need(src, header_size, context)?;
    let mut header = &src[..header_size];
    let _flags = header.get_u16_le();
    let count = header.get_u32_le() as usize;
    let length = header.get_u32_le() as usize;
    if length < header_size {
        return Err(HapiError::MalformedTable(format!(
            "{} length {} is smaller than its header",
            context, length
        )));
    }
    need(src, length, context)?;
    Ok((count, &src[header_size..length], &src[length..]))
}

/// Decode one table from `cursor` into a fresh [`ItemTable`].
pub fn decode_table(cursor: &mut &[u8]) -> Result<ItemTable> {
    let mut table = ItemTable::new();
    decode_table_into(cursor, &mut table)?;
    Ok(table)
}

/// Decode one table from `cursor` into any [`TableSink`].
pub fn decode_table_into<S: TableSink + ?Sized>(cursor: &mut &[u8], sink: &mut S) -> Result<()> {
    let (num_groups, mut body, rest) = read_sized(*cursor, TABLE_HEADER_SIZE, "table")?;
    sink.begin_table(num_groups.min(body.len() / GROUP_HEADER_SIZE));
    for _ in 0..num_groups {
        decode_group(&mut body, sink)?;
    }
    if !body.is_empty() {
        return Err(HapiError::MalformedTable(format!(
            "{} bytes left in table after {} groups",
            body.len(),
            num_groups
        )));
    }
    *cursor = rest;
    Ok(())
}

/// Decode one group from `cursor`, pushing its items into `sink`.
pub fn decode_group<S: TableSink + ?Sized>(cursor: &mut &[u8], sink: &mut S) -> Result<()> {
    let (num_items, mut body, rest) = read_sized(*cursor, GROUP_HEADER_SIZE, "group")?;
    sink.begin_group(num_items.min(body.len() / ITEM_HEADER_SIZE));
    for _ in 0..num_items {
        let item = decode_item(&mut body)?;
        sink.push_item(item);
    }
    if !body.is_empty() {
        return Err(HapiError::MalformedTable(format!(
            "{} bytes left in group after {} items",
            body.len(),
            num_items
        )));
    }
    sink.end_group();
    *cursor = rest;
    Ok(())
}

/// Decode one item from `cursor`.
pub fn decode_item(cursor: &mut &[u8]) -> Result<ItemData> {
    let mut src = *cursor;
    need(src, ITEM_HEADER_SIZE, "item header")?;
    let flags = src.get_u8();
    let item_type = ItemType::try_from(src.get_u8())?;
    let item_id = src.get_u64_le();

    if flags & ITEM_FLAG_NULL != 0 {
        *cursor = src;
        return Ok(ItemData::null(item_id, item_type));
    }

    let value = match item_type {
        ItemType::Bool => {
            need(src, 1, "bool item")?;
            ItemValue::Bool(src.get_u8() != 0)
        }
        ItemType::Int => {
            need(src, 8, "int item")?;
            ItemValue::Int(src.get_i64_le())
        }
        ItemType::UInt64 => {
            need(src, 8, "uint64 item")?;
            ItemValue::UInt64(src.get_u64_le())
        }
        ItemType::Double => {
            need(src, 8, "double item")?;
            ItemValue::Double(src.get_f64_le())
        }
        ItemType::String => {
            need(src, 4, "string length")?;
            let len = src.get_u32_le() as usize;
            let span = len
                .checked_add(1)
                .ok_or_else(|| HapiError::MalformedTable("string length overflow".to_string()))?;
            need(src, span, "string item")?;
            if src[len] != 0 {
                return Err(HapiError::MalformedTable(
                    "string item is not NUL-terminated".to_string(),
                ));
            }
            let text = std::str::from_utf8(&src[..len])
                .map_err(|e| HapiError::MalformedTable(format!("string item: {}", e)))?
                .to_string();
            src.advance(span);
            ItemValue::String(text)
        }
    };
    *cursor = src;
    Ok(ItemData {
        item_id,
        value,
        null: false,
    })
}
