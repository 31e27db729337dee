//! Command and response bodies
//!
//! Fixed bodies implement [`WireLayout`]. Records with variable string
//! fields implement [`Record`]: a fixed part holding one
//! `{length: u16, offset: u16}` slot per string, followed by the strings
//! themselves in declaration order.
//!
//! ### MonitoringServerInfo (40 fixed bytes)
//! ```text
//! ┌──────────┬─────────┬─────────┬───────────┬───────────┬──────────────────┐
//! │ ServerId │ Type(2) │ Port(2) │ Polling(4)│ Retry(4)  │ 6 string slots   │
//! │   (4)    │         │         │           │           │ (4 bytes each)   │
//! └──────────┴─────────┴─────────┴───────────┴───────────┴──────────────────┘
//! slots: host_name, ip_address, nickname, user_name, password, db_name
//! ```
//!
//! ### ArmInfo (60 fixed bytes)
//! ```text
//! running(2) status(2) stat_update(12) last_success(12) last_failure(12)
//! num_update(8) num_failure(8) failure_comment slot(4)
//! ```

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{HapiError, Result};

use super::codec::{ensure_len, patch_u16_le, read_cstring, write_cstring, WireLayout};

/// A body with variable-length string fields
pub trait Record: Sized {
    /// Size of the fixed part including string slots.
    const FIXED_SIZE: usize;

    /// Append the record (fixed part, then strings) to `buf`.
    fn encode_into(&self, buf: &mut BytesMut) -> Result<()>;

    /// Decode a record whose first byte is `record[0]`.
    fn decode(record: &[u8]) -> Result<Self>;

    fn encode(&self) -> Result<BytesMut> {
        let mut buf = BytesMut::with_capacity(Self::FIXED_SIZE + 64);
        self.encode_into(&mut buf)?;
        Ok(buf)
    }
}

/// Write placeholder slots, append the strings, then patch the slots.
fn write_string_slots(buf: &mut BytesMut, head: usize, slot_base: usize, values: &[&str]) -> Result<()> {
    for (i, value) in values.iter().enumerate() {
        let (offset, length) = write_cstring(buf, head, value)?;
        let slot = head + slot_base + i * 4;
        patch_u16_le(buf, slot, length);
        patch_u16_le(buf, slot + 2, offset);
    }
    Ok(())
}

/// Read a `{length, offset}` slot at `pos` and resolve it.
fn read_slot(record: &[u8], pos: usize) -> Result<String> {
    let mut slot = &record[pos..pos + 4];
    let length = slot.get_u16_le();
    let offset = slot.get_u16_le();
    read_cstring(record, 0, offset, length)
}

// =============================================================================
// Fixed bodies
// =============================================================================

/// Seconds and nanoseconds since the epoch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp {
    pub sec: u64,
    pub nsec: u32,
}

impl Timestamp {
    pub fn new(sec: u64, nsec: u32) -> Self {
        Self { sec, nsec }
    }

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.sec);
        buf.put_u32_le(self.nsec);
    }

    fn get(src: &mut &[u8]) -> Self {
        Self {
            sec: src.get_u64_le(),
            nsec: src.get_u32_le(),
        }
    }
}

impl WireLayout for Timestamp {
    const SIZE: usize = 12;
    const NAME: &'static str = "timestamp";

    fn write_to(&self, buf: &mut BytesMut) {
        self.put(buf);
    }

    fn read_from(mut src: &[u8]) -> Result<Self> {
        Ok(Self::get(&mut src))
    }
}

/// Reply body of `GetLastEventId`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastEventId {
    pub event_id: u64,
}

impl WireLayout for LastEventId {
    const SIZE: usize = 8;
    const NAME: &'static str = "last event id";

    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.event_id);
    }

    fn read_from(mut src: &[u8]) -> Result<Self> {
        Ok(Self {
            event_id: src.get_u64_le(),
        })
    }
}

/// Command body of `ReqFetchHistory`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchHistoryRequest {
    pub item_id: u64,
    pub value_type: u16,
    pub begin: Timestamp,
    pub end: Timestamp,
}

impl WireLayout for FetchHistoryRequest {
    const SIZE: usize = 34;
    const NAME: &'static str = "fetch history request";

    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.item_id);
        buf.put_u16_le(self.value_type);
        self.begin.put(buf);
        self.end.put(buf);
    }

    fn read_from(mut src: &[u8]) -> Result<Self> {
        let item_id = src.get_u64_le();
        let value_type = src.get_u16_le();
        let begin = Timestamp::get(&mut src);
        let end = Timestamp::get(&mut src);
        if end < begin {
            return Err(HapiError::InvalidArg(format!(
                "history range ends ({:?}) before it begins ({:?})",
                end, begin
            )));
        }
        Ok(Self {
            item_id,
            value_type,
            begin,
            end,
        })
    }
}

// =============================================================================
// MonitoringServerInfo
// =============================================================================

/// Connection parameters of the monitoring server a plugin adapts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoringServerInfo {
    pub server_id: u32,
    pub server_type: u16,
    pub port: u16,
    pub polling_interval_sec: u32,
    pub retry_interval_sec: u32,
    pub host_name: String,
    pub ip_address: String,
    pub nickname: String,
    pub user_name: String,
    pub password: String,
    pub db_name: String,
}

impl MonitoringServerInfo {
    const SLOT_BASE: usize = 16;
    const NUM_SLOTS: usize = 6;
}

impl Record for MonitoringServerInfo {
    const FIXED_SIZE: usize = Self::SLOT_BASE + Self::NUM_SLOTS * 4;

    fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
        let head = buf.len();
        buf.put_u32_le(self.server_id);
        buf.put_u16_le(self.server_type);
        buf.put_u16_le(self.port);
        buf.put_u32_le(self.polling_interval_sec);
        buf.put_u32_le(self.retry_interval_sec);
        buf.put_bytes(0, Self::NUM_SLOTS * 4);
        write_string_slots(
            buf,
            head,
            Self::SLOT_BASE,
            &[
                self.host_name.as_str(),
                self.ip_address.as_str(),
                self.nickname.as_str(),
                self.user_name.as_str(),
                self.password.as_str(),
                self.db_name.as_str(),
            ],
        )
    }

    fn decode(record: &[u8]) -> Result<Self> {
        ensure_len(record, Self::FIXED_SIZE, "monitoring server info")?;
        let mut fixed = record;
        let server_id = fixed.get_u32_le();
        let server_type = fixed.get_u16_le();
        let port = fixed.get_u16_le();
        let polling_interval_sec = fixed.get_u32_le();
        let retry_interval_sec = fixed.get_u32_le();
        let slot = |i: usize| read_slot(record, Self::SLOT_BASE + i * 4);
        Ok(Self {
            server_id,
            server_type,
            port,
            polling_interval_sec,
            retry_interval_sec,
            host_name: slot(0)?,
            ip_address: slot(1)?,
            nickname: slot(2)?,
            user_name: slot(3)?,
            password: slot(4)?,
            db_name: slot(5)?,
        })
    }
}

// =============================================================================
// ArmInfo
// =============================================================================

/// Working status of a plugin's polling loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum ArmWorkingStatus {
    #[default]
    Init = 0,
    Ok = 1,
    Failure = 2,
}

impl TryFrom<u16> for ArmWorkingStatus {
    type Error = HapiError;

    fn try_from(raw: u16) -> Result<Self> {
        match raw {
            0 => Ok(ArmWorkingStatus::Init),
            1 => Ok(ArmWorkingStatus::Ok),
            2 => Ok(ArmWorkingStatus::Failure),
            _ => Err(HapiError::InvalidArg(format!("arm status {}", raw))),
        }
    }
}

/// Health record a plugin reports with `SendArmInfo`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArmInfo {
    pub running: bool,
    pub status: ArmWorkingStatus,
    pub stat_update_time: Timestamp,
    pub last_success_time: Timestamp,
    pub last_failure_time: Timestamp,
    pub num_update: u64,
    pub num_failure: u64,
    pub failure_comment: String,
}

impl ArmInfo {
    const SLOT_BASE: usize = 56;
}

impl Record for ArmInfo {
    const FIXED_SIZE: usize = Self::SLOT_BASE + 4;

    fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
        let head = buf.len();
        buf.put_u16_le(self.running as u16);
        buf.put_u16_le(self.status as u16);
        self.stat_update_time.put(buf);
        self.last_success_time.put(buf);
        self.last_failure_time.put(buf);
        buf.put_u64_le(self.num_update);
        buf.put_u64_le(self.num_failure);
        buf.put_bytes(0, 4);
        write_string_slots(buf, head, Self::SLOT_BASE, &[self.failure_comment.as_str()])
    }

    fn decode(record: &[u8]) -> Result<Self> {
        ensure_len(record, Self::FIXED_SIZE, "arm info")?;
        let mut fixed = record;
        let running = fixed.get_u16_le() != 0;
        let status = ArmWorkingStatus::try_from(fixed.get_u16_le())?;
        let stat_update_time = Timestamp::get(&mut fixed);
        let last_success_time = Timestamp::get(&mut fixed);
        let last_failure_time = Timestamp::get(&mut fixed);
        let num_update = fixed.get_u64_le();
        let num_failure = fixed.get_u64_le();
        Ok(Self {
            running,
            status,
            stat_update_time,
            last_success_time,
            last_failure_time,
            num_update,
            num_failure,
            failure_comment: read_slot(record, Self::SLOT_BASE)?,
        })
    }
}
