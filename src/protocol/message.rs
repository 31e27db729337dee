//! Message discriminants and code tables
//!
//! Every code is carried on the wire as a little-endian `u16`.

use serde::{Deserialize, Serialize};

use crate::error::{HapiError, Result};

/// Largest sequence id handed out before the counter wraps to zero.
pub const SEQ_ID_MAX: u32 = 0x7FFF_FFFF;

/// Sentinel meaning "no sequence id".
pub const SEQ_ID_UNKNOWN: u32 = 0xFFFF_FFFF;

/// Top-level message discriminant (first two bytes of every message)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    Initiation = 0,
    InitiationResponse = 1,
    InitiationFinish = 2,
    InitiationRequest = 3,
    Command = 4,
    Response = 5,
}

impl MessageType {
    /// True for the four handshake message kinds.
    pub fn is_initiation(self) -> bool {
        matches!(
            self,
            MessageType::Initiation
                | MessageType::InitiationResponse
                | MessageType::InitiationFinish
                | MessageType::InitiationRequest
        )
    }
}

impl TryFrom<u16> for MessageType {
    type Error = HapiError;

    fn try_from(raw: u16) -> Result<Self> {
        Ok(match raw {
            0 => MessageType::Initiation,
            1 => MessageType::InitiationResponse,
            2 => MessageType::InitiationFinish,
            3 => MessageType::InitiationRequest,
            4 => MessageType::Command,
            5 => MessageType::Response,
            _ => {
                return Err(HapiError::UnknownCode(format!(
                    "message type 0x{:04x}",
                    raw
                )))
            }
        })
    }
}

/// Command kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum CommandCode {
    GetMonitoringServerInfo = 0,
    GetTimestampOfLastTrigger = 1,
    GetLastEventId = 2,
    GetTimeOfLastEvent = 3,
    SendUpdatedTriggers = 4,
    SendHosts = 5,
    SendHostGroupElements = 6,
    SendHostGroups = 7,
    SendUpdatedEvents = 8,
    SendArmInfo = 9,
    SendHostParents = 10,
    ReqFetchItems = 11,
    ReqFetchHistory = 12,
    ReqFetchTriggers = 13,
    ReqTerminate = 14,
}

impl CommandCode {
    pub const ALL: [CommandCode; 15] = [
        CommandCode::GetMonitoringServerInfo,
        CommandCode::GetTimestampOfLastTrigger,
        CommandCode::GetLastEventId,
        CommandCode::GetTimeOfLastEvent,
        CommandCode::SendUpdatedTriggers,
        CommandCode::SendHosts,
        CommandCode::SendHostGroupElements,
        CommandCode::SendHostGroups,
        CommandCode::SendUpdatedEvents,
        CommandCode::SendArmInfo,
        CommandCode::SendHostParents,
        CommandCode::ReqFetchItems,
        CommandCode::ReqFetchHistory,
        CommandCode::ReqFetchTriggers,
        CommandCode::ReqTerminate,
    ];
}

impl From<CommandCode> for u16 {
    fn from(code: CommandCode) -> u16 {
        code as u16
    }
}

impl TryFrom<u16> for CommandCode {
    type Error = HapiError;

    fn try_from(raw: u16) -> Result<Self> {
        CommandCode::ALL
            .get(raw as usize)
            .copied()
            .ok_or_else(|| HapiError::UnknownCode(format!("command code {}", raw)))
    }
}

/// Response status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum ResponseCode {
    Ok = 0,
    InvalidHeader = 1,
    UnknownCode = 2,
    InvalidArg = 3,
    UnexpectedSequenceId = 4,
    Items = 5,
    History = 6,
    Triggers = 7,
    /// Sent to pending callbacks when the session is torn down.
    ErrDestructed = 8,
}

impl ResponseCode {
    /// Codes that carry a reply rather than an error.
    pub fn is_success(self) -> bool {
        matches!(
            self,
            ResponseCode::Ok | ResponseCode::Items | ResponseCode::History | ResponseCode::Triggers
        )
    }
}

impl From<ResponseCode> for u16 {
    fn from(code: ResponseCode) -> u16 {
        code as u16
    }
}

impl TryFrom<u16> for ResponseCode {
    type Error = HapiError;

    fn try_from(raw: u16) -> Result<Self> {
        Ok(match raw {
            0 => ResponseCode::Ok,
            1 => ResponseCode::InvalidHeader,
            2 => ResponseCode::UnknownCode,
            3 => ResponseCode::InvalidArg,
            4 => ResponseCode::UnexpectedSequenceId,
            5 => ResponseCode::Items,
            6 => ResponseCode::History,
            7 => ResponseCode::Triggers,
            8 => ResponseCode::ErrDestructed,
            _ => return Err(HapiError::UnknownCode(format!("response code {}", raw))),
        })
    }
}
