//! Protocol Module
//!
//! Defines the HAPI wire format exchanged between the server and Arm plugins.
//!
//! ## Message Layout
//! ```text
//! ┌──────────┬──────────────────────┬─────────────────────────────┐
//! │ Type (2) │ Type-specific header │        Optional body        │
//! └──────────┴──────────────────────┴─────────────────────────────┘
//! ```
//!
//! ### Message Types
//! - 0: INITIATION          - key (8)
//! - 1: INITIATION_RESPONSE - key (8)
//! - 2: INITIATION_FINISH   - key (8)
//! - 3: INITIATION_REQUEST  - key (8), ignored
//! - 4: COMMAND             - code (2) + sequence id (4) + body
//! - 5: RESPONSE            - code (2) + sequence id (4) + body
//!
//! All integers are little-endian.

mod codec;
mod header;
mod message;
pub mod records;

pub use codec::{
    body_after, decode_body, ensure_len, read_cstring, write_cstring, WireLayout,
};
pub(crate) use codec::{patch_u16_le, patch_u32_le};
pub use header::{
    build_command, build_response, peek_message_type, CommandHeader, InitiationPacket,
    ResponseHeader,
};
pub use message::{CommandCode, MessageType, ResponseCode, SEQ_ID_MAX, SEQ_ID_UNKNOWN};
pub use records::{
    ArmInfo, ArmWorkingStatus, FetchHistoryRequest, LastEventId, MonitoringServerInfo, Record,
    Timestamp,
};
