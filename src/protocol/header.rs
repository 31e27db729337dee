//! Message headers
//!
//! ```text
//! Initiation family:  ┌─────────┬──────────────┐
//!                     │ Type(2) │   Key (8)    │
//!                     └─────────┴──────────────┘
//! Command / Response: ┌─────────┬─────────┬──────────┐
//!                     │ Type(2) │ Code(2) │ SeqId(4) │
//!                     └─────────┴─────────┴──────────┘
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{HapiError, Result};

use super::codec::{ensure_len, WireLayout};
use super::message::{CommandCode, MessageType, ResponseCode};

/// Read the two-byte discriminant at the front of any message.
pub fn peek_message_type(buffer: &[u8]) -> Result<MessageType> {
    ensure_len(buffer, 2, "message type")?;
    MessageType::try_from(u16::from_le_bytes([buffer[0], buffer[1]]))
}

/// Handshake packet shared by the four initiation message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitiationPacket {
    pub msg_type: MessageType,
    /// Session-binding token chosen by the server and echoed by the plugin.
    pub key: u64,
}

impl InitiationPacket {
    pub fn new(msg_type: MessageType, key: u64) -> Self {
        Self { msg_type, key }
    }
}

impl WireLayout for InitiationPacket {
    const SIZE: usize = 10;
    const NAME: &'static str = "initiation packet";

    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.msg_type as u16);
        buf.put_u64_le(self.key);
    }

    fn read_from(mut src: &[u8]) -> Result<Self> {
        let msg_type = MessageType::try_from(src.get_u16_le())?;
        if !msg_type.is_initiation() {
            return Err(HapiError::InvalidHeader(format!(
                "{:?} is not an initiation message",
                msg_type
            )));
        }
        Ok(Self {
            msg_type,
            key: src.get_u64_le(),
        })
    }
}

/// Header of a `Command` message
///
/// `code` is kept raw so that an unknown command can still be answered
/// with `UnknownCode` under the sender's sequence id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    pub code: u16,
    pub sequence_id: u32,
}

impl CommandHeader {
    pub fn new(code: CommandCode, sequence_id: u32) -> Self {
        Self {
            code: code.into(),
            sequence_id,
        }
    }

    pub fn command_code(&self) -> Result<CommandCode> {
        CommandCode::try_from(self.code)
    }
}

impl WireLayout for CommandHeader {
    const SIZE: usize = 8;
    const NAME: &'static str = "command header";

    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u16_le(MessageType::Command as u16);
        buf.put_u16_le(self.code);
        buf.put_u32_le(self.sequence_id);
    }

    fn read_from(mut src: &[u8]) -> Result<Self> {
        let msg_type = src.get_u16_le();
        if msg_type != MessageType::Command as u16 {
            return Err(HapiError::InvalidHeader(format!(
                "expected command, got message type {}",
                msg_type
            )));
        }
        Ok(Self {
            code: src.get_u16_le(),
            sequence_id: src.get_u32_le(),
        })
    }
}

/// Header of a `Response` message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub code: u16,
    pub sequence_id: u32,
}

impl ResponseHeader {
    pub fn new(code: ResponseCode, sequence_id: u32) -> Self {
        Self {
            code: code.into(),
            sequence_id,
        }
    }

    pub fn response_code(&self) -> Result<ResponseCode> {
        ResponseCode::try_from(self.code)
    }
}

impl WireLayout for ResponseHeader {
    const SIZE: usize = 8;
    const NAME: &'static str = "response header";

    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u16_le(MessageType::Response as u16);
        buf.put_u16_le(self.code);
        buf.put_u32_le(self.sequence_id);
    }

    fn read_from(mut src: &[u8]) -> Result<Self> {
        let msg_type = src.get_u16_le();
        if msg_type != MessageType::Response as u16 {
            return Err(HapiError::InvalidHeader(format!(
                "expected response, got message type {}",
                msg_type
            )));
        }
        Ok(Self {
            code: src.get_u16_le(),
            sequence_id: src.get_u32_le(),
        })
    }
}

/// Build a complete command message: header followed by `body`.
pub fn build_command(header: &CommandHeader, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(CommandHeader::SIZE + body.len());
    header.write_to(&mut buf);
    buf.put_slice(body);
    buf.freeze()
}

/// Build a complete response message: header followed by `body`.
pub fn build_response(header: &ResponseHeader, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(ResponseHeader::SIZE + body.len());
    header.write_to(&mut buf);
    buf.put_slice(body);
    buf.freeze()
}
