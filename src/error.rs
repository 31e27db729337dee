//! Error types for HAPI
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

use crate::protocol::ResponseCode;

/// Result type alias using HapiError
pub type Result<T> = std::result::Result<T, HapiError>;

/// Unified error type for HAPI operations
#[derive(Debug, Error)]
pub enum HapiError {
    // -------------------------------------------------------------------------
    // Transport Errors
    // -------------------------------------------------------------------------
    #[error("Queue address not found: {0:?}")]
    NotFoundQueueAddress(String),

    #[error("Broker unavailable: {0}")]
    UnavailableBroker(String),

    #[error("Broker connection closed")]
    Disconnected,

    #[error("Transport error: {0}")]
    Transport(String),

    // -------------------------------------------------------------------------
    // Protocol Structure Errors
    // -------------------------------------------------------------------------
    #[error("Short buffer: need {need} bytes, got {got} ({context})")]
    ShortBuffer {
        need: usize,
        got: usize,
        context: &'static str,
    },

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Unknown code: {0}")]
    UnknownCode(String),

    #[error("Invalid argument: {0}")]
    InvalidArg(String),

    #[error("Unexpected sequence id: {0}")]
    UnexpectedSequenceId(u32),

    #[error("Malformed table: {0}")]
    MalformedTable(String),

    // -------------------------------------------------------------------------
    // Session Errors
    // -------------------------------------------------------------------------
    #[error("Handshake timed out after {0} ms")]
    HandshakeTimeout(u64),

    #[error("Session is not initiated")]
    NotInitiated,

    #[error("Session destructed while a reply was outstanding")]
    Destructed,

    #[error("No command is being handled on this thread")]
    NoMessagingContext,

    #[error("Peer replied with error code {0:?}")]
    ErrorReply(ResponseCode),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl HapiError {
    pub(crate) fn short_buffer(need: usize, got: usize, context: &'static str) -> Self {
        HapiError::ShortBuffer { need, got, context }
    }

    /// Response code used when this error is reported back to the peer.
    pub fn response_code(&self) -> ResponseCode {
        match self {
            HapiError::ShortBuffer { .. } | HapiError::InvalidHeader(_) => {
                ResponseCode::InvalidHeader
            }
            HapiError::UnknownCode(_) => ResponseCode::UnknownCode,
            HapiError::UnexpectedSequenceId(_) => ResponseCode::UnexpectedSequenceId,
            HapiError::Destructed => ResponseCode::ErrDestructed,
            HapiError::ErrorReply(code) => *code,
            _ => ResponseCode::InvalidArg,
        }
    }

    /// True for errors raised while decoding peer-supplied bytes.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            HapiError::ShortBuffer { .. }
                | HapiError::InvalidHeader(_)
                | HapiError::UnknownCode(_)
                | HapiError::InvalidArg(_)
                | HapiError::UnexpectedSequenceId(_)
                | HapiError::MalformedTable(_)
        )
    }
}
