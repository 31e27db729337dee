//! Codec Tests
//!
//! Tests for message headers, codes and the shared decode helpers.

use bytes::BytesMut;
use hapi::protocol::{
    body_after, build_command, build_response, decode_body, peek_message_type, read_cstring,
    write_cstring, CommandCode, CommandHeader, InitiationPacket, LastEventId, MessageType,
    ResponseCode, ResponseHeader, WireLayout,
};
use hapi::HapiError;

// =============================================================================
// Header Layout Tests
// =============================================================================

#[test]
fn test_initiation_packet_layout() {
    let packet = InitiationPacket::new(MessageType::InitiationResponse, 0x0102_0304_0506_0708);
    let encoded = packet.encode();

    assert_eq!(&encoded[..], &[1, 0, 8, 7, 6, 5, 4, 3, 2, 1]);
    assert_eq!(InitiationPacket::decode(&encoded).unwrap(), packet);
}

#[test]
fn test_command_header_layout() {
    let header = CommandHeader::new(CommandCode::SendHosts, 7);
    let encoded = header.encode();

    assert_eq!(&encoded[..], &[4, 0, 5, 0, 7, 0, 0, 0]);

    let decoded = CommandHeader::decode(&encoded).unwrap();
    assert_eq!(decoded.command_code().unwrap(), CommandCode::SendHosts);
    assert_eq!(decoded.sequence_id, 7);
}

#[test]
fn test_response_header_layout() {
    let bytes = [5u8, 0, 0, 0, 0x2a, 0, 0, 0x7f];
    let header = ResponseHeader::decode(&bytes).unwrap();

    assert_eq!(header.response_code().unwrap(), ResponseCode::Ok);
    assert_eq!(header.sequence_id, 0x7f00_002a);
    assert_eq!(&header.encode()[..], &bytes);
}

#[test]
fn test_build_messages_prepend_header() {
    let command = build_command(&CommandHeader::new(CommandCode::ReqTerminate, 3), b"xyz");
    assert_eq!(command.len(), CommandHeader::SIZE + 3);
    assert_eq!(peek_message_type(&command).unwrap(), MessageType::Command);
    assert_eq!(body_after::<CommandHeader>(&command).unwrap(), b"xyz");

    let response = build_response(&ResponseHeader::new(ResponseCode::Items, 3), &[]);
    assert_eq!(response.len(), ResponseHeader::SIZE);
    assert_eq!(peek_message_type(&response).unwrap(), MessageType::Response);
}

// =============================================================================
// Header Rejection Tests
// =============================================================================

#[test]
fn test_peek_short_buffer() {
    let err = peek_message_type(&[4]).unwrap_err();
    assert!(matches!(err, HapiError::ShortBuffer { need: 2, got: 1, .. }));
}

#[test]
fn test_peek_unknown_type() {
    let err = peek_message_type(&[9, 0]).unwrap_err();
    assert!(matches!(err, HapiError::UnknownCode(_)));
}

#[test]
fn test_command_header_rejects_response() {
    let bytes = ResponseHeader::new(ResponseCode::Ok, 1).encode();
    let err = CommandHeader::decode(&bytes).unwrap_err();
    assert!(matches!(err, HapiError::InvalidHeader(_)));
}

#[test]
fn test_initiation_rejects_command_type() {
    let mut bytes = vec![4u8, 0];
    bytes.extend_from_slice(&[0; 8]);
    let err = InitiationPacket::decode(&bytes).unwrap_err();
    assert!(matches!(err, HapiError::InvalidHeader(_)));
}

#[test]
fn test_header_truncations_fail() {
    let encoded = CommandHeader::new(CommandCode::GetLastEventId, 99).encode();
    for k in 0..encoded.len() {
        let err = CommandHeader::decode(&encoded[..k]).unwrap_err();
        assert!(matches!(err, HapiError::ShortBuffer { .. }), "k = {}", k);
    }

    let encoded = InitiationPacket::new(MessageType::Initiation, 5).encode();
    for k in 0..encoded.len() {
        assert!(InitiationPacket::decode(&encoded[..k]).is_err(), "k = {}", k);
    }
}

// =============================================================================
// Code Tests
// =============================================================================

#[test]
fn test_command_codes_are_dense() {
    for (i, code) in CommandCode::ALL.iter().enumerate() {
        assert_eq!(u16::from(*code) as usize, i);
        assert_eq!(CommandCode::try_from(i as u16).unwrap(), *code);
    }
    assert!(matches!(
        CommandCode::try_from(CommandCode::ALL.len() as u16),
        Err(HapiError::UnknownCode(_))
    ));
}

#[test]
fn test_response_code_success_set() {
    assert!(ResponseCode::Ok.is_success());
    assert!(ResponseCode::Items.is_success());
    assert!(ResponseCode::History.is_success());
    assert!(ResponseCode::Triggers.is_success());

    assert!(!ResponseCode::InvalidArg.is_success());
    assert!(!ResponseCode::UnexpectedSequenceId.is_success());
    assert!(!ResponseCode::ErrDestructed.is_success());
}

#[test]
fn test_unknown_response_code() {
    let header = ResponseHeader {
        code: 200,
        sequence_id: 1,
    };
    assert!(matches!(header.response_code(), Err(HapiError::UnknownCode(_))));
}

#[test]
fn test_error_to_response_code() {
    assert_eq!(
        HapiError::InvalidHeader("x".into()).response_code(),
        ResponseCode::InvalidHeader
    );
    assert_eq!(
        HapiError::UnknownCode("x".into()).response_code(),
        ResponseCode::UnknownCode
    );
    assert_eq!(
        HapiError::MalformedTable("x".into()).response_code(),
        ResponseCode::InvalidArg
    );
    assert_eq!(HapiError::Destructed.response_code(), ResponseCode::ErrDestructed);
    assert_eq!(
        HapiError::ErrorReply(ResponseCode::Triggers).response_code(),
        ResponseCode::Triggers
    );
}

// =============================================================================
// Body Helper Tests
// =============================================================================

#[test]
fn test_decode_body_after_header() {
    let body = LastEventId { event_id: 1234 }.encode();
    let message = build_response(&ResponseHeader::new(ResponseCode::Ok, 1), &body);

    let decoded: LastEventId = decode_body::<ResponseHeader, LastEventId>(&message, 0).unwrap();
    assert_eq!(decoded.event_id, 1234);
}

#[test]
fn test_decode_body_checks_whole_span() {
    let body = LastEventId { event_id: 1 }.encode();
    let message = build_response(&ResponseHeader::new(ResponseCode::Ok, 1), &body);

    for k in 0..message.len() {
        assert!(decode_body::<ResponseHeader, LastEventId>(&message[..k], 0).is_err());
    }
    // Trailing data announced but missing
    let err = decode_body::<ResponseHeader, LastEventId>(&message, 4).unwrap_err();
    assert!(matches!(err, HapiError::ShortBuffer { .. }));
}

#[test]
fn test_cstring_round_trip() {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&[0xee; 6]);
    let (offset, length) = write_cstring(&mut buf, 2, "zbx1").unwrap();

    assert_eq!(offset, 4);
    assert_eq!(length, 4);
    assert_eq!(&buf[6..], b"zbx1\0");
    assert_eq!(read_cstring(&buf, 2, offset, length).unwrap(), "zbx1");
}

#[test]
fn test_cstring_requires_terminator() {
    let err = read_cstring(b"abcd", 0, 0, 4).unwrap_err();
    assert!(matches!(err, HapiError::ShortBuffer { .. }));

    let err = read_cstring(b"abcdX", 0, 0, 4).unwrap_err();
    assert!(matches!(err, HapiError::InvalidArg(_)));
}

#[test]
fn test_cstring_out_of_range() {
    let err = read_cstring(b"ok\0", 0, 40, 2).unwrap_err();
    assert!(matches!(err, HapiError::ShortBuffer { .. }));
}

#[test]
fn test_cstring_rejects_invalid_utf8() {
    let err = read_cstring(&[0xff, 0xfe, 0], 0, 0, 2).unwrap_err();
    assert!(matches!(err, HapiError::InvalidArg(_)));
}
