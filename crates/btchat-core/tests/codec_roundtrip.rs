//! Integration tests for the btchat-core codec through the public API.
//!
//! These exercise the crate-root re-exports the way the session engine uses
//! them: encode a local message, hand the bytes to the "remote" side, decode.

use btchat_core::{decode_message, encode_message, ChatMessage, Origin, ProtocolError, ServiceId};
use serde::{Deserialize, Serialize};

/// Encodes `msg` and decodes it back as a remote message.
fn over_the_wire(msg: &ChatMessage) -> ChatMessage {
    let bytes = encode_message(msg).expect("encode must succeed");
    decode_message(&bytes, Origin::Remote).expect("decode must succeed")
}

#[test]
fn test_plain_message_keeps_sender_and_text() {
    let sent = ChatMessage::local("Alice", "Hello");

    let received = over_the_wire(&sent);

    assert_eq!(received.sender_name, "Alice");
    assert_eq!(received.text, "Hello");
    assert_eq!(received.origin, Origin::Remote);
}

#[test]
fn test_empty_text_is_allowed() {
    let received = over_the_wire(&ChatMessage::local("Alice", ""));
    assert_eq!(received.text, "");
}

#[test]
fn test_text_made_only_of_separators_round_trips() {
    let received = over_the_wire(&ChatMessage::local("Alice", "###"));
    assert_eq!(received.text, "###");
}

#[test]
fn test_reversed_convention_frame_is_read_as_sender_first() {
    // A peer using the text-first convention sends "Hello#Alice".  This side
    // reads it sender-first; the mismatch is a protocol version difference.
    let msg = decode_message(b"Hello#Alice", Origin::Remote).unwrap();
    assert_eq!(msg.sender_name, "Hello");
    assert_eq!(msg.text, "Alice");
}

#[test]
fn test_sender_with_separator_never_reaches_the_wire() {
    let err = encode_message(&ChatMessage::local("#admin", "x")).unwrap_err();
    assert!(matches!(err, ProtocolError::SeparatorInSender(_)));
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Section {
    service_uuid: ServiceId,
}

#[test]
fn test_service_id_serializes_as_uuid_string_in_toml() {
    // Arrange
    let section = Section {
        service_uuid: ServiceId::DEFAULT,
    };

    // Act
    let text = toml::to_string(&section).expect("serialize");
    let restored: Section = toml::from_str(&text).expect("deserialize");

    // Assert
    assert!(text.contains("4be62338-e699-462a-9862-246f6ea434d3"));
    assert_eq!(restored, section);
}
