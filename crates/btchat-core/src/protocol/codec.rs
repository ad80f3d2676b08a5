//! Text codec for BT-Chat messages.
//!
//! Wire format:
//! ```text
//! <sender_name>#<text>
//! ```
//! UTF-8, no length prefix, no escaping.  The receiver treats the bytes
//! returned by one stream read as exactly one frame, so an encoded message
//! must fit in [`MAX_FRAME_LEN`] bytes.
//!
//! Decoding splits at the **first** separator: everything before it is the
//! sender name, everything after it (including further `#` characters) is the
//! text.  Sender names therefore must not contain the separator.  Peers that
//! put the text before the sender speak a different protocol version and are
//! not detected here.

use thiserror::Error;

use crate::domain::message::{ChatMessage, Origin};

/// Separator between sender name and text.
pub const SEPARATOR: char = '#';

/// Largest frame the receiving side can read in one call.
pub const MAX_FRAME_LEN: usize = 1024;

/// Errors that can occur during message encoding or decoding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The sender name contains the separator and would be split wrongly.
    #[error("sender name {0:?} contains the '#' separator")]
    SeparatorInSender(String),

    /// A received frame has no separator, so sender and text cannot be told apart.
    #[error("frame has no '#' separator ({len} bytes)")]
    MissingSeparator { len: usize },

    /// The encoded frame does not fit in a single read on the receiving side.
    #[error("encoded frame is {len} bytes, limit is {max}")]
    FrameTooLarge { len: usize, max: usize },
}

/// Encodes `msg` as `<sender_name>#<text>` UTF-8 bytes.
///
/// # Errors
///
/// Returns [`ProtocolError::SeparatorInSender`] if the sender name contains
/// `#`, or [`ProtocolError::FrameTooLarge`] if the frame exceeds
/// [`MAX_FRAME_LEN`].
///
/// # Examples
///
/// ```rust
/// use btchat_core::{encode_message, ChatMessage};
///
/// let bytes = encode_message(&ChatMessage::local("Alice", "Hello")).unwrap();
/// assert_eq!(bytes, b"Alice#Hello");
/// ```
pub fn encode_message(msg: &ChatMessage) -> Result<Vec<u8>, ProtocolError> {
    if msg.sender_name.contains(SEPARATOR) {
        return Err(ProtocolError::SeparatorInSender(msg.sender_name.clone()));
    }

    let len = msg.sender_name.len() + SEPARATOR.len_utf8() + msg.text.len();
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }

    let mut buf = Vec::with_capacity(len);
    buf.extend_from_slice(msg.sender_name.as_bytes());
    buf.push(SEPARATOR as u8);
    buf.extend_from_slice(msg.text.as_bytes());
    Ok(buf)
}

/// Decodes one frame into a [`ChatMessage`] with the given origin.
///
/// Invalid UTF-8 sequences are replaced with U+FFFD rather than rejected.
///
/// # Errors
///
/// Returns [`ProtocolError::MissingSeparator`] if the frame contains no `#`.
///
/// # Examples
///
/// ```rust
/// use btchat_core::{decode_message, Origin};
///
/// let msg = decode_message(b"Alice#Hello #1", Origin::Remote).unwrap();
/// assert_eq!(msg.sender_name, "Alice");
/// assert_eq!(msg.text, "Hello #1");
/// ```
pub fn decode_message(bytes: &[u8], origin: Origin) -> Result<ChatMessage, ProtocolError> {
    let frame = String::from_utf8_lossy(bytes);
    let (sender, text) = frame
        .split_once(SEPARATOR)
        .ok_or(ProtocolError::MissingSeparator { len: bytes.len() })?;
    Ok(ChatMessage::new(sender, text, origin))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
