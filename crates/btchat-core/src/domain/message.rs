//! Chat messages exchanged over a session.

use serde::{Deserialize, Serialize};

/// Where a message was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Origin {
    /// Typed on this device and sent to the peer.
    Local,
    /// Decoded from bytes read off the stream.
    Remote,
}

/// A single chat message.
///
/// Created by the codec on decode or by the session engine on local send;
/// never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender_name: String,
    pub text: String,
    pub origin: Origin,
}

impl ChatMessage {
    pub fn new(sender_name: impl Into<String>, text: impl Into<String>, origin: Origin) -> Self {
        Self {
            sender_name: sender_name.into(),
            text: text.into(),
            origin,
        }
    }

    /// Shorthand for a message authored on this device.
    pub fn local(sender_name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(sender_name, text, Origin::Local)
    }

    pub fn is_from_local_user(&self) -> bool {
        self.origin == Origin::Local
    }
}
