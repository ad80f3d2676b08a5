//! # btchat-core
//!
//! Shared library for BT-Chat containing the wire codec, the service
//! identifier both peers agree on, and the domain entities exchanged between
//! the session engine and its callers.
//!
//! It has zero dependencies on OS APIs, radio stacks, or async runtimes.
//!
//! # Architecture overview
//!
//! BT-Chat pairs two devices over a short-range radio link and exchanges text
//! messages across a reliable, ordered byte stream.  One device listens
//! ("server"), the other connects ("client"); after that both sides are
//! symmetric chat peers.
//!
//! - **`protocol`** – How a chat message becomes bytes.  The format is plain
//!   UTF-8 `<sender>#<text>` with no length prefix: one read on the stream is
//!   one message.  Also holds the 128-bit service identifier.
//!
//! - **`domain`** – The `Device` and `ChatMessage` value types.

pub mod domain;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `btchat_core::ChatMessage` instead of `btchat_core::domain::message::ChatMessage`.
pub use domain::device::Device;
pub use domain::message::{ChatMessage, Origin};
pub use protocol::codec::{decode_message, encode_message, ProtocolError, MAX_FRAME_LEN, SEPARATOR};
pub use protocol::service::ServiceId;
