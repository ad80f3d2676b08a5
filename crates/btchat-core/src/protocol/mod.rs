//! Protocol module containing the text codec and the service identifier.

pub mod codec;
pub mod service;

pub use codec::{decode_message, encode_message, ProtocolError, MAX_FRAME_LEN, SEPARATOR};
pub use service::ServiceId;
