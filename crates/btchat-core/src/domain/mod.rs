//! Domain entities for BT-Chat.
//!
//! Plain value types with no infrastructure dependencies.  Everything here
//! can be constructed and compared in tests without a runtime or a radio.

pub mod device;
pub mod message;
