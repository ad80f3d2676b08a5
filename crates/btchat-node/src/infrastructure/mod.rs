//! Infrastructure layer for the chat node.
//!
//! Contains the adapters that touch the outside world: the radio boundary
//! (and its TCP and in-memory stand-ins), the stream and session engine, and
//! file-system storage for configuration.

pub mod network;
pub mod radio;
pub mod storage;
