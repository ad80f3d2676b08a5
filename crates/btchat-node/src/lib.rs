//! btchat-node library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.
//!
//! # What does btchat-node do?
//!
//! It is the session engine of a two-peer radio chat:
//!
//! 1. Keeps deduplicated lists of scanned and paired devices.
//! 2. Starts and stops scanning on the radio.
//! 3. Either listens for one inbound peer or connects to a paired peer, both
//!    bound to the same service identifier.
//! 4. Reads the stream one frame per read, decodes `<sender>#<text>`, and
//!    publishes the messages; writes local messages back.
//! 5. Tears the session down on error, cancellation, or request, always
//!    through the same routine.

/// Application layer: registries, discovery, and chat view state.
pub mod application;

/// Infrastructure layer: radio boundary, session engine, and configuration.
pub mod infrastructure;
