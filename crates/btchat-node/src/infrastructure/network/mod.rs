//! Network infrastructure for the chat node.
//!
//! # Sub-modules
//!
//! - **`transfer_channel`** – Wraps one open stream.  Reads are turned into
//!   decoded chat messages (one read, one message); writes are raw bytes that
//!   report success or failure as a `bool`.
//!
//! - **`connection_manager`** – The session state machine.  Opens the
//!   listening endpoint or the outbound stream, relays inbound messages as
//!   events, and owns the single teardown routine that releases the stream
//!   and listener.  Also tracks the platform's link-state notifications.

pub mod connection_manager;
pub mod transfer_channel;
