//! Application layer use cases for the chat node.
//!
//! # Sub-modules
//!
//! - **`device_registry`** – Observable snapshots of scanned and paired
//!   devices.  Scanned devices are deduplicated by address.
//!
//! - **`discovery_controller`** – Starts and stops scans, feeds discovery
//!   results into the registry, and refreshes the paired snapshot.
//!
//! - **`chat_session`** – The user-facing view: merges registry snapshots,
//!   connection state, errors, and the message history into one `ChatState`
//!   and exposes the connect / wait / send / disconnect actions.

pub mod chat_session;
pub mod device_registry;
pub mod discovery_controller;
