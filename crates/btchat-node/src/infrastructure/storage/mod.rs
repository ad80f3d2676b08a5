//! Storage infrastructure: configuration file persistence.
//!
//! The `config` sub-module reads the TOML file from the platform config
//! directory (or an explicit path), applies defaults for anything missing,
//! and validates values the session engine cannot work with.

pub mod config;
