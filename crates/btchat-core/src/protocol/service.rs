//! The 128-bit service identifier both peers must agree on.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies the BT-Chat application protocol during connection setup.
///
/// A listener only accepts peers that present the same identifier, so the
/// value must match exactly on both devices.  It is read once from
/// configuration at startup and passed down, never hard-coded at call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(Uuid);

impl ServiceId {
    /// The identifier used when configuration does not override it.
    pub const DEFAULT: ServiceId = ServiceId(Uuid::from_u128(0x4be62338_e699_462a_9862_246f6ea434d3));

    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// The identifier as 16 big-endian bytes, as sent during a handshake.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }
}

impl Default for ServiceId {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl FromStr for ServiceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
