//! Remote radio devices as seen by discovery and pairing.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A remote device identified by its stable radio address.
///
/// Two `Device` values refer to the same peer when their addresses match;
/// the display name is advisory and may be absent or change between scans.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Device {
    /// Stable address string (e.g. `"00:11:22:AA:BB:CC"`).
    pub address: String,
    /// Human-readable name, if the radio stack reported one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Device {
    pub fn new(address: impl Into<String>, name: Option<String>) -> Self {
        Self {
            address: address.into(),
            name,
        }
    }

    /// Returns `true` if `other` has the same address.
    pub fn same_address(&self, other: &Device) -> bool {
        self.address == other.address
    }

    /// The name if known, otherwise the address.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.address)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name} ({})", self.address),
            None => f.write_str(&self.address),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_address_ignores_name() {
        let a = Device::new("AA:BB", Some("phone".to_string()));
        let b = Device::new("AA:BB", None);
        assert!(a.same_address(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn test_display_name_falls_back_to_address() {
        let d = Device::new("AA:BB", None);
        assert_eq!(d.display_name(), "AA:BB");
    }

    #[test]
    fn test_display_includes_name_and_address() {
        let d = Device::new("AA:BB", Some("phone".to_string()));
        assert_eq!(d.to_string(), "phone (AA:BB)");
    }
}
