//! DeviceRegistry: observable snapshots of scanned and paired devices.
//!
//! The registry is the node's in-memory list of every device the radio has
//! reported.  Two independent snapshots are kept:
//!
//! - **scanned** – devices seen during discovery, in first-seen order, at
//!   most once per address.
//! - **paired** – devices bonded with the local adapter, replaced wholesale
//!   each time the radio is asked for its bonded list.
//!
//! Both are published on `tokio::sync::watch` channels so observers always
//! read a consistent snapshot and are woken only on real changes.

use std::sync::Arc;

use btchat_core::Device;
use tokio::sync::watch;
use tracing::debug;

/// Shared handle to the device snapshots.  Clones share state.
#[derive(Clone)]
pub struct DeviceRegistry {
    scanned: Arc<watch::Sender<Vec<Device>>>,
    paired: Arc<watch::Sender<Vec<Device>>>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            scanned: Arc::new(watch::channel(Vec::new()).0),
            paired: Arc::new(watch::channel(Vec::new()).0),
        }
    }

    /// Adds `device` to the scanned snapshot unless its address is already there.
    ///
    /// Returns `true` when the snapshot changed.  Observers are notified only
    /// in that case.
    pub fn record_discovered(&self, device: Device) -> bool {
        self.scanned.send_if_modified(|scanned| {
            if scanned.iter().any(|d| d.same_address(&device)) {
                return false;
            }
            debug!("discovered {device}");
            scanned.push(device);
            true
        })
    }

    /// Replaces the paired snapshot.
    pub fn record_paired(&self, devices: Vec<Device>) {
        debug!("paired snapshot now has {} device(s)", devices.len());
        self.paired.send_replace(devices);
    }

    pub fn scanned(&self) -> Vec<Device> {
        self.scanned.borrow().clone()
    }

    pub fn paired(&self) -> Vec<Device> {
        self.paired.borrow().clone()
    }

    /// Whether a device with the same address is in the paired snapshot.
    pub fn is_paired(&self, device: &Device) -> bool {
        self.paired.borrow().iter().any(|d| d.same_address(device))
    }

    pub fn subscribe_scanned(&self) -> watch::Receiver<Vec<Device>> {
        self.scanned.subscribe()
    }

    pub fn subscribe_paired(&self) -> watch::Receiver<Vec<Device>> {
        self.paired.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(address: &str) -> Device {
        Device::new(address, None)
    }

    #[test]
    fn test_record_discovered_is_idempotent_by_address() {
        // Arrange
        let registry = DeviceRegistry::new();

        // Act
        let first = registry.record_discovered(device("AA"));
        let again = registry.record_discovered(Device::new("AA", Some("renamed".to_string())));

        // Assert
        assert!(first);
        assert!(!again);
        assert_eq!(registry.scanned(), vec![device("AA")]);
    }

    #[test]
    fn test_scanned_keeps_first_seen_order() {
        let registry = DeviceRegistry::new();
        for addr in ["CC", "AA", "BB", "AA"] {
            registry.record_discovered(device(addr));
        }

        let addresses: Vec<String> = registry.scanned().into_iter().map(|d| d.address).collect();

        assert_eq!(addresses, vec!["CC", "AA", "BB"]);
    }

    #[test]
    fn test_duplicate_does_not_notify_observers() {
        // Arrange
        let registry = DeviceRegistry::new();
        registry.record_discovered(device("AA"));
        let mut rx = registry.subscribe_scanned();
        rx.mark_unchanged();

        // Act
        registry.record_discovered(device("AA"));

        // Assert
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_new_device_notifies_observers() {
        let registry = DeviceRegistry::new();
        let mut rx = registry.subscribe_scanned();
        rx.mark_unchanged();

        registry.record_discovered(device("AA"));

        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().len(), 1);
    }

    #[test]
    fn test_record_paired_replaces_snapshot() {
        // Arrange
        let registry = DeviceRegistry::new();
        registry.record_paired(vec![device("AA"), device("BB")]);

        // Act
        registry.record_paired(vec![device("CC")]);

        // Assert
        assert_eq!(registry.paired(), vec![device("CC")]);
        assert!(!registry.is_paired(&device("AA")));
        assert!(registry.is_paired(&device("CC")));
    }

    #[test]
    fn test_is_paired_matches_by_address_only() {
        let registry = DeviceRegistry::new();
        registry.record_paired(vec![Device::new("AA", Some("Phone".to_string()))]);

        assert!(registry.is_paired(&device("AA")));
    }

    #[test]
    fn test_clones_share_state() {
        let registry = DeviceRegistry::new();
        let clone = registry.clone();

        clone.record_discovered(device("AA"));

        assert_eq!(registry.scanned().len(), 1);
    }
}
