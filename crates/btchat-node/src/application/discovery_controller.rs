//! DiscoveryController: starts and stops scanning and feeds the registry.
//!
//! The radio reports discovered devices asynchronously on an [`EventSource`].
//! On the first `start()` the controller subscribes to that source and spawns
//! a pump task that forwards every device into
//! [`DeviceRegistry::record_discovered`].  `release()` aborts the pump, which
//! drops the receiver and so unsubscribes.

use std::sync::{Arc, Mutex, PoisonError};

use btchat_core::Device;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::device_registry::DeviceRegistry;
use crate::infrastructure::radio::{CapabilityProvider, EventSource, RadioAdapter, RadioError};

/// Error type for discovery operations.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The radio refused to begin scanning.
    #[error("failed to start discovery: {0}")]
    StartFailed(#[source] RadioError),
}

pub struct DiscoveryController {
    radio: Arc<dyn RadioAdapter>,
    capabilities: Arc<dyn CapabilityProvider>,
    registry: DeviceRegistry,
    found: EventSource<Device>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl DiscoveryController {
    pub fn new(
        radio: Arc<dyn RadioAdapter>,
        capabilities: Arc<dyn CapabilityProvider>,
        registry: DeviceRegistry,
        found: EventSource<Device>,
    ) -> Self {
        Self {
            radio,
            capabilities,
            registry,
            found,
            pump: Mutex::new(None),
        }
    }

    /// Begins scanning.
    ///
    /// Without the "scan" capability this does nothing.  Otherwise the paired
    /// snapshot is refreshed, the discovered-device feed is subscribed (once),
    /// and the radio is told to scan.  Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::StartFailed`] when the radio cannot scan.
    pub fn start(&self) -> Result<(), DiscoveryError> {
        if !self.capabilities.can_scan() {
            debug!("scan capability missing; not starting discovery");
            return Ok(());
        }

        self.refresh_paired();
        self.ensure_subscribed();

        self.radio.start_discovery().map_err(|e| {
            warn!("discovery could not be started: {e}");
            DiscoveryError::StartFailed(e)
        })?;
        info!("discovery started");
        Ok(())
    }

    /// Stops scanning.  Does nothing without the "scan" capability.
    pub fn stop(&self) {
        if !self.capabilities.can_scan() {
            return;
        }
        self.radio.cancel_discovery();
        debug!("discovery stopped");
    }

    /// Replaces the paired snapshot with the radio's bonded list.
    ///
    /// Requires the "connect" capability; returns `false` when it is missing.
    pub fn refresh_paired(&self) -> bool {
        if !self.capabilities.can_connect() {
            debug!("connect capability missing; paired snapshot not refreshed");
            return false;
        }
        self.registry.record_paired(self.radio.bonded_devices());
        true
    }

    /// Unsubscribes from the discovered-device feed.  Idempotent.
    pub fn release(&self) {
        if let Some(pump) = self.lock_pump().take() {
            pump.abort();
            debug!("discovery feed released");
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    fn ensure_subscribed(&self) {
        let mut pump = self.lock_pump();
        if pump.as_ref().is_some_and(|p| !p.is_finished()) {
            return;
        }
        // Subscribe before spawning so nothing published by the scan is missed.
        let rx = self.found.subscribe();
        *pump = Some(tokio::spawn(pump_discovered(rx, self.registry.clone())));
    }

    fn lock_pump(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.pump.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for DiscoveryController {
    fn drop(&mut self) {
        self.release();
    }
}

async fn pump_discovered(mut rx: broadcast::Receiver<Device>, registry: DeviceRegistry) {
    loop {
        match rx.recv().await {
            Ok(device) => {
                registry.record_discovered(device);
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("discovery feed lagged; {n} device report(s) dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::radio::memory::MemoryRadio;
    use crate::infrastructure::radio::{MockCapabilityProvider, StaticCapabilities};
    use std::time::Duration;

    fn setup(caps: Arc<dyn CapabilityProvider>) -> (Arc<MemoryRadio>, DiscoveryController) {
        let found = EventSource::new(16);
        let radio = Arc::new(MemoryRadio::new(Some("local"), found.clone()));
        let controller =
            DiscoveryController::new(radio.clone(), caps, DeviceRegistry::new(), found);
        (radio, controller)
    }

    #[tokio::test]
    async fn test_start_feeds_discovered_devices_into_registry() {
        // Arrange
        let (radio, controller) = setup(Arc::new(StaticCapabilities::all()));
        radio.set_nearby(vec![Device::new("AA", None), Device::new("BB", None)]);
        let mut scanned = controller.registry().subscribe_scanned();

        // Act
        controller.start().unwrap();

        // Assert
        tokio::time::timeout(Duration::from_secs(2), scanned.wait_for(|d| d.len() == 2))
            .await
            .expect("devices never reached the registry")
            .unwrap();
        assert!(radio.is_discovering());
    }

    #[tokio::test]
    async fn test_start_refreshes_paired_snapshot() {
        let (radio, controller) = setup(Arc::new(StaticCapabilities::all()));
        radio.set_bonded(vec![Device::new("PP", Some("Phone".to_string()))]);

        controller.start().unwrap();

        assert!(controller.registry().is_paired(&Device::new("PP", None)));
    }

    #[tokio::test]
    async fn test_start_without_scan_capability_is_a_no_op() {
        // Arrange
        let mut caps = MockCapabilityProvider::new();
        caps.expect_can_scan().return_const(false);
        caps.expect_can_connect().never();
        let (radio, controller) = setup(Arc::new(caps));

        // Act
        let result = controller.start();

        // Assert
        assert!(result.is_ok());
        assert!(!radio.is_discovering());
    }

    #[tokio::test]
    async fn test_start_failure_is_reported() {
        let (radio, controller) = setup(Arc::new(StaticCapabilities::all()));
        radio.fail_discovery("adapter busy");

        let result = controller.start();

        assert!(matches!(result, Err(DiscoveryError::StartFailed(_))));
    }

    #[tokio::test]
    async fn test_stop_cancels_discovery() {
        let (radio, controller) = setup(Arc::new(StaticCapabilities::all()));
        controller.start().unwrap();

        controller.stop();

        assert!(!radio.is_discovering());
    }

    #[tokio::test]
    async fn test_refresh_paired_requires_connect_capability() {
        let mut caps = MockCapabilityProvider::new();
        caps.expect_can_connect().return_const(false);
        let (radio, controller) = setup(Arc::new(caps));
        radio.set_bonded(vec![Device::new("PP", None)]);

        assert!(!controller.refresh_paired());
        assert!(controller.registry().paired().is_empty());
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let (_radio, controller) = setup(Arc::new(StaticCapabilities::all()));
        controller.start().unwrap();

        controller.release();
        controller.release();

        assert!(controller.lock_pump().is_none());
    }
}
