//! In-process radio for tests.
//!
//! Streams are `tokio::io::duplex` pairs.  Tests play the remote peer:
//!
//! - [`MemoryRadio::dial`] connects *into* an open listener and returns the
//!   peer's end of the stream.
//! - [`MemoryRadio::next_outbound_peer`] hands out the far end of every
//!   stream opened by [`RadioAdapter::connect`].
//! - [`MemoryRadio::fail_connections_to`] makes outbound connects to an
//!   address fail, as a radio would when the peer is out of range.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use btchat_core::{Device, ServiceId};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use super::{BoxedStream, EventSource, RadioAdapter, RadioError, RadioListener};

const DUPLEX_BUFFER: usize = 4096;

type InboundQueue = mpsc::UnboundedSender<(BoxedStream, Device)>;

/// Open listeners by service, tagged with the id of the listener that owns
/// the entry.
type ListenerTable = Arc<Mutex<HashMap<ServiceId, (u64, InboundQueue)>>>;

/// An in-memory [`RadioAdapter`].
pub struct MemoryRadio {
    name: Option<String>,
    bonded: Mutex<Vec<Device>>,
    listeners: ListenerTable,
    next_listener_id: AtomicU64,
    failing: Mutex<HashSet<String>>,
    discovering: AtomicBool,
    discovery_error: Mutex<Option<String>>,
    connect_attempts: AtomicUsize,
    outbound_tx: mpsc::UnboundedSender<(Device, DuplexStream)>,
    outbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Device, DuplexStream)>>,
    found: EventSource<Device>,
    nearby: Mutex<Vec<Device>>,
}

impl MemoryRadio {
    /// Creates a radio named `name` that publishes scan results on `found`.
    pub fn new(name: Option<&str>, found: EventSource<Device>) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            name: name.map(str::to_string),
            bonded: Mutex::new(Vec::new()),
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_listener_id: AtomicU64::new(1),
            failing: Mutex::new(HashSet::new()),
            discovering: AtomicBool::new(false),
            discovery_error: Mutex::new(None),
            connect_attempts: AtomicUsize::new(0),
            outbound_tx,
            outbound_rx: tokio::sync::Mutex::new(outbound_rx),
            found,
            nearby: Mutex::new(Vec::new()),
        }
    }

    /// Replaces the bonded-device list.
    pub fn set_bonded(&self, devices: Vec<Device>) {
        *lock(&self.bonded) = devices;
    }

    /// Devices "in range": published on the found source when scanning starts.
    pub fn set_nearby(&self, devices: Vec<Device>) {
        *lock(&self.nearby) = devices;
    }

    /// Makes every future `connect` to `address` fail with `ConnectionRefused`.
    pub fn fail_connections_to(&self, address: &str) {
        lock(&self.failing).insert(address.to_string());
    }

    /// Makes the next `start_discovery` calls fail with `reason`.
    pub fn fail_discovery(&self, reason: &str) {
        *lock(&self.discovery_error) = Some(reason.to_string());
    }

    pub fn is_discovering(&self) -> bool {
        self.discovering.load(Ordering::SeqCst)
    }

    /// Whether a listener for `service` is currently open.
    pub fn is_listening(&self, service: ServiceId) -> bool {
        lock(&self.listeners).contains_key(&service)
    }

    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Simulates `from` connecting to this radio's listener for `service`.
    ///
    /// Returns the remote peer's end of the new stream.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionRefused` when nothing is listening on `service`.
    pub fn dial(&self, service: ServiceId, from: Device) -> io::Result<DuplexStream> {
        let queue = lock(&self.listeners)
            .get(&service)
            .map(|(_, queue)| queue.clone())
            .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "no listener"))?;
        let (local, remote) = tokio::io::duplex(DUPLEX_BUFFER);
        queue
            .send((Box::new(local), from))
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "listener closed"))?;
        Ok(remote)
    }

    /// Waits for the next outbound connection and returns the device it was
    /// opened to plus the remote peer's end of the stream.
    pub async fn next_outbound_peer(&self) -> Option<(Device, DuplexStream)> {
        self.outbound_rx.lock().await.recv().await
    }
}

#[async_trait]
impl RadioAdapter for MemoryRadio {
    fn local_name(&self) -> Option<String> {
        self.name.clone()
    }

    fn bonded_devices(&self) -> Vec<Device> {
        lock(&self.bonded).clone()
    }

    fn start_discovery(&self) -> Result<(), RadioError> {
        if let Some(reason) = lock(&self.discovery_error).clone() {
            return Err(RadioError::Discovery(reason));
        }
        self.discovering.store(true, Ordering::SeqCst);
        for device in lock(&self.nearby).iter() {
            self.found.publish(device.clone());
        }
        Ok(())
    }

    fn cancel_discovery(&self) {
        self.discovering.store(false, Ordering::SeqCst);
    }

    async fn listen(&self, service: ServiceId) -> Result<Box<dyn RadioListener>, RadioError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut listeners = lock(&self.listeners);
        if listeners.contains_key(&service) {
            return Err(RadioError::Io(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("service {service} is already being listened on"),
            )));
        }
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        listeners.insert(service, (id, tx));
        Ok(Box::new(MemoryListener {
            id,
            service,
            inbound: tokio::sync::Mutex::new(rx),
            closed: AtomicBool::new(false),
            listeners: Arc::clone(&self.listeners),
        }))
    }

    async fn connect(&self, device: &Device, _service: ServiceId) -> io::Result<BoxedStream> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if lock(&self.failing).contains(&device.address) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("{} did not answer", device.address),
            ));
        }
        let (local, remote) = tokio::io::duplex(DUPLEX_BUFFER);
        self.outbound_tx
            .send((device.clone(), remote))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "outbound queue closed"))?;
        Ok(Box::new(local))
    }
}

/// Listener half of [`MemoryRadio`]; unregisters itself when closed or
/// dropped.
struct MemoryListener {
    id: u64,
    service: ServiceId,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<(BoxedStream, Device)>>,
    closed: AtomicBool,
    listeners: ListenerTable,
}

impl MemoryListener {
    /// Removes the table entry if it is still ours; a newer listener on the
    /// same service keeps its entry.  Dropping the removed sender wakes a
    /// pending `accept`.
    fn unregister(&self) {
        let removed = {
            let mut listeners = lock(&self.listeners);
            let ours = matches!(listeners.get(&self.service), Some((id, _)) if *id == self.id);
            if ours {
                listeners.remove(&self.service)
            } else {
                None
            }
        };
        drop(removed);
    }
}

#[async_trait]
impl RadioListener for MemoryListener {
    async fn accept(&self) -> io::Result<(BoxedStream, Device)> {
        let closed = || io::Error::new(io::ErrorKind::NotConnected, "listener closed");
        let next = self.inbound.lock().await.recv().await;
        if self.closed.load(Ordering::SeqCst) {
            // Dialers queued before the close see their stream dropped.
            return Err(closed());
        }
        next.ok_or_else(closed)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.unregister();
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.unregister();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn radio() -> MemoryRadio {
        MemoryRadio::new(Some("local"), EventSource::new(8))
    }

    #[tokio::test]
    async fn test_dial_without_listener_is_refused() {
        let radio = radio();
        let err = radio.dial(ServiceId::DEFAULT, Device::new("peer", None)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn test_dial_reaches_accept_and_bytes_flow() {
        // Arrange
        let radio = radio();
        let listener = radio.listen(ServiceId::DEFAULT).await.unwrap();

        // Act
        let mut peer = radio.dial(ServiceId::DEFAULT, Device::new("peer", None)).unwrap();
        let (mut stream, device) = listener.accept().await.unwrap();
        peer.write_all(b"Bob#hi").await.unwrap();
        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).await.unwrap();

        // Assert
        assert_eq!(device.address, "peer");
        assert_eq!(&buf[..n], b"Bob#hi");
    }

    #[tokio::test]
    async fn test_dropping_listener_stops_listening() {
        let radio = radio();
        let listener = radio.listen(ServiceId::DEFAULT).await.unwrap();
        assert!(radio.is_listening(ServiceId::DEFAULT));
        drop(listener);
        assert!(!radio.is_listening(ServiceId::DEFAULT));
    }

    #[tokio::test]
    async fn test_close_frees_service_while_listener_is_still_held() {
        // Arrange
        let radio = radio();
        let listener: Arc<dyn RadioListener> =
            Arc::from(radio.listen(ServiceId::DEFAULT).await.unwrap());
        let held = Arc::clone(&listener);
        let pending = tokio::spawn(async move { held.accept().await });
        tokio::task::yield_now().await;

        // Act
        listener.close();
        let relisten = radio.listen(ServiceId::DEFAULT).await;

        // Assert
        assert!(relisten.is_ok());
        let err = pending.await.unwrap().err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_stale_listener_drop_keeps_newer_registration() {
        // Arrange
        let radio = radio();
        let old = radio.listen(ServiceId::DEFAULT).await.unwrap();
        old.close();
        let _new = radio.listen(ServiceId::DEFAULT).await.unwrap();

        // Act
        drop(old);

        // Assert
        assert!(radio.is_listening(ServiceId::DEFAULT));
        assert!(radio.dial(ServiceId::DEFAULT, Device::new("peer", None)).is_ok());
    }

    #[tokio::test]
    async fn test_failing_address_refuses_connect() {
        let radio = radio();
        radio.fail_connections_to("AA");
        let result = radio.connect(&Device::new("AA", None), ServiceId::DEFAULT).await;
        assert!(result.is_err());
        assert_eq!(radio.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_start_discovery_publishes_nearby_devices() {
        // Arrange
        let found = EventSource::new(8);
        let mut rx = found.subscribe();
        let radio = MemoryRadio::new(None, found);
        radio.set_nearby(vec![Device::new("AA", None)]);

        // Act
        radio.start_discovery().unwrap();

        // Assert
        assert!(radio.is_discovering());
        assert_eq!(rx.recv().await.unwrap().address, "AA");
    }
}
