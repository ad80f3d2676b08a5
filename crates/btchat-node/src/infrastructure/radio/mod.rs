//! Radio boundary: the traits the session engine drives and the event
//! sources it subscribes to.
//!
//! The platform radio stack (adapter, RFCOMM-style listener, permission
//! checks, broadcast notifications) is an external collaborator.  Everything
//! the core needs from it is expressed here so that the engine can be driven
//! by a real stack, by the TCP [`loopback::LoopbackRadio`] used by the
//! `btchat` binary, or by the in-process [`memory::MemoryRadio`] used in tests.
//!
//! # Event sources
//!
//! Discovery results and link-state changes arrive asynchronously from the
//! platform.  They are modeled as [`EventSource`] hubs: the platform side
//! publishes, the core subscribes when it starts listening and unsubscribes
//! by dropping its receiver (aborting its pump task).

use async_trait::async_trait;
use btchat_core::{Device, ServiceId};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;

pub mod loopback;
pub mod memory;

/// Error type for radio adapter operations.
#[derive(Debug, Error)]
pub enum RadioError {
    /// No usable radio adapter is present or it is switched off.
    #[error("radio hardware unavailable: {0}")]
    HardwareUnavailable(String),
    /// The listening endpoint could not be opened.
    #[error("radio I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The radio refused to start scanning.
    #[error("discovery could not be started: {0}")]
    Discovery(String),
}

/// A reliable, ordered, connection-oriented byte stream to one peer.
///
/// Dropping the value closes the stream.
pub trait RadioStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> RadioStream for T {}

/// Owned, type-erased stream handle as handed out by adapters and listeners.
pub type BoxedStream = Box<dyn RadioStream>;

/// A listening endpoint bound to one service identifier.
///
/// Dropping or closing the listener closes the endpoint; streams it already
/// accepted stay open.
#[async_trait]
pub trait RadioListener: Send + Sync {
    /// Waits for the next inbound peer presenting the listener's service id.
    ///
    /// Fails with [`std::io::ErrorKind::NotConnected`] once the listener has
    /// been closed.
    async fn accept(&self) -> std::io::Result<(BoxedStream, Device)>;

    /// Releases the endpoint before returning, even while another task holds
    /// a reference to the listener.  The service id can be listened on again
    /// right away.  Idempotent.
    fn close(&self);
}

/// The local radio adapter.
#[async_trait]
pub trait RadioAdapter: Send + Sync {
    /// The name other devices see for this adapter, if it has one.
    fn local_name(&self) -> Option<String>;

    /// Devices bonded (paired) with this adapter.
    fn bonded_devices(&self) -> Vec<Device>;

    /// Begins scanning; results are published on the discovered-device source.
    fn start_discovery(&self) -> Result<(), RadioError>;

    /// Stops scanning.  No-op when not scanning.
    fn cancel_discovery(&self);

    /// Opens a listening endpoint for `service`.
    async fn listen(&self, service: ServiceId) -> Result<Box<dyn RadioListener>, RadioError>;

    /// Opens an outbound stream to `device` for `service`.
    async fn connect(&self, device: &Device, service: ServiceId) -> std::io::Result<BoxedStream>;
}

/// Runtime permission checks exposed by the environment.
#[cfg_attr(test, mockall::automock)]
pub trait CapabilityProvider: Send + Sync {
    /// Whether the process may scan for devices.
    fn can_scan(&self) -> bool;
    /// Whether the process may listen for or open connections.
    fn can_connect(&self) -> bool;
}

/// Capabilities fixed at startup, typically from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticCapabilities {
    pub scan: bool,
    pub connect: bool,
}

impl StaticCapabilities {
    pub fn all() -> Self {
        Self {
            scan: true,
            connect: true,
        }
    }

    pub fn none() -> Self {
        Self {
            scan: false,
            connect: false,
        }
    }
}

impl CapabilityProvider for StaticCapabilities {
    fn can_scan(&self) -> bool {
        self.scan
    }

    fn can_connect(&self) -> bool {
        self.connect
    }
}

/// Low-level link state change reported by the platform for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkStateEvent {
    pub connected: bool,
    pub device: Device,
}

/// A broadcast hub the platform publishes into and the core subscribes to.
#[derive(Debug, Clone)]
pub struct EventSource<T: Clone> {
    tx: broadcast::Sender<T>,
}

impl<T: Clone> EventSource<T> {
    /// Creates a hub that buffers up to `capacity` undelivered events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Delivers `event` to every current subscriber and returns how many got it.
    pub fn publish(&self, event: T) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Registers a new subscriber; events published before this call are not seen.
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
