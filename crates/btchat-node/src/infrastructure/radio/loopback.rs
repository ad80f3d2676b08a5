//! TCP stand-in for a short-range radio link.
//!
//! Each node listens on a local TCP address; a device's "radio address" is
//! the `host:port` of its listener.  The connecting side sends the 16 raw
//! bytes of the service UUID immediately after the TCP handshake and the
//! listener drops any peer whose bytes do not match, which mirrors the
//! service-record matching a real radio stack performs.  After that the
//! stream carries chat frames only.
//!
//! Bonded devices and devices "in range" come from configuration, so two
//! `btchat` processes on one machine can pair with each other.

use std::future::poll_fn;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Poll, Waker};
use std::time::Duration;

use async_trait::async_trait;
use btchat_core::{Device, ServiceId};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use super::{BoxedStream, EventSource, RadioAdapter, RadioError, RadioListener};
use crate::infrastructure::storage::config::AppConfig;

/// How long a freshly accepted peer has to present its service id.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// A [`RadioAdapter`] backed by loopback TCP sockets.
pub struct LoopbackRadio {
    name: String,
    listen_address: SocketAddr,
    bonded: Vec<Device>,
    nearby: Vec<Device>,
    found: EventSource<Device>,
    discovering: AtomicBool,
}

impl LoopbackRadio {
    /// Resolves the adapter once at startup.
    ///
    /// # Errors
    ///
    /// Returns [`RadioError::HardwareUnavailable`] when the radio is disabled
    /// in configuration or its listen address cannot be parsed.
    pub fn open(config: &AppConfig, found: EventSource<Device>) -> Result<Self, RadioError> {
        if !config.radio.enabled {
            return Err(RadioError::HardwareUnavailable(
                "radio is disabled in configuration".to_string(),
            ));
        }
        let listen_address: SocketAddr = config.radio.listen_address.parse().map_err(|e| {
            RadioError::HardwareUnavailable(format!(
                "invalid listen address {:?}: {e}",
                config.radio.listen_address
            ))
        })?;

        info!("loopback radio {} ready on {listen_address}", config.node.name);
        Ok(Self {
            name: config.node.name.clone(),
            listen_address,
            bonded: config.paired.clone(),
            nearby: config.nearby.clone(),
            found,
            discovering: AtomicBool::new(false),
        })
    }

    pub fn listen_address(&self) -> SocketAddr {
        self.listen_address
    }

    pub fn is_discovering(&self) -> bool {
        self.discovering.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl RadioAdapter for LoopbackRadio {
    fn local_name(&self) -> Option<String> {
        Some(self.name.clone())
    }

    fn bonded_devices(&self) -> Vec<Device> {
        self.bonded.clone()
    }

    fn start_discovery(&self) -> Result<(), RadioError> {
        self.discovering.store(true, Ordering::Relaxed);
        for device in &self.nearby {
            self.found.publish(device.clone());
        }
        debug!("scan reported {} nearby device(s)", self.nearby.len());
        Ok(())
    }

    fn cancel_discovery(&self) {
        self.discovering.store(false, Ordering::Relaxed);
    }

    async fn listen(&self, service: ServiceId) -> Result<Box<dyn RadioListener>, RadioError> {
        let listener = TcpListener::bind(self.listen_address).await?;
        info!("listening for service {service} on {}", self.listen_address);
        Ok(Box::new(LoopbackListener {
            socket: Mutex::new(AcceptSocket {
                listener: Some(listener),
                waker: None,
            }),
            service,
        }))
    }

    async fn connect(&self, device: &Device, service: ServiceId) -> io::Result<BoxedStream> {
        let mut stream = TcpStream::connect(&device.address).await?;
        stream.set_nodelay(true)?;
        stream.write_all(service.as_bytes()).await?;
        debug!("connected to {} for service {service}", device.address);
        Ok(Box::new(stream))
    }
}

/// The bound socket; `None` once the listener has been closed.
struct AcceptSocket {
    listener: Option<TcpListener>,
    waker: Option<Waker>,
}

struct LoopbackListener {
    socket: Mutex<AcceptSocket>,
    service: ServiceId,
}

impl LoopbackListener {
    fn socket(&self) -> MutexGuard<'_, AcceptSocket> {
        self.socket.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        self.socket().listener.is_none()
    }

    async fn accept_tcp(&self) -> io::Result<(TcpStream, SocketAddr)> {
        poll_fn(|cx| {
            let mut socket = self.socket();
            let Some(listener) = socket.listener.as_ref() else {
                return Poll::Ready(Err(listener_closed()));
            };
            let polled = listener.poll_accept(cx);
            if polled.is_pending() {
                socket.waker = Some(cx.waker().clone());
            }
            polled
        })
        .await
    }
}

#[async_trait]
impl RadioListener for LoopbackListener {
    async fn accept(&self) -> io::Result<(BoxedStream, Device)> {
        loop {
            let (mut stream, addr) = self.accept_tcp().await?;
            let handshake = read_service_id(&mut stream).await;
            if self.is_closed() {
                return Err(listener_closed());
            }
            match handshake {
                Ok(id) if id == self.service => {
                    stream.set_nodelay(true)?;
                    return Ok((Box::new(stream), Device::new(addr.to_string(), None)));
                }
                Ok(id) => warn!("dropping peer {addr}: service {id} does not match {}", self.service),
                Err(e) => warn!("dropping peer {addr}: no service id received: {e}"),
            }
        }
    }

    fn close(&self) {
        let (listener, waker) = {
            let mut socket = self.socket();
            (socket.listener.take(), socket.waker.take())
        };
        if let Some(listener) = listener {
            // Dropping the socket unbinds the port before `close` returns.
            drop(listener);
            debug!("listener for service {} closed", self.service);
        }
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

fn listener_closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "listener closed")
}

async fn read_service_id(stream: &mut TcpStream) -> io::Result<ServiceId> {
    let mut bytes = [0u8; 16];
    tokio::time::timeout(HANDSHAKE_TIMEOUT, stream.read_exact(&mut bytes))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "service id handshake timed out"))??;
    Ok(ServiceId::from_bytes(bytes))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
