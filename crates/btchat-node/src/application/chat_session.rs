//! ChatSession: the user-facing view of the node.
//!
//! Combines the device registry, the connection manager's observable flags
//! and errors, and the message history into one [`ChatState`] published on a
//! `watch` channel.  A front end (the `btchat` binary, or a UI) renders that
//! state and calls the actions here.
//!
//! # Event pump
//!
//! `connect` and `wait_for_incoming` hand the returned session handle to a
//! pump task that turns session events into state changes:
//!
//! | Event              | State change                                   |
//! |--------------------|------------------------------------------------|
//! | `Established`      | connected, not connecting, error cleared       |
//! | `MessageReceived`  | message appended                               |
//! | `Error(text)`      | not connected, not connecting, error = `text`  |
//! | `Disconnected`     | not connected, connecting, history dropped     |
//!
//! When the session ends the pump waits for its teardown and resets both
//! flags.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use btchat_core::{ChatMessage, Device};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::discovery_controller::{DiscoveryController, DiscoveryError};
use crate::infrastructure::network::connection_manager::{
    ConnectionError, ConnectionEvent, ConnectionManager, SessionHandle,
};

/// Snapshot rendered by the front end.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatState {
    pub scanned: Vec<Device>,
    pub paired: Vec<Device>,
    pub is_connected: bool,
    pub is_connecting: bool,
    pub error_message: Option<String>,
    /// Always empty while not connected.
    pub messages: Vec<ChatMessage>,
}

/// Holds the full state and publishes the derived view.
struct StateHub {
    raw: Mutex<ChatState>,
    tx: watch::Sender<ChatState>,
}

impl StateHub {
    fn new(initial: ChatState) -> Self {
        Self {
            raw: Mutex::new(initial.clone()),
            tx: watch::channel(initial).0,
        }
    }

    fn update(&self, f: impl FnOnce(&mut ChatState)) {
        let mut raw = lock(&self.raw);
        f(&mut raw);
        let mut view = raw.clone();
        if !view.is_connected {
            view.messages.clear();
        }
        self.tx.send_if_modified(|current| {
            if *current == view {
                return false;
            }
            *current = view;
            true
        });
    }
}

pub struct ChatSession {
    discovery: Arc<DiscoveryController>,
    manager: ConnectionManager,
    hub: Arc<StateHub>,
    pump: Mutex<Option<JoinHandle<()>>>,
    mirrors: Vec<JoinHandle<()>>,
}

impl ChatSession {
    /// Wires the view to `discovery` and `manager`.
    ///
    /// Must be called within a Tokio runtime.
    pub fn new(discovery: Arc<DiscoveryController>, manager: ConnectionManager) -> Self {
        let registry = discovery.registry();
        let hub = Arc::new(StateHub::new(ChatState {
            scanned: registry.scanned(),
            paired: registry.paired(),
            is_connected: manager.is_connected(),
            ..ChatState::default()
        }));

        let mirrors = vec![
            spawn_mirror(registry.subscribe_scanned(), Arc::clone(&hub), |s, v| s.scanned = v),
            spawn_mirror(registry.subscribe_paired(), Arc::clone(&hub), |s, v| s.paired = v),
            spawn_mirror(manager.subscribe_connected(), Arc::clone(&hub), |s, v| {
                s.is_connected = v
            }),
            spawn_error_mirror(manager.subscribe_errors(), Arc::clone(&hub)),
        ];

        Self {
            discovery,
            manager,
            hub,
            pump: Mutex::new(None),
            mirrors,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ChatState> {
        self.hub.tx.subscribe()
    }

    pub fn snapshot(&self) -> ChatState {
        self.hub.tx.borrow().clone()
    }

    pub fn start_scan(&self) -> Result<(), DiscoveryError> {
        self.discovery.start()
    }

    pub fn stop_scan(&self) {
        self.discovery.stop();
    }

    /// Connects to `device` and starts relaying its events into the state.
    ///
    /// # Errors
    ///
    /// Whatever [`ConnectionManager::connect_to_device`] rejects with; the
    /// error text is also stored in the state.
    pub async fn connect(&self, device: &Device) -> Result<(), ConnectionError> {
        self.hub.update(|s| s.is_connecting = true);
        let result = self.manager.connect_to_device(device).await;
        self.adopt(result)
    }

    /// Listens for one inbound peer and relays its events into the state.
    ///
    /// # Errors
    ///
    /// Whatever [`ConnectionManager::start_server`] rejects with.
    pub async fn wait_for_incoming(&self) -> Result<(), ConnectionError> {
        self.hub.update(|s| s.is_connecting = true);
        let result = self.manager.start_server().await;
        self.adopt(result)
    }

    /// Stops the event pump and closes the connection.
    pub fn disconnect(&self) {
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
        self.manager.close_connection();
        self.hub.update(|s| {
            s.is_connecting = false;
            s.is_connected = false;
        });
    }

    /// Sends `text` and appends it to the history on success.
    ///
    /// # Errors
    ///
    /// See [`ConnectionManager::send_message`].
    pub async fn send_message(&self, text: &str) -> Result<ChatMessage, ConnectionError> {
        let message = self.manager.send_message(text).await?;
        let appended = message.clone();
        self.hub.update(|s| s.messages.push(appended));
        Ok(message)
    }

    /// Dismisses the current error message.
    pub fn clear_error(&self) {
        self.hub.update(|s| s.error_message = None);
    }

    /// Releases discovery and the connection manager.
    pub fn release(&self) {
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
        self.discovery.release();
        self.manager.release();
    }

    fn adopt(&self, result: Result<SessionHandle, ConnectionError>) -> Result<(), ConnectionError> {
        match result {
            Ok(handle) => {
                let task = tokio::spawn(pump_events(handle, Arc::clone(&self.hub)));
                if let Some(previous) = lock(&self.pump).replace(task) {
                    previous.abort();
                }
                Ok(())
            }
            Err(e) => {
                let text = e.to_string();
                self.hub.update(|s| {
                    s.is_connecting = false;
                    s.error_message = Some(text);
                });
                Err(e)
            }
        }
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
        for mirror in &self.mirrors {
            mirror.abort();
        }
    }
}

async fn pump_events(mut handle: SessionHandle, hub: Arc<StateHub>) {
    while let Some(event) = handle.next_event().await {
        match event {
            ConnectionEvent::Established => hub.update(|s| {
                s.is_connected = true;
                s.is_connecting = false;
                s.error_message = None;
            }),
            ConnectionEvent::MessageReceived(message) => hub.update(|s| s.messages.push(message)),
            ConnectionEvent::Error(text) => hub.update(|s| {
                s.is_connected = false;
                s.is_connecting = false;
                s.error_message = Some(text);
            }),
            // Repeat-mode server: the session lives on and waits for the next peer.
            ConnectionEvent::Disconnected => hub.update(|s| {
                s.is_connected = false;
                s.is_connecting = true;
                s.messages.clear();
            }),
        }
    }
    debug!("session {} ended", handle.id());
    // Make sure this session's teardown has run before reporting it.
    handle.cancel().await;
    hub.update(|s| {
        s.is_connected = false;
        s.is_connecting = false;
    });
}

fn spawn_mirror<T>(
    mut rx: watch::Receiver<T>,
    hub: Arc<StateHub>,
    apply: fn(&mut ChatState, T),
) -> JoinHandle<()>
where
    T: Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let value = rx.borrow_and_update().clone();
            hub.update(|s| apply(s, value));
        }
    })
}

fn spawn_error_mirror(mut rx: broadcast::Receiver<String>, hub: Arc<StateHub>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(text) => hub.update(|s| s.error_message = Some(text)),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("error feed lagged; {n} message(s) dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
