//! ConnectionManager: the session state machine.
//!
//! ```text
//! Idle ──start_server──►  ListeningForInbound ──accept──►  Connected
//! Idle ──connect_to_device──►  ConnectingOutbound ──connect──►  Connected
//!                        any non-idle ──teardown──►  Closed (session) / Idle (manager)
//! ```
//!
//! At most one session exists at a time.  Each session runs in its own task
//! which reads the stream; the stream's sender and the listening endpoint sit
//! in the session slot so that `send_message` and `close_connection` can
//! reach them.  Teardown closes both through the slot before it returns, so
//! the peer sees end-of-stream and the service can be listened on again
//! without waiting for the aborted task to be reaped.  Every exit path of the
//! task (normal end, error, abort) drops a [`TeardownGuard`] which runs the
//! same teardown routine as `close_connection`.  Sessions carry a generation
//! id so a guard left over from an old session never tears down a newer one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use btchat_core::{encode_message, ChatMessage, Device, ProtocolError, ServiceId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use super::transfer_channel::{MessageReader, MessageSender, TransferChannel, DEFAULT_READ_BUFFER_SIZE};
use crate::application::device_registry::DeviceRegistry;
use crate::infrastructure::radio::{
    CapabilityProvider, EventSource, LinkStateEvent, RadioAdapter, RadioError, RadioListener,
};

/// Error text emitted when a connect or accept handshake fails.
pub const CONNECTION_INTERRUPTED: &str = "Connection was interrupted";
/// Error text emitted when a read fails mid-session.
pub const TRANSFER_FAILED: &str = "Transfer failed";
/// Error text published when the link feed reports a device that is not paired.
pub const UNPAIRED_DEVICE: &str = "Can't connect to a device that is not paired";
/// Sender name used when the radio does not report a local name.
pub const UNKNOWN_SENDER: &str = "Unknown Name";

/// Error type for connection management operations.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("permission denied: the \"connect\" capability is missing")]
    PermissionDenied,
    #[error("a session is already active ({0:?})")]
    SessionAlreadyActive(SessionState),
    #[error("device {0} is not paired")]
    DeviceNotPaired(String),
    #[error("failed to open listening endpoint: {0}")]
    ListenFailed(#[source] RadioError),
    #[error("connection was interrupted: {0}")]
    ConnectionInterrupted(#[source] std::io::Error),
    #[error("link state reported for unpaired device {0}")]
    UnpairedDevice(String),
    #[error("the session was closed before it was established")]
    SessionClosed,
    #[error("no connected session")]
    NotConnected,
    #[error("message was not delivered")]
    SendFailed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// State of the manager, or of one session as seen through its handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session exists.
    Idle,
    /// Server role: waiting in accept.
    ListeningForInbound,
    /// Client role: outbound connect in flight.
    ConnectingOutbound,
    /// A stream is open and messages are being relayed.
    Connected,
    /// The session has been torn down.  Terminal.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// How many peers a server accepts per `start_server` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcceptMode {
    /// Accept one peer; the session ends when that peer leaves.
    #[default]
    Single,
    /// After a peer leaves cleanly, listen again and accept the next one.
    Repeat,
}

/// Events delivered to the caller of `start_server` / `connect_to_device`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Established,
    MessageReceived(ChatMessage),
    Error(String),
    /// The peer left cleanly and a [`AcceptMode::Repeat`] server is about to
    /// listen for the next one.  Single-mode sessions simply end instead.
    Disconnected,
}

/// Configuration for the session engine.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub service_id: ServiceId,
    pub accept_mode: AcceptMode,
    pub read_buffer_size: usize,
    /// Buffered events per session before the relay waits for the caller.
    pub event_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            service_id: ServiceId::DEFAULT,
            accept_mode: AcceptMode::Single,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            event_capacity: 64,
        }
    }
}

/// The live session in the slot.
struct Session {
    id: u64,
    role: Role,
    state_tx: watch::Sender<SessionState>,
    listener: Option<Arc<dyn RadioListener>>,
    sender: Option<MessageSender>,
    remote: Option<Device>,
    task: Option<AbortHandle>,
}

struct Shared {
    radio: Arc<dyn RadioAdapter>,
    capabilities: Arc<dyn CapabilityProvider>,
    registry: DeviceRegistry,
    config: ManagerConfig,
    slot: Mutex<Option<Session>>,
    next_id: AtomicU64,
    state_tx: watch::Sender<SessionState>,
    connected_tx: Arc<watch::Sender<bool>>,
    errors_tx: broadcast::Sender<String>,
    link_pump: Mutex<Option<JoinHandle<()>>>,
}

/// The connection manager.  Cheap to clone; clones share one session slot.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Creates a manager and subscribes it to the external link-state feed.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        radio: Arc<dyn RadioAdapter>,
        capabilities: Arc<dyn CapabilityProvider>,
        registry: DeviceRegistry,
        config: ManagerConfig,
        link_events: &EventSource<LinkStateEvent>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        let connected_tx = Arc::new(watch::channel(false).0);
        let (errors_tx, _) = broadcast::channel(32);

        let pump = spawn_link_pump(
            link_events.subscribe(),
            registry.clone(),
            Arc::clone(&connected_tx),
            errors_tx.clone(),
        );

        Self {
            shared: Arc::new(Shared {
                radio,
                capabilities,
                registry,
                config,
                slot: Mutex::new(None),
                next_id: AtomicU64::new(1),
                state_tx,
                connected_tx,
                errors_tx,
                link_pump: Mutex::new(Some(pump)),
            }),
        }
    }

    // ── Observable state ──────────────────────────────────────────────────────

    pub fn state(&self) -> SessionState {
        *self.shared.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    /// Link state as last reported by the platform for a paired device.
    pub fn is_connected(&self) -> bool {
        *self.shared.connected_tx.borrow()
    }

    pub fn subscribe_connected(&self) -> watch::Receiver<bool> {
        self.shared.connected_tx.subscribe()
    }

    /// Error messages not tied to a particular session (e.g. unpaired link reports).
    pub fn subscribe_errors(&self) -> broadcast::Receiver<String> {
        self.shared.errors_tx.subscribe()
    }

    /// The peer of the current session, once known.
    pub fn remote_device(&self) -> Option<Device> {
        self.shared.slot().as_ref().and_then(|s| s.remote.clone())
    }

    // ── Operations ────────────────────────────────────────────────────────────

    /// Listens for one inbound peer (or several, with [`AcceptMode::Repeat`]).
    ///
    /// # Errors
    ///
    /// [`ConnectionError::PermissionDenied`] without the "connect" capability,
    /// [`ConnectionError::SessionAlreadyActive`] when a session exists,
    /// [`ConnectionError::ListenFailed`] when the endpoint cannot be opened.
    pub async fn start_server(&self) -> Result<SessionHandle, ConnectionError> {
        if !self.shared.capabilities.can_connect() {
            return Err(ConnectionError::PermissionDenied);
        }
        let (id, state_rx) =
            self.shared
                .begin_session(Role::Server, SessionState::ListeningForInbound, None)?;

        let listener: Arc<dyn RadioListener> =
            match self.shared.radio.listen(self.shared.config.service_id).await {
                Ok(listener) => Arc::from(listener),
                Err(e) => {
                    warn!("session {id}: listen failed: {e}");
                    self.shared.teardown(Some(id));
                    return Err(ConnectionError::ListenFailed(e));
                }
            };
        if !self.shared.attach_listener(id, &listener) {
            return Err(ConnectionError::SessionClosed);
        }
        info!(
            "session {id}: listening for service {}",
            self.shared.config.service_id
        );

        let (tx, rx) = mpsc::channel(self.shared.config.event_capacity);
        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(async move {
            let _guard = TeardownGuard {
                shared: Arc::clone(&shared),
                id,
            };
            run_server(shared, id, listener, tx).await;
        });
        self.shared.attach_task(id, task.abort_handle());

        Ok(SessionHandle::new(id, Role::Server, rx, state_rx, task))
    }

    /// Connects to a paired `device`.
    ///
    /// Any scan in progress is cancelled first.  Connect failures are
    /// reported on the returned handle as
    /// `ConnectionEvent::Error("Connection was interrupted")`.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::PermissionDenied`] without the "connect" capability,
    /// [`ConnectionError::SessionAlreadyActive`] when a session exists,
    /// [`ConnectionError::DeviceNotPaired`] when `device` is not in the paired
    /// snapshot; in that case no state changes and no stream is opened.
    pub async fn connect_to_device(&self, device: &Device) -> Result<SessionHandle, ConnectionError> {
        if !self.shared.capabilities.can_connect() {
            return Err(ConnectionError::PermissionDenied);
        }
        self.shared.ensure_idle()?;
        self.shared.radio.cancel_discovery();

        if !self.shared.registry.is_paired(device) {
            info!("refusing to connect to unpaired device {device}");
            return Err(ConnectionError::DeviceNotPaired(device.address.clone()));
        }

        let (id, state_rx) = self.shared.begin_session(
            Role::Client,
            SessionState::ConnectingOutbound,
            Some(device.clone()),
        )?;
        info!("session {id}: connecting to {device}");

        let (tx, rx) = mpsc::channel(self.shared.config.event_capacity);
        let shared = Arc::clone(&self.shared);
        let device = device.clone();
        let task = tokio::spawn(async move {
            let _guard = TeardownGuard {
                shared: Arc::clone(&shared),
                id,
            };
            run_client(shared, id, device, tx).await;
        });
        self.shared.attach_task(id, task.abort_handle());

        Ok(SessionHandle::new(id, Role::Client, rx, state_rx, task))
    }

    /// Sends `text` to the peer as a local message.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::PermissionDenied`], [`ConnectionError::NotConnected`]
    /// when no stream is open, [`ConnectionError::Protocol`] when the message
    /// cannot be encoded, [`ConnectionError::SendFailed`] when the write fails.
    pub async fn send_message(&self, text: &str) -> Result<ChatMessage, ConnectionError> {
        if !self.shared.capabilities.can_connect() {
            return Err(ConnectionError::PermissionDenied);
        }
        let sender = self
            .shared
            .slot()
            .as_ref()
            .and_then(|s| s.sender.clone())
            .ok_or(ConnectionError::NotConnected)?;

        let name = self
            .shared
            .radio
            .local_name()
            .unwrap_or_else(|| UNKNOWN_SENDER.to_string());
        let message = ChatMessage::local(name, text);
        let bytes = encode_message(&message)?;

        if sender.send(&bytes).await {
            Ok(message)
        } else {
            Err(ConnectionError::SendFailed)
        }
    }

    /// Closes the listening endpoint and stream if open and returns to `Idle`.
    ///
    /// Safe to call any number of times.
    pub fn close_connection(&self) {
        self.shared.teardown(None);
    }

    /// Unsubscribes from the link-state feed, then closes the connection.
    pub fn release(&self) {
        if let Some(pump) = lock(&self.shared.link_pump).take() {
            pump.abort();
        }
        self.close_connection();
    }
}

impl Shared {
    fn slot(&self) -> MutexGuard<'_, Option<Session>> {
        lock(&self.slot)
    }

    fn ensure_idle(&self) -> Result<(), ConnectionError> {
        match self.slot().as_ref() {
            Some(s) => Err(ConnectionError::SessionAlreadyActive(*s.state_tx.borrow())),
            None => Ok(()),
        }
    }

    /// Reserves the slot for a new session in `initial` state.
    fn begin_session(
        &self,
        role: Role,
        initial: SessionState,
        remote: Option<Device>,
    ) -> Result<(u64, watch::Receiver<SessionState>), ConnectionError> {
        let mut slot = self.slot();
        if let Some(s) = slot.as_ref() {
            return Err(ConnectionError::SessionAlreadyActive(*s.state_tx.borrow()));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (state_tx, state_rx) = watch::channel(initial);
        *slot = Some(Session {
            id,
            role,
            state_tx,
            listener: None,
            sender: None,
            remote,
            task: None,
        });
        self.state_tx.send_replace(initial);
        debug!("session {id}: {role:?} {initial:?}");
        Ok((id, state_rx))
    }

    /// Runs `f` on session `id` if it is still the current one.
    fn with_session<R>(&self, id: u64, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        self.slot().as_mut().filter(|s| s.id == id).map(f)
    }

    fn set_state(&self, session: &Session, state: SessionState) {
        session.state_tx.send_replace(state);
        self.state_tx.send_replace(state);
        debug!("session {}: {state:?}", session.id);
    }

    fn attach_listener(&self, id: u64, listener: &Arc<dyn RadioListener>) -> bool {
        self.with_session(id, |s| s.listener = Some(Arc::clone(listener)))
            .is_some()
    }

    fn attach_task(&self, id: u64, task: AbortHandle) {
        let mut slot = self.slot();
        match slot.as_mut().filter(|s| s.id == id) {
            Some(session) => session.task = Some(task),
            // Closed before the task was registered: nothing left for it to do.
            None => task.abort(),
        }
    }

    /// Stores the stream's sender, closes the listener, and moves to `Connected`.
    fn mark_connected(&self, id: u64, sender: MessageSender, remote: Device) -> bool {
        self.with_session(id, |s| {
            if let Some(listener) = s.listener.take() {
                listener.close();
            }
            s.sender = Some(sender);
            s.remote = Some(remote);
            self.set_state(s, SessionState::Connected);
        })
        .is_some()
    }

    /// Repeat-mode server: closes the finished stream and forgets the peer.
    fn peer_left(&self, id: u64) -> bool {
        self.with_session(id, |s| {
            if let Some(sender) = s.sender.take() {
                sender.close();
            }
            s.remote = None;
        })
        .is_some()
    }

    /// Repeat-mode server: stores the new listener and goes back to listening.
    fn reset_to_listening(&self, id: u64, listener: &Arc<dyn RadioListener>) -> bool {
        self.with_session(id, |s| {
            s.listener = Some(Arc::clone(listener));
            self.set_state(s, SessionState::ListeningForInbound);
        })
        .is_some()
    }

    /// The single teardown routine.
    ///
    /// With `Some(id)` only that session is torn down; with `None` whatever
    /// session is current.  Closes the stream and listener exactly once, before
    /// returning, even though the session task may still hold references.
    fn teardown(&self, only: Option<u64>) {
        let session = {
            let mut slot = self.slot();
            let stale = matches!((slot.as_ref(), only), (Some(s), Some(id)) if s.id != id);
            if stale {
                None
            } else {
                slot.take()
            }
        };

        let Some(mut session) = session else {
            return;
        };

        let had_stream = session.sender.take().is_some_and(|sender| sender.close());
        let had_listener = session.listener.take().inspect(|listener| listener.close()).is_some();
        if let Some(task) = session.task.take() {
            task.abort();
        }
        session.state_tx.send_replace(SessionState::Closed);
        self.state_tx.send_replace(SessionState::Idle);
        info!(
            "session {} ({:?}) closed (stream: {had_stream}, listener: {had_listener})",
            session.id, session.role
        );
    }
}

/// Runs the teardown routine when the session task ends for any reason.
struct TeardownGuard {
    shared: Arc<Shared>,
    id: u64,
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        self.shared.teardown(Some(self.id));
    }
}

/// Why the relay loop stopped.
#[derive(Debug, PartialEq, Eq)]
enum RelayEnd {
    PeerClosed,
    Failed,
    ReceiverDropped,
}

async fn run_server(
    shared: Arc<Shared>,
    id: u64,
    listener: Arc<dyn RadioListener>,
    events: mpsc::Sender<ConnectionEvent>,
) {
    let mut listener = Some(listener);
    loop {
        let current = match listener.take() {
            Some(l) => l,
            None => match shared.radio.listen(shared.config.service_id).await {
                Ok(l) => {
                    let l: Arc<dyn RadioListener> = Arc::from(l);
                    if !shared.reset_to_listening(id, &l) {
                        l.close();
                        return;
                    }
                    l
                }
                Err(e) => {
                    warn!("session {id}: could not listen again: {e}");
                    let _ = events.send(ConnectionEvent::Error(CONNECTION_INTERRUPTED.to_string())).await;
                    return;
                }
            },
        };

        let accepted = tokio::select! {
            result = current.accept() => result,
            _ = events.closed() => return,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!("session {id}: {}", ConnectionError::ConnectionInterrupted(e));
                let _ = events.send(ConnectionEvent::Error(CONNECTION_INTERRUPTED.to_string())).await;
                return;
            }
        };
        // One peer per listen cycle: mark_connected closes the endpoint.
        drop(current);

        let (reader, sender) =
            TransferChannel::with_buffer_size(stream, shared.config.read_buffer_size).into_parts();
        info!("session {id}: accepted {peer}");
        if !shared.mark_connected(id, sender.clone(), peer) {
            sender.close();
            return;
        }
        if events.send(ConnectionEvent::Established).await.is_err() {
            return;
        }

        match relay(id, reader, &events).await {
            RelayEnd::PeerClosed if shared.config.accept_mode == AcceptMode::Repeat => {
                if !shared.peer_left(id) {
                    return;
                }
                info!("session {id}: peer left, accepting the next one");
                if events.send(ConnectionEvent::Disconnected).await.is_err() {
                    return;
                }
            }
            _ => return,
        }
    }
}

async fn run_client(
    shared: Arc<Shared>,
    id: u64,
    device: Device,
    events: mpsc::Sender<ConnectionEvent>,
) {
    let connected = tokio::select! {
        result = shared.radio.connect(&device, shared.config.service_id) => result,
        _ = events.closed() => return,
    };
    let stream = match connected {
        Ok(stream) => stream,
        Err(e) => {
            // Nothing was stored in the slot yet, so there is no stream
            // reference to clear; the guard tears the session down.
            warn!("session {id}: {}", ConnectionError::ConnectionInterrupted(e));
            let _ = events.send(ConnectionEvent::Error(CONNECTION_INTERRUPTED.to_string())).await;
            return;
        }
    };

    let (reader, sender) =
        TransferChannel::with_buffer_size(stream, shared.config.read_buffer_size).into_parts();
    info!("session {id}: connected to {device}");
    if !shared.mark_connected(id, sender.clone(), device) {
        sender.close();
        return;
    }
    if events.send(ConnectionEvent::Established).await.is_err() {
        return;
    }
    relay(id, reader, &events).await;
}

/// Forwards every decoded message to `events` until the sequence ends.
async fn relay(id: u64, mut reader: MessageReader, events: &mpsc::Sender<ConnectionEvent>) -> RelayEnd {
    loop {
        let next = tokio::select! {
            next = reader.next_message() => next,
            _ = events.closed() => return RelayEnd::ReceiverDropped,
        };
        match next {
            Ok(Some(msg)) => {
                debug!("session {id}: message from {}", msg.sender_name);
                if events.send(ConnectionEvent::MessageReceived(msg)).await.is_err() {
                    return RelayEnd::ReceiverDropped;
                }
            }
            Ok(None) => {
                info!("session {id}: peer disconnected");
                return RelayEnd::PeerClosed;
            }
            Err(e) => {
                warn!("session {id}: {e}");
                let _ = events.send(ConnectionEvent::Error(TRANSFER_FAILED.to_string())).await;
                return RelayEnd::Failed;
            }
        }
    }
}

fn spawn_link_pump(
    mut rx: broadcast::Receiver<LinkStateEvent>,
    registry: DeviceRegistry,
    connected_tx: Arc<watch::Sender<bool>>,
    errors_tx: broadcast::Sender<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("link-state feed lagged; {n} event(s) dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            if registry.is_paired(&event.device) {
                debug!("link to {} is now connected={}", event.device, event.connected);
                connected_tx.send_replace(event.connected);
            } else {
                let err = ConnectionError::UnpairedDevice(event.device.address.clone());
                debug!("{err}");
                let _ = errors_tx.send(UNPAIRED_DEVICE.to_string());
            }
        }
    })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Session handle ────────────────────────────────────────────────────────────

/// The caller's view of one session: its event stream and its lifecycle.
///
/// Dropping the handle ends the session as soon as the session task notices
/// the event receiver is gone.
pub struct SessionHandle {
    id: u64,
    role: Role,
    events: mpsc::Receiver<ConnectionEvent>,
    state: watch::Receiver<SessionState>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    fn new(
        id: u64,
        role: Role,
        events: mpsc::Receiver<ConnectionEvent>,
        state: watch::Receiver<SessionState>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            id,
            role,
            events,
            state,
            task,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// The next event, or `None` once the session is over.
    pub async fn next_event(&mut self) -> Option<ConnectionEvent> {
        self.events.recv().await
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Aborts the session task and waits for it to unwind.
    ///
    /// When this returns the stream and listener have been dropped and the
    /// session is `Closed`.
    pub async fn cancel(self) {
        self.task.abort();
        let _ = self.task.await;
    }

    /// Waits for the session task to finish on its own.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
