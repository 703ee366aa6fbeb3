//! # The Connection Engine
//!
//! [`Connection`] is the user-facing handle: it drives the lifecycle state
//! machine, owns the serial allocator, and forwards traffic to the
//! per-connection event loop in [`engine`]. The handle is cheap to clone;
//! all clones share one underlying connection.
//!
//! A successful [`Connection::connect`] walks `disconnected → connecting →
//! authenticating → connected`: socket establishment, the SASL handshake,
//! then the mandatory `Hello` call whose reply carries the daemon-assigned
//! unique bus name. Every attempt is guarded by the circuit breaker; drops
//! after establishment feed the reconnect controller.

pub(crate) mod engine;
pub(crate) mod pending;
mod state;

pub use state::ConnectionState;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::address::BusAddress;
use crate::circuit::CircuitBreaker;
use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::events::{ConnectionEvent, EventBus};
use crate::message::Message;
use crate::pipeline::{Handler, UserEvent};
use crate::sasl::Authenticator;
use crate::transport::{AddressConnector, Connector};
use crate::types::Value;
use crate::{health, reconnect};

use engine::{Command, Engine, EngineExit};
use pending::SerialAllocator;

/// A live engine attachment: the command channel plus what the handshake
/// produced.
pub(crate) struct Session {
    pub(crate) cmd_tx: mpsc::UnboundedSender<Command>,
    pub(crate) bus_name: String,
    pub(crate) guid: String,
    pub(crate) health_task: Option<JoinHandle<()>>,
}

impl Session {
    fn teardown_tasks(&mut self) {
        if let Some(task) = self.health_task.take() {
            task.abort();
        }
    }
}

pub(crate) struct ConnectionInner {
    pub(crate) config: ConnectionConfig,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) authenticator: Authenticator,
    pub(crate) serials: Arc<SerialAllocator>,
    pub(crate) events: EventBus,
    pub(crate) circuit: CircuitBreaker,
    state: Mutex<ConnectionState>,
    pub(crate) session: Mutex<Option<Session>>,
    /// Serializes connect() attempts; try-locked so a second caller fails
    /// fast with `already_in_progress`.
    connect_lock: tokio::sync::Mutex<()>,
    /// Set while close() runs so a racing engine exit does not spawn a
    /// reconnect loop.
    closing: AtomicBool,
    pub(crate) reconnect_attempts: AtomicU32,
    pub(crate) reconnect_cancel: Mutex<Option<watch::Sender<bool>>>,
}

impl ConnectionInner {
    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.lock().expect("state lock")
    }

    /// Transition with event emission. Same-state transitions are silent.
    pub(crate) fn set_state(&self, new: ConnectionState) {
        let mut state = self.state.lock().expect("state lock");
        let old = *state;
        if old == new {
            return;
        }
        if !old.can_transition_to(new) {
            warn!(%old, %new, "state transition outside the lifecycle graph");
        }
        *state = new;
        drop(state);
        debug!(%old, %new, "connection state changed");
        self.events
            .emit(ConnectionEvent::StateChanged { old, new });
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub(crate) fn command_channel(&self) -> Result<mpsc::UnboundedSender<Command>> {
        if !self.state().can_handle_requests() {
            return Err(Error::NotActive);
        }
        self.session
            .lock()
            .expect("session lock")
            .as_ref()
            .map(|s| s.cmd_tx.clone())
            .ok_or(Error::NotActive)
    }

    /// One full establishment: socket, SASL, engine spawn, Hello,
    /// activation. `quiet` suppresses the intermediate state emissions so
    /// reconnect attempts surface only `reconnecting → connected`.
    pub(crate) async fn establish(self: &Arc<Self>, quiet: bool) -> Result<()> {
        let attempt = async {
            if !quiet {
                self.set_state(ConnectionState::Connecting);
            }
            let mut stream = self.connector.connect().await?;
            if !quiet {
                self.set_state(ConnectionState::Authenticating);
            }
            let outcome = self.authenticator.authenticate(&mut stream).await?;

            let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
            let engine = Engine::new(
                stream,
                outcome.leftover,
                self.serials.clone(),
                cmd_rx,
                &self.config,
            );
            let engine_task = tokio::spawn(engine.run());

            match self.say_hello(&cmd_tx).await {
                Ok(bus_name) => Ok((cmd_tx, engine_task, outcome.guid, bus_name)),
                Err(error) => {
                    // Dropping the only sender shuts the engine down.
                    drop(cmd_tx);
                    let _ = engine_task.await;
                    Err(error)
                }
            }
        };

        let (cmd_tx, engine_task, guid, bus_name) =
            match tokio::time::timeout(self.config.connect_timeout, attempt).await {
                Ok(Ok(parts)) => parts,
                Ok(Err(error)) => return Err(error),
                Err(_) => {
                    return Err(Error::TransportIo(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "connect timed out",
                    )))
                }
            };

        let _ = cmd_tx.send(Command::Activate);
        debug!(bus_name = bus_name.as_str(), "bus name acquired");

        let health_task = if self.config.health_check_enabled {
            Some(health::spawn(self.clone()))
        } else {
            None
        };
        *self.session.lock().expect("session lock") = Some(Session {
            cmd_tx,
            bus_name,
            guid,
            health_task,
        });
        self.set_state(ConnectionState::Connected);

        supervise(self.clone(), engine_task);
        Ok(())
    }

    /// The mandatory Hello exchange; the reply body is the assigned
    /// unique bus name.
    async fn say_hello(&self, cmd_tx: &mpsc::UnboundedSender<Command>) -> Result<String> {
        let hello = Message::method_call("/org/freedesktop/DBus", "Hello")
            .interface("org.freedesktop.DBus")
            .destination("org.freedesktop.DBus")
            .serial(self.serials.next())
            .build()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        cmd_tx
            .send(Command::SendRequest {
                message: hello,
                reply: reply_tx,
            })
            .map_err(|_| Error::Closed)?;
        let reply = reply_rx
            .await
            .map_err(|_| Error::Closed)?
            .map_err(|error| Error::HelloFailed(error.to_string()))?;
        match reply.body().first() {
            Some(Value::Str(name)) => Ok(name.clone()),
            _ => Err(Error::HelloFailed(
                "Hello reply body is not a string".into(),
            )),
        }
    }

    /// Engine died on its own: clear the session and either reconnect or
    /// fail, per configuration.
    fn on_connection_lost(self: &Arc<Self>, error: Error) {
        warn!(%error, "connection lost");
        if let Some(mut session) = self.session.lock().expect("session lock").take() {
            session.teardown_tasks();
        }
        if self.is_closing() {
            return;
        }
        if self.config.auto_reconnect_enabled {
            self.set_state(ConnectionState::Reconnecting);
            reconnect::spawn(self.clone());
        } else {
            self.set_state(ConnectionState::Failed);
        }
    }

    pub(crate) fn cancel_reconnect_timer(&self) {
        if let Some(cancel) = self
            .reconnect_cancel
            .lock()
            .expect("reconnect cancel lock")
            .take()
        {
            let _ = cancel.send(true);
        }
    }
}

/// Watch the engine task and feed unexpected exits into the recovery path.
fn supervise(inner: Arc<ConnectionInner>, engine_task: JoinHandle<EngineExit>) {
    tokio::spawn(async move {
        match engine_task.await {
            Ok(EngineExit::Closed) => {}
            Ok(EngineExit::Fatal(error)) => inner.on_connection_lost(error),
            Err(join_error) => {
                inner.on_connection_lost(Error::TransportIo(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("engine task failed: {join_error}"),
                )))
            }
        }
    });
}

/// A handle on one client connection to a message bus.
///
/// Clone freely; all clones address the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::new()
    }

    /// Drive the state machine to `connected` (or `failed`).
    ///
    /// Exactly one attempt may be in flight; a concurrent call fails with
    /// `already_in_progress`. Attempts are admitted by the circuit
    /// breaker.
    pub async fn connect(&self) -> Result<()> {
        let _guard = self
            .inner
            .connect_lock
            .try_lock()
            .map_err(|_| Error::AlreadyInProgress)?;

        let state = self.inner.state();
        if state.can_handle_requests() {
            return Err(Error::AlreadyConnected);
        }
        if state.is_transitioning() {
            return Err(Error::AlreadyInProgress);
        }

        self.inner.circuit.check()?;
        match self.inner.establish(false).await {
            Ok(()) => {
                self.inner.circuit.record_success();
                Ok(())
            }
            Err(error) => {
                self.inner.circuit.record_failure();
                self.inner.set_state(ConnectionState::Failed);
                Err(error)
            }
        }
    }

    /// Shut down: cancel reconnection, drain pending calls with `closed`,
    /// release the socket. Idempotent; a second call observes
    /// `disconnected` and returns.
    pub async fn close(&self) -> Result<()> {
        self.inner.closing.store(true, Ordering::SeqCst);
        self.inner.cancel_reconnect_timer();

        let session = self.inner.session.lock().expect("session lock").take();
        if let Some(mut session) = session {
            session.teardown_tasks();
            let (done_tx, done_rx) = oneshot::channel();
            if session.cmd_tx.send(Command::Close { done: done_tx }).is_ok() {
                // Bounded drain; an unresponsive engine is abandoned.
                let _ = tokio::time::timeout(self.inner.config.close_timeout, done_rx).await;
            }
        }

        self.inner.set_state(ConnectionState::Disconnected);
        self.inner.closing.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Allocate the next outgoing serial: monotonically increasing,
    /// wrapping, never zero. Exposed for callers that pre-build frames;
    /// `send*` stamp unserialed messages automatically.
    pub fn next_serial(&self) -> u32 {
        self.inner.serials.next()
    }

    /// Register a lifecycle event observer.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// The `:N.M` name assigned on Hello, while connected.
    pub fn assigned_bus_name(&self) -> Option<String> {
        self.inner
            .session
            .lock()
            .expect("session lock")
            .as_ref()
            .map(|s| s.bus_name.clone())
    }

    /// The server GUID from the SASL handshake, while connected.
    pub fn server_guid(&self) -> Option<String> {
        self.inner
            .session
            .lock()
            .expect("session lock")
            .as_ref()
            .map(|s| s.guid.clone())
    }

    fn stamp(&self, mut message: Message) -> Message {
        if message.serial == 0 {
            message.serial = self.inner.serials.next();
        }
        message
    }

    /// Fire-and-forget: completes when the bytes are with the transport.
    pub async fn send(&self, message: Message) -> Result<()> {
        let cmd_tx = self.inner.command_channel()?;
        let message = self.stamp(message);
        let (done_tx, done_rx) = oneshot::channel();
        cmd_tx
            .send(Command::Send {
                message,
                done: done_tx,
            })
            .map_err(|_| Error::NotActive)?;
        done_rx.await.map_err(|_| Error::Closed)?
    }

    /// Correlated call: registers a pending entry keyed by the serial and
    /// completes with the matching reply, `timeout`, or `closed`. Dropping
    /// the returned future cancels the interest in the reply.
    pub async fn send_request(&self, message: Message) -> Result<Message> {
        let cmd_tx = self.inner.command_channel()?;
        let message = self.stamp(message);
        let (reply_tx, reply_rx) = oneshot::channel();
        cmd_tx
            .send(Command::SendRequest {
                message,
                reply: reply_tx,
            })
            .map_err(|_| Error::NotActive)?;
        reply_rx.await.map_err(|_| Error::Closed)?
    }

    /// Like [`Connection::send`], but the eventual reply is delivered
    /// through the inbound pipeline instead of a sink. The returned future
    /// acknowledges the write.
    pub async fn send_and_route_response(&self, message: Message) -> Result<()> {
        let cmd_tx = self.inner.command_channel()?;
        let message = self.stamp(message);
        let (done_tx, done_rx) = oneshot::channel();
        cmd_tx
            .send(Command::SendRouted {
                message,
                done: done_tx,
            })
            .map_err(|_| Error::NotActive)?;
        done_rx.await.map_err(|_| Error::Closed)?
    }

    /// Append a named handler to the pipeline (just before the tail).
    pub async fn add_handler(&self, name: &str, handler: Box<dyn Handler>) -> Result<()> {
        let cmd_tx = self.inner.command_channel()?;
        let (done_tx, done_rx) = oneshot::channel();
        cmd_tx
            .send(Command::AddHandler {
                name: name.to_owned(),
                handler,
                done: done_tx,
            })
            .map_err(|_| Error::NotActive)?;
        done_rx.await.map_err(|_| Error::Closed)?
    }

    /// Remove a named handler from the pipeline.
    pub async fn remove_handler(&self, name: &str) -> Result<()> {
        let cmd_tx = self.inner.command_channel()?;
        let (done_tx, done_rx) = oneshot::channel();
        cmd_tx
            .send(Command::RemoveHandler {
                name: name.to_owned(),
                done: done_tx,
            })
            .map_err(|_| Error::NotActive)?;
        done_rx.await.map_err(|_| Error::Closed)?
    }

    /// Inject a user event at the head of the pipeline.
    pub fn fire_user_event(&self, event: UserEvent) -> Result<()> {
        let cmd_tx = self.inner.command_channel()?;
        cmd_tx
            .send(Command::FireUserEvent { event })
            .map_err(|_| Error::NotActive)
    }

    /// One on-demand liveness probe (the same Ping the health monitor
    /// issues), bounded by `health_check_timeout`.
    pub async fn trigger_health_check(&self) -> Result<()> {
        health::probe(&self.inner).await
    }

    /// Number of reconnection attempts made since the last reset.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Zero the reconnection attempt counter.
    pub fn reset_reconnection_state(&self) {
        self.inner.reconnect_attempts.store(0, Ordering::SeqCst);
    }

    /// Stop a reconnection loop in progress. The connection transitions
    /// to `failed` and stays there until the next manual `connect()`.
    pub fn cancel_reconnection(&self) {
        self.inner.cancel_reconnect_timer();
    }
}

/// Assembles a [`Connection`].
pub struct ConnectionBuilder {
    target: Option<Target>,
    config: ConnectionConfig,
    authenticator: Authenticator,
}

enum Target {
    Address(BusAddress),
    Session,
    System,
    Custom(Arc<dyn Connector>),
}

impl Default for ConnectionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionBuilder {
    pub fn new() -> Self {
        ConnectionBuilder {
            target: None,
            config: ConnectionConfig::default(),
            authenticator: Authenticator::new(),
        }
    }

    /// Connect to an explicit bus address.
    pub fn address(mut self, address: BusAddress) -> Self {
        self.target = Some(Target::Address(address));
        self
    }

    /// Connect to the session bus from the environment.
    pub fn session_bus(mut self) -> Self {
        self.target = Some(Target::Session);
        self
    }

    /// Connect to the system bus from the environment, with the
    /// well-known fallback.
    pub fn system_bus(mut self) -> Self {
        self.target = Some(Target::System);
        self
    }

    /// Use a custom transport connector (tests, tunnels).
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.target = Some(Target::Custom(connector));
        self
    }

    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Override SASL parameters (identity, keyring, mechanism order).
    pub fn authenticator(mut self, authenticator: Authenticator) -> Self {
        self.authenticator = authenticator;
        self
    }

    pub fn build(self) -> Result<Connection> {
        self.config.validate()?;
        let connector: Arc<dyn Connector> = match self.target {
            Some(Target::Custom(connector)) => connector,
            Some(Target::Address(address)) => Arc::new(AddressConnector::new(address)),
            Some(Target::Session) => Arc::new(AddressConnector::new(BusAddress::session()?)),
            Some(Target::System) => Arc::new(AddressConnector::new(BusAddress::system()?)),
            None => return Err(Error::Config("no bus address or connector given".into())),
        };
        let recovery_timeout = self.config.connect_timeout * 2;
        Ok(Connection {
            inner: Arc::new(ConnectionInner {
                config: self.config,
                connector,
                authenticator: self.authenticator,
                serials: Arc::new(SerialAllocator::new()),
                events: EventBus::new(),
                circuit: CircuitBreaker::new(recovery_timeout),
                state: Mutex::new(ConnectionState::Disconnected),
                session: Mutex::new(None),
                connect_lock: tokio::sync::Mutex::new(()),
                closing: AtomicBool::new(false),
                reconnect_attempts: AtomicU32::new(0),
                reconnect_cancel: Mutex::new(None),
            }),
        })
    }
}
