use std::{
    collections::HashMap,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, PoisonError, RwLock,
    },
};

use burrow_events::{EventBus, Listener, SubscriptionId};
use burrow_protocol::HubError;
use futures_util::Future;
use serde_json::Value;
use strum_macros::AsRefStr;
use tokio::sync::{mpsc, oneshot};

use crate::{
    callbacks::Callbacks,
    config::ClientConfig,
    connection::{connection_task, ClientCmd, TaskContext},
};

/// A registered local handler for inbound peer RPCs. Receives the opaque
/// request payload and resolves to the reply payload or an error that is
/// stringified into the `response` frame.
pub type ClientHandler =
    Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<Value, HubError>> + Send>> + Send + Sync>;

/// Where the client currently is in its connection lifecycle. Transitions
/// are serialized inside the connection task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Disconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// Handle to one hub connection.
///
/// Creating a client spawns its background connection task; dropping the
/// client stops the task and closes the transport.
pub struct HubClient {
    config: ClientConfig,
    cmd_tx: mpsc::UnboundedSender<ClientCmd>,
    handlers: Arc<RwLock<HashMap<String, ClientHandler>>>,
    bus: EventBus,
    callbacks: Arc<Callbacks>,
    state: Arc<RwLock<ConnectionState>>,
    name: Arc<RwLock<Option<String>>>,
    request_id: Arc<AtomicU64>,
}

impl HubClient {
    /// Creates the client and spawns its background connection task. The
    /// task idles until [`HubClient::connect`] is called.
    ///
    /// # Panics
    ///
    /// * If called outside a tokio runtime
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        let handlers: Arc<RwLock<HashMap<String, ClientHandler>>> =
            Arc::new(RwLock::new(HashMap::new()));
        let bus = EventBus::new();
        let callbacks = Arc::new(Callbacks::default());
        let state = Arc::new(RwLock::new(ConnectionState::Disconnected));
        let name = Arc::new(RwLock::new(config.name.clone()));
        let request_id = Arc::new(AtomicU64::new(0));

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        tokio::spawn(connection_task(
            TaskContext {
                config: config.clone(),
                handlers: Arc::clone(&handlers),
                bus: bus.clone(),
                callbacks: Arc::clone(&callbacks),
                state: Arc::clone(&state),
                name: Arc::clone(&name),
                request_id: Arc::clone(&request_id),
            },
            cmd_rx,
        ));

        log::info!("Client created: {:?}", config.name);

        Self {
            config,
            cmd_tx,
            handlers,
            bus,
            callbacks,
            state,
            name,
            request_id,
        }
    }

    /// Opens the connection and authenticates. Resolves once `auth_success`
    /// arrives; a repeated call while connected or connecting warns and
    /// returns immediately.
    ///
    /// # Errors
    ///
    /// * If the transport cannot be established
    /// * If the credentials are rejected
    pub async fn connect(&self) -> Result<(), HubError> {
        match self.state() {
            ConnectionState::Connected => {
                log::warn!("Already connected");
                return Ok(());
            }
            ConnectionState::Connecting => {
                log::warn!("Connection already in progress");
                return Ok(());
            }
            _ => {}
        }

        let (res_tx, res_rx) = oneshot::channel();
        self.cmd_tx
            .send(ClientCmd::Connect { res_tx })
            .map_err(|_| HubError::Connection("Client task stopped".into()))?;
        res_rx
            .await
            .map_err(|_| HubError::Connection("Client task stopped".into()))?
    }

    /// Closes the connection cleanly (code 1000) and suppresses
    /// reconnection. All pending requests are rejected.
    pub fn disconnect(&self) {
        let _ = self.cmd_tx.send(ClientCmd::Disconnect);
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// The canonical client name. Authoritative from `auth_success`; before
    /// the first authentication this is the configured name.
    #[must_use]
    pub fn name(&self) -> Option<String> {
        self.name
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Invokes `function_name` on the server and awaits the reply.
    ///
    /// # Errors
    ///
    /// * [`HubError::Connection`] when not connected or the transport closes
    /// * [`HubError::Timeout`] when the deadline elapses; a late reply is
    ///   dropped
    /// * [`HubError::HandlerNotFound`] / [`HubError::Handler`] from the
    ///   server's `response`
    pub async fn request(&self, function_name: &str, data: Value) -> Result<Value, HubError> {
        self.request_inner(None, function_name, data).await
    }

    /// Invokes `function_name` on another named client, routed through the
    /// server. Same outcome shape as [`HubClient::request`].
    ///
    /// # Errors
    ///
    /// * [`HubError::ClientNotFound`] when the target is not registered or
    ///   unavailable
    /// * Everything [`HubClient::request`] can return
    pub async fn request_client(
        &self,
        target_client: &str,
        function_name: &str,
        data: Value,
    ) -> Result<Value, HubError> {
        self.request_inner(Some(target_client), function_name, data)
            .await
    }

    async fn request_inner(
        &self,
        target: Option<&str>,
        function_name: &str,
        data: Value,
    ) -> Result<Value, HubError> {
        if !self.is_connected() {
            return Err(HubError::Connection("Client not connected".into()));
        }

        let id = (self.request_id.fetch_add(1, Ordering::SeqCst) + 1).to_string();
        let label = target.map_or_else(
            || function_name.to_string(),
            |target| format!("{target}.{function_name}"),
        );

        let (res_tx, res_rx) = oneshot::channel();
        self.cmd_tx
            .send(ClientCmd::Request {
                id: id.clone(),
                target: target.map(ToString::to_string),
                function_name: function_name.to_string(),
                data,
                res_tx,
            })
            .map_err(|_| HubError::Connection("Client task stopped".into()))?;

        match tokio::time::timeout(self.config.request_timeout, res_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(HubError::Connection("Connection closed".into())),
            Err(_) => {
                let _ = self.cmd_tx.send(ClientCmd::CancelRequest { id });
                Err(HubError::Timeout(label))
            }
        }
    }

    /// Publishes a fire-and-forget event. Warns (does not error or queue)
    /// when not connected.
    pub fn send_event(&self, event_name: &str, data: Value) {
        if !self.is_connected() {
            log::warn!("Cannot send event '{event_name}': not connected");
            return;
        }
        let _ = self.cmd_tx.send(ClientCmd::SendEvent {
            event_name: event_name.to_string(),
            data,
        });
        log::debug!("Event sent: {event_name}");
    }

    /// Registers a local handler consulted when an inbound peer RPC names
    /// `function_name`. Re-registering a name replaces the previous handler.
    pub fn add_handler<F, Fut>(&self, function_name: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HubError>> + Send + 'static,
    {
        let handler: ClientHandler = Arc::new(move |data| Box::pin(handler(data)));
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(function_name.to_string(), handler);
        log::debug!("Handler added: {function_name}");
    }

    /// Removes a local handler; returns whether one was registered.
    pub fn remove_handler(&self, function_name: &str) -> bool {
        let removed = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(function_name)
            .is_some();
        if removed {
            log::debug!("Handler removed: {function_name}");
        }
        removed
    }

    /// The client event bus: inbound `event` frames dispatch here with
    /// `(data, fromClient)`.
    #[must_use]
    pub const fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Subscribes to a named event. Shorthand for `bus().on`.
    pub fn on(&self, event_name: &str, listener: Listener) -> SubscriptionId {
        self.bus.on(event_name, listener)
    }

    /// Subscribes to the first matching event only. Shorthand for
    /// `bus().once`.
    pub fn once(&self, event_name: &str, listener: Listener) -> SubscriptionId {
        self.bus.once(event_name, listener)
    }

    /// Removes one subscription by id, or all for the name. Shorthand for
    /// `bus().off`.
    pub fn off(&self, event_name: &str, id: Option<SubscriptionId>) -> bool {
        self.bus.off(event_name, id)
    }

    pub fn on_connected<F>(&self, f: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.add_connected(Box::new(f));
    }

    pub fn on_disconnected<F>(&self, f: F)
    where
        F: Fn(Option<u16>, &str) + Send + Sync + 'static,
    {
        self.callbacks.add_disconnected(Box::new(f));
    }

    pub fn on_error<F>(&self, f: F)
    where
        F: Fn(&HubError) + Send + Sync + 'static,
    {
        self.callbacks.add_error(Box::new(f));
    }

    pub fn on_state_change<F>(&self, f: F)
    where
        F: Fn(ConnectionState, ConnectionState) + Send + Sync + 'static,
    {
        self.callbacks.add_state_change(Box::new(f));
    }

    pub fn on_server_shutdown<F>(&self, f: F)
    where
        F: Fn(Option<&str>, Option<u64>) + Send + Sync + 'static,
    {
        self.callbacks.add_server_shutdown(Box::new(f));
    }
}

impl std::fmt::Debug for HubClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubClient")
            .field("url", &self.config.url)
            .field("name", &self.name())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
