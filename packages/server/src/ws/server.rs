use std::{
    collections::HashMap,
    pin::Pin,
    sync::{Arc, PoisonError, RwLock},
    time::Instant,
};

use burrow_events::EventBus;
use burrow_protocol::{close, Frame, HubError};
use futures_util::Future;
use rand::{thread_rng, Rng as _};
use serde_json::{json, Value};
use strum_macros::AsRefStr;
use thiserror::Error;
use tokio::{
    sync::{
        mpsc::{self, UnboundedSender},
        oneshot,
    },
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{ConfigError, ServerConfig},
    credentials::CredentialStore,
    ws::{ConnId, SessionMessage},
};

/// A registered server RPC handler. Receives the opaque request payload and
/// resolves to the reply payload or an error that is stringified into the
/// `response` frame.
pub type ServerHandler =
    Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<Value, HubError>> + Send>> + Send + Sync>;

/// A command received by the [`HubServer`] actor.
#[derive(Debug, AsRefStr)]
pub enum Command {
    Connect {
        conn_tx: UnboundedSender<SessionMessage>,
        res_tx: oneshot::Sender<Result<ConnId, ConnectError>>,
    },

    Authenticate {
        conn: ConnId,
        token: String,
        name: Option<String>,
        res_tx: oneshot::Sender<Result<String, HubError>>,
    },

    Disconnect {
        conn: ConnId,
    },

    Frame {
        conn: ConnId,
        frame: Frame,
    },

    EvictName {
        name: String,
    },

    SweepHeartbeats,

    GracefulShutdown {
        reason: Option<String>,
        done_tx: oneshot::Sender<()>,
    },

    FinishShutdown,
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// Why an inbound connection was rejected before authentication.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Server at connection capacity")]
    AtCapacity,
    #[error("Server is shutting down")]
    ShuttingDown,
    #[error("Hub actor is not running")]
    Unavailable,
}

/// One live connection, pre- or post-authentication.
///
/// Holds nothing beyond the transport handle, the assigned name, the
/// authenticated flag, and the last-heartbeat stamp.
#[derive(Debug)]
struct Session {
    conn_tx: UnboundedSender<SessionMessage>,
    name: Option<String>,
    authenticated: bool,
    last_heartbeat: Instant,
}

/// The hub actor: session registry, frame router, heartbeat bookkeeping, and
/// shutdown orchestration.
///
/// Commands are processed strictly in order, so registry mutations and
/// routing decisions are serialized. Per-connection outbound writes funnel
/// through that connection's [`SessionMessage`] channel into the handler
/// loop, which is the sole writer of its transport.
pub struct HubServer {
    config: ServerConfig,
    credentials: CredentialStore,
    sessions: HashMap<ConnId, Session>,
    names: HashMap<String, ConnId>,
    handlers: Arc<RwLock<HashMap<String, ServerHandler>>>,
    bus: EventBus,
    shutting_down: bool,
    shutdown_complete: bool,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
    heartbeat_token: CancellationToken,
}

impl HubServer {
    /// # Errors
    ///
    /// * If the configuration is invalid
    pub fn new(config: ServerConfig, credentials: CredentialStore) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            credentials,
            sessions: HashMap::new(),
            names: HashMap::new(),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            bus: EventBus::new(),
            shutting_down: false,
            shutdown_complete: false,
            shutdown_waiters: Vec::new(),
            heartbeat_token: CancellationToken::new(),
        })
    }

    /// Spawns the actor and its heartbeat supervisor, returning the command
    /// handle and the actor's join handle.
    pub fn start(mut self) -> (HubHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        self.heartbeat_token = token.child_token();

        let handle = HubHandle {
            tx: tx.clone(),
            handlers: Arc::clone(&self.handlers),
            bus: self.bus.clone(),
            credentials: self.credentials.clone(),
            token,
        };

        let sweep_tx = tx;
        let sweep_token = self.heartbeat_token.clone();
        let period = self.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = sweep_token.cancelled() => break,
                    _ = interval.tick() => {
                        if sweep_tx.send(Command::SweepHeartbeats).is_err() {
                            break;
                        }
                    }
                }
            }
            log::debug!("Heartbeat supervisor stopped");
        });

        let join = tokio::spawn(self.run(rx, handle.clone()));

        (handle, join)
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>, handle: HubHandle) {
        loop {
            tokio::select! {
                () = handle.token.cancelled() => break,
                command = rx.recv() => match command {
                    Some(command) => self.process_command(command, &handle),
                    None => break,
                }
            }
        }
        log::debug!("Hub actor stopped");
    }

    fn process_command(&mut self, command: Command, handle: &HubHandle) {
        log::trace!("process_command command={command}");
        match command {
            Command::Connect { conn_tx, res_tx } => {
                let result = self.connect(conn_tx);
                if let Err(error) = res_tx.send(result) {
                    // handler loop already gone; roll the registration back
                    if let Ok(conn) = error {
                        self.sessions.remove(&conn);
                    }
                }
            }

            Command::Authenticate {
                conn,
                token,
                name,
                res_tx,
            } => {
                let result = self.authenticate(conn, &token, name.as_deref());
                let _ = res_tx.send(result);
            }

            Command::Disconnect { conn } => {
                if let Some(session) = self.sessions.remove(&conn) {
                    if let Some(name) = session.name {
                        if self.names.get(&name) == Some(&conn) {
                            self.names.remove(&name);
                        }
                        log::info!("Client '{name}' disconnected conn_id={conn}");
                        self.bus.emit("clientDisconnected", &json!(name), None);
                    } else {
                        log::debug!("Unauthenticated connection {conn} closed");
                    }
                }
            }

            Command::Frame { conn, frame } => self.route_frame(conn, frame),

            Command::EvictName { name } => {
                if let Some(&conn) = self.names.get(&name) {
                    if let Some(name) =
                        self.close_session(conn, close::NORMAL, "User removed")
                    {
                        log::info!("Evicted removed user '{name}'");
                        self.bus.emit("clientDisconnected", &json!(name), None);
                    }
                }
            }

            Command::SweepHeartbeats => self.sweep_heartbeats(),

            Command::GracefulShutdown { reason, done_tx } => {
                self.graceful_shutdown(reason, done_tx, handle);
            }

            Command::FinishShutdown => self.finish_shutdown(),
        }
    }

    fn connect(
        &mut self,
        conn_tx: UnboundedSender<SessionMessage>,
    ) -> Result<ConnId, ConnectError> {
        if self.shutting_down || self.shutdown_complete {
            return Err(ConnectError::ShuttingDown);
        }
        if self.sessions.len() >= self.config.max_connections {
            log::warn!(
                "Rejecting connection: at capacity ({})",
                self.config.max_connections
            );
            return Err(ConnectError::AtCapacity);
        }

        let mut conn = thread_rng().gen::<usize>();
        while self.sessions.contains_key(&conn) {
            conn = thread_rng().gen::<usize>();
        }

        self.sessions.insert(
            conn,
            Session {
                conn_tx,
                name: None,
                authenticated: false,
                last_heartbeat: Instant::now(),
            },
        );
        log::debug!("connect: registered conn_id={conn}");

        Ok(conn)
    }

    fn authenticate(
        &mut self,
        conn: ConnId,
        token: &str,
        name: Option<&str>,
    ) -> Result<String, HubError> {
        if !self.sessions.contains_key(&conn) {
            return Err(HubError::Connection(
                "Session closed during authentication".into(),
            ));
        }

        let Some(assigned) = self.credentials.validate(token, name) else {
            log::warn!("Authentication failed for conn_id={conn}");
            return Err(HubError::Authentication("Invalid credentials".into()));
        };

        // displace-old: the incoming connection wins the name
        if let Some(&old) = self.names.get(&assigned) {
            if old != conn {
                log::info!("Displacing existing session for '{assigned}' conn_id={old}");
                if let Some(name) =
                    self.close_session(old, close::NORMAL, "Replaced by new connection")
                {
                    self.bus.emit("clientDisconnected", &json!(name), None);
                }
            }
        }

        if let Some(session) = self.sessions.get_mut(&conn) {
            session.name = Some(assigned.clone());
            session.authenticated = true;
            session.last_heartbeat = Instant::now();
        }
        self.names.insert(assigned.clone(), conn);

        self.send_to(
            conn,
            &Frame::AuthSuccess {
                name: assigned.clone(),
            },
        );
        log::info!("Client '{assigned}' authenticated conn_id={conn}");
        self.bus.emit("clientConnected", &json!(assigned), None);

        Ok(assigned)
    }

    fn route_frame(&mut self, conn: ConnId, frame: Frame) {
        let Some(session) = self.sessions.get_mut(&conn) else {
            log::debug!("Dropping {frame} frame from unknown conn_id={conn}");
            return;
        };
        if !session.authenticated {
            log::warn!("Dropping {frame} frame from unauthenticated conn_id={conn}");
            return;
        }
        let Some(from) = session.name.clone() else {
            log::error!("Authenticated session without a name conn_id={conn}");
            return;
        };

        match frame {
            Frame::HeartbeatResponse => {
                session.last_heartbeat = Instant::now();
            }
            Frame::Request {
                id,
                function_name,
                data,
            } => self.handle_request(conn, id, &function_name, data),
            Frame::ClientRequest {
                id,
                function_name,
                data,
                target_client,
                ..
            } => self.forward_client_request(conn, &from, id, function_name, data, target_client),
            Frame::Response {
                id,
                success,
                data,
                error,
                original_from_client,
            } => self.forward_response(id, success, data, error, original_from_client),
            Frame::Event {
                event_name, data, ..
            } => self.fan_out_event(conn, &from, &event_name, data),
            Frame::Auth { .. } => {
                log::debug!("Ignoring repeated auth from '{from}'");
            }
            Frame::AuthSuccess { .. } | Frame::Heartbeat | Frame::Shutdown { .. } => {
                log::warn!("Dropping server-bound {frame} frame from '{from}'");
            }
        }
    }

    fn handle_request(&self, conn: ConnId, id: String, function_name: &str, data: Value) {
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(function_name)
            .cloned();

        let Some(handler) = handler else {
            log::debug!("No handler registered for '{function_name}'");
            self.send_to(
                conn,
                &Frame::Response {
                    id,
                    success: false,
                    data: None,
                    error: Some("Handler not found".into()),
                    original_from_client: None,
                },
            );
            return;
        };

        let Some(session) = self.sessions.get(&conn) else {
            return;
        };
        let conn_tx = session.conn_tx.clone();
        let function_name = function_name.to_string();

        tokio::spawn(async move {
            let response = match handler(data).await {
                Ok(value) => Frame::Response {
                    id,
                    success: true,
                    data: Some(value),
                    error: None,
                    original_from_client: None,
                },
                Err(e) => {
                    log::debug!("Handler '{function_name}' failed: {e:?}");
                    Frame::Response {
                        id,
                        success: false,
                        data: None,
                        error: Some(e.to_string()),
                        original_from_client: None,
                    }
                }
            };
            match response.encode() {
                Ok(text) => {
                    let _ = conn_tx.send(SessionMessage::Text(text));
                }
                Err(e) => log::error!("Failed to encode '{function_name}' response: {e:?}"),
            }
        });
    }

    fn forward_client_request(
        &self,
        conn: ConnId,
        from: &str,
        id: String,
        function_name: String,
        data: Value,
        target_client: String,
    ) {
        let forwarded = Frame::ClientRequest {
            id: id.clone(),
            function_name,
            data,
            target_client: target_client.clone(),
            // stamped with the caller's registered name; any client-supplied
            // value is overwritten
            from_client: Some(from.to_string()),
        };

        let error = match self
            .names
            .get(&target_client)
            .and_then(|target| self.sessions.get(target))
        {
            None => {
                log::debug!("Peer request from '{from}' to unknown client '{target_client}'");
                Some("Target client not found")
            }
            Some(target) => match forwarded.encode() {
                Ok(text) => {
                    if target.conn_tx.send(SessionMessage::Text(text)).is_ok() {
                        None
                    } else {
                        log::debug!("Peer '{target_client}' transport already closed");
                        Some("Target client not available")
                    }
                }
                Err(e) => {
                    log::error!("Failed to encode peer request for '{target_client}': {e:?}");
                    Some("Target client not available")
                }
            },
        };

        if let Some(error) = error {
            self.send_to(
                conn,
                &Frame::Response {
                    id,
                    success: false,
                    data: None,
                    error: Some(error.into()),
                    original_from_client: None,
                },
            );
        }
    }

    fn forward_response(
        &self,
        id: String,
        success: bool,
        data: Option<Value>,
        error: Option<String>,
        original_from_client: Option<String>,
    ) {
        let Some(origin) = original_from_client else {
            log::debug!("Dropping response id={id} without originalFromClient");
            return;
        };
        let Some(&conn) = self.names.get(&origin) else {
            log::debug!("Dropping response id={id}: origin '{origin}' no longer connected");
            return;
        };
        self.send_to(
            conn,
            &Frame::Response {
                id,
                success,
                data,
                error,
                original_from_client: Some(origin),
            },
        );
    }

    fn fan_out_event(&self, conn: ConnId, from: &str, event_name: &str, data: Value) {
        self.bus.emit(event_name, &data, Some(from));

        let mut enriched = data;
        if let Value::Object(map) = &mut enriched {
            map.insert("fromClient".into(), json!(from));
        }
        let frame = Frame::Event {
            event_name: event_name.to_string(),
            data: enriched,
            from_client: Some(from.to_string()),
        };

        let text = match frame.encode() {
            Ok(text) => text,
            Err(e) => {
                log::error!("Failed to encode event '{event_name}': {e:?}");
                return;
            }
        };

        for (id, session) in &self.sessions {
            if *id == conn || !session.authenticated {
                continue;
            }
            // errors if the peer disconnected abruptly and hasn't been
            // deregistered yet
            if session.conn_tx.send(SessionMessage::Text(text.clone())).is_err() {
                log::debug!("Skipping event fan-out to closed conn_id={id}");
            }
        }
    }

    fn sweep_heartbeats(&mut self) {
        if self.shutting_down {
            return;
        }
        let timeout = self.config.heartbeat_timeout;

        let expired: Vec<ConnId> = self
            .sessions
            .iter()
            .filter(|(_, session)| {
                session.authenticated && session.last_heartbeat.elapsed() > timeout
            })
            .map(|(conn, _)| *conn)
            .collect();

        for conn in expired {
            if let Some(name) = self.close_session(conn, close::NORMAL, "Heartbeat timeout") {
                log::info!("Client '{name}' has not answered heartbeats in {timeout:?}; evicting");
                self.bus.emit("clientTimeout", &json!(name), None);
            }
        }

        if let Ok(probe) = Frame::Heartbeat.encode() {
            for session in self.sessions.values().filter(|s| s.authenticated) {
                let _ = session.conn_tx.send(SessionMessage::Text(probe.clone()));
            }
        }
    }

    fn graceful_shutdown(
        &mut self,
        reason: Option<String>,
        done_tx: oneshot::Sender<()>,
        handle: &HubHandle,
    ) {
        if self.shutdown_complete {
            let _ = done_tx.send(());
            return;
        }
        self.shutdown_waiters.push(done_tx);
        if self.shutting_down {
            // concurrent callers share the in-flight completion
            return;
        }
        self.shutting_down = true;
        self.heartbeat_token.cancel();

        let grace = self.config.graceful_shutdown_timeout;
        log::info!("Graceful shutdown started reason={reason:?} grace={grace:?}");

        let frame = Frame::Shutdown {
            reason,
            grace_period: Some(u64::try_from(grace.as_millis()).unwrap_or(u64::MAX)),
        };
        if let Ok(text) = frame.encode() {
            for session in self.sessions.values().filter(|s| s.authenticated) {
                let _ = session.conn_tx.send(SessionMessage::Text(text.clone()));
            }
        }

        let tx = handle.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = tx.send(Command::FinishShutdown);
        });
    }

    fn finish_shutdown(&mut self) {
        let remaining: Vec<ConnId> = self.sessions.keys().copied().collect();
        for conn in remaining {
            self.close_session(conn, close::GOING_AWAY, "Server shutdown");
        }
        self.shutdown_complete = true;
        self.bus.emit("closed", &Value::Null, None);
        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(());
        }
        log::info!("Graceful shutdown complete");
    }

    /// Removes the session from both maps and tells its handler loop to
    /// close the transport. Returns the deregistered name, if any.
    fn close_session(&mut self, conn: ConnId, code: u16, reason: &str) -> Option<String> {
        let session = self.sessions.remove(&conn)?;
        if let Some(name) = &session.name {
            if self.names.get(name) == Some(&conn) {
                self.names.remove(name);
            }
        }
        let _ = session.conn_tx.send(SessionMessage::Close {
            code,
            reason: reason.to_string(),
        });
        session.name
    }

    fn send_to(&self, conn: ConnId, frame: &Frame) {
        let Some(session) = self.sessions.get(&conn) else {
            log::debug!("Dropping outbound {frame} frame: conn_id={conn} gone");
            return;
        };
        match frame.encode() {
            Ok(text) => {
                // errors if the handler loop exited and hasn't deregistered yet
                if session.conn_tx.send(SessionMessage::Text(text)).is_err() {
                    log::debug!("Outbound {frame} frame dropped: conn_id={conn} closed");
                }
            }
            Err(e) => log::error!("Failed to encode {frame} frame: {e:?}"),
        }
    }
}

/// Cloneable handle for sending commands to a running [`HubServer`].
#[derive(Clone)]
pub struct HubHandle {
    tx: UnboundedSender<Command>,
    handlers: Arc<RwLock<HashMap<String, ServerHandler>>>,
    bus: EventBus,
    credentials: CredentialStore,
    token: CancellationToken,
}

impl HubHandle {
    /// Registers a connection's outbound channel and obtains its id.
    ///
    /// # Errors
    ///
    /// * If the server is at capacity or shutting down
    pub async fn connect(
        &self,
        conn_tx: UnboundedSender<SessionMessage>,
    ) -> Result<ConnId, ConnectError> {
        let (res_tx, res_rx) = oneshot::channel();
        self.tx
            .send(Command::Connect { conn_tx, res_tx })
            .map_err(|_| ConnectError::Unavailable)?;
        res_rx.await.map_err(|_| ConnectError::Unavailable)?
    }

    /// Authenticates a pre-auth connection, returning the canonical name.
    ///
    /// # Errors
    ///
    /// * If the credentials are missing or mismatched
    /// * If the hub actor is gone
    pub async fn authenticate(
        &self,
        conn: ConnId,
        token: String,
        name: Option<String>,
    ) -> Result<String, HubError> {
        let (res_tx, res_rx) = oneshot::channel();
        self.tx
            .send(Command::Authenticate {
                conn,
                token,
                name,
                res_tx,
            })
            .map_err(|_| HubError::Connection("Hub actor is not running".into()))?;
        res_rx
            .await
            .map_err(|_| HubError::Connection("Hub actor is not running".into()))?
    }

    /// Deregisters a connection after its transport closed.
    pub fn disconnect(&self, conn: ConnId) {
        let _ = self.tx.send(Command::Disconnect { conn });
    }

    /// Routes one decoded frame from an authenticated connection.
    pub fn frame(&self, conn: ConnId, frame: Frame) {
        let _ = self.tx.send(Command::Frame { conn, frame });
    }

    /// Registers a server RPC handler. Re-registering a name replaces the
    /// previous handler.
    pub fn add_handler<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HubError>> + Send + 'static,
    {
        let handler: ServerHandler = Arc::new(move |data| Box::pin(handler(data)));
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), handler);
    }

    /// Removes a server RPC handler; returns whether one was registered.
    pub fn remove_handler(&self, name: &str) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    /// Adds or replaces a credential record.
    pub fn set_user(&self, name: &str, token: &str) {
        self.credentials.set_user(name, token);
    }

    /// Removes a credential record and evicts that name's live session.
    pub fn remove_user(&self, name: &str) -> bool {
        let removed = self.credentials.remove_user(name);
        let _ = self.tx.send(Command::EvictName {
            name: name.to_string(),
        });
        removed
    }

    /// The server event bus: client-originated events fire here with
    /// `(data, Some(fromClient))`, and lifecycle notifications
    /// (`clientConnected`, `clientDisconnected`, `clientTimeout`, `closed`)
    /// fire with the client name as payload.
    #[must_use]
    pub const fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Drains and closes every connection, sharing one completion across
    /// concurrent callers. Safe to call repeatedly.
    pub async fn graceful_shutdown(&self, reason: Option<String>) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .tx
            .send(Command::GracefulShutdown { reason, done_tx })
            .is_err()
        {
            return;
        }
        let _ = done_rx.await;
    }

    /// Stops the actor and the heartbeat supervisor.
    pub fn shutdown(&self) {
        log::debug!("Shutting down hub actor");
        self.token.cancel();
    }
}
