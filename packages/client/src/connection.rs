//! Background connection task.
//!
//! Owns the WebSocket stream for its whole lifetime: establishes and
//! authenticates the connection, multiplexes public-API commands with
//! inbound frames and the proactive heartbeat timer, and runs the reconnect
//! state machine with exponential backoff after dirty closes. All pending
//! requests settle exactly once: the first of reply, caller deadline, or
//! connection loss wins.

use std::{
    collections::HashMap,
    sync::{
        atomic::Ordering,
        Arc, PoisonError, RwLock,
    },
    time::Duration,
};

use burrow_events::EventBus;
use burrow_protocol::{close, Frame, HubError};
use futures_util::{SinkExt as _, StreamExt as _};
use serde_json::Value;
use tokio::{
    net::TcpStream,
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    time::Instant,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::{frame::coding::CloseCode, CloseFrame, Message},
    MaybeTlsStream, WebSocketStream,
};

use crate::{
    callbacks::Callbacks,
    client::{ClientHandler, ConnectionState},
    config::ClientConfig,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Effectively "never" for the scheduled-close deadline.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// Commands sent from the public API to the background connection task.
#[derive(Debug)]
pub(crate) enum ClientCmd {
    Connect {
        res_tx: oneshot::Sender<Result<(), HubError>>,
    },
    Disconnect,
    Request {
        id: String,
        target: Option<String>,
        function_name: String,
        data: Value,
        res_tx: oneshot::Sender<Result<Value, HubError>>,
    },
    SendEvent {
        event_name: String,
        data: Value,
    },
    /// Caller-side deadline elapsed; drop the pending entry so a late reply
    /// is discarded.
    CancelRequest {
        id: String,
    },
}

/// Caller-side record of an in-flight request.
struct Pending {
    res_tx: oneshot::Sender<Result<Value, HubError>>,
    label: String,
}

/// Shared handles the task needs; everything here is a cheap clone.
pub(crate) struct TaskContext {
    pub config: ClientConfig,
    pub handlers: Arc<RwLock<HashMap<String, ClientHandler>>>,
    pub bus: EventBus,
    pub callbacks: Arc<Callbacks>,
    pub state: Arc<RwLock<ConnectionState>>,
    pub name: Arc<RwLock<Option<String>>>,
    pub request_id: Arc<std::sync::atomic::AtomicU64>,
}

/// Why the connected loop stopped driving its stream.
enum Exit {
    /// Transport lost (close frame, stream error, or failed write).
    Lost { code: Option<u16>, reason: String },
    /// Application asked for a clean local close.
    Disconnect,
    /// The owning `HubClient` was dropped.
    Dropped,
}

/// Backoff before reconnect attempt `attempt` (1-based).
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub(crate) fn backoff_delay(attempt: u32, multiplier: f64) -> Duration {
    let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
    let millis = (1000.0 * multiplier.powi(exponent)).min(30_000.0);
    Duration::from_millis(millis as u64)
}

/// Maps the `error` string of a failed `response` to a typed error for the
/// original caller. `label` names the invoked function (`add`, `bob.ping`).
fn response_error(message: String, label: &str) -> HubError {
    match message.as_str() {
        "Handler not found" => HubError::HandlerNotFound(label.to_string()),
        "Target client not found" | "Target client not available" => {
            HubError::ClientNotFound(label.to_string())
        }
        _ => HubError::Handler(message),
    }
}

fn set_state(ctx: &TaskContext, new: ConnectionState) {
    let old = {
        let mut state = ctx.state.write().unwrap_or_else(PoisonError::into_inner);
        let old = *state;
        *state = new;
        old
    };
    if old != new {
        log::debug!("Connection state: {old} -> {new}");
        ctx.callbacks.emit_state_change(new, old);
    }
}

fn reject_pending(pending: &mut HashMap<String, Pending>) {
    for (_, entry) in pending.drain() {
        let _ = entry
            .res_tx
            .send(Err(HubError::Connection("Connection closed".into())));
    }
}

fn on_connected(ctx: &TaskContext, reconnect_attempts: &mut u32) {
    *reconnect_attempts = 0;
    // correlation ids restart on every established connection
    ctx.request_id.store(0, Ordering::SeqCst);
    set_state(ctx, ConnectionState::Connected);
    let name = ctx
        .name
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
        .unwrap_or_default();
    log::info!("Connected to server as '{name}'");
    ctx.callbacks.emit_connected(&name);
}

/// Connect, authenticate, and adopt the canonical name from `auth_success`.
async fn establish(ctx: &TaskContext) -> Result<WsStream, HubError> {
    log::debug!("Connecting to {}", ctx.config.url);
    let (mut ws, _) = connect_async(ctx.config.url.as_str())
        .await
        .map_err(|e| HubError::Network(e.to_string()))?;

    let auth = Frame::Auth {
        token: ctx.config.token.clone(),
        name: ctx.config.name.clone(),
    };
    ws.send(Message::Text(auth.encode()?))
        .await
        .map_err(|e| HubError::Network(e.to_string()))?;

    let assigned = tokio::time::timeout(ctx.config.request_timeout, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => match Frame::decode(&text) {
                    Ok(Frame::AuthSuccess { name }) => break Ok(name),
                    Ok(frame) => log::debug!("Ignoring pre-auth {frame} frame"),
                    Err(e) => log::debug!("Ignoring undecodable pre-auth frame: {e}"),
                },
                Some(Ok(Message::Close(frame))) => {
                    break Err(match frame {
                        Some(f) if u16::from(f.code) == close::POLICY_VIOLATION => {
                            HubError::Authentication(f.reason.to_string())
                        }
                        Some(f) => HubError::Connection(f.reason.to_string()),
                        None => {
                            HubError::Connection("Connection closed during authentication".into())
                        }
                    })
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(HubError::Network(e.to_string())),
                None => {
                    break Err(HubError::Connection(
                        "Connection closed during authentication".into(),
                    ))
                }
            }
        }
    })
    .await
    .map_err(|_| HubError::Timeout("authentication".into()))??;

    *ctx.name.write().unwrap_or_else(PoisonError::into_inner) = Some(assigned.clone());
    log::info!("Authenticated as '{assigned}'");

    Ok(ws)
}

/// Dispatch one decoded inbound frame. Returns `Some` when the connected
/// loop must stop.
async fn dispatch_frame(
    ctx: &TaskContext,
    frame: Frame,
    ws: &mut WsStream,
    pending: &mut HashMap<String, Pending>,
    out_tx: &UnboundedSender<Frame>,
    close_deadline: &mut Instant,
) -> Option<Exit> {
    match frame {
        Frame::Response {
            id,
            success,
            data,
            error,
            ..
        } => {
            if let Some(entry) = pending.remove(&id) {
                let result = if success {
                    Ok(data.unwrap_or(Value::Null))
                } else {
                    Err(response_error(error.unwrap_or_default(), &entry.label))
                };
                let _ = entry.res_tx.send(result);
            } else {
                log::debug!("Dropping response for settled request id={id}");
            }
        }

        Frame::ClientRequest {
            id,
            function_name,
            data,
            from_client,
            ..
        } => {
            let handler = ctx
                .handlers
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&function_name)
                .cloned();
            let out_tx = out_tx.clone();
            tokio::spawn(async move {
                let response = match handler {
                    None => {
                        log::debug!("No local handler for '{function_name}'");
                        Frame::Response {
                            id,
                            success: false,
                            data: None,
                            error: Some("Handler not found".into()),
                            original_from_client: from_client,
                        }
                    }
                    Some(handler) => match handler(data).await {
                        Ok(value) => Frame::Response {
                            id,
                            success: true,
                            data: Some(value),
                            error: None,
                            original_from_client: from_client,
                        },
                        Err(e) => {
                            log::debug!("Local handler '{function_name}' failed: {e:?}");
                            Frame::Response {
                                id,
                                success: false,
                                data: None,
                                error: Some(e.to_string()),
                                original_from_client: from_client,
                            }
                        }
                    },
                };
                let _ = out_tx.send(response);
            });
        }

        Frame::Event {
            event_name,
            data,
            from_client,
        } => {
            ctx.bus.emit(&event_name, &data, from_client.as_deref());
        }

        Frame::Heartbeat => {
            if let Ok(text) = Frame::HeartbeatResponse.encode() {
                if ws.send(Message::Text(text)).await.is_err() {
                    return Some(Exit::Lost {
                        code: None,
                        reason: "Failed to answer heartbeat".into(),
                    });
                }
            }
        }

        Frame::Shutdown {
            reason,
            grace_period,
        } => {
            log::warn!("Server shutdown announced: {reason:?}");
            let grace = grace_period.unwrap_or(1000).min(5000);
            *close_deadline = Instant::now() + Duration::from_millis(grace);
            ctx.callbacks
                .emit_server_shutdown(reason.as_deref(), grace_period);
        }

        Frame::AuthSuccess { name } => {
            // server re-announcing identity; it stays authoritative
            *ctx.name.write().unwrap_or_else(PoisonError::into_inner) = Some(name);
        }

        Frame::Auth { .. } | Frame::Request { .. } | Frame::HeartbeatResponse => {
            log::warn!("Dropping server-bound frame sent to client");
        }
    }
    None
}

/// Multiplex commands, inbound frames, local handler replies, the heartbeat
/// timer, and a scheduled close on one established connection.
#[allow(clippy::too_many_lines)]
async fn drive_connection(
    ctx: &TaskContext,
    ws: &mut WsStream,
    cmd_rx: &mut UnboundedReceiver<ClientCmd>,
    pending: &mut HashMap<String, Pending>,
    out_tx: &UnboundedSender<Frame>,
    out_rx: &mut UnboundedReceiver<Frame>,
) -> Exit {
    let mut heartbeat = tokio::time::interval(ctx.config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.tick().await;
    let mut close_deadline = Instant::now() + FAR_FUTURE;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                None => break Exit::Dropped,

                Some(ClientCmd::Disconnect) => break Exit::Disconnect,

                Some(ClientCmd::Connect { res_tx }) => {
                    log::warn!("Already connected");
                    let _ = res_tx.send(Ok(()));
                }

                Some(ClientCmd::Request { id, target, function_name, data, res_tx }) => {
                    let label = target.as_ref().map_or_else(
                        || function_name.clone(),
                        |target| format!("{target}.{function_name}"),
                    );
                    let frame = match target {
                        Some(target_client) => Frame::ClientRequest {
                            id: id.clone(),
                            function_name,
                            data,
                            target_client,
                            from_client: ctx
                                .name
                                .read()
                                .unwrap_or_else(PoisonError::into_inner)
                                .clone(),
                        },
                        None => Frame::Request {
                            id: id.clone(),
                            function_name,
                            data,
                        },
                    };
                    match frame.encode() {
                        Ok(text) => {
                            pending.insert(id, Pending { res_tx, label });
                            if ws.send(Message::Text(text)).await.is_err() {
                                break Exit::Lost {
                                    code: None,
                                    reason: "Failed to send request".into(),
                                };
                            }
                        }
                        Err(e) => {
                            let _ = res_tx.send(Err(e));
                        }
                    }
                }

                Some(ClientCmd::SendEvent { event_name, data }) => {
                    let frame = Frame::Event {
                        event_name,
                        data,
                        from_client: None,
                    };
                    match frame.encode() {
                        Ok(text) => {
                            if ws.send(Message::Text(text)).await.is_err() {
                                break Exit::Lost {
                                    code: None,
                                    reason: "Failed to send event".into(),
                                };
                            }
                        }
                        Err(e) => log::error!("Failed to encode event: {e:?}"),
                    }
                }

                Some(ClientCmd::CancelRequest { id }) => {
                    pending.remove(&id);
                }
            },

            frame = out_rx.recv() => {
                if let Some(frame) = frame {
                    match frame.encode() {
                        Ok(text) => {
                            if ws.send(Message::Text(text)).await.is_err() {
                                break Exit::Lost {
                                    code: None,
                                    reason: "Failed to send handler response".into(),
                                };
                            }
                        }
                        Err(e) => log::error!("Failed to encode handler response: {e:?}"),
                    }
                }
            },

            msg = ws.next() => match msg {
                Some(Ok(Message::Text(text))) => match Frame::decode(&text) {
                    Ok(frame) => {
                        if let Some(exit) =
                            dispatch_frame(ctx, frame, ws, pending, out_tx, &mut close_deadline)
                                .await
                        {
                            break exit;
                        }
                    }
                    Err(e) => log::error!("Dropping undecodable frame: {e}"),
                },
                Some(Ok(Message::Ping(payload))) => {
                    let _ = ws.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame.map_or_else(
                        || (None, "Connection closed".to_string()),
                        |f| (Some(u16::from(f.code)), f.reason.to_string()),
                    );
                    log::info!("Server closed connection code={code:?} reason={reason}");
                    break Exit::Lost { code, reason };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let error = HubError::Network(e.to_string());
                    log::error!("WebSocket stream error: {e}");
                    ctx.callbacks.emit_error(&error);
                    break Exit::Lost { code: None, reason: e.to_string() };
                }
                None => break Exit::Lost {
                    code: None,
                    reason: "WebSocket stream ended".into(),
                },
            },

            _ = heartbeat.tick() => {
                if let Ok(text) = Frame::HeartbeatResponse.encode() {
                    if ws.send(Message::Text(text)).await.is_err() {
                        break Exit::Lost {
                            code: None,
                            reason: "Failed to send heartbeat".into(),
                        };
                    }
                }
            },

            () = tokio::time::sleep_until(close_deadline) => {
                log::info!("Server shutdown grace period elapsed; disconnecting");
                break Exit::Disconnect;
            }
        }
    }
}

/// The main background task owning the connection for a client's lifetime.
pub(crate) async fn connection_task(ctx: TaskContext, mut cmd_rx: UnboundedReceiver<ClientCmd>) {
    let mut pending: HashMap<String, Pending> = HashMap::new();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
    let mut reconnect_attempts: u32 = 0;
    let mut ws: Option<WsStream> = None;

    loop {
        if let Some(stream) = ws.as_mut() {
            let exit = drive_connection(
                &ctx,
                stream,
                &mut cmd_rx,
                &mut pending,
                &out_tx,
                &mut out_rx,
            )
            .await;

            match exit {
                Exit::Dropped => {
                    let _ = stream.close(None).await;
                    return;
                }
                Exit::Disconnect => {
                    set_state(&ctx, ConnectionState::Disconnecting);
                    log::info!("Disconnecting from server");
                    reject_pending(&mut pending);
                    let _ = stream
                        .close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: "Client disconnecting".into(),
                        }))
                        .await;
                    ws = None;
                    reconnect_attempts = 0;
                    set_state(&ctx, ConnectionState::Disconnected);
                    ctx.callbacks
                        .emit_disconnected(Some(close::NORMAL), "Client disconnecting");
                }
                Exit::Lost { code, reason } => {
                    ws = None;
                    reject_pending(&mut pending);
                    ctx.callbacks.emit_disconnected(code, &reason);

                    let intentional =
                        matches!(code, Some(c) if c == close::NORMAL || c == close::GOING_AWAY);
                    if intentional
                        || reconnect_attempts >= ctx.config.max_reconnect_attempts
                    {
                        if !intentional {
                            log::warn!(
                                "Not reconnecting after {reconnect_attempts} attempts"
                            );
                        }
                        reconnect_attempts = 0;
                        set_state(&ctx, ConnectionState::Disconnected);
                    } else {
                        reconnect_attempts += 1;
                        set_state(&ctx, ConnectionState::Reconnecting);
                    }
                }
            }
            continue;
        }

        let reconnecting = *ctx.state.read().unwrap_or_else(PoisonError::into_inner)
            == ConnectionState::Reconnecting;

        if reconnecting {
            let delay = backoff_delay(reconnect_attempts, ctx.config.reconnect_backoff_multiplier);
            log::info!(
                "Reconnecting in {delay:?} (attempt {reconnect_attempts}/{})",
                ctx.config.max_reconnect_attempts
            );

            let mut connect_waiters: Vec<oneshot::Sender<Result<(), HubError>>> = Vec::new();
            let mut cancelled = false;
            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    () = &mut sleep => break,
                    cmd = cmd_rx.recv() => match cmd {
                        None => return,
                        Some(ClientCmd::Disconnect) => {
                            cancelled = true;
                            break;
                        }
                        Some(ClientCmd::Connect { res_tx }) => {
                            // skip the rest of the backoff window
                            connect_waiters.push(res_tx);
                            break;
                        }
                        Some(ClientCmd::Request { res_tx, .. }) => {
                            let _ = res_tx
                                .send(Err(HubError::Connection("Client not connected".into())));
                        }
                        Some(ClientCmd::SendEvent { event_name, .. }) => {
                            log::warn!("Cannot send event '{event_name}': not connected");
                        }
                        Some(ClientCmd::CancelRequest { id }) => {
                            pending.remove(&id);
                        }
                    },
                }
            }

            if cancelled {
                reconnect_attempts = 0;
                set_state(&ctx, ConnectionState::Disconnected);
                continue;
            }

            set_state(&ctx, ConnectionState::Connecting);
            match establish(&ctx).await {
                Ok(stream) => {
                    log::info!("Reconnection successful");
                    ws = Some(stream);
                    on_connected(&ctx, &mut reconnect_attempts);
                    for waiter in connect_waiters {
                        let _ = waiter.send(Ok(()));
                    }
                }
                Err(e) => {
                    log::error!("Reconnection attempt {reconnect_attempts} failed: {e}");
                    ctx.callbacks.emit_error(&e);
                    for waiter in connect_waiters {
                        let _ = waiter.send(Err(e.clone()));
                    }
                    if reconnect_attempts < ctx.config.max_reconnect_attempts {
                        reconnect_attempts += 1;
                        set_state(&ctx, ConnectionState::Reconnecting);
                    } else {
                        log::warn!(
                            "Giving up after {reconnect_attempts} reconnect attempts"
                        );
                        reconnect_attempts = 0;
                        set_state(&ctx, ConnectionState::Disconnected);
                    }
                }
            }
        } else {
            match cmd_rx.recv().await {
                None => return,
                Some(ClientCmd::Connect { res_tx }) => {
                    set_state(&ctx, ConnectionState::Connecting);
                    match establish(&ctx).await {
                        Ok(stream) => {
                            ws = Some(stream);
                            on_connected(&ctx, &mut reconnect_attempts);
                            let _ = res_tx.send(Ok(()));
                        }
                        Err(e) => {
                            log::error!("Connection failed: {e}");
                            set_state(&ctx, ConnectionState::Disconnected);
                            ctx.callbacks.emit_error(&e);
                            let _ = res_tx.send(Err(e));
                        }
                    }
                }
                Some(ClientCmd::Disconnect) => {}
                Some(ClientCmd::Request { res_tx, .. }) => {
                    let _ = res_tx.send(Err(HubError::Connection("Client not connected".into())));
                }
                Some(ClientCmd::SendEvent { event_name, .. }) => {
                    log::warn!("Cannot send event '{event_name}': not connected");
                }
                Some(ClientCmd::CancelRequest { id }) => {
                    pending.remove(&id);
                }
            }
        }
    }
}
