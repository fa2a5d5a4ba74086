//! Per-connection WebSocket loop.
//!
//! Owns the actix-ws session (the single writer for its transport) and the
//! pre-authentication gate: the first frame must be `auth`, anything else
//! closes the transport with 1008. Decoded frames from an authenticated
//! connection are forwarded to the hub actor; outbound traffic arrives on the
//! connection's [`SessionMessage`] channel.

#![allow(clippy::future_not_send)]

use actix_ws::{CloseReason, Message};
use burrow_protocol::{close, Frame};
use futures_util::StreamExt as _;
use tokio::sync::mpsc;

use super::{server::HubHandle, SessionMessage};

/// Handle one WebSocket connection from accept to close.
///
/// Runs until the client closes, the transport errors, or the hub tells the
/// loop to close (eviction, displacement, shutdown).
pub async fn handle_ws(
    hub: HubHandle,
    mut session: actix_ws::Session,
    mut msg_stream: actix_ws::MessageStream,
) {
    let (conn_tx, mut conn_rx) = mpsc::unbounded_channel();

    let conn_id = match hub.connect(conn_tx).await {
        Ok(conn_id) => conn_id,
        Err(err) => {
            log::info!("Rejecting connection: {err}");
            let _ = session
                .close(Some(reason(close::TRY_AGAIN_LATER, &err.to_string())))
                .await;
            return;
        }
    };

    log::debug!("Connection established conn_id={conn_id}");
    let mut authenticated = false;

    let close_reason = loop {
        tokio::select! {
            msg = msg_stream.next() => match msg {
                Some(Ok(Message::Text(text))) => match Frame::decode(&text) {
                    Ok(Frame::Auth { token, name }) => {
                        if authenticated {
                            log::debug!("Ignoring repeated auth conn_id={conn_id}");
                        } else {
                            match hub.authenticate(conn_id, token, name).await {
                                Ok(name) => {
                                    authenticated = true;
                                    log::debug!("conn_id={conn_id} authenticated as '{name}'");
                                }
                                Err(err) => {
                                    log::info!("Authentication rejected conn_id={conn_id}: {err}");
                                    break Some(reason(
                                        close::POLICY_VIOLATION,
                                        "Invalid credentials",
                                    ));
                                }
                            }
                        }
                    }
                    Ok(frame) => {
                        if authenticated {
                            hub.frame(conn_id, frame);
                        } else {
                            break Some(reason(close::POLICY_VIOLATION, "Authentication required"));
                        }
                    }
                    Err(err) => {
                        if authenticated {
                            log::error!("Dropping undecodable frame conn_id={conn_id}: {err}");
                        } else {
                            break Some(reason(close::POLICY_VIOLATION, "Authentication required"));
                        }
                    }
                },

                Some(Ok(Message::Binary(_))) => {
                    if authenticated {
                        break Some(reason(
                            close::PROTOCOL_ERROR,
                            "Binary payloads are not supported",
                        ));
                    }
                    break Some(reason(close::POLICY_VIOLATION, "Authentication required"));
                }

                Some(Ok(Message::Ping(bytes))) => {
                    if session.pong(&bytes).await.is_err() {
                        break None;
                    }
                }

                Some(Ok(Message::Close(reason))) => break reason,

                Some(Ok(_)) => {}

                Some(Err(err)) => {
                    log::error!("WebSocket stream error conn_id={conn_id}: {err}");
                    hub.bus()
                        .emit("error", &serde_json::json!(err.to_string()), None);
                    break None;
                }

                None => break None,
            },

            outbound = conn_rx.recv() => match outbound {
                Some(SessionMessage::Text(text)) => {
                    if session.text(text).await.is_err() {
                        break None;
                    }
                }
                Some(SessionMessage::Close { code, reason: description }) => {
                    break Some(CloseReason {
                        code: code.into(),
                        description: Some(description),
                    });
                }
                // hub actor is gone
                None => break None,
            },
        }
    };

    hub.disconnect(conn_id);
    log::debug!("Closing connection conn_id={conn_id} reason={close_reason:?}");
    let _ = session.close(close_reason).await;
}

fn reason(code: u16, description: &str) -> CloseReason {
    CloseReason {
        code: code.into(),
        description: Some(description.to_string()),
    }
}
