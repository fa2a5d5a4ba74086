//! Hub actor behavior: authentication, routing, fan-out, heartbeats, and
//! shutdown, exercised through `HubHandle` with channel-backed connections
//! standing in for WebSocket handler loops.

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use burrow_protocol::{close, Frame, HubError};
use burrow_server::{
    ws::{server::ConnectError, ConnId, SessionMessage},
    CredentialStore, HubHandle, HubServer, ServerConfig,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio::{
    sync::mpsc::{unbounded_channel, UnboundedReceiver},
    time::timeout,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Heartbeats far in the future so routing tests see only their own frames.
fn quiet_config() -> ServerConfig {
    ServerConfig::new(0)
        .with_heartbeat_interval(Duration::from_secs(60))
        .with_heartbeat_timeout(Duration::from_secs(120))
        .with_graceful_shutdown_timeout(Duration::from_millis(200))
}

fn start_hub(config: ServerConfig) -> HubHandle {
    let credentials = CredentialStore::new();
    credentials.set_user("alice", "token-a");
    credentials.set_user("bob", "token-b");
    credentials.set_user("carol", "token-c");
    let (handle, _join) = HubServer::new(config, credentials).unwrap().start();
    handle
}

async fn connect(handle: &HubHandle) -> (ConnId, UnboundedReceiver<SessionMessage>) {
    let (conn_tx, conn_rx) = unbounded_channel();
    let conn = handle.connect(conn_tx).await.unwrap();
    (conn, conn_rx)
}

async fn connect_as(
    handle: &HubHandle,
    token: &str,
    name: Option<&str>,
) -> (ConnId, UnboundedReceiver<SessionMessage>, String) {
    let (conn, mut conn_rx) = connect(handle).await;
    let assigned = handle
        .authenticate(conn, token.to_string(), name.map(ToString::to_string))
        .await
        .unwrap();
    let frame = recv_frame(&mut conn_rx).await;
    assert_eq!(
        frame,
        Frame::AuthSuccess {
            name: assigned.clone()
        }
    );
    (conn, conn_rx, assigned)
}

async fn recv_message(conn_rx: &mut UnboundedReceiver<SessionMessage>) -> SessionMessage {
    timeout(RECV_TIMEOUT, conn_rx.recv())
        .await
        .expect("timed out waiting for a session message")
        .expect("connection channel closed")
}

async fn recv_frame(conn_rx: &mut UnboundedReceiver<SessionMessage>) -> Frame {
    match recv_message(conn_rx).await {
        SessionMessage::Text(text) => Frame::decode(&text).unwrap(),
        SessionMessage::Close { code, reason } => {
            panic!("expected a frame, got close code={code} reason={reason}")
        }
    }
}

async fn recv_close(conn_rx: &mut UnboundedReceiver<SessionMessage>) -> (u16, String) {
    loop {
        match recv_message(conn_rx).await {
            SessionMessage::Text(_) => {}
            SessionMessage::Close { code, reason } => break (code, reason),
        }
    }
}

async fn assert_no_traffic(conn_rx: &mut UnboundedReceiver<SessionMessage>) {
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(conn_rx.try_recv().is_err(), "expected no traffic");
}

#[test_log::test(tokio::test)]
async fn token_only_auth_assigns_the_canonical_name() {
    let handle = start_hub(quiet_config());
    let (conn, mut conn_rx) = connect(&handle).await;

    let assigned = handle
        .authenticate(conn, "token-a".to_string(), None)
        .await
        .unwrap();

    assert_eq!(assigned, "alice");
    assert_eq!(
        recv_frame(&mut conn_rx).await,
        Frame::AuthSuccess {
            name: "alice".into()
        }
    );
}

#[test_log::test(tokio::test)]
async fn mismatched_credentials_are_rejected() {
    let handle = start_hub(quiet_config());

    let (conn, _conn_rx) = connect(&handle).await;
    let err = handle
        .authenticate(conn, "token-a".to_string(), Some("bob".to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::Authentication(_)));

    let (conn, _conn_rx) = connect(&handle).await;
    let err = handle
        .authenticate(conn, "wrong".to_string(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::Authentication(_)));
}

#[test_log::test(tokio::test)]
async fn server_rpc_gets_exactly_one_response() {
    let handle = start_hub(quiet_config());
    handle.add_handler("add", |data: Value| async move {
        let a = data["a"].as_i64().unwrap_or_default();
        let b = data["b"].as_i64().unwrap_or_default();
        Ok(json!(a + b))
    });
    let (conn, mut conn_rx, _) = connect_as(&handle, "token-a", None).await;

    handle.frame(
        conn,
        Frame::Request {
            id: "1".into(),
            function_name: "add".into(),
            data: json!({"a": 2, "b": 3}),
        },
    );

    assert_eq!(
        recv_frame(&mut conn_rx).await,
        Frame::Response {
            id: "1".into(),
            success: true,
            data: Some(json!(5)),
            error: None,
            original_from_client: None,
        }
    );
    assert_no_traffic(&mut conn_rx).await;
}

#[test_log::test(tokio::test)]
async fn unregistered_function_reports_handler_not_found() {
    let handle = start_hub(quiet_config());
    let (conn, mut conn_rx, _) = connect_as(&handle, "token-a", None).await;

    handle.frame(
        conn,
        Frame::Request {
            id: "9".into(),
            function_name: "nope".into(),
            data: Value::Null,
        },
    );

    assert_eq!(
        recv_frame(&mut conn_rx).await,
        Frame::Response {
            id: "9".into(),
            success: false,
            data: None,
            error: Some("Handler not found".into()),
            original_from_client: None,
        }
    );
}

#[test_log::test(tokio::test)]
async fn failing_handler_is_stringified_into_the_response() {
    let handle = start_hub(quiet_config());
    handle.add_handler("explode", |_| async move {
        Err::<Value, _>(HubError::Protocol("kaboom".into()))
    });
    let (conn, mut conn_rx, _) = connect_as(&handle, "token-a", None).await;

    handle.frame(
        conn,
        Frame::Request {
            id: "2".into(),
            function_name: "explode".into(),
            data: Value::Null,
        },
    );

    let frame = recv_frame(&mut conn_rx).await;
    assert_eq!(
        frame,
        Frame::Response {
            id: "2".into(),
            success: false,
            data: None,
            error: Some("Protocol error: kaboom".into()),
            original_from_client: None,
        }
    );
}

#[test_log::test(tokio::test)]
async fn last_registered_handler_wins() {
    let handle = start_hub(quiet_config());
    handle.add_handler("f", |_| async move { Ok(json!("first")) });
    handle.add_handler("f", |_| async move { Ok(json!("second")) });
    let (conn, mut conn_rx, _) = connect_as(&handle, "token-a", None).await;

    handle.frame(
        conn,
        Frame::Request {
            id: "1".into(),
            function_name: "f".into(),
            data: Value::Null,
        },
    );

    let frame = recv_frame(&mut conn_rx).await;
    assert_eq!(
        frame,
        Frame::Response {
            id: "1".into(),
            success: true,
            data: Some(json!("second")),
            error: None,
            original_from_client: None,
        }
    );

    assert!(handle.remove_handler("f"));
    assert!(!handle.remove_handler("f"));
}

#[test_log::test(tokio::test)]
async fn peer_rpc_correlates_across_both_hops() {
    let handle = start_hub(quiet_config());
    let (alice, mut alice_rx, _) = connect_as(&handle, "token-a", None).await;
    let (bob, mut bob_rx, _) = connect_as(&handle, "token-b", None).await;

    handle.frame(
        alice,
        Frame::ClientRequest {
            id: "7".into(),
            function_name: "ping".into(),
            data: json!({"x": 1}),
            target_client: "bob".into(),
            // any caller-supplied value is overwritten by the server
            from_client: Some("mallory".into()),
        },
    );

    assert_eq!(
        recv_frame(&mut bob_rx).await,
        Frame::ClientRequest {
            id: "7".into(),
            function_name: "ping".into(),
            data: json!({"x": 1}),
            target_client: "bob".into(),
            from_client: Some("alice".into()),
        }
    );

    handle.frame(
        bob,
        Frame::Response {
            id: "7".into(),
            success: true,
            data: Some(json!({"pong": true, "echo": {"x": 1}})),
            error: None,
            original_from_client: Some("alice".into()),
        },
    );

    assert_eq!(
        recv_frame(&mut alice_rx).await,
        Frame::Response {
            id: "7".into(),
            success: true,
            data: Some(json!({"pong": true, "echo": {"x": 1}})),
            error: None,
            original_from_client: Some("alice".into()),
        }
    );
}

#[test_log::test(tokio::test)]
async fn peer_rpc_to_unknown_client_fails_fast() {
    let handle = start_hub(quiet_config());
    let (alice, mut alice_rx, _) = connect_as(&handle, "token-a", None).await;

    handle.frame(
        alice,
        Frame::ClientRequest {
            id: "3".into(),
            function_name: "ping".into(),
            data: Value::Null,
            target_client: "nobody".into(),
            from_client: None,
        },
    );

    assert_eq!(
        recv_frame(&mut alice_rx).await,
        Frame::Response {
            id: "3".into(),
            success: false,
            data: None,
            error: Some("Target client not found".into()),
            original_from_client: None,
        }
    );
}

#[test_log::test(tokio::test)]
async fn peer_with_closed_transport_reports_unavailable() {
    let handle = start_hub(quiet_config());
    let (alice, mut alice_rx, _) = connect_as(&handle, "token-a", None).await;
    let (_bob, bob_rx, _) = connect_as(&handle, "token-b", None).await;

    // bob's handler loop died without deregistering yet
    drop(bob_rx);

    handle.frame(
        alice,
        Frame::ClientRequest {
            id: "4".into(),
            function_name: "ping".into(),
            data: Value::Null,
            target_client: "bob".into(),
            from_client: None,
        },
    );

    assert_eq!(
        recv_frame(&mut alice_rx).await,
        Frame::Response {
            id: "4".into(),
            success: false,
            data: None,
            error: Some("Target client not available".into()),
            original_from_client: None,
        }
    );
}

#[test_log::test(tokio::test)]
async fn response_without_origin_is_dropped() {
    let handle = start_hub(quiet_config());
    let (alice, mut alice_rx, _) = connect_as(&handle, "token-a", None).await;

    handle.frame(
        alice,
        Frame::Response {
            id: "1".into(),
            success: true,
            data: None,
            error: None,
            original_from_client: None,
        },
    );

    assert_no_traffic(&mut alice_rx).await;
}

#[test_log::test(tokio::test)]
async fn events_fan_out_to_everyone_but_the_originator() {
    let handle = start_hub(quiet_config());

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    handle.bus().on(
        "hi",
        Arc::new(move |data, from| {
            sink.lock()
                .unwrap()
                .push((data.clone(), from.map(ToString::to_string)));
            Ok(())
        }),
    );

    let (alice, mut alice_rx, _) = connect_as(&handle, "token-a", None).await;
    let (_bob, mut bob_rx, _) = connect_as(&handle, "token-b", None).await;
    let (_carol, mut carol_rx, _) = connect_as(&handle, "token-c", None).await;

    handle.frame(
        alice,
        Frame::Event {
            event_name: "hi".into(),
            data: json!({"n": 1}),
            from_client: None,
        },
    );

    let expected = Frame::Event {
        event_name: "hi".into(),
        data: json!({"n": 1, "fromClient": "alice"}),
        from_client: Some("alice".into()),
    };
    assert_eq!(recv_frame(&mut bob_rx).await, expected);
    assert_eq!(recv_frame(&mut carol_rx).await, expected);
    assert_no_traffic(&mut alice_rx).await;

    assert_eq!(
        *seen.lock().unwrap(),
        vec![(json!({"n": 1}), Some("alice".to_string()))]
    );
}

#[test_log::test(tokio::test)]
async fn frames_from_unauthenticated_connections_are_dropped() {
    let handle = start_hub(quiet_config());
    let (conn, mut conn_rx) = connect(&handle).await;

    handle.frame(
        conn,
        Frame::Request {
            id: "1".into(),
            function_name: "add".into(),
            data: Value::Null,
        },
    );

    assert_no_traffic(&mut conn_rx).await;
}

#[test_log::test(tokio::test)]
async fn duplicate_name_displaces_the_old_session() {
    let handle = start_hub(quiet_config());
    let (_old, mut old_rx, _) = connect_as(&handle, "token-a", None).await;
    let (_new, mut new_rx, _) = connect_as(&handle, "token-a", None).await;
    let (bob, _bob_rx, _) = connect_as(&handle, "token-b", None).await;

    let (code, reason) = recv_close(&mut old_rx).await;
    assert_eq!(code, close::NORMAL);
    assert_eq!(reason, "Replaced by new connection");

    // the name now routes to the new session
    handle.frame(
        bob,
        Frame::ClientRequest {
            id: "1".into(),
            function_name: "ping".into(),
            data: Value::Null,
            target_client: "alice".into(),
            from_client: None,
        },
    );
    let frame = recv_frame(&mut new_rx).await;
    assert!(matches!(frame, Frame::ClientRequest { ref from_client, .. } if from_client.as_deref() == Some("bob")));
}

#[test_log::test(tokio::test)]
async fn silent_client_is_evicted_within_the_heartbeat_window() {
    let config = ServerConfig::new(0)
        .with_heartbeat_interval(Duration::from_millis(50))
        .with_heartbeat_timeout(Duration::from_millis(150));
    let handle = start_hub(config);

    let timeouts = Arc::new(Mutex::new(Vec::new()));
    let sink = timeouts.clone();
    handle.bus().on(
        "clientTimeout",
        Arc::new(move |data, _| {
            sink.lock().unwrap().push(data.clone());
            Ok(())
        }),
    );

    let (_alice, mut alice_rx, _) = connect_as(&handle, "token-a", None).await;

    let started = Instant::now();
    let mut probes = 0;
    let (code, reason) = loop {
        match recv_message(&mut alice_rx).await {
            SessionMessage::Text(text) => {
                assert_eq!(Frame::decode(&text).unwrap(), Frame::Heartbeat);
                probes += 1;
            }
            SessionMessage::Close { code, reason } => break (code, reason),
        }
    };

    assert_eq!(code, close::NORMAL);
    assert_eq!(reason, "Heartbeat timeout");
    assert!(probes >= 1, "expected at least one probe before eviction");
    assert!(
        started.elapsed() < Duration::from_millis(1000),
        "eviction took too long: {:?}",
        started.elapsed()
    );
    assert_eq!(*timeouts.lock().unwrap(), vec![json!("alice")]);
}

#[test_log::test(tokio::test)]
async fn answering_heartbeats_keeps_the_session_alive() {
    let config = ServerConfig::new(0)
        .with_heartbeat_interval(Duration::from_millis(50))
        .with_heartbeat_timeout(Duration::from_millis(150));
    let handle = start_hub(config);
    let (alice, mut alice_rx, _) = connect_as(&handle, "token-a", None).await;

    let deadline = Instant::now() + Duration::from_millis(500);
    while Instant::now() < deadline {
        match timeout(Duration::from_millis(100), alice_rx.recv()).await {
            Ok(Some(SessionMessage::Text(text))) => {
                if Frame::decode(&text).unwrap() == Frame::Heartbeat {
                    handle.frame(alice, Frame::HeartbeatResponse);
                }
            }
            Ok(Some(SessionMessage::Close { code, reason })) => {
                panic!("evicted a responsive client: code={code} reason={reason}")
            }
            Ok(None) => panic!("connection channel closed"),
            Err(_) => {}
        }
    }
}

#[test_log::test(tokio::test)]
async fn graceful_shutdown_drains_broadcasts_and_shares_completion() {
    let handle = start_hub(quiet_config());
    let (_alice, mut alice_rx, _) = connect_as(&handle, "token-a", None).await;

    let first = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.graceful_shutdown(Some("maint".into())).await })
    };
    let second = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.graceful_shutdown(Some("maint".into())).await })
    };

    assert_eq!(
        recv_frame(&mut alice_rx).await,
        Frame::Shutdown {
            reason: Some("maint".into()),
            grace_period: Some(200),
        }
    );

    // new connections inside the drain window are refused
    let (conn_tx, _conn_rx) = unbounded_channel();
    assert!(matches!(
        handle.connect(conn_tx).await,
        Err(ConnectError::ShuttingDown)
    ));

    let (code, _reason) = recv_close(&mut alice_rx).await;
    assert_eq!(code, close::GOING_AWAY);

    first.await.unwrap();
    second.await.unwrap();

    // already complete: returns immediately with no further side effects
    handle.graceful_shutdown(Some("again".into())).await;
}

#[test_log::test(tokio::test)]
async fn connections_beyond_the_cap_are_refused() {
    let handle = start_hub(quiet_config().with_max_connections(1));

    let (_conn, _conn_rx) = connect(&handle).await;
    let (conn_tx, _rx) = unbounded_channel();
    assert!(matches!(
        handle.connect(conn_tx).await,
        Err(ConnectError::AtCapacity)
    ));
}

#[test_log::test(tokio::test)]
async fn remove_user_revokes_credentials_and_evicts_the_session() {
    let handle = start_hub(quiet_config());
    let (_alice, mut alice_rx, _) = connect_as(&handle, "token-a", None).await;

    assert!(handle.remove_user("alice"));

    let (code, reason) = recv_close(&mut alice_rx).await;
    assert_eq!(code, close::NORMAL);
    assert_eq!(reason, "User removed");

    let (conn, _conn_rx) = connect(&handle).await;
    let err = handle
        .authenticate(conn, "token-a".to_string(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::Authentication(_)));
}

#[test_log::test(tokio::test)]
async fn lifecycle_notifications_fire_on_the_bus() {
    let handle = start_hub(quiet_config());

    let events = Arc::new(Mutex::new(Vec::new()));
    for name in ["clientConnected", "clientDisconnected"] {
        let sink = events.clone();
        handle.bus().on(
            name,
            Arc::new(move |data, _| {
                sink.lock().unwrap().push((name, data.clone()));
                Ok(())
            }),
        );
    }

    let (alice, _alice_rx, _) = connect_as(&handle, "token-a", None).await;
    handle.disconnect(alice);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        *events.lock().unwrap(),
        vec![
            ("clientConnected", json!("alice")),
            ("clientDisconnected", json!("alice")),
        ]
    );
}
