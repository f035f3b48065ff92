mod common;

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use session_api::auth::tokens;
use session_api::models::session::SessionRole;
use session_api::AppState;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a real TCP server for WebSocket testing.
async fn start_ws_server() -> (SocketAddr, AppState) {
    let state = common::test_state();
    let app = session_api::routes::router().with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, state)
}

async fn send(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .expect("ws send");
}

/// Next text frame as JSON.
async fn next_json(ws: &mut Ws) -> Value {
    loop {
        let msg = time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream ended")
            .expect("ws read error");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).expect("parse message"),
            Message::Close(frame) => panic!("connection closed: {frame:?}"),
            _ => continue,
        }
    }
}

/// Read dispatches until one named `event` arrives.
async fn next_event(ws: &mut Ws, event: &str) -> Value {
    loop {
        let msg = next_json(ws).await;
        if msg["t"] == event {
            return msg;
        }
    }
}

/// Connect and IDENTIFY with a fresh ticket for `user_id`. Returns the
/// stream and the READY payload.
async fn connect_and_identify(addr: SocketAddr, state: &AppState, user_id: &str) -> (Ws, Value) {
    let ticket = tokens::issue_ws_ticket(state.kv.as_ref(), user_id)
        .await
        .expect("issue ticket");
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/gateway"))
        .await
        .expect("ws connect");

    send(&mut ws, json!({ "op": 2, "d": { "ticket": ticket } })).await;
    let ready = next_json(&mut ws).await;
    assert_eq!(ready["op"], 0);
    assert_eq!(ready["t"], "READY");
    assert_eq!(ready["s"], 1);
    (ws, ready)
}

async fn expect_close(ws: &mut Ws, code: u16) {
    loop {
        let msg = time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for close");
        match msg {
            Some(Ok(Message::Close(Some(frame)))) => {
                assert_eq!(u16::from(frame.code), code);
                return;
            }
            Some(Ok(Message::Close(None))) | None | Some(Err(_)) => {
                panic!("connection closed without close code {code}")
            }
            Some(Ok(_)) => continue,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ready_carries_the_active_session() {
    let (addr, state) = start_ws_server().await;
    let (host, _) = common::login_test_user(&state, "host").await;
    let session = state
        .engine
        .create_session(&host, common::new_session(4))
        .await
        .unwrap();

    let (_ws, ready) = connect_and_identify(addr, &state, &host).await;
    let d = &ready["d"];
    assert_eq!(d["user"]["id"], host.as_str());
    assert_eq!(d["active_session"]["session_id"], session.id.as_str());
    assert_eq!(d["active_session"]["role"], "host");
    assert_eq!(d["subscriptions"], json!([session.id]));
    assert!(d["heartbeat_interval"].as_u64().unwrap() > 0);
    assert!(d["connection_id"].as_str().unwrap().starts_with("gw_"));
}

#[tokio::test]
async fn bad_ticket_is_refused() {
    let (addr, _state) = start_ws_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/gateway"))
        .await
        .expect("ws connect");

    send(&mut ws, json!({ "op": 2, "d": { "ticket": "jam_wst_nope" } })).await;
    expect_close(&mut ws, 4004).await;
}

#[tokio::test]
async fn first_message_must_identify() {
    let (addr, _state) = start_ws_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/gateway"))
        .await
        .expect("ws connect");

    send(&mut ws, json!({ "op": 1, "d": { "seq": 0 } })).await;
    expect_close(&mut ws, 4003).await;
}

#[tokio::test]
async fn tickets_are_single_use() {
    let (addr, state) = start_ws_server().await;
    let (user, _) = common::login_test_user(&state, "listener").await;
    let ticket = tokens::issue_ws_ticket(state.kv.as_ref(), &user).await.unwrap();

    let (mut first, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/gateway"))
        .await
        .expect("ws connect");
    send(&mut first, json!({ "op": 2, "d": { "ticket": ticket } })).await;
    assert_eq!(next_json(&mut first).await["t"], "READY");

    let (mut second, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/gateway"))
        .await
        .expect("ws connect");
    send(&mut second, json!({ "op": 2, "d": { "ticket": ticket } })).await;
    expect_close(&mut second, 4004).await;
}

#[tokio::test]
async fn heartbeat_is_acknowledged() {
    let (addr, state) = start_ws_server().await;
    let (user, _) = common::login_test_user(&state, "listener").await;
    let (mut ws, _) = connect_and_identify(addr, &state, &user).await;

    send(&mut ws, json!({ "op": 1, "d": { "seq": 7 } })).await;
    let ack = next_json(&mut ws).await;
    assert_eq!(ack["op"], 6);
    assert_eq!(ack["d"]["ack"], 7);
}

#[tokio::test]
async fn members_receive_session_events() {
    let (addr, state) = start_ws_server().await;
    let (host, _) = common::login_test_user(&state, "host").await;
    let (viewer, _) = common::login_test_user(&state, "viewer").await;
    let session = state
        .engine
        .create_session(&host, common::new_session(4))
        .await
        .unwrap();

    let (mut host_ws, _) = connect_and_identify(addr, &state, &host).await;

    state
        .engine
        .join_session(&viewer, &session.id, SessionRole::Viewer)
        .await
        .unwrap();

    let joined = next_event(&mut host_ws, "user_joined_session").await;
    assert_eq!(joined["d"]["session_id"], session.id.as_str());
    assert_eq!(joined["d"]["user_id"], viewer.as_str());
    assert_eq!(joined["d"]["role"], "viewer");

    state.engine.start_session(&host, &session.id).await.unwrap();
    let status = next_event(&mut host_ws, "session_status_updated").await;
    assert_eq!(status["d"]["status"], "live");
}

#[tokio::test]
async fn spectators_subscribe_explicitly() {
    let (addr, state) = start_ws_server().await;
    let (host, _) = common::login_test_user(&state, "host").await;
    let (watcher, _) = common::login_test_user(&state, "watcher").await;
    let session = state
        .engine
        .create_session(&host, common::new_session(4))
        .await
        .unwrap();

    let (mut ws, ready) = connect_and_identify(addr, &state, &watcher).await;
    assert!(ready["d"]["active_session"].is_null());

    send(&mut ws, json!({ "op": 4, "d": { "session_id": session.id } })).await;
    let ack = next_json(&mut ws).await;
    assert_eq!(ack["t"], "SUBSCRIBED");

    state.engine.start_session(&host, &session.id).await.unwrap();
    let status = next_event(&mut ws, "session_status_updated").await;
    assert_eq!(status["d"]["session_id"], session.id.as_str());
}

#[tokio::test]
async fn applications_reach_only_the_host() {
    let (addr, state) = start_ws_server().await;
    let (host, _) = common::login_test_user(&state, "host").await;
    let (applicant, _) = common::login_test_user(&state, "applicant").await;
    let session = state
        .engine
        .create_session(&host, common::new_session(4))
        .await
        .unwrap();

    let (mut host_ws, _) = connect_and_identify(addr, &state, &host).await;
    let (mut applicant_ws, _) = connect_and_identify(addr, &state, &applicant).await;

    let application = state
        .engine
        .apply_as_performer(&applicant, &session.id)
        .await
        .unwrap();

    let received = next_event(&mut host_ws, "performer_application_received").await;
    assert_eq!(received["d"]["application_id"], application.id.as_str());
    assert_eq!(received["d"]["user_id"], applicant.as_str());

    state
        .engine
        .respond_to_application(
            &host,
            &session.id,
            &application.id,
            session_api::membership::ApplicationAction::Approve,
        )
        .await
        .unwrap();

    // The first thing the applicant hears about is their own result.
    let responded = next_json(&mut applicant_ws).await;
    assert_eq!(responded["t"], "application_responded");
    assert_eq!(responded["d"]["status"], "approved");

    let approved = next_event(&mut host_ws, "session_participant_approved").await;
    assert_eq!(approved["d"]["user_id"], applicant.as_str());
    assert_eq!(approved["d"]["role"], "performer");
}
