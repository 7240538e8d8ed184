#![allow(dead_code)]

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::time;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use realtime_api::config::Config;
use realtime_api::AppState;
use studyhall_common::protocol::ServerEvent;

pub type Ws = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Start the app on an ephemeral port. The server runs in the background.
pub async fn spawn_server() -> (SocketAddr, AppState) {
    let config = Config {
        port: 0,
        allowed_origins: vec!["http://localhost:5173".to_string()],
        heartbeat_interval: Duration::from_secs(25),
        heartbeat_timeout: Duration::from_secs(60),
    };
    let state = AppState::new(config);
    let app = realtime_api::routes::router().with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, state)
}

pub fn gateway_url(addr: SocketAddr, user_id: Option<&str>) -> String {
    match user_id {
        Some(uid) => format!("ws://{addr}/gateway?user_id={uid}"),
        None => format!("ws://{addr}/gateway"),
    }
}

pub async fn connect_gateway(addr: SocketAddr, user_id: Option<&str>) -> Ws {
    let (ws, _) = tokio_tungstenite::connect_async(gateway_url(addr, user_id))
        .await
        .expect("ws connect");
    ws
}

/// Read the next application event, skipping transport frames.
pub async fn next_event(ws: &mut Ws) -> ServerEvent {
    loop {
        let msg = time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for event")
            .expect("stream ended")
            .expect("ws read error");
        match msg {
            tungstenite::Message::Text(text) => {
                return serde_json::from_str(&text).expect("parse event");
            }
            tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Assert the next event is a `presence.update` carrying exactly `users`.
pub async fn expect_presence(ws: &mut Ws, users: &[&str]) {
    match next_event(ws).await {
        ServerEvent::PresenceUpdate(online) => {
            let got: HashSet<String> = online.into_iter().collect();
            let want: HashSet<String> = users.iter().map(|s| s.to_string()).collect();
            assert_eq!(got, want);
        }
        other => panic!("expected presence.update, got {other:?}"),
    }
}

/// Assert the next frame (transport frames aside) is a close with `code`.
/// Strict: an event arriving first fails the test.
pub async fn expect_close(ws: &mut Ws, code: u16) {
    loop {
        let msg = time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for close")
            .expect("stream ended")
            .expect("ws read error");
        match msg {
            tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_) => continue,
            tungstenite::Message::Close(Some(frame)) => {
                assert_eq!(
                    frame.code,
                    tungstenite::protocol::frame::coding::CloseCode::from(code)
                );
                return;
            }
            other => panic!("expected close frame, got: {other:?}"),
        }
    }
}

/// Assert no application frame arrives within `window`.
pub async fn expect_silence(ws: &mut Ws, window: Duration) {
    let result = time::timeout(window, async {
        loop {
            match ws.next().await {
                Some(Ok(tungstenite::Message::Ping(_)))
                | Some(Ok(tungstenite::Message::Pong(_))) => continue,
                other => return other,
            }
        }
    })
    .await;
    if let Ok(frame) = result {
        panic!("expected silence, got: {frame:?}");
    }
}
