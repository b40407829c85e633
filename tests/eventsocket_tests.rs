use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;

use tokio_tungstenite::tungstenite::Message;
use whr::{Appliance, Auth, ChangeCallback};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mock_rest_endpoints(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(include_str!("fixtures/auth_success.json")),
        )
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/v1/appliance/SAID1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(include_str!("fixtures/appliance_data.json")),
        )
        .mount(server)
        .await;
}

fn change_channel() -> (ChangeCallback, tokio::sync::mpsc::UnboundedReceiver<()>) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let callback: ChangeCallback = Arc::new(move || {
        let _ = tx.send(());
    });
    (callback, rx)
}

async fn recv_change(rx: &mut tokio::sync::mpsc::UnboundedReceiver<()>) {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for change callback")
        .expect("change channel closed");
}

#[tokio::test]
async fn test_event_channel_updates_attributes() {
    let mock_server = MockServer::start().await;
    mock_rest_endpoints(&mock_server).await;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ws_base = format!("ws://{}", listener.local_addr().unwrap());

    // Push server: one connection, two messages, then hold open until the
    // client goes away.
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        ws.send(Message::text(
            r#"{"timestamp": 200, "attributeMap": {"temp": 7}}"#,
        ))
        .await
        .unwrap();
        ws.send(Message::text(
            r#"{"timestamp": 300, "attributeMap": {"Unknown_Attr": "1"}}"#,
        ))
        .await
        .unwrap();
        while let Some(frame) = ws.next().await {
            if frame.is_err() {
                break;
            }
        }
    });

    let auth = Arc::new(Auth::new_with_base_url(
        "email",
        "secretpass",
        mock_server.uri(),
    ));
    auth.do_auth(false).await.unwrap();

    let (callback, mut rx) = change_channel();
    let mut appliance = Appliance::new_with_base_urls(
        auth,
        "SAID1",
        Some(callback),
        mock_server.uri(),
        ws_base,
    );
    appliance.connect().await.unwrap();

    // One callback per message, in delivery order.
    recv_change(&mut rx).await;
    assert_eq!(appliance.get_attribute("temp").unwrap(), "7");

    recv_change(&mut rx).await;
    // Unknown names never grow the table.
    assert!(!appliance.has_attribute("Unknown_Attr"));
    assert_eq!(appliance.get_attribute("temp").unwrap(), "7");

    appliance.disconnect().await;
    server.abort();
}

#[tokio::test]
async fn test_event_channel_restart() {
    let mock_server = MockServer::start().await;
    mock_rest_endpoints(&mock_server).await;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ws_base = format!("ws://{}", listener.local_addr().unwrap());

    // Two sequential subscriptions, one message each.
    let server = tokio::spawn(async move {
        for round in 0..2i64 {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let msg = format!(
                r#"{{"timestamp": {}, "attributeMap": {{"temp": {}}}}}"#,
                200 + round,
                7 + round
            );
            ws.send(Message::text(msg)).await.unwrap();
            while let Some(frame) = ws.next().await {
                if frame.is_err() {
                    break;
                }
            }
        }
    });

    let auth = Arc::new(Auth::new_with_base_url(
        "email",
        "secretpass",
        mock_server.uri(),
    ));
    auth.do_auth(false).await.unwrap();

    let (callback, mut rx) = change_channel();
    let mut appliance = Appliance::new_with_base_urls(
        auth,
        "SAID1",
        Some(callback),
        mock_server.uri(),
        ws_base,
    );

    appliance.connect().await.unwrap();
    recv_change(&mut rx).await;
    assert_eq!(appliance.get_attribute("temp").unwrap(), "7");
    appliance.disconnect().await;

    // disconnect() waits for the old subscription, so a fresh connect()
    // gets a clean socket.
    appliance.connect().await.unwrap();
    recv_change(&mut rx).await;
    assert_eq!(appliance.get_attribute("temp").unwrap(), "8");
    appliance.disconnect().await;

    server.abort();
}
