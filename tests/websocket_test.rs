//! Integration tests over real WebSocket connections: handshake auth,
//! room fan-out, duplicate sessions, heartbeat and read-deadline reaping.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use presence_hub::{
    handle_connection, Authenticator, ChatService, Config, TrustedHeaderAuthenticator,
    USER_ID_HEADER,
};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Helper: start the server on a random port and return (addr, service).
async fn start_test_server(config: Config) -> (SocketAddr, ChatService) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let service = ChatService::new(config);
    service.start();
    let authenticator: Arc<dyn Authenticator> = Arc::new(TrustedHeaderAuthenticator);

    let accept_service = service.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let service = accept_service.clone();
            let authenticator = Arc::clone(&authenticator);
            tokio::spawn(async move {
                let _ = handle_connection(stream, service, authenticator).await;
            });
        }
    });

    (addr, service)
}

fn fast_config() -> Config {
    Config {
        write_timeout_ms: 500,
        close_grace_ms: 200,
        ..Config::default()
    }
}

async fn connect(addr: SocketAddr, user_id: i64) -> Client {
    let mut request = format!("ws://{addr}/ws").into_client_request().unwrap();
    request
        .headers_mut()
        .insert(USER_ID_HEADER, HeaderValue::from(user_id));
    let (ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();
    ws
}

async fn wait_online(service: &ChatService, user_id: i64) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !service.is_online(user_id) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("user never came online");
}

/// Read JSON frames until one has the given `type`, or give up after `wait`.
async fn next_of_type(ws: &mut Client, kind: &str, wait: Duration) -> Option<Value> {
    tokio::time::timeout(wait, async {
        while let Some(Ok(frame)) = ws.next().await {
            if let Message::Text(text) = frame {
                let value: Value = serde_json::from_str(&text).unwrap();
                if value["type"] == kind {
                    return Some(value);
                }
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

#[tokio::test]
async fn test_group_message_reaches_room_member_once() {
    let (addr, service) = start_test_server(fast_config()).await;
    let mut alice = connect(addr, 1).await;
    let mut bob = connect(addr, 2).await;
    wait_online(&service, 1).await;
    wait_online(&service, 2).await;

    service.join_chat_room(1, 7).unwrap();
    service.join_chat_room(2, 7).unwrap();

    let frame = json!({"type": "group", "room_id": 7, "content": "hi", "from": 99});
    alice
        .send(Message::Text(frame.to_string().into()))
        .await
        .unwrap();

    let received = next_of_type(&mut bob, "group", Duration::from_secs(2))
        .await
        .expect("bob got no group message");
    assert_eq!(received["from"], 1);
    assert_eq!(received["room_id"], 7);
    assert_eq!(received["content"], "hi");
    assert!(received["timestamp"].as_i64().unwrap() > 0);

    assert!(next_of_type(&mut bob, "group", Duration::from_millis(300))
        .await
        .is_none());
}

#[tokio::test]
async fn test_missing_identity_rejected_at_handshake() {
    let (addr, service) = start_test_server(fast_config()).await;

    let result = tokio_tungstenite::connect_async(format!("ws://{addr}/ws")).await;
    assert!(result.is_err());
    assert!(service.list_online_users().is_empty());
}

#[tokio::test]
async fn test_duplicate_session_closed_original_kept() {
    let (addr, service) = start_test_server(fast_config()).await;
    let mut original = connect(addr, 1).await;
    wait_online(&service, 1).await;

    let mut duplicate = connect(addr, 1).await;
    let ended = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match duplicate.next().await {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(ended.is_ok());

    assert_eq!(service.list_online_users(), vec![1]);
    service.send_private(2, 1, "still here").await.unwrap();
    let received = next_of_type(&mut original, "private", Duration::from_secs(2))
        .await
        .expect("original session lost");
    assert_eq!(received["content"], "still here");
}

#[tokio::test]
async fn test_malformed_frame_then_broadcast() {
    let (addr, service) = start_test_server(fast_config()).await;
    let mut alice = connect(addr, 1).await;
    wait_online(&service, 1).await;

    alice
        .send(Message::Text("garbage".to_string().into()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(service.is_online(1));

    assert_eq!(service.broadcast("notice"), 1);
    let received = next_of_type(&mut alice, "system", Duration::from_secs(2))
        .await
        .expect("no broadcast");
    assert_eq!(received["content"], "notice");
}

#[tokio::test]
async fn test_heartbeat_keeps_responsive_client_online() {
    let config = Config {
        ping_interval_ms: 100,
        read_timeout_ms: 400,
        ..fast_config()
    };
    let (addr, service) = start_test_server(config).await;
    let mut alice = connect(addr, 1).await;
    wait_online(&service, 1).await;

    // Reading lets tungstenite answer each ping with a pong
    let mut pings = 0;
    let _ = tokio::time::timeout(Duration::from_millis(1200), async {
        while let Some(Ok(frame)) = alice.next().await {
            if matches!(frame, Message::Ping(_)) {
                pings += 1;
            }
        }
    })
    .await;

    assert!(pings >= 2);
    assert!(service.is_online(1));
}

#[tokio::test]
async fn test_silent_client_reaped_after_read_deadline() {
    let config = Config {
        ping_interval_ms: 100,
        read_timeout_ms: 400,
        ..fast_config()
    };
    let (addr, service) = start_test_server(config).await;
    let _alice = connect(addr, 1).await;
    wait_online(&service, 1).await;

    // Never read, so no pong ever goes back
    let reaped = tokio::time::timeout(Duration::from_secs(3), async {
        while service.is_online(1) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(reaped.is_ok());
}
