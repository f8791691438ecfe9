//! In-memory transports and receive helpers for unit tests

use std::sync::Arc;
use std::time::Duration;

use futures_util::{sink, Sink, SinkExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_util::sync::PollSender;

use crate::config::ConnectionConfig;
use crate::connection::Connection;
use crate::message::{Message, MessageKind};
use crate::types::UserId;

/// How long receive helpers wait before concluding nothing is coming
const RECV_TIMEOUT: Duration = Duration::from_millis(300);

pub(crate) fn test_config() -> ConnectionConfig {
    ConnectionConfig {
        write_timeout: Duration::from_millis(100),
        close_grace: Duration::from_millis(100),
    }
}

/// Sink whose frames land in a channel; dropping the receiver severs it,
/// leaving a full channel unread stalls it
pub(crate) fn channel_sink(
    capacity: usize,
) -> (
    impl Sink<WsMessage, Error = WsError> + Send + 'static,
    mpsc::Receiver<WsMessage>,
) {
    let (tx, rx) = mpsc::channel(capacity);
    let sink = PollSender::new(tx).sink_map_err(|_| WsError::ConnectionClosed);
    (sink, rx)
}

/// Connection that accepts and discards every frame
pub(crate) fn drain_connection(user_id: UserId) -> Arc<Connection> {
    let sink = sink::drain::<WsMessage>().sink_map_err(|never| match never {});
    Arc::new(Connection::new(user_id, sink, test_config()))
}

pub(crate) fn channel_connection(
    user_id: UserId,
    capacity: usize,
) -> (Arc<Connection>, mpsc::Receiver<WsMessage>) {
    let (sink, rx) = channel_sink(capacity);
    (Arc::new(Connection::new(user_id, sink, test_config())), rx)
}

/// Next decoded text frame, skipping control frames
pub(crate) async fn recv_message(rx: &mut mpsc::Receiver<WsMessage>) -> Option<Message> {
    loop {
        match tokio::time::timeout(RECV_TIMEOUT, rx.recv()).await {
            Ok(Some(WsMessage::Text(text))) => {
                return Some(Message::decode(text.as_bytes()).expect("server sent invalid JSON"));
            }
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return None,
        }
    }
}

/// Next decoded message of `kind`, skipping everything else
pub(crate) async fn recv_kind(
    rx: &mut mpsc::Receiver<WsMessage>,
    kind: MessageKind,
) -> Option<Message> {
    loop {
        let message = recv_message(rx).await?;
        if message.kind() == kind {
            return Some(message);
        }
    }
}

/// Poll `condition` until it holds or two seconds pass
pub(crate) async fn wait_until(condition: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
