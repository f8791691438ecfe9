//! Connection: one authenticated user's live WebSocket session
//!
//! A connection owns the write half of its transport through a dedicated
//! write task fed by a bounded outbox, so frames reach the peer in the order
//! they were enqueued. Every write is bounded by the write deadline; any
//! failure, timeout, or overflow marks the connection as failed, which ends
//! its read loop and funnels it into registry teardown.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::ConnectionConfig;
use crate::error::TransportError;
use crate::message::Message;
use crate::registry::Registry;
use crate::types::{ConnectionId, RoomId, UserId};

/// Outbound frames a connection may queue before it is considered congested
pub const OUTBOX_CAPACITY: usize = 256;

type FrameSink = Pin<Box<dyn Sink<WsMessage, Error = WsError> + Send>>;

type WriteAck = oneshot::Receiver<Result<(), TransportError>>;

/// Lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Registered = 1,
    Active = 2,
    Closing = 3,
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Registered,
            2 => Self::Active,
            3 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

enum Outbound {
    Frame {
        frame: WsMessage,
        ack: oneshot::Sender<Result<(), TransportError>>,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

/// Live connection for one user
pub struct Connection {
    id: ConnectionId,
    user_id: UserId,
    outbox: mpsc::Sender<Outbound>,
    /// Rooms this connection belongs to; mirrored by the registry's room sets
    joined_rooms: Mutex<HashSet<RoomId>>,
    state: AtomicU8,
    /// Cancelled on the first fatal transport error or when teardown starts
    failed: CancellationToken,
    /// Cancelled to drop the transport without waiting for the write task
    abort: CancellationToken,
    config: ConnectionConfig,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Wrap the write half of a transport
    ///
    /// Spawns the write task, so this must be called inside a Tokio runtime.
    pub fn new<S>(user_id: UserId, sink: S, config: ConnectionConfig) -> Self
    where
        S: Sink<WsMessage, Error = WsError> + Send + 'static,
    {
        let id = ConnectionId::new();
        let (outbox, rx) = mpsc::channel(OUTBOX_CAPACITY);
        let failed = CancellationToken::new();
        let abort = CancellationToken::new();

        let writer = write_loop(Box::pin(sink), rx, failed.clone(), config.write_timeout);
        let writer_abort = abort.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = writer_abort.cancelled() => {
                    debug!(conn_id = %id, "write task aborted, transport dropped");
                }
                _ = writer => {}
            }
        });

        Self {
            id,
            user_id,
            outbox,
            joined_rooms: Mutex::new(HashSet::new()),
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            failed,
            abort,
            config,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// True once teardown has started
    pub fn is_closing(&self) -> bool {
        self.state() >= ConnectionState::Closing
    }

    /// True once a fatal transport error has been observed
    pub fn has_failed(&self) -> bool {
        self.failed.is_cancelled()
    }

    fn advance(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn mark_registered(&self) -> bool {
        self.advance(ConnectionState::Connecting, ConnectionState::Registered)
    }

    fn mark_active(&self) -> bool {
        self.advance(ConnectionState::Registered, ConnectionState::Active)
    }

    /// Enter `Closing`; only the first caller wins
    fn begin_close(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= ConnectionState::Closing as u8 {
                return false;
            }
            match self.state.compare_exchange(
                current,
                ConnectionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Queue a frame without waiting for it to be written
    ///
    /// The returned receiver resolves once the write task has written the
    /// frame or failed.
    pub(crate) fn enqueue(&self, frame: WsMessage) -> Result<WriteAck, TransportError> {
        if self.is_closing() {
            return Err(TransportError::Closed);
        }

        let (ack, done) = oneshot::channel();
        match self.outbox.try_send(Outbound::Frame { frame, ack }) {
            Ok(()) => Ok(done),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.failed.cancel();
                Err(TransportError::Congested(OUTBOX_CAPACITY))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.failed.cancel();
                Err(TransportError::Closed)
            }
        }
    }

    /// Wait for a queued frame, bounded by the write deadline
    pub(crate) async fn await_write(&self, done: WriteAck) -> Result<(), TransportError> {
        match timeout(self.config.write_timeout, done).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.failed.cancel();
                Err(TransportError::WriteTimeout(self.config.write_timeout))
            }
        }
    }

    /// Write one frame within the write deadline
    ///
    /// Any error is fatal for this connection.
    pub async fn send(&self, frame: WsMessage) -> Result<(), TransportError> {
        let done = self.enqueue(frame)?;
        self.await_write(done).await
    }

    /// Send a heartbeat ping
    pub async fn ping(&self) -> Result<(), TransportError> {
        self.send(WsMessage::Ping(Vec::new().into())).await
    }

    fn rooms(&self) -> MutexGuard<'_, HashSet<RoomId>> {
        self.joined_rooms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // Room mutation goes through the registry so its room sets stay in step.
    pub(crate) fn join_room(&self, room_id: RoomId) -> bool {
        self.rooms().insert(room_id)
    }

    pub(crate) fn leave_room(&self, room_id: RoomId) -> bool {
        self.rooms().remove(&room_id)
    }

    pub(crate) fn take_rooms(&self) -> HashSet<RoomId> {
        std::mem::take(&mut *self.rooms())
    }

    pub fn is_in_room(&self, room_id: RoomId) -> bool {
        self.rooms().contains(&room_id)
    }

    pub fn joined_rooms(&self) -> Vec<RoomId> {
        self.rooms().iter().copied().collect()
    }

    /// Close the transport
    ///
    /// Attempts a close handshake within the grace period, then drops the
    /// transport. Returns `false` if teardown had already started.
    pub async fn close(&self) -> bool {
        if !self.begin_close() {
            return false;
        }
        self.failed.cancel();

        let (done_tx, done_rx) = oneshot::channel();
        let graceful = match self.outbox.try_send(Outbound::Close { done: done_tx }) {
            Ok(()) => matches!(timeout(self.config.close_grace, done_rx).await, Ok(Ok(()))),
            Err(_) => false,
        };
        if !graceful {
            debug!(
                user_id = self.user_id,
                conn_id = %self.id,
                "close handshake did not complete, forcing close"
            );
        }
        self.abort.cancel();

        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
        info!(user_id = self.user_id, conn_id = %self.id, "connection closed");
        true
    }

    /// Decode an inbound payload and stamp the authenticated sender
    fn decode_inbound(&self, payload: &[u8]) -> Option<Message> {
        match Message::decode(payload) {
            Ok(mut message) => {
                message.assign_sender(self.user_id);
                Some(message)
            }
            Err(e) => {
                warn!(user_id = self.user_id, error = %e, "dropping malformed frame");
                None
            }
        }
    }

    /// Read loop
    ///
    /// Runs until the peer goes away, the read deadline passes, a write fails,
    /// or `shutdown` fires, then unregisters this connection.
    pub(crate) async fn run_reader<St>(
        self: Arc<Self>,
        mut stream: St,
        registry: Registry,
        read_timeout: Duration,
        shutdown: CancellationToken,
    ) where
        St: Stream<Item = Result<WsMessage, WsError>> + Unpin,
    {
        self.mark_active();
        debug!(user_id = self.user_id, conn_id = %self.id, "read loop started");

        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(user_id = self.user_id, "shutdown, ending read loop");
                    break;
                }
                _ = self.failed.cancelled() => {
                    debug!(user_id = self.user_id, "transport failed, ending read loop");
                    break;
                }
                next = timeout(read_timeout, stream.next()) => next,
            };

            let frame = match next {
                Ok(Some(Ok(frame))) => frame,
                Ok(Some(Err(e))) => {
                    debug!(user_id = self.user_id, error = %e, "WebSocket read error");
                    break;
                }
                Ok(None) => {
                    debug!(user_id = self.user_id, "stream ended");
                    break;
                }
                Err(_) => {
                    let err = TransportError::ReadTimeout(read_timeout);
                    warn!(user_id = self.user_id, error = %err, "peer idle, ending read loop");
                    break;
                }
            };

            let message = match frame {
                WsMessage::Text(text) => self.decode_inbound(text.as_bytes()),
                WsMessage::Binary(data) => self.decode_inbound(&data),
                WsMessage::Close(_) => {
                    debug!(user_id = self.user_id, "client sent close frame");
                    break;
                }
                // Pong replies are queued by tungstenite itself
                WsMessage::Ping(_) => {
                    trace!(user_id = self.user_id, "ping");
                    None
                }
                WsMessage::Pong(_) => {
                    trace!(user_id = self.user_id, "pong");
                    None
                }
                WsMessage::Frame(_) => None,
            };

            if let Some(message) = message {
                registry.route_inbound(&self, message).await;
            }
        }

        registry.unregister_connection(&self).await;
        debug!(user_id = self.user_id, conn_id = %self.id, "read loop ended");
    }
}

/// Write task: drains the outbox into the sink, one frame at a time
async fn write_loop(
    mut sink: FrameSink,
    mut outbox: mpsc::Receiver<Outbound>,
    failed: CancellationToken,
    write_timeout: Duration,
) {
    while let Some(outbound) = outbox.recv().await {
        match outbound {
            Outbound::Frame { frame, ack } => {
                let result = match timeout(write_timeout, sink.send(frame)).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(TransportError::WebSocket(e)),
                    Err(_) => Err(TransportError::WriteTimeout(write_timeout)),
                };
                let fatal = result.is_err();
                if fatal {
                    failed.cancel();
                }
                let _ = ack.send(result);
                if fatal {
                    break;
                }
            }
            Outbound::Close { done } => {
                if let Err(e) = sink.close().await {
                    debug!(error = %e, "close handshake failed");
                }
                let _ = done.send(());
                break;
            }
        }
    }
    trace!("write task ended");
}
