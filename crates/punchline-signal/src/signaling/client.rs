//! Signaling client.
//!
//! Requests are written by a single writer task in call order and answered by
//! the relay in the same order, so replies are matched to callers FIFO.
//! Requests that the relay only answers on failure are followed by a `ping`
//! barrier: an `error` ahead of the matching `pong` means the request was
//! rejected.

use super::protocol::{
    ClientMessage, DirectedKind, Envelope, ErrorCode, Metadata, PeerSummary, ServerMessage,
};
use crate::error::SignalError;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Signaling client configuration
#[derive(Debug, Clone)]
pub struct SignalClientConfig {
    /// Deadline for connecting and for every request
    pub request_timeout: Duration,
    /// Period of keep-alive pings, disabled when `None`
    pub keepalive_interval: Option<Duration>,
}

impl Default for SignalClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            keepalive_interval: Some(Duration::from_secs(30)),
        }
    }
}

/// Unsolicited traffic from the relay
#[derive(Debug, Clone, PartialEq)]
pub enum SignalEvent {
    /// A peer joined one of our rooms
    PeerJoined {
        /// Room name
        room_id: String,
        /// The new member
        peer: PeerSummary,
    },
    /// A peer left one of our rooms
    PeerLeft {
        /// Room name
        room_id: String,
        /// The departed member
        peer_id: String,
    },
    /// Directed message addressed to us; `envelope.from` is set by the relay
    Directed {
        /// Message kind
        kind: DirectedKind,
        /// Forwarded envelope
        envelope: Envelope,
    },
    /// Room fan-out
    Broadcast {
        /// Room name
        room_id: String,
        /// Sender
        from: String,
        /// Uninterpreted data
        data: Value,
    },
    /// The relay announced it is stopping
    Shutdown {
        /// Stated reason
        reason: String,
    },
    /// The connection to the relay is gone
    Disconnected,
}

struct Pending {
    barrier: bool,
    stash: Option<ServerMessage>,
    reply: oneshot::Sender<ServerMessage>,
}

enum Command {
    Send {
        messages: Vec<ClientMessage>,
        waiter: Option<Pending>,
    },
    Close,
}

type PendingQueue = Arc<Mutex<VecDeque<Pending>>>;

struct Inner {
    commands: mpsc::UnboundedSender<Command>,
    connected: Arc<AtomicBool>,
    connection_id: u64,
    config: SignalClientConfig,
    peer_id: Mutex<Option<String>>,
    keepalive: Option<JoinHandle<()>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Close);
        if let Some(keepalive) = &self.keepalive {
            keepalive.abort();
        }
    }
}

/// Connection to a signaling relay
///
/// Cloning is cheap; all clones share one connection.
#[derive(Clone)]
pub struct SignalClient {
    inner: Arc<Inner>,
}

impl SignalClient {
    /// Connect to `url` (for example `ws://127.0.0.1:8080`) and wait for the
    /// relay's `welcome`
    ///
    /// Returns the client and the receiver for [`SignalEvent`]s.
    ///
    /// # Errors
    ///
    /// Returns [`SignalError::Timeout`] if the handshake or `welcome` does not
    /// arrive within the request timeout, or [`SignalError::Transport`].
    pub async fn connect(
        url: &str,
        config: SignalClientConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalEvent>), SignalError> {
        let deadline = config.request_timeout;
        let timeout = |operation: &'static str| SignalError::Timeout {
            operation,
            after: deadline,
        };

        let (ws, _) = time::timeout(deadline, connect_async(url))
            .await
            .map_err(|_| timeout("connect"))??;
        let (mut sink, mut source) = ws.split();

        let connection_id = time::timeout(deadline, async {
            while let Some(frame) = source.next().await {
                if let Message::Text(text) = frame? {
                    if let ServerMessage::Welcome { connection_id } =
                        serde_json::from_str::<ServerMessage>(&text)?
                    {
                        return Ok(connection_id);
                    }
                }
            }
            Err::<u64, SignalError>(SignalError::Closed)
        })
        .await
        .map_err(|_| timeout("welcome"))??;
        info!("connected to signaling relay {url} as connection {connection_id}");

        let pending: PendingQueue = Arc::default();
        let connected = Arc::new(AtomicBool::new(true));
        let (commands, mut command_rx) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();

        let writer_pending = pending.clone();
        tokio::spawn(async move {
            'commands: while let Some(command) = command_rx.recv().await {
                match command {
                    Command::Send { messages, waiter } => {
                        if let Some(waiter) = waiter {
                            writer_pending.lock().await.push_back(waiter);
                        }
                        for message in messages {
                            let text = match serde_json::to_string(&message) {
                                Ok(text) => text,
                                Err(e) => {
                                    warn!("failed to encode {}: {e}", message.message_type());
                                    continue;
                                }
                            };
                            if let Err(e) = sink.send(Message::Text(text)).await {
                                debug!("signaling send failed: {e}");
                                break 'commands;
                            }
                        }
                    }
                    Command::Close => break,
                }
            }
            let _ = sink.close().await;
        });

        let reader_pending = pending.clone();
        let reader_connected = connected.clone();
        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!("signaling read failed: {e}");
                        break;
                    }
                };
                match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(message) => route(&reader_pending, &events, message).await,
                    Err(e) => warn!("ignoring malformed relay message: {e}"),
                }
            }
            reader_connected.store(false, Ordering::SeqCst);
            // Dropping the waiters fails their callers with `Closed`
            reader_pending.lock().await.clear();
            let _ = events.send(SignalEvent::Disconnected);
            info!("signaling connection closed");
        });

        let keepalive = config.keepalive_interval.map(|interval| {
            let commands = commands.clone();
            tokio::spawn(async move {
                let mut ticker = time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let (reply, _) = oneshot::channel();
                    let ping = Command::Send {
                        messages: vec![ClientMessage::Ping { timestamp: None }],
                        waiter: Some(Pending {
                            barrier: false,
                            stash: None,
                            reply,
                        }),
                    };
                    if commands.send(ping).is_err() {
                        break;
                    }
                }
            })
        });

        let client = Self {
            inner: Arc::new(Inner {
                commands,
                connected,
                connection_id,
                config,
                peer_id: Mutex::new(None),
                keepalive,
            }),
        };
        Ok((client, event_rx))
    }

    /// Relay-assigned connection identifier
    #[must_use]
    pub fn connection_id(&self) -> u64 {
        self.inner.connection_id
    }

    /// Whether the relay connection is still open
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Identifier registered through this client, if any
    pub async fn peer_id(&self) -> Option<String> {
        self.inner.peer_id.lock().await.clone()
    }

    /// Register `peer_id`; returns the metadata after the relay merged it
    ///
    /// # Errors
    ///
    /// Fails with the relay's rejection, [`SignalError::Timeout`] or
    /// [`SignalError::Closed`].
    pub async fn register(
        &self,
        peer_id: &str,
        metadata: Metadata,
    ) -> Result<Metadata, SignalError> {
        let reply = self
            .request(
                "register",
                vec![ClientMessage::Register {
                    peer_id: peer_id.to_string(),
                    metadata,
                }],
                false,
            )
            .await?;
        match check(reply, Some(peer_id))? {
            ServerMessage::Registered { metadata, .. } => {
                *self.inner.peer_id.lock().await = Some(peer_id.to_string());
                Ok(metadata)
            }
            _ => Err(unexpected("register")),
        }
    }

    /// Join `room_id`; returns the members present before us
    ///
    /// # Errors
    ///
    /// Fails with [`SignalError::NotRegistered`] before `register`.
    pub async fn join_room(&self, room_id: &str) -> Result<Vec<PeerSummary>, SignalError> {
        let reply = self
            .request(
                "join-room",
                vec![ClientMessage::JoinRoom {
                    room_id: room_id.to_string(),
                }],
                false,
            )
            .await?;
        match check(reply, Some(room_id))? {
            ServerMessage::RoomJoined { peers, .. } => Ok(peers),
            _ => Err(unexpected("join-room")),
        }
    }

    /// Leave `room_id`
    ///
    /// # Errors
    ///
    /// Fails with [`SignalError::NotInRoom`] or [`SignalError::RoomNotFound`].
    pub async fn leave_room(&self, room_id: &str) -> Result<(), SignalError> {
        let request = ClientMessage::LeaveRoom {
            room_id: room_id.to_string(),
        };
        self.checked("leave-room", request, room_id).await
    }

    /// Send an offer to `to`
    ///
    /// # Errors
    ///
    /// Fails with [`SignalError::PeerNotFound`] if `to` is not registered.
    pub async fn send_offer(&self, to: &str, payload: Value) -> Result<(), SignalError> {
        self.send_directed(DirectedKind::Offer, to, payload).await
    }

    /// Send an answer to `to`
    ///
    /// # Errors
    ///
    /// Fails with [`SignalError::PeerNotFound`] if `to` is not registered.
    pub async fn send_answer(&self, to: &str, payload: Value) -> Result<(), SignalError> {
        self.send_directed(DirectedKind::Answer, to, payload).await
    }

    /// Send a connectivity candidate to `to`
    ///
    /// # Errors
    ///
    /// Fails with [`SignalError::PeerNotFound`] if `to` is not registered.
    pub async fn send_ice_candidate(&self, to: &str, payload: Value) -> Result<(), SignalError> {
        self.send_directed(DirectedKind::IceCandidate, to, payload).await
    }

    /// Send a free-form signal to `to`
    ///
    /// # Errors
    ///
    /// Fails with [`SignalError::PeerNotFound`] if `to` is not registered.
    pub async fn send_signal(&self, to: &str, payload: Value) -> Result<(), SignalError> {
        self.send_directed(DirectedKind::Signal, to, payload).await
    }

    /// Send any directed message, confirmed by a ping barrier
    ///
    /// # Errors
    ///
    /// Fails with [`SignalError::PeerNotFound`] if `to` is not registered.
    pub async fn send_directed(
        &self,
        kind: DirectedKind,
        to: &str,
        payload: Value,
    ) -> Result<(), SignalError> {
        let request = kind.request(Envelope::new(to, payload));
        self.checked(kind.as_str(), request, to).await
    }

    /// Fan `data` out to the other members of `room_id`
    ///
    /// # Errors
    ///
    /// Fails if we are not a member of the room.
    pub async fn broadcast(&self, room_id: &str, data: Value) -> Result<(), SignalError> {
        let request = ClientMessage::Broadcast {
            room_id: room_id.to_string(),
            data,
        };
        self.checked("broadcast", request, room_id).await
    }

    /// Round-trip a `ping`
    ///
    /// # Errors
    ///
    /// Fails with [`SignalError::Timeout`] or [`SignalError::Closed`].
    pub async fn ping(&self) -> Result<Duration, SignalError> {
        let started = Instant::now();
        let reply = self
            .request("ping", vec![ClientMessage::Ping { timestamp: None }], false)
            .await?;
        match check(reply, None)? {
            ServerMessage::Pong { .. } => Ok(started.elapsed()),
            _ => Err(unexpected("ping")),
        }
    }

    /// Close the connection
    pub fn close(&self) {
        let _ = self.inner.commands.send(Command::Close);
        self.inner.connected.store(false, Ordering::SeqCst);
    }

    async fn checked(
        &self,
        operation: &'static str,
        request: ClientMessage,
        subject: &str,
    ) -> Result<(), SignalError> {
        let reply = self
            .request(
                operation,
                vec![request, ClientMessage::Ping { timestamp: None }],
                true,
            )
            .await?;
        check(reply, Some(subject)).map(|_| ())
    }

    async fn request(
        &self,
        operation: &'static str,
        messages: Vec<ClientMessage>,
        barrier: bool,
    ) -> Result<ServerMessage, SignalError> {
        let (reply, response) = oneshot::channel();
        self.inner
            .commands
            .send(Command::Send {
                messages,
                waiter: Some(Pending {
                    barrier,
                    stash: None,
                    reply,
                }),
            })
            .map_err(|_| SignalError::Closed)?;

        let after = self.inner.config.request_timeout;
        match time::timeout(after, response).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err(SignalError::Closed),
            Err(_) => Err(SignalError::Timeout { operation, after }),
        }
    }
}

async fn route(
    pending: &Mutex<VecDeque<Pending>>,
    events: &mpsc::UnboundedSender<SignalEvent>,
    message: ServerMessage,
) {
    let event = match message {
        ServerMessage::Registered { .. }
        | ServerMessage::RoomJoined { .. }
        | ServerMessage::Pong { .. }
        | ServerMessage::Error { .. } => {
            resolve(pending, message).await;
            return;
        }
        ServerMessage::PeerJoined { room_id, peer } => SignalEvent::PeerJoined { room_id, peer },
        ServerMessage::PeerLeft { room_id, peer_id } => SignalEvent::PeerLeft { room_id, peer_id },
        ServerMessage::Broadcast {
            room_id,
            from,
            data,
        } => SignalEvent::Broadcast {
            room_id,
            from,
            data,
        },
        ServerMessage::ServerShutdown { reason } => {
            warn!("signaling relay shutting down: {reason}");
            SignalEvent::Shutdown { reason }
        }
        ServerMessage::Welcome { .. } => return,
        other => match other.into_directed() {
            Ok((kind, envelope)) => SignalEvent::Directed { kind, envelope },
            Err(other) => {
                debug!("ignoring {}", other.message_type());
                return;
            }
        },
    };
    let _ = events.send(event);
}

async fn resolve(pending: &Mutex<VecDeque<Pending>>, message: ServerMessage) {
    let mut queue = pending.lock().await;
    let Some(front) = queue.front_mut() else {
        debug!("unsolicited {} from relay", message.message_type());
        return;
    };

    if front.barrier && !matches!(message, ServerMessage::Pong { .. }) {
        front.stash.get_or_insert(message);
        return;
    }
    if let Some(waiter) = queue.pop_front() {
        let _ = waiter.reply.send(waiter.stash.unwrap_or(message));
    }
}

fn check(reply: ServerMessage, subject: Option<&str>) -> Result<ServerMessage, SignalError> {
    match reply {
        ServerMessage::Error { code, message, .. } => {
            Err(SignalError::from_code(code, message, subject))
        }
        reply => Ok(reply),
    }
}

fn unexpected(operation: &str) -> SignalError {
    SignalError::Rejected {
        code: ErrorCode::InvalidMessage,
        message: format!("unexpected reply to {operation}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::server::{SignalServer, SignalServerConfig};
    use serde_json::json;

    async fn relay() -> String {
        let server = SignalServer::bind(SignalServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            http_addr: None,
            ..SignalServerConfig::default()
        })
        .await
        .unwrap();
        let url = format!("ws://{}", server.local_addr());
        let _running = server.spawn();
        url
    }

    async fn client(url: &str) -> (SignalClient, mpsc::UnboundedReceiver<SignalEvent>) {
        SignalClient::connect(url, SignalClientConfig::default())
            .await
            .unwrap()
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<SignalEvent>) -> SignalEvent {
        time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_register_join_and_notices() {
        let url = relay().await;
        let (alice, mut alice_events) = client(&url).await;
        let (bob, _bob_events) = client(&url).await;
        assert_ne!(alice.connection_id(), bob.connection_id());

        let mut meta = Metadata::new();
        meta.insert("role".into(), json!("seeder"));
        let merged = alice.register("alice", meta).await.unwrap();
        assert_eq!(merged["role"], "seeder");
        assert_eq!(alice.peer_id().await.as_deref(), Some("alice"));
        bob.register("bob", Metadata::new()).await.unwrap();

        assert!(alice.join_room("R1").await.unwrap().is_empty());
        let members = bob.join_room("R1").await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].peer_id, "alice");
        assert_eq!(members[0].metadata["role"], "seeder");

        match next_event(&mut alice_events).await {
            SignalEvent::PeerJoined { room_id, peer } => {
                assert_eq!(room_id, "R1");
                assert_eq!(peer.peer_id, "bob");
            }
            other => panic!("unexpected {other:?}"),
        }

        bob.leave_room("R1").await.unwrap();
        assert_eq!(
            next_event(&mut alice_events).await,
            SignalEvent::PeerLeft {
                room_id: "R1".into(),
                peer_id: "bob".into()
            }
        );
    }

    #[tokio::test]
    async fn test_directed_messages_are_checked() {
        let url = relay().await;
        let (alice, _alice_events) = client(&url).await;
        let (bob, mut bob_events) = client(&url).await;
        alice.register("alice", Metadata::new()).await.unwrap();
        bob.register("bob", Metadata::new()).await.unwrap();

        alice.send_signal("bob", json!({"kind": "hello"})).await.unwrap();
        match next_event(&mut bob_events).await {
            SignalEvent::Directed { kind, envelope } => {
                assert_eq!(kind, DirectedKind::Signal);
                assert_eq!(envelope.from.as_deref(), Some("alice"));
                assert_eq!(envelope.payload["kind"], "hello");
            }
            other => panic!("unexpected {other:?}"),
        }

        let err = alice.send_offer("carol", json!(null)).await.unwrap_err();
        assert!(matches!(err, SignalError::PeerNotFound(ref id) if id == "carol"));

        // The barrier keeps later replies aligned after a rejection
        assert!(alice.ping().await.is_ok());
        let err = alice.leave_room("nowhere").await.unwrap_err();
        assert!(matches!(err, SignalError::RoomNotFound(_)));
        assert!(alice.join_room("R2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_requests_before_register_fail() {
        let url = relay().await;
        let (client, _events) = client(&url).await;

        let err = client.join_room("R1").await.unwrap_err();
        assert!(matches!(err, SignalError::NotRegistered));
        let err = client.register("", Metadata::new()).await.unwrap_err();
        assert!(matches!(
            err,
            SignalError::Rejected {
                code: ErrorCode::InvalidPeerId,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_room() {
        let url = relay().await;
        let (alice, _a) = client(&url).await;
        let (bob, mut bob_events) = client(&url).await;
        alice.register("alice", Metadata::new()).await.unwrap();
        bob.register("bob", Metadata::new()).await.unwrap();
        bob.join_room("R1").await.unwrap();

        let err = alice.broadcast("R1", json!(1)).await.unwrap_err();
        assert!(matches!(err, SignalError::NotInRoom(_)));

        alice.join_room("R1").await.unwrap();
        next_event(&mut bob_events).await;
        alice.broadcast("R1", json!({"n": 1})).await.unwrap();
        assert_eq!(
            next_event(&mut bob_events).await,
            SignalEvent::Broadcast {
                room_id: "R1".into(),
                from: "alice".into(),
                data: json!({"n": 1})
            }
        );
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = SignalClient::connect(&format!("ws://{addr}"), SignalClientConfig::default()).await;
        assert!(matches!(result, Err(SignalError::Transport(_))));
    }
}
