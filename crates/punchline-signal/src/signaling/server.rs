//! WebSocket signaling server.
//!
//! Every connection gets a reader loop and a writer task. All registry
//! mutations and the resulting fan-out happen under one lock, so deliveries
//! from different connections never interleave inconsistently.

use super::http;
use super::protocol::{ClientMessage, DirectedKind, ErrorCode, ServerMessage};
use super::registry::{ConnId, Delivery, Registry};
use crate::error::SignalError;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Signaling server configuration
#[derive(Debug, Clone)]
pub struct SignalServerConfig {
    /// WebSocket listen address
    pub bind_addr: SocketAddr,
    /// HTTP introspection listen address, disabled when `None`
    pub http_addr: Option<SocketAddr>,
    /// Liveness sweep period
    pub sweep_interval: Duration,
    /// Idle time after which a peer is evicted
    pub inactivity_timeout: Duration,
    /// Maximum number of registered peers
    pub max_peers: usize,
}

impl Default for SignalServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            http_addr: Some(SocketAddr::from(([0, 0, 0, 0], 8081))),
            sweep_interval: Duration::from_secs(60),
            inactivity_timeout: Duration::from_secs(300),
            max_peers: 10_000,
        }
    }
}

/// Relay counters reported by `/stats`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStats {
    /// Registered peers
    pub peers: usize,
    /// Non-empty rooms
    pub rooms: usize,
    /// Open transport connections
    pub connections: usize,
    /// Directed and broadcast messages delivered
    pub messages_relayed: u64,
    /// Peers removed by the liveness sweep
    pub evictions: u64,
    /// Seconds since the server started
    pub uptime_secs: u64,
}

#[derive(Debug)]
enum Outbound {
    Message(ServerMessage),
    Close,
}

/// State guarded by the single relay lock
pub(crate) struct Hub {
    pub(crate) registry: Registry,
    outboxes: HashMap<ConnId, mpsc::UnboundedSender<Outbound>>,
    messages_relayed: u64,
    evictions: u64,
}

impl Hub {
    fn send(&self, conn: ConnId, message: ServerMessage) {
        if let Some(outbox) = self.outboxes.get(&conn) {
            let _ = outbox.send(Outbound::Message(message));
        }
    }

    fn dispatch(&self, deliveries: Vec<Delivery>) {
        for delivery in deliveries {
            self.send(delivery.conn, delivery.message);
        }
    }

    fn close(&self, conn: ConnId) {
        if let Some(outbox) = self.outboxes.get(&conn) {
            let _ = outbox.send(Outbound::Close);
        }
    }
}

pub(crate) struct Shared {
    pub(crate) hub: Mutex<Hub>,
    next_conn: AtomicU64,
    pub(crate) started: Instant,
    config: SignalServerConfig,
    shutdown: watch::Sender<Option<String>>,
}

impl Shared {
    pub(crate) async fn stats(&self) -> ServerStats {
        let hub = self.hub.lock().await;
        ServerStats {
            peers: hub.registry.peer_count(),
            rooms: hub.registry.room_count(),
            connections: hub.outboxes.len(),
            messages_relayed: hub.messages_relayed,
            evictions: hub.evictions,
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }

    async fn handle_text(&self, conn: ConnId, text: &str) {
        let now = Instant::now();
        let mut hub = self.hub.lock().await;
        hub.registry.touch(conn, now);

        let request = match serde_json::from_str::<ClientMessage>(text) {
            Ok(request) => request,
            Err(e) => {
                debug!("connection {conn} sent an invalid message: {e}");
                hub.send(
                    conn,
                    ServerMessage::Error {
                        code: ErrorCode::InvalidMessage,
                        message: e.to_string(),
                        request_type: None,
                    },
                );
                return;
            }
        };

        let request_type = request.message_type();
        let mut relayed = false;
        let result = match request {
            ClientMessage::Register { peer_id, metadata } => {
                hub.registry.register(conn, peer_id, metadata, now)
            }
            ClientMessage::JoinRoom { room_id } => hub.registry.join_room(conn, room_id, now),
            ClientMessage::LeaveRoom { room_id } => hub.registry.leave_room(conn, &room_id, now),
            ClientMessage::Offer(env) => {
                relayed = true;
                hub.registry.relay(conn, DirectedKind::Offer, env, now)
            }
            ClientMessage::Answer(env) => {
                relayed = true;
                hub.registry.relay(conn, DirectedKind::Answer, env, now)
            }
            ClientMessage::IceCandidate(env) => {
                relayed = true;
                hub.registry.relay(conn, DirectedKind::IceCandidate, env, now)
            }
            ClientMessage::Signal(env) => {
                relayed = true;
                hub.registry.relay(conn, DirectedKind::Signal, env, now)
            }
            ClientMessage::Broadcast { room_id, data } => {
                relayed = true;
                hub.registry.broadcast(conn, &room_id, data, now)
            }
            ClientMessage::Ping { timestamp } => Ok(vec![Delivery {
                conn,
                message: ServerMessage::Pong {
                    timestamp: timestamp.unwrap_or_else(unix_millis),
                },
            }]),
        };

        match result {
            Ok(deliveries) => {
                if relayed {
                    hub.messages_relayed += deliveries.len() as u64;
                }
                hub.dispatch(deliveries);
            }
            Err(e) => {
                debug!("rejecting {request_type} from connection {conn}: {e}");
                hub.send(
                    conn,
                    ServerMessage::Error {
                        code: e.code(),
                        message: e.to_string(),
                        request_type: Some(request_type.to_string()),
                    },
                );
            }
        }
    }

    async fn sweep(&self) {
        let mut hub = self.hub.lock().await;
        let outcome = hub
            .registry
            .sweep(Instant::now(), self.config.inactivity_timeout);
        if outcome.evicted.is_empty() {
            return;
        }

        info!("sweep evicted {} inactive peers", outcome.evicted.len());
        hub.evictions += outcome.evicted.len() as u64;
        hub.dispatch(outcome.deliveries);
        for conn in outcome.closed {
            hub.close(conn);
        }
    }

    async fn broadcast_shutdown(&self, reason: &str) {
        let hub = self.hub.lock().await;
        info!(
            "signaling server shutting down ({reason}), closing {} connections",
            hub.outboxes.len()
        );
        for conn in hub.outboxes.keys().copied() {
            hub.send(
                conn,
                ServerMessage::ServerShutdown {
                    reason: reason.to_string(),
                },
            );
            hub.close(conn);
        }
    }
}

/// Handle for stopping a running server and reading its counters
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
}

impl ServerHandle {
    /// Snapshot of the relay counters
    pub async fn stats(&self) -> ServerStats {
        self.shared.stats().await
    }

    /// Send `server-shutdown` to every peer, close all connections and stop
    /// accepting new ones
    pub fn shutdown(&self, reason: impl Into<String>) {
        let _ = self.shared.shutdown.send(Some(reason.into()));
    }
}

/// Signaling relay bound to its listen sockets
pub struct SignalServer {
    listener: TcpListener,
    http: Option<TcpListener>,
    local_addr: SocketAddr,
    http_addr: Option<SocketAddr>,
    shared: Arc<Shared>,
}

impl SignalServer {
    /// Bind the WebSocket and optional HTTP listeners
    ///
    /// # Errors
    ///
    /// Returns [`SignalError::Io`] if either address cannot be bound.
    pub async fn bind(config: SignalServerConfig) -> Result<Self, SignalError> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let http = match config.http_addr {
            Some(addr) => Some(TcpListener::bind(addr).await?),
            None => None,
        };
        let http_addr = http.as_ref().map(TcpListener::local_addr).transpose()?;

        let (shutdown, _) = watch::channel(None);
        let shared = Arc::new(Shared {
            hub: Mutex::new(Hub {
                registry: Registry::new(config.max_peers),
                outboxes: HashMap::new(),
                messages_relayed: 0,
                evictions: 0,
            }),
            next_conn: AtomicU64::new(1),
            started: Instant::now(),
            config,
            shutdown,
        });

        Ok(Self {
            listener,
            http,
            local_addr,
            http_addr,
            shared,
        })
    }

    /// Bound WebSocket address
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Bound HTTP introspection address
    #[must_use]
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    /// Control handle
    #[must_use]
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: self.shared.clone(),
        }
    }

    /// Run on a background task
    pub fn spawn(self) -> (ServerHandle, JoinHandle<Result<(), SignalError>>) {
        let handle = self.handle();
        (handle, tokio::spawn(self.run()))
    }

    /// Accept connections until shutdown
    ///
    /// # Errors
    ///
    /// Returns [`SignalError::Io`] if the listener fails.
    pub async fn run(self) -> Result<(), SignalError> {
        info!("signaling server listening on ws://{}", self.local_addr);
        let mut shutdown = self.shared.shutdown.subscribe();

        let sweeper = tokio::spawn(sweep_loop(self.shared.clone(), shutdown.clone()));
        let http = self.http.map(|listener| {
            info!("HTTP introspection on http://{}", self.http_addr.unwrap_or(self.local_addr));
            tokio::spawn(http::serve(listener, self.shared.clone(), shutdown.clone()))
        });

        let result = loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        tokio::spawn(handle_connection(self.shared.clone(), stream, addr));
                    }
                    Err(e) => {
                        warn!("signaling accept failed: {e}");
                        break Err(SignalError::Io(e));
                    }
                },
                changed = shutdown.changed() => {
                    let reason = match changed {
                        Ok(()) => shutdown.borrow().clone(),
                        Err(_) => None,
                    };
                    self.shared
                        .broadcast_shutdown(reason.as_deref().unwrap_or("shutdown"))
                        .await;
                    break Ok(());
                }
            }
        };

        sweeper.abort();
        if let Some(http) = http {
            http.abort();
        }
        result
    }
}

async fn sweep_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<Option<String>>) {
    let mut ticker = time::interval(shared.config.sweep_interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => shared.sweep().await,
            _ = shutdown.changed() => break,
        }
    }
}

async fn handle_connection(shared: Arc<Shared>, stream: TcpStream, addr: SocketAddr) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("WebSocket handshake with {addr} failed: {e}");
            return;
        }
    };

    let conn = shared.next_conn.fetch_add(1, Ordering::Relaxed);
    let (mut sink, mut source) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _ = tx.send(Outbound::Message(ServerMessage::Welcome {
        connection_id: conn,
    }));
    shared.hub.lock().await.outboxes.insert(conn, tx);
    debug!("connection {conn} opened from {addr}");

    let mut writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Message(message) => {
                    let text = match serde_json::to_string(&message) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("failed to encode {}: {e}", message.message_type());
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => break,
            }
        }
        let _ = sink.close().await;
    });

    let mut writer_done = false;
    loop {
        tokio::select! {
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => shared.handle_text(conn, &text).await,
                Some(Ok(Message::Binary(_))) => {
                    shared.hub.lock().await.send(conn, ServerMessage::Error {
                        code: ErrorCode::InvalidMessage,
                        message: "binary frames are not supported".to_string(),
                        request_type: None,
                    });
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("connection {conn} read error: {e}");
                    break;
                }
            },
            _ = &mut writer => {
                writer_done = true;
                break;
            }
        }
    }

    {
        let mut hub = shared.hub.lock().await;
        hub.outboxes.remove(&conn);
        let deliveries = hub.registry.disconnect(conn);
        hub.dispatch(deliveries);
    }
    if !writer_done {
        let _ = writer.await;
    }
    debug!("connection {conn} closed");
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
