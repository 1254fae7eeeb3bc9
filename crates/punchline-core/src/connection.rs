//! Established peer connections.

use crate::attempt::AttemptId;
use crate::error::CoordinatorError;
use crate::relay_link::RelayLink;
use crate::strategy::ConnectionMethod;
use punchline_nat::{LinkHealth, TcpLink, UdpLink};
use serde::Serialize;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Coordinator-assigned connection identifier
pub type ConnectionId = u64;

/// The transport underneath a connection
#[derive(Debug)]
pub enum Link {
    /// Punched UDP path
    Udp(UdpLink),
    /// TCP stream from a punch or direct connect
    Tcp(TcpLink),
    /// Relayed datagrams
    Relay(RelayLink),
}

impl Link {
    fn local_addr(&self) -> SocketAddr {
        match self {
            Self::Udp(link) => link.local_addr(),
            Self::Tcp(link) => link.local_addr(),
            Self::Relay(link) => link.local_addr(),
        }
    }

    fn remote_addr(&self) -> SocketAddr {
        match self {
            Self::Udp(link) => link.remote_addr(),
            Self::Tcp(link) => link.remote_addr(),
            Self::Relay(link) => link.relay_addr(),
        }
    }
}

/// Reportable connection facts
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    /// Connection id
    pub id: ConnectionId,
    /// Remote peer
    pub peer_id: String,
    /// How the path was established
    pub method: ConnectionMethod,
    /// Attempt that produced it
    pub attempt: AttemptId,
    /// Our end of the path
    pub local_endpoint: SocketAddr,
    /// The far end; the relay server for relayed connections
    pub remote_endpoint: SocketAddr,
    /// Milliseconds from announcing the attempt to establishment
    pub connect_ms: u64,
    /// Establishment time, seconds since the Unix epoch
    pub established_at: u64,
}

struct Shared {
    info: ConnectionInfo,
    link: Link,
    closed: AtomicBool,
}

/// An established connection to a peer
///
/// Clones share the underlying link. The coordinator keeps one clone in its
/// connection table until [`close_connection`] or [`shutdown`].
///
/// [`close_connection`]: crate::Coordinator::close_connection
/// [`shutdown`]: crate::Coordinator::shutdown
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("info", &self.shared.info)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        peer_id: &str,
        method: ConnectionMethod,
        attempt: &str,
        link: Link,
        connect_time: Duration,
    ) -> Self {
        let established_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let info = ConnectionInfo {
            id,
            peer_id: peer_id.to_string(),
            method,
            attempt: attempt.to_string(),
            local_endpoint: link.local_addr(),
            remote_endpoint: link.remote_addr(),
            connect_ms: u64::try_from(connect_time.as_millis()).unwrap_or(u64::MAX),
            established_at,
        };
        Self {
            shared: Arc::new(Shared {
                info,
                link,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Connection facts
    #[must_use]
    pub fn info(&self) -> &ConnectionInfo {
        &self.shared.info
    }

    /// Connection id
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.shared.info.id
    }

    /// Remote peer
    #[must_use]
    pub fn peer_id(&self) -> &str {
        &self.shared.info.peer_id
    }

    /// Establishment method
    #[must_use]
    pub fn method(&self) -> ConnectionMethod {
        self.shared.info.method
    }

    /// Our end of the path
    #[must_use]
    pub fn local_endpoint(&self) -> SocketAddr {
        self.shared.info.local_endpoint
    }

    /// The far end of the path
    #[must_use]
    pub fn remote_endpoint(&self) -> SocketAddr {
        self.shared.info.remote_endpoint
    }

    /// Underlying transport
    #[must_use]
    pub fn link(&self) -> &Link {
        &self.shared.link
    }

    /// Whether [`close`](Self::close) has run
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Whether the link is open and its keep-alive healthy
    #[must_use]
    pub fn is_alive(&self) -> bool {
        !self.is_closed()
            && match &self.shared.link {
                Link::Udp(link) => link.is_alive(),
                Link::Tcp(_) => true,
                Link::Relay(link) => link.is_alive(),
            }
    }

    /// Failure flag of the link's keep-alive
    ///
    /// TCP links rely on OS keep-alive and have none.
    pub(crate) fn health(&self) -> Option<Arc<LinkHealth>> {
        match &self.shared.link {
            Link::Udp(link) => Some(link.health()),
            Link::Tcp(_) => None,
            Link::Relay(link) => Some(link.health()),
        }
    }

    /// Send application data
    ///
    /// UDP and relayed links send one datagram; TCP writes the whole buffer.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::Closed`] after close, or the transport
    /// error.
    pub async fn send(&self, data: &[u8]) -> Result<(), CoordinatorError> {
        if self.is_closed() {
            return Err(CoordinatorError::Closed);
        }
        match &self.shared.link {
            Link::Udp(link) => {
                link.send(data).await?;
            }
            Link::Tcp(link) => {
                let stream = link.stream();
                let mut rest = data;
                while !rest.is_empty() {
                    stream.writable().await?;
                    match stream.try_write(rest) {
                        Ok(0) => return Err(CoordinatorError::Closed),
                        Ok(written) => rest = &rest[written..],
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            Link::Relay(link) => link.send(data).await?,
        }
        Ok(())
    }

    /// Receive application data into `buf`
    ///
    /// Returns the number of bytes written. Relayed payloads longer than
    /// `buf` are truncated.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::Closed`] after close or when a TCP peer
    /// hangs up.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize, CoordinatorError> {
        if self.is_closed() {
            return Err(CoordinatorError::Closed);
        }
        match &self.shared.link {
            Link::Udp(link) => Ok(link.recv(buf).await?),
            Link::Tcp(link) => {
                let stream = link.stream();
                loop {
                    stream.readable().await?;
                    match stream.try_read(buf) {
                        Ok(0) if !buf.is_empty() => return Err(CoordinatorError::Closed),
                        Ok(read) => return Ok(read),
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            Link::Relay(link) => {
                let payload = link.recv().await?;
                let len = payload.len().min(buf.len());
                buf[..len].copy_from_slice(&payload[..len]);
                Ok(len)
            }
        }
    }

    /// Tear down the link and its keep-alive
    ///
    /// Only the first call has an effect.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        match &self.shared.link {
            Link::Udp(link) => link.shutdown(),
            Link::Tcp(link) => {
                if let Err(e) = link.shutdown() {
                    warn!("TCP shutdown for connection {} failed: {e}", self.id());
                }
            }
            Link::Relay(link) => link.close().await,
        }
        debug!(
            "connection {} to {} ({}) closed",
            self.id(),
            self.peer_id(),
            self.method()
        );
    }
}
