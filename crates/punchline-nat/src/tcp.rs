//! TCP simultaneous open with passive fallback, the responder race, and direct connect.

use crate::error::PunchError;
use crate::hole_punch::HolePuncher;
use crate::socket::reusable_tcp;
use socket2::{SockRef, TcpKeepalive};
use std::future::Future;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time;
use tracing::{debug, info};

/// Idle time before the OS starts sending keep-alive probes
const TCP_KEEPALIVE_TIME: Duration = Duration::from_secs(25);

/// Established TCP path to a peer
#[derive(Debug)]
pub struct TcpLink {
    stream: TcpStream,
    local: SocketAddr,
    remote: SocketAddr,
}

impl TcpLink {
    fn establish(stream: TcpStream) -> Result<Self, PunchError> {
        SockRef::from(&stream)
            .set_tcp_keepalive(&TcpKeepalive::new().with_time(TCP_KEEPALIVE_TIME))?;
        stream.set_nodelay(true)?;
        let local = stream.local_addr()?;
        let remote = stream.peer_addr()?;
        Ok(Self {
            stream,
            local,
            remote,
        })
    }

    /// Local endpoint
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Remote endpoint
    #[must_use]
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Borrow the stream
    #[must_use]
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Mutably borrow the stream
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Take the stream
    #[must_use]
    pub fn into_stream(self) -> TcpStream {
        self.stream
    }

    /// Shut down both directions of the stream
    ///
    /// # Errors
    ///
    /// Returns [`PunchError::Socket`] if the socket is already gone.
    pub fn shutdown(&self) -> Result<(), PunchError> {
        match SockRef::from(&self.stream).shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl HolePuncher {
    /// TCP hole punch towards `remote`
    ///
    /// First a simultaneous-open `connect` from the fixed `local` endpoint,
    /// then, on refusal or timeout, a plain `connect` from an ephemeral port.
    ///
    /// # Errors
    ///
    /// Returns the passive attempt's error when both attempts fail. Any other
    /// simultaneous-open failure (such as `local` being taken) is returned as is.
    pub async fn tcp_punch(
        &self,
        local: SocketAddr,
        remote: SocketAddr,
    ) -> Result<TcpLink, PunchError> {
        match self.simultaneous_open(local, remote).await {
            Ok(link) => Ok(link),
            Err(e @ (PunchError::Refused(_) | PunchError::Timeout { .. })) => {
                debug!("simultaneous open {local} -> {remote} failed ({e}), trying passive connect");
                let stream = connect_within(
                    remote,
                    self.config.tcp_connect_timeout,
                    TcpStream::connect(remote),
                )
                .await?;
                info!("TCP passive connect to {remote} succeeded");
                TcpLink::establish(stream)
            }
            Err(e) => Err(e),
        }
    }

    /// Responder side of a TCP hole punch
    ///
    /// Listens on `local` while punching towards `remote` from the same port,
    /// and returns whichever yields a stream first. A failed punch leaves the
    /// listener running until the connection timeout.
    ///
    /// # Errors
    ///
    /// Returns the listener's error once both halves have failed.
    pub async fn tcp_respond(
        &self,
        local: SocketAddr,
        remote: SocketAddr,
    ) -> Result<TcpLink, PunchError> {
        let accept = self.tcp_accept(local);
        let punch = self.tcp_punch(local, remote);
        tokio::pin!(accept, punch);
        let mut punch_failed = false;

        loop {
            tokio::select! {
                biased;
                accepted = &mut accept => {
                    return match accepted {
                        Err(e) if !punch_failed => {
                            debug!("TCP accept on {local} failed ({e}), waiting on punch");
                            (&mut punch).await
                        }
                        result => result,
                    };
                }
                punched = &mut punch, if !punch_failed => match punched {
                    Ok(link) => return Ok(link),
                    Err(e) => {
                        debug!("TCP punch {local} -> {remote} failed ({e}), still accepting");
                        punch_failed = true;
                    }
                },
            }
        }
    }

    async fn simultaneous_open(
        &self,
        local: SocketAddr,
        remote: SocketAddr,
    ) -> Result<TcpLink, PunchError> {
        let socket = reusable_tcp(local)?;
        let stream =
            connect_within(remote, self.config.tcp_connect_timeout, socket.connect(remote)).await?;
        info!("TCP simultaneous open {local} -> {remote} succeeded");
        TcpLink::establish(stream)
    }

    /// Plain `connect` straight to `remote`, with no punching
    ///
    /// Only meaningful when both sides have no NAT.
    ///
    /// # Errors
    ///
    /// Returns [`PunchError::Refused`], [`PunchError::Timeout`] or
    /// [`PunchError::Socket`].
    pub async fn direct_connect(&self, remote: SocketAddr) -> Result<TcpLink, PunchError> {
        let stream = connect_within(
            remote,
            self.config.tcp_connect_timeout,
            TcpStream::connect(remote),
        )
        .await?;
        info!("direct connection to {remote} established");
        TcpLink::establish(stream)
    }

    /// Responder side of TCP punch and direct connect
    ///
    /// Listens on `local` (with address reuse) until the connection timeout
    /// and returns the first accepted stream.
    ///
    /// # Errors
    ///
    /// Returns [`PunchError::Timeout`] if nobody connects in time.
    pub async fn tcp_accept(&self, local: SocketAddr) -> Result<TcpLink, PunchError> {
        let listener = reusable_tcp(local)?.listen(16)?;
        let timeout = self.config.connection_timeout;
        debug!("accepting TCP on {}", listener.local_addr()?);

        match time::timeout(timeout, listener.accept()).await {
            Ok(Ok((stream, from))) => {
                info!("accepted TCP connection from {from}");
                TcpLink::establish(stream)
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(PunchError::Timeout {
                remote: local,
                after: timeout,
            }),
        }
    }
}

async fn connect_within<F>(
    remote: SocketAddr,
    timeout: Duration,
    connect: F,
) -> Result<TcpStream, PunchError>
where
    F: Future<Output = io::Result<TcpStream>>,
{
    match time::timeout(timeout, connect).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
            Err(PunchError::Refused(remote))
        }
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(PunchError::Timeout {
            remote,
            after: timeout,
        }),
    }
}
