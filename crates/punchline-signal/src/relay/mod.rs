//! # DERP-Style Datagram Relay
//!
//! Forwards opaque UDP payloads between clients that cannot reach each other
//! directly. Clients register under a string identifier from the address
//! they send from; the relay never inspects payloads.
//!
//! ## Architecture
//!
//! ```text
//!                    ┌─────────────────┐
//!                    │   Relay Server  │
//!                    │  (Public IP)    │
//!                    └────────┬────────┘
//!                             │
//!              ┌──────────────┴──────────────┐
//!              │                              │
//!              ▼                              ▼
//!       ┌─────────────┐                ┌─────────────┐
//!       │   Peer A    │                │   Peer B    │
//!       │  (NAT'd)    │                │  (NAT'd)    │
//!       └─────────────┘                └─────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use punchline_signal::relay::RelayClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client = RelayClient::connect("203.0.113.1:3479".parse()?, "alice/1").await?;
//! client.register().await?;
//! client.send_to_peer("bob/1", b"hello").await?;
//! let (from, data) = client.recv_from_peer().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{RelayClient, RelayClientState};
pub use protocol::{ClientId, RelayErrorCode, RelayMessage};
pub use server::{RelayServer, RelayServerConfig};

use std::io;

/// Default relay port
pub const DEFAULT_RELAY_PORT: u16 = 3479;

/// Maximum relay packet size (64 KB)
pub const MAX_RELAY_PACKET_SIZE: usize = 65536;

/// Relay keepalive interval (30 seconds)
pub const RELAY_KEEPALIVE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

/// Relay registration timeout (10 seconds)
pub const RELAY_CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// ICMP errors surfaced on UDP sockets by some platforms
pub(crate) fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
    )
}
