//! # Signaling Relay
//!
//! A WebSocket message relay that lets NAT'd peers find each other and
//! exchange addressing payloads before any direct path exists.
//!
//! The relay only knows identities and rooms. Directed messages (`offer`,
//! `answer`, `ice-candidate`, `signal`) are forwarded verbatim after checking
//! that the target is registered; payloads are never interpreted.
//!
//! ## Example
//!
//! ```rust,no_run
//! use punchline_signal::signaling::{SignalClient, SignalClientConfig, SignalServer, SignalServerConfig};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let server = SignalServer::bind(SignalServerConfig::default()).await?;
//! let url = format!("ws://{}", server.local_addr());
//! let (_handle, _task) = server.spawn();
//!
//! let (client, mut events) = SignalClient::connect(&url, SignalClientConfig::default()).await?;
//! client.register("alice", Default::default()).await?;
//! let members = client.join_room("lobby").await?;
//! for member in members {
//!     client.send_signal(&member.peer_id, json!({ "hello": true })).await?;
//! }
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
mod http;
pub mod protocol;
pub mod registry;
pub mod server;

pub use client::{SignalClient, SignalClientConfig, SignalEvent};
pub use protocol::{
    ClientMessage, DirectedKind, Envelope, ErrorCode, Metadata, PeerSummary, ServerMessage,
};
pub use registry::{Registry, RegistryError};
pub use server::{ServerHandle, ServerStats, SignalServer, SignalServerConfig};
