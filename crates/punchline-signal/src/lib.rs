//! # Punchline Signal
//!
//! Rendezvous services for Punchline peers.
//!
//! This crate provides:
//! - A JSON-over-WebSocket signaling relay with peer and room bookkeeping
//! - A read-only HTTP introspection side-channel for the relay
//! - A signaling client with checked directed messages
//! - A DERP-style datagram relay used when no direct path can be punched
//!
//! Payloads carried by either relay are opaque; neither ever interprets
//! what peers send each other.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod relay;
pub mod signaling;

pub use error::{RelayError, SignalError};
pub use relay::{RelayClient, RelayServer, RelayServerConfig};
pub use signaling::{
    SignalClient, SignalClientConfig, SignalEvent, SignalServer, SignalServerConfig,
};
