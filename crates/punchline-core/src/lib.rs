//! # Punchline Core
//!
//! Peer connection coordination for Punchline.
//!
//! The [`Coordinator`] ties the pieces together:
//! - NAT detection ([`punchline_nat::NatClassifier`]) or a configured override
//! - registration and rooms on the signaling relay
//! - strategy ranking from both peers' NAT types
//! - sequential or parallel fallback across UDP punching, TCP punching,
//!   the datagram relay and direct connect
//! - a connection table with stats and health
//!
//! ## Example
//!
//! ```rust,no_run
//! use punchline_core::{Coordinator, CoordinatorConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let coordinator = Coordinator::start(CoordinatorConfig {
//!     signaling_url: "ws://signal.example.net:8080".into(),
//!     ..CoordinatorConfig::default()
//! })
//! .await?;
//! coordinator.register_peer("alice", Default::default()).await?;
//! coordinator.join_room("lobby").await?;
//!
//! let connection = coordinator.connect_to_peer("bob").await?;
//! connection.send(b"hello").await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod announce;
pub mod attempt;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod directory;
pub mod error;
pub mod relay_link;
pub mod stats;
pub mod strategy;

pub use attempt::{Attempt, AttemptPhase, AttemptStatus};
pub use config::{CoordinatorConfig, FallbackMode, SymmetricPolicy};
pub use connection::{Connection, ConnectionId, ConnectionInfo, Link};
pub use coordinator::Coordinator;
pub use directory::{PeerDirectory, RemotePeer};
pub use error::{CoordinatorError, StrategyFailure};
pub use relay_link::RelayLink;
pub use stats::{CoordinatorStats, HealthReport, HealthStatus};
pub use strategy::{ConnectionMethod, Strategy, get_all_strategies, select_strategies};
