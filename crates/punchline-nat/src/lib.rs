//! # Punchline NAT
//!
//! NAT traversal primitives for Punchline.
//!
//! This crate provides:
//! - STUN Binding transactions and a minimal STUN responder
//! - Best-effort NAT classification (open, full cone, port restricted, symmetric)
//! - UDP hole punching with per-link keep-alives
//! - Birthday-attack port prediction for symmetric NATs
//! - TCP simultaneous open, passive fallback, and direct connect
//!
//! None of these retry beyond their own deadline; fallback ordering belongs
//! to the caller.
//!
//! ## Example
//!
//! ```rust,no_run
//! use punchline_nat::{ClassifierConfig, HolePuncher, NatClassifier, PunchToken};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let info = NatClassifier::new(ClassifierConfig::default()).detect().await?;
//! println!("behind {} NAT at {}", info.nat_type, info.public_address);
//!
//! let token = PunchToken::random();
//! let link = HolePuncher::default()
//!     .udp_punch("0.0.0.0:40000".parse()?, "203.0.113.7:51000".parse()?, token)
//!     .await?;
//! link.send(b"hello").await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod classify;
pub mod error;
pub mod hole_punch;
pub mod packet;
mod socket;
pub mod stun;
pub mod tcp;

pub use classify::{ClassifierConfig, NatClassifier, NatInfo, NatType, classify};
pub use error::{NatError, PunchError, StunError};
pub use hole_punch::{
    HolePuncher, KeepAlive, LinkHealth, PunchConfig, UdpLink, birthday_candidates,
};
pub use packet::{ControlPacket, PacketKind, PunchToken};
pub use stun::{StunMessage, StunServer, probe};
pub use tcp::TcpLink;
