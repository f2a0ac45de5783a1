//! # ukcp: caller-clocked KCP conversations
//!
//! A reliable, ordered, message-oriented ARQ protocol over an unreliable
//! datagram transport. The protocol core never reads a clock and never does
//! I/O; this crate adds an async runtime layer that does both.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────┐
//! │  ukcp  (this crate)                   │
//! │                                       │
//! │  KcpEndpoint / KcpSession ← user API  │
//! │  actor                    ← clock     │
//! │  transport                ← datagrams │
//! ├───────────────────────────────────────┤
//! │  ukcp-core  (dependency)              │
//! │                                       │
//! │  KcpEngine   ← pure sync state machine│
//! │  protocol    ← wire types & constants │
//! └───────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ukcp::{KcpConfig, KcpEndpoint};
//! use std::net::SocketAddr;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let peer: SocketAddr = "127.0.0.1:8080".parse()?;
//!     let endpoint = KcpEndpoint::bind("0.0.0.0:0".parse()?, KcpConfig::new().fast_mode()).await?;
//!
//!     let mut session = endpoint.open(0x1234, peer)?;
//!     session.send(&b"Hello, KCP!"[..]).await?;
//!     let reply = session.recv().await?;
//!     println!("Received: {:?}", reply);
//!
//!     Ok(())
//! }
//! ```

// ── Layer 1: Core protocol (re-exported from ukcp-core) ─────────────────

/// Core protocol types, constants, and wire format.
pub use ukcp_core::protocol;

/// Direct access to the standalone `ukcp-core` crate.
pub use ukcp_core;

pub use ukcp_core::{ConvId, ConversationTable, KcpEngine, KcpStats};

// ── Layer 2: Transport ──────────────────────────────────────────────────

pub mod transport;
pub use transport::{Addr, Transport};
#[cfg(feature = "tokio")]
pub use transport::{MemoryAddr, MemoryTransport, UdpTransport};

// ── Layer 3: Configuration & errors (extends core with runtime concerns) ─

pub mod config;
pub mod error;
pub use config::{KcpConfig, NodeDelayConfig};
pub use error::{ConnectionError, KcpError, Result};

// ── Layer 4: Async conversations (actor + endpoint) ─────────────────────

#[cfg(feature = "tokio")]
pub(crate) mod actor;
#[cfg(feature = "tokio")]
pub mod endpoint;

#[cfg(feature = "tokio")]
pub use endpoint::{KcpEndpoint, KcpSession};

pub mod metrics;

// ── Version info ────────────────────────────────────────────────────────

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
