//! Pure synchronous KCP protocol engine.
//!
//! This crate implements the core KCP ARQ protocol with no runtime
//! dependencies: no tokio, no async, no I/O, no clock. The caller feeds
//! datagrams in with [`KcpEngine::input`], drives time with
//! [`KcpEngine::update`], and carries emitted datagrams to the transport.
//!
//! ```text
//! ┌───────────────────────────────────┐
//! │  ukcp-core                        │
//! │                                   │
//! │  protocol   ← wire types          │
//! │  segment    ← header + payload    │
//! │  pool       ← payload buffers     │
//! │  rtt        ← RTO estimator       │
//! │  congestion ← cwnd / ssthresh     │
//! │  config     ← tuning              │
//! │  engine     ← state machine       │
//! │  registry   ← conv → engine       │
//! └───────────────────────────────────┘
//! ```

pub mod config;
pub mod congestion;
pub mod engine;
pub mod error;
mod output;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod rtt;
pub mod segment;

pub use config::{KcpCoreConfig, NodeDelayConfig};
pub use engine::{ConvState, KcpEngine};
pub use error::{KcpCoreError, KcpCoreResult};
pub use output::OutputFn;
pub use pool::{PoolStats, SegmentPool};
pub use protocol::*;
pub use registry::ConversationTable;
