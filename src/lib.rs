//! A2A Message Fabric
//!
//! A small distributed messaging fabric in which autonomous agents register
//! with a central broker, discover one another by advertised capability,
//! exchange signed envelope-wrapped messages, and maintain liveness through
//! periodic heartbeats:
//! - Broker: registry, discovery index, liveness tracker, and
//!   store-and-forward router
//! - Agent runtime: envelope construction and signing, reliable send with
//!   ACK-driven retransmission, inbox dispatch, registration and heartbeat
//!   loops
//! - Signature layer: RS256 bearer tokens bound to the issuing agent
//!
//! # Example
//!
//! ```rust,no_run
//! use a2a_fabric::{api, AppState, Broker, BrokerConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let broker = Arc::new(Broker::new(BrokerConfig::from_env())?);
//!     api::start_server(AppState { broker }, "0.0.0.0", 8000).await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod bootstrap;
pub mod broker;
pub mod config;
pub mod error;
pub mod inbox;
pub mod protocol;
pub mod runtime;
pub mod signature;
pub mod tools;

// Re-export main types
pub use api::AppState;
pub use broker::{
    is_online, AgentCard, AgentLiveness, AgentRecord, Broker, DiscoveredAgent, RouteOutcome,
};
pub use config::{AgentRuntimeConfig, BrokerConfig};
pub use error::{FabricError, Result, SignatureError};
pub use inbox::AgentState;
pub use protocol::{
    fresh_id, A2AMessage, AgentInfo, Envelope, MessageBody, MessageType, PROTOCOL_VERSION,
};
pub use runtime::{AgentRuntime, InboxOutcome, PendingAck, QueryAnswer};
pub use signature::{Claims, EnvelopeSigner, TokenVerifier, TOKEN_TTL_SECS};
pub use tools::{PassthroughTranslator, QueryExecutor, ToolClient, Translator};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
