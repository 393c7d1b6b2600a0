//! Shared building blocks for the agentwire RPC substrate.
//!
//! # Module Organization
//!
//! - [`ids`]: agent and peer names
//! - [`errors`]: the error taxonomy and result alias
//! - [`config`]: pool and endpoint configuration
//! - [`observability`]: tracing bootstrap for executables

pub mod config;
pub mod errors;
pub mod ids;
pub mod observability;

pub use config::{EndpointConfig, PoolConfig};
pub use errors::{RpcError, RpcResult};
pub use ids::{AgentName, PeerName};
pub use observability::init_tracing;
