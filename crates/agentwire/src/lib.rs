//! Fault-tolerant RPC between named agents.
//!
//! Two halves share one wire format:
//!
//! - [`server`]: an [`Endpoint`] accepts connections and dispatches each
//!   request to a [`Service`], bounded by a cap on outstanding calls and on
//!   buffered response bytes per connection.
//! - [`client`]: a [`Pool`] resolves agent names through [`Discovery`],
//!   keeps connections to them warm, and multiplexes [`AsyncCall`]s over
//!   them, reconnecting and re-issuing calls when connections break.
//!
//! Payloads cross the wire through the [`Encode`]/[`Decode`] contract in
//! [`payload`]; the substrate never looks inside them.
//!
//! # Module Organization
//!
//! - [`wire`]: frame headers and codecs
//! - [`payload`]: payload contract and serde adapters
//! - [`transport`]: TCP and Unix-domain sockets
//! - [`discovery`]: agent name resolution
//! - [`server`]: endpoint, connection workers, incomplete calls
//! - [`client`]: pool, maintenance task, async calls

pub mod client;
pub mod discovery;
pub mod payload;
pub mod server;
pub mod transport;
pub mod wire;

pub use agentwire_common::errors;
pub use agentwire_common::{
    AgentName, EndpointConfig, PeerName, PoolConfig, RpcError, RpcResult,
};
pub use client::{AsyncCall, CallId, CallOptions, ConnectionHandle, Pool, PoolStats};
pub use discovery::{Discovery, StaticDiscovery};
pub use payload::{Decode, Encode, Json, PayloadReader};
pub use server::{Endpoint, EndpointStats, IncompleteCall, Service};
pub use wire::{SequenceNumber, PROTOCOL_VERSION};

#[cfg(feature = "binary")]
pub use payload::MsgPack;
