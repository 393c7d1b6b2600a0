//! Connection pool: the client side of the substrate.
//!
//! A [`Pool`] maps agent names to pooled connections through a
//! [`Discovery`] service and multiplexes any number of outstanding calls over
//! them. All pool state is owned by one background maintenance task per pool;
//! [`Pool::call`] and [`Pool::connect`] only hand work to it, so they never
//! block and never fail because an agent is unreachable.
//!
//! # Delivery
//!
//! A call whose connection breaks is re-sent verbatim on the next connection,
//! up to `call_retries` times. The first attempt may have executed remotely
//! before the break, so calls are delivered **at least once**: handlers that
//! must not run twice need their own deduplication. Application errors are
//! never retried.
//!
//! # Example
//!
//! ```ignore
//! let discovery = Arc::new(StaticDiscovery::new());
//! discovery.register(AgentName::new("echo")?, "127.0.0.1:7000".parse()?);
//!
//! let pool = Pool::new(PoolConfig::default(), discovery)?;
//! let call = pool.call::<_, (String, u32)>(
//!     &AgentName::new("echo")?,
//!     PROTOCOL_VERSION,
//!     CallOptions::new().with_timeout(Duration::from_secs(1)),
//!     "HELLO!",
//! );
//! let (text, counter) = call.pop(None).await?;
//! ```

mod call;
pub(crate) mod maintenance;

pub use call::{AsyncCall, CallId};

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use agentwire_common::{AgentName, PeerName, PoolConfig, RpcError, RpcResult};

use crate::discovery::Discovery;
use crate::payload::{encode_payload, Decode, Encode};
use maintenance::{Command, ConnectionKey, Maintenance, PendingCall};

/// Request header bytes counted against `max_message_size`.
const REQUEST_OVERHEAD: usize = 13;

/// Per-call options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallOptions {
    /// Absolute deadline; expiry fails the call with [`RpcError::Timeout`]
    pub deadline: Option<Instant>,
    /// The request is safe to re-send after an undecodable response
    pub idempotent: bool,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }
}

/// Lifecycle state of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Errored,
}

/// Statistics for one pooled connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    pub agent: AgentName,
    pub interface: u32,
    pub state: ConnectionState,
    pub peer: Option<PeerName>,
    /// Live [`ConnectionHandle`]s
    pub refcount: usize,
    /// Calls queued for the next connection
    pub waiting: usize,
    /// Calls sent and unanswered
    pub in_flight: usize,
    /// Connect attempts made
    pub attempts: u64,
    /// Calls re-issued after a failure
    pub retries: u64,
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub connections: Vec<ConnectionStats>,
}

impl PoolStats {
    pub fn connection(&self, agent: &AgentName) -> Option<&ConnectionStats> {
        self.connections.iter().find(|c| &c.agent == agent)
    }
}

/// Client-side connection pool.
pub struct Pool {
    config: PoolConfig,
    commands: mpsc::UnboundedSender<Command>,
    next_call: AtomicU64,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Pool {
    /// Create a pool and start its maintenance task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: PoolConfig, discovery: Arc<dyn Discovery>) -> RpcResult<Self> {
        config.validate()?;

        let (commands, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let maintenance = Maintenance::new(config.clone(), discovery, rx, shutdown.clone());
        let task = tokio::spawn(maintenance.run());

        info!(
            call_retries = config.call_retries,
            connect_timeout_ms = config.connect_timeout.as_millis() as u64,
            "Connection pool started"
        );

        Ok(Self {
            config,
            commands,
            next_call: AtomicU64::new(1),
            shutdown,
            task: Some(task),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Hold a reference to the connection for `name`, starting it if needed.
    ///
    /// Never blocks or fails: connecting happens in the background and
    /// keeps retrying while the handle lives.
    pub fn connect(&self, name: &AgentName, interface: u32) -> ConnectionHandle {
        ConnectionHandle::new(
            ConnectionKey {
                name: name.clone(),
                interface,
            },
            self.commands.clone(),
        )
    }

    /// Issue a call to `name`.
    ///
    /// Returns immediately. The request is encoded now and replayed verbatim
    /// on every attempt; see the module docs for delivery semantics.
    pub fn call<Req, Resp>(
        &self,
        name: &AgentName,
        interface: u32,
        options: CallOptions,
        request: &Req,
    ) -> AsyncCall<Resp>
    where
        Req: Encode + ?Sized,
        Resp: Decode + Clone + Send + 'static,
    {
        let id = CallId(self.next_call.fetch_add(1, Ordering::Relaxed));
        let call = AsyncCall::new(id, self.commands.clone());

        let request = match encode_payload(request) {
            Ok(request) => request,
            Err(e) => {
                debug!(agent = %name, call = %id, error = %e, "Request not encodable");
                call.fail_locally(e);
                return call;
            }
        };
        let size = REQUEST_OVERHEAD + request.len();
        if size > self.config.max_message_size {
            call.fail_locally(RpcError::MessageTooLarge {
                size,
                max: self.config.max_message_size,
            });
            return call;
        }

        let pending = PendingCall {
            id,
            key: ConnectionKey {
                name: name.clone(),
                interface,
            },
            request,
            deadline: options.deadline,
            idempotent: options.idempotent,
            completion: call.completion(),
        };
        if self.commands.send(Command::Call(pending)).is_err() {
            call.fail_locally(RpcError::Disconnected);
        }
        call
    }

    /// [`call`](Self::call) and wait for the outcome.
    pub async fn request<Req, Resp>(
        &self,
        name: &AgentName,
        interface: u32,
        options: CallOptions,
        request: &Req,
    ) -> RpcResult<Resp>
    where
        Req: Encode + ?Sized,
        Resp: Decode + Clone + Send + 'static,
    {
        let deadline = options.deadline;
        self.call(name, interface, options, request)
            .pop(deadline)
            .await
    }

    pub async fn stats(&self) -> PoolStats {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Stats { reply }).is_err() {
            return PoolStats::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Shut the pool down.
    ///
    /// Every outstanding call fails with [`RpcError::Disconnected`]; nothing
    /// is retried or waited on once shutdown starts.
    pub async fn destroy(mut self) {
        debug!("Destroying connection pool");
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "Pool maintenance task failed");
            }
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Shared reference keeping one pooled connection warm.
///
/// Cloning takes another reference; dropping releases one. A connection with
/// no references and no outstanding calls is torn down after `expiry_time`.
pub struct ConnectionHandle {
    key: ConnectionKey,
    commands: mpsc::UnboundedSender<Command>,
}

impl ConnectionHandle {
    fn new(key: ConnectionKey, commands: mpsc::UnboundedSender<Command>) -> Self {
        let _ = commands.send(Command::Acquire { key: key.clone() });
        Self { key, commands }
    }

    pub fn agent(&self) -> &AgentName {
        &self.key.name
    }

    pub fn interface(&self) -> u32 {
        self.key.interface
    }
}

impl Clone for ConnectionHandle {
    fn clone(&self) -> Self {
        Self::new(self.key.clone(), self.commands.clone())
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("agent", &self.key.name)
            .field("interface", &self.key.interface)
            .finish()
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Release {
            key: self.key.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::StaticDiscovery;
    use crate::wire::PROTOCOL_VERSION;

    fn pool(config: PoolConfig) -> (Pool, Arc<StaticDiscovery>) {
        let discovery = Arc::new(StaticDiscovery::new());
        let pool = Pool::new(config, discovery.clone()).unwrap();
        (pool, discovery)
    }

    fn name(s: &str) -> AgentName {
        AgentName::new(s).unwrap()
    }

    #[test]
    fn test_call_options_builder() {
        let options = CallOptions::new().idempotent();
        assert!(options.idempotent);
        assert!(options.deadline.is_none());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let discovery = Arc::new(StaticDiscovery::new());
        let config = PoolConfig {
            dupe_calls: -0.5,
            ..Default::default()
        };
        assert!(matches!(
            Pool::new(config, discovery),
            Err(RpcError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_agent_times_out_at_deadline() {
        let (pool, _discovery) = pool(PoolConfig::default());

        let start = Instant::now();
        let call = pool.call::<_, u32>(
            &name("nowhere"),
            PROTOCOL_VERSION,
            CallOptions::new().with_timeout(Duration::from_millis(10)),
            "HELLO!",
        );
        assert!(start.elapsed() < Duration::from_millis(5));
        assert!(!call.is_finished());

        assert_eq!(call.pop(None).await, Err(RpcError::Timeout));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(10));
        assert!(elapsed < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_oversized_request_fails_immediately() {
        let (pool, _discovery) = pool(PoolConfig {
            max_message_size: 64,
            ..Default::default()
        });
        let call = pool.call::<_, ()>(
            &name("storage"),
            PROTOCOL_VERSION,
            CallOptions::new(),
            &vec![0u8; 128],
        );
        assert!(matches!(
            call.try_pop(),
            Some(Err(RpcError::MessageTooLarge { .. }))
        ));
    }

    #[tokio::test]
    async fn test_handles_track_refcount() {
        let (pool, _discovery) = pool(PoolConfig::default());
        let agent = name("coord");

        let first = pool.connect(&agent, PROTOCOL_VERSION);
        let second = first.clone();
        let stats = pool.stats().await;
        let conn = stats.connection(&agent).unwrap();
        assert_eq!(conn.refcount, 2);
        assert_eq!(conn.state, ConnectionState::Disconnected);

        drop(first);
        drop(second);
        let stats = pool.stats().await;
        assert_eq!(stats.connection(&agent).map(|c| c.refcount), Some(0));
    }

    #[tokio::test]
    async fn test_idle_connection_reaped_after_expiry() {
        let (pool, _discovery) = pool(PoolConfig {
            expiry_time: Duration::from_millis(20),
            ..Default::default()
        });
        let agent = name("cache");
        drop(pool.connect(&agent, PROTOCOL_VERSION));
        assert!(pool.stats().await.connection(&agent).is_some());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(pool.stats().await.connection(&agent).is_none());
    }

    #[tokio::test]
    async fn test_destroy_fails_waiting_calls() {
        let (pool, _discovery) = pool(PoolConfig::default());
        let call = pool.call::<_, u32>(&name("nowhere"), PROTOCOL_VERSION, CallOptions::new(), "x");
        // make sure the call reached the maintenance task
        let _ = pool.stats().await;

        pool.destroy().await;
        assert_eq!(call.pop(None).await, Err(RpcError::Disconnected));
        assert_eq!(call.abort(), Err(RpcError::Disconnected));
    }
}
