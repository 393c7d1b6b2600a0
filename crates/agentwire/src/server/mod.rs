//! Service endpoint: the agent side of the substrate.
//!
//! An [`Endpoint`] binds its listener before the service's
//! [`initialise`](Service::initialise) hook runs, so peers that race the
//! agent's startup see their connection accepted late rather than refused.
//! Each accepted connection gets one worker task; the service sees requests
//! through [`Service::called`] and answers them through the
//! [`IncompleteCall`] it is handed.

mod connection;
mod incomplete;

pub use incomplete::IncompleteCall;

use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use agentwire_common::{EndpointConfig, PeerName, RpcResult};

use crate::payload::PayloadReader;
use crate::transport::Listener;
use crate::wire::PROTOCOL_VERSION;
use connection::ConnectionWorker;

/// Application logic behind an endpoint.
///
/// The value is built before [`Endpoint::listen`] binds the address, so
/// construction should stay cheap. Slow setup such as opening storage
/// belongs in [`initialise`](Service::initialise), which runs with the
/// listener already bound.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Per-connection state, created when a peer connects.
    type Session: Send + 'static;

    /// Runs once after the listener is bound, before any call is dispatched.
    ///
    /// Peers connecting meanwhile wait in the listen backlog and are served
    /// once this returns.
    ///
    /// An error here tears the endpoint down and is returned from
    /// [`Endpoint::listen`].
    async fn initialise(&self) -> RpcResult<()> {
        Ok(())
    }

    /// Whether a connection may speak `version`.
    ///
    /// Asked once per connection, on its first request.
    fn supports_version(&self, version: u32) -> bool {
        version == PROTOCOL_VERSION
    }

    fn connected(&self, peer: &PeerName) -> Self::Session;

    /// Accept one request.
    ///
    /// Runs on the connection's worker with `request` scoped to exactly this
    /// call's payload, so it should decode and hand off rather than block.
    /// Returning an error fails the call with it. Returning `Ok` makes the
    /// handler responsible for eventually resolving `call`, from any task.
    fn called(
        &self,
        session: &mut Self::Session,
        interface: u32,
        request: &mut PayloadReader,
        call: IncompleteCall,
    ) -> RpcResult<()>;

    /// Runs after shutdown once every connection worker has finished.
    async fn destroying(&self) {}
}

/// Counters shared between the acceptor and the connection workers.
#[derive(Debug, Default)]
pub(crate) struct EndpointCounters {
    connections_accepted: AtomicU64,
    connections_active: AtomicU64,
    calls_dispatched: AtomicU64,
    calls_completed: AtomicU64,
    calls_failed: AtomicU64,
}

impl EndpointCounters {
    fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn call_dispatched(&self) {
        self.calls_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn call_completed(&self) {
        self.calls_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn call_failed(&self) {
        self.calls_failed.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> EndpointStats {
        EndpointStats {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            calls_dispatched: self.calls_dispatched.load(Ordering::Relaxed),
            calls_completed: self.calls_completed.load(Ordering::Relaxed),
            calls_failed: self.calls_failed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time endpoint statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EndpointStats {
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub calls_dispatched: u64,
    pub calls_completed: u64,
    pub calls_failed: u64,
}

/// A listening service.
pub struct Endpoint<S: Service> {
    service: Arc<S>,
    local: PeerName,
    shutdown: CancellationToken,
    acceptor: Option<JoinHandle<()>>,
    counters: Arc<EndpointCounters>,
}

impl<S: Service> Endpoint<S> {
    /// Bind `address`, run the service's `initialise` hook, start accepting.
    pub async fn listen(address: &PeerName, config: EndpointConfig, service: S) -> RpcResult<Self> {
        config.validate()?;

        let listener = Listener::bind(address).await?;
        let local = listener.local_name()?;
        let service = Arc::new(service);

        if let Err(e) = service.initialise().await {
            warn!(address = %local, error = %e, "Service initialisation failed");
            drop(listener);
            return Err(e);
        }

        let shutdown = CancellationToken::new();
        let counters = Arc::new(EndpointCounters::default());
        let acceptor = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&service),
            config,
            shutdown.clone(),
            Arc::clone(&counters),
        ));

        info!(address = %local, "Endpoint listening");

        Ok(Self {
            service,
            local,
            shutdown,
            acceptor: Some(acceptor),
            counters,
        })
    }

    /// Address peers should connect to.
    pub fn local_name(&self) -> &PeerName {
        &self.local
    }

    pub fn service(&self) -> &Arc<S> {
        &self.service
    }

    pub fn stats(&self) -> EndpointStats {
        self.counters.snapshot()
    }

    /// Stop accepting, abandon outstanding calls, wait for every connection
    /// worker to drain, then run the service's `destroying` hook.
    pub async fn shutdown(mut self) {
        info!(address = %self.local, "Endpoint shutting down");
        self.shutdown.cancel();
        if let Some(acceptor) = self.acceptor.take() {
            if let Err(e) = acceptor.await {
                error!(address = %self.local, error = %e, "Acceptor task failed");
            }
        }
        self.service.destroying().await;
        info!(address = %self.local, "Endpoint stopped");
    }
}

impl<S: Service> Drop for Endpoint<S> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop<S: Service>(
    listener: Listener,
    service: Arc<S>,
    config: EndpointConfig,
    shutdown: CancellationToken,
    counters: Arc<EndpointCounters>,
) {
    let mut workers = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "Accepted connection");
                    counters.connection_opened();
                    let worker = ConnectionWorker::new(
                        Arc::clone(&service),
                        peer,
                        config.clone(),
                        shutdown.clone(),
                        Arc::clone(&counters),
                    );
                    workers.spawn(worker.run(stream));
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            },

            Some(joined) = workers.join_next(), if !workers.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "Connection worker panicked");
                }
            }
        }
    }

    drop(listener);
    debug!(workers = workers.len(), "Waiting for connection workers");
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Connection worker panicked");
        }
    }
}
