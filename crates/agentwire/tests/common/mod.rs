//! Shared test utilities for integration tests
//!
//! Services with observable behaviour and helpers for standing up an
//! endpoint, a discovery registry and a pool against each other.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use agentwire::payload::PayloadReader;
use agentwire::{
    AgentName, Endpoint, EndpointConfig, IncompleteCall, PeerName, Pool, PoolConfig, RpcError,
    RpcResult, Service, StaticDiscovery,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("agentwire=debug")
        .try_init();
}

pub fn agent(name: &str) -> AgentName {
    AgentName::new(name).unwrap()
}

pub fn loopback() -> PeerName {
    "127.0.0.1:0".parse().unwrap()
}

/// Poll `condition` every few milliseconds until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Echoes the request string with a per-connection counter starting at 73.
#[derive(Default)]
pub struct EchoService {
    pub executions: AtomicUsize,
}

impl EchoService {
    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Service for EchoService {
    type Session = u32;

    fn connected(&self, _peer: &PeerName) -> u32 {
        73
    }

    fn called(
        &self,
        counter: &mut u32,
        _interface: u32,
        request: &mut PayloadReader,
        call: IncompleteCall,
    ) -> RpcResult<()> {
        let text: String = request.read()?;
        self.executions.fetch_add(1, Ordering::SeqCst);
        let reply = (text, *counter);
        *counter += 1;
        call.complete(&reply);
        Ok(())
    }
}

/// State of a [`HoldingService`], shared with the test.
#[derive(Default)]
pub struct Held {
    pub calls: Mutex<Vec<IncompleteCall>>,
    pub dispatched: AtomicUsize,
    pub abandoned: AtomicUsize,
    pub abandon_seen: Notify,
}

impl Held {
    pub fn dispatched(&self) -> usize {
        self.dispatched.load(Ordering::SeqCst)
    }

    pub fn abandoned(&self) -> usize {
        self.abandoned.load(Ordering::SeqCst)
    }

    /// Complete the oldest held call with `value`.
    pub fn release_one(&self, value: u32) -> bool {
        let call = {
            let mut calls = self.calls.lock();
            if calls.is_empty() {
                return false;
            }
            calls.remove(0)
        };
        call.complete(&value);
        true
    }
}

/// Parks every call until the test resolves it.
#[derive(Default)]
pub struct HoldingService {
    pub state: Arc<Held>,
}

#[async_trait::async_trait]
impl Service for HoldingService {
    type Session = ();

    fn connected(&self, _peer: &PeerName) {}

    fn called(
        &self,
        _session: &mut (),
        _interface: u32,
        _request: &mut PayloadReader,
        call: IncompleteCall,
    ) -> RpcResult<()> {
        self.state.dispatched.fetch_add(1, Ordering::SeqCst);

        let token = call.abandon_token();
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            token.cancelled().await;
            state.abandoned.fetch_add(1, Ordering::SeqCst);
            state.abandon_seen.notify_one();
        });

        self.state.calls.lock().push(call);
        Ok(())
    }
}

/// Replies with a fixed single byte, whatever the caller expects.
#[derive(Default)]
pub struct ByteService {
    pub executions: AtomicUsize,
}

impl ByteService {
    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Service for ByteService {
    type Session = ();

    fn connected(&self, _peer: &PeerName) {}

    fn called(
        &self,
        _session: &mut (),
        _interface: u32,
        _request: &mut PayloadReader,
        call: IncompleteCall,
    ) -> RpcResult<()> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        call.complete(&7u8);
        Ok(())
    }
}

/// Rejects every call with an application error.
pub struct RejectingService;

#[async_trait::async_trait]
impl Service for RejectingService {
    type Session = ();

    fn connected(&self, _peer: &PeerName) {}

    fn called(
        &self,
        _session: &mut (),
        _interface: u32,
        _request: &mut PayloadReader,
        _call: IncompleteCall,
    ) -> RpcResult<()> {
        Err(RpcError::application(1404, "no such job"))
    }
}

/// Records its lifecycle hooks.
#[derive(Default)]
pub struct LifecycleService {
    pub fail_initialise: bool,
    pub initialise_delay: Duration,
    pub destroyed: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl Service for LifecycleService {
    type Session = ();

    async fn initialise(&self) -> RpcResult<()> {
        tokio::time::sleep(self.initialise_delay).await;
        if self.fail_initialise {
            return Err(RpcError::application(1500, "storage unavailable"));
        }
        Ok(())
    }

    fn connected(&self, _peer: &PeerName) {}

    fn called(
        &self,
        _session: &mut (),
        _interface: u32,
        _request: &mut PayloadReader,
        call: IncompleteCall,
    ) -> RpcResult<()> {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            call.complete("done");
        });
        Ok(())
    }

    async fn destroying(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

/// An endpoint on loopback registered under `name`, plus a pool that can see it.
pub async fn harness<S: Service>(
    name: &str,
    service: S,
    endpoint_config: EndpointConfig,
    pool_config: PoolConfig,
) -> (Endpoint<S>, Pool, Arc<StaticDiscovery>) {
    let endpoint = Endpoint::listen(&loopback(), endpoint_config, service)
        .await
        .unwrap();
    let discovery = Arc::new(StaticDiscovery::new());
    discovery.register(agent(name), endpoint.local_name().clone());
    let pool = Pool::new(pool_config, discovery.clone()).unwrap();
    (endpoint, pool, discovery)
}
