//! Echo Agent - reference implementation for agentwire agents
//!
//! `serve` runs an endpoint that echoes every message back together with a
//! per-connection counter. `call` drives one through a connection pool, so
//! both halves of the substrate can be exercised from a shell.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use agentwire::payload::PayloadReader;
use agentwire::{
    AgentName, CallOptions, Endpoint, EndpointConfig, IncompleteCall, PeerName, Pool,
    PoolConfig, RpcResult, Service, StaticDiscovery, PROTOCOL_VERSION,
};
use agentwire_common::init_tracing;

/// Echo agent command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "ECHO_AGENT_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Listen and echo
    Serve {
        /// Address to listen on: host:port or unix:/path
        #[arg(short, long, env = "ECHO_AGENT_LISTEN", default_value = "127.0.0.1:7373")]
        listen: PeerName,

        /// Per-connection cap on unanswered calls
        #[arg(long, default_value_t = 64)]
        max_outstanding_calls: usize,

        /// First counter value reported on each connection
        #[arg(long, default_value_t = 73)]
        counter_start: u32,
    },

    /// Send messages to a running echo agent
    Call {
        /// Address of the agent: host:port or unix:/path
        #[arg(short, long, env = "ECHO_AGENT_ADDRESS")]
        address: PeerName,

        #[arg(short, long, default_value = "HELLO!")]
        message: String,

        /// Number of calls to make over the pooled connection
        #[arg(short = 'n', long, default_value_t = 2)]
        count: u32,

        /// Per-call timeout in milliseconds
        #[arg(long, default_value_t = 1000)]
        timeout_ms: u64,

        #[arg(long, default_value_t = 3)]
        retries: u32,
    },
}

/// Echo agent implementation
struct EchoAgent {
    counter_start: u32,
    /// Calls served across all connections
    served: AtomicU64,
}

#[async_trait]
impl Service for EchoAgent {
    type Session = u32;

    async fn initialise(&self) -> RpcResult<()> {
        info!(counter_start = self.counter_start, "Echo agent ready");
        Ok(())
    }

    fn connected(&self, peer: &PeerName) -> u32 {
        debug!(peer = %peer, "Client connected");
        self.counter_start
    }

    fn called(
        &self,
        counter: &mut u32,
        _interface: u32,
        request: &mut PayloadReader,
        call: IncompleteCall,
    ) -> RpcResult<()> {
        let message: String = request.read()?;
        let served = self.served.fetch_add(1, Ordering::Relaxed) + 1;

        debug!(
            sequence = call.sequence().0,
            counter = *counter,
            served = served,
            "Echoing message"
        );

        call.complete(&(message, *counter));
        *counter += 1;
        Ok(())
    }

    async fn destroying(&self) {
        info!(
            served = self.served.load(Ordering::Relaxed),
            "Echo agent stopping"
        );
    }
}

async fn serve(listen: PeerName, max_outstanding_calls: usize, counter_start: u32) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        address = %listen,
        "Starting echo agent"
    );

    let config = EndpointConfig {
        max_outstanding_calls,
        ..Default::default()
    };
    let agent = EchoAgent {
        counter_start,
        served: AtomicU64::new(0),
    };
    let endpoint = Endpoint::listen(&listen, config, agent)
        .await
        .context("Failed to start echo endpoint")?;

    info!(address = %endpoint.local_name(), "Echo agent listening");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for shutdown signal")?;
    endpoint.shutdown().await;
    Ok(())
}

async fn call(
    address: PeerName,
    message: String,
    count: u32,
    timeout: Duration,
    retries: u32,
) -> Result<()> {
    let name = AgentName::new("echo")?;
    let discovery = Arc::new(StaticDiscovery::new());
    discovery.register(name.clone(), address.clone());

    let config = PoolConfig {
        call_retries: retries,
        ..Default::default()
    };
    let pool = Pool::new(config, discovery)?;

    for attempt in 1..=count {
        let (echoed, counter): (String, u32) = pool
            .request(
                &name,
                PROTOCOL_VERSION,
                CallOptions::new().with_timeout(timeout),
                message.as_str(),
            )
            .await
            .with_context(|| format!("Call {} to {} failed", attempt, address))?;
        info!(attempt, message = %echoed, counter, "Echo reply");
    }

    debug!(stats = ?pool.stats().await, "Pool statistics");
    pool.destroy().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level)?;

    match args.command {
        Mode::Serve {
            listen,
            max_outstanding_calls,
            counter_start,
        } => serve(listen, max_outstanding_calls, counter_start).await,
        Mode::Call {
            address,
            message,
            count,
            timeout_ms,
            retries,
        } => {
            call(
                address,
                message,
                count,
                Duration::from_millis(timeout_ms),
                retries,
            )
            .await
        }
    }
}
