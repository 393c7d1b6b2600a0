//! The pool's maintenance task.
//!
//! A single task owns every pooled connection and every call riding one.
//! Callers reach it only through [`Command`]s; connection I/O tasks report
//! back through [`Event`]s. Each turn of the loop advances every connection's
//! state machine, then sleeps until a command, an event, a discovery change
//! or the earliest timer (call deadline, reconnect backoff, idle expiry).

use bytes::Bytes;
use futures::SinkExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use agentwire_common::errors::codes;
use agentwire_common::{AgentName, PeerName, PoolConfig, RpcError};

use super::call::{CallId, Completion};
use super::{ConnectionState, ConnectionStats, PoolStats};
use crate::discovery::Discovery;
use crate::transport::{self, BoxedStream};
use crate::wire::{RequestCodec, RequestFrame, ResponseCodec, ResponseFrame, SequenceNumber};

/// One pooled connection per agent and interface version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ConnectionKey {
    pub name: AgentName,
    pub interface: u32,
}

pub(crate) struct PendingCall {
    pub id: CallId,
    pub key: ConnectionKey,
    pub request: Bytes,
    pub deadline: Option<Instant>,
    pub idempotent: bool,
    pub completion: Arc<dyn Completion>,
}

/// Requests handed to the maintenance task.
pub(crate) enum Command {
    Call(PendingCall),
    Abort { id: CallId },
    Acquire { key: ConnectionKey },
    Release { key: ConnectionKey },
    Stats { reply: oneshot::Sender<PoolStats> },
}

/// Reports from connect, reader and writer tasks.
///
/// Tagged with the connection attempt they belong to so that reports from
/// a superseded attempt are ignored.
enum Event {
    Connected {
        key: ConnectionKey,
        generation: u64,
        peer: PeerName,
        stream: BoxedStream,
    },
    ConnectFailed {
        key: ConnectionKey,
        generation: u64,
        error: RpcError,
    },
    Response {
        key: ConnectionKey,
        generation: u64,
        frame: ResponseFrame,
    },
    Failed {
        key: ConnectionKey,
        generation: u64,
        error: RpcError,
    },
}

impl Event {
    fn origin(&self) -> (ConnectionKey, u64) {
        match self {
            Event::Connected { key, generation, .. }
            | Event::ConnectFailed { key, generation, .. }
            | Event::Response { key, generation, .. }
            | Event::Failed { key, generation, .. } => (key.clone(), *generation),
        }
    }
}

/// A logical call as the maintenance task tracks it.
struct CallRecord {
    id: CallId,
    /// Serialized request, replayed verbatim on every attempt
    request: Bytes,
    deadline: Option<Instant>,
    idempotent: bool,
    retries: u32,
    completion: Arc<dyn Completion>,
}

impl CallRecord {
    fn expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }
}

/// Background task aborted when its owner goes away.
struct Task(JoinHandle<()>);

impl Drop for Task {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// An established physical connection.
struct Live {
    peer: PeerName,
    writer: mpsc::UnboundedSender<RequestFrame>,
    _reader: Task,
    _writer: Task,
    next_sequence: SequenceNumber,
    in_flight: HashMap<SequenceNumber, CallRecord>,
    /// Sequences whose responses are dropped on arrival (duplicates)
    discarded: HashSet<SequenceNumber>,
    /// Agent announced shutdown; new calls wait for the next connection
    draining: bool,
}

enum ConnState {
    Disconnected { retry_at: Instant },
    Connecting {
        _attempt: Task,
        /// Addresses the attempt was started with
        candidates: Vec<PeerName>,
    },
    Connected(Live),
    Errored { error: RpcError },
}

impl ConnState {
    fn kind(&self) -> ConnectionState {
        match self {
            ConnState::Disconnected { .. } => ConnectionState::Disconnected,
            ConnState::Connecting { .. } => ConnectionState::Connecting,
            ConnState::Connected(_) => ConnectionState::Connected,
            ConnState::Errored { .. } => ConnectionState::Errored,
        }
    }
}

struct Shared {
    config: PoolConfig,
    discovery: Arc<dyn Discovery>,
    events: mpsc::UnboundedSender<Event>,
}

// =============================================================================
// Pooled connection
// =============================================================================

struct PooledConnection {
    key: ConnectionKey,
    refcount: usize,
    idle_since: Option<Instant>,
    /// Discovery had no address; wait for it to change
    looking: bool,
    generation: u64,
    /// Calls not yet sent on the current connection
    waiting: VecDeque<CallRecord>,
    state: ConnState,
    attempts: u64,
    retries: u64,
}

impl PooledConnection {
    fn new(key: ConnectionKey, now: Instant) -> Self {
        Self {
            key,
            refcount: 0,
            idle_since: None,
            looking: false,
            generation: 0,
            waiting: VecDeque::new(),
            state: ConnState::Disconnected { retry_at: now },
            attempts: 0,
            retries: 0,
        }
    }

    fn in_flight(&self) -> usize {
        match &self.state {
            ConnState::Connected(live) => live.in_flight.len(),
            _ => 0,
        }
    }

    fn has_demand(&self) -> bool {
        self.refcount > 0 || !self.waiting.is_empty() || self.in_flight() > 0
    }

    fn advance(&mut self, shared: &Shared, now: Instant) {
        if let ConnState::Errored { error } = &self.state {
            debug!(
                agent = %self.key.name,
                error = %error,
                backoff_ms = shared.config.reconnect_interval.as_millis() as u64,
                "Connection errored, backing off"
            );
            self.state = ConnState::Disconnected {
                retry_at: now + shared.config.reconnect_interval,
            };
        }

        let connect_due =
            matches!(self.state, ConnState::Disconnected { retry_at } if retry_at <= now);
        if connect_due && !self.looking && self.has_demand() {
            self.start_connect(shared);
        }

        if matches!(self.state, ConnState::Connected(_)) {
            self.flush_waiting(shared);
        }

        if self.has_demand() {
            self.idle_since = None;
        } else if self.idle_since.is_none() {
            self.idle_since = Some(now);
        }
    }

    fn start_connect(&mut self, shared: &Shared) {
        let peers = shared.discovery.addresses_for(&self.key.name);
        if peers.is_empty() {
            debug!(agent = %self.key.name, "No addresses for agent, still looking");
            self.looking = true;
            return;
        }

        self.generation += 1;
        self.attempts += 1;
        debug!(
            agent = %self.key.name,
            candidates = peers.len(),
            attempt = self.attempts,
            "Connecting"
        );

        let task = tokio::spawn(establish(
            self.key.clone(),
            self.generation,
            peers.clone(),
            shared.config.connect_timeout,
            shared.events.clone(),
        ));
        self.state = ConnState::Connecting {
            _attempt: Task(task),
            candidates: peers,
        };
    }

    fn on_connected(&mut self, peer: PeerName, stream: BoxedStream, shared: &Shared) {
        let (read_half, write_half) = tokio::io::split(stream);
        let (writer, frames) = mpsc::unbounded_channel();
        let max = shared.config.max_message_size;

        let reader = tokio::spawn(read_responses(
            self.key.clone(),
            self.generation,
            read_half,
            ResponseCodec::new(max),
            shared.events.clone(),
        ));
        let writer_task = tokio::spawn(write_requests(
            self.key.clone(),
            self.generation,
            write_half,
            RequestCodec::new(max),
            frames,
            shared.events.clone(),
        ));

        info!(
            agent = %self.key.name,
            peer = %peer,
            waiting = self.waiting.len(),
            "Connected to agent"
        );

        self.state = ConnState::Connected(Live {
            peer,
            writer,
            _reader: Task(reader),
            _writer: Task(writer_task),
            next_sequence: SequenceNumber::default(),
            in_flight: HashMap::new(),
            discarded: HashSet::new(),
            draining: false,
        });
    }

    /// Send every waiting call on the live connection.
    fn flush_waiting(&mut self, shared: &Shared) {
        let ConnState::Connected(live) = &mut self.state else {
            return;
        };
        if live.draining {
            return;
        }
        let interface = self.key.interface;

        while let Some(mut call) = self.waiting.pop_front() {
            if call.completion.is_finished() {
                continue;
            }

            let sequence = live.next_sequence.next();
            let frame = RequestFrame::call(interface, sequence, call.request.clone());
            if live.writer.send(frame).is_err() {
                // writer is gone and its failure report is on the way
                self.waiting.push_front(call);
                return;
            }
            trace!(
                agent = %self.key.name,
                call = %call.id,
                sequence = sequence.0,
                retries = call.retries,
                "Call sent"
            );

            if shared.config.dupe_calls > 0.0 && rand::random::<f64>() < shared.config.dupe_calls {
                let duplicate = live.next_sequence.next();
                let frame = RequestFrame::call(interface, duplicate, call.request.clone());
                if live.writer.send(frame).is_ok() {
                    debug!(
                        agent = %self.key.name,
                        call = %call.id,
                        sequence = duplicate.0,
                        "Sending duplicate call"
                    );
                    live.discarded.insert(duplicate);
                }
            }

            live.in_flight.insert(sequence, call);
        }
    }

    fn on_response(&mut self, frame: ResponseFrame, config: &PoolConfig) {
        let ConnState::Connected(live) = &mut self.state else {
            return;
        };
        let sequence = frame.sequence();
        if live.discarded.remove(&sequence) {
            trace!(agent = %self.key.name, sequence = sequence.0, "Discarding duplicate response");
            return;
        }
        let Some(mut call) = live.in_flight.remove(&sequence) else {
            trace!(agent = %self.key.name, sequence = sequence.0, "Response for cancelled call");
            return;
        };

        match frame.into_result() {
            Ok(payload) => {
                if let Err(e) = call.completion.deliver(payload) {
                    if call.idempotent && call.retries < config.call_retries {
                        debug!(
                            agent = %self.key.name,
                            call = %call.id,
                            error = %e,
                            "Response undecodable, re-sending"
                        );
                        call.retries += 1;
                        self.retries += 1;
                        self.waiting.push_back(call);
                    } else {
                        call.completion.fail(e);
                    }
                }
            }
            Err(RpcError::Remote { code, .. }) if code == codes::SHUTTING_DOWN => {
                // refused before dispatch, so it never ran
                if !live.draining {
                    info!(agent = %self.key.name, peer = %live.peer, "Agent draining");
                    live.draining = true;
                }
                self.waiting.push_back(call);
            }
            Err(e) if e.is_version_rejection() => {
                warn!(
                    agent = %self.key.name,
                    interface = self.key.interface,
                    error = %e,
                    "Agent rejected interface version"
                );
                call.completion.fail(e.clone());
                self.fail(e, config);
            }
            Err(e) => call.completion.fail(e),
        }
    }

    /// The current attempt failed: charge the affected calls a retry and back off.
    ///
    /// A protocol error or version rejection fails the calls that rode this
    /// connection outright. When a live connection is lost, calls that were
    /// never sent on it (including those a draining agent refused) go back
    /// to the queue uncharged.
    fn fail(&mut self, error: RpcError, config: &PoolConfig) {
        let previous = std::mem::replace(
            &mut self.state,
            ConnState::Errored {
                error: error.clone(),
            },
        );

        let was_live = matches!(previous, ConnState::Connected(_));
        let mut in_flight: Vec<CallRecord> = match previous {
            ConnState::Connected(mut live) => {
                warn!(
                    agent = %self.key.name,
                    peer = %live.peer,
                    in_flight = live.in_flight.len(),
                    error = %error,
                    "Connection lost"
                );
                live.in_flight.drain().map(|(_, call)| call).collect()
            }
            _ => Vec::new(),
        };
        in_flight.sort_by_key(|call| call.id);
        let waiting: Vec<CallRecord> = self.waiting.drain(..).collect();
        let fatal = error.is_protocol() || error.is_version_rejection();

        for call in in_flight {
            if call.completion.is_finished() {
                continue;
            }
            if fatal {
                call.completion.fail(error.clone());
                continue;
            }
            self.charge(call, &error, config);
        }

        for call in waiting {
            if call.completion.is_finished() {
                continue;
            }
            if was_live {
                self.waiting.push_back(call);
            } else {
                self.charge(call, &error, config);
            }
        }
    }

    /// Count one retry against `call`, failing it once the budget is spent.
    fn charge(&mut self, mut call: CallRecord, error: &RpcError, config: &PoolConfig) {
        call.retries += 1;
        if call.retries > config.call_retries {
            debug!(
                agent = %self.key.name,
                call = %call.id,
                error = %error,
                "Retry budget exhausted"
            );
            call.completion.fail(error.clone());
        } else {
            self.retries += 1;
            self.waiting.push_back(call);
        }
    }

    /// Drop a call the caller gave up on. Returns whether it was found here.
    fn cancel(&mut self, id: CallId) -> bool {
        if let Some(index) = self.waiting.iter().position(|call| call.id == id) {
            self.waiting.remove(index);
            return true;
        }
        if let ConnState::Connected(live) = &mut self.state {
            let found = live
                .in_flight
                .iter()
                .find(|(_, call)| call.id == id)
                .map(|(sequence, _)| *sequence);
            if let Some(sequence) = found {
                live.in_flight.remove(&sequence);
                let _ = live
                    .writer
                    .send(RequestFrame::cancel(self.key.interface, sequence));
                return true;
            }
        }
        false
    }

    /// Fail calls past their deadline and forget finished ones.
    fn expire(&mut self, now: Instant) {
        self.waiting.retain(|call| {
            if call.completion.is_finished() {
                return false;
            }
            if call.expired(now) {
                call.completion.fail(RpcError::Timeout);
                return false;
            }
            true
        });

        if let ConnState::Connected(live) = &mut self.state {
            let mut cancelled = Vec::new();
            live.in_flight.retain(|sequence, call| {
                if call.expired(now) {
                    call.completion.fail(RpcError::Timeout);
                    cancelled.push(*sequence);
                    return false;
                }
                if call.completion.is_finished() {
                    cancelled.push(*sequence);
                    return false;
                }
                true
            });
            for sequence in cancelled {
                trace!(agent = %self.key.name, sequence = sequence.0, "Cancelling expired call");
                let _ = live
                    .writer
                    .send(RequestFrame::cancel(self.key.interface, sequence));
            }
        }
    }

    fn next_wakeup(&self, config: &PoolConfig) -> Option<Instant> {
        let in_flight = match &self.state {
            ConnState::Connected(live) => Some(live.in_flight.values()),
            _ => None,
        };
        let deadlines = self
            .waiting
            .iter()
            .chain(in_flight.into_iter().flatten())
            .filter_map(|call| call.deadline);

        let retry = match self.state {
            ConnState::Disconnected { retry_at } if !self.looking && self.has_demand() => {
                Some(retry_at)
            }
            _ => None,
        };
        let expiry = self.idle_since.map(|since| since + config.expiry_time);

        deadlines.chain(retry).chain(expiry).min()
    }

    /// Fail every call with `Disconnected`. Returns how many were failed.
    fn abandon(&mut self) -> usize {
        let previous = std::mem::replace(
            &mut self.state,
            ConnState::Disconnected {
                retry_at: Instant::now(),
            },
        );
        let mut calls: Vec<CallRecord> = self.waiting.drain(..).collect();
        if let ConnState::Connected(mut live) = previous {
            calls.extend(live.in_flight.drain().map(|(_, call)| call));
        }

        let mut failed = 0;
        for call in calls {
            if !call.completion.is_finished() {
                call.completion.fail(RpcError::Disconnected);
                failed += 1;
            }
        }
        failed
    }

    fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            agent: self.key.name.clone(),
            interface: self.key.interface,
            state: self.state.kind(),
            peer: match &self.state {
                ConnState::Connected(live) => Some(live.peer.clone()),
                _ => None,
            },
            refcount: self.refcount,
            waiting: self.waiting.len(),
            in_flight: self.in_flight(),
            attempts: self.attempts,
            retries: self.retries,
        }
    }
}

// =============================================================================
// Maintenance loop
// =============================================================================

pub(crate) struct Maintenance {
    shared: Shared,
    connections: HashMap<ConnectionKey, PooledConnection>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedReceiver<Event>,
    discovery_changes: watch::Receiver<u64>,
    shutdown: CancellationToken,
}

impl Maintenance {
    pub(crate) fn new(
        config: PoolConfig,
        discovery: Arc<dyn Discovery>,
        commands: mpsc::UnboundedReceiver<Command>,
        shutdown: CancellationToken,
    ) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        let discovery_changes = discovery.subscribe();
        Self {
            shared: Shared {
                config,
                discovery,
                events: events_tx,
            },
            connections: HashMap::new(),
            commands,
            events,
            discovery_changes,
            shutdown,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!("Pool maintenance started");
        let mut discovery_open = true;

        loop {
            self.advance(Instant::now());
            let wakeup = self.next_wakeup();

            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,

                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },

                Some(event) = self.events.recv() => self.on_event(event),

                changed = self.discovery_changes.changed(), if discovery_open => match changed {
                    Ok(()) => self.on_discovery_changed(),
                    Err(_) => {
                        debug!("Discovery publisher closed");
                        discovery_open = false;
                    }
                },

                _ = tokio::time::sleep_until(wakeup.unwrap_or_else(Instant::now)), if wakeup.is_some() => {}
            }
        }

        self.teardown();
    }

    fn advance(&mut self, now: Instant) {
        for conn in self.connections.values_mut() {
            conn.expire(now);
            conn.advance(&self.shared, now);
        }

        let expiry = self.shared.config.expiry_time;
        self.connections.retain(|key, conn| {
            let expired = conn
                .idle_since
                .is_some_and(|since| now.duration_since(since) >= expiry);
            if expired {
                debug!(agent = %key.name, "Reaping idle connection");
            }
            !expired
        });
    }

    fn next_wakeup(&self) -> Option<Instant> {
        self.connections
            .values()
            .filter_map(|conn| conn.next_wakeup(&self.shared.config))
            .min()
    }

    fn connection(&mut self, key: &ConnectionKey) -> &mut PooledConnection {
        self.connections
            .entry(key.clone())
            .or_insert_with(|| PooledConnection::new(key.clone(), Instant::now()))
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Call(pending) => {
                if pending.completion.is_finished() {
                    return;
                }
                trace!(agent = %pending.key.name, call = %pending.id, "Call queued");
                self.connection(&pending.key).waiting.push_back(CallRecord {
                    id: pending.id,
                    request: pending.request,
                    deadline: pending.deadline,
                    idempotent: pending.idempotent,
                    retries: 0,
                    completion: pending.completion,
                });
            }
            Command::Abort { id } => {
                let found = self
                    .connections
                    .values_mut()
                    .any(|conn| conn.cancel(id));
                trace!(call = %id, found, "Call aborted");
            }
            Command::Acquire { key } => {
                self.connection(&key).refcount += 1;
            }
            Command::Release { key } => {
                if let Some(conn) = self.connections.get_mut(&key) {
                    conn.refcount = conn.refcount.saturating_sub(1);
                }
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
    }

    fn on_event(&mut self, event: Event) {
        let (key, generation) = event.origin();
        let Some(conn) = self.connections.get_mut(&key) else {
            return;
        };
        if conn.generation != generation {
            trace!(agent = %key.name, generation, "Ignoring report from superseded attempt");
            return;
        }

        match event {
            Event::Connected { peer, stream, .. } => {
                if matches!(conn.state, ConnState::Connecting { .. }) {
                    conn.on_connected(peer, stream, &self.shared);
                }
            }
            Event::ConnectFailed { error, .. } => {
                if matches!(conn.state, ConnState::Connecting { .. }) {
                    warn!(agent = %key.name, error = %error, "Connect failed");
                    conn.fail(error, &self.shared.config);
                }
            }
            Event::Response { frame, .. } => conn.on_response(frame, &self.shared.config),
            Event::Failed { error, .. } => {
                if matches!(conn.state, ConnState::Connected(_)) {
                    conn.fail(error, &self.shared.config);
                }
            }
        }
    }

    fn on_discovery_changed(&mut self) {
        let generation = *self.discovery_changes.borrow_and_update();
        debug!(generation, "Discovery changed");

        for conn in self.connections.values_mut() {
            conn.looking = false;
            let peers = self.shared.discovery.addresses_for(&conn.key.name);

            match &conn.state {
                ConnState::Connected(live) if !peers.contains(&live.peer) => {
                    let peer = live.peer.clone();
                    info!(agent = %conn.key.name, peer = %peer, "Agent no longer advertised at peer");
                    conn.fail(
                        RpcError::ConnectionFailed(format!(
                            "{} no longer advertised at {}",
                            conn.key.name, peer
                        )),
                        &self.shared.config,
                    );
                }
                ConnState::Connecting { candidates, .. } if *candidates != peers => {
                    debug!(
                        agent = %conn.key.name,
                        candidates = peers.len(),
                        "Addresses changed mid-connect, restarting attempt"
                    );
                    // late reports from the dropped attempt are ignored
                    conn.generation += 1;
                    conn.state = ConnState::Disconnected {
                        retry_at: Instant::now(),
                    };
                }
                _ => {}
            }
        }
    }

    fn stats(&self) -> PoolStats {
        let mut connections: Vec<ConnectionStats> =
            self.connections.values().map(PooledConnection::stats).collect();
        connections.sort_by(|a, b| (&a.agent, a.interface).cmp(&(&b.agent, b.interface)));
        PoolStats { connections }
    }

    fn teardown(&mut self) {
        self.commands.close();

        let mut failed = 0;
        for (_, mut conn) in self.connections.drain() {
            failed += conn.abandon();
        }
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Call(pending) => {
                    if !pending.completion.is_finished() {
                        pending.completion.fail(RpcError::Disconnected);
                        failed += 1;
                    }
                }
                Command::Stats { reply } => {
                    let _ = reply.send(PoolStats::default());
                }
                Command::Abort { .. } | Command::Acquire { .. } | Command::Release { .. } => {}
            }
        }

        info!(failed_calls = failed, "Pool shut down");
    }
}

// =============================================================================
// Connection I/O tasks
// =============================================================================

/// Try each candidate address in order.
async fn establish(
    key: ConnectionKey,
    generation: u64,
    peers: Vec<PeerName>,
    timeout: Duration,
    events: mpsc::UnboundedSender<Event>,
) {
    let mut last_error = None;
    for peer in peers {
        match transport::connect(&peer, timeout).await {
            Ok(stream) => {
                let _ = events.send(Event::Connected {
                    key,
                    generation,
                    peer,
                    stream,
                });
                return;
            }
            Err(e) => last_error = Some(e),
        }
    }

    let error = last_error
        .unwrap_or_else(|| RpcError::ConnectionFailed("no candidate addresses".to_string()));
    let _ = events.send(Event::ConnectFailed {
        key,
        generation,
        error,
    });
}

async fn read_responses(
    key: ConnectionKey,
    generation: u64,
    half: ReadHalf<BoxedStream>,
    codec: ResponseCodec,
    events: mpsc::UnboundedSender<Event>,
) {
    let mut frames = FramedRead::new(half, codec);
    let error = loop {
        match frames.next().await {
            Some(Ok(frame)) => {
                let report = Event::Response {
                    key: key.clone(),
                    generation,
                    frame,
                };
                if events.send(report).is_err() {
                    return;
                }
            }
            Some(Err(e)) => break e,
            None => break RpcError::ConnectionClosed,
        }
    };
    let _ = events.send(Event::Failed {
        key,
        generation,
        error,
    });
}

async fn write_requests(
    key: ConnectionKey,
    generation: u64,
    half: WriteHalf<BoxedStream>,
    codec: RequestCodec,
    mut frames: mpsc::UnboundedReceiver<RequestFrame>,
    events: mpsc::UnboundedSender<Event>,
) {
    let mut sink = FramedWrite::new(half, codec);
    while let Some(frame) = frames.recv().await {
        let written = async {
            sink.feed(frame).await?;
            while let Ok(next) = frames.try_recv() {
                sink.feed(next).await?;
            }
            sink.flush().await
        }
        .await;

        if let Err(error) = written {
            let _ = events.send(Event::Failed {
                key,
                generation,
                error,
            });
            return;
        }
    }
}
