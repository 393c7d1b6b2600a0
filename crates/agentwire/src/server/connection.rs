//! Per-connection worker.
//!
//! One task owns the socket and alternates between decoding requests,
//! dispatching them to the service, and writing responses. Two limits bound
//! what a single peer can make it hold:
//!
//! - at `max_outstanding_calls` unanswered calls the worker stops
//!   dispatching and reads at most `READ_CHUNK` bytes ahead, so cancels
//!   for held calls still get through
//! - at `tx_buffer_limit` unsent response bytes it stops draining handler
//!   completions until the socket catches up

use bytes::BytesMut;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use agentwire_common::{EndpointConfig, PeerName, RpcError, RpcResult};

use super::incomplete::{Completed, IncompleteCall};
use super::{EndpointCounters, Service};
use crate::payload::PayloadReader;
use crate::transport::BoxedStream;
use crate::wire::{RequestCodec, RequestFrame, RequestKind, ResponseCodec, ResponseFrame, SequenceNumber};

const READ_CHUNK: usize = 8 * 1024;

pub(crate) struct ConnectionWorker<S: Service> {
    service: Arc<S>,
    session: S::Session,
    peer: PeerName,
    config: EndpointConfig,
    requests: RequestCodec,
    responses: ResponseCodec,
    rx: BytesMut,
    tx: BytesMut,
    /// Dispatched calls by sequence, with their abandonment tokens
    outstanding: HashMap<SequenceNumber, CancellationToken>,
    /// Fixed by the first request on the connection
    version: Option<u32>,
    completions_tx: mpsc::UnboundedSender<Completed>,
    completions_rx: mpsc::UnboundedReceiver<Completed>,
    /// Parent of every call token; fired when the peer goes away
    token: CancellationToken,
    shutdown: CancellationToken,
    counters: Arc<EndpointCounters>,
    /// Still accepting requests
    reading: bool,
    /// Socket unusable; outcomes are discarded
    broken: bool,
}

impl<S: Service> ConnectionWorker<S> {
    pub(crate) fn new(
        service: Arc<S>,
        peer: PeerName,
        config: EndpointConfig,
        shutdown: CancellationToken,
        counters: Arc<EndpointCounters>,
    ) -> Self {
        let session = service.connected(&peer);
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Self {
            service,
            session,
            peer,
            requests: RequestCodec::new(config.max_message_size),
            responses: ResponseCodec::new(config.max_message_size),
            config,
            rx: BytesMut::with_capacity(READ_CHUNK),
            tx: BytesMut::new(),
            outstanding: HashMap::new(),
            version: None,
            completions_tx,
            completions_rx,
            token: shutdown.child_token(),
            shutdown,
            counters,
            reading: true,
            broken: false,
        }
    }

    pub(crate) async fn run(mut self, stream: BoxedStream) {
        debug!(peer = %self.peer, "Connection worker started");
        let (mut reader, mut writer) = tokio::io::split(stream);

        loop {
            if !self.reading
                && self.outstanding.is_empty()
                && (self.broken || self.tx.is_empty())
            {
                break;
            }

            let can_read = self.reading
                && (self.outstanding.len() < self.config.max_outstanding_calls
                    || self.rx.len() < READ_CHUNK);
            let can_drain = self.broken || self.tx.len() < self.config.tx_buffer_limit;
            let can_write = !self.broken && !self.tx.is_empty();

            tokio::select! {
                _ = self.shutdown.cancelled(), if self.reading => {
                    debug!(peer = %self.peer, outstanding = self.outstanding.len(), "Draining connection for shutdown");
                    self.reading = false;
                    self.refuse_buffered();
                }

                result = reader.read_buf(&mut self.rx), if can_read => {
                    match result {
                        Ok(0) => {
                            debug!(peer = %self.peer, "Peer closed connection");
                            self.disconnect();
                        }
                        Ok(n) => {
                            trace!(peer = %self.peer, bytes = n, "Read");
                            self.pump();
                        }
                        Err(e) => {
                            debug!(peer = %self.peer, error = %e, "Read failed");
                            self.disconnect();
                        }
                    }
                }

                Some(done) = self.completions_rx.recv(), if can_drain => {
                    self.on_completed(done);
                    // a freed slot may unblock a request already buffered
                    if self.reading {
                        self.pump();
                    }
                }

                result = writer.write_buf(&mut self.tx), if can_write => {
                    match result {
                        Ok(0) => self.disconnect(),
                        Ok(n) => trace!(peer = %self.peer, bytes = n, "Wrote"),
                        Err(e) => {
                            debug!(peer = %self.peer, error = %e, "Write failed");
                            self.disconnect();
                        }
                    }
                }
            }
        }

        if !self.broken {
            let _ = writer.shutdown().await;
        }
        self.counters.connection_closed();
        debug!(peer = %self.peer, "Connection worker finished");
    }

    /// Peer is gone: abandon every call and wait only for their outcomes.
    fn disconnect(&mut self) {
        self.reading = false;
        self.broken = true;
        self.tx.clear();
        self.token.cancel();
    }

    fn pump(&mut self) {
        if let Err(e) = self.dispatch_frames() {
            warn!(peer = %self.peer, error = %e, "Protocol error, closing connection");
            self.reading = false;
            self.token.cancel();
        }
    }

    fn dispatch_frames(&mut self) -> RpcResult<()> {
        loop {
            if self.outstanding.len() >= self.config.max_outstanding_calls
                && !RequestCodec::next_is_cancel(&self.rx)
            {
                self.cancel_buffered();
                return Ok(());
            }
            let Some(frame) = self.requests.decode(&mut self.rx)? else {
                return Ok(());
            };
            self.check_version(&frame)?;
            match frame.header.kind {
                RequestKind::Call => self.dispatch(frame)?,
                RequestKind::Cancel => {
                    if let Some(token) = self.outstanding.get(&frame.sequence()) {
                        trace!(peer = %self.peer, sequence = frame.sequence().0, "Call cancelled by peer");
                        token.cancel();
                    }
                }
            }
            if !self.reading {
                return Ok(());
            }
        }
    }

    /// At the limit with a call at the head of the buffer: honour cancels
    /// queued behind it. The frames stay buffered and are no-ops once decoded.
    fn cancel_buffered(&mut self) {
        for sequence in RequestCodec::buffered_cancels(&self.rx) {
            if let Some(token) = self.outstanding.get(&sequence) {
                if !token.is_cancelled() {
                    trace!(peer = %self.peer, sequence = sequence.0, "Call cancelled by peer while at limit");
                    token.cancel();
                }
            }
        }
    }

    /// Answer requests that arrived but were never dispatched, so the peer
    /// knows they did not run and can send them elsewhere.
    fn refuse_buffered(&mut self) {
        loop {
            let frame = match self.requests.decode(&mut self.rx) {
                Ok(Some(frame)) => frame,
                Ok(None) => return,
                Err(e) => {
                    debug!(peer = %self.peer, error = %e, "Discarding undecodable input at shutdown");
                    self.rx.clear();
                    return;
                }
            };
            match frame.header.kind {
                RequestKind::Call => {
                    trace!(peer = %self.peer, sequence = frame.sequence().0, "Refusing call, shutting down");
                    self.queue(ResponseFrame::failure(frame.sequence(), &RpcError::ShuttingDown));
                }
                RequestKind::Cancel => {
                    if let Some(token) = self.outstanding.get(&frame.sequence()) {
                        token.cancel();
                    }
                }
            }
        }
    }

    fn check_version(&mut self, frame: &RequestFrame) -> RpcResult<()> {
        let actual = frame.header.version;
        match self.version {
            Some(expected) if expected != actual => {
                Err(RpcError::VersionMismatch { expected, actual })
            }
            Some(_) => Ok(()),
            None if self.service.supports_version(actual) => {
                debug!(peer = %self.peer, version = actual, "Interface version negotiated");
                self.version = Some(actual);
                Ok(())
            }
            None => {
                let error = RpcError::UnsupportedVersion(actual);
                self.queue(ResponseFrame::failure(frame.sequence(), &error));
                Err(error)
            }
        }
    }

    fn dispatch(&mut self, frame: RequestFrame) -> RpcResult<()> {
        let sequence = frame.sequence();
        if self.outstanding.contains_key(&sequence) {
            return Err(RpcError::InvalidMessage(format!(
                "sequence {} already outstanding",
                sequence
            )));
        }

        let token = self.token.child_token();
        self.outstanding.insert(sequence, token.clone());
        self.counters.call_dispatched();

        let interface = frame.header.version;
        let call = IncompleteCall::new(sequence, interface, token, self.completions_tx.clone());
        let mut request = PayloadReader::new(frame.payload);

        trace!(peer = %self.peer, sequence = sequence.0, "Dispatching call");
        if let Err(e) = self
            .service
            .called(&mut self.session, interface, &mut request, call)
        {
            debug!(peer = %self.peer, sequence = sequence.0, error = %e, "Handler rejected call");
            self.outstanding.remove(&sequence);
            self.counters.call_failed();
            self.queue(ResponseFrame::failure(sequence, &e));
        }
        Ok(())
    }

    fn on_completed(&mut self, done: Completed) {
        if self.outstanding.remove(&done.sequence).is_none() {
            trace!(peer = %self.peer, sequence = done.sequence.0, "Ignoring outcome for resolved call");
            return;
        }

        let frame = match done.outcome {
            Ok(payload) => {
                self.counters.call_completed();
                ResponseFrame::success(done.sequence, payload)
            }
            Err(e) => {
                self.counters.call_failed();
                ResponseFrame::failure(done.sequence, &e)
            }
        };
        if !self.broken {
            self.queue(frame);
        }
    }

    fn queue(&mut self, frame: ResponseFrame) {
        let sequence = frame.sequence();
        if let Err(e) = self.responses.encode(frame, &mut self.tx) {
            warn!(peer = %self.peer, sequence = sequence.0, error = %e, "Response not encodable");
            let fallback = ResponseFrame::failure(sequence, &e);
            if let Err(e) = self.responses.encode(fallback, &mut self.tx) {
                warn!(peer = %self.peer, error = %e, "Dropping response");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::PROTOCOL_VERSION;
    use agentwire_common::config::DEFAULT_MAX_MESSAGE_SIZE;
    use agentwire_common::errors::codes;
    use bytes::{Buf, Bytes};
    use tokio_stream::StreamExt;
    use tokio_util::codec::FramedRead;

    /// Hands every call to the test.
    struct Forward(mpsc::UnboundedSender<IncompleteCall>);

    #[async_trait::async_trait]
    impl Service for Forward {
        type Session = ();

        fn connected(&self, _peer: &PeerName) {}

        fn called(
            &self,
            _session: &mut (),
            _interface: u32,
            _request: &mut PayloadReader,
            call: IncompleteCall,
        ) -> RpcResult<()> {
            let _ = self.0.send(call);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_shutdown_refuses_buffered_calls() {
        let (calls_tx, mut calls) = mpsc::unbounded_channel();
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let shutdown = CancellationToken::new();
        let config = EndpointConfig {
            max_outstanding_calls: 1,
            ..Default::default()
        };
        let worker = ConnectionWorker::new(
            Arc::new(Forward(calls_tx)),
            PeerName::unix("/tmp/worker-test.sock"),
            config,
            shutdown.clone(),
            Arc::new(EndpointCounters::default()),
        );

        // both requests land in one read; only the first fits under the limit
        let mut codec = RequestCodec::new(DEFAULT_MAX_MESSAGE_SIZE);
        let mut requests = BytesMut::new();
        for sequence in 0..2 {
            let frame = RequestFrame::call(PROTOCOL_VERSION, SequenceNumber(sequence), Bytes::new());
            codec.encode(frame, &mut requests).unwrap();
        }
        client.write_all(&requests).await.unwrap();
        let task = tokio::spawn(worker.run(Box::new(server)));

        let held = calls.recv().await.unwrap();
        assert_eq!(held.sequence(), SequenceNumber(0));

        shutdown.cancel();
        held.abandoned().await;
        held.complete(&5u32);

        let mut responses = FramedRead::new(client, ResponseCodec::new(DEFAULT_MAX_MESSAGE_SIZE));
        let mut frames = Vec::new();
        while let Some(frame) = responses.next().await {
            frames.push(frame.unwrap());
        }
        task.await.unwrap();
        frames.sort_by_key(|frame| frame.sequence());

        assert_eq!(frames.len(), 2);
        let mut completed = frames[0].clone().into_result().unwrap();
        assert_eq!(completed.get_u32(), 5);
        assert!(matches!(
            frames[1].clone().into_result(),
            Err(RpcError::Remote { code, .. }) if code == codes::SHUTTING_DOWN
        ));
        // never reached the service
        assert!(calls.try_recv().is_err());
    }
}
