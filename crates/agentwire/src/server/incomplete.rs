use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use agentwire_common::{RpcError, RpcResult};

use crate::payload::{encode_payload, Encode};
use crate::wire::SequenceNumber;

/// Outcome handed from a handler back to the connection worker.
#[derive(Debug)]
pub(crate) struct Completed {
    pub sequence: SequenceNumber,
    pub outcome: RpcResult<Bytes>,
}

/// An accepted request whose response has not been produced yet.
///
/// Resolved exactly once: by [`complete`](Self::complete), by
/// [`fail`](Self::fail), or, if dropped unresolved, with a synthetic
/// [`RpcError::Abandoned`] failure. Resolution may happen on any task;
/// if the connection is already gone the outcome is discarded.
#[derive(Debug)]
pub struct IncompleteCall {
    sequence: SequenceNumber,
    interface: u32,
    token: CancellationToken,
    completions: Option<mpsc::UnboundedSender<Completed>>,
}

impl IncompleteCall {
    pub(crate) fn new(
        sequence: SequenceNumber,
        interface: u32,
        token: CancellationToken,
        completions: mpsc::UnboundedSender<Completed>,
    ) -> Self {
        Self {
            sequence,
            interface,
            token,
            completions: Some(completions),
        }
    }

    pub fn sequence(&self) -> SequenceNumber {
        self.sequence
    }

    /// Interface version the connection negotiated.
    pub fn interface(&self) -> u32 {
        self.interface
    }

    /// Answer the call with `response`.
    ///
    /// Encoding happens here, on the caller's task, so a large response does
    /// not stall the connection worker. An encode failure fails the call.
    pub fn complete<R: Encode + ?Sized>(mut self, response: &R) {
        let outcome = encode_payload(response);
        self.resolve(outcome);
    }

    /// Fail the call; the error reaches the client verbatim.
    pub fn fail(mut self, error: RpcError) {
        self.resolve(Err(error));
    }

    /// Resolves once the client no longer wants the answer: it cancelled the
    /// call, disconnected, or the endpoint is shutting down.
    pub async fn abandoned(&self) {
        self.token.cancelled().await
    }

    pub fn is_abandoned(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Token fired on abandonment, for handlers that hand work to other tasks.
    pub fn abandon_token(&self) -> CancellationToken {
        self.token.clone()
    }

    fn resolve(&mut self, outcome: RpcResult<Bytes>) {
        let Some(completions) = self.completions.take() else {
            return;
        };
        let sequence = self.sequence;
        if completions.send(Completed { sequence, outcome }).is_err() {
            trace!(sequence = sequence.0, "Connection gone, discarding outcome");
        }
    }
}

impl Drop for IncompleteCall {
    fn drop(&mut self) {
        if self.completions.is_some() {
            trace!(sequence = self.sequence.0, "Call dropped unresolved");
            self.resolve(Err(RpcError::Abandoned));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::decode_payload;

    fn call(seq: u64) -> (IncompleteCall, mpsc::UnboundedReceiver<Completed>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            IncompleteCall::new(SequenceNumber(seq), 1, CancellationToken::new(), tx),
            rx,
        )
    }

    #[test]
    fn test_complete_sends_encoded_response() {
        let (call, mut rx) = call(4);
        call.complete(&("HELLO!".to_string(), 73u32));

        let done = rx.try_recv().unwrap();
        assert_eq!(done.sequence, SequenceNumber(4));
        let (text, n): (String, u32) = decode_payload(done.outcome.unwrap()).unwrap();
        assert_eq!((text.as_str(), n), ("HELLO!", 73));
        // resolved exactly once
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_fail_passes_error_through() {
        let (call, mut rx) = call(5);
        call.fail(RpcError::application(1400, "bad input"));
        let done = rx.try_recv().unwrap();
        assert_eq!(done.outcome.unwrap_err(), RpcError::application(1400, "bad input"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_drop_unresolved_is_abandoned() {
        let (call, mut rx) = call(6);
        drop(call);
        let done = rx.try_recv().unwrap();
        assert_eq!(done.outcome.unwrap_err(), RpcError::Abandoned);
    }

    #[test]
    fn test_resolve_after_connection_gone_is_silent() {
        let (call, rx) = call(7);
        drop(rx);
        call.complete(&42u32);
    }

    #[tokio::test]
    async fn test_abandoned_fires_on_cancel() {
        let (call, _rx) = call(8);
        assert!(!call.is_abandoned());
        call.abandon_token().cancel();
        call.abandoned().await;
        assert!(call.is_abandoned());
    }
}
