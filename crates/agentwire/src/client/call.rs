use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use agentwire_common::{RpcError, RpcResult};

use super::maintenance::Command;
use crate::payload::{decode_payload, Decode};

/// Pool-unique identifier of a logical call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallId(pub u64);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Type-erased view of a call's result slot, used by the maintenance task.
pub(crate) trait Completion: Send + Sync {
    /// Decode and record a successful response.
    ///
    /// A decode error leaves the slot untouched so the caller may retry.
    fn deliver(&self, payload: Bytes) -> RpcResult<()>;

    /// Record a failure unless an outcome is already recorded.
    fn fail(&self, error: RpcError);

    fn is_finished(&self) -> bool;
}

/// The one outcome of a call, recorded under its own lock.
pub(crate) struct CallState<T> {
    slot: Mutex<Option<RpcResult<T>>>,
    finished: watch::Sender<bool>,
}

impl<T: Clone> CallState<T> {
    fn new() -> Self {
        let (finished, _) = watch::channel(false);
        Self {
            slot: Mutex::new(None),
            finished,
        }
    }

    /// Record `outcome` if the slot is empty.
    ///
    /// Returns whichever outcome ends up recorded, and whether it was this one.
    fn settle(&self, outcome: RpcResult<T>) -> (RpcResult<T>, bool) {
        let mut slot = self.slot.lock();
        if let Some(existing) = slot.as_ref() {
            return (existing.clone(), false);
        }
        *slot = Some(outcome.clone());
        self.finished.send_replace(true);
        (outcome, true)
    }

    fn peek(&self) -> Option<RpcResult<T>> {
        self.slot.lock().clone()
    }
}

impl<T: Decode + Clone + Send + 'static> Completion for CallState<T> {
    fn deliver(&self, payload: Bytes) -> RpcResult<()> {
        let value = decode_payload::<T>(payload)?;
        self.settle(Ok(value));
        Ok(())
    }

    fn fail(&self, error: RpcError) {
        self.settle(Err(error));
    }

    fn is_finished(&self) -> bool {
        self.slot.lock().is_some()
    }
}

/// Handle to one outstanding logical call.
///
/// The call may ride several physical connections before it finishes. Its
/// outcome is recorded exactly once; [`pop`](Self::pop),
/// [`try_pop`](Self::try_pop) and [`abort`](Self::abort) all return clones of
/// that single outcome, so concurrent observers always agree. Dropping an
/// unfinished call aborts it.
pub struct AsyncCall<T: Decode + Clone + Send + 'static> {
    id: CallId,
    state: Arc<CallState<T>>,
    commands: mpsc::UnboundedSender<Command>,
}

impl<T: Decode + Clone + Send + 'static> AsyncCall<T> {
    pub(crate) fn new(id: CallId, commands: mpsc::UnboundedSender<Command>) -> Self {
        Self {
            id,
            state: Arc::new(CallState::new()),
            commands,
        }
    }

    pub(crate) fn completion(&self) -> Arc<dyn Completion> {
        self.state.clone()
    }

    /// Fail before the call ever reaches the maintenance task.
    pub(crate) fn fail_locally(&self, error: RpcError) {
        self.state.settle(Err(error));
    }

    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_finished()
    }

    /// Wait until an outcome is recorded.
    pub async fn finished(&self) {
        let mut rx = self.state.finished.subscribe();
        // the sender lives in `state`, which outlives this borrow
        let _ = rx.wait_for(|done| *done).await;
    }

    /// The outcome, if there is one yet.
    pub fn try_pop(&self) -> Option<RpcResult<T>> {
        self.state.peek()
    }

    /// Wait for the outcome.
    ///
    /// If `deadline` passes first the call is aborted and yields
    /// [`RpcError::Timeout`], unless it completed in the meantime.
    pub async fn pop(&self, deadline: Option<Instant>) -> RpcResult<T> {
        match deadline {
            Some(deadline) => {
                if tokio::time::timeout_at(deadline, self.finished()).await.is_err() {
                    return self.cancel_with(RpcError::Timeout);
                }
            }
            None => self.finished().await,
        }
        self.state.peek().unwrap_or(Err(RpcError::Disconnected))
    }

    /// Stop waiting for the call.
    ///
    /// Safe at any time. If the call already finished, its outcome wins and
    /// is returned; otherwise it now fails with [`RpcError::Aborted`]. The
    /// request may still have executed remotely.
    pub fn abort(&self) -> RpcResult<T> {
        self.cancel_with(RpcError::Aborted)
    }

    fn cancel_with(&self, error: RpcError) -> RpcResult<T> {
        let (outcome, settled) = self.state.settle(Err(error));
        if settled {
            // pool may already be gone
            let _ = self.commands.send(Command::Abort { id: self.id });
        }
        outcome
    }
}

impl<T: Decode + Clone + Send + 'static> fmt::Debug for AsyncCall<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncCall")
            .field("id", &self.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl<T: Decode + Clone + Send + 'static> Drop for AsyncCall<T> {
    fn drop(&mut self) {
        if !self.state.is_finished() {
            self.cancel_with(RpcError::Aborted);
        }
    }
}
