//! Stream lifecycle state and its single-shot terminal signal.
//!
//! ```text
//! Idle -> Open -> HalfClosedLocal -> Closed | Failed
//!           \_______________________/
//! ```
//!
//! The first terminal state reached wins; later transitions are ignored.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use crate::stream::client::StreamError;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StreamState {
    Idle,
    Open,
    /// Local side finished sending; the remote side may still send.
    HalfClosedLocal,
    Closed,
    Failed,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    /// Whether the remote side can still deliver messages.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Open | Self::HalfClosedLocal)
    }
}

/// Current state plus the error that ended the stream, if any.
#[derive(Clone, Debug)]
pub(crate) struct Lifecycle {
    state: StreamState,
    failure: Option<StreamError>,
}

impl Lifecycle {
    pub(crate) fn idle() -> Self {
        Self {
            state: StreamState::Idle,
            failure: None,
        }
    }

    pub(crate) fn state(&self) -> StreamState {
        self.state
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        matches!(self.failure, Some(StreamError::Cancelled))
    }

    /// `None` until terminal, then the result the stream ended with.
    pub(crate) fn outcome(&self) -> Option<Result<(), StreamError>> {
        match (self.state, &self.failure) {
            (StreamState::Closed, _) => Some(Ok(())),
            (StreamState::Failed, Some(error)) => Some(Err(error.clone())),
            (StreamState::Failed, None) => Some(Err(StreamError::Protocol(
                "stream failed without a recorded error".to_string(),
            ))),
            _ => None,
        }
    }

    /// Applies a non-failure transition. Returns whether it was allowed.
    fn advance(&mut self, next: StreamState) -> bool {
        let allowed = match (self.state, next) {
            (StreamState::Idle, StreamState::Open | StreamState::Closed) => true,
            (StreamState::Open, StreamState::HalfClosedLocal) => true,
            (StreamState::Open | StreamState::HalfClosedLocal, StreamState::Closed) => true,
            _ => false,
        };
        if allowed {
            self.state = next;
        }
        allowed
    }

    fn fail(&mut self, error: StreamError) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = StreamState::Failed;
        self.failure = Some(error);
        true
    }
}

/// Shared, observable lifecycle of one stream.
#[derive(Clone, Debug)]
pub(crate) struct StateCell {
    tx: Arc<watch::Sender<Lifecycle>>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(Lifecycle::idle());
        Self { tx: Arc::new(tx) }
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Lifecycle> {
        self.tx.subscribe()
    }

    pub(crate) fn state(&self) -> StreamState {
        self.tx.borrow().state()
    }

    pub(crate) fn outcome(&self) -> Option<Result<(), StreamError>> {
        self.tx.borrow().outcome()
    }

    pub(crate) fn advance(&self, next: StreamState) -> bool {
        let mut from = StreamState::Idle;
        let changed = self.tx.send_if_modified(|lifecycle| {
            from = lifecycle.state;
            lifecycle.advance(next)
        });
        if changed {
            debug!(event = "stream_state_changed", ?from, to = ?next);
        }
        changed
    }

    pub(crate) fn fail(&self, error: StreamError) -> bool {
        let mut from = StreamState::Idle;
        let reason = error.to_string();
        let changed = self.tx.send_if_modified(|lifecycle| {
            from = lifecycle.state;
            lifecycle.fail(error)
        });
        if changed {
            debug!(event = "stream_state_changed", ?from, to = ?StreamState::Failed, reason = %reason);
        }
        changed
    }
}

/// Resolves once `lifecycle` reaches a terminal state.
pub(crate) async fn terminal_reached(lifecycle: &mut watch::Receiver<Lifecycle>) {
    let _ = lifecycle
        .wait_for(|current| current.state().is_terminal())
        .await;
}

/// Resolves once the local side has stopped sending, by half-close or by
/// reaching a terminal state.
pub(crate) async fn sending_finished(lifecycle: &mut watch::Receiver<Lifecycle>) {
    let _ = lifecycle
        .wait_for(|current| {
            !matches!(current.state(), StreamState::Idle | StreamState::Open)
        })
        .await;
}
