//! Connection lifecycle state and phase notifications.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

/// Where the client is in its connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and none being attempted.
    Disconnected,
    /// The initial connect is in progress.
    Connecting,
    /// Connected; sends are transmitted immediately.
    Connected,
    /// The link dropped and the retry loop is running.
    Reconnecting,
    /// The retry loop gave up or was cancelled.
    Stopped,
}

impl ConnectionState {
    /// Whether sends are queued for later transmission in this state.
    pub fn defers_sends(self) -> bool {
        matches!(self, Self::Connecting | Self::Reconnecting)
    }
}

/// Observable connection state backed by a [`watch`] channel.
///
/// Writers hold the command-queue lock while calling [`set`](Self::set), so
/// a state read under that lock is consistent with the queue contents.
pub struct ConnectionStateWatch {
    tx: watch::Sender<ConnectionState>,
}

impl Default for ConnectionStateWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateWatch {
    /// Create a watch starting at [`ConnectionState::Disconnected`].
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self { tx }
    }

    /// Replace the state, waking subscribers if it changed.
    pub fn set(&self, state: ConnectionState) {
        self.tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            tracing::debug!(from = ?*current, to = ?state, "Connection state change");
            *current = state;
            true
        });
    }

    /// A receiver that observes every later transition.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Current state.
    pub fn current(&self) -> ConnectionState {
        *self.tx.borrow()
    }
}

/// Lifecycle event reported to a [`PhaseObserver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// A connect was initiated.
    Start,
    /// A connect or reconnect succeeded.
    Ok,
    /// The initial connect failed.
    Failed,
    /// An established connection was lost.
    Dropped,
    /// About to wait before the next reconnect attempt.
    Sleeping,
    /// Reconnection ended without success.
    Stopped,
}

impl Phase {
    /// Lowercase name used in logs and the CLI.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Ok => "ok",
            Self::Failed => "failed",
            Self::Dropped => "dropped",
            Self::Sleeping => "sleeping",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Callback receiving `(host, port, phase)` for every lifecycle event.
///
/// Called from the client's own tasks without any internal lock held.
pub type PhaseObserver = Arc<dyn Fn(&str, u16, Phase) + Send + Sync>;
