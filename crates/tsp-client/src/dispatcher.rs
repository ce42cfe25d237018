//! Reply dispatch: matches replies to the oldest outstanding command and
//! delivers failures for commands that will never be answered.
//!
//! Every handler runs without the queue lock held, so a handler may call
//! back into the client. Handler panics are caught and logged.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::command::{Command, CommandQueue, Reply, ReplyHandler};
use crate::error::CommandError;

/// Number of handler invocations that have been claimed but not finished.
///
/// Reaches zero only when no handler is running and no failure batch is
/// waiting to run.
#[derive(Clone)]
pub struct InFlightCounter {
    tx: Arc<watch::Sender<usize>>,
}

impl Default for InFlightCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl InFlightCounter {
    /// Create a counter at zero.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    /// Claim `n` invocations.
    pub fn add(&self, n: usize) {
        if n > 0 {
            self.tx.send_modify(|count| *count += n);
        }
    }

    /// Mark one invocation finished.
    pub fn release(&self) {
        self.tx.send_modify(|count| *count = count.saturating_sub(1));
    }

    /// Current count.
    pub fn current(&self) -> usize {
        *self.tx.borrow()
    }

    /// Resolve once the count is zero.
    pub async fn wait_idle(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|count| *count == 0).await;
    }
}

/// Owns the command queue and every path that invokes a reply handler.
#[derive(Default)]
pub struct Dispatcher {
    queue: Mutex<CommandQueue>,
    in_flight: InFlightCounter,
    drains: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Create a dispatcher with an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the command queue.
    ///
    /// Never hold the guard across an `.await` or while calling a handler.
    pub fn lock(&self) -> MutexGuard<'_, CommandQueue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deliver one reply to the oldest outstanding command.
    ///
    /// A reply with nothing outstanding is logged and discarded.
    pub fn on_reply(&self, data: Vec<u8>) {
        let handler = {
            let mut queue = self.lock();
            let Some(command) = queue.pop_oldest() else {
                tracing::warn!(len = data.len(), "Reply with no outstanding request, discarding");
                return;
            };
            self.in_flight.add(1);
            command.handler
        };

        if let Some(handler) = handler {
            invoke(handler, Ok(data));
        }
        self.in_flight.release();
    }

    /// Report `error` to a single handler on the calling thread.
    ///
    /// Used for commands rejected at submission, outside the queue lock.
    pub fn fail_now(&self, handler: Option<ReplyHandler>, error: CommandError) {
        let Some(handler) = handler else { return };
        self.in_flight.add(1);
        invoke(handler, Err(error));
        self.in_flight.release();
    }

    /// Take every queued command and fail each with `error`.
    ///
    /// The queue is emptied under the caller's lock; the handlers run later
    /// on a blocking worker tracked for [`wait_idle`](Self::wait_idle). Outside
    /// a runtime they run on a plain thread. Returns the number of commands taken.
    pub fn drain_with_failure(&self, queue: &mut CommandQueue, error: CommandError) -> usize {
        let batch = queue.take_all();
        let count = batch.len();
        if count == 0 {
            return 0;
        }
        tracing::debug!(count, %error, "Failing outstanding requests");

        self.in_flight.add(count);
        let in_flight = self.in_flight.clone();
        let run = move || {
            for Command { handler, .. } in batch {
                if let Some(handler) = handler {
                    invoke(handler, Err(error.clone()));
                }
                in_flight.release();
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let task = runtime.spawn_blocking(run);
                self.lock_drains().push(task);
            }
            Err(_) => {
                if let Err(e) = std::thread::Builder::new().name("tsp-drain".into()).spawn(run) {
                    tracing::error!("Failed to start failure batch thread: {e}");
                }
            }
        }
        count
    }

    /// Wait for every failure batch and running handler to finish.
    pub async fn wait_idle(&self) {
        loop {
            let tasks = std::mem::take(&mut *self.lock_drains());
            if tasks.is_empty() {
                break;
            }
            for task in tasks {
                if let Err(e) = task.await {
                    tracing::error!("Failure batch task ended abnormally: {e}");
                }
            }
        }
        self.in_flight.wait_idle().await;
    }

    /// Number of commands waiting for a reply.
    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Number of handler invocations not yet finished.
    pub fn in_flight(&self) -> usize {
        self.in_flight.current()
    }

    fn lock_drains(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.drains.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn invoke(handler: ReplyHandler, reply: Reply) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(move || handler(reply))) {
        tracing::error!("Reply handler panicked: {}", panic_message(panic.as_ref()));
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        *s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
