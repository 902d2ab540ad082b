//! Sequential, self-draining task queue
//!
//! Tasks run one at a time in the order they were added. The first `add` on
//! an idle queue spawns a drain loop; later adds only append and wait their
//! turn. Once the pending list is empty the loop exits and the queue is idle
//! again.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::{debug, error, warn};

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type Task = Box<dyn FnOnce() -> BoxFuture + Send>;

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Task>,
    running: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<QueueState>,
    idle: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pops the next task, or marks the queue idle when there is none.
    /// Both happen under the same lock as `add`'s append and flag check.
    fn next_task(&self) -> Option<Task> {
        let mut state = self.lock();
        let task = state.pending.pop_front();
        if task.is_none() {
            state.running = false;
            drop(state);
            self.idle.notify_waiters();
        }
        task
    }
}

/// FIFO queue running at most one task at a time
///
/// Cloning yields another handle to the same queue.
#[derive(Clone, Default)]
pub struct SequentialQueue {
    shared: Arc<Shared>,
}

impl SequentialQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `task` and starts draining if the queue is idle.
    ///
    /// Must be called from within a tokio runtime. Tasks are expected to
    /// handle their own failures: a panicking task aborts the current drain
    /// loop, which is logged, and the remaining tasks run on the next `add`.
    pub fn add<F, Fut>(&self, task: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task: Task = Box::new(move || -> BoxFuture { Box::pin(task()) });

        let start_drain = {
            let mut state = self.shared.lock();
            state.pending.push_back(task);
            !std::mem::replace(&mut state.running, true)
        };

        if start_drain {
            debug!("Queue idle, starting drain loop");
            tokio::spawn(drain(Arc::clone(&self.shared)));
        }
    }

    /// Number of tasks waiting to run, excluding the one in flight.
    pub fn len(&self) -> usize {
        self.shared.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when no task is running and none is pending.
    pub fn is_idle(&self) -> bool {
        !self.shared.lock().running
    }

    /// Waits until the queue has drained every task added so far.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

async fn drain(shared: Arc<Shared>) {
    let mut guard = DrainGuard {
        shared: Arc::clone(&shared),
        finished: false,
    };

    while let Some(task) = shared.next_task() {
        task().await;
    }

    guard.finished = true;
}

/// Resets the running flag if the drain loop ends early, so the queue does not
/// stay stuck in the running state with nobody draining it.
struct DrainGuard {
    shared: Arc<Shared>,
    finished: bool,
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        let remaining = {
            let mut state = self.shared.lock();
            state.running = false;
            state.pending.len()
        };
        if std::thread::panicking() {
            error!(
                remaining,
                "Queued task panicked, drain loop aborted; remaining tasks run on next add"
            );
        } else {
            warn!(remaining, "Drain loop cancelled before the queue was empty");
        }
        self.shared.idle.notify_waiters();
    }
}
