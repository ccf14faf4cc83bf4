//! Single-consumer message loops.
//!
//! Every execution context in the pipeline (capture device, GPU, render) is a
//! dedicated OS thread draining one queue. Messages sent to a loop run
//! strictly in submission order; cross-loop calls are fire-and-forget
//! enqueues.

use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, trace};

/// What the loop should do after handling a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    /// Stop the loop. Messages still queued are dropped.
    Quit,
}

/// Errors from message loop operations.
#[derive(Debug, Error)]
pub enum LoopError {
    /// The loop no longer accepts messages.
    #[error("Message loop '{0}' has terminated")]
    Terminated(String),

    /// The OS refused to start the thread.
    #[error("Failed to spawn message loop thread: {0}")]
    Spawn(#[from] std::io::Error),
}

struct LoopShared {
    name: String,
    running: Mutex<bool>,
    terminated: Condvar,
    thread_id: Mutex<Option<ThreadId>>,
}

/// Marks the loop terminated when the thread exits, including on panic.
struct TerminationGuard(Arc<LoopShared>);

impl Drop for TerminationGuard {
    fn drop(&mut self) {
        *self.0.running.lock() = false;
        self.0.terminated.notify_all();
        debug!(name = %self.0.name, "Message loop terminated");
    }
}

/// A cloneable sender into a message loop.
pub struct LoopHandle<M> {
    tx: Sender<M>,
    shared: Arc<LoopShared>,
}

impl<M> Clone for LoopHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M: Send + 'static> LoopHandle<M> {
    /// Enqueue a message. Fails once the loop has terminated.
    pub fn send(&self, msg: M) -> Result<(), LoopError> {
        if !self.is_running() {
            return Err(LoopError::Terminated(self.shared.name.clone()));
        }
        self.tx
            .send(msg)
            .map_err(|_| LoopError::Terminated(self.shared.name.clone()))
    }

    /// Returns true until the loop thread has exited.
    pub fn is_running(&self) -> bool {
        *self.shared.running.lock()
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Returns true when called from the loop's own thread.
    pub fn is_loop_thread(&self) -> bool {
        *self.shared.thread_id.lock() == Some(thread::current().id())
    }

    /// Block until the loop exits.
    ///
    /// Waits in slices of `retry` so a missed wake-up only costs one slice,
    /// and gives up after `deadline`. Returns true if the loop has exited.
    /// From the loop's own thread this never blocks.
    pub fn wait_for_termination(&self, retry: Duration, deadline: Duration) -> bool {
        if self.is_loop_thread() {
            return !self.is_running();
        }

        let start = Instant::now();
        let mut running = self.shared.running.lock();
        while *running {
            let elapsed = start.elapsed();
            if elapsed >= deadline {
                return false;
            }
            let slice = retry.min(deadline - elapsed);
            trace!(name = %self.shared.name, ?slice, "Waiting for message loop to terminate");
            self.shared.terminated.wait_for(&mut running, slice);
        }
        true
    }
}

/// A dedicated thread draining a message queue in order.
pub struct MessageLoop<M> {
    handle: LoopHandle<M>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<M: Send + 'static> MessageLoop<M> {
    /// Spawn a named loop thread running `handler` for every message.
    ///
    /// The handler is dropped on the loop thread before the loop reports
    /// termination, so resources it owns are released by then.
    pub fn spawn<F>(name: impl Into<String>, handler: F) -> Result<Self, LoopError>
    where
        F: FnMut(M) -> LoopControl + Send + 'static,
    {
        let name = name.into();
        let (tx, rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(LoopShared {
            name: name.clone(),
            running: Mutex::new(true),
            terminated: Condvar::new(),
            thread_id: Mutex::new(None),
        });

        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_loop(rx, handler, thread_shared))?;

        debug!(%name, "Message loop started");

        Ok(Self {
            handle: LoopHandle { tx, shared },
            thread: Mutex::new(Some(thread)),
        })
    }

    /// A sender that can be moved to other threads.
    pub fn handle(&self) -> LoopHandle<M> {
        self.handle.clone()
    }

    pub fn send(&self, msg: M) -> Result<(), LoopError> {
        self.handle.send(msg)
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    pub fn is_loop_thread(&self) -> bool {
        self.handle.is_loop_thread()
    }

    pub fn wait_for_termination(&self, retry: Duration, deadline: Duration) -> bool {
        self.handle.wait_for_termination(retry, deadline)
    }

    /// Join the loop thread if it has been asked to quit.
    pub fn join(&self) {
        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        if thread.thread().id() == thread::current().id() {
            return;
        }
        if thread.join().is_err() {
            debug!(name = %self.name(), "Message loop thread panicked");
        }
    }
}

fn run_loop<M, F>(rx: Receiver<M>, mut handler: F, shared: Arc<LoopShared>)
where
    F: FnMut(M) -> LoopControl,
{
    let _guard = TerminationGuard(Arc::clone(&shared));
    *shared.thread_id.lock() = Some(thread::current().id());

    while let Ok(msg) = rx.recv() {
        if handler(msg) == LoopControl::Quit {
            break;
        }
    }

    let dropped = rx.len();
    if dropped > 0 {
        debug!(name = %shared.name, dropped, "Dropping messages queued after quit");
    }
    drop(rx);
    drop(handler);
}
