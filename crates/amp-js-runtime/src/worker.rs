//! Dedicated worker thread.
//!
//! A `Worker` owns one OS thread and a FIFO queue of boxed tasks. Any number
//! of threads may submit work; only the worker thread ever runs it. Callers
//! get a [`TaskHandle`] that resolves once their own task has finished, so
//! waiting never holds the queue lock.
//!
//! Closing the queue is atomic with respect to submission: a task is either
//! accepted (and will run before the thread exits) or rejected (its handle
//! resolves to [`RuntimeError::Terminated`]).

use std::collections::VecDeque;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::{Condvar, Mutex};

use crate::error::RuntimeError;

type Task = Box<dyn FnOnce() + Send + 'static>;

struct Queue {
    tasks: VecDeque<Task>,
    closed: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
}

/// A single serialized execution context.
pub struct Worker {
    name: String,
    shared: Arc<Shared>,
    thread_id: ThreadId,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    /// Spawn the worker thread.
    pub fn new(name: impl Into<String>) -> Result<Self, RuntimeError> {
        let name = name.into();
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                tasks: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
        });

        let loop_shared = shared.clone();
        let loop_name = name.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker_loop(&loop_name, &loop_shared))?;

        let thread_id = handle.thread().id();
        tracing::debug!("[worker:{}] spawned", name);

        Ok(Self {
            name,
            shared,
            thread_id,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Name of the worker thread.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the calling thread is this worker's thread.
    pub fn is_worker_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Whether the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.shared.queue.lock().closed
    }

    /// Number of tasks waiting to run.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().tasks.len()
    }

    /// Enqueue `f` and return immediately.
    ///
    /// If the worker is closed the task is dropped and the handle resolves to
    /// [`RuntimeError::Terminated`].
    pub fn spawn<F, T>(&self, f: F) -> TaskHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (task, handle) = package(f);
        self.submit(task, false);
        handle
    }

    /// Run `f` on the worker and block until it completes.
    ///
    /// Called from the worker thread itself, `f` runs inline so that nested
    /// calls cannot deadlock on their own queue.
    pub fn run<F, T>(&self, f: F) -> Result<T, RuntimeError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.is_worker_thread() {
            return catch(f);
        }
        self.spawn(f).wait()
    }

    /// Close the queue with `f` as the last accepted task.
    ///
    /// Tasks already queued run first; anything submitted afterwards is
    /// rejected. Returns a handle that resolves to `Terminated` if the queue
    /// was already closed.
    pub fn close_with<F, T>(&self, f: F) -> TaskHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (task, handle) = package(f);
        self.submit(task, true);
        handle
    }

    /// Close the queue and wait for the thread to drain and exit.
    pub fn shutdown(&self) -> Result<(), RuntimeError> {
        {
            let mut queue = self.shared.queue.lock();
            queue.closed = true;
        }
        self.shared.available.notify_all();
        self.join()
    }

    fn submit(&self, task: Task, close: bool) {
        let accepted = {
            let mut queue = self.shared.queue.lock();
            if queue.closed {
                false
            } else {
                queue.tasks.push_back(task);
                queue.closed = close;
                true
            }
        };
        if accepted {
            self.shared.available.notify_one();
        } else {
            tracing::debug!("[worker:{}] rejected task after close", self.name);
        }
    }

    fn join(&self) -> Result<(), RuntimeError> {
        if self.is_worker_thread() {
            // The thread exits on its own once the current task returns.
            return Ok(());
        }
        if let Some(handle) = self.thread.lock().take() {
            handle.join().map_err(|_| RuntimeError::ThreadPanic)?;
            tracing::debug!("[worker:{}] joined", self.name);
        }
        Ok(())
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!("[worker:{}] shutdown failed: {}", self.name, e);
        }
    }
}

fn worker_loop(name: &str, shared: &Shared) {
    tracing::debug!("[worker:{}] thread started", name);
    loop {
        let task = {
            let mut queue = shared.queue.lock();
            while queue.tasks.is_empty() && !queue.closed {
                shared.available.wait(&mut queue);
            }
            match queue.tasks.pop_front() {
                Some(task) => task,
                None => break,
            }
        };
        task();
    }
    tracing::debug!("[worker:{}] thread exiting", name);
}

fn package<F, T>(f: F) -> (Task, TaskHandle<T>)
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let slot = Arc::new(Slot::new());
    let completer = Completer {
        slot: Some(slot.clone()),
    };
    let task: Task = Box::new(move || completer.complete(catch(f)));
    (task, TaskHandle { slot })
}

fn catch<F, T>(f: F) -> Result<T, RuntimeError>
where
    F: FnOnce() -> T,
{
    panic::catch_unwind(AssertUnwindSafe(f))
        .map_err(|payload| RuntimeError::TaskPanicked(panic_message(payload)))
}

/// Extract a human-readable message from a panic payload.
pub fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        return (*msg).to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_string()
}

// ─────────────────────────────────────────────────────────────────────────────
// Task Handle
// ─────────────────────────────────────────────────────────────────────────────

struct SlotState<T> {
    result: Option<Result<T, RuntimeError>>,
    done: bool,
    waker: Option<Waker>,
}

/// Completion slot shared by a task and its handle.
struct Slot<T> {
    state: Mutex<SlotState<T>>,
    ready: Condvar,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                result: None,
                done: false,
                waker: None,
            }),
            ready: Condvar::new(),
        }
    }

    fn fill(&self, result: Result<T, RuntimeError>) {
        let waker = {
            let mut state = self.state.lock();
            state.result = Some(result);
            state.done = true;
            state.waker.take()
        };
        self.ready.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// Task side of a slot. Dropping it unfilled (a rejected task) resolves the
/// handle to `Terminated`.
struct Completer<T> {
    slot: Option<Arc<Slot<T>>>,
}

impl<T> Completer<T> {
    fn complete(mut self, result: Result<T, RuntimeError>) {
        if let Some(slot) = self.slot.take() {
            slot.fill(result);
        }
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            slot.fill(Err(RuntimeError::Terminated));
        }
    }
}

/// Pending result of a task submitted to a [`Worker`].
///
/// Resolves exactly once: with the task's value, with `TaskPanicked` if it
/// panicked, or with `Terminated` if it was rejected. Both `wait` and
/// `.await` work from any thread, including threads driving an async
/// runtime.
#[must_use = "dropping a TaskHandle discards the task's result"]
pub struct TaskHandle<T> {
    slot: Arc<Slot<T>>,
}

impl<T> TaskHandle<T> {
    /// Block the calling thread until the task finishes.
    pub fn wait(self) -> Result<T, RuntimeError> {
        let mut state = self.slot.state.lock();
        while !state.done {
            self.slot.ready.wait(&mut state);
        }
        state.result.take().unwrap_or(Err(RuntimeError::Terminated))
    }

    /// Take the result if the task has finished, without blocking.
    pub fn try_take(&mut self) -> Option<Result<T, RuntimeError>> {
        let mut state = self.slot.state.lock();
        if !state.done {
            return None;
        }
        Some(state.result.take().unwrap_or(Err(RuntimeError::Terminated)))
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, RuntimeError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.slot.state.lock();
        if state.done {
            return Poll::Ready(state.result.take().unwrap_or(Err(RuntimeError::Terminated)));
        }
        match &state.waker {
            Some(waker) if waker.will_wake(cx.waker()) => {}
            _ => state.waker = Some(cx.waker().clone()),
        }
        Poll::Pending
    }
}
