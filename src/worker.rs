//! Generic single-consumer task runner with an idle-timeout callback.
//!
//! Three roles in the conference runtime run on this: the publisher stall
//! observer (2 s), the subscription stall observer (3 s), and the per-peer
//! data-channel write serializer. The consumer loops over "a task arrived"
//! and "nothing arrived for the configured timeout" until stopped, then
//! drains whatever is still queued.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

/// Reaction to queued tasks and to silence.
#[async_trait]
pub trait WorkerHandler<T>: Send {
    async fn on_task(&mut self, task: T);
    /// Called when `timeout` elapsed without a task. Never called again
    /// after `stop`.
    async fn on_timeout(&mut self);
}

/// A failed handoff to the worker, returning the task to the caller.
pub enum TaskError<T> {
    /// The worker was stopped.
    Closed(T),
    /// Non-blocking send hit the queue capacity.
    TooBusy(T),
}

impl<T> TaskError<T> {
    pub fn into_inner(self) -> T {
        match self {
            TaskError::Closed(t) | TaskError::TooBusy(t) => t,
        }
    }
}

impl<T> fmt::Debug for TaskError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::Closed(_) => write!(f, "TaskError::Closed(..)"),
            TaskError::TooBusy(_) => write!(f, "TaskError::TooBusy(..)"),
        }
    }
}

impl<T> fmt::Display for TaskError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::Closed(_) => write!(f, "worker is stopped"),
            TaskError::TooBusy(_) => write!(f, "worker queue is full"),
        }
    }
}

impl<T> std::error::Error for TaskError<T> {}

pub struct Worker<T> {
    tx: mpsc::Sender<T>,
    stop: Arc<Notify>,
    stopped: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl<T: Send + 'static> Worker<T> {
    /// Spawns the consumer task.
    pub fn spawn<H>(capacity: usize, timeout: Duration, mut handler: H) -> Self
    where
        H: WorkerHandler<T> + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<T>(capacity);
        let stop = Arc::new(Notify::new());
        let stopped = Arc::new(AtomicBool::new(false));

        let stop_signal = stop.clone();
        let stop_flag = stopped.clone();
        let handle = tokio::spawn(async move {
            loop {
                if stop_flag.load(Ordering::Acquire) {
                    break;
                }
                tokio::select! {
                    _ = stop_signal.notified() => {}
                    received = tokio::time::timeout(timeout, rx.recv()) => match received {
                        Ok(Some(task)) => handler.on_task(task).await,
                        // Every sender dropped; nothing left to drain.
                        Ok(None) => return,
                        Err(_) => handler.on_timeout().await,
                    },
                }
            }
            // Graceful drain: run the tasks that were accepted before the
            // stop, without further timeout callbacks.
            rx.close();
            while let Ok(task) = rx.try_recv() {
                handler.on_task(task).await;
            }
        });

        Self {
            tx,
            stop,
            stopped,
            handle,
        }
    }

    /// Hands a task to the consumer without waiting. `TooBusy` when the
    /// queue is at capacity, `Closed` after `stop`.
    pub fn send(&self, task: T) -> Result<(), TaskError<T>> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(TaskError::Closed(task));
        }
        self.tx.try_send(task).map_err(|e| match e {
            mpsc::error::TrySendError::Full(t) => TaskError::TooBusy(t),
            mpsc::error::TrySendError::Closed(t) => TaskError::Closed(t),
        })
    }

    /// Stops the consumer. Idempotent; queued tasks are still drained.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.stop.notify_waiters();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Waits for the consumer task to finish. Call after `stop`.
    pub async fn join(self) {
        let _ = self.handle.await;
    }
}
