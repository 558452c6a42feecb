//! Cancel-aware task queue with concurrency 1
//!
//! Devices often expose idempotent "set to X" commands where only the latest
//! matters. Submitting those under a shared cancel group lets a newer task
//! supersede an older one that has not started yet, without flooding the
//! device with stale intermediate commands. Tasks with no cancel group always
//! run, in submission order.

use anyhow::Result;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::trace;

use cuedriver_shared::EngineError;

type TaskFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

struct QueuedTask {
    cancel_group: Option<String>,
    task: TaskFuture,
    done: oneshot::Sender<Result<()>>,
    cancelled: bool,
}

/// Resolves once the queued task has run or been skipped.
///
/// Waiting returns an error only if the task itself failed (or the queue
/// worker is gone); a skipped task resolves with `Ok`.
pub struct QueueHandle {
    rx: oneshot::Receiver<Result<()>>,
}

impl QueueHandle {
    pub async fn wait(self) -> Result<()> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(EngineError::QueueTerminated.into()),
        }
    }
}

/// A task queue that executes strictly one task at a time, in submission
/// order, where a newly submitted task can cancel an older not-yet-started
/// task sharing the same cancel group.
pub struct CancellableQueue {
    inner: Arc<Mutex<VecDeque<QueuedTask>>>,
    notify: Arc<Notify>,
    worker: JoinHandle<()>,
}

impl CancellableQueue {
    pub fn new() -> Self {
        let inner: Arc<Mutex<VecDeque<QueuedTask>>> = Arc::new(Mutex::new(VecDeque::new()));
        let notify = Arc::new(Notify::new());

        let worker_inner = inner.clone();
        let worker_notify = notify.clone();
        let worker = tokio::spawn(async move {
            loop {
                // Pop under the lock, run outside it. A task that has been
                // popped is "started" and can no longer be cancelled.
                let next = worker_inner.lock().await.pop_front();
                match next {
                    Some(entry) => {
                        if entry.cancelled {
                            trace!("skipping cancelled task");
                            let _ = entry.done.send(Ok(()));
                            continue;
                        }
                        let result = entry.task.await;
                        let _ = entry.done.send(result);
                    }
                    None => worker_notify.notified().await,
                }
            }
        });

        Self {
            inner,
            notify,
            worker,
        }
    }

    /// Queue a task. A non-null cancel group marks any queued, not-yet-started
    /// task in the same group as cancelled; when the worker reaches a
    /// cancelled task it is skipped instead of run.
    pub async fn add<F>(&self, cancel_group: Option<&str>, task: F) -> QueueHandle
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        {
            let mut tasks = self.inner.lock().await;
            if let Some(group) = cancel_group {
                for queued in tasks.iter_mut() {
                    if queued.cancel_group.as_deref() == Some(group) {
                        queued.cancelled = true;
                    }
                }
            }
            tasks.push_back(QueuedTask {
                cancel_group: cancel_group.map(Into::into),
                task: Box::pin(task),
                done: tx,
                cancelled: false,
            });
        }
        self.notify.notify_one();
        QueueHandle { rx }
    }

    /// Empty the queue, cancelling every task that has not started yet. A
    /// task the worker is currently running is unaffected.
    pub async fn clear(&self) {
        let mut tasks = self.inner.lock().await;
        for entry in tasks.drain(..) {
            let _ = entry.done.send(Ok(()));
        }
    }

    /// Resolves once every task currently in the queue has finished or been
    /// skipped.
    pub async fn wait_for_queue(&self) -> Result<()> {
        self.add(None, async { Ok(()) }).await.wait().await
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    /// Stop the worker and drop everything still queued. Pending handles
    /// resolve with [`EngineError::QueueTerminated`].
    pub async fn terminate(&self) {
        self.worker.abort();
        self.inner.lock().await.clear();
    }
}

impl Default for CancellableQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CancellableQueue {
    fn drop(&mut self) {
        self.worker.abort();
    }
}
