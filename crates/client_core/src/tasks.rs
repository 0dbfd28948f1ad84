//! Sequential queue for best-effort background work that must outlive the
//! caller, such as the save issued while a canvas is torn down.

use std::future::Future;

use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, warn};

struct QueuedTask {
    label: &'static str,
    work: BoxFuture<'static, Result<()>>,
}

pub struct TaskQueue {
    tx: mpsc::UnboundedSender<QueuedTask>,
    worker: JoinHandle<()>,
}

impl TaskQueue {
    /// Starts the worker on the current tokio runtime.
    pub fn start() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<QueuedTask>();
        let worker = tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                match tokio::spawn(task.work).await {
                    Ok(Ok(())) => debug!("tasks: {} finished", task.label),
                    Ok(Err(err)) => warn!("tasks: {} failed: {err:#}", task.label),
                    Err(err) => warn!("tasks: {} aborted: {err}", task.label),
                }
            }
        });
        Self { tx, worker }
    }

    /// Queues `work` behind everything submitted before it. Failures are
    /// logged by the worker and never reach the submitter.
    pub fn submit<F>(&self, label: &'static str, work: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.tx
            .send(QueuedTask {
                label,
                work: Box::pin(work),
            })
            .map_err(|_| anyhow!("task queue stopped; dropped {label}"))
    }

    /// Waits until every task submitted before this call has finished.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        let queued = self.submit("flush", async move {
            let _ = done_tx.send(());
            Ok(())
        });
        if queued.is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Stops accepting work and waits for queued tasks to drain.
    pub async fn shutdown(self) {
        drop(self.tx);
        let _ = self.worker.await;
    }
}
