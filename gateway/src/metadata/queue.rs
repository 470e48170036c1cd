//! Bounded fire-and-forget task queue for Metadata Center writes.
//!
//! A single multi-producer channel feeds a pool of worker tasks. Dispatch
//! never blocks: a saturated queue drops the task with a warning. Workers
//! open a per-task deadline, issue the HTTP call, and discard failures —
//! tasks carry no callback and are never retried.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use http::Method;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use super::{client::Transport, MetadataError, MetadataResult};

/// One asynchronous write, immutable once dispatched.
#[derive(Debug, Clone)]
pub struct Task {
    pub hash_key: String,
    pub method: Method,
    pub path: &'static str,
    pub body: Bytes,
    pub trace_id: String,
    pub timeout: Option<Duration>,
}

#[derive(Debug)]
pub struct TaskQueue {
    tx: Mutex<Option<mpsc::Sender<Task>>>,
}

impl TaskQueue {
    /// Spawn `worker_count` workers draining a channel of `queue_size`
    /// capacity. Requires a running tokio runtime.
    pub(crate) fn start(
        queue_size: usize,
        worker_count: usize,
        default_timeout: Duration,
        transport: Arc<Transport>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        for id in 0..worker_count.max(1) {
            let rx = Arc::clone(&rx);
            let transport = Arc::clone(&transport);
            tokio::spawn(worker_loop(id, rx, transport, default_timeout));
        }

        info!(
            workers = worker_count,
            queue_size, "metadata async queue started"
        );

        Self {
            tx: Mutex::new(Some(tx)),
        }
    }

    /// Enqueue a task without blocking.
    pub fn dispatch(&self, task: Task) -> MetadataResult<()> {
        let guard = self.tx.lock();
        let tx = guard.as_ref().ok_or(MetadataError::QueueClosed)?;
        match tx.try_send(task) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(task)) => {
                warn!(
                    method = %task.method,
                    path = task.path,
                    "metadata async queue is full, dropping task"
                );
                Err(MetadataError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(MetadataError::QueueClosed),
        }
    }

    /// Close the queue. Workers drain the remaining tasks and exit; further
    /// dispatches fail with [`MetadataError::QueueClosed`].
    pub fn close(&self) {
        self.tx.lock().take();
    }
}

async fn worker_loop(
    id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Task>>>,
    transport: Arc<Transport>,
    default_timeout: Duration,
) {
    loop {
        let task = { rx.lock().await.recv().await };
        let Some(task) = task else {
            debug!(worker = id, "metadata queue worker exiting");
            break;
        };

        let timeout = task.timeout.unwrap_or(default_timeout);
        match transport
            .send(
                task.method.clone(),
                task.path,
                None,
                Some(task.body.clone()),
                &task.trace_id,
                timeout,
            )
            .await
        {
            Ok(_) => debug!(
                trace_id = %task.trace_id,
                method = %task.method,
                path = task.path,
                "async task completed"
            ),
            Err(err) => warn!(
                trace_id = %task.trace_id,
                method = %task.method,
                path = task.path,
                error = %err,
                "async task failed"
            ),
        }
    }
}
