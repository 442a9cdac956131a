//! Worker pools and the stage interface that chains them.
//!
//! ```text
//! ┌──────────────┐ rendezvous ┌─────────────┐ rendezvous ┌─────────────┐
//! │  Dissector   │───────────>│  Analyzer   │───────────>│   Writer    │
//! │ (N workers)  │   queue    │ (N workers) │   queue    │ (N workers) │
//! └──────────────┘            └─────────────┘            └─────────────┘
//! ```
//!
//! Each stage owns a [`WorkQueue`]: one unbuffered multi-consumer channel
//! plus the set of worker tasks draining it. A submit only completes once a
//! worker has taken the item, so a slow stage pushes back all the way to the
//! producer. Shutting a stage down closes its queue, waits for its workers to
//! finish what they hold and then shuts the next stage down.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::PipelineError;

/// A stage of the pipeline as seen by its upstream producer.
#[async_trait]
pub trait PipelineStage<T: Send + 'static>: Send + Sync {
    /// Hands one item to the stage, waiting until a worker takes it.
    async fn submit(&self, item: T) -> Result<(), PipelineError>;

    /// Adds one worker to the stage.
    fn start(&self);

    /// Stops accepting work, drains the workers and shuts down the next
    /// stage. Must be called once, after the last submit.
    async fn shutdown(&self) -> Result<(), PipelineError>;
}

/// Receiving side handed to each worker.
pub struct WorkerHandle<T> {
    name: &'static str,
    rx: flume::Receiver<T>,
    cancel: CancellationToken,
    live: Arc<AtomicUsize>,
}

impl<T> WorkerHandle<T> {
    /// Waits for the next item. Returns `None` once the queue is closed and
    /// drained, or the stage is cancelled.
    pub async fn recv(&self) -> Option<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            item = self.rx.recv_async() => item.ok(),
        }
    }

    /// Withdraws a worker that cannot serve the queue. Once no worker is
    /// left the stage is cancelled, so pending and later submits fail
    /// instead of waiting for a taker that never comes.
    pub fn abandon(self) {
        if self.live.fetch_sub(1, Ordering::SeqCst) == 1 {
            error!("{}: no workers left, cancelling stage", self.name);
            self.cancel.cancel();
        }
    }
}

/// Shared queue and worker set backing one stage.
pub struct WorkQueue<T> {
    name: &'static str,
    tx: Mutex<Option<flume::Sender<T>>>,
    rx: flume::Receiver<T>,
    workers: Mutex<JoinSet<()>>,
    live: Arc<AtomicUsize>,
    cancel: CancellationToken,
    submit_timeout: Option<Duration>,
    closed: AtomicBool,
}

impl<T: Send + 'static> WorkQueue<T> {
    pub fn new(name: &'static str, cancel: CancellationToken) -> Self {
        let (tx, rx) = flume::bounded(0);
        Self {
            name,
            tx: Mutex::new(Some(tx)),
            rx,
            workers: Mutex::new(JoinSet::new()),
            live: Arc::new(AtomicUsize::new(0)),
            cancel,
            submit_timeout: None,
            closed: AtomicBool::new(false),
        }
    }

    /// Bounds how long a submit may wait for a free worker.
    pub fn with_submit_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.submit_timeout = timeout;
        self
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    pub async fn submit(&self, item: T) -> Result<(), PipelineError> {
        let tx = self
            .tx
            .lock()
            .clone()
            .ok_or(PipelineError::QueueClosed(self.name))?;

        let send = async {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(PipelineError::Cancelled(self.name)),
                sent = tx.send_async(item) => sent.map_err(|_| PipelineError::QueueClosed(self.name)),
            }
        };

        match self.submit_timeout {
            Some(timeout) => tokio::time::timeout(timeout, send)
                .await
                .map_err(|_| PipelineError::SubmitTimeout {
                    stage: self.name,
                    timeout,
                })?,
            None => send.await,
        }
    }

    /// Spawns a worker running `work` over this queue.
    pub fn spawn<F, Fut>(&self, work: F)
    where
        F: FnOnce(WorkerHandle<T>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.live.fetch_add(1, Ordering::SeqCst);
        let handle = WorkerHandle {
            name: self.name,
            rx: self.rx.clone(),
            cancel: self.cancel.clone(),
            live: Arc::clone(&self.live),
        };
        let mut workers = self.workers.lock();
        workers.spawn(work(handle));
        debug!("{}: started worker {}", self.name, workers.len());
    }

    /// Closes the queue and waits for every worker to exit.
    pub async fn close_and_drain(&self) -> Result<(), PipelineError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(PipelineError::AlreadyShutDown(self.name));
        }
        drop(self.tx.lock().take());

        let mut workers = std::mem::take(&mut *self.workers.lock());
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("{}: worker ended abnormally: {}", self.name, e);
            }
        }
        debug!("{}: all workers drained", self.name);
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_items_reach_workers_and_drain() {
        let queue = WorkQueue::new("test", CancellationToken::new());
        let seen = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let seen = Arc::clone(&seen);
            queue.spawn(move |worker| async move {
                while let Some(n) = worker.recv().await {
                    seen.fetch_add(n, Ordering::SeqCst);
                }
            });
        }
        assert_eq!(queue.worker_count(), 3);

        for n in 1..=10usize {
            queue.submit(n).await.unwrap();
        }
        queue.close_and_drain().await.unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 55);
        assert_eq!(queue.worker_count(), 0);
    }

    #[tokio::test]
    async fn test_submit_after_close_is_rejected() {
        let queue: WorkQueue<u32> = WorkQueue::new("closed", CancellationToken::new());
        queue.close_and_drain().await.unwrap();

        assert_eq!(queue.submit(1).await, Err(PipelineError::QueueClosed("closed")));
        assert_eq!(
            queue.close_and_drain().await,
            Err(PipelineError::AlreadyShutDown("closed"))
        );
    }

    #[tokio::test]
    async fn test_submit_times_out_without_workers() {
        let queue: WorkQueue<u32> = WorkQueue::new("idle", CancellationToken::new())
            .with_submit_timeout(Some(Duration::from_millis(20)));

        let result = queue.submit(1).await;
        assert!(matches!(result, Err(PipelineError::SubmitTimeout { .. })));
    }

    #[tokio::test]
    async fn test_cancel_unblocks_submit_and_workers() {
        let cancel = CancellationToken::new();
        let queue: WorkQueue<u32> = WorkQueue::new("cancel", cancel.clone());
        queue.spawn(|worker| async move { while worker.recv().await.is_some() {} });

        cancel.cancel();
        assert_eq!(queue.submit(1).await, Err(PipelineError::Cancelled("cancel")));
        queue.close_and_drain().await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_panic_does_not_block_drain() {
        let queue = WorkQueue::new("panicky", CancellationToken::new());
        queue.spawn(|worker| async move {
            if worker.recv().await.is_some() {
                panic!("boom");
            }
        });
        queue.spawn(|worker| async move { while worker.recv().await.is_some() {} });

        queue.submit(1u8).await.unwrap();
        queue.submit(2u8).await.unwrap();
        assert!(queue.close_and_drain().await.is_ok());
    }

    #[tokio::test]
    async fn test_last_abandoning_worker_cancels_stage() {
        let cancel = CancellationToken::new();
        let queue: WorkQueue<u32> = WorkQueue::new("orphaned", cancel.clone());
        queue.spawn(|worker| async move { worker.abandon() });
        queue.spawn(|worker| async move { worker.abandon() });

        let result = tokio::time::timeout(Duration::from_secs(5), queue.submit(1))
            .await
            .expect("submit must not hang");
        assert_eq!(result, Err(PipelineError::Cancelled("orphaned")));
        assert!(cancel.is_cancelled());
        queue.close_and_drain().await.unwrap();
    }

    #[tokio::test]
    async fn test_one_abandoning_worker_leaves_stage_running() {
        let cancel = CancellationToken::new();
        let queue = WorkQueue::new("partial", cancel.clone());
        let seen = Arc::new(AtomicUsize::new(0));
        queue.spawn(|worker| async move { worker.abandon() });
        let counter = Arc::clone(&seen);
        queue.spawn(move |worker| async move {
            while let Some(n) = worker.recv().await {
                counter.fetch_add(n, Ordering::SeqCst);
            }
        });

        queue.submit(2usize).await.unwrap();
        queue.submit(3usize).await.unwrap();
        queue.close_and_drain().await.unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 5);
        assert!(!cancel.is_cancelled());
    }
}
