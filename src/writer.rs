//! Persistence stage - the terminal pool of every pipeline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace, warn};

use crate::aggregate::Filter;
use crate::error::{PipelineError, StoreError};
use crate::metrics::{PipelineMetrics, SharedMetrics};
use crate::pool::{PipelineStage, WorkQueue};
use crate::store::{DocumentStore, Session, Update};

/// One upsert against one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOp {
    pub collection: String,
    pub selector: Filter,
    pub update: Update,
}

struct WriterInner<S> {
    store: S,
    timeout: Duration,
    metrics: SharedMetrics,
}

impl<S: DocumentStore> WriterInner<S> {
    async fn write(&self, session: &mut S::Session, op: &WriteOp) -> Result<(), StoreError> {
        match tokio::time::timeout(
            self.timeout,
            session.upsert(&op.collection, &op.selector, &op.update),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout {
                collection: op.collection.clone(),
                elapsed: self.timeout,
            }),
        }
    }
}

/// Pool of workers persisting [`WriteOp`]s, one session per worker.
pub struct Writer<S> {
    queue: WorkQueue<WriteOp>,
    inner: Arc<WriterInner<S>>,
}

impl<S: DocumentStore> Writer<S> {
    pub fn new(
        store: S,
        timeout: Duration,
        metrics: SharedMetrics,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            queue: WorkQueue::new("writer", cancel),
            inner: Arc::new(WriterInner {
                store,
                timeout,
                metrics,
            }),
        }
    }
}

#[async_trait]
impl<S: DocumentStore> PipelineStage<WriteOp> for Writer<S> {
    async fn submit(&self, op: WriteOp) -> Result<(), PipelineError> {
        self.queue.submit(op).await
    }

    fn start(&self) {
        let inner = Arc::clone(&self.inner);
        self.queue.spawn(move |worker| async move {
            let mut session = match inner.store.session().await {
                Ok(session) => session,
                Err(e) => {
                    PipelineMetrics::inc(&inner.metrics.session_failures);
                    error!("writer: worker could not check out a session: {}", e);
                    worker.abandon();
                    return;
                }
            };
            while let Some(op) = worker.recv().await {
                match inner.write(&mut session, &op).await {
                    Ok(()) => {
                        PipelineMetrics::inc(&inner.metrics.writes_completed);
                        trace!("writer: upserted into {}", op.collection);
                    }
                    Err(e) => {
                        PipelineMetrics::inc(&inner.metrics.write_failures);
                        warn!("writer: upsert into {} failed: {}", op.collection, e);
                    }
                }
            }
        });
    }

    async fn shutdown(&self) -> Result<(), PipelineError> {
        self.queue.close_and_drain().await?;
        info!("writer: all records flushed");
        Ok(())
    }
}
