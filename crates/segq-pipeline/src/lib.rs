use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use metrics::{counter, gauge, histogram};
use segq_concurrent::AsyncQueue;
use segq_core::{ConfigError, PipelineConfig};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Receives batches drained from the queue.
#[async_trait]
pub trait BatchHandler<T: Send>: Send + Sync {
    async fn handle(&self, batch: Vec<T>) -> Result<()>;
}

#[async_trait]
impl<T, F, Fut> BatchHandler<T> for F
where
    T: Send + 'static,
    F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, batch: Vec<T>) -> Result<()> {
        (self)(batch).await
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid pipeline configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Processor task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// What a processor did before it shut down.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorReport {
    pub batches: u64,
    pub items: u64,
    /// Batches whose handler returned an error. Their items are not retried.
    pub failed_batches: u64,
}

impl ProcessorReport {
    fn merge(mut self, other: ProcessorReport) -> Self {
        self.batches += other.batches;
        self.items += other.items;
        self.failed_batches += other.failed_batches;
        self
    }
}

/// Drains an [`AsyncQueue`] in batches of at most `batch_size` items, flushing
/// a partial batch once `batch_timeout_ms` passes without filling it.
pub struct QueueProcessor<T, H> {
    queue: Arc<AsyncQueue<T>>,
    config: PipelineConfig,
    handler: Arc<H>,
}

impl<T, H> QueueProcessor<T, H>
where
    T: Send + 'static,
    H: BatchHandler<T>,
{
    pub fn new(
        queue: Arc<AsyncQueue<T>>,
        config: PipelineConfig,
        handler: Arc<H>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            queue,
            config,
            handler,
        })
    }

    /// Process batches until `shutdown` fires. The batch being collected at
    /// that moment is still handed to the handler; items left in the queue stay there.
    pub async fn run(&self, shutdown: CancellationToken) -> ProcessorReport {
        let batches = self
            .queue
            .stream_until(shutdown)
            .chunks_timeout(self.config.batch_size, self.config.batch_timeout());
        tokio::pin!(batches);

        let mut report = ProcessorReport::default();
        while let Some(batch) = batches.next().await {
            let start_time = Instant::now();
            let size = batch.len();
            debug!("Processing batch of size: {}", size);

            if let Err(e) = self.handler.handle(batch).await {
                error!("Batch handler failed on {} items: {:#}", size, e);
                report.failed_batches += 1;
            }

            report.batches += 1;
            report.items += size as u64;
            counter!("segq_pipeline_batches").increment(1);
            counter!("segq_pipeline_items").increment(size as u64);
            histogram!("segq_pipeline_batch_seconds").record(start_time.elapsed());
            gauge!("segq_queue_depth").set(self.queue.count() as f64);
        }

        info!(
            batches = report.batches,
            items = report.items,
            "Queue processor stopped"
        );
        report
    }
}

/// Handles to processors started by [`spawn_processors`].
pub struct ProcessorPool {
    handles: Vec<JoinHandle<ProcessorReport>>,
}

impl ProcessorPool {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every processor and sum their reports.
    pub async fn join(self) -> Result<ProcessorReport, PipelineError> {
        let mut total = ProcessorReport::default();
        for outcome in join_all(self.handles).await {
            total = total.merge(outcome?);
        }
        Ok(total)
    }
}

/// Spawn `config.consumers` processors sharing `queue` and `handler` on the
/// current tokio runtime.
pub fn spawn_processors<T, H>(
    queue: Arc<AsyncQueue<T>>,
    config: PipelineConfig,
    handler: Arc<H>,
    shutdown: CancellationToken,
) -> Result<ProcessorPool, PipelineError>
where
    T: Send + 'static,
    H: BatchHandler<T> + 'static,
{
    config.validate()?;
    let handles = (0..config.consumers)
        .map(|_| {
            let processor = QueueProcessor::new(queue.clone(), config.clone(), handler.clone())?;
            let shutdown = shutdown.clone();
            Ok(tokio::spawn(async move { processor.run(shutdown).await }))
        })
        .collect::<Result<Vec<_>, PipelineError>>()?;
    info!("Spawned {} queue processors", handles.len());
    Ok(ProcessorPool { handles })
}
