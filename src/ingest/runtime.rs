//! Bounded worker pool for concurrent ingestion.
//!
//! The ledger sink can hand events to an [`IngestRuntime`] instead of calling
//! [`IngestionPipeline::ingest`] inline. Submission never blocks: a full queue
//! is reported as a retryable error so the sink can apply backpressure.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::error::{PolarisResult, RuntimeError};

use super::{AnchoredEvent, IngestOutcome, IngestionPipeline};

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct IngestRuntimeConfig {
    /// Number of worker threads.
    pub workers: usize,
    /// Maximum queued events.
    pub queue_capacity: usize,
}

impl Default for IngestRuntimeConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
        }
    }
}

enum Job {
    Ingest {
        event: Box<AnchoredEvent>,
        reply: Sender<PolarisResult<IngestOutcome>>,
    },

    #[cfg(test)]
    Sleep {
        duration: Duration,
        reply: Sender<()>,
    },
}

struct WorkerPool {
    tx: Sender<Job>,
    workers: Vec<JoinHandle<()>>,
    queue_capacity: usize,
}

impl WorkerPool {
    fn start(
        workers: usize,
        queue_capacity: usize,
        pipeline: &Arc<IngestionPipeline>,
    ) -> Result<Self, RuntimeError> {
        let workers = workers.max(1);
        let queue_capacity = queue_capacity.max(1);
        let (tx, rx) = bounded::<Job>(queue_capacity);

        let mut pool = Self {
            tx,
            workers: Vec::with_capacity(workers),
            queue_capacity,
        };
        for idx in 0..workers {
            let rx: Receiver<Job> = rx.clone();
            let pipeline = Arc::clone(pipeline);
            let spawned = thread::Builder::new()
                .name(format!("polaris-ingest-{idx}"))
                .spawn(move || loop {
                    match rx.recv() {
                        Ok(Job::Ingest { event, reply }) => {
                            let _ = reply.send(pipeline.ingest(&event));
                        }
                        Err(_) => break,

                        #[cfg(test)]
                        Ok(Job::Sleep { duration, reply }) => {
                            thread::sleep(duration);
                            let _ = reply.send(());
                        }
                    }
                });
            match spawned {
                Ok(handle) => pool.workers.push(handle),
                Err(e) => {
                    pool.shutdown();
                    return Err(RuntimeError::Spawn(e));
                }
            }
        }
        Ok(pool)
    }

    fn try_submit(&self, job: Job) -> Result<(), RuntimeError> {
        match self.tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(RuntimeError::QueueFull {
                capacity: self.queue_capacity,
            }),
            Err(TrySendError::Disconnected(_)) => Err(RuntimeError::Disconnected),
        }
    }

    fn shutdown(self) {
        // Closing the channel lets workers drain queued jobs, then exit.
        drop(self.tx);
        for handle in self.workers {
            let _ = handle.join();
        }
    }
}

/// Handle returned by [`IngestRuntime::submit`].
#[derive(Debug)]
pub struct IngestHandle {
    event_hash: String,
    rx: Receiver<PolarisResult<IngestOutcome>>,
}

impl IngestHandle {
    /// Hash of the submitted event.
    #[must_use]
    pub fn event_hash(&self) -> &str {
        &self.event_hash
    }

    /// Waits for the event to be ingested.
    ///
    /// # Errors
    /// The ingest error, or `Disconnected` if the worker went away.
    pub fn join(self) -> PolarisResult<IngestOutcome> {
        self.rx.recv().map_err(|_| RuntimeError::Disconnected)?
    }

    /// Waits at most `timeout` for the event to be ingested.
    ///
    /// # Errors
    /// The ingest error, `Timeout`, or `Disconnected`.
    pub fn join_timeout(self, timeout: Duration) -> PolarisResult<IngestOutcome> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => RuntimeError::Timeout {
                duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            },
            RecvTimeoutError::Disconnected => RuntimeError::Disconnected,
        })?
    }
}

/// Worker pool feeding one shared [`IngestionPipeline`].
pub struct IngestRuntime {
    pipeline: Arc<IngestionPipeline>,
    pool: WorkerPool,
}

impl IngestRuntime {
    /// Starts the worker threads.
    ///
    /// # Errors
    /// `Spawn` if a worker thread cannot be created.
    pub fn start(pipeline: Arc<IngestionPipeline>, config: &IngestRuntimeConfig) -> Result<Self, RuntimeError> {
        let pool = WorkerPool::start(config.workers, config.queue_capacity, &pipeline)?;
        tracing::info!(
            workers = pool.workers.len(),
            queue_capacity = pool.queue_capacity,
            "ingest runtime started"
        );
        Ok(Self { pipeline, pool })
    }

    /// Queues an event without blocking.
    ///
    /// # Errors
    /// `QueueFull` (retryable) or `Disconnected`.
    pub fn submit(&self, event: AnchoredEvent) -> Result<IngestHandle, RuntimeError> {
        let (tx, rx) = bounded(1);
        let event_hash = event.content_hash.clone();
        self.pool.try_submit(Job::Ingest {
            event: Box::new(event),
            reply: tx,
        })?;
        Ok(IngestHandle { event_hash, rx })
    }

    /// Queues an event and waits for its outcome.
    ///
    /// # Errors
    /// See [`IngestRuntime::submit`] and [`IngestHandle::join`].
    pub fn ingest(&self, event: AnchoredEvent) -> PolarisResult<IngestOutcome> {
        self.submit(event)?.join()
    }

    /// The shared pipeline.
    #[must_use]
    pub fn pipeline(&self) -> &IngestionPipeline {
        &self.pipeline
    }

    #[cfg(test)]
    fn submit_sleep(&self, duration: Duration) -> Result<Receiver<()>, RuntimeError> {
        let (tx, rx) = bounded::<()>(1);
        self.pool.try_submit(Job::Sleep { duration, reply: tx })?;
        Ok(rx)
    }
}

impl Drop for IngestRuntime {
    fn drop(&mut self) {
        let pool = std::mem::replace(
            &mut self.pool,
            WorkerPool {
                tx: bounded::<Job>(1).0,
                workers: Vec::new(),
                queue_capacity: 1,
            },
        );
        pool.shutdown();
        tracing::debug!("ingest runtime stopped");
    }
}
