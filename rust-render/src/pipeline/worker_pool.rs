//! Worker pool that drives render jobs from the queue.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::job_queue::{ClaimedJob, Job, JobQueue};
use crate::artifact::ArtifactReference;
use crate::{Error, Result};

/// How often a running job's store status is checked.
const REMOTE_CANCEL_CHECK: Duration = Duration::from_secs(1);

/// Configuration for a worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Maximum concurrent render jobs.
    pub max_workers: usize,
    /// Job timeout in seconds.
    ///
    /// A job exceeding this is cancelled and recorded as a failed attempt.
    pub job_timeout_secs: u64,
    /// Poll interval in milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 2,
            job_timeout_secs: 3600,
            poll_interval_ms: 250,
        }
    }
}

/// Executes one claimed job.
///
/// Implementations must return promptly once `cancel` fires, and must leave
/// no subprocess or workspace behind on any return path.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job, cancel: CancellationToken) -> Result<ArtifactReference>;

    /// Drop an artifact the queue refused to record, e.g. because the job
    /// was cancelled while it was being finished.
    async fn discard(&self, _artifact: &ArtifactReference) -> Result<()> {
        Ok(())
    }
}

/// A pool of workers competing for jobs on one [`JobQueue`].
pub struct WorkerPool {
    config: WorkerPoolConfig,
    /// Semaphore for concurrency control.
    semaphore: Arc<Semaphore>,
    /// Workers currently running a job.
    active_workers: Arc<AtomicUsize>,
    cancellation_token: CancellationToken,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_workers.max(1))),
            config,
            active_workers: Arc::new(AtomicUsize::new(0)),
            cancellation_token: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
        }
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    /// Spawn the workers.
    pub fn start(&self, job_queue: Arc<JobQueue>, handler: Arc<dyn JobHandler>) {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms.max(1));
        let job_timeout = Duration::from_secs(self.config.job_timeout_secs);

        info!("Starting render worker pool with {} max workers", self.config.max_workers);

        let mut tasks = self.tasks.lock();
        let Some(join_set) = tasks.as_mut() else {
            warn!("Worker pool already stopped; not starting");
            return;
        };
        if !join_set.is_empty() {
            debug!("Worker pool already running");
            return;
        }

        for i in 0..self.config.max_workers.max(1) {
            let worker = Worker {
                index: i,
                queue: job_queue.clone(),
                handler: handler.clone(),
                semaphore: self.semaphore.clone(),
                active: self.active_workers.clone(),
                shutdown: self.cancellation_token.clone(),
                poll_interval,
                job_timeout,
            };
            join_set.spawn(worker.run());
        }
    }

    /// Stop the pool and wait for every worker to exit.
    ///
    /// Jobs still running are interrupted and returned to the queue.
    pub async fn stop(&self) {
        info!("Stopping render worker pool");
        self.cancellation_token.cancel();

        let join_set = {
            let mut tasks = self.tasks.lock();
            tasks.take()
        };

        if let Some(mut join_set) = join_set {
            while join_set.join_next().await.is_some() {}
        }

        info!("Render worker pool stopped");
    }

    /// Number of workers currently running a job.
    pub fn active_count(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        !self.cancellation_token.is_cancelled()
    }
}

struct Worker {
    index: usize,
    queue: Arc<JobQueue>,
    handler: Arc<dyn JobHandler>,
    semaphore: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    shutdown: CancellationToken,
    poll_interval: Duration,
    job_timeout: Duration,
}

impl Worker {
    async fn run(self) {
        debug!("Render worker {} started", self.index);
        let notifier = self.queue.notifier();

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let permit = match self.semaphore.clone().try_acquire_owned() {
                Ok(p) => p,
                Err(_) => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => continue,
                    }
                }
            };

            let claimed = match self.queue.dequeue().await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = notifier.notified() => {}
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                    continue;
                }
                Err(e) => {
                    error!("Error dequeuing job: {}", e);
                    drop(permit);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                    continue;
                }
            };

            self.active.fetch_add(1, Ordering::SeqCst);
            self.process(claimed).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            drop(permit);
        }

        debug!("Render worker {} shutting down", self.index);
    }

    async fn process(&self, claimed: ClaimedJob) {
        let ClaimedJob { job, cancel } = claimed;
        debug!(
            "Render worker {} processing job {} ({}), attempt {}/{}",
            self.index, job.id, job.name, job.attempts_made, job.max_attempts
        );

        let watcher = tokio::spawn(watch_remote_cancel(self.queue.clone(), job.id.clone(), cancel.clone()));
        let outcome = tokio::select! {
            result = tokio::time::timeout(self.job_timeout, self.handler.handle(&job, cancel.clone())) => {
                match result {
                    Ok(result) => result,
                    Err(_) => {
                        cancel.cancel();
                        Err(Error::Timeout(format!(
                            "job exceeded {}s",
                            self.job_timeout.as_secs()
                        )))
                    }
                }
            }
            _ = self.shutdown.cancelled() => {
                cancel.cancel();
                warn!(job_id = %job.id, "Worker stopping, returning job to the queue");
                watcher.abort();
                if let Err(e) = self.queue.release(&job).await {
                    error!(job_id = %job.id, "Failed to release job: {}", e);
                }
                return;
            }
        };
        watcher.abort();

        let recorded = match outcome {
            Ok(artifact) => match self.queue.complete(&job.id, &artifact).await {
                Err(Error::InvalidStateTransition { from, .. }) => {
                    info!(job_id = %job.id, status = %from, "Job ended before completion was recorded, discarding artifact");
                    self.handler.discard(&artifact).await
                }
                other => other,
            },
            Err(e) => self.queue.fail(&job, &e).await.map(|_| ()),
        };
        if let Err(e) = recorded {
            error!(job_id = %job.id, "Failed to record job outcome: {}", e);
        }
    }
}

/// Fire `cancel` once the store no longer records the job as active, which
/// is how a cancel issued by another process reaches this worker.
async fn watch_remote_cancel(queue: Arc<JobQueue>, job_id: String, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(REMOTE_CANCEL_CHECK) => {}
        }
        match queue.is_still_active(&job_id).await {
            Ok(true) => {}
            Ok(false) => {
                info!(job_id = %job_id, "Job no longer active in store, cancelling run");
                cancel.cancel();
                return;
            }
            Err(e) => debug!(job_id = %job_id, "Status check failed: {}", e),
        }
    }
}
