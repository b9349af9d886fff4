//! A fixed-size pool of workers draining a [`MemoryQueue`].

use std::sync::Arc;

use provisor_config::WorkerSection;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::queue::MemoryQueue;
use crate::retry::RetryPolicy;
use crate::task::{TaskRecord, TaskState};
use crate::worker::TaskWorker;

/// Default number of concurrent workers.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Runs `concurrency` workers against one queue and applies the retry policy.
///
/// Tasks for the same service are not serialized. A provision and a
/// terminate for one service may run at the same time.
#[derive(Debug)]
pub struct WorkerPool {
    worker: Arc<TaskWorker>,
    queue: Arc<MemoryQueue>,
    policy: RetryPolicy,
    concurrency: usize,
}

impl WorkerPool {
    /// Create a pool with [`DEFAULT_CONCURRENCY`] workers.
    #[must_use]
    pub fn new(worker: Arc<TaskWorker>, queue: Arc<MemoryQueue>, policy: RetryPolicy) -> Self {
        Self {
            worker,
            queue,
            policy,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    /// Create a pool sized and paced by the `[worker]` config section.
    #[must_use]
    pub fn from_config(
        worker: Arc<TaskWorker>,
        queue: Arc<MemoryQueue>,
        section: &WorkerSection,
    ) -> Self {
        Self::new(worker, queue, RetryPolicy::from(section)).with_concurrency(section.concurrency)
    }

    /// Set the number of workers. Clamped to at least one.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Number of workers `run` starts.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// The retry policy applied to retryable failures.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Cancellation stops workers from taking new tasks and aborts in-flight
    /// provider calls, which then fail and are scheduled for retry.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(concurrency = self.concurrency, "Worker pool started");
        let mut workers = JoinSet::new();
        for index in 0..self.concurrency {
            let worker = Arc::clone(&self.worker);
            let queue = Arc::clone(&self.queue);
            let policy = self.policy.clone();
            let shutdown = shutdown.clone();
            workers.spawn(async move {
                while let Some(record) = queue.next(&shutdown).await {
                    execute(&worker, &queue, &policy, record, &shutdown).await;
                }
                debug!(worker = index, "Worker stopped");
            });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker task panicked");
            }
        }
        info!("Worker pool stopped");
    }
}

async fn execute(
    worker: &TaskWorker,
    queue: &MemoryQueue,
    policy: &RetryPolicy,
    mut record: TaskRecord,
    shutdown: &CancellationToken,
) {
    advance(&mut record, TaskState::Running);
    debug!(
        task_id = %record.id,
        service_id = record.task.service_id,
        attempt = record.retry_count,
        "Processing task"
    );

    let Err(e) = worker.process_task(&record.task, shutdown).await else {
        advance(&mut record, TaskState::Succeeded);
        queue.complete(record).await;
        return;
    };

    record.last_error = Some(e.to_string());
    if !e.is_retryable() {
        advance(&mut record, TaskState::FailedTerminal);
        queue.complete(record).await;
        return;
    }

    advance(&mut record, TaskState::FailedRetryable);
    if policy.should_retry(record.retry_count) {
        let delay = policy.delay(record.retry_count);
        record.retry_count = record.retry_count.saturating_add(1);
        advance(&mut record, TaskState::Pending);
        queue.retry_later(record, delay).await;
    } else {
        advance(&mut record, TaskState::Dead);
        error!(
            task_id = %record.id,
            service_id = record.task.service_id,
            retries = record.retry_count,
            error = %e,
            "Task exhausted its retries and needs operator attention"
        );
        queue.bury(record).await;
    }
}

fn advance(record: &mut TaskRecord, next: TaskState) {
    if let Err(e) = record.transition(next) {
        warn!(task_id = %record.id, error = %e, "Ignoring invalid task transition");
    }
}
