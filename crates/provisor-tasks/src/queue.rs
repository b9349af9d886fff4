//! Task enqueue API and an in-process delayed queue.

use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::error::TaskResult;
use crate::task::{ProvisioningTask, TaskRecord};

/// Accepts provisioning tasks from the order and billing side.
#[async_trait]
pub trait TaskEnqueuer: Send + Sync {
    /// Enqueue `task` for immediate processing. Returns the task id.
    async fn enqueue(&self, task: ProvisioningTask) -> TaskResult<Uuid>;
}

/// Default number of finished records kept by a [`MemoryQueue`].
pub const DEFAULT_FINISHED_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<TaskRecord>,
    delayed: Vec<(Instant, TaskRecord)>,
    finished: VecDeque<TaskRecord>,
    dead: Vec<TaskRecord>,
}

impl QueueState {
    /// Move every delayed record whose time has come to the ready list.
    fn promote(&mut self, now: Instant) {
        let mut i = 0;
        while i < self.delayed.len() {
            if self.delayed[i].0 <= now {
                let (_, record) = self.delayed.swap_remove(i);
                self.ready.push_back(record);
            } else {
                i = i.saturating_add(1);
            }
        }
    }

    fn next_wake(&self) -> Option<Instant> {
        self.delayed.iter().map(|(at, _)| *at).min()
    }
}

/// In-process queue with delayed retries and a dead-letter list.
///
/// Delivery is at-least-once within the process. Nothing is persisted.
/// Only the most recent finished records are kept. Dead letters are kept
/// until requeued, since each one needs an operator.
#[derive(Debug)]
pub struct MemoryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    finished_capacity: usize,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self {
            state: Mutex::default(),
            notify: Notify::new(),
            finished_capacity: DEFAULT_FINISHED_CAPACITY,
        }
    }
}

impl MemoryQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `capacity` finished records, dropping the oldest.
    #[must_use]
    pub fn with_finished_capacity(mut self, capacity: usize) -> Self {
        self.finished_capacity = capacity;
        self
    }

    /// Wait for the next ready task.
    ///
    /// Returns `None` once `shutdown` is cancelled.
    pub async fn next(&self, shutdown: &CancellationToken) -> Option<TaskRecord> {
        loop {
            let wake = {
                let mut state = self.state.lock().await;
                state.promote(Instant::now());
                if let Some(record) = state.ready.pop_front() {
                    // Wakeups collapse into one stored permit, so pass it on.
                    if !state.ready.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(record);
                }
                state.next_wake()
            };

            let sleep = async {
                match wake {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                () = shutdown.cancelled() => return None,
                () = self.notify.notified() => {},
                () = sleep => {},
            }
        }
    }

    /// Re-enqueue `record` after `delay`.
    pub async fn retry_later(&self, record: TaskRecord, delay: Duration) {
        debug!(task_id = %record.id, delay_ms = delay.as_millis(), "Scheduling retry");
        let at = Instant::now().checked_add(delay).unwrap_or_else(far_future);
        self.state.lock().await.delayed.push((at, record));
        self.notify.notify_one();
    }

    /// Record a task that reached `Succeeded` or `FailedTerminal`.
    pub async fn complete(&self, record: TaskRecord) {
        if self.finished_capacity == 0 {
            return;
        }
        let mut state = self.state.lock().await;
        while state.finished.len() >= self.finished_capacity {
            state.finished.pop_front();
        }
        state.finished.push_back(record);
    }

    /// Move a task whose retries are exhausted to the dead-letter list.
    pub async fn bury(&self, record: TaskRecord) {
        self.state.lock().await.dead.push(record);
    }

    /// The most recent tasks that finished, successfully or terminally,
    /// oldest first.
    pub async fn finished(&self) -> Vec<TaskRecord> {
        self.state.lock().await.finished.iter().cloned().collect()
    }

    /// Remove and return the finished records, oldest first.
    pub async fn drain_finished(&self) -> Vec<TaskRecord> {
        self.state.lock().await.finished.drain(..).collect()
    }

    /// Tasks that exhausted their retries.
    pub async fn dead_letters(&self) -> Vec<TaskRecord> {
        self.state.lock().await.dead.clone()
    }

    /// Tasks waiting to run, including delayed retries.
    pub async fn pending_len(&self) -> usize {
        let state = self.state.lock().await;
        state.ready.len().saturating_add(state.delayed.len())
    }

    /// Re-enqueue the payload of a dead task as a new task with a fresh
    /// retry budget. The dead record itself stays dead and is dropped from
    /// the dead-letter list.
    ///
    /// Returns the new task id, or `None` if no dead task has that id.
    pub async fn requeue_dead(&self, id: Uuid) -> Option<Uuid> {
        let mut state = self.state.lock().await;
        let pos = state.dead.iter().position(|r| r.id == id)?;
        let dead = state.dead.remove(pos);
        let record = TaskRecord::new(dead.task);
        let new_id = record.id;
        state.ready.push_back(record);
        drop(state);
        self.notify.notify_one();
        debug!(task_id = %id, new_task_id = %new_id, "Dead task requeued");
        Some(new_id)
    }
}

#[async_trait]
impl TaskEnqueuer for MemoryQueue {
    async fn enqueue(&self, task: ProvisioningTask) -> TaskResult<Uuid> {
        let record = TaskRecord::new(task);
        let id = record.id;
        debug!(task_id = %id, task_type = %task.kind, service_id = task.service_id, "Task enqueued");
        self.state.lock().await.ready.push_back(record);
        self.notify.notify_one();
        Ok(id)
    }
}

fn far_future() -> Instant {
    // Roughly thirty years.
    Instant::now()
        .checked_add(Duration::from_secs(946_080_000))
        .unwrap_or_else(Instant::now)
}
