//! Task queue and worker pool for send tasks.
//!
//! Business logic never touches queue mechanics: tasks are tagged
//! descriptions, retry policy is injected per task kind, and execution
//! goes through the `TaskExecutor` seam. Workers pull from one shared
//! channel, so tasks for different recipients interleave freely.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use outreach_core::config::QueueConfig;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// One unit of dispatch work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Task {
    /// Send one campaign message to one recipient and record the outcome.
    CampaignSend {
        campaign_id: Uuid,
        message_id: Uuid,
        session: String,
    },
    /// Run the current step of one contact's follow-up sequence.
    SequenceStep {
        contact_sequence_id: Uuid,
        session: String,
    },
}

impl Task {
    pub fn kind(&self) -> &'static str {
        match self {
            Task::CampaignSend { .. } => "campaign_send",
            Task::SequenceStep { .. } => "sequence_step",
        }
    }
}

/// Bounded-attempt retry with a fixed backoff schedule.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Vec<Duration>,
}

impl RetryPolicy {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: config
                .backoff_secs
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
        }
    }

    /// Delay before re-running a task that has failed `attempt` times.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let idx = attempt.saturating_sub(1) as usize;
        self.backoff
            .get(idx)
            .or_else(|| self.backoff.last())
            .copied()
            .unwrap_or(Duration::from_secs(5))
    }
}

/// Retry policies per task kind.
#[derive(Debug, Clone)]
pub struct TaskPolicies {
    pub campaign_send: RetryPolicy,
    pub sequence_step: RetryPolicy,
}

impl TaskPolicies {
    pub fn uniform(policy: RetryPolicy) -> Self {
        Self {
            campaign_send: policy.clone(),
            sequence_step: policy,
        }
    }

    fn for_task(&self, task: &Task) -> &RetryPolicy {
        match task {
            Task::CampaignSend { .. } => &self.campaign_send,
            Task::SequenceStep { .. } => &self.sequence_step,
        }
    }
}

/// Executes tasks pulled off the queue. Errors are retried per policy;
/// `on_exhausted` fires exactly once when the attempt budget runs out.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &Task) -> anyhow::Result<()>;

    async fn on_exhausted(&self, task: &Task, error: &anyhow::Error);
}

#[derive(Debug)]
struct QueuedTask {
    task: Task,
    attempt: u32,
}

/// Producer handle. Cheap to clone; every engine holds one.
#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::UnboundedSender<QueuedTask>,
}

/// Consumer side, handed to the worker pool once.
pub struct TaskReceiver {
    rx: mpsc::UnboundedReceiver<QueuedTask>,
}

impl TaskQueue {
    pub fn new() -> (Self, TaskReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, TaskReceiver { rx })
    }

    pub fn enqueue(&self, task: Task) {
        self.enqueue_attempt(task, 1, Duration::ZERO);
    }

    /// Enqueue after a delay — spacing offsets and sequence step waits.
    pub fn enqueue_after(&self, task: Task, delay: Duration) {
        self.enqueue_attempt(task, 1, delay);
    }

    fn enqueue_attempt(&self, task: Task, attempt: u32, delay: Duration) {
        metrics::counter!("queue.enqueued", "kind" => task.kind()).increment(1);
        let tx = self.tx.clone();
        if delay.is_zero() {
            let _ = tx.send(QueuedTask { task, attempt });
            return;
        }
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(QueuedTask { task, attempt });
        });
    }
}

/// Pool of independent workers draining the shared queue.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(
        workers: usize,
        receiver: TaskReceiver,
        queue: TaskQueue,
        executor: Arc<dyn TaskExecutor>,
        policies: TaskPolicies,
    ) -> Self {
        info!(workers, "Worker pool starting");
        let rx = Arc::new(tokio::sync::Mutex::new(receiver.rx));

        let handles = (0..workers.max(1))
            .map(|worker_id| {
                let rx = rx.clone();
                let queue = queue.clone();
                let executor = executor.clone();
                let policies = policies.clone();
                tokio::spawn(async move {
                    loop {
                        let queued = { rx.lock().await.recv().await };
                        let Some(queued) = queued else {
                            debug!(worker_id, "Task channel closed, worker exiting");
                            break;
                        };
                        run_one(&queue, executor.as_ref(), &policies, queued).await;
                    }
                })
            })
            .collect();

        Self { handles }
    }

    pub fn shutdown(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}

async fn run_one(
    queue: &TaskQueue,
    executor: &dyn TaskExecutor,
    policies: &TaskPolicies,
    queued: QueuedTask,
) {
    let QueuedTask { task, attempt } = queued;
    match executor.execute(&task).await {
        Ok(()) => {
            metrics::counter!("queue.completed", "kind" => task.kind()).increment(1);
        }
        Err(err) => {
            let policy = policies.for_task(&task);
            if attempt < policy.max_attempts {
                let delay = policy.backoff_for(attempt);
                warn!(
                    kind = task.kind(),
                    attempt,
                    max_attempts = policy.max_attempts,
                    backoff_secs = delay.as_secs(),
                    error = %err,
                    "Task failed, scheduling retry"
                );
                metrics::counter!("queue.retried", "kind" => task.kind()).increment(1);
                queue.enqueue_attempt(task, attempt + 1, delay);
            } else {
                error!(
                    kind = task.kind(),
                    attempt,
                    error = %err,
                    "Task permanently failed"
                );
                metrics::counter!("queue.exhausted", "kind" => task.kind()).increment(1);
                executor.on_exhausted(&task, &err).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingExecutor {
        attempts: AtomicU32,
        exhausted: AtomicU32,
        fail_first: u32,
    }

    impl CountingExecutor {
        fn new(fail_first: u32) -> Arc<Self> {
            Arc::new(Self {
                attempts: AtomicU32::new(0),
                exhausted: AtomicU32::new(0),
                fail_first,
            })
        }
    }

    #[async_trait]
    impl TaskExecutor for CountingExecutor {
        async fn execute(&self, _task: &Task) -> anyhow::Result<()> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(anyhow!("transient failure {n}"))
            } else {
                Ok(())
            }
        }

        async fn on_exhausted(&self, _task: &Task, _error: &anyhow::Error) {
            self.exhausted.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn sample_task() -> Task {
        Task::CampaignSend {
            campaign_id: Uuid::new_v4(),
            message_id: Uuid::new_v4(),
            session: "default".to_string(),
        }
    }

    fn policies() -> TaskPolicies {
        TaskPolicies::uniform(RetryPolicy {
            max_attempts: 3,
            backoff: vec![Duration::from_secs(5), Duration::from_secs(30)],
        })
    }

    async fn settle() {
        // Paused-clock time: each sleep auto-advances past pending timers,
        // covering backoff and delayed-enqueue schedules.
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_retries_until_success() {
        let (queue, receiver) = TaskQueue::new();
        let executor = CountingExecutor::new(2);
        let pool = WorkerPool::start(2, receiver, queue.clone(), executor.clone(), policies());

        queue.enqueue(sample_task());
        settle().await;

        assert_eq!(executor.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(executor.exhausted.load(Ordering::SeqCst), 0);
        pool.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_hook_fires_once() {
        let (queue, receiver) = TaskQueue::new();
        let executor = CountingExecutor::new(100);
        let pool = WorkerPool::start(2, receiver, queue.clone(), executor.clone(), policies());

        queue.enqueue(sample_task());
        settle().await;

        assert_eq!(executor.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(executor.exhausted.load(Ordering::SeqCst), 1);
        pool.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_enqueue_waits() {
        let (queue, receiver) = TaskQueue::new();
        let executor = CountingExecutor::new(0);
        let pool = WorkerPool::start(1, receiver, queue.clone(), executor.clone(), policies());

        queue.enqueue_after(sample_task(), Duration::from_secs(600));
        settle().await;

        assert_eq!(executor.attempts.load(Ordering::SeqCst), 1);
        pool.shutdown();
    }
}
