//! Task executor - applies queued tasks to the object store.
//!
//! One executor subscribes to the task queue and runs remote operations on a
//! bounded pool, separate from change detection so slow network calls never stall
//! scanning. Each attempt runs under the operation timeout; failed attempts are
//! retried with linear backoff and the task resolves `Failed` after the last one.

use crate::cloud::ObjectStore;
use crate::config::EngineConfig;
use crate::queue::{Claim, Subscription, Task, TaskKind, TaskOutcome, TaskQueue};
use crate::utils::errors::{Result, SyncError};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub timeout: Duration,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            timeout: config.operation_timeout(),
            backoff: config.retry_backoff(),
        }
    }
}

/// Handle on the running executor loop
pub struct TaskExecutor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl TaskExecutor {
    /// Subscribe to `queue` and start executing. The subscription is in place when
    /// this returns, so no task sent afterwards is missed.
    pub fn spawn(queue: Arc<TaskQueue>, objects: Arc<dyn ObjectStore>, config: &EngineConfig) -> Self {
        let subscription = queue.subscribe();
        let cancel = CancellationToken::new();
        let worker = Worker {
            queue,
            objects,
            permits: Arc::new(Semaphore::new(config.upload_workers.max(1))),
            policy: RetryPolicy::from_config(config),
        };

        info!(
            provider = worker.objects.provider(),
            workers = config.upload_workers,
            "Task executor started"
        );
        let handle = tokio::spawn(worker.run(subscription, cancel.clone()));
        Self { cancel, handle }
    }

    /// Stop taking new tasks and wait up to `grace` for running operations.
    /// Tasks that were never started resolve `Abandoned`.
    pub async fn shutdown(self, grace: Duration) {
        self.cancel.cancel();
        match tokio::time::timeout(grace, self.handle).await {
            Ok(Ok(())) => info!("Task executor stopped"),
            Ok(Err(e)) => error!("Task executor panicked: {}", e),
            Err(_) => warn!("Task executor did not drain within {:?}", grace),
        }
    }
}

struct Worker {
    queue: Arc<TaskQueue>,
    objects: Arc<dyn ObjectStore>,
    permits: Arc<Semaphore>,
    policy: RetryPolicy,
}

impl Worker {
    async fn run(self, mut subscription: Subscription, cancel: CancellationToken) {
        let mut running = JoinSet::new();

        loop {
            let task = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = subscription.recv() => match next {
                    Some(task) => task,
                    None => break,
                },
            };

            // Still `Queued` while waiting for a permit; `close` abandons it if we stop here.
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let claim = self.queue.claim(&task);

            let objects = Arc::clone(&self.objects);
            let policy = self.policy;
            running.spawn(async move {
                let _permit = permit;
                execute(objects.as_ref(), task, claim, &policy).await;
            });

            while let Some(done) = running.try_join_next() {
                if let Err(e) = done {
                    error!("Task worker panicked: {}", e);
                }
            }
        }

        while let Some(done) = running.join_next().await {
            if let Err(e) = done {
                error!("Task worker panicked: {}", e);
            }
        }

        let abandoned = self.queue.close();
        if abandoned > 0 {
            warn!(abandoned, "Unstarted tasks abandoned at shutdown");
        }
    }
}

async fn execute(objects: &dyn ObjectStore, task: Task, claim: Claim, policy: &RetryPolicy) {
    let mut last_error = String::new();

    for attempt in 1..=policy.max_attempts {
        let result = match tokio::time::timeout(policy.timeout, apply(objects, &task)).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(policy.timeout)),
        };

        match result {
            Ok(()) => {
                debug!(task = %task, attempt, "Remote operation succeeded");
                claim.finish(TaskOutcome::Succeeded);
                return;
            }
            Err(e) => {
                warn!(task = %task, attempt, error = %e, "Remote operation failed");
                last_error = e.to_string();
                // The local file vanished; retrying cannot help.
                if is_missing_source(&e) {
                    break;
                }
            }
        }

        if attempt < policy.max_attempts {
            tokio::time::sleep(policy.backoff * attempt).await;
        }
    }

    error!(task = %task, error = %last_error, "Task failed, leaving it for the next sweep");
    claim.finish(TaskOutcome::Failed(last_error));
}

async fn apply(objects: &dyn ObjectStore, task: &Task) -> Result<()> {
    match task.kind() {
        TaskKind::Upload | TaskKind::Replace => {
            objects.put(task.container(), task.key(), task.path()).await
        }
        TaskKind::Delete => objects.delete(task.container(), task.key()).await,
    }
}

fn is_missing_source(e: &SyncError) -> bool {
    matches!(e, SyncError::Io(err) if err.kind() == io::ErrorKind::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::testing::{Op, RecordingStore};
    use crate::cloud::Container;
    use crate::queue::TaskStatus;
    use std::path::Path;
    use tempfile::TempDir;

    fn config(max_attempts: u32, timeout_secs: u64) -> EngineConfig {
        EngineConfig {
            max_attempts,
            operation_timeout_secs: timeout_secs,
            retry_backoff_ms: 1,
            ..EngineConfig::default()
        }
    }

    fn upload(path: &Path) -> Task {
        let container = Arc::new(Container::new("docs", "docs"));
        Task::new(TaskKind::Upload, "docs", container, path.to_path_buf(), "docs/a.txt".into())
    }

    #[tokio::test]
    async fn test_upload_succeeds() -> Result<()> {
        let temp = TempDir::new()?;
        let file = temp.path().join("a.txt");
        std::fs::write(&file, b"hello")?;

        let queue = TaskQueue::new();
        let objects = RecordingStore::new();
        let executor = TaskExecutor::spawn(Arc::clone(&queue), objects.clone(), &config(3, 5));

        let outcome = queue.send(upload(&file)).outcome().await;
        assert_eq!(outcome, TaskOutcome::Succeeded);
        assert_eq!(objects.object("docs/a.txt").as_deref(), Some(&b"hello"[..]));

        executor.shutdown(Duration::from_secs(5)).await;
        Ok(())
    }

    #[tokio::test]
    async fn test_failure_is_retried_then_reported() -> Result<()> {
        let temp = TempDir::new()?;
        let file = temp.path().join("a.txt");
        std::fs::write(&file, b"hello")?;

        let queue = TaskQueue::new();
        let objects = RecordingStore::new();
        objects.set_failing(true);
        let executor = TaskExecutor::spawn(Arc::clone(&queue), objects.clone(), &config(3, 5));

        let outcome = queue.send(upload(&file)).outcome().await;
        assert!(matches!(outcome, TaskOutcome::Failed(_)));
        assert_eq!(objects.ops().len(), 3);
        assert_eq!(queue.stats().failed, 1);

        executor.shutdown(Duration::from_secs(5)).await;
        Ok(())
    }

    #[tokio::test]
    async fn test_slow_operation_times_out() -> Result<()> {
        let temp = TempDir::new()?;
        let file = temp.path().join("a.txt");
        std::fs::write(&file, b"hello")?;

        let queue = TaskQueue::new();
        let objects = RecordingStore::slow(Duration::from_secs(30));
        let executor = TaskExecutor::spawn(Arc::clone(&queue), objects.clone(), &config(1, 0));

        match queue.send(upload(&file)).outcome().await {
            TaskOutcome::Failed(message) => assert!(message.contains("timed out")),
            other => panic!("unexpected outcome {other:?}"),
        }

        executor.shutdown(Duration::from_secs(5)).await;
        Ok(())
    }

    #[tokio::test]
    async fn test_ticket_resolves_only_after_remote_completes() -> Result<()> {
        let temp = TempDir::new()?;
        let file = temp.path().join("a.txt");
        std::fs::write(&file, b"hello")?;

        let queue = TaskQueue::new();
        let (objects, gate) = RecordingStore::gated();
        let executor = TaskExecutor::spawn(Arc::clone(&queue), objects.clone(), &config(1, 5));

        let ticket = queue.send(upload(&file));
        let id = ticket.id();
        while objects.ops().is_empty() {
            tokio::task::yield_now().await;
        }
        assert_eq!(queue.status(id), Some(TaskStatus::InProgress));

        gate.add_permits(1);
        assert_eq!(ticket.outcome().await, TaskOutcome::Succeeded);
        assert_eq!(queue.status(id), None);

        executor.shutdown(Duration::from_secs(5)).await;
        Ok(())
    }

    #[tokio::test]
    async fn test_task_waiting_for_worker_stays_queued() -> Result<()> {
        let temp = TempDir::new()?;
        let file = temp.path().join("a.txt");
        std::fs::write(&file, b"hello")?;

        let queue = TaskQueue::new();
        let (objects, gate) = RecordingStore::gated();
        let single = EngineConfig {
            upload_workers: 1,
            ..config(1, 5)
        };
        let executor = TaskExecutor::spawn(Arc::clone(&queue), objects.clone(), &single);

        let first = queue.send(upload(&file));
        let second = queue.send(upload(&file));
        while objects.ops().is_empty() {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.status(first.id()), Some(TaskStatus::InProgress));
        assert_eq!(queue.status(second.id()), Some(TaskStatus::Queued));

        gate.add_permits(2);
        assert_eq!(first.outcome().await, TaskOutcome::Succeeded);
        assert_eq!(second.outcome().await, TaskOutcome::Succeeded);

        executor.shutdown(Duration::from_secs(5)).await;
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_of_missing_object_succeeds() -> Result<()> {
        let queue = TaskQueue::new();
        let objects = RecordingStore::new();
        let executor = TaskExecutor::spawn(Arc::clone(&queue), objects.clone(), &config(1, 5));

        let container = Arc::new(Container::new("docs", "docs"));
        let task = Task::new(TaskKind::Delete, "docs", container, "/data/docs/a.txt".into(), "docs/a.txt".into());
        assert_eq!(queue.send(task).outcome().await, TaskOutcome::Succeeded);
        assert_eq!(objects.ops(), vec![(Op::Delete, "docs/a.txt".to_string())]);

        executor.shutdown(Duration::from_secs(5)).await;
        Ok(())
    }

    #[tokio::test]
    async fn test_shutdown_closes_queue() {
        let queue = TaskQueue::new();
        let executor = TaskExecutor::spawn(Arc::clone(&queue), RecordingStore::new(), &config(1, 5));
        executor.shutdown(Duration::from_secs(5)).await;

        let outcome = queue.send(upload(Path::new("/data/docs/a.txt"))).outcome().await;
        assert_eq!(outcome, TaskOutcome::Undelivered);
    }
}
