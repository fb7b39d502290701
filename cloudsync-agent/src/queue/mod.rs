//! In-process task bus between change detection and remote execution.
//!
//! Publishers call [`TaskQueue::send`] and get a [`Ticket`] back; the ticket resolves
//! with the [`TaskOutcome`] reported by whichever consumer claims the task. Every
//! ticket resolves: a task nobody is subscribed to resolves `Undelivered`, and a
//! claimed task whose consumer goes away resolves `Abandoned`.
//!
//! Delivery is at-most-once per subscriber, in publish order for a single
//! publisher. Subscribers only see tasks sent after they subscribed.

mod task;

pub use task::{Task, TaskKind};

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

/// Final result of one task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The remote operation durably succeeded
    Succeeded,
    /// The remote operation failed after all attempts
    Failed(String),
    /// No subscriber was listening when the task was sent
    Undelivered,
    /// The consumer stopped before reporting a result
    Abandoned,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Succeeded)
    }
}

/// Lifecycle of an unresolved task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskStatus {
    Queued,
    InProgress,
}

/// Counters since the queue was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub published: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub undelivered: u64,
    pub abandoned: u64,
    pub in_flight: usize,
}

struct Pending {
    status: TaskStatus,
    reply: oneshot::Sender<TaskOutcome>,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    undelivered: AtomicU64,
    abandoned: AtomicU64,
}

/// Broadcast bus with per-task resolution tracking
#[derive(Default)]
pub struct TaskQueue {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Task>>>,
    pending: DashMap<Uuid, Pending>,
    counters: Counters,
}

impl TaskQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Publish `task` to every current subscriber
    pub fn send(&self, task: Task) -> Ticket {
        let (reply, rx) = oneshot::channel();
        let id = task.id();
        self.counters.published.fetch_add(1, Ordering::Relaxed);

        // Registered before delivery so a fast consumer can always resolve it.
        self.pending.insert(
            id,
            Pending {
                status: TaskStatus::Queued,
                reply,
            },
        );

        let delivered = {
            let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            subscribers.retain(|tx| tx.send(task.clone()).is_ok());
            subscribers.len()
        };

        if delivered == 0 {
            warn!(task = %task, "No task subscriber, task not delivered");
            self.settle(id, TaskOutcome::Undelivered);
        } else {
            debug!(task = %task, subscribers = delivered, "Task published");
        }

        Ticket { id, rx }
    }

    /// Receive every task published from now on
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        Subscription { rx }
    }

    /// Mark `task` in progress. The returned claim resolves the task as
    /// `Abandoned` if dropped without [`Claim::finish`].
    pub fn claim(self: &Arc<Self>, task: &Task) -> Claim {
        if let Some(mut pending) = self.pending.get_mut(&task.id()) {
            pending.status = TaskStatus::InProgress;
        }
        Claim {
            queue: Arc::clone(self),
            id: task.id(),
            finished: false,
        }
    }

    /// Status of a task that has not resolved yet
    pub fn status(&self, id: Uuid) -> Option<TaskStatus> {
        self.pending.get(&id).map(|p| p.status)
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            published: self.counters.published.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            undelivered: self.counters.undelivered.load(Ordering::Relaxed),
            abandoned: self.counters.abandoned.load(Ordering::Relaxed),
            in_flight: self.pending.len(),
        }
    }

    /// Drop all subscribers and resolve every task still waiting to be claimed.
    /// Returns how many tasks were abandoned.
    pub fn close(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();

        let queued: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|p| p.status == TaskStatus::Queued)
            .map(|p| *p.key())
            .collect();

        for id in &queued {
            self.settle(*id, TaskOutcome::Abandoned);
        }
        queued.len()
    }

    fn settle(&self, id: Uuid, outcome: TaskOutcome) {
        // First resolution wins; later reports for the same task are ignored.
        let Some((_, pending)) = self.pending.remove(&id) else {
            return;
        };

        let counter = match outcome {
            TaskOutcome::Succeeded => &self.counters.succeeded,
            TaskOutcome::Failed(_) => &self.counters.failed,
            TaskOutcome::Undelivered => &self.counters.undelivered,
            TaskOutcome::Abandoned => &self.counters.abandoned,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        // The publisher may have stopped waiting; that is fine.
        let _ = pending.reply.send(outcome);
    }
}

/// Receiving side of [`TaskQueue::subscribe`]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Task>,
}

impl Subscription {
    /// Next task, or `None` once the queue has been closed
    pub async fn recv(&mut self) -> Option<Task> {
        self.rx.recv().await
    }
}

/// Publisher's handle on a sent task
#[derive(Debug)]
pub struct Ticket {
    id: Uuid,
    rx: oneshot::Receiver<TaskOutcome>,
}

impl Ticket {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the task to resolve
    pub async fn outcome(self) -> TaskOutcome {
        self.rx.await.unwrap_or(TaskOutcome::Abandoned)
    }
}

/// A consumer's hold on one task
pub struct Claim {
    queue: Arc<TaskQueue>,
    id: Uuid,
    finished: bool,
}

impl Claim {
    /// Report the result of the remote operation
    pub fn finish(mut self, outcome: TaskOutcome) {
        self.finished = true;
        self.queue.settle(self.id, outcome);
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        if !self.finished {
            self.queue.settle(self.id, TaskOutcome::Abandoned);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::Container;
    use std::path::PathBuf;

    fn task(kind: TaskKind, name: &str) -> Task {
        let container = Arc::new(Container::new("docs", "docs"));
        Task::new(kind, "docs", container, PathBuf::from(format!("/data/docs/{name}")), format!("docs/{name}"))
    }

    #[tokio::test]
    async fn test_send_without_subscriber_is_undelivered() {
        let queue = TaskQueue::new();
        let ticket = queue.send(task(TaskKind::Upload, "a.txt"));

        assert_eq!(ticket.outcome().await, TaskOutcome::Undelivered);
        assert_eq!(queue.stats().undelivered, 1);
        assert_eq!(queue.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_in_publish_order() {
        let queue = TaskQueue::new();
        let mut sub = queue.subscribe();

        queue.send(task(TaskKind::Upload, "a"));
        queue.send(task(TaskKind::Replace, "b"));
        queue.send(task(TaskKind::Delete, "c"));

        let kinds = [
            sub.recv().await.unwrap().kind(),
            sub.recv().await.unwrap().kind(),
            sub.recv().await.unwrap().kind(),
        ];
        assert_eq!(kinds, [TaskKind::Upload, TaskKind::Replace, TaskKind::Delete]);
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_earlier_tasks() {
        let queue = TaskQueue::new();
        let mut early = queue.subscribe();
        queue.send(task(TaskKind::Upload, "first"));

        let mut late = queue.subscribe();
        queue.send(task(TaskKind::Upload, "second"));

        assert_eq!(early.recv().await.unwrap().key(), "docs/first");
        assert_eq!(early.recv().await.unwrap().key(), "docs/second");
        assert_eq!(late.recv().await.unwrap().key(), "docs/second");
    }

    #[tokio::test]
    async fn test_claim_and_finish_resolves_ticket() {
        let queue = TaskQueue::new();
        let mut sub = queue.subscribe();
        let ticket = queue.send(task(TaskKind::Upload, "a"));
        assert_eq!(queue.status(ticket.id()), Some(TaskStatus::Queued));

        let received = sub.recv().await.unwrap();
        let claim = queue.claim(&received);
        assert_eq!(queue.status(ticket.id()), Some(TaskStatus::InProgress));

        claim.finish(TaskOutcome::Failed("boom".into()));
        assert_eq!(ticket.outcome().await, TaskOutcome::Failed("boom".into()));

        let stats = queue.stats();
        assert_eq!((stats.published, stats.failed, stats.in_flight), (1, 1, 0));
    }

    #[tokio::test]
    async fn test_dropped_claim_is_abandoned() {
        let queue = TaskQueue::new();
        let mut sub = queue.subscribe();
        let ticket = queue.send(task(TaskKind::Delete, "a"));

        let received = sub.recv().await.unwrap();
        drop(queue.claim(&received));

        assert_eq!(ticket.outcome().await, TaskOutcome::Abandoned);
    }

    #[tokio::test]
    async fn test_close_abandons_queued_tasks() {
        let queue = TaskQueue::new();
        let _sub = queue.subscribe();
        let ticket = queue.send(task(TaskKind::Upload, "a"));

        assert_eq!(queue.close(), 1);
        assert_eq!(ticket.outcome().await, TaskOutcome::Abandoned);

        // With no subscribers left, new tasks are not delivered.
        let ticket = queue.send(task(TaskKind::Upload, "b"));
        assert_eq!(ticket.outcome().await, TaskOutcome::Undelivered);
    }
}
