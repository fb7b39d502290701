//! Reconciliation engine.
//!
//! Decides, per file, whether the remote copy needs an upload, a replace or a
//! delete, emits the task, and mutates the metadata store only after the task
//! resolved successfully. Decide-and-apply is serialized per (backup, path).

mod locks;
mod sweep;

pub use locks::PathLocks;
pub use sweep::SweepReport;

use crate::cloud::{object_key, Container, ObjectStore};
use crate::config::EngineConfig;
use crate::fs::metadata::{probe, FileState, Probe};
use crate::fs::watcher::{DirWatcher, WatchEvent, WatchEventKind, WatchOptions};
use crate::model::{Backup, LocalRecord};
use crate::queue::{Task, TaskKind, TaskOutcome, TaskQueue};
use crate::store::MetadataStore;
use crate::utils::errors::{Result, SyncError};
use futures_util::stream::{self, StreamExt};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// What one check did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Record and file agree; nothing emitted
    Unchanged,
    /// The task succeeded and the record now reflects it
    Synced(TaskKind),
    /// The task did not succeed; the record was left as it was
    Failed(TaskKind, TaskOutcome),
    /// Directories, special files and paths that cannot be recorded
    Ignored,
    /// The path is gone and never had a record
    Untracked,
}

/// Runtime state of one backup. Never persisted.
pub struct BackupContext {
    backup: Backup,
    container: Arc<Container>,
    resweep_pending: AtomicBool,
    sweeps: AtomicUsize,
    sweep_lock: Mutex<()>,
}

impl BackupContext {
    pub fn new(backup: Backup, container: Container) -> Arc<Self> {
        Arc::new(Self {
            backup,
            container: Arc::new(container),
            resweep_pending: AtomicBool::new(false),
            sweeps: AtomicUsize::new(0),
            sweep_lock: Mutex::new(()),
        })
    }

    pub fn backup(&self) -> &Backup {
        &self.backup
    }

    pub fn container(&self) -> &Container {
        &self.container
    }
}

pub struct ReconciliationEngine {
    store: Arc<dyn MetadataStore>,
    objects: Arc<dyn ObjectStore>,
    queue: Arc<TaskQueue>,
    config: EngineConfig,
    scan_permits: Semaphore,
    locks: PathLocks,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        objects: Arc<dyn ObjectStore>,
        queue: Arc<TaskQueue>,
        config: EngineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            objects,
            queue,
            scan_permits: Semaphore::new(config.scan_workers.max(1)),
            config,
            locks: PathLocks::new(),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Provision the backup's container, optionally start watching its tree,
    /// then run the startup sweep.
    ///
    /// Any error here disables this backup only.
    pub async fn start_backup(self: &Arc<Self>, backup: Backup, watch: bool) -> Result<(Arc<BackupContext>, SweepReport)> {
        let container = match self.objects.create_container(&backup).await {
            Ok(container) => container,
            Err(e) => {
                error!(backup = %backup, error = %e, "Container provisioning failed, backup disabled");
                return Err(e);
            }
        };
        info!(
            backup = %backup,
            container = %container.name,
            provider = self.objects.provider(),
            "Container ready"
        );

        let ctx = BackupContext::new(backup, container);
        if watch {
            // Registered before the walk so changes made during the sweep are seen.
            if let Err(e) = self.watch(&ctx).await {
                error!(backup = %ctx.backup, error = %e, "Failed to start watcher, backup disabled");
                return Err(e);
            }
        }

        let report = self.run_startup_sweep(&ctx).await?;
        Ok((ctx, report))
    }

    /// [`Self::start_backup`] in the background, logging the startup report
    pub fn spawn_backup(self: &Arc<Self>, backup: Backup, watch: bool) {
        let engine = Arc::clone(self);
        self.tracker.spawn(async move {
            let name = backup.name.clone();
            match engine.start_backup(backup, watch).await {
                Ok((_, report)) => info!(backup = %name, report = ?report, "Startup sweep complete"),
                Err(e) => error!(backup = %name, error = %e, "Backup could not be started"),
            }
        });
    }

    async fn watch(self: &Arc<Self>, ctx: &Arc<BackupContext>) -> Result<()> {
        let options = WatchOptions {
            recursive: true,
            max_depth: self.config.max_depth,
            pause: self.config.watch_pause(),
        };
        let watcher = DirWatcher::start(&ctx.backup.root, options).await?;
        let (tx, rx) = mpsc::unbounded_channel();

        let name = ctx.backup.name.clone();
        let cancel = self.cancel.child_token();
        self.tracker.spawn(async move {
            match watcher.run(tx, cancel).await {
                Ok(()) => info!(backup = %name, "Watcher stopped"),
                Err(e) => error!(backup = %name, error = %e, "Watcher failed"),
            }
        });
        self.tracker
            .spawn(Arc::clone(self).dispatch_events(Arc::clone(ctx), rx));
        Ok(())
    }

    async fn dispatch_events(self: Arc<Self>, ctx: Arc<BackupContext>, mut events: mpsc::UnboundedReceiver<WatchEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let engine = Arc::clone(&self);
            let ctx = Arc::clone(&ctx);
            self.tracker.spawn(async move {
                if let Err(e) = engine.on_filesystem_event(&ctx, &event).await {
                    warn!(
                        backup = %ctx.backup.name,
                        path = %event.path.display(),
                        error = %e,
                        "Failed to handle filesystem event"
                    );
                }
            });
        }
        debug!(backup = %ctx.backup.name, "Event dispatch stopped");
    }

    /// React to one watcher event. The path is re-read, so the event kind only
    /// matters for overflow; returns `None` when no check ran.
    pub async fn on_filesystem_event(
        self: &Arc<Self>,
        ctx: &Arc<BackupContext>,
        event: &WatchEvent,
    ) -> Result<Option<CheckOutcome>> {
        match event.kind {
            WatchEventKind::Overflow => {
                warn!(backup = %ctx.backup, "Watch notifications lost, re-sweeping backup");
                self.request_resweep(ctx);
                Ok(None)
            }
            _ if !ctx.backup.contains(&event.path) => Ok(None),
            _ => self.check_file(ctx, &event.path).await.map(Some),
        }
    }

    /// Schedule a full sweep of the backup. Requests made while one is already
    /// waiting to start are merged into it; returns whether a sweep was scheduled.
    pub fn request_resweep(self: &Arc<Self>, ctx: &Arc<BackupContext>) -> bool {
        if ctx.resweep_pending.swap(true, Ordering::SeqCst) {
            debug!(backup = %ctx.backup.name, "Re-sweep already pending");
            return false;
        }

        let engine = Arc::clone(self);
        let ctx = Arc::clone(ctx);
        self.tracker.spawn(async move {
            if let Err(e) = engine.run_startup_sweep(&ctx).await {
                error!(backup = %ctx.backup, error = %e, "Re-sweep failed");
            }
        });
        true
    }

    /// Re-read `path` and bring its remote copy and record in line: no record
    /// means `UPLOAD`, a stale record means `REPLACE`, a matching record means
    /// nothing to do, and a vanished path is handled like [`Self::remove_file`].
    pub async fn check_file(&self, ctx: &BackupContext, path: &Path) -> Result<CheckOutcome> {
        let _guard = self.locks.lock(ctx.backup.id, path).await;

        match self.probe_permitted(path).await? {
            Probe::File(state) => self.sync_file(ctx, path, state).await,
            Probe::Missing => self.remove_locked(ctx, path).await,
            Probe::Directory | Probe::Special => Ok(CheckOutcome::Ignored),
        }
    }

    /// Handle a path observed to be gone: delete its remote object, then its
    /// record. A path without a record is reported and left alone.
    ///
    /// The path is probed again once locked; a file recreated in the meantime
    /// is synced instead of deleted.
    pub async fn remove_file(&self, ctx: &BackupContext, path: &Path) -> Result<CheckOutcome> {
        let _guard = self.locks.lock(ctx.backup.id, path).await;

        match self.probe_permitted(path).await? {
            Probe::File(state) => self.sync_file(ctx, path, state).await,
            _ => self.remove_locked(ctx, path).await,
        }
    }

    async fn sync_file(&self, ctx: &BackupContext, path: &Path, state: FileState) -> Result<CheckOutcome> {
        let Some(observed) = LocalRecord::observed(&ctx.backup, path, &state) else {
            warn!(backup = %ctx.backup.name, path = %path.display(), "Skipping path that is not valid UTF-8");
            return Ok(CheckOutcome::Ignored);
        };

        let (kind, record) = match self.store.get_record(&ctx.backup, path).await? {
            None => (TaskKind::Upload, observed),
            Some(record) if record.matches(path, &state) => return Ok(CheckOutcome::Unchanged),
            Some(mut record) => {
                record.refresh(&state);
                (TaskKind::Replace, record)
            }
        };

        let outcome = self.dispatch(ctx, kind, path).await?;
        if !outcome.is_success() {
            return Ok(CheckOutcome::Failed(kind, outcome));
        }

        self.store.upsert_record(&record).await?;
        Ok(CheckOutcome::Synced(kind))
    }

    async fn remove_locked(&self, ctx: &BackupContext, path: &Path) -> Result<CheckOutcome> {
        if let Some(record) = self.store.get_record(&ctx.backup, path).await? {
            return self.delete_remote(ctx, record).await;
        }

        // A removed or renamed-away directory leaves records below it.
        let nested = self.store.records_under(&ctx.backup, path).await?;
        if nested.is_empty() {
            warn!(backup = %ctx.backup.name, path = %path.display(), "Deleted path has no record");
            return Ok(CheckOutcome::Untracked);
        }

        info!(
            backup = %ctx.backup.name,
            path = %path.display(),
            records = nested.len(),
            "Directory removed, deleting its objects"
        );
        let outcomes: Vec<Result<CheckOutcome>> = stream::iter(nested)
            .map(|record| async move {
                let path = record.path().to_path_buf();
                let _guard = self.locks.lock(record.backup_id, &path).await;
                self.settle_nested(ctx, &path).await
            })
            .buffer_unordered(self.config.upload_workers.max(1))
            .collect()
            .await;

        // A failure outranks a delete, which outranks a resync of a recreated file.
        let rank = |outcome: &CheckOutcome| match outcome {
            CheckOutcome::Failed(..) => 3,
            CheckOutcome::Synced(TaskKind::Delete) => 2,
            CheckOutcome::Synced(_) => 1,
            _ => 0,
        };
        let mut combined = CheckOutcome::Unchanged;
        for outcome in outcomes {
            let outcome = outcome?;
            if rank(&outcome) > rank(&combined) {
                combined = outcome;
            }
        }
        Ok(combined)
    }

    /// Re-read one record below a removed directory under its own lock. The
    /// snapshot it came from may be stale by the time the lock is held.
    async fn settle_nested(&self, ctx: &BackupContext, path: &Path) -> Result<CheckOutcome> {
        if let Probe::File(state) = self.probe_permitted(path).await? {
            return self.sync_file(ctx, path, state).await;
        }
        match self.store.get_record(&ctx.backup, path).await? {
            Some(record) => self.delete_remote(ctx, record).await,
            None => Ok(CheckOutcome::Untracked),
        }
    }

    async fn delete_remote(&self, ctx: &BackupContext, record: LocalRecord) -> Result<CheckOutcome> {
        let outcome = self.dispatch(ctx, TaskKind::Delete, record.path()).await?;
        if !outcome.is_success() {
            return Ok(CheckOutcome::Failed(TaskKind::Delete, outcome));
        }

        self.store.delete_record(&record).await?;
        Ok(CheckOutcome::Synced(TaskKind::Delete))
    }

    /// Emit one task and wait for it to resolve
    async fn dispatch(&self, ctx: &BackupContext, kind: TaskKind, path: &Path) -> Result<TaskOutcome> {
        let key = object_key(&ctx.backup.root, path).ok_or_else(|| {
            SyncError::Inconsistent(format!("no object key for {}", path.display()))
        })?;
        let task = Task::new(kind, &ctx.backup.name, Arc::clone(&ctx.container), path.to_path_buf(), key);
        debug!(task = %task, "Task emitted");

        let outcome = self.queue.send(task).outcome().await;
        if !outcome.is_success() {
            warn!(
                backup = %ctx.backup.name,
                path = %path.display(),
                kind = %kind,
                outcome = ?outcome,
                "Task did not succeed, record left unchanged"
            );
        }
        Ok(outcome)
    }

    /// Read file state while holding one of the bounded scan permits
    async fn probe_permitted(&self, path: &Path) -> Result<Probe> {
        let _permit = self
            .scan_permits
            .acquire()
            .await
            .map_err(|_| SyncError::Inconsistent("scan pool closed".into()))?;
        Ok(probe(path).await?)
    }

    /// Stop watchers and pending sweeps, then wait up to `grace` for checks that
    /// are already waiting on a remote outcome.
    pub async fn shutdown(&self, grace: Duration) {
        self.cancel.cancel();
        self.tracker.close();

        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!(
                remaining = self.tracker.len(),
                "Reconciliation work did not finish within {:?}", grace
            );
        } else {
            info!("Reconciliation engine stopped");
        }
    }
}
