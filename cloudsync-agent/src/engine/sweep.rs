//! Full reconciliation of one backup: the orphan pass over stored records and the
//! drift pass over the live tree, run concurrently.

use super::{BackupContext, CheckOutcome, ReconciliationEngine};
use crate::fs::metadata::Probe;
use crate::fs::walker::{walk_files, WalkOptions, WalkSummary};
use crate::queue::TaskKind;
use crate::utils::errors::{Result, SyncError};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Counters for one sweep. Every emitted task shows up exactly once in
/// `uploaded`, `replaced`, `deleted` or `failed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub uploaded: usize,
    pub replaced: usize,
    pub deleted: usize,
    pub unchanged: usize,
    /// Tasks emitted that did not succeed; their records were left untouched
    pub failed: usize,
    /// Checks aborted by a filesystem or store error
    pub errors: usize,
    pub ignored: usize,
    /// Deleted paths that had no record
    pub untracked: usize,
    /// Entries below the depth cap that were not visited
    pub depth_exceeded: usize,
}

impl SweepReport {
    /// Number of tasks the sweep emitted
    pub fn tasks(&self) -> usize {
        self.uploaded + self.replaced + self.deleted + self.failed
    }

    fn record(&mut self, outcome: &CheckOutcome) {
        match outcome {
            CheckOutcome::Unchanged => self.unchanged += 1,
            CheckOutcome::Synced(TaskKind::Upload) => self.uploaded += 1,
            CheckOutcome::Synced(TaskKind::Replace) => self.replaced += 1,
            CheckOutcome::Synced(TaskKind::Delete) => self.deleted += 1,
            CheckOutcome::Failed(..) => self.failed += 1,
            CheckOutcome::Ignored => self.ignored += 1,
            CheckOutcome::Untracked => self.untracked += 1,
        }
    }

    fn merge(&mut self, other: &SweepReport) {
        self.uploaded += other.uploaded;
        self.replaced += other.replaced;
        self.deleted += other.deleted;
        self.unchanged += other.unchanged;
        self.failed += other.failed;
        self.errors += other.errors;
        self.ignored += other.ignored;
        self.untracked += other.untracked;
        self.depth_exceeded += other.depth_exceeded;
    }
}

impl ReconciliationEngine {
    /// Reconcile every record and every file of the backup.
    ///
    /// Returns once each check the sweep started has resolved, including the
    /// remote outcome of any task it emitted. Sweeps of one backup never overlap.
    pub async fn run_startup_sweep(&self, ctx: &BackupContext) -> Result<SweepReport> {
        let _sweep = ctx.sweep_lock.lock().await;

        // An unmounted or missing root must not read as "every file deleted".
        if !tokio::fs::metadata(&ctx.backup.root).await?.is_dir() {
            return Err(SyncError::Inconsistent(format!(
                "backup root {} is not a directory",
                ctx.backup.root.display()
            )));
        }
        // Overflows from here on need a sweep after this one.
        ctx.resweep_pending.store(false, Ordering::SeqCst);
        let sweep = ctx.sweeps.fetch_add(1, Ordering::SeqCst) + 1;

        info!(backup = %ctx.backup, sweep, "Sweep started");

        let (orphans, drift) = tokio::join!(self.orphan_pass(ctx), self.drift_pass(ctx));
        let mut report = orphans;
        report.merge(&drift?);

        info!(
            backup = %ctx.backup,
            sweep,
            uploaded = report.uploaded,
            replaced = report.replaced,
            deleted = report.deleted,
            unchanged = report.unchanged,
            failed = report.failed,
            errors = report.errors,
            "Sweep finished"
        );
        Ok(report)
    }

    /// Delete the remote object of every record whose file is gone
    async fn orphan_pass(&self, ctx: &BackupContext) -> SweepReport {
        let workers = self.config.scan_workers.max(1);

        self.store
            .stream_records(&ctx.backup)
            .take_until(self.cancel.cancelled())
            .map(|record| async move {
                let record = match record {
                    Ok(record) => record,
                    Err(e) => {
                        warn!(backup = %ctx.backup.name, error = %e, "Failed to read records");
                        return Err(());
                    }
                };

                let path = record.path().to_path_buf();
                let state = match self.probe_permitted(&path).await {
                    Ok(state) => state,
                    Err(e) => {
                        warn!(backup = %ctx.backup.name, path = %path.display(), error = %e, "Failed to read file state");
                        return Err(());
                    }
                };

                // Present files are the drift pass's business.
                if matches!(state, Probe::File(_)) {
                    return Ok(None);
                }

                self.remove_file(ctx, &path).await.map(Some).map_err(|e| {
                    warn!(backup = %ctx.backup.name, path = %path.display(), error = %e, "Orphan removal failed");
                })
            })
            .buffer_unordered(workers)
            .fold(SweepReport::default(), |mut report, result| async move {
                match result {
                    Ok(Some(outcome)) => report.record(&outcome),
                    Ok(None) => {}
                    Err(()) => report.errors += 1,
                }
                report
            })
            .await
    }

    /// Check every regular file under the root against its record
    async fn drift_pass(&self, ctx: &BackupContext) -> Result<SweepReport> {
        let workers = self.config.scan_workers.max(1);
        let (tx, rx) = mpsc::channel::<PathBuf>(workers * 4);

        let root = ctx.backup.root.clone();
        let options = WalkOptions {
            follow_links: false,
            max_depth: self.config.max_depth,
        };
        let cancel = self.cancel.clone();
        let walk = tokio::task::spawn_blocking(move || {
            walk_files(&root, &options, |path| {
                if cancel.is_cancelled() || tx.blocking_send(path).is_err() {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
        });

        let files = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|path| (path, rx)) });
        let mut report = files
            .map(|path| async move {
                self.check_file(ctx, &path).await.map_err(|e| {
                    warn!(backup = %ctx.backup.name, path = %path.display(), error = %e, "File check failed");
                })
            })
            .buffer_unordered(workers)
            .fold(SweepReport::default(), |mut report, result| async move {
                match result {
                    Ok(outcome) => report.record(&outcome),
                    Err(()) => report.errors += 1,
                }
                report
            })
            .await;

        let summary: WalkSummary = walk.await??;
        report.errors += summary.errors;
        report.depth_exceeded = summary.depth_exceeded;
        if summary.depth_exceeded > 0 {
            warn!(
                backup = %ctx.backup,
                max_depth = self.config.max_depth,
                skipped = summary.depth_exceeded,
                "Sweep skipped entries beyond the depth limit"
            );
        }
        debug!(backup = %ctx.backup.name, files = summary.files, "Drift pass walked tree");
        Ok(report)
    }
}

impl BackupContext {
    /// Sweeps started for this backup so far
    pub fn sweeps_run(&self) -> usize {
        self.sweeps.load(Ordering::SeqCst)
    }
}
