//! Backup job orchestrator.
//!
//! One run walks the state machine
//! `Idle -> Archiving -> Uploading -> Pruning -> Cleanup -> Done`,
//! ending in `Failed` instead when archiving or uploading fails. The local
//! archive is removed whenever one was built, and every run produces
//! exactly one [`JobOutcome`] and one notification.

use crate::archive::{ArchiveBuilder, ArchiveInfo};
use crate::notify::{Notification, NotificationSink};
use crate::retention::{select_for_deletion, RetentionPolicy};
use crate::store::{DeleteOutcome, RemoteStore};
use crate::tier::BackupTier;
use crate::utils::format::{format_bytes, format_duration};
use chrono::NaiveDateTime;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Fatal reason a run ended in [`JobState::Failed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobFailure {
    Archive(String),
    Upload(String),
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobFailure::Archive(msg) | JobFailure::Upload(msg) => f.write_str(msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Archiving,
    Uploading,
    Pruning,
    Cleanup,
    Done,
    Failed(JobFailure),
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed(_))
    }

    pub fn can_transition_to(&self, next: &JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Idle, Archiving)
            | (Archiving, Uploading)
            | (Uploading, Pruning)
            | (Uploading, Cleanup)
            | (Pruning, Cleanup)
            | (Cleanup, Done) => true,
            (Archiving, Failed(JobFailure::Archive(_))) => true,
            (Cleanup, Failed(JobFailure::Upload(_))) => true,
            _ => false,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            JobState::Idle => "idle",
            JobState::Archiving => "archiving",
            JobState::Uploading => "uploading",
            JobState::Pruning => "pruning",
            JobState::Cleanup => "cleanup",
            JobState::Done => "done",
            JobState::Failed(_) => "failed",
        }
    }
}

/// Success or failure of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub succeeded: bool,
    pub error_message: Option<String>,
}

/// Counters for one retention pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub selected: usize,
    pub deleted: usize,
    pub already_gone: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PruneSummary {
    Completed(PruneReport),
    /// Listing failed; nothing was deleted.
    Skipped(String),
}

/// Everything observed during one run.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub run_id: Uuid,
    pub tier: BackupTier,
    pub archive: Option<ArchiveInfo>,
    pub remote_id: Option<String>,
    pub prune: Option<PruneSummary>,
    pub history: Vec<JobState>,
    state: JobState,
    pub outcome: JobOutcome,
    pub duration_secs: u64,
}

impl JobReport {
    pub fn final_state(&self) -> &JobState {
        &self.state
    }

    pub fn notification(&self, name: &str) -> Notification {
        if !self.outcome.succeeded {
            return Notification {
                title: format!("{}: backup failed", name),
                message: self
                    .outcome
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string()),
            };
        }

        let mut message = match &self.archive {
            Some(archive) => format!(
                "Uploaded {} ({}, {}) in {}.",
                archive.file_name,
                format_bytes(archive.size_bytes),
                self.tier,
                format_duration(self.duration_secs)
            ),
            None => format!("Uploaded {} backup.", self.tier),
        };

        match &self.prune {
            Some(PruneSummary::Completed(report)) if report.selected == 0 => {
                message.push_str(" Nothing to prune.");
            }
            Some(PruneSummary::Completed(report)) => {
                message.push_str(&format!(
                    " Pruned {} of {} old {} backups",
                    report.deleted + report.already_gone,
                    report.selected,
                    self.tier
                ));
                if report.failed > 0 {
                    message.push_str(&format!(", {} could not be deleted", report.failed));
                }
                message.push('.');
            }
            Some(PruneSummary::Skipped(reason)) => {
                message.push_str(&format!(" Pruning skipped: {}", reason));
            }
            None => {}
        }

        Notification {
            title: format!("{}: backup succeeded", name),
            message,
        }
    }
}

/// State tracker for a single run.
struct JobRun {
    state: JobState,
    history: Vec<JobState>,
}

impl JobRun {
    fn new() -> Self {
        Self {
            state: JobState::Idle,
            history: vec![JobState::Idle],
        }
    }

    fn state(&self) -> &JobState {
        &self.state
    }

    fn transition(&mut self, next: JobState) {
        debug_assert!(
            self.state().can_transition_to(&next),
            "illegal transition {:?} -> {:?}",
            self.state(),
            next
        );
        info!(from = self.state.label(), to = next.label(), "Job state changed");
        self.history.push(next.clone());
        self.state = next;
    }
}

/// What a job backs up and where.
#[derive(Debug, Clone)]
pub struct BackupJob {
    /// Display name for notifications
    pub name: String,
    pub container_id: String,
    pub sources: Vec<PathBuf>,
    pub policy: RetentionPolicy,
}

/// Runs backup jobs end to end.
pub struct Orchestrator {
    job: BackupJob,
    builder: ArchiveBuilder,
    store: Arc<dyn RemoteStore>,
    notifier: Arc<dyn NotificationSink>,
}

impl Orchestrator {
    pub fn new(
        job: BackupJob,
        builder: ArchiveBuilder,
        store: Arc<dyn RemoteStore>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            job,
            builder,
            store,
            notifier,
        }
    }

    pub fn job(&self) -> &BackupJob {
        &self.job
    }

    /// Run one job stamped with the current local time.
    pub async fn run(&self) -> JobReport {
        self.run_at(chrono::Local::now().naive_local()).await
    }

    /// Run one job stamped with `timestamp`.
    pub async fn run_at(&self, timestamp: NaiveDateTime) -> JobReport {
        let run_id = Uuid::new_v4();
        let span = info_span!("backup_run", run_id = %run_id);
        async move {
            let report = self.execute(run_id, timestamp).await;
            self.send_notification(&report).await;
            report
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, run_id: Uuid, timestamp: NaiveDateTime) -> JobReport {
        let start_time = std::time::Instant::now();
        let tier = BackupTier::for_timestamp(timestamp);
        let mut run = JobRun::new();

        info!(
            tier = %tier,
            sources = self.job.sources.len(),
            "Starting backup run"
        );

        run.transition(JobState::Archiving);
        let archive = match self.builder.build(&self.job.sources, timestamp, tier).await {
            Ok(archive) => archive,
            Err(e) => {
                error!(error = %e, "Archiving failed");
                let failure = JobFailure::Archive(e.to_string());
                run.transition(JobState::Failed(failure.clone()));
                return self.report(run_id, tier, run, None, None, None, Some(failure), start_time);
            }
        };

        run.transition(JobState::Uploading);
        let (remote_id, prune, failure) = match self
            .store
            .upload(&archive.path, &archive.file_name, &self.job.container_id)
            .await
        {
            Ok(id) => {
                info!(object_id = %id, archive = %archive.file_name, "Archive uploaded");
                run.transition(JobState::Pruning);
                let prune = self.prune(tier).await;
                (Some(id), Some(prune), None)
            }
            Err(e) => {
                error!(error = %e, archive = %archive.file_name, "Upload failed");
                (None, None, Some(JobFailure::Upload(e.to_string())))
            }
        };

        run.transition(JobState::Cleanup);
        remove_local_archive(&archive.path).await;

        match &failure {
            Some(failure) => run.transition(JobState::Failed(failure.clone())),
            None => run.transition(JobState::Done),
        }

        self.report(run_id, tier, run, Some(archive), remote_id, prune, failure, start_time)
    }

    /// One retention pass for `tier` against a fresh listing.
    async fn prune(&self, tier: BackupTier) -> PruneSummary {
        let objects = match self.store.list(&self.job.container_id).await {
            Ok(objects) => objects,
            Err(e) => {
                error!(error = %e, "Listing failed, skipping retention");
                return PruneSummary::Skipped(e.to_string());
            }
        };

        let selected = select_for_deletion(&objects, tier, &self.job.policy);
        let mut report = PruneReport {
            selected: selected.len(),
            ..PruneReport::default()
        };

        if selected.is_empty() {
            info!(
                tier = %tier,
                max_keep = self.job.policy.max_keep(tier),
                "Retention satisfied, nothing to delete"
            );
            return PruneSummary::Completed(report);
        }

        info!(tier = %tier, count = selected.len(), "Deleting old backups");
        for object in &selected {
            match self.store.delete(&object.id).await {
                Ok(DeleteOutcome::Deleted) => {
                    report.deleted += 1;
                    info!(object_id = %object.id, name = %object.name, "Deleted old backup");
                }
                Ok(DeleteOutcome::AlreadyGone) => {
                    report.already_gone += 1;
                    info!(object_id = %object.id, name = %object.name, "Old backup already gone");
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(object_id = %object.id, name = %object.name, error = %e, "Failed to delete old backup");
                }
            }
        }

        if report.failed > 0 {
            warn!(
                failed = report.failed,
                selected = report.selected,
                "Retention incomplete, remaining objects are retried next run"
            );
        }

        PruneSummary::Completed(report)
    }

    #[allow(clippy::too_many_arguments)]
    fn report(
        &self,
        run_id: Uuid,
        tier: BackupTier,
        run: JobRun,
        archive: Option<ArchiveInfo>,
        remote_id: Option<String>,
        prune: Option<PruneSummary>,
        failure: Option<JobFailure>,
        start_time: std::time::Instant,
    ) -> JobReport {
        let outcome = JobOutcome {
            succeeded: failure.is_none(),
            error_message: failure.map(|f| f.to_string()),
        };
        let duration_secs = start_time.elapsed().as_secs();

        if outcome.succeeded {
            info!(tier = %tier, duration_secs, "Backup run completed");
        } else {
            error!(tier = %tier, duration_secs, "Backup run failed");
        }

        JobReport {
            run_id,
            tier,
            archive,
            remote_id,
            prune,
            history: run.history,
            state: run.state,
            outcome,
            duration_secs,
        }
    }

    async fn send_notification(&self, report: &JobReport) {
        let notification = report.notification(&self.job.name);
        if let Err(e) = self.notifier.notify(&notification).await {
            warn!(error = %e, "Failed to send notification");
        }
    }
}

/// Remove the local archive; a missing file is fine.
async fn remove_local_archive(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => info!(archive = %path.display(), "Removed local archive"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(archive = %path.display(), error = %e, "Failed to remove local archive"),
    }
}
