//! Daily trigger loop.
//!
//! A single task polls the wall clock on a short fixed interval and runs the
//! orchestrator inline once the configured time of day has been crossed.
//! Because the loop awaits each run before polling again, two runs can
//! never overlap. Shutdown is only observed between runs.

use crate::config::ScheduleConfig;
use crate::executor::{JobReport, Orchestrator};
use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Trigger bookkeeping owned by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleState {
    /// Local date of the last scheduled run, set once that run completed
    pub last_trigger_date: Option<NaiveDate>,
    /// When the loop started watching the clock
    armed_at: NaiveDateTime,
}

impl ScheduleState {
    pub fn new(armed_at: NaiveDateTime) -> Self {
        Self {
            last_trigger_date: None,
            armed_at,
        }
    }

    /// True once today's trigger time has been crossed while armed and no
    /// scheduled run has happened today.
    pub fn is_due(&self, now: NaiveDateTime, time_of_day: NaiveTime) -> bool {
        let trigger = now.date().and_time(time_of_day);
        now >= trigger && trigger >= self.armed_at && self.last_trigger_date != Some(now.date())
    }

    pub fn mark_triggered(&mut self, date: NaiveDate) {
        self.last_trigger_date = Some(date);
    }

    /// Start watching the clock again from `now`; trigger times already
    /// passed are not fired.
    pub fn rearm(&mut self, now: NaiveDateTime) {
        self.armed_at = now;
    }
}

pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    schedule: ScheduleConfig,
    poll_interval: Duration,
    state: ScheduleState,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<Orchestrator>, schedule: ScheduleConfig) -> Self {
        Self::armed_at(orchestrator, schedule, Local::now().naive_local())
    }

    pub fn armed_at(orchestrator: Arc<Orchestrator>, schedule: ScheduleConfig, armed_at: NaiveDateTime) -> Self {
        Self {
            orchestrator,
            schedule,
            poll_interval: POLL_INTERVAL,
            state: ScheduleState::new(armed_at),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn state(&self) -> &ScheduleState {
        &self.state
    }

    /// Run one job immediately, independent of the timer.
    ///
    /// The scheduler is re-armed once the job returns, so a trigger time
    /// crossed during the on-demand run does not start a second backup.
    pub async fn run_now(&mut self) -> JobReport {
        info!("Running backup on demand");
        let report = self.orchestrator.run().await;
        self.state.rearm(Local::now().naive_local());
        report
    }

    /// Evaluate the schedule at `now`, running the job if it is due.
    pub async fn tick(&mut self, now: NaiveDateTime) -> Option<JobReport> {
        if !self.schedule.enabled || !self.state.is_due(now, self.schedule.time_of_day) {
            return None;
        }

        info!(schedule = %self.schedule.time_of_day.format("%H:%M"), "Scheduled backup triggered");
        let report = self.orchestrator.run_at(now).await;
        self.state.mark_triggered(now.date());
        Some(report)
    }

    /// Poll until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        if !self.schedule.enabled {
            warn!("Scheduled backups are disabled, waiting for shutdown");
            cancel.cancelled().await;
            return;
        }

        info!(
            schedule = %self.schedule.time_of_day.format("%H:%M"),
            poll_secs = self.poll_interval.as_secs(),
            "Scheduler started"
        );

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Some(report) = self.tick(Local::now().naive_local()).await {
                        info!(
                            run_id = %report.run_id,
                            succeeded = report.outcome.succeeded,
                            "Scheduled backup finished"
                        );
                    }
                }
            }
        }

        info!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveBuilder;
    use crate::executor::BackupJob;
    use crate::notify::WebhookNotifier;
    use crate::retention::RetentionPolicy;
    use crate::store::memory::InMemoryStore;
    use crate::store::{DeleteOutcome, RemoteObject, RemoteStore};
    use crate::utils::errors::Result;
    use async_trait::async_trait;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    fn dt(day: u32, h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 7, day)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_not_due_before_trigger_time() {
        let state = ScheduleState::new(dt(10, 1, 0));
        assert!(!state.is_due(dt(10, 2, 59), hm(3, 0)));
        assert!(state.is_due(dt(10, 3, 0), hm(3, 0)));
        assert!(state.is_due(dt(10, 7, 45), hm(3, 0)));
    }

    #[test]
    fn test_once_per_day() {
        let mut state = ScheduleState::new(dt(10, 1, 0));
        assert!(state.is_due(dt(10, 3, 1), hm(3, 0)));
        state.mark_triggered(dt(10, 3, 1).date());
        assert!(!state.is_due(dt(10, 3, 2), hm(3, 0)));
        assert!(!state.is_due(dt(10, 23, 59), hm(3, 0)));
        assert!(!state.is_due(dt(11, 2, 0), hm(3, 0)));
        assert!(state.is_due(dt(11, 3, 0), hm(3, 0)));
    }

    #[test]
    fn test_started_after_trigger_waits_for_next_day() {
        let state = ScheduleState::new(dt(10, 9, 0));
        assert!(!state.is_due(dt(10, 9, 1), hm(3, 0)));
        assert!(state.is_due(dt(11, 3, 0), hm(3, 0)));
    }

    #[test]
    fn test_midnight_schedule() {
        let state = ScheduleState::new(dt(10, 12, 0));
        assert!(state.is_due(dt(11, 0, 0), hm(0, 0)));
    }

    struct Harness {
        _sources: TempDir,
        _out: TempDir,
        store: Arc<InMemoryStore>,
        orchestrator: Arc<Orchestrator>,
    }

    fn harness() -> Harness {
        let sources = TempDir::new().unwrap();
        fs::write(sources.path().join("a.txt"), b"a").unwrap();
        let out = TempDir::new().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let orchestrator = Arc::new(Orchestrator::new(
            BackupJob {
                name: "test".into(),
                container_id: "folder".into(),
                sources: vec![sources.path().to_path_buf()],
                policy: RetentionPolicy::default(),
            },
            ArchiveBuilder::new(out.path()),
            store.clone(),
            Arc::new(WebhookNotifier::new(reqwest::Client::new(), None)),
        ));
        Harness {
            _sources: sources,
            _out: out,
            store,
            orchestrator,
        }
    }

    fn schedule(enabled: bool) -> ScheduleConfig {
        ScheduleConfig {
            time_of_day: hm(3, 0),
            enabled,
        }
    }

    #[tokio::test]
    async fn test_tick_runs_once_per_day() {
        let h = harness();
        let mut scheduler = Scheduler::armed_at(h.orchestrator.clone(), schedule(true), dt(10, 0, 0));

        assert!(scheduler.tick(dt(10, 2, 0)).await.is_none());
        let report = scheduler.tick(dt(10, 3, 0)).await.unwrap();
        assert!(report.outcome.succeeded);
        assert_eq!(scheduler.state().last_trigger_date, Some(dt(10, 0, 0).date()));
        assert!(scheduler.tick(dt(10, 3, 1)).await.is_none());
        assert!(scheduler.tick(dt(11, 3, 5)).await.is_some());

        assert_eq!(h.store.upload_calls().await, 2);
    }

    #[tokio::test]
    async fn test_disabled_schedule_never_fires() {
        let h = harness();
        let mut scheduler = Scheduler::armed_at(h.orchestrator.clone(), schedule(false), dt(10, 0, 0));
        assert!(scheduler.tick(dt(10, 12, 0)).await.is_none());
        assert_eq!(h.store.upload_calls().await, 0);
    }

    #[tokio::test]
    async fn test_run_now_ignores_timer() {
        let h = harness();
        let mut scheduler = Scheduler::armed_at(h.orchestrator.clone(), schedule(true), dt(10, 0, 0));
        let report = scheduler.run_now().await;
        assert!(report.outcome.succeeded);
        assert_eq!(scheduler.state().last_trigger_date, None);
        assert_eq!(h.store.upload_calls().await, 1);
    }

    #[tokio::test]
    async fn test_loop_stops_on_cancel() {
        let h = harness();
        let scheduler = Scheduler::new(h.orchestrator.clone(), schedule(true))
            .with_poll_interval(Duration::from_millis(10));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(scheduler.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_disabled_loop_stops_on_cancel() {
        let h = harness();
        let scheduler = Scheduler::new(h.orchestrator.clone(), schedule(false));
        let cancel = CancellationToken::new();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), scheduler.run(cancel))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_now_rearms_past_trigger() {
        let h = harness();
        let today = Local::now().naive_local().date();
        let midnight = ScheduleConfig {
            time_of_day: hm(0, 0),
            enabled: true,
        };
        let mut scheduler = Scheduler::armed_at(h.orchestrator.clone(), midnight, today.and_time(hm(0, 0)));
        assert!(scheduler.state().is_due(Local::now().naive_local(), hm(0, 0)));

        scheduler.run_now().await;

        assert!(!scheduler.state().is_due(Local::now().naive_local(), hm(0, 0)));
        assert!(scheduler.tick(Local::now().naive_local()).await.is_none());
        assert_eq!(h.store.upload_calls().await, 1);
    }

    /// Holds every upload until released.
    struct GatedStore {
        inner: InMemoryStore,
        started: Notify,
        release: Notify,
    }

    #[async_trait]
    impl RemoteStore for GatedStore {
        async fn list(&self, container_id: &str) -> Result<Vec<RemoteObject>> {
            self.inner.list(container_id).await
        }

        async fn upload(&self, local_path: &Path, remote_name: &str, container_id: &str) -> Result<String> {
            self.started.notify_one();
            self.release.notified().await;
            self.inner.upload(local_path, remote_name, container_id).await
        }

        async fn delete(&self, remote_id: &str) -> Result<DeleteOutcome> {
            self.inner.delete(remote_id).await
        }
    }

    #[tokio::test]
    async fn test_cancel_lets_running_backup_finish() {
        let sources = TempDir::new().unwrap();
        fs::write(sources.path().join("a.txt"), b"a").unwrap();
        let out = TempDir::new().unwrap();
        let store = Arc::new(GatedStore {
            inner: InMemoryStore::new(),
            started: Notify::new(),
            release: Notify::new(),
        });
        let orchestrator = Arc::new(Orchestrator::new(
            BackupJob {
                name: "test".into(),
                container_id: "folder".into(),
                sources: vec![sources.path().to_path_buf()],
                policy: RetentionPolicy::default(),
            },
            ArchiveBuilder::new(out.path()),
            store.clone(),
            Arc::new(WebhookNotifier::new(reqwest::Client::new(), None)),
        ));

        // Due on the first poll: armed at midnight, trigger at midnight.
        let today = Local::now().naive_local().date();
        let midnight = ScheduleConfig {
            time_of_day: hm(0, 0),
            enabled: true,
        };
        let scheduler = Scheduler::armed_at(orchestrator, midnight, today.and_time(hm(0, 0)))
            .with_poll_interval(Duration::from_millis(10));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(scheduler.run(cancel.clone()));

        tokio::time::timeout(Duration::from_secs(10), store.started.notified())
            .await
            .expect("scheduled run never started");
        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        store.release.notify_one();
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("scheduler did not stop")
            .unwrap();

        assert_eq!(store.inner.upload_calls().await, 1);
        assert_eq!(store.inner.objects("folder").await.len(), 1);
        assert_eq!(fs::read_dir(out.path()).unwrap().count(), 0);
    }
}
