use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{NaiveDateTime, NaiveTime};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::engine::{Engine, EngineError};
use crate::limits::DEFAULT_GRACE_MINUTES;
use crate::model::{ExpiryReport, ResetReport, SweepKind};
use crate::observability::SWEEP_SKIPPED_TOTAL;
use crate::sweeper;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub expiry_interval: Duration,
    pub grace_minutes: u32,
    pub reset_at: NaiveTime,
    pub compact_threshold: u64,
    pub compact_check_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            expiry_interval: Duration::from_secs(30 * 60),
            grace_minutes: DEFAULT_GRACE_MINUTES,
            reset_at: NaiveTime::from_hms_opt(22, 0, 0).unwrap_or(NaiveTime::MIN),
            compact_threshold: 1000,
            compact_check_interval: Duration::from_secs(30),
        }
    }
}

/// Point-in-time view of both sweepers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStatus {
    pub is_expiry_sweep_running: bool,
    pub is_reset_sweep_running: bool,
    pub last_expiry_run: Option<ExpiryReport>,
    pub last_reset_run: Option<ResetReport>,
    pub total_cancelled_since_start: u64,
    pub total_reset_since_start: u64,
    pub next_expiry_run: Option<NaiveDateTime>,
    pub next_reset_run: Option<NaiveDateTime>,
    pub expiry_skipped: u64,
    pub reset_skipped: u64,
    pub last_expiry_error: Option<String>,
    pub last_reset_error: Option<String>,
}

/// First instant strictly after `after` whose time of day is `at`.
pub fn next_occurrence(after: NaiveDateTime, at: NaiveTime) -> NaiveDateTime {
    let candidate = after.date().and_time(at);
    if candidate > after {
        candidate
    } else {
        candidate + chrono::Duration::days(1)
    }
}

/// Clears a sweeper's running flag when dropped, whether the run finished,
/// failed or panicked.
struct RunningGuard<'a>(&'a AtomicBool);

impl<'a> RunningGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owns the expiry, nightly-reset and WAL-compaction timers. Created once at
/// boot and shared through `Arc`; each sweeper runs at most once at a time.
pub struct Scheduler {
    engine: Arc<Engine>,
    config: SchedulerConfig,
    expiry_running: AtomicBool,
    reset_running: AtomicBool,
    stats: Mutex<SchedulerStatus>,
}

impl Scheduler {
    pub fn new(engine: Arc<Engine>, config: SchedulerConfig) -> Self {
        Self {
            engine,
            config,
            expiry_running: AtomicBool::new(false),
            reset_running: AtomicBool::new(false),
            stats: Mutex::new(SchedulerStatus::default()),
        }
    }

    fn stats(&self) -> MutexGuard<'_, SchedulerStatus> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn status(&self) -> SchedulerStatus {
        let mut status = self.stats().clone();
        status.is_expiry_sweep_running = self.expiry_running.load(Ordering::Acquire);
        status.is_reset_sweep_running = self.reset_running.load(Ordering::Acquire);
        status
    }

    /// Run the expiry sweep now. Fails with `SweepAlreadyRunning` instead of
    /// waiting when a run is in flight.
    pub async fn run_expiry_sweep_now(&self) -> Result<ExpiryReport, EngineError> {
        let _running = RunningGuard::acquire(&self.expiry_running)
            .ok_or(EngineError::SweepAlreadyRunning(SweepKind::Expiry))?;
        let result = sweeper::sweep_expired(&self.engine, self.config.grace_minutes).await;

        let mut stats = self.stats();
        match &result {
            Ok(report) => {
                stats.total_cancelled_since_start += report.cancelled as u64;
                stats.last_expiry_run = Some(report.clone());
                stats.last_expiry_error = None;
            }
            Err(e) => stats.last_expiry_error = Some(e.to_string()),
        }
        result
    }

    pub async fn run_reset_sweep_now(&self) -> Result<ResetReport, EngineError> {
        let _running = RunningGuard::acquire(&self.reset_running)
            .ok_or(EngineError::SweepAlreadyRunning(SweepKind::Reset))?;
        let result = sweeper::sweep_reset(&self.engine).await;

        let mut stats = self.stats();
        match &result {
            Ok(report) => {
                stats.total_reset_since_start += report.reset as u64;
                stats.last_reset_run = Some(report.clone());
                stats.last_reset_error = None;
            }
            Err(e) => stats.last_reset_error = Some(e.to_string()),
        }
        result
    }

    /// One timer firing. Skips and logs if the sweep is still running;
    /// failures are logged and left for the next firing.
    async fn fire(&self, sweep: SweepKind) {
        let result = match sweep {
            SweepKind::Expiry => self.run_expiry_sweep_now().await.map(|_| ()),
            SweepKind::Reset => self.run_reset_sweep_now().await.map(|_| ()),
        };
        match result {
            Ok(()) => {}
            Err(EngineError::SweepAlreadyRunning(_)) => {
                warn!(%sweep, "sweep still running, skipping this firing");
                metrics::counter!(SWEEP_SKIPPED_TOTAL, "sweep" => sweep.as_str()).increment(1);
                let mut stats = self.stats();
                match sweep {
                    SweepKind::Expiry => stats.expiry_skipped += 1,
                    SweepKind::Reset => stats.reset_skipped += 1,
                }
            }
            Err(e) => error!(%sweep, error = %e, "scheduled sweep failed"),
        }
    }

    /// Start the background timers. They stop when `shutdown` flips.
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        info!(
            expiry_every_secs = self.config.expiry_interval.as_secs(),
            reset_at = %self.config.reset_at,
            "scheduler started"
        );
        vec![
            tokio::spawn(Arc::clone(self).expiry_loop(shutdown.clone())),
            tokio::spawn(Arc::clone(self).reset_loop(shutdown.clone())),
            tokio::spawn(Arc::clone(self).compactor_loop(shutdown)),
        ]
    }

    async fn expiry_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = self.config.expiry_interval;
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            self.stats().next_expiry_run = chrono::Duration::from_std(period)
                .ok()
                .map(|d| self.engine.now() + d);
            tokio::select! {
                _ = interval.tick() => {
                    // A firing that overlaps a slow run must find the flag set, not queue.
                    let this = Arc::clone(&self);
                    tokio::spawn(async move { this.fire(SweepKind::Expiry).await });
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn reset_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut target = next_occurrence(self.engine.now(), self.config.reset_at);
        loop {
            self.stats().next_reset_run = Some(target);
            let wait = (target - self.engine.now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    let this = Arc::clone(&self);
                    tokio::spawn(async move { this.fire(SweepKind::Reset).await });
                    target = next_occurrence(target.max(self.engine.now()), self.config.reset_at);
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn compactor_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.compact_check_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let appends = self.engine.wal_appends_since_compact().await;
                    if appends >= self.config.compact_threshold
                        && let Err(e) = self.engine.compact_wal().await
                    {
                        error!(error = %e, appends, "WAL compaction failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::{CustomerInfo, NewTable};
    use crate::notify::NotifyHub;
    use chrono::NaiveDate;

    fn at(day: u32, h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, day)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn next_reset_is_strictly_after() {
        let ten_pm = NaiveTime::from_hms_opt(22, 0, 0).unwrap();
        assert_eq!(next_occurrence(at(1, 9, 0), ten_pm), at(1, 22, 0));
        assert_eq!(next_occurrence(at(1, 22, 0), ten_pm), at(2, 22, 0));
        assert_eq!(next_occurrence(at(1, 23, 15), ten_pm), at(2, 22, 0));
    }

    #[test]
    fn next_reset_crosses_month_end() {
        let ten_pm = NaiveTime::from_hms_opt(22, 0, 0).unwrap();
        let june_30 = NaiveDate::from_ymd_opt(2025, 6, 30)
            .unwrap()
            .and_hms_opt(22, 30, 0)
            .unwrap();
        let july_1 = NaiveDate::from_ymd_opt(2025, 7, 1)
            .unwrap()
            .and_hms_opt(22, 0, 0)
            .unwrap();
        assert_eq!(next_occurrence(june_30, ten_pm), july_1);
    }

    #[test]
    fn running_guard_is_exclusive_and_released_on_drop() {
        let flag = AtomicBool::new(false);
        let first = RunningGuard::acquire(&flag);
        assert!(first.is_some());
        assert!(RunningGuard::acquire(&flag).is_none());
        drop(first);
        assert!(!flag.load(Ordering::Acquire));
        assert!(RunningGuard::acquire(&flag).is_some());
    }

    fn wal_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("tablekeep_test_scheduler");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    async fn booked_cafe(name: &str, clock: &Arc<ManualClock>) -> Arc<Engine> {
        let engine = Engine::new(wal_path(name), Arc::new(NotifyHub::new()), clock.clone()).unwrap();
        let table = engine
            .create_table(NewTable {
                name: "T1".into(),
                capacity: 4,
                area_id: None,
                location: None,
            })
            .await
            .unwrap();
        let guest = CustomerInfo {
            customer_ref: None,
            name: "Ada".into(),
            phone: "555-0100".into(),
            note: None,
        };
        let ten = at(1, 10, 0);
        engine
            .book(table.id, ten.date(), ten.time(), 2, guest)
            .await
            .unwrap();
        Arc::new(engine)
    }

    #[tokio::test]
    async fn firing_during_a_run_is_skipped_and_counted() {
        let clock = Arc::new(ManualClock::new(at(1, 9, 0)));
        let scheduler = Scheduler::new(booked_cafe("skip.wal", &clock).await, SchedulerConfig::default());
        clock.set(at(2, 9, 0));

        let running = RunningGuard::acquire(&scheduler.expiry_running).unwrap();
        scheduler.fire(SweepKind::Expiry).await;
        scheduler.fire(SweepKind::Expiry).await;
        let s = scheduler.status();
        assert_eq!(s.expiry_skipped, 2);
        assert_eq!(s.reset_skipped, 0);
        assert!(s.is_expiry_sweep_running);
        assert!(s.last_expiry_run.is_none());
        drop(running);

        scheduler.fire(SweepKind::Expiry).await;
        let s = scheduler.status();
        assert_eq!(s.expiry_skipped, 2);
        assert_eq!(s.total_cancelled_since_start, 1);
        assert!(!s.is_expiry_sweep_running);

        let _reset = RunningGuard::acquire(&scheduler.reset_running).unwrap();
        scheduler.fire(SweepKind::Reset).await;
        assert_eq!(scheduler.status().reset_skipped, 1);
    }

    #[test]
    fn failed_sweep_is_recorded_and_the_next_run_still_works() {
        let clock = Arc::new(ManualClock::new(at(1, 9, 0)));
        let setup = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let engine = setup.block_on(booked_cafe("failing.wal", &clock));
        // the WAL writer task goes down with the runtime that spawned it
        drop(setup);

        let scheduler = Scheduler::new(engine, SchedulerConfig::default());
        tokio_test::block_on(async {
            clock.set(at(2, 9, 0));
            let err = scheduler.run_expiry_sweep_now().await.unwrap_err();
            assert!(matches!(
                err,
                EngineError::SweepFailure {
                    sweep: SweepKind::Expiry,
                    ..
                }
            ));
            scheduler.fire(SweepKind::Expiry).await;

            let s = scheduler.status();
            assert!(s.last_expiry_error.unwrap().contains("WAL writer"));
            assert!(!s.is_expiry_sweep_running);
            assert!(s.last_expiry_run.is_none());
            assert_eq!(s.expiry_skipped, 0);

            // nothing left to write once the booking is no longer overdue
            clock.set(at(1, 9, 30));
            let report = scheduler.run_expiry_sweep_now().await.unwrap();
            assert_eq!(report.cancelled, 0);
            let s = scheduler.status();
            assert!(s.last_expiry_error.is_none());
            assert!(s.last_expiry_run.is_some());
        });
    }

    #[test]
    fn default_config() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.expiry_interval, Duration::from_secs(1800));
        assert_eq!(cfg.grace_minutes, 30);
        assert_eq!(cfg.reset_at, NaiveTime::from_hms_opt(22, 0, 0).unwrap());
    }
}
