//! Cron-driven, single-flight execution of sync runs

use crate::error::{Result, SyncFailure, SyncerError};
use crate::sync::{SyncReport, Syncer};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Work the scheduler runs on every trigger
#[async_trait]
pub trait SyncJob: Send + Sync {
    async fn run(&self, cancel: &CancellationToken) -> std::result::Result<SyncReport, SyncFailure>;
}

#[async_trait]
impl SyncJob for Syncer {
    async fn run(&self, cancel: &CancellationToken) -> std::result::Result<SyncReport, SyncFailure> {
        self.sync_all(cancel).await
    }
}

/// Parse a cron expression. Five-field expressions get an implied `0` seconds field.
pub fn parse_schedule(expression: &str) -> Result<Schedule> {
    let expression = expression.trim();
    let normalized = match expression.split_whitespace().count() {
        5 => format!("0 {}", expression),
        6 | 7 => expression.to_string(),
        fields => {
            return Err(SyncerError::Config(format!(
                "invalid schedule {:?}: expected 5 to 7 fields, found {}",
                expression, fields
            )));
        }
    };
    Schedule::from_str(&normalized)
        .map_err(|e| SyncerError::Config(format!("invalid schedule {:?}: {}", expression, e)))
}

struct Inner {
    expression: String,
    schedule: Schedule,
    job: Arc<dyn SyncJob>,
    run_lock: Arc<tokio::sync::Mutex<()>>,
    shutdown: CancellationToken,
    abort: CancellationToken,
}

impl Inner {
    /// Claim the run slot, or log and drop the trigger
    fn try_begin(&self, trigger: &str) -> Option<OwnedMutexGuard<()>> {
        if self.shutdown.is_cancelled() {
            debug!(trigger, "scheduler stopped, ignoring trigger");
            return None;
        }
        match self.run_lock.clone().try_lock_owned() {
            Ok(guard) => Some(guard),
            Err(_) => {
                warn!(trigger, "sync already in progress, dropping trigger");
                None
            }
        }
    }

    async fn execute(self: Arc<Self>, _guard: OwnedMutexGuard<()>, trigger: &'static str) {
        let started = Instant::now();
        info!(trigger, "sync run started");
        match self.job.run(&self.abort).await {
            Ok(report) => info!(
                trigger,
                synced = report.synced(),
                skipped = report.skipped(),
                failed = report.failed(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "sync run completed"
            ),
            Err(failure) => error!(
                trigger,
                error = %failure.error,
                synced = failure.report.synced(),
                skipped = failure.report.skipped(),
                failed = failure.report.failed(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "sync run failed"
            ),
        }
    }

    fn spawn_run(self: &Arc<Self>, trigger: &'static str) -> bool {
        match self.try_begin(trigger) {
            Some(guard) => {
                tokio::spawn(self.clone().execute(guard, trigger));
                true
            }
            None => false,
        }
    }

    async fn run_loop(self: Arc<Self>) {
        self.spawn_run("startup");
        loop {
            let Some(next) = self.schedule.upcoming(Utc).next() else {
                warn!(schedule = %self.expression, "schedule has no upcoming fire times");
                break;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or_default();
            debug!(next = %next, "waiting for next scheduled run");

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {
                    self.spawn_run("schedule");
                }
            }
        }
    }
}

/// Runs a [`SyncJob`] at startup and on every cron fire time (UTC).
///
/// At most one run is in flight; triggers that arrive meanwhile are dropped.
pub struct Scheduler {
    inner: Arc<Inner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(expression: &str, job: Arc<dyn SyncJob>) -> Result<Self> {
        let schedule = parse_schedule(expression)?;
        Ok(Self {
            inner: Arc::new(Inner {
                expression: expression.trim().to_string(),
                schedule,
                job,
                run_lock: Arc::new(tokio::sync::Mutex::new(())),
                shutdown: CancellationToken::new(),
                abort: CancellationToken::new(),
            }),
            handle: Mutex::new(None),
        })
    }

    /// Start the schedule loop; the first run begins immediately
    pub fn start(&self) {
        let Ok(mut handle) = self.handle.lock() else {
            return;
        };
        if handle.is_some() {
            warn!("scheduler already started");
            return;
        }
        info!(schedule = %self.inner.expression, next = ?self.next_fire(), "scheduler started");
        *handle = Some(tokio::spawn(self.inner.clone().run_loop()));
    }

    /// Run now unless a run is already in progress. Returns whether a run started.
    pub fn trigger(&self) -> bool {
        self.inner.spawn_run("manual")
    }

    pub fn is_running(&self) -> bool {
        self.inner.run_lock.try_lock().is_err()
    }

    /// Stop accepting triggers and wait for the in-flight run to finish
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();
        let handle = self.handle.lock().ok().and_then(|mut handle| handle.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "scheduler loop terminated abnormally");
            }
        }
        let _idle = self.inner.run_lock.lock().await;
        info!("scheduler stopped");
    }

    /// Cancel the in-flight run (and any later one)
    pub fn abort(&self) {
        warn!("aborting in-flight sync run");
        self.inner.abort.cancel();
    }

    pub fn next_fire(&self) -> Option<DateTime<Utc>> {
        self.inner.schedule.upcoming(Utc).next()
    }

    pub fn expression(&self) -> &str {
        &self.inner.expression
    }
}
