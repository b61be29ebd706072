//! Sync engine: orchestrates cycles, the staleness sweep, and cleanup.
//!
//! # Lifecycle
//!
//! ```text
//! start() ──▶ timer tick ──▶ gate ──▶ run_cycle ──▶ CycleStats
//!                               │
//!                               └── skip (disabled / recent data / too soon)
//!
//! trigger_manual_sync() ─────────────▶ run_cycle       (bypasses the gate)
//! ```
//!
//! A cycle is: walk every list page, reconcile ids batch by batch, then flip
//! `upstream_present` off for stored records the walk did not see. The sweep
//! is skipped when the walk was incomplete or the cycle was cancelled.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigUpdate, EngineConfig};
use crate::error::AppError;
use crate::models::{LifecycleState, RecordFilter, RecordPatch};
use crate::reconciler::Reconciler;
use crate::scheduler::{
    should_run, CycleGuard, GateDecision, PeriodicTimer, SchedulerHandle,
};
use crate::sync::{CleanupReport, CycleStats, CycleStatus, SyncOutcome};
use crate::traits::{RecordStore, UpstreamClient, UpstreamClientFactory};
use crate::walker::PaginationWalker;

/// Snapshot returned by [`SyncEngine::get_status`].
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub running: bool,
    pub timer_active: bool,
    pub config: EngineConfig,
    pub last_cycle: Option<CycleStats>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_gate: Option<GateDecision>,
}

/// Handle to the sync engine. Cheap to clone; clones share one engine.
pub struct SyncEngine<S, F> {
    inner: Arc<Inner<S, F>>,
}

struct Inner<S, F> {
    store: S,
    factory: F,
    config: RwLock<Arc<EngineConfig>>,
    scheduler: SchedulerHandle,
    timer: Mutex<Option<PeriodicTimer>>,
}

impl<S, F> Clone for SyncEngine<S, F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S, F> SyncEngine<S, F>
where
    S: RecordStore + 'static,
    F: UpstreamClientFactory + 'static,
    F::Client: 'static,
{
    pub fn new(store: S, factory: F, config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                factory,
                config: RwLock::new(Arc::new(config)),
                scheduler: SchedulerHandle::new(),
                timer: Mutex::new(None),
            }),
        }
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    /// Current configuration snapshot. A cycle keeps the snapshot it started with.
    pub fn config(&self) -> Arc<EngineConfig> {
        self.inner
            .config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn timer(&self) -> MutexGuard<'_, Option<PeriodicTimer>> {
        self.inner.timer.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Starts the periodic timer. Returns false if it was already started.
    ///
    /// Each tick runs a gated cycle in its own task, so stopping or
    /// rescheduling the timer never interrupts a cycle in flight.
    pub fn start(&self) -> bool {
        let mut timer = self.timer();
        if timer.is_some() {
            warn!("Sync engine already started");
            return false;
        }
        let config = self.config();
        *timer = Some(self.spawn_timer(
            config.schedule.interval(),
            config.schedule.run_on_start,
        ));
        info!(
            enabled = config.schedule.enabled,
            interval_secs = config.schedule.interval_secs,
            "Sync engine started"
        );
        true
    }

    fn spawn_timer(&self, period: Duration, fire_immediately: bool) -> PeriodicTimer {
        let engine = self.clone();
        PeriodicTimer::spawn(period, fire_immediately, move || {
            let engine = engine.clone();
            async move {
                tokio::spawn(async move {
                    if let Err(e) = engine.run_scheduled().await {
                        error!(error = %e, "Scheduled sync failed");
                    }
                });
            }
        })
    }

    /// Stops the timer and asks the in-flight cycle, if any, to stop at its
    /// next checkpoint (between pages, batches, or retry attempts).
    pub fn stop(&self) {
        if let Some(timer) = self.timer().take() {
            timer.stop();
        }
        if self.inner.scheduler.cancel_current() {
            info!("Cancellation requested for running sync cycle");
        }
        info!("Sync engine stopped");
    }

    /// Runs a cycle now, bypassing the gate.
    ///
    /// # Errors
    ///
    /// `AppError::CycleInProgress` if a cycle is already running, plus any
    /// cycle-level failure (configuration, first page unavailable, store).
    pub async fn trigger_manual_sync(&self) -> Result<CycleStats, AppError> {
        let Some(guard) = self.inner.scheduler.try_begin() else {
            warn!("Manual sync requested while a cycle is running");
            return Err(AppError::CycleInProgress);
        };
        info!("Manual sync triggered");
        self.execute(guard).await
    }

    /// Evaluates the gate against the store and records the decision.
    pub async fn check_gate(&self) -> Result<GateDecision, AppError> {
        let config = self.config();
        let decision = should_run(
            &self.inner.store,
            &config.schedule,
            self.inner.scheduler.last_success_at(),
        )
        .await?;
        self.inner.scheduler.record_gate(decision.clone());
        Ok(decision)
    }

    /// Gated cycle, as run by the timer. `Ok(None)` means the cycle was skipped.
    pub async fn run_scheduled(&self) -> Result<Option<CycleStats>, AppError> {
        if self.inner.scheduler.is_running() {
            warn!("Sync cycle already running, ignoring tick");
            return Ok(None);
        }

        let decision = self.check_gate().await?;
        match &decision {
            GateDecision::Run => {}
            GateDecision::Disabled => {
                info!("Scheduled sync disabled, skipping");
                return Ok(None);
            }
            GateDecision::RecentData { fresh_percent } => {
                info!(fresh_percent, "Recent data covers the active set, skipping");
                return Ok(None);
            }
            GateDecision::TooSoon { hours_remaining } => {
                info!(hours_remaining, "Minimum interval not reached, skipping");
                return Ok(None);
            }
        }

        let Some(guard) = self.inner.scheduler.try_begin() else {
            warn!("Sync cycle already running, ignoring tick");
            return Ok(None);
        };
        self.execute(guard).await.map(Some)
    }

    async fn execute(&self, guard: CycleGuard) -> Result<CycleStats, AppError> {
        let config = self.config();
        match self.run_cycle(&config, guard.cancel_token()).await {
            Ok(stats) => {
                guard.finished(&stats);
                Ok(stats)
            }
            Err(e) => {
                error!(error = %e, "Sync cycle failed");
                guard.failed(&e);
                Err(e)
            }
        }
    }

    async fn run_cycle(
        &self,
        config: &EngineConfig,
        cancel: &CancellationToken,
    ) -> Result<CycleStats, AppError> {
        config.upstream.validate()?;
        let client = self.inner.factory.create(&config.upstream, &config.http)?;
        let mut stats = CycleStats::new(Utc::now());
        info!("Sync cycle started");

        let collected = PaginationWalker::new(&client, &config.sync, cancel)
            .collect_all_ids()
            .await?;

        let reconciler = Reconciler::new(
            &self.inner.store,
            &client,
            config.sync.cache_ttl(),
            &config.signals,
            cancel,
        );
        let batch_size = config.sync.batch_size.max(1);
        let concurrency = config.sync.batch_concurrency.max(1);
        let batch_count = collected.ids.len().div_ceil(batch_size);

        for (index, batch) in collected.ids.chunks(batch_size).enumerate() {
            if cancel.is_cancelled() {
                stats.status = CycleStatus::Cancelled;
                break;
            }

            // Ids are deduplicated, so no two in-flight reconciles share a key.
            let pending: Vec<_> = batch
                .iter()
                .map(|&id| reconcile_paced(&reconciler, id, config.sync.item_delay(), cancel))
                .collect();
            let outcomes: Vec<SyncOutcome> = stream::iter(pending)
                .buffer_unordered(concurrency)
                .collect()
                .await;
            for outcome in outcomes {
                stats.record(outcome);
            }
            debug!(
                batch = index + 1,
                batches = batch_count,
                processed = stats.processed,
                "Batch reconciled"
            );

            if index + 1 < batch_count {
                pause(config.sync.delay_between_requests(), cancel).await;
            }
        }

        if stats.status == CycleStatus::Completed && !collected.complete {
            stats.status = if cancel.is_cancelled() {
                CycleStatus::Cancelled
            } else {
                CycleStatus::Partial
            };
        }

        if stats.status == CycleStatus::Completed {
            stats.marked_inactive = self.sweep(&collected.ids).await?;
        } else {
            warn!(status = ?stats.status, "Skipping staleness sweep on incomplete cycle");
        }

        stats.finish(Utc::now());
        info!(
            processed = stats.processed,
            successful = stats.successful(),
            created = stats.new_records,
            updated = stats.updated_records,
            skipped = stats.skipped_duplicates,
            reactivated = stats.reactivated,
            not_found = stats.not_found,
            marked_inactive = stats.marked_inactive,
            errors = stats.errors,
            duration_ms = ?stats.duration_ms,
            "Sync cycle finished"
        );
        Ok(stats)
    }

    /// Flips `upstream_present` off for present records missing from `seen_ids`.
    async fn sweep(&self, seen_ids: &[i64]) -> Result<u64, AppError> {
        let seen: HashSet<i64> = seen_ids.iter().copied().collect();
        let present = self
            .inner
            .store
            .find_where(&RecordFilter::new().upstream_present(true))
            .await?;
        let missing: Vec<i64> = present
            .iter()
            .map(|r| r.external_id)
            .filter(|id| !seen.contains(id))
            .collect();

        if missing.is_empty() {
            return Ok(0);
        }
        debug!(count = missing.len(), "Marking listings absent upstream");
        self.inner
            .store
            .update_where(
                &RecordFilter::new().upstream_present(true).ids(missing),
                &RecordPatch::mark_absent(Utc::now()),
            )
            .await
    }

    /// Flags long-expired records for review and hard-deletes disabled
    /// records that have been absent upstream past the grace period.
    pub async fn cleanup(&self) -> Result<CleanupReport, AppError> {
        let config = self.config();
        let now = Utc::now();

        let expired_marked = self
            .inner
            .store
            .update_where(
                &RecordFilter::new()
                    .review_pending(false)
                    .expired_before(now - config.cleanup.expired_grace()),
                &RecordPatch::flag_for_review(),
            )
            .await?;

        let hard_deleted = self
            .inner
            .store
            .delete_where(
                &RecordFilter::new()
                    .upstream_present(false)
                    .lifecycle(LifecycleState::Disabled)
                    .absent_before(now - config.cleanup.hard_delete_grace()),
            )
            .await?;

        info!(expired_marked, hard_deleted, "Cleanup finished");
        Ok(CleanupReport {
            expired_marked,
            hard_deleted,
        })
    }

    pub fn get_status(&self) -> EngineStatus {
        let state = self.inner.scheduler.snapshot();
        EngineStatus {
            running: self.inner.scheduler.is_running(),
            timer_active: self.timer().as_ref().is_some_and(|t| !t.is_finished()),
            config: self.config().redacted(),
            last_cycle: state.last_cycle,
            last_success_at: state.last_success_at,
            last_error: state.last_error,
            last_gate: state.last_gate,
        }
    }

    /// Applies a partial configuration update.
    ///
    /// A changed interval reschedules the next tick of a started timer; a
    /// cycle already running keeps its configuration snapshot.
    pub fn update_config(&self, update: &ConfigUpdate) {
        let interval_changed = {
            let mut guard = self.inner.config.write().unwrap_or_else(|e| e.into_inner());
            let mut next = EngineConfig::clone(&guard);
            let changed = next.apply(update);
            *guard = Arc::new(next);
            changed
        };
        info!(?update, "Configuration updated");

        if interval_changed {
            let mut timer = self.timer();
            if let Some(old) = timer.take() {
                old.stop();
                let period = self.config().schedule.interval();
                *timer = Some(self.spawn_timer(period, false));
                info!(interval_secs = period.as_secs(), "Sync timer rescheduled");
            }
        }
    }
}

async fn reconcile_paced<S: RecordStore, U: UpstreamClient>(
    reconciler: &Reconciler<'_, S, U>,
    external_id: i64,
    delay: Duration,
    cancel: &CancellationToken,
) -> SyncOutcome {
    let outcome = reconciler.process(external_id).await;
    pause(delay, cancel).await;
    outcome
}

async fn pause(delay: Duration, cancel: &CancellationToken) {
    if delay.is_zero() {
        return;
    }
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(delay) => {}
    }
}
