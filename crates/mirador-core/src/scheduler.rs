//! Cycle scheduling: the run gate, single-cycle exclusion, and the periodic timer.
//!
//! Scheduler state is a plain value behind a shared mutex, owned outside the
//! engine's configuration: a phase (`Idle` / `Running`) plus the timestamps
//! and results the gate and status endpoint need.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ScheduleConfig;
use crate::error::AppError;
use crate::models::RecordFilter;
use crate::sync::{CycleStats, CycleStatus};
use crate::traits::RecordStore;

/// Whether a cycle is in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Idle,
    Running,
}

/// Outcome of the run gate.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum GateDecision {
    Run,
    Disabled,
    /// Enough active records were fetched within the recent window.
    RecentData { fresh_percent: f64 },
    /// The last successful cycle was too recent.
    TooSoon { hours_remaining: f64 },
}

impl GateDecision {
    pub fn should_run(&self) -> bool {
        matches!(self, GateDecision::Run)
    }
}

/// Freshness of the active record set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Coverage {
    pub active: u64,
    pub fresh: u64,
}

impl Coverage {
    pub fn fraction(&self) -> Option<f64> {
        if self.active == 0 {
            None
        } else {
            Some(self.fresh as f64 / self.active as f64)
        }
    }
}

/// Decides whether a scheduled cycle should run.
///
/// Checks, in order: disabled, recent-data coverage, minimum interval since
/// the last successful cycle. Either of the last two can skip a cycle on
/// its own. `coverage` is only consulted when `skip_if_recent` is on.
pub fn evaluate_gate(
    config: &ScheduleConfig,
    last_success_at: Option<DateTime<Utc>>,
    coverage: Option<Coverage>,
    now: DateTime<Utc>,
) -> GateDecision {
    if !config.enabled {
        return GateDecision::Disabled;
    }

    if config.skip_if_recent {
        if let Some(fraction) = coverage.and_then(|c| c.fraction()) {
            if fraction >= config.recent_threshold {
                return GateDecision::RecentData {
                    fresh_percent: (fraction * 1000.0).round() / 10.0,
                };
            }
        }
    }

    if let Some(last) = last_success_at {
        let elapsed = now - last;
        let min_interval = config.min_interval();
        if elapsed < min_interval {
            let remaining = (min_interval - elapsed).num_seconds() as f64 / 3600.0;
            return GateDecision::TooSoon {
                hours_remaining: (remaining * 10.0).round() / 10.0,
            };
        }
    }

    GateDecision::Run
}

/// Counts active records and those fetched within the recent window.
pub async fn measure_coverage<S: RecordStore>(
    store: &S,
    config: &ScheduleConfig,
    now: DateTime<Utc>,
) -> Result<Coverage, AppError> {
    let active = store.count_where(&RecordFilter::active()).await?;
    let fresh = store
        .count_where(&RecordFilter::active().fetched_since(now - config.recent_window()))
        .await?;
    Ok(Coverage { active, fresh })
}

/// Full gate evaluation against the store.
pub async fn should_run<S: RecordStore>(
    store: &S,
    config: &ScheduleConfig,
    last_success_at: Option<DateTime<Utc>>,
) -> Result<GateDecision, AppError> {
    let now = Utc::now();
    let coverage = if config.enabled && config.skip_if_recent {
        Some(measure_coverage(store, config, now).await?)
    } else {
        None
    };
    Ok(evaluate_gate(config, last_success_at, coverage, now))
}

/// Mutable scheduler state.
#[derive(Debug, Clone, Default)]
pub struct SchedulerState {
    pub phase: Phase,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_cycle: Option<CycleStats>,
    pub last_error: Option<String>,
    pub last_gate: Option<GateDecision>,
    cycle_cancel: Option<CancellationToken>,
}

/// Shared handle to the scheduler state.
#[derive(Debug, Clone, Default)]
pub struct SchedulerHandle {
    state: Arc<Mutex<SchedulerState>>,
}

impl SchedulerHandle {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> SchedulerState {
        self.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.lock().phase == Phase::Running
    }

    pub fn last_success_at(&self) -> Option<DateTime<Utc>> {
        self.lock().last_success_at
    }

    pub fn record_gate(&self, decision: GateDecision) {
        self.lock().last_gate = Some(decision);
    }

    /// Moves `Idle → Running`. Returns `None` if a cycle is already running.
    pub fn try_begin(&self) -> Option<CycleGuard> {
        let mut state = self.lock();
        if state.phase == Phase::Running {
            return None;
        }
        let cancel = CancellationToken::new();
        state.phase = Phase::Running;
        state.cycle_cancel = Some(cancel.clone());
        Some(CycleGuard {
            handle: self.clone(),
            cancel,
        })
    }

    /// Asks the in-flight cycle, if any, to stop at its next checkpoint.
    pub fn cancel_current(&self) -> bool {
        match &self.lock().cycle_cancel {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

/// Proof of holding the single `Running` slot. Dropping it returns to `Idle`.
#[derive(Debug)]
pub struct CycleGuard {
    handle: SchedulerHandle,
    cancel: CancellationToken,
}

impl CycleGuard {
    /// Cancellation token scoped to this cycle.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Records a finished cycle. Only a completed cycle counts as a success
    /// for the minimum-interval gate.
    pub fn finished(&self, stats: &CycleStats) {
        let mut state = self.handle.lock();
        if stats.status == CycleStatus::Completed {
            state.last_success_at = Some(stats.finished_at.unwrap_or(stats.started_at));
            state.last_error = None;
        }
        state.last_cycle = Some(stats.clone());
    }

    pub fn failed(&self, error: &AppError) {
        self.handle.lock().last_error = Some(error.to_string());
    }
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        let mut state = self.handle.lock();
        state.phase = Phase::Idle;
        state.cycle_cancel = None;
    }
}

/// A periodic tick task that can be stopped and restarted.
pub struct PeriodicTimer {
    period: Duration,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl PeriodicTimer {
    /// Spawns a task calling `on_tick` every `period`.
    ///
    /// With `fire_immediately` the first tick happens right away. `on_tick`
    /// should return quickly; long work belongs in its own task so that
    /// stopping the timer never interrupts it.
    pub fn spawn<F, Fut>(period: Duration, fire_immediately: bool, on_tick: F) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let start = if fire_immediately {
            Instant::now()
        } else {
            Instant::now() + period
        };

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(start, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(period_secs = period.as_secs(), "Sync timer started");

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Sync timer stopped");
                        break;
                    }
                    _ = ticker.tick() => on_tick().await,
                }
            }
        });

        Self {
            period,
            shutdown,
            handle,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn stop(self) {
        self.shutdown.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for PeriodicTimer {
    fn drop(&mut self) {
        if !self.shutdown.is_cancelled() {
            warn!("Sync timer dropped without stop, shutting it down");
            self.shutdown.cancel();
        }
    }
}
